use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Environment variable naming an optional JSON file with base settings.
pub const CONFIG_FILE_ENV: &str = "RELAY_CONFIG";

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub target_addr: String,
    pub worker_threads: usize,
    pub tcp_keepalive: Option<Duration>,
    pub log_format: LogFormat,
    pub relay: RelaySettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// What `deliver_from_client` does when the client-to-target queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FullQueuePolicy {
    /// Discard the packet and free the session, so the target never sees a
    /// stream with a hole in it.
    Drop,
    /// Wait for room in `push_timeout` slices while the session is live. The
    /// inbound reader stalls meanwhile, which pushes back on the client.
    Block,
}

/// Which traffic counts as proof of life once the warm-up has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LivenessPolicy {
    /// Only packets from the target count. A session that never hears from
    /// the target is freed as soon as the warm-up ends.
    TargetFirst,
    /// Packets in either direction count. Silence is measured from the end
    /// of the warm-up when nothing was ever seen.
    AnyTraffic,
}

/// Per-session tunables shared by every relay session.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub queue_capacity: usize,
    pub full_queue_policy: FullQueuePolicy,
    pub push_timeout: Duration,
    pub pop_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_warmup: Duration,
    pub liveness_timeout: Duration,
    pub liveness_policy: LivenessPolicy,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            queue_capacity: 200,
            full_queue_policy: FullQueuePolicy::Block,
            push_timeout: Duration::from_millis(200),
            pop_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(200),
            heartbeat_warmup: Duration::from_secs(2),
            liveness_timeout: Duration::from_secs(2),
            liveness_policy: LivenessPolicy::AnyTraffic,
            connect_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_millis(1500),
        }
    }
}

/// Shape of the optional JSON config file. Every field may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    listen_addr: Option<SocketAddr>,
    target_addr: Option<String>,
    worker_threads: Option<usize>,
    tcp_keepalive_secs: Option<u64>,
    log_format: Option<LogFormat>,
    queue_capacity: Option<usize>,
    full_queue_policy: Option<FullQueuePolicy>,
    queue_push_timeout_ms: Option<u64>,
    queue_pop_timeout_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    heartbeat_warmup_ms: Option<u64>,
    liveness_timeout_ms: Option<u64>,
    liveness_policy: Option<LivenessPolicy>,
    connect_timeout_ms: Option<u64>,
    io_timeout_ms: Option<u64>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config file '{}': {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_source(|key| env::var(key).ok())
    }

    /// Build the config from defaults, the optional JSON file and then the
    /// variables yielded by `lookup`, later layers overriding earlier ones.
    pub fn from_source<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = match lookup(CONFIG_FILE_ENV) {
            Some(path) => FileConfig::load(Path::new(&path))?,
            None => FileConfig::default(),
        };
        let defaults = RelaySettings::default();

        let listen_addr = setting(
            &lookup,
            "LISTEN_ADDR",
            file.listen_addr,
            SocketAddr::from(([0, 0, 0, 0], 7000)),
        )?;

        let target_addr = lookup("TARGET_ADDR")
            .or(file.target_addr)
            .ok_or_else(|| Error::Config("TARGET_ADDR is not set".into()))?;
        validate_target(&target_addr)?;

        let default_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let worker_threads = setting(&lookup, "WORKER_THREADS", file.worker_threads, default_workers)?;

        let keepalive_secs = setting(&lookup, "TCP_KEEPALIVE_SECS", file.tcp_keepalive_secs, 30)?;
        let tcp_keepalive = (keepalive_secs > 0).then(|| Duration::from_secs(keepalive_secs));

        let log_format = setting(&lookup, "LOG_FORMAT", file.log_format, LogFormat::Json)?;

        let relay = RelaySettings {
            queue_capacity: setting(&lookup, "QUEUE_CAPACITY", file.queue_capacity, defaults.queue_capacity)?,
            full_queue_policy: setting(
                &lookup,
                "FULL_QUEUE_POLICY",
                file.full_queue_policy,
                defaults.full_queue_policy,
            )?,
            push_timeout: millis(&lookup, "QUEUE_PUSH_TIMEOUT_MS", file.queue_push_timeout_ms, defaults.push_timeout)?,
            pop_timeout: millis(&lookup, "QUEUE_POP_TIMEOUT_MS", file.queue_pop_timeout_ms, defaults.pop_timeout)?,
            heartbeat_interval: millis(
                &lookup,
                "HEARTBEAT_INTERVAL_MS",
                file.heartbeat_interval_ms,
                defaults.heartbeat_interval,
            )?,
            heartbeat_warmup: millis(
                &lookup,
                "HEARTBEAT_WARMUP_MS",
                file.heartbeat_warmup_ms,
                defaults.heartbeat_warmup,
            )?,
            liveness_timeout: millis(
                &lookup,
                "LIVENESS_TIMEOUT_MS",
                file.liveness_timeout_ms,
                defaults.liveness_timeout,
            )?,
            liveness_policy: setting(&lookup, "LIVENESS_POLICY", file.liveness_policy, defaults.liveness_policy)?,
            connect_timeout: millis(&lookup, "CONNECT_TIMEOUT_MS", file.connect_timeout_ms, defaults.connect_timeout)?,
            io_timeout: millis(&lookup, "IO_TIMEOUT_MS", file.io_timeout_ms, defaults.io_timeout)?,
        };

        if worker_threads == 0 {
            return Err(Error::Config("WORKER_THREADS must be at least 1".into()));
        }
        relay.validate()?;

        Ok(Config {
            listen_addr,
            target_addr,
            worker_threads,
            tcp_keepalive,
            log_format,
            relay,
        })
    }
}

impl RelaySettings {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::Config("QUEUE_CAPACITY must be at least 1".into()));
        }

        let durations = [
            ("QUEUE_PUSH_TIMEOUT_MS", self.push_timeout),
            ("QUEUE_POP_TIMEOUT_MS", self.pop_timeout),
            ("HEARTBEAT_INTERVAL_MS", self.heartbeat_interval),
            ("HEARTBEAT_WARMUP_MS", self.heartbeat_warmup),
            ("LIVENESS_TIMEOUT_MS", self.liveness_timeout),
            ("CONNECT_TIMEOUT_MS", self.connect_timeout),
            ("IO_TIMEOUT_MS", self.io_timeout),
        ];
        for (key, value) in durations {
            if value.is_zero() {
                return Err(Error::Config(format!("{key} must be greater than zero")));
            }
        }
        Ok(())
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(format!("'{other}': must be 'json' or 'pretty'")),
        }
    }
}

impl FromStr for FullQueuePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "drop" => Ok(FullQueuePolicy::Drop),
            "block" => Ok(FullQueuePolicy::Block),
            other => Err(format!("'{other}': must be 'drop' or 'block'")),
        }
    }
}

impl FromStr for LivenessPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "target-first" => Ok(LivenessPolicy::TargetFirst),
            "any-traffic" => Ok(LivenessPolicy::AnyTraffic),
            other => Err(format!("'{other}': must be 'target-first' or 'any-traffic'")),
        }
    }
}

fn setting<F, T>(lookup: &F, key: &str, from_file: Option<T>, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid {key}: {e}"))),
        None => Ok(from_file.unwrap_or(default)),
    }
}

fn millis<F>(lookup: &F, key: &str, from_file: Option<u64>, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let ms = setting(lookup, key, from_file, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

fn validate_target(target: &str) -> Result<()> {
    let port = target
        .rsplit_once(':')
        .filter(|(host, _)| !host.is_empty())
        .and_then(|(_, port)| port.parse::<u16>().ok());

    match port {
        Some(p) if p != 0 => Ok(()),
        _ => Err(Error::Config(format!(
            "invalid TARGET_ADDR '{target}': expected host:port"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_target_is_set() {
        let config = Config::from_source(lookup_from(&[("TARGET_ADDR", "10.0.0.5:7001")])).unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:7000".parse().unwrap());
        assert_eq!(config.target_addr, "10.0.0.5:7001");
        assert_eq!(config.tcp_keepalive, Some(Duration::from_secs(30)));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.relay.queue_capacity, 200);
        assert_eq!(config.relay.heartbeat_interval, Duration::from_millis(200));
        assert_eq!(config.relay.heartbeat_warmup, Duration::from_secs(2));
        assert_eq!(config.relay.liveness_timeout, Duration::from_secs(2));
        assert_eq!(config.relay.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.relay.io_timeout, Duration::from_millis(1500));
        assert_eq!(config.relay.liveness_policy, LivenessPolicy::AnyTraffic);
        assert_eq!(config.relay.full_queue_policy, FullQueuePolicy::Block);
    }

    #[test]
    fn missing_target_is_rejected() {
        let err = Config::from_source(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("TARGET_ADDR")));
    }

    #[test]
    fn malformed_target_is_rejected() {
        for bad in ["localhost", ":7001", "host:notaport", "host:0"] {
            let result = Config::from_source(lookup_from(&[("TARGET_ADDR", bad)]));
            assert!(result.is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn env_values_are_parsed() {
        let config = Config::from_source(lookup_from(&[
            ("TARGET_ADDR", "backend.internal:9000"),
            ("LISTEN_ADDR", "127.0.0.1:7100"),
            ("WORKER_THREADS", "3"),
            ("QUEUE_CAPACITY", "16"),
            ("FULL_QUEUE_POLICY", "drop"),
            ("LIVENESS_POLICY", "target-first"),
            ("HEARTBEAT_WARMUP_MS", "750"),
            ("TCP_KEEPALIVE_SECS", "0"),
            ("LOG_FORMAT", "Pretty"),
        ]))
        .unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:7100".parse().unwrap());
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.tcp_keepalive, None);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.relay.queue_capacity, 16);
        assert_eq!(config.relay.full_queue_policy, FullQueuePolicy::Drop);
        assert_eq!(config.relay.liveness_policy, LivenessPolicy::TargetFirst);
        assert_eq!(config.relay.heartbeat_warmup, Duration::from_millis(750));
    }

    #[test]
    fn zero_values_are_rejected() {
        for key in ["QUEUE_CAPACITY", "WORKER_THREADS", "HEARTBEAT_INTERVAL_MS", "IO_TIMEOUT_MS"] {
            let result = Config::from_source(lookup_from(&[("TARGET_ADDR", "t:1"), (key, "0")]));
            assert!(result.is_err(), "{key}=0 should be rejected");
        }
    }

    #[test]
    fn unparsable_values_name_the_variable() {
        let err = Config::from_source(lookup_from(&[
            ("TARGET_ADDR", "t:1"),
            ("LIVENESS_POLICY", "sometimes"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("LIVENESS_POLICY")));
    }

    #[test]
    fn file_values_sit_under_env_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "target_addr": "from-file:7001",
                "queue_capacity": 64,
                "liveness_policy": "target-first",
                "heartbeat_interval_ms": 100
            }}"#
        )
        .unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let config = Config::from_source(lookup_from(&[
            (CONFIG_FILE_ENV, path.as_str()),
            ("QUEUE_CAPACITY", "32"),
        ]))
        .unwrap();

        assert_eq!(config.target_addr, "from-file:7001");
        assert_eq!(config.relay.queue_capacity, 32);
        assert_eq!(config.relay.liveness_policy, LivenessPolicy::TargetFirst);
        assert_eq!(config.relay.heartbeat_interval, Duration::from_millis(100));
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "target_addr": "t:1", "daemonize": true }}"#).unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let err = Config::from_source(lookup_from(&[(CONFIG_FILE_ENV, path.as_str())])).unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }
}
