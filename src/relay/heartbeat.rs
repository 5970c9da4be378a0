//! Per-session liveness monitor.
//!
//! The socket layer does not report a peer that stops talking without
//! closing the connection, so every session runs a ticker that frees it once
//! the configured liveness policy is violated. The decision itself lives in
//! [`evaluate`], which is a pure function of a [`Probe`] snapshot.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::{LivenessPolicy, RelaySettings};
use crate::relay::session::RelaySession;

/// Point-in-time view of a session, as seen by the heartbeat.
#[derive(Debug, Clone, Copy)]
pub struct Probe {
    /// Time since the session was created.
    pub alive_for: Duration,
    pub registered: bool,
    pub target_connected: bool,
    pub since_target_packet: Option<Duration>,
    pub since_client_packet: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    WarmingUp,
    Alive,
    Expired(Expiry),
}

/// Why the heartbeat gave up on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Deregistered,
    TargetDisconnected,
    NoTargetPacket,
    TargetSilent(Duration),
    Idle(Duration),
}

impl fmt::Display for Expiry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expiry::Deregistered => write!(f, "client connection closed"),
            Expiry::TargetDisconnected => write!(f, "target connection closed"),
            Expiry::NoTargetPacket => write!(f, "no packet received from target"),
            Expiry::TargetSilent(d) => write!(f, "last target packet {:.2}s ago", d.as_secs_f64()),
            Expiry::Idle(d) => write!(f, "no traffic for {:.2}s", d.as_secs_f64()),
        }
    }
}

/// Decide whether a session is still alive.
///
/// Nothing is checked during the warm-up. Afterwards the checks run in a
/// fixed order: registration, target connection, then the liveness policy.
pub fn evaluate(probe: &Probe, settings: &RelaySettings) -> Verdict {
    if probe.alive_for < settings.heartbeat_warmup {
        return Verdict::WarmingUp;
    }
    if !probe.registered {
        return Verdict::Expired(Expiry::Deregistered);
    }
    if !probe.target_connected {
        return Verdict::Expired(Expiry::TargetDisconnected);
    }

    let timeout = settings.liveness_timeout;
    match settings.liveness_policy {
        LivenessPolicy::TargetFirst => match probe.since_target_packet {
            None => Verdict::Expired(Expiry::NoTargetPacket),
            Some(silent) if silent >= timeout => Verdict::Expired(Expiry::TargetSilent(silent)),
            Some(_) => Verdict::Alive,
        },
        LivenessPolicy::AnyTraffic => {
            let latest = match (probe.since_target_packet, probe.since_client_packet) {
                (Some(target), Some(client)) => Some(target.min(client)),
                (target, client) => target.or(client),
            };
            let silent = latest.unwrap_or_else(|| probe.alive_for.saturating_sub(settings.heartbeat_warmup));
            if silent >= timeout {
                Verdict::Expired(Expiry::Idle(silent))
            } else {
                Verdict::Alive
            }
        }
    }
}

/// Tick until the session stops or the policy frees it.
pub(crate) async fn monitor(session: Arc<RelaySession>) {
    let settings = session.settings().clone();
    let shutdown = session.shutdown_token();
    let mut ticker = interval(settings.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(conn = session.id(), "heartbeat started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !session.is_active() {
            break;
        }

        if let Verdict::Expired(reason) = evaluate(&session.probe(), &settings) {
            info!(conn = session.id(), reason = %reason, "heartbeat freeing session");
            session.free();
            break;
        }
    }

    debug!(conn = session.id(), "heartbeat stopped");
}
