use std::sync::Arc;

use stream_relay::config::{Config, LogFormat};
use stream_relay::error;
use stream_relay::relay::{listener, ConnectionEvents, Registry};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    init_logging(config.log_format);
    info!(
        listen = %config.listen_addr,
        target = %config.target_addr,
        workers = config.worker_threads,
        queue_capacity = config.relay.queue_capacity,
        liveness_policy = ?config.relay.liveness_policy,
        "stream-relay starting"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config)) {
        error!(error = %e, "stream-relay exited with error");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> error::Result<()> {
    let registry = Registry::new(config.target_addr.clone(), config.relay.clone());
    let socket = TcpListener::bind(config.listen_addr).await?;

    // Shutdown signal channel.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let events: Arc<dyn ConnectionEvents> = registry.clone();
    let mut listener_handle = tokio::spawn(listener::run(
        socket,
        events,
        config.tcp_keepalive,
        shutdown_rx,
    ));

    let result = tokio::select! {
        signal = shutdown_signal() => {
            match signal {
                Ok(name) => info!(signal = name, "shutdown signal received, stopping listener"),
                Err(e) => error!(error = %e, "signal handlers unavailable, stopping listener"),
            }
            let _ = shutdown_tx.send(true);
            (&mut listener_handle).await
        }
        result = &mut listener_handle => result,
    };

    let freed = registry.free_all();
    info!(freed, "stream-relay stopped");

    result?
}

/// Resolve once SIGINT or SIGTERM arrives, naming the signal.
async fn shutdown_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        Ok(tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        })
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("ctrl-c")
    }
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Json => builder.json().flatten_event(true).with_current_span(false).init(),
        LogFormat::Pretty => builder.compact().with_target(false).init(),
    }
}
