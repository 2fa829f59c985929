mod backend;
mod classifier;
mod config;
mod metrics;
mod pool;
mod protocol;
mod router;
mod session;
#[cfg(test)]
mod testutil;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use config::Config;
use pool::ConnectionPool;
use session::Session;

/// Source of unique session ids, shared by all accept-loop iterations
static CONNECTION_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Candidate configuration files, tried in order
const CONFIG_PATHS: &[&str] = &["config/hermes.toml", "hermes.toml"];

/// Grace period for open sessions on shutdown
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = match Config::load_first(CONFIG_PATHS)? {
        Some(config) => config,
        None => {
            info!("no configuration file found, using defaults");
            Config::default()
        }
    };
    let config = Arc::new(config);

    if config.servers.is_empty() {
        anyhow::bail!("no [[servers]] configured");
    }
    info!(
        primaries = config.servers.iter().filter(|s| s.is_primary()).count(),
        replicas = config.servers.iter().filter(|s| s.is_replica()).count(),
        "upstream servers configured"
    );

    let pool = Arc::new(ConnectionPool::new(config.pool.clone()));

    let addr = format!("{}:{}", config.server.listen_addr, config.server.listen_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "hermes MySQL proxy listening");

    let metrics_addr = format!(
        "{}:{}",
        config.server.listen_addr,
        config.server.listen_port + 1000
    );
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(&metrics_addr).await {
            error!(error = %e, "metrics exporter failed");
        }
    });

    let mut sessions: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown signal received");
                break;
            }

            // Reap finished sessions so the set never grows unbounded
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                log_session_exit(finished);
            }

            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                };

                let session_id = CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst);
                info!(session_id, peer = %peer_addr, "new connection");

                let session = Session::new(session_id, config.clone(), pool.clone());
                sessions.spawn(async move {
                    if let Err(e) = session.run(stream).await {
                        warn!(session_id, error = %e, "session ended with error");
                    }
                });
            }
        }
    }

    drain_sessions(sessions).await;
    info!("hermes proxy shutdown complete");
    Ok(())
}

/// Let open sessions finish, aborting whatever outlives the grace period
async fn drain_sessions(mut sessions: JoinSet<()>) {
    if sessions.is_empty() {
        return;
    }

    info!(
        active_sessions = sessions.len(),
        timeout_secs = GRACEFUL_SHUTDOWN_TIMEOUT.as_secs(),
        "draining active sessions"
    );

    let drain = async {
        while let Some(finished) = sessions.join_next().await {
            log_session_exit(finished);
        }
    };

    if tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, drain)
        .await
        .is_err()
    {
        warn!(
            remaining_sessions = sessions.len(),
            "grace period over, aborting remaining sessions"
        );
        sessions.abort_all();
        while sessions.join_next().await.is_some() {}
    }
}

fn log_session_exit(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if !e.is_cancelled() {
            error!(error = %e, "session task panicked");
        }
    }
}

/// Wait for SIGTERM or ctrl-c
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
