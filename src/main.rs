//! echod - TCP echo daemon.

use echod::config::Config;
use echod::error::ManagerError;
use echod::server::{SessionManager, TcpAcceptor};
use echod::session::EchoSessionFactory;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "failed to load config");
        e
    })?;

    info!(addr = %config.listen.address, "starting echod");

    let manager = SessionManager::new(
        config,
        Arc::new(EchoSessionFactory),
        Arc::new(TcpAcceptor::new()),
    );
    manager.start().await?;

    tokio::select! {
        () = shutdown_signal() => info!("shutdown signal received"),
        result = manager.wait() => match result {
            Ok(()) => info!("manager stopped"),
            Err(e) => error!(error = %e, "manager failed"),
        },
    }

    match manager.stop().await {
        Ok(()) => {}
        // Already fully stopped by the time we asked.
        Err(ManagerError::InvalidState) => {}
        Err(e) => error!(error = %e, "graceful stop failed"),
    }

    let stats = manager.stats();
    info!(
        accepted = stats.total_accepted,
        stopped = stats.total_stopped,
        accept_errors = stats.accept_errors,
        "echod exit"
    );
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
