//! Session manager for remote DISCON controllers.
//!
//! Terminates client websocket sessions, starts one sandbox per session,
//! and proxies frames both ways until a side closes, the session idles out,
//! or the manager shuts down.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::timeout;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod discovery;
mod docker;
mod manager;
mod registry;
mod session;

use config::{Config, DiscoveryMode};
use manager::Manager;

/// Budget for draining in-flight connections after the shutdown signal.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[command(name = "vane-manager")]
#[command(about = "Session manager proxying DISCON controller calls into per-session sandboxes")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(Path::new(&args.config))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(
            match config.server.debug_level {
                0 => tracing::Level::INFO.into(),
                _ => tracing::Level::DEBUG.into(),
            },
        ))
        .init();

    info!("vane-manager v{}", env!("CARGO_PKG_VERSION"));
    info!(
        metrics = config.metrics.enabled,
        metrics_path = %config.metrics.path,
        health_interval = config.health.interval,
        auth = config.auth.enabled,
        "manager configured"
    );

    let manager = Manager::new(config).await?;

    match manager.config.discovery.mode {
        DiscoveryMode::Startup | DiscoveryMode::Periodic => {
            if let Err(err) = manager.run_discovery().await {
                error!(%err, "error running controller discovery");
            }
        }
        DiscoveryMode::Manual => {}
    }
    if manager.config.discovery.mode == DiscoveryMode::Periodic
        && manager.config.discovery.interval_minutes > 0
    {
        manager.spawn_periodic_discovery();
    }
    manager.spawn_cleanup();

    let addr = format!(
        "{}:{}",
        manager.config.server.host, manager.config.server.port
    );
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("vane-manager listening on {addr}");

    let app = manager.router();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        })
        .await
    });

    wait_for_signal().await;
    info!("received shutdown signal, shutting down");

    let _ = shutdown_tx.send(());
    manager.shutdown().await;
    match timeout(SHUTDOWN_DRAIN, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => error!(%err, "server error during shutdown"),
        Ok(Err(err)) => error!(%err, "server task panicked"),
        Err(_) => warn!("drain deadline reached, forcing shutdown"),
    }

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
