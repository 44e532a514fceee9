//! Sandbox host for remote DISCON controller calls.
//!
//! Runs inside the per-session sandbox: accepts one websocket upgrade per
//! TCP connection, loads the requested controller library into a
//! connection-unique copy, and serves framed ABI calls and file staging
//! until the peer goes away.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod connection;
mod loader;

#[derive(Parser, Debug)]
#[command(name = "vane-server")]
#[command(about = "Sandbox host serving a native controller library over websocket")]
struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Debug level: 0=disabled, 1=basic info, 2=verbose with frames
    #[arg(long, default_value_t = 0)]
    debug: i32,
}

#[derive(Clone)]
pub struct AppState {
    pub debug_level: i32,
    pub conn_counter: Arc<AtomicU64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(
            if args.debug > 0 {
                tracing::Level::DEBUG.into()
            } else {
                tracing::Level::INFO.into()
            },
        ))
        .init();

    info!("vane-server v{}", env!("CARGO_PKG_VERSION"));

    let state = AppState {
        debug_level: args.debug,
        conn_counter: Arc::new(AtomicU64::new(0)),
    };

    let app = Router::new()
        .route("/ws", get(connection::ws_handler))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    // The manager's readiness probe greps sandbox logs for this line.
    info!("vane-server listening on {addr}");

    axum::serve(listener, app)
        .await
        .context("server terminated")?;
    Ok(())
}
