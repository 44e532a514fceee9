//! The manager: admission of client sessions, the session map, diagnostic
//! endpoints, idle eviction, and graceful teardown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::discovery;
use crate::docker::SandboxDriver;
use crate::registry::{ControllerDescriptor, Registry};
use crate::session::{self, Session};

pub struct Manager {
    pub config: Config,
    pub registry: Registry,
    pub driver: SandboxDriver,
    sessions: DashMap<String, Arc<Session>>,
    conn_counter: AtomicU64,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionParams {
    pub path: Option<String>,
    pub proc: Option<String>,
    pub controller: Option<String>,
    pub version: Option<String>,
}

impl Manager {
    pub async fn new(config: Config) -> Result<Arc<Manager>> {
        let registry = Registry::open(std::path::Path::new(&config.registry.path))
            .context("error opening controller registry")?;
        let driver = SandboxDriver::new(config.docker.clone()).await?;
        Ok(Arc::new(Manager {
            config,
            registry,
            driver,
            sessions: DashMap::new(),
            conn_counter: AtomicU64::new(0),
        }))
    }

    pub fn router(self: &Arc<Manager>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/containers", get(containers_handler))
            .route("/controllers", get(controllers_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn next_conn(&self) -> u64 {
        self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Idempotent session teardown: close both transports via the shared
    /// signal, destroy the sandbox, deregister.
    pub async fn close_session(&self, session: &Arc<Session>) {
        if session.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        session.close.cancel();
        self.sessions.remove(&session.id);
        if let Err(err) = self.driver.stop(&session.sandbox.id).await {
            warn!(conn = session.conn_no, %err, "error stopping sandbox");
        }
        let duration = OffsetDateTime::now_utc() - session.connected_at;
        info!(
            conn = session.conn_no,
            session = %session.id,
            remote = %session.remote_addr,
            duration_secs = duration.whole_seconds(),
            "session closed"
        );
    }

    /// Periodic sweep closing sessions idle for longer than the cleanup
    /// interval (the tick period doubles as the threshold).
    pub fn spawn_cleanup(self: &Arc<Manager>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(manager.config.docker.cleanup_timeout.max(1));
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stale: Vec<Arc<Session>> = manager
                    .sessions
                    .iter()
                    .filter(|entry| entry.value().idle_for() > period)
                    .map(|entry| entry.value().clone())
                    .collect();
                for session in stale {
                    info!(
                        conn = session.conn_no,
                        idle_secs = session.idle_for().as_secs(),
                        "evicting idle session"
                    );
                    manager.close_session(&session).await;
                }
            }
        })
    }

    pub fn spawn_periodic_discovery(self: &Arc<Manager>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let minutes = manager.config.discovery.interval_minutes.max(1);
            let mut ticker = tokio::time::interval(Duration::from_secs(minutes * 60));
            ticker.tick().await;
            info!(interval_minutes = minutes, "starting periodic controller discovery");
            loop {
                ticker.tick().await;
                if let Err(err) = manager.run_discovery().await {
                    error!(%err, "error running periodic controller discovery");
                }
            }
        })
    }

    /// Discovers controller images and feeds them through registry ingestion.
    pub async fn run_discovery(&self) -> Result<()> {
        let discovered = discovery::discover_controller_images(
            self.driver.docker(),
            &self.config.discovery.validation,
        )
        .await?;
        info!(count = discovered.len(), "found controller images");

        if !self.config.discovery.auto_register {
            return Ok(());
        }

        let batch: Vec<ControllerDescriptor> =
            discovered.into_iter().map(discovery::into_descriptor).collect();
        let stats = self
            .registry
            .ingest(batch, self.config.discovery.remove_missing)
            .context("error registering discovered controllers")?;

        info!(
            added = stats.added,
            updated = stats.updated,
            removed = stats.removed,
            unchanged = stats.unchanged,
            failed = stats.failed,
            "controller registration stats"
        );
        if stats.failed > 0 {
            warn!(ids = ?stats.failed_ids, "some controllers failed discovery validation");
        }
        Ok(())
    }

    /// Shutdown sweep: close every session, then destroy anything the driver
    /// still tracks. Best effort, never blocks shutdown.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        info!(count = sessions.len(), "closing active sessions");
        for session in sessions {
            self.close_session(&session).await;
        }
        self.driver.cleanup_all().await;
    }
}

/// Resolves the controller for a new session. Priority: explicit id, token
/// derived from the path-like parameter (last hyphen segment, then the full
/// value), explicit version, then the first registered controller.
pub fn select_controller(
    registry: &Registry,
    params: &SessionParams,
) -> Result<ControllerDescriptor, String> {
    if let Some(id) = nonempty(&params.controller) {
        return registry
            .get(id)
            .ok_or_else(|| format!("Controller not found: {id}"));
    }

    if let Some(path) = nonempty(&params.path) {
        let token = path.rsplit('-').next().unwrap_or(path);
        if let Some(controller) = registry.get(token) {
            return Ok(controller);
        }
        if let Some(controller) = registry.get(path) {
            return Ok(controller);
        }
    }

    if let Some(version) = nonempty(&params.version) {
        return registry
            .get_by_version(version)
            .ok_or_else(|| format!("Controller version not found: {version}"));
    }

    registry
        .first()
        .ok_or_else(|| "No controllers available".to_string())
}

fn nonempty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

async fn ws_handler(
    State(manager): State<Arc<Manager>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<SessionParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let conn = manager.next_conn();
    info!(
        conn,
        remote = %addr,
        controller = params.controller.as_deref().unwrap_or(""),
        path = params.path.as_deref().unwrap_or(""),
        proc = params.proc.as_deref().unwrap_or(""),
        version = params.version.as_deref().unwrap_or(""),
        "new session request"
    );

    let controller = match select_controller(&manager.registry, &params) {
        Ok(controller) => controller,
        Err(message) => {
            error!(conn, %message, "admission failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, message).into_response();
        }
    };

    // The proc parameter overrides the descriptor's symbol for this session
    // only; the path parameter never overrides the library path.
    let proc_name = params
        .proc
        .clone()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| controller.proc_name.clone());

    let session_id = Uuid::new_v4().to_string();
    info!(conn, session = %session_id, controller = %controller.id, image = %controller.image, "admitting session");

    let sandbox = match manager.driver.start(&controller, &session_id).await {
        Ok(sandbox) => sandbox,
        Err(err) => {
            error!(conn, %err, "error starting controller sandbox");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error starting controller sandbox: {err}"),
            )
                .into_response();
        }
    };

    let session = Arc::new(Session {
        id: session_id,
        conn_no: conn,
        remote_addr: addr.to_string(),
        connected_at: OffsetDateTime::now_utc(),
        last_activity: Mutex::new(Instant::now()),
        controller,
        proc_name,
        sandbox,
        close: CancellationToken::new(),
        torn_down: AtomicBool::new(false),
    });
    manager.sessions.insert(session.id.clone(), session.clone());

    let upgrade_manager = manager.clone();
    let upgrade_session = session.clone();
    ws.on_failed_upgrade(move |err| {
        error!(conn, %err, "websocket upgrade failed, tearing down sandbox");
        tokio::spawn(async move {
            upgrade_manager.close_session(&upgrade_session).await;
        });
    })
    .on_upgrade(move |socket| session::run(manager, session, socket))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn metrics_handler(State(manager): State<Arc<Manager>>) -> Json<serde_json::Value> {
    Json(json!({"active_sessions": manager.active_sessions()}))
}

async fn containers_handler(State(manager): State<Arc<Manager>>) -> String {
    let mut out = String::new();
    for sandbox in manager.driver.list().await {
        out.push_str(&format!(
            "Sandbox: {} (ID: {:.12}, Image: {}, Session: {}, Created: {})\n",
            sandbox.name, sandbox.id, sandbox.image, sandbox.session_id, sandbox.created_at
        ));
    }
    out
}

async fn controllers_handler(State(manager): State<Arc<Manager>>) -> String {
    let mut out = String::new();
    for controller in manager.registry.list() {
        out.push_str(&format!(
            "Controller: {} (Version: {}, Image: {})\n",
            controller.name, controller.version, controller.image
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PortPair, Registry};

    fn descriptor(id: &str, version: &str) -> ControllerDescriptor {
        let now = OffsetDateTime::now_utc();
        ControllerDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            version: version.to_string(),
            image: format!("controllers/{id}:{version}"),
            description: String::new(),
            library_path: format!("/controllers/{id}.so"),
            proc_name: "discon".to_string(),
            ports: PortPair::default(),
            created_at: now,
            updated_at: now,
            is_valid: true,
            validate_info: String::new(),
        }
    }

    fn registry_with(ids: &[(&str, &str)]) -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Registry::open(&dir.path().join("controllers.json")).expect("open");
        for (id, version) in ids {
            registry.add(descriptor(id, version)).expect("add");
        }
        (dir, registry)
    }

    fn params(
        controller: Option<&str>,
        path: Option<&str>,
        version: Option<&str>,
    ) -> SessionParams {
        SessionParams {
            controller: controller.map(String::from),
            path: path.map(String::from),
            proc: None,
            version: version.map(String::from),
        }
    }

    #[test]
    fn selects_by_explicit_id() {
        let (_dir, registry) = registry_with(&[("rosco", "1.0"), ("dtu", "2.0")]);
        let chosen = select_controller(&registry, &params(Some("dtu"), None, None)).unwrap();
        assert_eq!(chosen.id, "dtu");
    }

    #[test]
    fn unknown_explicit_id_fails() {
        let (_dir, registry) = registry_with(&[("rosco", "1.0")]);
        let err = select_controller(&registry, &params(Some("ghost"), None, None)).unwrap_err();
        assert_eq!(err, "Controller not found: ghost");
    }

    #[test]
    fn selects_by_path_token() {
        let (_dir, registry) = registry_with(&[("rosco", "1.0"), ("dtu", "2.0")]);
        // Last hyphen-delimited segment of the path-like parameter.
        let chosen =
            select_controller(&registry, &params(None, Some("discon-server-rosco"), None)).unwrap();
        assert_eq!(chosen.id, "rosco");
    }

    #[test]
    fn selects_by_full_path_value() {
        let (_dir, registry) = registry_with(&[("my-controller", "1.0"), ("other", "2.0")]);
        let chosen =
            select_controller(&registry, &params(None, Some("my-controller"), None)).unwrap();
        assert_eq!(chosen.id, "my-controller");
    }

    #[test]
    fn unmatched_path_falls_through_to_version() {
        let (_dir, registry) = registry_with(&[("rosco", "1.0"), ("dtu", "2.0")]);
        let chosen =
            select_controller(&registry, &params(None, Some("discon.dll"), Some("2.0"))).unwrap();
        assert_eq!(chosen.id, "dtu");
    }

    #[test]
    fn unknown_version_fails() {
        let (_dir, registry) = registry_with(&[("rosco", "1.0")]);
        let err = select_controller(&registry, &params(None, None, Some("9.9"))).unwrap_err();
        assert_eq!(err, "Controller version not found: 9.9");
    }

    #[test]
    fn falls_back_to_first_registered() {
        let (_dir, registry) = registry_with(&[("first", "1.0"), ("second", "2.0")]);
        let chosen = select_controller(&registry, &params(None, None, None)).unwrap();
        assert_eq!(chosen.id, "first");
    }

    #[test]
    fn empty_registry_fails_admission() {
        let (_dir, registry) = registry_with(&[]);
        let err = select_controller(&registry, &params(None, None, None)).unwrap_err();
        assert_eq!(err, "No controllers available");
    }

    #[test]
    fn empty_parameters_are_ignored() {
        let (_dir, registry) = registry_with(&[("first", "1.0")]);
        let chosen =
            select_controller(&registry, &params(Some(""), Some(""), Some(""))).unwrap();
        assert_eq!(chosen.id, "first");
    }
}
