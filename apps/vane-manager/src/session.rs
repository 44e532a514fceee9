//! One admitted session: the readiness gate, the retrying sandbox connect,
//! and the two independent proxy flows joined by a shared close signal.

use std::sync::atomic::AtomicBool;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use axum::extract::ws::{Message as ClientMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message as SandboxMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use discon_proto::net::session_url;
use discon_proto::Frame;

use crate::docker::{SandboxDriver, SandboxHandle};
use crate::manager::Manager;
use crate::registry::ControllerDescriptor;

/// Reads time out after this long without traffic on either hop.
const READ_DEADLINE: Duration = Duration::from_secs(30);
/// Writes must complete within this long on either hop.
const WRITE_DEADLINE: Duration = Duration::from_secs(5);
/// Websocket handshake budget when dialing the sandbox.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
/// Wall-time bound on the pre-connect readiness probe.
const READY_TIMEOUT: Duration = Duration::from_secs(30);
const READY_PROBE_INTERVAL: Duration = Duration::from_millis(500);
/// Log lines that mean the sandbox host has bound its listener.
const READY_MARKERS: [&str; 3] = ["listening on", "server started", "Server initialized"];

const CONNECT_RETRIES: u32 = 12;
const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_STEP: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_millis(2500);

type SandboxSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One logical client ↔ sandbox binding. Owned by its proxy flows; the rest
/// of the manager only touches the close signal and the activity clock.
pub struct Session {
    pub id: String,
    /// Monotonic connection number, used as the log prefix.
    pub conn_no: u64,
    pub remote_addr: String,
    pub connected_at: OffsetDateTime,
    pub last_activity: Mutex<Instant>,
    pub controller: ControllerDescriptor,
    /// Entry-point symbol for this session; a `proc` query parameter may
    /// override the descriptor's symbol, never its library path.
    pub proc_name: String,
    pub sandbox: SandboxHandle,
    pub close: CancellationToken,
    pub torn_down: AtomicBool,
}

impl Session {
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}

/// Drives a session from the completed client upgrade to teardown.
pub async fn run(manager: std::sync::Arc<Manager>, session: std::sync::Arc<Session>, client: WebSocket) {
    let conn = session.conn_no;
    let debug_level = manager.config.server.debug_level;

    wait_for_ready(&manager.driver, &session).await;

    let sandbox_socket = match connect_to_sandbox(&manager.driver, &session).await {
        Ok(socket) => socket,
        Err(err) => {
            error!(conn, %err, "error connecting to sandbox websocket");
            manager.close_session(&session).await;
            return;
        }
    };
    debug!(conn, "connected to sandbox websocket, starting proxy");

    let (mut client_tx, mut client_rx) = client.split();
    let (mut sandbox_tx, mut sandbox_rx) = sandbox_socket.split();

    let upstream = {
        let session = session.clone();
        async move {
            loop {
                let next = match timeout(READ_DEADLINE, client_rx.next()).await {
                    Err(_) => {
                        debug!(conn, "client read deadline reached");
                        break;
                    }
                    Ok(next) => next,
                };
                let message = match next {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => {
                        debug!(conn, %err, "error reading from client");
                        break;
                    }
                    None => break,
                };
                session.touch();
                let forward = match message {
                    ClientMessage::Binary(data) => {
                        log_frame(conn, debug_level, "client -> sandbox", &data);
                        SandboxMessage::Binary(data)
                    }
                    ClientMessage::Text(text) => SandboxMessage::Text(text),
                    ClientMessage::Ping(data) => SandboxMessage::Ping(data),
                    ClientMessage::Pong(data) => SandboxMessage::Pong(data),
                    ClientMessage::Close(_) => break,
                };
                match timeout(WRITE_DEADLINE, sandbox_tx.send(forward)).await {
                    Err(_) => {
                        debug!(conn, "sandbox write deadline reached");
                        break;
                    }
                    Ok(Err(err)) => {
                        debug!(conn, %err, "error writing to sandbox");
                        break;
                    }
                    Ok(Ok(())) => {}
                }
            }
        }
    };

    let downstream = {
        let session = session.clone();
        async move {
            loop {
                let next = match timeout(READ_DEADLINE, sandbox_rx.next()).await {
                    Err(_) => {
                        debug!(conn, "sandbox read deadline reached");
                        break;
                    }
                    Ok(next) => next,
                };
                let message = match next {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => {
                        debug!(conn, %err, "error reading from sandbox");
                        break;
                    }
                    None => break,
                };
                session.touch();
                let forward = match message {
                    SandboxMessage::Binary(data) => {
                        log_frame(conn, debug_level, "sandbox -> client", &data);
                        ClientMessage::Binary(data)
                    }
                    SandboxMessage::Text(text) => ClientMessage::Text(text),
                    SandboxMessage::Ping(data) => ClientMessage::Ping(data),
                    SandboxMessage::Pong(data) => ClientMessage::Pong(data),
                    SandboxMessage::Close(_) => break,
                    SandboxMessage::Frame(_) => continue,
                };
                match timeout(WRITE_DEADLINE, client_tx.send(forward)).await {
                    Err(_) => {
                        debug!(conn, "client write deadline reached");
                        break;
                    }
                    Ok(Err(err)) => {
                        debug!(conn, %err, "error writing to client");
                        break;
                    }
                    Ok(Ok(())) => {}
                }
            }
        }
    };

    tokio::select! {
        _ = upstream => debug!(conn, "client flow ended"),
        _ = downstream => debug!(conn, "sandbox flow ended"),
        _ = session.close.cancelled() => debug!(conn, "session close signalled"),
    }

    manager.close_session(&session).await;
}

fn log_frame(conn: u64, debug_level: i32, direction: &str, data: &[u8]) {
    if debug_level >= 2 {
        if let Ok(frame) = Frame::decode(data) {
            debug!(conn, %frame, "{direction}");
        }
    }
}

/// Polls sandbox logs for a ready marker, falling back to a TCP probe of the
/// internal address. Bounded; on timeout the connect loop takes over.
async fn wait_for_ready(driver: &SandboxDriver, session: &Session) {
    let conn = session.conn_no;
    let address = format!("{}:{}", session.sandbox.internal_ip, session.sandbox.port);
    let deadline = Instant::now() + READY_TIMEOUT;

    while Instant::now() < deadline {
        match driver.tail_logs(&session.sandbox.id).await {
            Ok(logs) if READY_MARKERS.iter().any(|m| logs.contains(m)) => {
                debug!(conn, "sandbox ready marker found in logs");
                return;
            }
            Ok(_) => {}
            Err(err) => debug!(conn, %err, "could not read sandbox logs"),
        }

        if let Ok(Ok(stream)) = timeout(READY_PROBE_INTERVAL, TcpStream::connect(&address)).await {
            drop(stream);
            debug!(conn, "tcp probe to sandbox succeeded");
            return;
        }

        sleep(READY_PROBE_INTERVAL).await;
    }
    debug!(conn, "readiness probe timed out, proceeding to connect attempts");
}

/// Dials the sandbox websocket with bounded retries and additive backoff.
/// Every third attempt re-checks the sandbox is alive; the third attempt
/// additionally lists the library path inside the sandbox as a diagnostic.
async fn connect_to_sandbox(driver: &SandboxDriver, session: &Session) -> Result<SandboxSocket> {
    let conn = session.conn_no;
    let authority = format!("{}:{}", session.sandbox.internal_ip, session.sandbox.port);
    let url = session_url("ws", &authority, &session.controller.library_path, &session.proc_name);
    debug!(conn, %url, "connecting to sandbox websocket");

    let mut backoff = BACKOFF_INITIAL;
    let mut last_error = anyhow!("no connection attempts made");

    for attempt in 0..CONNECT_RETRIES {
        if attempt > 0 {
            debug!(conn, attempt = attempt + 1, max = CONNECT_RETRIES, "retrying sandbox connection");
            sleep(backoff).await;
            backoff = (backoff + BACKOFF_STEP).min(BACKOFF_CAP);
        }

        match timeout(HANDSHAKE_TIMEOUT, connect_async(url.as_str())).await {
            Ok(Ok((socket, _))) => return Ok(socket),
            Ok(Err(err)) => last_error = err.into(),
            Err(_) => last_error = anyhow!("handshake timed out"),
        }
        debug!(conn, attempt = attempt + 1, %last_error, "sandbox connection attempt failed");

        if attempt > 0 && attempt % 3 == 0 && !driver.is_running(&session.sandbox.id).await {
            bail!("sandbox is no longer running, aborting connection attempts");
        }
        if attempt == 3 {
            let cmd = vec![
                "ls".to_string(),
                "-l".to_string(),
                session.controller.library_path.clone(),
            ];
            match driver.exec(&session.sandbox.id, cmd).await {
                Ok(output) => debug!(conn, output = %output.trim(), "library file check"),
                Err(err) => warn!(conn, %err, "library file check failed"),
            }
        }
    }

    Err(last_error.context(format!(
        "error connecting to sandbox after {CONNECT_RETRIES} attempts"
    )))
}
