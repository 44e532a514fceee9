//! One websocket connection = one loaded controller instance.
//!
//! The serve loop reads framed requests, dispatches file-staging frames to
//! the local filesystem and ABI frames to the native entry point, and writes
//! the mutated frame back. Teardown removes everything the connection
//! created: staged files, the library mapping, the duplicated library file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use discon_proto::{cstr_str, validate_server_path, Frame};

use crate::loader::ControllerLibrary;
use crate::AppState;

/// Idle reap deadline applied per read when debugging is off.
const READ_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub proc: String,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let conn_id = state.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
    info!(
        conn = conn_id,
        path = %params.path,
        proc = %params.proc,
        "received request to load controller"
    );

    let library_path = Path::new(&params.path);
    if params.path.is_empty() || !library_path.is_file() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Library not found at '{}'", params.path),
        )
            .into_response();
    }

    let library = match ControllerLibrary::load(library_path, &params.proc, conn_id) {
        Ok(library) => library,
        Err(err) => {
            error!(conn = conn_id, code = err.code(), %err, "controller load failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error {}: {}", err.code(), err),
            )
                .into_response();
        }
    };

    debug!(conn = conn_id, "library and function loaded");
    let debug_level = state.debug_level;
    ws.on_upgrade(move |socket| serve_connection(socket, library, conn_id, debug_level))
}

async fn serve_connection(
    mut socket: WebSocket,
    library: ControllerLibrary,
    conn_id: u64,
    debug_level: i32,
) {
    let mut frame = Frame::default();
    let mut wire = Vec::new();
    let mut staged_files: Vec<PathBuf> = Vec::new();

    loop {
        let next = if debug_level == 0 {
            match timeout(READ_DEADLINE, socket.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    debug!(conn = conn_id, "read deadline reached, closing connection");
                    break;
                }
            }
        } else {
            socket.recv().await
        };

        let data = match next {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(other)) => {
                debug!(conn = conn_id, ?other, "ignoring non-binary message");
                continue;
            }
            Some(Err(err)) => {
                debug!(conn = conn_id, %err, "read error");
                break;
            }
        };

        if let Err(err) = frame.decode_into(&data) {
            warn!(conn = conn_id, %err, "dropping undecodable frame");
            break;
        }
        if debug_level >= 2 {
            debug!(conn = conn_id, %frame, "received frame");
        }

        if frame.is_file_transfer() {
            let (response, written) = stage_file(Path::new("."), &frame);
            if let Some(path) = written {
                staged_files.push(path);
            }
            response.encode_into(&mut wire);
        } else {
            if frame.swap.is_empty() {
                // Nothing for the controller to read its capacities from.
                warn!(conn = conn_id, "refusing ABI call with empty swap array");
                frame.fail = 1;
            } else {
                library.call(&mut frame);
            }
            frame.encode_into(&mut wire);
        }

        if let Err(err) = socket.send(Message::Binary(wire.clone())).await {
            debug!(conn = conn_id, %err, "write error");
            break;
        }
        if debug_level >= 2 {
            debug!(conn = conn_id, %frame, "sent frame");
        }
    }

    for path in &staged_files {
        if let Err(err) = fs::remove_file(path) {
            warn!(conn = conn_id, path = %path.display(), %err, "failed to remove staged file");
        }
    }
    library.unload();
    debug!(conn = conn_id, "connection closed");
}

/// Validates and executes one file-staging request against `dir`. Returns
/// the response frame and, on success, the path that must be cleaned up at
/// connection close.
fn stage_file(dir: &Path, frame: &Frame) -> (Frame, Option<PathBuf>) {
    let name = cstr_str(&frame.server_file_path).into_owned();
    if let Err(err) = validate_server_path(&name) {
        return (
            Frame::transfer_response(false, &format!("Security error: {err}")),
            None,
        );
    }

    let target = dir.join(&name);
    match fs::write(&target, &frame.file_content) {
        Ok(()) => (
            Frame::transfer_response(true, &format!("File transferred successfully: {name}")),
            Some(target),
        ),
        Err(err) => (
            Frame::transfer_response(false, &format!("Failed to write file: {err}")),
            None,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use discon_proto::cstr_str;

    #[test]
    fn staging_writes_and_tracks_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let request = Frame::file_transfer(b"servo data".to_vec(), "input_00112233_servo.cfg");

        let (response, written) = stage_file(dir.path(), &request);
        assert_eq!(response.fail, 0);
        assert!(cstr_str(&response.msg).starts_with("File transferred successfully:"));

        let path = written.expect("tracked path");
        assert_eq!(std::fs::read(&path).expect("read"), b"servo data");
        assert_eq!(path, dir.path().join("input_00112233_servo.cfg"));
    }

    #[test]
    fn staging_rejects_traversal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let request = Frame::file_transfer(b"x".to_vec(), "../etc/passwd");

        let (response, written) = stage_file(dir.path(), &request);
        assert_eq!(response.fail, 1);
        assert!(cstr_str(&response.msg).starts_with("Security error:"));
        assert!(written.is_none());
        assert!(!dir.path().join("passwd").exists());
        assert!(!dir.path().parent().unwrap().join("etc").exists());
    }

    #[test]
    fn staging_reports_write_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("gone");
        let request = Frame::file_transfer(b"x".to_vec(), "input_aa_f.txt");

        let (response, written) = stage_file(&missing, &request);
        assert_eq!(response.fail, 1);
        assert!(cstr_str(&response.msg).starts_with("Failed to write file:"));
        assert!(written.is_none());
    }
}
