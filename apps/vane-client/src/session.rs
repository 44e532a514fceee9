//! The persistent connection behind the shim: environment-driven setup, the
//! per-session staging cache, and the strict request/response exchange that
//! backs every ABI call.

use std::collections::{HashMap, HashSet};
use std::env;
use std::fs::File;
use std::io::Write;
use std::net::TcpStream;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use discon_proto::net::session_url;
use discon_proto::{cstr_str, generate_server_path, Frame, SWAP_INFILE_LEN};

use crate::staging::rewrite_references;

/// CSV dumps cap the number of swap entries per row.
const CSV_SWAP_LIMIT: usize = 163;

/// The host-owned ABI buffers for one call, sized by the capacities the swap
/// array advertises. Never retained past the call.
pub struct CallBuffers<'a> {
    pub swap: &'a mut [f32],
    pub fail: &'a mut i32,
    pub in_file: &'a mut [u8],
    pub out_name: &'a mut [u8],
    pub msg: &'a mut [u8],
}

/// Lazily-initialized global session state. A failed initialization is
/// sticky: every subsequent call reports the same configuration error.
pub enum SessionSlot {
    Uninit,
    Ready(Box<ClientSession>),
    Failed(String),
}

impl SessionSlot {
    pub fn get_or_connect(&mut self) -> Result<&mut ClientSession, String> {
        if matches!(self, SessionSlot::Uninit) {
            *self = match ClientSession::connect() {
                Ok(session) => SessionSlot::Ready(Box::new(session)),
                Err(err) => SessionSlot::Failed(format!("{err:#}")),
            };
        }
        match self {
            SessionSlot::Ready(session) => Ok(session),
            SessionSlot::Failed(msg) => Err(msg.clone()),
            SessionSlot::Uninit => unreachable!("slot initialized above"),
        }
    }
}

pub struct ClientSession {
    socket: WebSocket<MaybeTlsStream<TcpStream>>,
    frame: Frame,
    /// Local path -> server-assigned path; each file is staged at most once.
    staged: HashMap<String, String>,
    /// Local paths that arrived as the ABI's primary input file.
    primary: HashSet<String>,
    additional_files_done: bool,
    debug_level: i32,
    sent_csv: Option<File>,
    recv_csv: Option<File>,
}

impl ClientSession {
    pub fn connect() -> Result<Self> {
        let (debug_level, csv_base) = parse_debug_env(env::var("DISCON_CLIENT_DEBUG").ok());

        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive(
                match debug_level {
                    0 => tracing::Level::WARN.into(),
                    1 => tracing::Level::INFO.into(),
                    _ => tracing::Level::DEBUG.into(),
                },
            ))
            .try_init();
        info!("loaded vane-client v{}", env!("CARGO_PKG_VERSION"));

        let addr = require_env("DISCON_SERVER_ADDR", "e.g. 'localhost:8080'")?;
        let lib_path = require_env("DISCON_LIB_PATH", "e.g. 'discon.dll'")?;
        let proc = require_env("DISCON_LIB_PROC", "e.g. 'discon'")?;

        let (scheme, authority) = websocket_endpoint(&addr);
        let url = session_url(scheme, authority, &lib_path, &proc);
        info!(%url, "connecting to manager");

        let (socket, _) = tungstenite::connect(url.as_str())
            .with_context(|| format!("error connecting to manager at {addr}"))?;
        info!("connected to manager");

        let (sent_csv, recv_csv) = if debug_level >= 1 {
            let sent = File::create(format!("{csv_base}_sent.csv"))
                .context("error creating sent swap file")?;
            let recv = File::create(format!("{csv_base}_recv.csv"))
                .context("error creating recv swap file")?;
            (Some(sent), Some(recv))
        } else {
            (None, None)
        };

        Ok(Self {
            socket,
            frame: Frame::default(),
            staged: HashMap::new(),
            primary: HashSet::new(),
            additional_files_done: false,
            debug_level,
            sent_csv,
            recv_csv,
        })
    }

    /// Executes one ABI call end to end: staging, request, response, and
    /// copy-back into the host's buffers.
    pub fn call(&mut self, b: &mut CallBuffers) -> Result<()> {
        if !self.additional_files_done {
            self.process_additional_files()
                .context("Additional files transfer failed")?;
            self.additional_files_done = true;
        }

        let in_file_path = cstr_str(b.in_file).trim_end_matches('\0').to_string();

        if !in_file_path.is_empty() && Path::new(&in_file_path).is_file() {
            self.primary.insert(in_file_path.clone());
            let server_path = self
                .stage_local_file(&in_file_path)
                .context("File transfer failed")?;
            self.frame.in_file.clear();
            self.frame.in_file.extend_from_slice(server_path.as_bytes());
            self.frame.in_file.push(0);
            // The controller reads the path length from the swap array.
            b.swap[SWAP_INFILE_LEN] = self.frame.in_file.len() as f32;
        } else {
            if !in_file_path.is_empty() {
                debug!(path = %in_file_path, "input file not found locally, passing original path");
            }
            self.frame.in_file.clear();
            if b.in_file.is_empty() {
                self.frame.in_file.push(0);
            } else {
                self.frame.in_file.extend_from_slice(b.in_file);
            }
        }

        self.frame.swap.clear();
        self.frame.swap.extend_from_slice(b.swap);
        self.frame.fail = *b.fail;
        fill_or_nul(&mut self.frame.out_name, b.out_name);
        fill_or_nul(&mut self.frame.msg, b.msg);
        self.frame.file_content.clear();
        self.frame.server_file_path.clear();

        let data = self.frame.encode();
        self.socket
            .send(Message::Binary(data))
            .context("error sending frame to manager")?;
        if self.debug_level >= 2 {
            debug!(frame = %self.frame, "sent");
        }
        dump_swap(&mut self.sent_csv, &self.frame.swap);

        let reply = self.read_binary()?;
        self.frame
            .decode_into(&reply)
            .context("error decoding response frame")?;
        if self.debug_level >= 2 {
            debug!(frame = %self.frame, "received");
        }
        dump_swap(&mut self.recv_csv, &self.frame.swap);

        let n = self.frame.swap.len().min(b.swap.len());
        b.swap[..n].copy_from_slice(&self.frame.swap[..n]);
        *b.fail = self.frame.fail;
        copy_into(b.out_name, &self.frame.out_name);
        copy_into(b.msg, &self.frame.msg);
        // in_file is intentionally not copied back; the host keeps its path.
        Ok(())
    }

    /// Stages every file named in `DISCON_ADDITIONAL_FILES` (semicolon
    /// separated) before the first ABI call reaches the controller.
    fn process_additional_files(&mut self) -> Result<()> {
        let list = match env::var("DISCON_ADDITIONAL_FILES") {
            Ok(list) if !list.is_empty() => list,
            _ => {
                debug!("no DISCON_ADDITIONAL_FILES specified");
                return Ok(());
            }
        };

        for path in list.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            if !Path::new(path).is_file() {
                bail!("additional file does not exist: {path}");
            }
            let server_path = self
                .stage_local_file(path)
                .with_context(|| format!("failed to send additional file {path}"))?;
            info!(local = %path, server = %server_path, "additional file transferred");
        }
        Ok(())
    }

    /// Ships one local file to the sandbox, returning its server-assigned
    /// path. Idempotent per local path for the session lifetime.
    fn stage_local_file(&mut self, local_path: &str) -> Result<String> {
        if let Some(server_path) = self.staged.get(local_path) {
            return Ok(server_path.clone());
        }

        let mut content = std::fs::read(local_path)
            .with_context(|| format!("error reading file {local_path}"))?;

        // The primary input file references its siblings by their local
        // names; substitute the server-assigned ones before shipping.
        if self.primary.contains(local_path) && !self.staged.is_empty() {
            content = rewrite_references(&content, &self.staged, &self.primary);
        }

        let server_path = generate_server_path(&content, local_path);
        info!(local = %local_path, server = %server_path, bytes = content.len(), "staging file");

        let request = Frame::file_transfer(content, &server_path);
        self.socket
            .send(Message::Binary(request.encode()))
            .context("error sending file to manager")?;

        let reply = self.read_binary()?;
        let response = Frame::decode(&reply).context("error decoding staging response")?;
        if response.fail != 0 {
            bail!("file transfer failed: {}", cstr_str(&response.msg));
        }

        self.staged
            .insert(local_path.to_string(), server_path.clone());
        Ok(server_path)
    }

    fn read_binary(&mut self) -> Result<Vec<u8>> {
        loop {
            match self.socket.read().context("error reading from manager")? {
                Message::Binary(data) => return Ok(data),
                Message::Close(_) => bail!("connection closed by manager"),
                _ => continue,
            }
        }
    }
}

fn require_env(name: &str, hint: &str) -> Result<String> {
    env::var(name).map_err(|_| anyhow::anyhow!("environment variable {name} not set ({hint})"))
}

/// `DISCON_CLIENT_DEBUG` is overloaded: an integer sets the level, anything
/// else is a CSV base name and implies level 1.
fn parse_debug_env(value: Option<String>) -> (i32, String) {
    const DEFAULT_CSV: &str = "discon_swap";
    match value {
        None => (0, DEFAULT_CSV.to_string()),
        Some(raw) => match raw.parse::<i32>() {
            Ok(level) => (level, DEFAULT_CSV.to_string()),
            Err(_) => (1, raw),
        },
    }
}

/// Maps `DISCON_SERVER_ADDR` to a websocket scheme and authority: an
/// `http(s)` scheme picks `ws`/`wss`, a bare `host:port` means `ws`.
fn websocket_endpoint(addr: &str) -> (&'static str, &str) {
    let (scheme, rest) = if let Some(rest) = addr.strip_prefix("https://") {
        ("wss", rest)
    } else if let Some(rest) = addr.strip_prefix("http://") {
        ("ws", rest)
    } else if let Some(rest) = addr.strip_prefix("wss://") {
        ("wss", rest)
    } else if let Some(rest) = addr.strip_prefix("ws://") {
        ("ws", rest)
    } else {
        ("ws", addr)
    };
    (scheme, rest.trim_end_matches('/'))
}

fn fill_or_nul(dst: &mut Vec<u8>, src: &[u8]) {
    dst.clear();
    if src.is_empty() {
        dst.push(0);
    } else {
        dst.extend_from_slice(src);
    }
}

fn copy_into(dst: &mut [u8], src: &[u8]) {
    let n = dst.len().min(src.len());
    dst[..n].copy_from_slice(&src[..n]);
}

fn dump_swap(file: &mut Option<File>, swap: &[f32]) {
    if let Some(f) = file {
        let n = swap.len().min(CSV_SWAP_LIMIT);
        let row: Vec<String> = swap[..n].iter().map(|v| v.to_string()).collect();
        let _ = writeln!(f, "{}", row.join(","));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_env_integer_sets_level() {
        assert_eq!(parse_debug_env(None), (0, "discon_swap".to_string()));
        assert_eq!(
            parse_debug_env(Some("2".to_string())),
            (2, "discon_swap".to_string())
        );
        assert_eq!(
            parse_debug_env(Some("0".to_string())),
            (0, "discon_swap".to_string())
        );
    }

    #[test]
    fn debug_env_filename_implies_level_one() {
        assert_eq!(
            parse_debug_env(Some("run42".to_string())),
            (1, "run42".to_string())
        );
    }

    #[test]
    fn server_addr_scheme_mapping() {
        assert_eq!(websocket_endpoint("localhost:8080"), ("ws", "localhost:8080"));
        assert_eq!(
            websocket_endpoint("http://manager:9000"),
            ("ws", "manager:9000")
        );
        assert_eq!(
            websocket_endpoint("https://manager.example.com/"),
            ("wss", "manager.example.com")
        );
        assert_eq!(websocket_endpoint("wss://edge:443"), ("wss", "edge:443"));
    }

    #[test]
    fn copy_into_respects_capacity() {
        let mut dst = [0u8; 4];
        copy_into(&mut dst, b"abcdef");
        assert_eq!(&dst, b"abcd");

        let mut dst = [9u8; 6];
        copy_into(&mut dst, b"ab");
        assert_eq!(&dst, b"ab\x09\x09\x09\x09");
    }
}
