//! UNIX-domain socket transport to the host-side iTerm2 bridge.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::bridge::{TerminalBridgeStart, TerminalBridgeTransport};
use crate::error::RelayError;
use crate::rpc::RpcError;

#[derive(Default)]
struct AttachOutcome {
    rows: Option<i64>,
    cols: Option<i64>,
    error: Option<String>,
    ready: bool,
}

struct State {
    closed: bool,
    exit_emitted: bool,
}

/// A UNIX-domain stream connection to the host iTerm2 bridge.
///
/// `self_weak` lets `connect` (which only borrows `&self` per the `TerminalBridgeTransport`
/// contract) hand the reader thread an owned `Arc<Self>`; it's populated once, right after
/// construction, and never forms a cycle (a `Weak` holds no strong count).
pub struct Iterm2SocketTransport {
    socket_path: String,
    connect_timeout: Duration,
    self_weak: Mutex<Weak<Iterm2SocketTransport>>,
    writer: Mutex<Option<UnixStream>>,
    state: Mutex<State>,
    attach: Mutex<AttachOutcome>,
    attach_cv: Condvar,
    on_output: Mutex<Option<Box<dyn Fn(&[u8]) + Send + Sync>>>,
    on_exit: Mutex<Option<Box<dyn Fn(&str) + Send + Sync>>>,
    pre_attach: AtomicBool,
}

impl Iterm2SocketTransport {
    pub fn new(socket_path: impl Into<String>, connect_timeout: Duration) -> Arc<Self> {
        let transport = Arc::new(Iterm2SocketTransport {
            socket_path: socket_path.into(),
            connect_timeout,
            self_weak: Mutex::new(Weak::new()),
            writer: Mutex::new(None),
            state: Mutex::new(State { closed: false, exit_emitted: false }),
            attach: Mutex::new(AttachOutcome::default()),
            attach_cv: Condvar::new(),
            on_output: Mutex::new(None),
            on_exit: Mutex::new(None),
            pre_attach: AtomicBool::new(true),
        });
        *transport.self_weak.lock().unwrap() = Arc::downgrade(&transport);
        transport
    }

    fn send_frame(&self, frame: &Value) {
        let line = match serde_json::to_string(frame) {
            Ok(l) => l,
            Err(_) => return,
        };
        let mut guard = self.writer.lock().unwrap();
        if let Some(stream) = guard.as_mut() {
            let _ = stream.write_all(line.as_bytes());
            let _ = stream.write_all(b"\n");
        }
    }

    fn emit_exit_once(&self, reason: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if state.exit_emitted {
                return;
            }
            state.exit_emitted = true;
        }
        info!(reason, "iterm2 bridge session exited");
        if let Some(f) = self.on_exit.lock().unwrap().as_ref() {
            f(reason);
        }
    }

    fn handle_frame(&self, frame: &Value) {
        let frame_type = frame.get("type").and_then(Value::as_str).unwrap_or("");
        match frame_type {
            "attached" => {
                let rows = frame.get("rows").and_then(Value::as_i64);
                let cols = frame.get("cols").and_then(Value::as_i64);
                let mut attach = self.attach.lock().unwrap();
                attach.rows = rows;
                attach.cols = cols;
                attach.ready = true;
                self.pre_attach.store(false, Ordering::SeqCst);
                self.attach_cv.notify_all();
            }
            "error" => {
                let message = frame
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("iterm2 bridge error")
                    .to_string();
                if self.pre_attach.load(Ordering::SeqCst) {
                    let mut attach = self.attach.lock().unwrap();
                    attach.error = Some(message);
                    attach.ready = true;
                    self.attach_cv.notify_all();
                } else {
                    self.emit_exit_once(&message);
                }
            }
            "output" => {
                let data_b64 = frame.get("data_b64").and_then(Value::as_str).unwrap_or("");
                if let Ok(data) = BASE64.decode(data_b64) {
                    if let Some(f) = self.on_output.lock().unwrap().as_ref() {
                        f(&data);
                    }
                }
            }
            "exit" => {
                let reason = frame.get("reason").and_then(Value::as_str).unwrap_or("EOF").to_string();
                if self.pre_attach.load(Ordering::SeqCst) {
                    let mut attach = self.attach.lock().unwrap();
                    attach.error = Some(reason);
                    attach.ready = true;
                    self.attach_cv.notify_all();
                } else {
                    self.emit_exit_once(&reason);
                }
            }
            _ => {}
        }
    }

    fn read_loop(self: Arc<Self>, mut reader: BufReader<UnixStream>) {
        loop {
            let mut line = String::new();
            let n = match reader.read_line(&mut line) {
                Ok(n) => n,
                Err(_) => break,
            };
            if n == 0 {
                warn!("iterm2 bridge socket closed by peer");
                if self.pre_attach.load(Ordering::SeqCst) {
                    let mut attach = self.attach.lock().unwrap();
                    attach.error = Some("iterm2 bridge disconnected before attach".to_string());
                    attach.ready = true;
                    self.attach_cv.notify_all();
                }
                self.emit_exit_once("iterm2 bridge disconnected");
                break;
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                continue;
            }
            if let Ok(frame) = serde_json::from_str::<Value>(trimmed) {
                self.handle_frame(&frame);
            }
        }
    }
}

impl TerminalBridgeTransport for Iterm2SocketTransport {
    fn set_event_handlers(&self, on_output: Box<dyn Fn(&[u8]) + Send + Sync>, on_exit: Box<dyn Fn(&str) + Send + Sync>) {
        *self.on_output.lock().unwrap() = Some(on_output);
        *self.on_exit.lock().unwrap() = Some(on_exit);
    }

    fn connect(&self, start: &TerminalBridgeStart) -> Result<Option<(i64, i64)>, RpcError> {
        if start.target.is_empty() {
            return Err(RelayError::invalid_params("target is required").into());
        }
        let stream = UnixStream::connect(&self.socket_path)
            .map_err(|e| RelayError::BackendAttachFailed(format!("iterm2 bridge connect failed: {e}")))?;
        // No read timeout beyond the connect itself: the attach handshake is bounded by the
        // condvar wait below, and the reader thread must block indefinitely once attached, across
        // arbitrarily long idle periods in the terminal session.
        let reader_stream = stream.try_clone().map_err(RelayError::Io)?;
        *self.writer.lock().unwrap() = Some(stream);

        let owned_self = self
            .self_weak
            .lock()
            .unwrap()
            .upgrade()
            .expect("transport outlives its own connect call");
        let reader_owner = Arc::clone(&owned_self);
        std::thread::Builder::new()
            .name("iterm2-reader".to_string())
            .spawn(move || reader_owner.read_loop(BufReader::new(reader_stream)))
            .expect("spawn iterm2 reader thread");

        self.send_frame(&json!({
            "type": "attach",
            "target": start.target,
            "command": start.command,
            "rows": start.rows,
            "cols": start.cols,
            "term": start.term,
        }));

        self.wait_for_attach()
    }

    fn send_input(&self, data: &[u8]) {
        self.send_frame(&json!({"type": "input", "data_b64": BASE64.encode(data)}));
    }

    fn send_resize(&self, rows: i64, cols: i64) {
        self.send_frame(&json!({"type": "resize", "rows": rows, "cols": cols}));
    }

    fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.send_frame(&json!({"type": "detach"}));
        if let Some(stream) = self.writer.lock().unwrap().take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

impl Iterm2SocketTransport {
    /// Blocks (bounded by `connect_timeout`) for an `attached` or `error` frame, an `exit` frame
    /// arriving before attach completes, or the peer closing the socket early.
    fn wait_for_attach(&self) -> Result<Option<(i64, i64)>, RpcError> {
        let deadline = Instant::now() + self.connect_timeout;
        let mut attach = self.attach.lock().unwrap();
        while !attach.ready {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (guard, timeout_result) = self.attach_cv.wait_timeout(attach, remaining).unwrap();
            attach = guard;
            if timeout_result.timed_out() && !attach.ready {
                break;
            }
        }

        if !attach.ready {
            drop(attach);
            warn!(timeout_ms = self.connect_timeout.as_millis() as u64, "iterm2 bridge attach timed out");
            self.close();
            return Err(RelayError::BackendAttachFailed("iterm2 bridge attach timeout".to_string()).into());
        }
        if let Some(err) = &attach.error {
            let err = err.clone();
            drop(attach);
            warn!(%err, "iterm2 bridge attach failed");
            return Err(RelayError::BackendAttachFailed(err).into());
        }
        match (attach.rows, attach.cols) {
            (Some(r), Some(c)) if r > 0 && c > 0 => Ok(Some((r, c))),
            _ => Ok(None),
        }
    }
}

/// Standalone target-listing query against the iTerm2 bridge, never routed through the JSON-RPC
/// façade. Opens its own short-lived socket connection and tracks a single overall deadline across
/// however many frames arrive before the `targets` reply.
pub fn list_iterm2_targets(socket_path: &str, connect_timeout: Duration) -> Result<Vec<Value>, RpcError> {
    let stream = UnixStream::connect(socket_path)
        .map_err(|e| RelayError::BackendAttachFailed(format!("iterm2 bridge connect failed: {e}")))?;
    let deadline = Instant::now() + connect_timeout;
    stream.set_read_timeout(Some(connect_timeout)).map_err(RelayError::Io)?;
    let mut writer = stream.try_clone().map_err(RelayError::Io)?;
    writer.write_all(b"{\"type\":\"list_targets\"}\n").map_err(RelayError::Io)?;

    let mut reader = BufReader::new(stream);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RelayError::BackendAttachFailed("iterm2 bridge list_targets timeout".to_string()).into());
        }
        let _ = reader.get_ref().set_read_timeout(Some(remaining));

        let mut line = String::new();
        let n = reader.read_line(&mut line).map_err(RelayError::Io)?;
        if n == 0 {
            return Err(RelayError::BackendAttachFailed("iterm2 bridge disconnected".to_string()).into());
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            continue;
        }
        let frame: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => continue,
        };
        match frame.get("type").and_then(Value::as_str) {
            Some("targets") => {
                let targets = frame
                    .get("targets")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|v| v.is_object())
                    .collect();
                return Ok(targets);
            }
            Some("error") => {
                let message = frame.get("message").and_then(Value::as_str).unwrap_or("iterm2 bridge error");
                return Err(RelayError::BackendAttachFailed(message.to_string()).into());
            }
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;

    fn temp_socket_path() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iterm2.sock").to_string_lossy().to_string();
        (dir, path)
    }

    #[test]
    fn connect_adopts_attached_geometry() {
        let (_dir, path) = temp_socket_path();
        let listener = UnixListener::bind(&path).unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert!(line.contains("\"type\":\"attach\""));
            writer.write_all(b"{\"type\":\"attached\",\"rows\":35,\"cols\":90}\n").unwrap();
        });

        let transport = Iterm2SocketTransport::new(path, Duration::from_secs(2));
        transport.set_event_handlers(Box::new(|_| {}), Box::new(|_| {}));
        let start = TerminalBridgeStart {
            target: "iterm2://pane/fake-1".to_string(),
            command: vec![],
            rows: 24,
            cols: 80,
            term: "xterm-256color".to_string(),
        };
        let geometry = transport.connect(&start).unwrap();
        assert_eq!(geometry, Some((35, 90)));
        server.join().unwrap();
    }

    #[test]
    fn connect_surfaces_pre_attach_error() {
        let (_dir, path) = temp_socket_path();
        let listener = UnixListener::bind(&path).unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream;
            writer.write_all(b"{\"type\":\"error\",\"message\":\"pane not found\"}\n").unwrap();
        });

        let transport = Iterm2SocketTransport::new(path, Duration::from_secs(2));
        transport.set_event_handlers(Box::new(|_| {}), Box::new(|_| {}));
        let start = TerminalBridgeStart {
            target: "iterm2://pane/missing".to_string(),
            command: vec![],
            rows: 24,
            cols: 80,
            term: "xterm-256color".to_string(),
        };
        let err = transport.connect(&start).unwrap_err();
        assert!(err.message.contains("pane not found"));
        server.join().unwrap();
    }

    #[test]
    fn connect_times_out_when_bridge_never_attaches() {
        let (_dir, path) = temp_socket_path();
        let listener = UnixListener::bind(&path).unwrap();
        let server = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(300));
        });

        let transport = Iterm2SocketTransport::new(path, Duration::from_millis(50));
        transport.set_event_handlers(Box::new(|_| {}), Box::new(|_| {}));
        let start = TerminalBridgeStart {
            target: "iterm2://pane/slow".to_string(),
            command: vec![],
            rows: 24,
            cols: 80,
            term: "xterm-256color".to_string(),
        };
        let err = transport.connect(&start).unwrap_err();
        assert!(err.message.contains("attach timeout"));
        server.join().unwrap();
    }

    #[test]
    fn list_targets_returns_the_targets_array() {
        let (_dir, path) = temp_socket_path();
        let listener = UnixListener::bind(&path).unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line.trim(), "{\"type\":\"list_targets\"}");
            writer
                .write_all(b"{\"type\":\"targets\",\"targets\":[{\"target\":\"iterm2://pane/1\"}]}\n")
                .unwrap();
        });

        let targets = list_iterm2_targets(&path, Duration::from_secs(2)).unwrap();
        assert_eq!(targets.len(), 1);
        server.join().unwrap();
    }
}
