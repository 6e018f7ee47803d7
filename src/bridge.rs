//! Generic terminal bridge runtime. Adapts any [`TerminalBridgeTransport`] to the façade's
//! [`crate::session::SessionRuntime`] contract.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rand::RngCore;
use tracing::info;

use crate::error::RelayError;
use crate::rpc::RpcError;
use crate::session::{EmitExit, EmitOutput, SessionRuntime};

/// Parsed `ext.start` parameters for the bridge variant.
#[derive(Debug, Clone)]
pub struct TerminalBridgeStart {
    pub target: String,
    pub command: Vec<String>,
    pub rows: i64,
    pub cols: i64,
    pub term: String,
}

/// A concrete backend connection: local PTY-over-socket, tmux, or the iTerm2 bridge. Connect may
/// block on a handshake; `send_input`/`send_resize`/`close` must not.
pub trait TerminalBridgeTransport: Send + Sync {
    /// Installs the runtime's output/exit interceptors. Called once before `connect`.
    fn set_event_handlers(&self, on_output: Box<dyn Fn(&[u8]) + Send + Sync>, on_exit: Box<dyn Fn(&str) + Send + Sync>);
    /// May block up to a configured timeout. Returns adopted (rows, cols) if the backend reports
    /// different geometry than requested.
    fn connect(&self, start: &TerminalBridgeStart) -> Result<Option<(i64, i64)>, RpcError>;
    fn send_input(&self, data: &[u8]);
    fn send_resize(&self, rows: i64, cols: i64);
    fn close(&self);
}

struct Geometry {
    rows: i64,
    cols: i64,
}

pub struct TerminalBridgeRuntime {
    handle: String,
    target: String,
    transport: std::sync::Arc<dyn TerminalBridgeTransport>,
    geometry: Mutex<Geometry>,
    stopped: AtomicBool,
    exit_sent: AtomicBool,
}

fn new_handle() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl TerminalBridgeRuntime {
    /// Constructs the runtime, installs interceptors, then calls `transport.connect` (may block).
    /// If `connect` adopts a (rows, cols) pair, it overrides the requested dimensions.
    pub fn new(
        transport: std::sync::Arc<dyn TerminalBridgeTransport>,
        start: TerminalBridgeStart,
        emit_output: EmitOutput,
        emit_exit: EmitExit,
    ) -> Result<std::sync::Arc<Self>, RpcError> {
        let handle = new_handle();
        let runtime = std::sync::Arc::new(TerminalBridgeRuntime {
            handle: handle.clone(),
            target: start.target.clone(),
            transport: std::sync::Arc::clone(&transport),
            geometry: Mutex::new(Geometry { rows: start.rows, cols: start.cols }),
            stopped: AtomicBool::new(false),
            exit_sent: AtomicBool::new(false),
        });

        let on_output_runtime = std::sync::Arc::clone(&runtime);
        let emit_output_cb = emit_output.clone();
        let on_output = Box::new(move |data: &[u8]| {
            on_output_runtime.on_output(data, &emit_output_cb);
        });

        let on_exit_runtime = std::sync::Arc::clone(&runtime);
        let emit_exit_cb = emit_exit.clone();
        let on_exit = Box::new(move |reason: &str| {
            on_exit_runtime.on_exit(reason, &emit_exit_cb);
        });

        transport.set_event_handlers(on_output, on_exit);
        if let Some((rows, cols)) = transport.connect(&start)? {
            if rows > 0 && cols > 0 {
                let mut geometry = runtime.geometry.lock().unwrap();
                geometry.rows = rows;
                geometry.cols = cols;
            }
        }

        info!(handle, target = start.target, "bridge session connected");
        Ok(runtime)
    }

    fn on_output(&self, data: &[u8], emit_output: &EmitOutput) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        emit_output(&self.handle, data);
    }

    fn on_exit(&self, reason: &str, emit_exit: &EmitExit) {
        if self.exit_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        emit_exit(&self.handle, reason);
    }
}

// Background threads inside a transport hold `Arc<TerminalBridgeRuntime>` clones (for the
// output/exit interceptors), so the façade must hold the same `Arc` rather than taking sole
// ownership; `SessionRuntime` is therefore implemented on the `Arc` wrapper.
impl SessionRuntime for std::sync::Arc<TerminalBridgeRuntime> {
    fn handle(&self) -> &str {
        (**self).handle()
    }
    fn rows(&self) -> i64 {
        (**self).rows()
    }
    fn cols(&self) -> i64 {
        (**self).cols()
    }
    fn write_input(&self, data: &[u8]) {
        (**self).write_input(data)
    }
    fn resize(&self, rows: i64, cols: i64) {
        (**self).resize(rows, cols)
    }
    fn stop(&self) {
        (**self).stop()
    }
}

impl SessionRuntime for TerminalBridgeRuntime {
    fn handle(&self) -> &str {
        &self.handle
    }

    fn rows(&self) -> i64 {
        self.geometry.lock().unwrap().rows
    }

    fn cols(&self) -> i64 {
        self.geometry.lock().unwrap().cols
    }

    fn write_input(&self, data: &[u8]) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.transport.send_input(data);
    }

    fn resize(&self, rows: i64, cols: i64) {
        if self.stopped.load(Ordering::SeqCst) || rows <= 0 || cols <= 0 {
            return;
        }
        {
            let mut geometry = self.geometry.lock().unwrap();
            geometry.rows = rows;
            geometry.cols = cols;
        }
        self.transport.send_resize(rows, cols);
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(handle = self.handle, "bridge session stopped");
        self.transport.close();
    }
}

/// Resolves the effective target (explicit `target`, else `command[0]`) and applies defaults.
/// `default_term` etc. let callers (iTerm2, generic bridges) share this parser.
pub fn parse_terminal_bridge_start(
    params: &serde_json::Value,
    default_rows: i64,
    default_cols: i64,
    default_term: &str,
) -> Result<TerminalBridgeStart, RpcError> {
    let command: Vec<String> = params
        .get("command")
        .and_then(serde_json::Value::as_array)
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    let explicit_target = params.get("target").and_then(serde_json::Value::as_str).unwrap_or("");
    let target = if !explicit_target.is_empty() {
        explicit_target.to_string()
    } else {
        command.first().cloned().unwrap_or_default()
    };
    if target.is_empty() {
        return Err(RelayError::invalid_params("target is required").into());
    }

    let rows = params
        .get("rows")
        .and_then(serde_json::Value::as_i64)
        .filter(|r| *r > 0)
        .unwrap_or(default_rows);
    let cols = params
        .get("cols")
        .and_then(serde_json::Value::as_i64)
        .filter(|c| *c > 0)
        .unwrap_or(default_cols);
    let term = params
        .get("term")
        .and_then(serde_json::Value::as_str)
        .filter(|t| !t.is_empty())
        .unwrap_or(default_term)
        .to_string();

    Ok(TerminalBridgeStart { target, command, rows, cols, term })
}
