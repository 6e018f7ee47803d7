//! tmux control-mode session. Drives `tmux -C attach` as a child process and parses its `%output`
//! event stream directly — this backend does not go through
//! [`crate::bridge::TerminalBridgeTransport`], since tmux's control protocol has no attach
//! handshake to adapt (the pane either exists or `display-message` fails up front).

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use rand::RngCore;
use regex::bytes::Regex;
use serde_json::Value;
use tracing::{info, warn};
use wait_timeout::ChildExt;

use crate::error::RelayError;
use crate::rpc::RpcError;
use crate::session::{EmitExit, EmitOutput, SessionRuntime};

const RELAY_ORIGIN_PANE_OPT: &str = "@term_relay_origin";

/// Bound on any single `tmux` CLI invocation used during the attach handshake
/// (`display-message`, `capture-pane`, the pane-option query) so a hung tmux server can't wedge
/// `ext.start` forever.
const TMUX_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

fn output_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^%output (%[0-9]+) (.*)$").unwrap())
}

/// Reverses tmux's `\OOO` byte-escaping of control-mode output payloads.
pub fn decode_octal(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    let n = data.len();
    while i < n {
        if data[i] == b'\\'
            && i + 3 < n
            && (b'0'..=b'7').contains(&data[i + 1])
            && (b'0'..=b'7').contains(&data[i + 2])
            && (b'0'..=b'7').contains(&data[i + 3])
        {
            let digits = std::str::from_utf8(&data[i + 1..i + 4]).unwrap();
            out.push(u8::from_str_radix(digits, 8).unwrap());
            i += 4;
            continue;
        }
        out.push(data[i]);
        i += 1;
    }
    out
}

/// Runs a one-shot `tmux` CLI command, bounded by [`TMUX_COMMAND_TIMEOUT`]: if tmux hangs (e.g. a
/// wedged server), the child is killed and reaped rather than blocking `ext.start` forever.
fn tmux_cmd(args: &[&str]) -> Result<Vec<u8>, RelayError> {
    let mut child = Command::new("tmux")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let status = match child.wait_timeout(TMUX_COMMAND_TIMEOUT)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            warn!(command = args.join(" "), timeout = ?TMUX_COMMAND_TIMEOUT, "tmux command timed out");
            return Err(RelayError::TmuxCommandFailed(format!(
                "tmux command timed out after {:?}: {}",
                TMUX_COMMAND_TIMEOUT,
                args.join(" ")
            )));
        }
    };

    let mut stdout = Vec::new();
    if let Some(mut s) = child.stdout.take() {
        let _ = s.read_to_end(&mut stdout);
    }
    if !status.success() {
        let mut stderr = Vec::new();
        if let Some(mut s) = child.stderr.take() {
            let _ = s.read_to_end(&mut stderr);
        }
        let mut err = String::from_utf8_lossy(&stderr).trim().to_string();
        if err.is_empty() {
            err = format!("tmux command failed: {}", args.join(" "));
        }
        return Err(RelayError::TmuxCommandFailed(err));
    }
    Ok(stdout)
}

fn pane_option_value(target: &str, option: &str) -> Result<String, RelayError> {
    if !option.starts_with('@') {
        return Err(RelayError::TmuxCommandFailed(format!("invalid pane option name: {option}")));
    }
    let raw = tmux_cmd(&["display-message", "-t", target, "-p", &format!("#{{{option}}}")])?;
    let value = String::from_utf8_lossy(&raw).trim().to_string();
    if value == option {
        Ok(String::new())
    } else {
        Ok(value)
    }
}

/// Accepts an optional leading `share` token, `--allow-nested`/`-allow-nested`, and a single
/// positional target pane (e.g. `%0`); everything else is rejected.
pub fn parse_tmux_start_command(command: &[String]) -> Result<(String, bool), RpcError> {
    if command.is_empty() {
        return Err(RelayError::invalid_params("tmux target is required (example: %0)").into());
    }
    let mut args: &[String] = command;
    if args[0] == "share" {
        args = &args[1..];
    }

    let mut allow_nested = false;
    let mut target = String::new();
    for arg in args {
        if arg == "--allow-nested" || arg == "-allow-nested" {
            allow_nested = true;
            continue;
        }
        if arg.starts_with('-') {
            return Err(RelayError::invalid_params(format!("unknown option: {arg}")).into());
        }
        if !target.is_empty() {
            return Err(RelayError::invalid_params(format!("too many positional arguments: {arg}")).into());
        }
        target = arg.clone();
    }

    if target.is_empty() {
        return Err(RelayError::invalid_params("tmux target is required (example: %0)").into());
    }
    Ok((target, allow_nested))
}

fn new_handle() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct TmuxControlSession {
    handle: String,
    target: String,
    target_pane: String,
    geometry: Mutex<(i64, i64)>,
    stdin: Mutex<Option<ChildStdin>>,
    pid: i32,
    stopped: AtomicBool,
    exit_sent: AtomicBool,
    emit_output: EmitOutput,
    emit_exit: EmitExit,
}

impl TmuxControlSession {
    /// Resolves the pane and its owning session, attaches `tmux -C`, and starts the reader/wait
    /// threads before returning.
    fn start(target: String, rows: i64, cols: i64, emit_output: EmitOutput, emit_exit: EmitExit) -> Result<Arc<Self>, RpcError> {
        let rows = if rows <= 0 { 24 } else { rows };
        let cols = if cols <= 0 { 80 } else { cols };

        let target_pane = String::from_utf8_lossy(&tmux_cmd(&["display-message", "-t", &target, "-p", "#{pane_id}"])?)
            .trim()
            .to_string();
        let session_name = String::from_utf8_lossy(&tmux_cmd(&["display-message", "-t", &target, "-p", "#{session_name}"])?)
            .trim()
            .to_string();

        let mut child = Command::new("tmux")
            .args(["-C", "attach", "-t", &session_name])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(RelayError::Io)?;
        let pid = child.id() as i32;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");

        let runtime = Arc::new(TmuxControlSession {
            handle: new_handle(),
            target,
            target_pane,
            geometry: Mutex::new((rows, cols)),
            stdin: Mutex::new(Some(stdin)),
            pid,
            stopped: AtomicBool::new(false),
            exit_sent: AtomicBool::new(false),
            emit_output,
            emit_exit,
        });

        let reader = Arc::clone(&runtime);
        thread::Builder::new()
            .name("tmux-reader".to_string())
            .spawn(move || reader.read_loop(stdout))
            .expect("spawn tmux reader thread");

        let waiter = Arc::clone(&runtime);
        thread::Builder::new()
            .name("tmux-waiter".to_string())
            .spawn(move || waiter.wait_loop(child))
            .expect("spawn tmux wait thread");

        runtime.resize(rows, cols);
        runtime.capture_and_emit();
        info!(handle = runtime.handle, target = runtime.target, pid, "tmux control session started");
        Ok(runtime)
    }

    fn send_cmd(&self, cmd: &str) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut guard = self.stdin.lock().unwrap();
        if let Some(stdin) = guard.as_mut() {
            let payload = format!("{cmd}\n");
            if stdin.write_all(payload.as_bytes()).is_ok() {
                let _ = stdin.flush();
            }
        }
    }

    fn capture_and_emit(&self) {
        let data = match tmux_cmd(&["capture-pane", "-t", &self.target, "-e", "-p", "-S", "-", "-E", "-"]) {
            Ok(d) => d,
            Err(_) => return,
        };
        if data.is_empty() {
            return;
        }
        let mut converted = Vec::with_capacity(data.len());
        for &b in &data {
            if b == b'\n' {
                converted.push(b'\r');
            }
            converted.push(b);
        }
        (self.emit_output)(&self.handle, &converted);
    }

    fn emit_exit_once(&self, reason: &str) {
        if self.exit_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        (self.emit_exit)(&self.handle, reason);
    }

    fn read_loop(self: Arc<Self>, stdout: impl Read) {
        let mut reader = BufReader::new(stdout);
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            let mut line = Vec::new();
            let n = match reader.read_until(b'\n', &mut line) {
                Ok(n) => n,
                Err(_) => return,
            };
            if n == 0 {
                return;
            }
            while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
                line.pop();
            }
            let Some(caps) = output_re().captures(&line) else { continue };
            let pane = String::from_utf8_lossy(&caps[1]).to_string();
            if !self.target_pane.is_empty() && !pane.is_empty() && pane != self.target_pane {
                continue;
            }
            let payload = decode_octal(&caps[2]);
            if !payload.is_empty() {
                (self.emit_output)(&self.handle, &payload);
            }
        }
    }

    /// Exit-code masking: stopping with SIGINT and a clean (or SIGINT-terminated) exit both
    /// report as "EOF", as does any plain code-0 exit whether or not we asked for it. This means a
    /// tmux server that's killed out from under an attached session looks identical to a
    /// cooperative detach; left unresolved deliberately (see DESIGN.md's Open Question decisions).
    fn wait_loop(self: Arc<Self>, mut child: Child) {
        let status = match child.wait() {
            Ok(s) => s,
            Err(err) => {
                warn!(%err, "failed to wait on tmux attach child, reporting EOF");
                self.emit_exit_once("EOF");
                return;
            }
        };
        let stopped = self.stopped.load(Ordering::SeqCst);
        let code = status.code();
        let signal = status.signal();
        if code == Some(0) || (stopped && signal == Some(libc::SIGINT)) {
            self.emit_exit_once("EOF");
            return;
        }
        let desc = code.map(|c| c.to_string()).unwrap_or_else(|| format!("signal {}", signal.unwrap_or(0)));
        warn!(exit = %desc, "tmux attach process exited unexpectedly");
        self.emit_exit_once(&format!("tmux process exited: {desc}"));
    }
}

impl SessionRuntime for TmuxControlSession {
    fn handle(&self) -> &str {
        &self.handle
    }
    fn rows(&self) -> i64 {
        self.geometry.lock().unwrap().0
    }
    fn cols(&self) -> i64 {
        self.geometry.lock().unwrap().1
    }

    fn write_input(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        for &b in data {
            self.send_cmd(&format!("send-keys -t {} -H {:02x}", self.target, b));
        }
    }

    fn resize(&self, rows: i64, cols: i64) {
        if rows <= 0 || cols <= 0 {
            return;
        }
        *self.geometry.lock().unwrap() = (rows, cols);
        self.send_cmd(&format!("refresh-client -C {cols}x{rows}"));
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(handle = self.handle, "tmux control session stopped");
        let _ = self.stdin.lock().unwrap().take();
        unsafe {
            libc::kill(self.pid, libc::SIGINT);
        }
    }
}

// The reader and wait threads each hold an `Arc<TmuxControlSession>`, so the façade must share
// that ownership rather than take it exclusively (mirrors `bridge.rs`'s dual impl).
impl SessionRuntime for Arc<TmuxControlSession> {
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

/// Pure nested-attach gate: given the pane's `@term_relay_origin` value (empty string if unset)
/// and whether `--allow-nested` was passed, decides whether the attach proceeds. Split out from
/// [`start_tmux_control_session`] so this policy is testable without shelling out to `tmux` (the
/// origin lookup itself, `pane_option_value`, does require the `tmux` binary).
fn check_nested_attach_allowed(target: &str, origin: &str, allow_nested: bool) -> Result<(), RpcError> {
    if allow_nested || origin.is_empty() {
        return Ok(());
    }
    warn!(target, origin, "refusing to attach to a relay-managed pane without --allow-nested");
    Err(RelayError::invalid_params(format!(
        "pane {target} is marked as relay-managed ({origin}); use --allow-nested to override"
    ))
    .into())
}

/// `ext.start` entry point for the tmux binary. Refuses to attach to a pane another relay
/// instance already owns unless `--allow-nested` was given.
pub fn start_tmux_control_session(params: &Value, emit_output: EmitOutput, emit_exit: EmitExit) -> Result<Arc<TmuxControlSession>, RpcError> {
    let command: Vec<String> = params
        .get("command")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let (target, allow_nested) = parse_tmux_start_command(&command)?;

    if !allow_nested {
        let origin = pane_option_value(&target, RELAY_ORIGIN_PANE_OPT)
            .map_err(|e| RelayError::invalid_params(format!("failed to inspect pane metadata for {target}: {e}")))?;
        check_nested_attach_allowed(&target, &origin, allow_nested)?;
    }

    let rows = params.get("rows").and_then(Value::as_i64).filter(|r| *r > 0).unwrap_or(24);
    let cols = params.get("cols").and_then(Value::as_i64).filter(|c| *c > 0).unwrap_or(80);
    TmuxControlSession::start(target, rows, cols, emit_output, emit_exit)
}
