//! Simple I/O protocol — the non-RPC framing used by the spawn extension.

use std::io::{BufRead, Write};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::channel::{lines, JsonLineChannel};

/// Backend adapter driven by the Simple I/O loop. `on_start` may synchronously return an
/// adopted (rows, cols) pair; any error it returns is fatal to the whole process.
pub trait SimpleIoAdapter: Send + Sync {
    fn set_emitters(&self, emit_output: EmitOutput, emit_exit: EmitExit);
    fn on_start(&self, command: Vec<String>, rows: i64, cols: i64, term: String) -> Result<Option<(i64, i64)>, String>;
    fn on_input(&self, data: &[u8]);
    fn on_resize(&self, rows: i64, cols: i64);
    fn on_stop(&self);
}

pub type EmitOutput = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type EmitExit = Arc<dyn Fn(&str) + Send + Sync>;

pub struct SimpleIoServer<W: Write> {
    adapter: Arc<dyn SimpleIoAdapter>,
    channel: Arc<JsonLineChannel<W>>,
    emit_exit: EmitExit,
}

impl<W: Write + Send + Sync + 'static> SimpleIoServer<W> {
    pub fn new(adapter: Arc<dyn SimpleIoAdapter>, channel: Arc<JsonLineChannel<W>>) -> Self {
        let emit_output: EmitOutput = {
            let channel = Arc::clone(&channel);
            Arc::new(move |data: &[u8]| {
                if data.is_empty() {
                    return;
                }
                let _ = channel.send(&json!({"type": "output", "data_b64": BASE64.encode(data)}));
            })
        };
        let emit_exit: EmitExit = {
            let channel = Arc::clone(&channel);
            Arc::new(move |reason: &str| {
                let _ = channel.send(&json!({"type": "exit", "reason": reason}));
            })
        };
        adapter.set_emitters(emit_output, Arc::clone(&emit_exit));
        SimpleIoServer { adapter, channel, emit_exit }
    }

    /// Runs the frame loop until EOF or `stop`. Returns the process exit status.
    pub fn run(&self, reader: impl BufRead) -> i32 {
        let mut started = false;
        for line in lines(reader) {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let frame: Value = match serde_json::from_str(trimmed) {
                Ok(v) => v,
                Err(err) => {
                    error!(%err, "invalid json frame, exiting");
                    (self.emit_exit)(&format!("invalid json: {err}"));
                    return 1;
                }
            };
            let Value::Object(ref obj) = frame else { continue };
            let msg_type = obj.get("type").and_then(Value::as_str).unwrap_or("");

            match msg_type {
                "start" => {
                    if started {
                        continue;
                    }
                    let command: Vec<String> = obj
                        .get("command")
                        .and_then(Value::as_array)
                        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                        .unwrap_or_default();
                    let rows = obj.get("rows").and_then(Value::as_i64).filter(|r| *r > 0).unwrap_or(24);
                    let cols = obj.get("cols").and_then(Value::as_i64).filter(|c| *c > 0).unwrap_or(80);
                    let term = obj
                        .get("term")
                        .and_then(Value::as_str)
                        .filter(|t| !t.is_empty())
                        .unwrap_or("xterm-256color")
                        .to_string();

                    match self.adapter.on_start(command, rows, cols, term) {
                        Err(err) => {
                            error!(%err, "on_start failed, exiting");
                            (self.emit_exit)(&err);
                            return 1;
                        }
                        Ok(ready) => {
                            started = true;
                            info!(rows, cols, "simple i/o session started");
                            if let Some((ready_rows, ready_cols)) = ready {
                                let _ = self
                                    .channel
                                    .send(&json!({"type": "ready", "rows": ready_rows, "cols": ready_cols}));
                            }
                        }
                    }
                }
                "input" => {
                    let data_b64 = obj.get("data_b64").and_then(Value::as_str).unwrap_or("");
                    if data_b64.is_empty() {
                        continue;
                    }
                    match BASE64.decode(data_b64) {
                        Ok(data) => self.adapter.on_input(&data),
                        Err(err) => warn!(%err, "dropping input frame with invalid data_b64"),
                    }
                }
                "resize" => {
                    let rows = obj.get("rows").and_then(Value::as_i64).unwrap_or(0);
                    let cols = obj.get("cols").and_then(Value::as_i64).unwrap_or(0);
                    self.adapter.on_resize(rows, cols);
                }
                "stop" => {
                    info!("simple i/o session stopped by request");
                    self.adapter.on_stop();
                    return 0;
                }
                _ => continue,
            }
        }

        if started {
            info!("stdin closed, stopping simple i/o session");
            self.adapter.on_stop();
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Mutex;

    struct FakeAdapter {
        started: Mutex<Vec<(Vec<String>, i64, i64, String)>>,
        inputs: Mutex<Vec<Vec<u8>>>,
        resizes: Mutex<Vec<(i64, i64)>>,
        stopped: Mutex<u32>,
        ready: Option<(i64, i64)>,
        fail: Option<String>,
    }

    impl SimpleIoAdapter for FakeAdapter {
        fn set_emitters(&self, _emit_output: EmitOutput, _emit_exit: EmitExit) {}

        fn on_start(&self, command: Vec<String>, rows: i64, cols: i64, term: String) -> Result<Option<(i64, i64)>, String> {
            if let Some(err) = &self.fail {
                return Err(err.clone());
            }
            self.started.lock().unwrap().push((command, rows, cols, term));
            Ok(self.ready)
        }

        fn on_input(&self, data: &[u8]) {
            self.inputs.lock().unwrap().push(data.to_vec());
        }

        fn on_resize(&self, rows: i64, cols: i64) {
            self.resizes.lock().unwrap().push((rows, cols));
        }

        fn on_stop(&self) {
            *self.stopped.lock().unwrap() += 1;
        }
    }

    fn fake(ready: Option<(i64, i64)>, fail: Option<&str>) -> Arc<FakeAdapter> {
        Arc::new(FakeAdapter {
            started: Mutex::new(Vec::new()),
            inputs: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            stopped: Mutex::new(0),
            ready,
            fail: fail.map(str::to_string),
        })
    }

    fn run_server(adapter: &Arc<FakeAdapter>, input: &str) -> (i32, Vec<Value>) {
        let channel = Arc::new(JsonLineChannel::new(Vec::<u8>::new()));
        let server = SimpleIoServer::new(Arc::clone(adapter) as Arc<dyn SimpleIoAdapter>, Arc::clone(&channel));
        let status = server.run(Cursor::new(input.as_bytes().to_vec()));
        let written = channel.writer.lock().unwrap();
        let frames = String::from_utf8(written.clone())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        (status, frames)
    }

    #[test]
    fn start_twice_is_ignored() {
        let adapter = fake(Some((24, 80)), None);
        let (status, frames) = run_server(
            &adapter,
            "{\"type\":\"start\",\"command\":[\"sh\"]}\n{\"type\":\"start\",\"command\":[\"sh\"]}\n",
        );
        assert_eq!(status, 0);
        assert_eq!(adapter.started.lock().unwrap().len(), 1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "ready");
    }

    #[test]
    fn failed_on_start_is_fatal() {
        let adapter = fake(None, Some("boom"));
        let (status, frames) = run_server(&adapter, "{\"type\":\"start\",\"command\":[\"sh\"]}\n");
        assert_eq!(status, 1);
        assert_eq!(frames[0]["type"], "exit");
        assert_eq!(frames[0]["reason"], "boom");
    }

    #[test]
    fn input_is_base64_decoded_and_forwarded() {
        let adapter = fake(None, None);
        run_server(&adapter, "{\"type\":\"start\",\"command\":[\"sh\"]}\n{\"type\":\"input\",\"data_b64\":\"aGk=\"}\n");
        assert_eq!(adapter.inputs.lock().unwrap()[0], b"hi");
    }

    #[test]
    fn malformed_input_data_b64_is_dropped_silently() {
        let adapter = fake(None, None);
        run_server(&adapter, "{\"type\":\"start\",\"command\":[\"sh\"]}\n{\"type\":\"input\",\"data_b64\":\"!!!\"}\n");
        assert!(adapter.inputs.lock().unwrap().is_empty());
    }

    #[test]
    fn resize_forwards_non_positive_values_leniently() {
        let adapter = fake(None, None);
        run_server(&adapter, "{\"type\":\"start\",\"command\":[\"sh\"]}\n{\"type\":\"resize\",\"rows\":0,\"cols\":-1}\n");
        assert_eq!(adapter.resizes.lock().unwrap()[0], (0, -1));
    }

    #[test]
    fn stop_frame_ends_the_loop_with_status_zero() {
        let adapter = fake(None, None);
        let (status, _frames) = run_server(
            &adapter,
            "{\"type\":\"start\",\"command\":[\"sh\"]}\n{\"type\":\"stop\"}\n{\"type\":\"input\",\"data_b64\":\"aGk=\"}\n",
        );
        assert_eq!(status, 0);
        assert_eq!(*adapter.stopped.lock().unwrap(), 1);
        assert!(adapter.inputs.lock().unwrap().is_empty());
    }

    #[test]
    fn eof_after_start_triggers_on_stop() {
        let adapter = fake(None, None);
        run_server(&adapter, "{\"type\":\"start\",\"command\":[\"sh\"]}\n");
        assert_eq!(*adapter.stopped.lock().unwrap(), 1);
    }
}
