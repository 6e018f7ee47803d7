//! Single-session façade. Enforces at-most-one active session per process and routes
//! `ext.input`/`ext.resize`/`ext.stop` by handle.

use std::io::Write;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::RelayError;
use crate::rpc::{JsonRpcServer, RpcError};

/// Static per-extension capability set, returned verbatim by `ext.hello`.
#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    pub can_spawn: bool,
    pub can_attach: bool,
    pub can_takeover: bool,
    pub can_list_targets: bool,
    pub has_history_snapshot: bool,
    pub has_native_layout_events: bool,
    pub supports_shared_input: bool,
    pub supports_controller_resize: bool,
    pub supports_restore_on_stop: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Hello {
    pub id: String,
    pub name: String,
    pub version: String,
    pub protocol_version: String,
    pub capabilities: Capabilities,
}

impl Hello {
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>, capabilities: Capabilities) -> Self {
        Hello {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            protocol_version: "v1".to_string(),
            capabilities,
        }
    }
}

/// A running backend-specific session, as seen by the façade. `handle` is generated once at
/// construction and never changes.
pub trait SessionRuntime: Send + Sync {
    fn handle(&self) -> &str;
    fn rows(&self) -> i64;
    fn cols(&self) -> i64;
    fn write_input(&self, data: &[u8]);
    fn resize(&self, rows: i64, cols: i64);
    fn stop(&self);
}

pub type EmitOutput = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;
pub type EmitExit = Arc<dyn Fn(&str, &str) + Send + Sync>;
pub type StartSessionFn = Box<dyn Fn(Value, EmitOutput, EmitExit) -> Result<Box<dyn SessionRuntime>, RpcError> + Send + Sync>;

pub struct SingleSessionServer<W: Write + Send + 'static> {
    rpc: Arc<JsonRpcServer<W>>,
    hello: Value,
    active: Mutex<Option<Box<dyn SessionRuntime>>>,
}

impl<W: Write + Send + 'static> SingleSessionServer<W> {
    /// Builds the façade and registers its six methods plus the close hook. `start_session` is
    /// the backend-specific constructor invoked by `ext.start`.
    pub fn install(rpc: Arc<JsonRpcServer<W>>, hello: Hello, start_session: StartSessionFn) -> Arc<Self> {
        let this = Arc::new(SingleSessionServer {
            rpc: Arc::clone(&rpc),
            hello: serde_json::to_value(&hello).expect("hello descriptor serialises"),
            active: Mutex::new(None),
        });

        let h = Arc::clone(&this);
        rpc.register("ext.hello", move |_params| Ok(h.hello.clone()));

        let h = Arc::clone(&this);
        rpc.register("ext.health", move |_params| {
            let active = h.active.lock().unwrap();
            Ok(json!({"ok": true, "active": active.is_some()}))
        });

        let h = Arc::clone(&this);
        let start_session = Arc::new(start_session);
        rpc.register("ext.start", move |params| h.handle_start(params, &start_session));

        let h = Arc::clone(&this);
        rpc.register("ext.input", move |params| h.handle_input(params));

        let h = Arc::clone(&this);
        rpc.register("ext.resize", move |params| h.handle_resize(params));

        let h = Arc::clone(&this);
        rpc.register("ext.stop", move |params| h.handle_stop(params));

        this
    }

    /// Call once when the stdin iterator completes: stops any active session to release backend
    /// resources.
    pub fn cleanup(&self) {
        let runtime = self.active.lock().unwrap().take();
        if let Some(runtime) = runtime {
            runtime.stop();
        }
    }

    /// Start protocol, critical path: lock-check, release, call the (possibly blocking) backend
    /// constructor, reacquire, recheck for a double-start race.
    fn handle_start(self: &Arc<Self>, params: Value, start_session: &StartSessionFn) -> Result<Value, RpcError> {
        {
            let active = self.active.lock().unwrap();
            if active.is_some() {
                warn!("rejecting ext.start: a session is already running");
                return Err(RelayError::SessionAlreadyRunning.into());
            }
        }

        let emit_output = self.emit_output_fn();
        let emit_exit = self.emit_exit_fn();
        let runtime = start_session(params, emit_output, emit_exit)?;

        let mut active = self.active.lock().unwrap();
        if active.is_some() {
            drop(active);
            warn!("rejecting ext.start: lost the race against a concurrent start");
            runtime.stop();
            return Err(RelayError::SessionAlreadyRunning.into());
        }
        info!(handle = runtime.handle(), rows = runtime.rows(), cols = runtime.cols(), "session started");
        let result = json!({
            "session_handle": runtime.handle(),
            "rows": runtime.rows(),
            "cols": runtime.cols(),
        });
        *active = Some(runtime);
        Ok(result)
    }

    fn handle_input(&self, params: Value) -> Result<Value, RpcError> {
        let handle = params.get("session_handle").and_then(Value::as_str).unwrap_or("");
        let data_b64 = params.get("data_b64").and_then(Value::as_str).unwrap_or("");
        let data = BASE64
            .decode(data_b64)
            .map_err(|_| RelayError::invalid_params("invalid data_b64"))?;

        let active = self.active.lock().unwrap();
        let runtime = require_session(&active, handle)?;
        runtime.write_input(&data);
        Ok(json!({"ok": true}))
    }

    fn handle_resize(&self, params: Value) -> Result<Value, RpcError> {
        let handle = params.get("session_handle").and_then(Value::as_str).unwrap_or("");
        let rows = params.get("rows").and_then(Value::as_i64).unwrap_or(0);
        let cols = params.get("cols").and_then(Value::as_i64).unwrap_or(0);

        let active = self.active.lock().unwrap();
        let runtime = require_session(&active, handle)?;
        if rows <= 0 || cols <= 0 {
            return Err(RelayError::invalid_params("rows and cols must be > 0").into());
        }
        runtime.resize(rows, cols);
        Ok(json!({"ok": true}))
    }

    /// An empty handle acts as a wildcard for stop only, so a controller that never learned the
    /// handle can still tear a session down; this method never fails.
    fn handle_stop(&self, params: Value) -> Result<Value, RpcError> {
        let handle = params.get("session_handle").and_then(Value::as_str).unwrap_or("");
        let mut active = self.active.lock().unwrap();
        if let Some(runtime) = active.as_ref() {
            if handle.is_empty() || handle == runtime.handle() {
                info!(handle = runtime.handle(), "session stopped");
                runtime.stop();
                *active = None;
            }
        }
        Ok(json!({"ok": true}))
    }

    fn emit_output_fn(self: &Arc<Self>) -> EmitOutput {
        let rpc = Arc::clone(&self.rpc);
        Arc::new(move |handle, data| {
            if data.is_empty() {
                return;
            }
            rpc.notify(
                "event.output",
                json!({"session_handle": handle, "data_b64": BASE64.encode(data)}),
            );
        })
    }

    /// Atomically clears the active session if its handle matches, then always notifies
    /// `event.exit` — the slot is cleared before the notification goes out, so a controller that
    /// reacts to the notification by calling `ext.start` again never sees a double-start.
    fn emit_exit_fn(self: &Arc<Self>) -> EmitExit {
        let this = Arc::clone(self);
        Arc::new(move |handle, reason| {
            {
                let mut active = this.active.lock().unwrap();
                if matches!(active.as_ref(), Some(runtime) if runtime.handle() == handle) {
                    *active = None;
                }
            }
            info!(handle, reason, "session exited");
            this.rpc.notify("event.exit", json!({"session_handle": handle, "reason": reason}));
        })
    }
}

fn require_session<'a>(active: &'a Option<Box<dyn SessionRuntime>>, handle: &str) -> Result<&'a Box<dyn SessionRuntime>, RpcError> {
    match active {
        None => Err(RelayError::SessionNotFound.into()),
        Some(runtime) if handle.is_empty() || handle != runtime.handle() => Err(RelayError::SessionNotFound.into()),
        Some(runtime) => Ok(runtime),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::JsonLineChannel;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeRuntime {
        handle: String,
        rows: Mutex<i64>,
        cols: Mutex<i64>,
        stopped: AtomicBool,
        inputs: Mutex<Vec<Vec<u8>>>,
    }

    impl SessionRuntime for FakeRuntime {
        fn handle(&self) -> &str {
            &self.handle
        }
        fn rows(&self) -> i64 {
            *self.rows.lock().unwrap()
        }
        fn cols(&self) -> i64 {
            *self.cols.lock().unwrap()
        }
        fn write_input(&self, data: &[u8]) {
            self.inputs.lock().unwrap().push(data.to_vec());
        }
        fn resize(&self, rows: i64, cols: i64) {
            *self.rows.lock().unwrap() = rows;
            *self.cols.lock().unwrap() = cols;
        }
        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn new_facade() -> Arc<SingleSessionServer<Vec<u8>>> {
        let rpc = Arc::new(JsonRpcServer::new(Arc::new(JsonLineChannel::new(Vec::new()))));
        let start_session: StartSessionFn = Box::new(|_params, _out, _exit| {
            Ok(Box::new(FakeRuntime {
                handle: "abc123".to_string(),
                rows: Mutex::new(24),
                cols: Mutex::new(80),
                stopped: AtomicBool::new(false),
                inputs: Mutex::new(Vec::new()),
            }) as Box<dyn SessionRuntime>)
        });
        let hello = Hello::new(
            "com.test.fake",
            "fake",
            "0.1.0",
            Capabilities {
                can_spawn: false,
                can_attach: true,
                can_takeover: false,
                can_list_targets: false,
                has_history_snapshot: false,
                has_native_layout_events: false,
                supports_shared_input: true,
                supports_controller_resize: true,
                supports_restore_on_stop: true,
            },
        );
        SingleSessionServer::install(rpc, hello, start_session)
    }

    #[test]
    fn start_then_double_start_returns_4001() {
        let facade = new_facade();
        let r1 = facade.handle_start(json!({}), &start_fn());
        assert!(r1.is_ok());
        let r2 = facade.handle_start(json!({}), &start_fn());
        assert_eq!(r2.unwrap_err().code, 4001);
    }

    fn start_fn() -> StartSessionFn {
        Box::new(|_p, _o, _e| {
            Ok(Box::new(FakeRuntime {
                handle: "zzz".to_string(),
                rows: Mutex::new(24),
                cols: Mutex::new(80),
                stopped: AtomicBool::new(false),
                inputs: Mutex::new(Vec::new()),
            }) as Box<dyn SessionRuntime>)
        })
    }

    #[test]
    fn input_with_empty_handle_is_a_mismatch() {
        let facade = new_facade();
        facade.handle_start(json!({}), &start_fn()).unwrap();
        let err = facade.handle_input(json!({"session_handle": "", "data_b64": "YQ=="})).unwrap_err();
        assert_eq!(err.code, 4004);
    }

    #[test]
    fn stop_with_empty_handle_is_a_wildcard() {
        let facade = new_facade();
        facade.handle_start(json!({}), &start_fn()).unwrap();
        let result = facade.handle_stop(json!({})).unwrap();
        assert_eq!(result["ok"], true);
        // Second stop is a no-op and still returns ok: true (S6).
        let result = facade.handle_stop(json!({})).unwrap();
        assert_eq!(result["ok"], true);
    }

    #[test]
    fn resize_rejects_non_positive_dimensions() {
        let facade = new_facade();
        let result = facade.handle_start(json!({}), &start_fn()).unwrap();
        let handle = result["session_handle"].as_str().unwrap().to_string();
        let err = facade
            .handle_resize(json!({"session_handle": handle, "rows": 0, "cols": 10}))
            .unwrap_err();
        assert_eq!(err.code, -32602);
    }

    #[test]
    fn resize_mismatched_handle_returns_4004() {
        let facade = new_facade();
        facade.handle_start(json!({}), &start_fn()).unwrap();
        let err = facade
            .handle_resize(json!({"session_handle": "wrong", "rows": 10, "cols": 10}))
            .unwrap_err();
        assert_eq!(err.code, 4004);
    }
}
