//! JSON-RPC 2.0 dispatch over a [`JsonLineChannel`].
//!
//! Malformed lines and non-object frames are dropped silently; only a well-formed request with a
//! non-empty string `method` gets a response.

use std::collections::HashMap;
use std::io::BufRead;
use std::sync::Mutex;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::channel::JsonLineChannel;
use crate::error::{RelayError, CODE_INVALID_PARAMS, CODE_METHOD_NOT_FOUND};

/// A domain error carrying an explicit JSON-RPC code, as opposed to an opaque failure that maps
/// to -32603.
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        RpcError::new(CODE_INVALID_PARAMS, message)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<RelayError> for RpcError {
    fn from(err: RelayError) -> Self {
        RpcError::new(err.rpc_code(), err.to_string())
    }
}

pub type HandlerResult = Result<Value, RpcError>;
type Handler = Box<dyn Fn(Value) -> HandlerResult + Send + Sync>;

/// Dispatch table plus the owning channel. `register` is called during setup (single-threaded);
/// `run` drives the request loop on the calling (main) thread.
pub struct JsonRpcServer<W: std::io::Write> {
    channel: std::sync::Arc<JsonLineChannel<W>>,
    handlers: Mutex<HashMap<String, Handler>>,
}

impl<W: std::io::Write> JsonRpcServer<W> {
    pub fn new(channel: std::sync::Arc<JsonLineChannel<W>>) -> Self {
        JsonRpcServer {
            channel,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, method: impl Into<String>, handler: impl Fn(Value) -> HandlerResult + Send + Sync + 'static) {
        self.handlers
            .lock()
            .unwrap()
            .insert(method.into(), Box::new(handler));
    }

    /// Emits a notification (no `id`).
    pub fn notify(&self, method: &str, params: Value) {
        let _ = self.channel.send(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }));
    }

    /// Runs the request loop over `reader` until EOF, then invokes `on_close`.
    pub fn run(&self, reader: impl BufRead, on_close: impl FnOnce()) {
        for line in crate::channel::lines(reader) {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            self.dispatch_line(&line);
        }
        on_close();
    }

    fn dispatch_line(&self, line: &str) {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(err) => {
                warn!(%err, "dropping malformed JSON-RPC line");
                return;
            }
        };
        let Value::Object(obj) = value else {
            warn!("dropping non-object JSON-RPC frame");
            return;
        };

        let id = obj.get("id").cloned();
        let method = match obj.get("method") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => return,
        };

        let params = match obj.get("params") {
            None => json!({}),
            Some(v @ Value::Object(_)) => v.clone(),
            Some(_) => {
                self.respond_error(id, RpcError::invalid_params("params must be a json object"));
                return;
            }
        };

        let handler_result = {
            let handlers = self.handlers.lock().unwrap();
            match handlers.get(&method) {
                Some(handler) => Some(handler(params)),
                None => None,
            }
        };

        match handler_result {
            None => {
                warn!(method, "method not found");
                self.respond_error(id, RpcError::new(CODE_METHOD_NOT_FOUND, format!("method not found: {method}")));
            }
            Some(Ok(result)) => {
                debug!(method, "dispatched request");
                self.respond_result(id, result);
            }
            Some(Err(err)) => {
                debug!(method, code = err.code, "request failed");
                self.respond_error(id, err);
            }
        }
    }

    fn respond_result(&self, id: Option<Value>, result: Value) {
        let _ = self.channel.send(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        }));
    }

    fn respond_error(&self, id: Option<Value>, err: RpcError) {
        let _ = self.channel.send(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": err.code, "message": err.message},
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn new_server() -> JsonRpcServer<Vec<u8>> {
        JsonRpcServer::new(std::sync::Arc::new(JsonLineChannel::new(Vec::new())))
    }

    fn drain(server: &JsonRpcServer<Vec<u8>>, input: &str) -> Vec<Value> {
        server.run(Cursor::new(input.as_bytes().to_vec()), || {});
        let channel = &server.channel;
        let written = channel.writer.lock().unwrap();
        String::from_utf8(written.clone())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn malformed_json_is_dropped_silently() {
        let server = new_server();
        let out = drain(&server, "not json\n{\"jsonrpc\":\"2.0\"}\n");
        assert!(out.is_empty());
    }

    #[test]
    fn unknown_method_reports_method_not_found() {
        let server = new_server();
        let out = drain(&server, "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"nope\"}\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["error"]["code"], -32601);
    }

    #[test]
    fn non_object_params_reports_invalid_params() {
        let server = new_server();
        server.register("ext.health", |_| Ok(json!({"ok": true})));
        let out = drain(
            &server,
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ext.health\",\"params\":[1,2]}\n",
        );
        assert_eq!(out[0]["error"]["code"], -32602);
    }

    #[test]
    fn missing_params_defaults_to_empty_object() {
        let server = new_server();
        server.register("ext.health", |params| {
            assert_eq!(params, json!({}));
            Ok(json!({"ok": true}))
        });
        let out = drain(&server, "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ext.health\"}\n");
        assert_eq!(out[0]["result"]["ok"], true);
    }

    #[test]
    fn domain_error_round_trips_its_code_and_message() {
        let server = new_server();
        server.register("ext.start", |_| Err(RpcError::new(4001, "session already running")));
        let out = drain(&server, "{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"ext.start\",\"params\":{}}\n");
        assert_eq!(out[0]["error"]["code"], 4001);
        assert_eq!(out[0]["id"], 7);
    }
}
