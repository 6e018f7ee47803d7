//! Error taxonomy for the relay core.
//!
//! [`RelayError`] is the crate-internal error currency. Anything that must surface on the wire
//! carries an explicit JSON-RPC error code via [`RelayError::rpc_code`]; everything else collapses
//! to -32603 at the dispatch boundary (see [`crate::rpc`]).

use thiserror::Error;

/// Standard JSON-RPC 2.0 codes.
pub const CODE_PARSE_ERROR: i64 = -32600;
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const CODE_INVALID_PARAMS: i64 = -32602;
pub const CODE_INTERNAL_ERROR: i64 = -32603;

/// Relay-specific codes, outside the standard JSON-RPC range.
pub const CODE_SESSION_ALREADY_RUNNING: i64 = 4001;
pub const CODE_SESSION_NOT_FOUND: i64 = 4004;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    InvalidParams(String),

    #[error("session already running")]
    SessionAlreadyRunning,

    #[error("session not found")]
    SessionNotFound,

    #[error("{0}")]
    BackendAttachFailed(String),

    #[error("tmux command failed: {0}")]
    TmuxCommandFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        RelayError::InvalidParams(msg.into())
    }

    /// The JSON-RPC error code this error should be reported under.
    pub fn rpc_code(&self) -> i64 {
        match self {
            RelayError::InvalidParams(_) => CODE_INVALID_PARAMS,
            RelayError::SessionAlreadyRunning => CODE_SESSION_ALREADY_RUNNING,
            RelayError::SessionNotFound => CODE_SESSION_NOT_FOUND,
            RelayError::BackendAttachFailed(_) => CODE_INTERNAL_ERROR,
            RelayError::TmuxCommandFailed(_) => CODE_INVALID_PARAMS,
            RelayError::Io(_) | RelayError::Json(_) => CODE_INTERNAL_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_params_reports_the_standard_code() {
        let err = RelayError::invalid_params("target is required");
        assert_eq!(err.rpc_code(), CODE_INVALID_PARAMS);
    }

    #[test]
    fn session_state_errors_report_relay_specific_codes() {
        assert_eq!(RelayError::SessionAlreadyRunning.rpc_code(), 4001);
        assert_eq!(RelayError::SessionNotFound.rpc_code(), 4004);
    }
}
