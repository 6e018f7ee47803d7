//! Environment-driven configuration. No config file, no flags beyond the iTerm2 extension's
//! standalone `list-targets` mode.

use std::time::Duration;

pub const DEFAULT_ITERM2_BRIDGE_SOCKET: &str = "/tmp/term-relay-iterm2-bridge.sock";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;

/// Resolves the iTerm2 bridge socket path: explicit `override_path` (e.g. the `bridge_socket`
/// start param), else `TERM_RELAY_ITERM2_BRIDGE_SOCKET`, else the compiled-in default.
pub fn iterm2_bridge_socket(override_path: Option<&str>) -> String {
    if let Some(path) = override_path {
        if !path.is_empty() {
            return path.to_string();
        }
    }
    std::env::var("TERM_RELAY_ITERM2_BRIDGE_SOCKET")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_ITERM2_BRIDGE_SOCKET.to_string())
}

/// Connect/attach timeout for the iTerm2 socket transport, default 2s.
pub fn iterm2_connect_timeout() -> Duration {
    std::env::var("TERM_RELAY_ITERM2_CONNECT_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_socket_prefers_explicit_override() {
        assert_eq!(iterm2_bridge_socket(Some("/tmp/explicit.sock")), "/tmp/explicit.sock");
    }

    #[test]
    fn bridge_socket_falls_back_to_default_when_unset() {
        std::env::remove_var("TERM_RELAY_ITERM2_BRIDGE_SOCKET");
        assert_eq!(iterm2_bridge_socket(None), DEFAULT_ITERM2_BRIDGE_SOCKET);
    }

    #[test]
    fn connect_timeout_defaults_to_two_seconds() {
        std::env::remove_var("TERM_RELAY_ITERM2_CONNECT_TIMEOUT_MS");
        assert_eq!(iterm2_connect_timeout(), Duration::from_millis(2000));
    }
}
