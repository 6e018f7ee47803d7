//! Tracing init shared by all three extension binaries.
//!
//! stdout is the protocol channel; logs must never land there.

use tracing_subscriber::EnvFilter;

/// Reads `TERM_RELAY_LOG` (default `info`) and installs a stderr-only fmt subscriber.
///
/// Safe to call once per process; a second call is a no-op (the global default can only be set
/// once, and we don't care who wins in tests that exercise multiple binaries' `main` logic).
pub fn init() {
    let filter = EnvFilter::try_from_env("TERM_RELAY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
