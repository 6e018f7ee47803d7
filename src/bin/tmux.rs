//! `term-relay-tmux`: JSON-RPC front end driving a `tmux -C` control-mode session.

use std::io::{self, BufReader};
use std::sync::Arc;

use term_relay::channel::JsonLineChannel;
use term_relay::logging;
use term_relay::rpc::JsonRpcServer;
use term_relay::session::{Capabilities, Hello, SessionRuntime, SingleSessionServer};
use term_relay::tmux::start_tmux_control_session;

fn main() {
    logging::init();
    let channel = Arc::new(JsonLineChannel::stdout());
    let rpc = Arc::new(JsonRpcServer::new(channel));

    let hello = Hello::new(
        "com.termrelay.rust.tmux",
        "Term Relay Rust Tmux Extension",
        env!("CARGO_PKG_VERSION"),
        Capabilities {
            can_spawn: true,
            can_attach: true,
            can_takeover: false,
            can_list_targets: false,
            has_history_snapshot: true,
            has_native_layout_events: true,
            supports_shared_input: true,
            supports_controller_resize: true,
            supports_restore_on_stop: true,
        },
    );

    let facade = SingleSessionServer::install(
        Arc::clone(&rpc),
        hello,
        Box::new(|params, emit_output, emit_exit| {
            let session = start_tmux_control_session(&params, emit_output, emit_exit)?;
            Ok(Box::new(session) as Box<dyn SessionRuntime>)
        }),
    );

    rpc.run(BufReader::new(io::stdin()), || facade.cleanup());
}
