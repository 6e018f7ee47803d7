//! `term-relay-iterm2`: JSON-RPC front end bridging to a host-side iTerm2 socket.
//!
//! Besides its default stdio-serving mode, this binary also accepts a `list-targets` subcommand
//! that performs a standalone query against the bridge and exits, never starting the JSON-RPC
//! loop.

use std::io::{self, BufReader};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;

use term_relay::bridge::{parse_terminal_bridge_start, TerminalBridgeRuntime, TerminalBridgeTransport};
use term_relay::config;
use term_relay::iterm2::{list_iterm2_targets, Iterm2SocketTransport};
use term_relay::logging;
use term_relay::rpc::JsonRpcServer;
use term_relay::session::{Capabilities, Hello, SessionRuntime, SingleSessionServer};
use term_relay::channel::JsonLineChannel;

#[derive(Parser)]
#[command(name = "term-relay-iterm2")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Query the iTerm2 bridge for attachable targets and print them as JSON.
    ListTargets {
        #[arg(long)]
        bridge_socket: Option<String>,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    match cli.command {
        Some(Command::ListTargets { bridge_socket }) => run_list_targets(bridge_socket.as_deref()),
        None => run_server(),
    }
}

fn run_list_targets(bridge_socket: Option<&str>) {
    let socket = config::iterm2_bridge_socket(bridge_socket);
    let timeout = config::iterm2_connect_timeout();
    match list_iterm2_targets(&socket, timeout) {
        Ok(targets) => {
            println!("{}", serde_json::to_string(&targets).expect("targets serialise"));
        }
        Err(err) => {
            eprintln!("term-relay-iterm2: {err}");
            std::process::exit(1);
        }
    }
}

fn run_server() {
    let channel = Arc::new(JsonLineChannel::stdout());
    let rpc = Arc::new(JsonRpcServer::new(channel));

    let hello = Hello::new(
        "com.termrelay.rust.iterm2",
        "Term Relay Rust iTerm2 Extension",
        env!("CARGO_PKG_VERSION"),
        Capabilities {
            can_spawn: false,
            can_attach: true,
            can_takeover: false,
            can_list_targets: true,
            has_history_snapshot: false,
            has_native_layout_events: false,
            supports_shared_input: true,
            supports_controller_resize: true,
            supports_restore_on_stop: true,
        },
    );

    let facade = SingleSessionServer::install(
        Arc::clone(&rpc),
        hello,
        Box::new(|params, emit_output, emit_exit| {
            let bridge_socket_param = params.get("bridge_socket").and_then(Value::as_str);
            let socket = config::iterm2_bridge_socket(bridge_socket_param);
            let timeout = config::iterm2_connect_timeout();
            let start = parse_terminal_bridge_start(&params, 24, 80, "xterm-256color")?;

            let transport = Iterm2SocketTransport::new(socket, timeout) as Arc<dyn TerminalBridgeTransport>;
            let runtime = TerminalBridgeRuntime::new(transport, start, emit_output, emit_exit)?;
            Ok(Box::new(runtime) as Box<dyn SessionRuntime>)
        }),
    );

    rpc.run(BufReader::new(io::stdin()), || facade.cleanup());
}
