//! `term-relay-spawn`: Simple I/O front end over a locally spawned PTY child.

use std::io::{self, BufReader};
use std::sync::Arc;

use term_relay::channel::JsonLineChannel;
use term_relay::logging;
use term_relay::pty::PtyAdapter;
use term_relay::simple_io::{SimpleIoAdapter, SimpleIoServer};

fn main() {
    logging::init();
    let channel = Arc::new(JsonLineChannel::stdout());
    let adapter = PtyAdapter::new() as Arc<dyn SimpleIoAdapter>;
    let server = SimpleIoServer::new(adapter, channel);
    let status = server.run(BufReader::new(io::stdin()));
    std::process::exit(status);
}
