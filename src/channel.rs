//! Line-framed JSON channel over stdio.
//!
//! `send` serialises under a single mutex so concurrent producers (reader threads, wait threads,
//! the main request loop) never interleave a frame. `lines` has exactly one caller: the main
//! thread's request loop.

use std::io::{self, BufRead, Write};
use std::sync::Mutex;

use serde::Serialize;

pub struct JsonLineChannel<W: Write> {
    pub(crate) writer: Mutex<W>,
}

impl JsonLineChannel<io::Stdout> {
    pub fn stdout() -> Self {
        JsonLineChannel {
            writer: Mutex::new(io::stdout()),
        }
    }
}

impl<W: Write> JsonLineChannel<W> {
    pub fn new(writer: W) -> Self {
        JsonLineChannel {
            writer: Mutex::new(writer),
        }
    }

    /// Serialises `obj` as compact JSON, appends `\n`, writes and flushes atomically.
    pub fn send(&self, obj: &impl Serialize) -> io::Result<()> {
        let line = serde_json::to_string(obj)?;
        let mut w = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        w.write_all(line.as_bytes())?;
        w.write_all(b"\n")?;
        w.flush()
    }
}

/// Yields successive raw lines from `reader` until EOF. One reader only; no locking needed.
pub fn lines(reader: impl BufRead) -> impl Iterator<Item = io::Result<String>> {
    reader.lines()
}
