//! Shared live terminal buffer.
//!
//! Stage scripts run attached to a pseudo-terminal; their combined output is
//! streamed into one buffer that the install page's console renders. The
//! buffer keeps both a vt100 screen (for display) and the raw transcript
//! (for logs and failure reports).

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::debug;

const ROWS: u16 = 24;
const COLS: u16 = 80;
const SCROLLBACK: usize = 10_000;

pub struct TerminalSink {
    parser: Mutex<vt100::Parser>,
    transcript: Mutex<String>,
}

impl Default for TerminalSink {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalSink {
    pub fn new() -> Self {
        Self {
            parser: Mutex::new(vt100::Parser::new(ROWS, COLS, SCROLLBACK)),
            transcript: Mutex::new(String::new()),
        }
    }

    /// Feed raw pty bytes into the buffer.
    pub fn feed(&self, bytes: &[u8]) {
        self.parser.lock().expect("terminal parser lock").process(bytes);
        self.transcript
            .lock()
            .expect("terminal transcript lock")
            .push_str(&String::from_utf8_lossy(bytes));
    }

    /// Current rendered screen contents.
    pub fn screen_contents(&self) -> String {
        self.parser.lock().expect("terminal parser lock").screen().contents()
    }

    /// Everything ever written, escape sequences stripped by lossy decoding.
    pub fn transcript(&self) -> String {
        self.transcript.lock().expect("terminal transcript lock").clone()
    }

    /// Drain `reader` into this sink on a background thread until EOF.
    ///
    /// EOF arrives when the child side of the pty closes; the thread then
    /// exits on its own, so the handle is detached.
    pub fn attach_reader(self: Arc<Self>, mut reader: Box<dyn Read + Send>) {
        let sink = self;
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => sink.feed(&buf[..n]),
                    Err(e) => {
                        debug!("terminal reader finished: {e}");
                        break;
                    }
                }
            }
        });
    }
}
