//! Console input thread.
//!
//! Reads lines from a blocking source (stdin in the binary), logs each one
//! and optionally echoes it back reversed. End of input triggers shutdown.

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::shutdown::{ShutdownCoordinator, ShutdownTrigger};

/// Name of the console thread.
pub const CONSOLE_THREAD_NAME: &str = "sockloop-console";

/// Blocking line reader feeding the shutdown coordinator.
pub struct ConsoleReader<R> {
    input: R,
    echo: Option<Box<dyn Write + Send>>,
    coordinator: Arc<ShutdownCoordinator>,
}

impl<R: BufRead + Send + 'static> ConsoleReader<R> {
    /// Reader over `input` that triggers `coordinator` at end of input.
    pub fn new(input: R, coordinator: Arc<ShutdownCoordinator>) -> Self {
        Self {
            input,
            echo: None,
            coordinator,
        }
    }

    /// Echo each line, reversed, to `out`.
    #[must_use]
    pub fn with_echo(mut self, out: impl Write + Send + 'static) -> Self {
        self.echo = Some(Box::new(out));
        self
    }

    /// Read until end of input, then trigger shutdown. Returns lines read.
    pub fn run(mut self) -> usize {
        let mut lines = 0;
        let mut buf = String::new();
        loop {
            buf.clear();
            match self.input.read_line(&mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    lines += 1;
                    let line = buf.trim_end_matches(['\r', '\n']);
                    info!(line, "console input");
                    if let Some(out) = self.echo.as_mut() {
                        let reversed: String = line.chars().rev().collect();
                        if let Err(err) = writeln!(out, "{reversed}").and_then(|()| out.flush()) {
                            debug!(error = %err, "console echo failed");
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "console read failed, treating as end of input");
                    break;
                }
            }
        }

        info!(lines, "console input closed");
        let _ = self.coordinator.trigger(ShutdownTrigger::ConsoleEof);
        lines
    }

    /// Run on a detached, named thread.
    pub fn spawn(self) -> io::Result<JoinHandle<usize>> {
        thread::Builder::new()
            .name(CONSOLE_THREAD_NAME.into())
            .spawn(move || self.run())
    }
}
