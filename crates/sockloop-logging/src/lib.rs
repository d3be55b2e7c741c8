//! # sockloop-logging
//!
//! Structured logging with `tracing`.
//!
//! - [`init_subscriber`] writes compact human-readable lines to stderr
//! - [`init_subscriber_with_file`] writes the same lines to a log file,
//!   truncated at startup
//! - [`capture_logs`] installs a thread-local capturing subscriber for tests
//!
//! In both cases `RUST_LOG` takes precedence over the configured level.

#![deny(unsafe_code)]

pub mod test_utils;

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

pub use test_utils::{CapturedEvent, CapturedLogs, capture_logs};

/// Build the level filter, preferring `RUST_LOG` when set.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize the global tracing subscriber with stderr output.
///
/// Call once at application startup. Subsequent calls are no-ops.
pub fn init_subscriber(level: &str) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(true)
        .with_thread_names(true)
        .with_writer(io::stderr)
        .compact();

    // set_global_default is a no-op if already set
    let _ = subscriber.try_init();
}

/// Initialize the global tracing subscriber writing to `path`.
///
/// The file is created or truncated. Fails only if the file cannot be opened.
pub fn init_subscriber_with_file(level: &str, path: &Path) -> io::Result<()> {
    let file = File::create(path)?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(true)
        .with_thread_names(true)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .compact();

    let _ = subscriber.try_init();
    Ok(())
}
