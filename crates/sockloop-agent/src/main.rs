//! # sockloop-agent
//!
//! sockloop server binary. Loads settings, starts the event loop thread
//! hosting the HTTP/WebSocket server, reads the console on its own thread
//! and waits for the loop to stop.

#![deny(unsafe_code)]

use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sockloop_runtime::{ConsoleReader, ServerContext};
use sockloop_server::SockloopService;
use sockloop_settings::SockloopSettings;

/// sockloop event server.
#[derive(Parser, Debug)]
#[command(name = "sockloop", about = "WebSocket event server on a dedicated event loop thread")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the settings file (defaults to `~/.sockloop/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Number of offload worker threads.
    #[arg(long)]
    pool_size: Option<usize>,

    /// Simulated blocking delay for `long_request`, in milliseconds.
    #[arg(long)]
    long_delay_ms: Option<u64>,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log level filter (`RUST_LOG` still wins).
    #[arg(long)]
    log_level: Option<String>,

    /// Raise verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Echo console lines back reversed.
    #[arg(long)]
    reverse_echo: bool,
}

impl Cli {
    /// Overlay command line flags on loaded settings.
    fn apply(&self, settings: &mut SockloopSettings) {
        if let Some(ref host) = self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(size) = self.pool_size {
            settings.offload.pool_size = size;
        }
        if let Some(ms) = self.long_delay_ms {
            settings.offload.long_request_delay_ms = ms;
        }
        if let Some(ref path) = self.log_file {
            settings.logging.file = Some(path.to_string_lossy().into_owned());
        }
        if let Some(ref level) = self.log_level {
            settings.logging.level.clone_from(level);
        }
        match self.verbose {
            0 => {}
            1 => settings.logging.level = "debug".into(),
            _ => settings.logging.level = "trace".into(),
        }
        if self.reverse_echo {
            settings.console.reverse_echo = true;
        }
    }
}

fn load_settings(cli: &Cli) -> Result<SockloopSettings> {
    let path = cli
        .settings
        .clone()
        .unwrap_or_else(sockloop_settings::settings_path);
    let mut settings = sockloop_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid command line settings")?;
    Ok(settings)
}

fn init_logging(settings: &SockloopSettings) -> Result<()> {
    match settings.logging.file.as_deref() {
        Some(file) => {
            sockloop_logging::init_subscriber_with_file(&settings.logging.level, Path::new(file))
                .with_context(|| format!("Failed to open log file {file}"))
        }
        None => {
            sockloop_logging::init_subscriber(&settings.logging.level);
            Ok(())
        }
    }
}

fn ui_banner(addr: SocketAddr) -> String {
    format!("UI on http://{addr}")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    init_logging(&settings)?;

    let ctx = Arc::new(
        ServerContext::init(settings.offload.pool_size)
            .context("Failed to start offload workers")?,
    );
    let mut service = SockloopService::new(&settings, ctx.clone());
    let listening = service.on_listening();
    let _handle = ctx.start(service).context("Failed to start event loop")?;

    // The sender is dropped without a value when setup fails.
    let Ok(addr) = listening.blocking_recv() else {
        return ctx.wait().context("Event loop failed during setup");
    };
    println!("{}", ui_banner(addr));

    let mut console = ConsoleReader::new(BufReader::new(io::stdin()), ctx.coordinator().clone());
    if settings.console.reverse_echo {
        console = console.with_echo(io::stdout());
    }
    // Detached: stdin may stay open after the loop stops.
    let _console = console.spawn().context("Failed to spawn console thread")?;

    tracing::info!(%addr, "sockloop started");

    let result = ctx.wait();
    if let Some(source) = ctx.coordinator().source() {
        tracing::info!(%source, "shutdown complete");
    }
    result.context("Event loop stopped abnormally")?;
    println!("Goodbye");
    Ok(())
}
