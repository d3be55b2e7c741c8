//! Graceful shutdown coordination.
//!
//! Any thread may call [`ShutdownCoordinator::trigger`]. The first call wins
//! and performs exactly one cancellation pass followed by one stop request
//! on the loop; every later call is a no-op returning `false`.
//!
//! A trigger that fires before the loop is running cannot reach it. The
//! coordinator remembers that and [`ShutdownCoordinator::replay_undelivered`]
//! sends the pass once the loop is up.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::event_loop::LoopControl;

/// Where a shutdown request came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownTrigger {
    /// Console input reached end of stream.
    ConsoleEof,
    /// A client sent `shutdown` or `CMD:SHUTDOWN`.
    Command,
    /// The process received Ctrl-C or SIGTERM.
    Signal,
    /// The owning code asked for shutdown directly.
    Owner,
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ConsoleEof => "console_eof",
            Self::Command => "command",
            Self::Signal => "signal",
            Self::Owner => "owner",
        })
    }
}

/// Funnels every shutdown trigger into a single loop termination.
pub struct ShutdownCoordinator {
    fired: AtomicBool,
    delivered: Mutex<bool>,
    source: OnceLock<ShutdownTrigger>,
    token: CancellationToken,
    control: Arc<dyn LoopControl>,
}

impl ShutdownCoordinator {
    /// Create a coordinator driving `control`.
    pub fn new(control: Arc<dyn LoopControl>) -> Self {
        Self {
            fired: AtomicBool::new(false),
            delivered: Mutex::new(false),
            source: OnceLock::new(),
            token: CancellationToken::new(),
            control,
        }
    }

    /// Request shutdown. Returns `true` only for the call that performed it.
    pub fn trigger(&self, source: ShutdownTrigger) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(%source, "shutdown already in progress");
            return false;
        }

        let _ = self.source.set(source);
        info!(%source, "shutdown triggered");
        self.token.cancel();
        self.deliver();
        true
    }

    /// Send the cancel pass and stop request if a fired trigger could not.
    ///
    /// Call once the loop is running. Returns `true` when this call
    /// delivered them.
    pub fn replay_undelivered(&self) -> bool {
        if !self.is_shutting_down() {
            return false;
        }
        self.deliver()
    }

    fn deliver(&self) -> bool {
        let mut delivered = self.delivered.lock();
        if *delivered {
            return false;
        }
        let cancelled = self.control.cancel_all_pending();
        let stopping = self.control.request_stop();
        debug!(cancelled, stopping, "shutdown commands enqueued");
        *delivered = stopping;
        stopping
    }

    /// Trigger that won, once shutdown has started.
    pub fn source(&self) -> Option<ShutdownTrigger> {
        self.source.get().copied()
    }

    /// Whether shutdown has started.
    pub fn is_shutting_down(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Token cancelled when shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}
