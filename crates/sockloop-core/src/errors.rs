//! Error hierarchy.
//!
//! Session and command errors are recovered locally (logged, answered with
//! an error envelope). Loop errors are the only ones that escalate to the
//! owning process.

use std::time::Duration;

use thiserror::Error;

use crate::ids::SessionId;

/// Errors raised by the connection registry.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// A connect arrived for an id that is already registered.
    #[error("session {0} is already connected")]
    Duplicate(SessionId),
    /// A disconnect or event arrived for an id that is not registered.
    #[error("session {0} is not connected")]
    Unknown(SessionId),
}

/// Errors surfaced to a handler awaiting offloaded work.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum OffloadError {
    /// The job was cancelled before it produced a result.
    #[error("offloaded job was cancelled")]
    Cancelled,
    /// The job ran and returned an error.
    #[error("offloaded job failed: {0}")]
    Failed(String),
    /// The job panicked on its worker thread.
    #[error("offloaded job panicked: {0}")]
    Panicked(String),
    /// The result did not arrive within the allowed time.
    #[error("offloaded job timed out after {0:?}")]
    TimedOut(Duration),
    /// The pool was shut down before the job could run.
    #[error("offload pool is closed")]
    PoolClosed,
}

/// Errors raised while routing an inbound event.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    /// The frame could not be understood.
    #[error("malformed command: {0}")]
    Malformed(String),
    /// The frame named an event with no registered handler.
    #[error("unknown event '{0}'")]
    UnknownEvent(String),
    /// Offloaded work backing the command failed.
    #[error(transparent)]
    Offload(#[from] OffloadError),
}

impl CommandError {
    /// Response code reported in the error envelope.
    pub fn response_code(&self) -> u16 {
        match self {
            Self::Malformed(_) | Self::UnknownEvent(_) => 400,
            Self::Offload(OffloadError::TimedOut(_)) => 504,
            Self::Offload(_) => 500,
        }
    }

    /// Short label used for the `error_type` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::UnknownEvent(_) => "unknown_event",
            Self::Offload(OffloadError::TimedOut(_)) => "timeout",
            Self::Offload(_) => "offload",
        }
    }
}

/// Errors raised by the event loop controller.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LoopError {
    /// `start` was called on a controller that already left `Created`.
    #[error("event loop was already started")]
    AlreadyStarted,
    /// The loop thread could not be spawned.
    #[error("failed to spawn event loop thread: {0}")]
    Spawn(String),
    /// The async runtime could not be built.
    #[error("failed to build event loop runtime: {0}")]
    Runtime(String),
    /// The hosted service failed during setup.
    #[error("event loop setup failed: {0}")]
    Setup(String),
    /// The loop stopped because of an unrecoverable fault.
    #[error("event loop fault: {0}")]
    Fault(String),
}
