//! # sockloop-runtime
//!
//! The multi-thread lifecycle machinery behind the sockloop server.
//!
//! - [`event_loop::EventLoopController`] hosts a current-thread tokio runtime
//!   on a dedicated thread and accepts cross-thread commands through a
//!   [`event_loop::LoopHandle`]
//! - [`offload::OffloadPool`] runs blocking closures on a fixed set of worker
//!   threads and hands results back as futures
//! - [`registry::ConnectionRegistry`] tracks live client sessions
//! - [`shutdown::ShutdownCoordinator`] turns the first of several shutdown
//!   triggers into one cancel pass plus one stop request
//! - [`console::ConsoleReader`] is the blocking stdin thread
//! - [`context::ServerContext`] owns all of the above

#![deny(unsafe_code)]

pub mod console;
pub mod context;
pub mod event_loop;
pub mod offload;
pub mod registry;
pub mod shutdown;

pub use console::ConsoleReader;
pub use context::ServerContext;
pub use event_loop::{EventLoopController, LoopControl, LoopHandle, LoopService, LoopState};
pub use offload::{OffloadHandle, OffloadPool};
pub use registry::{Connection, ConnectionRegistry, RemoteContext};
pub use shutdown::{ShutdownCoordinator, ShutdownTrigger};

/// Render a caught panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
