//! # sockloop-core
//!
//! Foundation types shared by every sockloop crate.
//!
//! - [`ids`]: branded ID newtypes ([`SessionId`], [`JobId`])
//! - [`envelope`]: the JSON response envelope sent back to clients
//! - [`inbound`]: parsing of inbound text frames into named events
//! - [`errors`]: the error hierarchy for sessions, commands, offloaded work and the loop

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod inbound;

pub use envelope::Envelope;
pub use errors::{CommandError, LoopError, OffloadError, SessionError};
pub use ids::{JobId, SessionId};
pub use inbound::{InboundFrame, MessageCommand};
