//! # sockloop-server
//!
//! The outer surface of sockloop: command routing, the WebSocket session
//! driver, and the thin Axum glue serving the index page, `/health` and
//! `/ws`. Everything here runs on the event loop thread owned by
//! [`sockloop_runtime::EventLoopController`].

#![deny(unsafe_code)]

pub mod health;
pub mod http;
pub mod router;
pub mod service;
pub mod websocket;

pub use router::{CommandHandler, CommandRouter, Reply, RouterContext};
pub use service::SockloopService;
