//! WebSocket transport: one session task per socket.

pub mod session;

pub use session::run_ws_session;
