//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;
use sockloop_runtime::{LoopState, ServerContext};

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while the loop is running, `"stopping"` otherwise.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live WebSocket sessions.
    pub connections: usize,
    /// Event loop lifecycle state.
    pub loop_state: String,
    /// Offloaded jobs waiting for a worker.
    pub offload_queued: usize,
    /// Offloaded jobs currently running.
    pub offload_active: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, ctx: &ServerContext) -> HealthResponse {
    let state = ctx.controller().state();
    let status = if state == LoopState::Running { "ok" } else { "stopping" };
    HealthResponse {
        status: status.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: ctx.registry().len(),
        loop_state: state.label().into(),
        offload_queued: ctx.offload().queued(),
        offload_active: ctx.offload().active(),
    }
}
