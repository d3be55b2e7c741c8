//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use sockloop_core::SessionId;
use sockloop_runtime::RemoteContext;
use tracing::{debug, info, instrument, warn};

use crate::router::{CommandRouter, Reply, RouterContext};

/// Interval between server-initiated Ping frames.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong before considering the client dead.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Tracks when the peer last proved it was alive.
#[derive(Debug)]
pub struct Liveness {
    last_seen: Instant,
    timeout: Duration,
}

impl Liveness {
    /// Start tracking now.
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_seen: Instant::now(),
            timeout,
        }
    }

    /// Record activity from the peer.
    pub fn mark_alive(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Whether the peer has been silent for longer than the timeout.
    pub fn is_expired(&self) -> bool {
        self.last_seen.elapsed() > self.timeout
    }
}

/// Write the reply envelope, then run its after-send action.
///
/// The action runs even when the write fails, so a `shutdown` from a peer
/// that has already gone away still stops the server. Returns whether the
/// write succeeded.
pub async fn deliver_reply<S>(sink: &mut S, reply: Reply) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let (envelope, after_send) = reply.into_parts();
    let mut written = true;
    if let Some(envelope) = envelope {
        if let Err(err) = sink.send(Message::Text(envelope.to_json().into())).await {
            debug!(error = %err, "reply write failed");
            written = false;
        }
    }
    if let Some(action) = after_send {
        action();
    }
    written
}

/// Run a WebSocket session for a connected client.
///
/// 1. Raises `connect` for the session
/// 2. Routes each text frame and writes the reply inline, so one session's
///    events are handled strictly in arrival order
/// 3. Runs any after-send action once the reply is flushed
/// 4. Sends periodic Ping frames and drops unresponsive clients
/// 5. Raises `disconnect` when the socket closes, errors or times out
#[instrument(skip_all, fields(session_id = %session))]
pub async fn run_ws_session(
    ws: WebSocket,
    session: SessionId,
    remote: RemoteContext,
    router: Arc<CommandRouter>,
    ctx: Arc<RouterContext>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    if let Err(err) = router.connect(&session, remote, &ctx).await {
        warn!(error = %err, "session rejected");
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    }

    let connection_start = Instant::now();
    counter!("ws_connections_total").increment(1);
    gauge!("ws_sessions_active").increment(1.0);

    let mut liveness = Liveness::new(PONG_TIMEOUT);
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // Skip the immediate first tick
    let _ = ping_interval.tick().await;

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Binary(data))) => {
                        liveness.mark_alive();
                        if let Ok(text) = std::str::from_utf8(&data) {
                            text.to_owned()
                        } else {
                            debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                            continue;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        liveness.mark_alive();
                        continue;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("client sent close frame");
                        break;
                    }
                    Some(Err(err)) => {
                        debug!(error = %err, "socket error");
                        break;
                    }
                    None => break,
                };
                liveness.mark_alive();

                let reply = router.handle_text(&session, &text, &ctx).await;
                if !deliver_reply(&mut ws_tx, reply).await {
                    debug!("failed to write reply, closing session");
                    break;
                }
            }
            _ = ping_interval.tick() => {
                if liveness.is_expired() {
                    warn!("client unresponsive for {:?}, disconnecting", PONG_TIMEOUT);
                    break;
                }
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    router.disconnect(&session, &ctx).await;
    gauge!("ws_sessions_active").decrement(1.0);
    histogram!("ws_connection_duration_seconds").record(connection_start.elapsed().as_secs_f64());
    info!("session closed");
}

#[cfg(test)]
mod tests {
    // Socket-level behavior is covered by tests/integration.rs.
    use super::*;
    use crate::router::test_helpers::{connect, make_context};
    use futures::channel::mpsc;
    use sockloop_core::{Envelope, InboundFrame};
    use sockloop_runtime::ShutdownTrigger;

    #[tokio::test]
    async fn reply_is_written_before_action_runs() {
        let router = CommandRouter::with_defaults();
        let ctx = make_context(1, 1);
        let id = connect(&router, &ctx, "a").await;
        let reply = router
            .dispatch(&id, InboundFrame::new("shutdown", serde_json::Value::Null), &ctx)
            .await;

        let (mut tx, mut rx) = mpsc::unbounded::<Message>();
        assert!(deliver_reply(&mut tx, reply).await);

        let written = rx.next().await.unwrap();
        assert_eq!(
            written,
            Message::Text(Envelope::ok("shutdown").to_json().into())
        );
        assert_eq!(
            ctx.server.coordinator().source(),
            Some(ShutdownTrigger::Command)
        );
    }

    #[tokio::test]
    async fn shutdown_fires_when_ack_cannot_be_written() {
        let router = CommandRouter::with_defaults();
        let ctx = make_context(1, 1);
        let id = connect(&router, &ctx, "a").await;
        let reply = router.handle_text(&id, "CMD:SHUTDOWN", &ctx).await;

        let (mut tx, rx) = mpsc::unbounded::<Message>();
        drop(rx);
        assert!(!deliver_reply(&mut tx, reply).await);
        assert_eq!(
            ctx.server.coordinator().source(),
            Some(ShutdownTrigger::Command)
        );
    }

    #[tokio::test]
    async fn empty_reply_writes_nothing() {
        let (mut tx, mut rx) = mpsc::unbounded::<Message>();
        assert!(deliver_reply(&mut tx, Reply::none()).await);
        drop(tx);
        assert!(rx.next().await.is_none());
    }

    #[test]
    fn fresh_liveness_is_not_expired() {
        let liveness = Liveness::new(Duration::from_secs(60));
        assert!(!liveness.is_expired());
    }

    #[test]
    fn liveness_expires_and_recovers() {
        let mut liveness = Liveness::new(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));
        assert!(liveness.is_expired());
        liveness.mark_alive();
        assert!(!liveness.is_expired());
    }

    #[test]
    fn pong_timeout_spans_two_ping_intervals() {
        assert_eq!(PONG_TIMEOUT, PING_INTERVAL * 2);
    }
}
