//! Command routing.
//!
//! Inbound events are looked up by name in an explicit registration table
//! built by [`CommandRouter::with_defaults`]. Handlers return a [`Reply`]:
//! an optional envelope plus an optional action the session driver runs
//! after the envelope has been written, which is how `shutdown` manages to
//! acknowledge before tearing the loop down.

pub mod handlers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde_json::{Value, json};
use sockloop_core::inbound::RESERVED_EVENTS;
use sockloop_core::{CommandError, Envelope, InboundFrame, SessionError, SessionId};
use sockloop_runtime::{RemoteContext, ServerContext};
use sockloop_settings::OffloadSettings;
use tracing::{debug, warn};

/// Action run by the session driver once the reply has been flushed.
pub type AfterSend = Box<dyn FnOnce() + Send + 'static>;

/// Outcome of handling one event.
#[derive(Default)]
pub struct Reply {
    envelope: Option<Envelope>,
    after_send: Option<AfterSend>,
}

impl Reply {
    /// No envelope, no action.
    pub fn none() -> Self {
        Self::default()
    }

    /// Reply with `envelope`.
    pub fn envelope(envelope: Envelope) -> Self {
        Self {
            envelope: Some(envelope),
            after_send: None,
        }
    }

    /// Run `action` after the envelope is sent.
    #[must_use]
    pub fn then(mut self, action: impl FnOnce() + Send + 'static) -> Self {
        self.after_send = Some(Box::new(action));
        self
    }

    /// Envelope, if any.
    pub fn envelope_ref(&self) -> Option<&Envelope> {
        self.envelope.as_ref()
    }

    /// Whether an after-send action is attached.
    pub fn has_after_send(&self) -> bool {
        self.after_send.is_some()
    }

    /// Split into envelope and action.
    pub fn into_parts(self) -> (Option<Envelope>, Option<AfterSend>) {
        (self.envelope, self.after_send)
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reply")
            .field("envelope", &self.envelope)
            .field("after_send", &self.after_send.is_some())
            .finish()
    }
}

/// State shared by every handler.
pub struct RouterContext {
    /// Runtime components.
    pub server: Arc<ServerContext>,
    /// Blocking delay performed by `long_request`.
    pub long_request_delay: Duration,
    /// Upper bound on waiting for `long_request`.
    pub long_request_timeout: Option<Duration>,
}

impl RouterContext {
    /// Build from offload settings.
    pub fn new(server: Arc<ServerContext>, offload: &OffloadSettings) -> Self {
        Self {
            server,
            long_request_delay: offload.long_request_delay(),
            long_request_timeout: offload.long_request_timeout(),
        }
    }
}

/// Handler for one named event.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle `data` sent by `session`.
    async fn handle(
        &self,
        session: &SessionId,
        data: Value,
        ctx: &RouterContext,
    ) -> Result<Reply, CommandError>;
}

/// Event name to handler table.
pub struct CommandRouter {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Router with every built-in event registered.
    pub fn with_defaults() -> Self {
        let mut router = Self::new();
        handlers::register_all(&mut router);
        router
    }

    /// Register a handler for an event name.
    pub fn register(&mut self, event: &str, handler: impl CommandHandler + 'static) {
        let _ = self.handlers.insert(event.to_owned(), Arc::new(handler));
    }

    /// Run the `connect` lifecycle event.
    pub async fn connect(
        &self,
        session: &SessionId,
        remote: RemoteContext,
        ctx: &RouterContext,
    ) -> Result<(), SessionError> {
        let data = json!(remote);
        if let Err(err) = self.invoke("connect", session, data, ctx).await {
            warn!(session_id = %session, error = %err, "connect failed");
        }
        if ctx.server.registry().contains(session) {
            Ok(())
        } else {
            Err(SessionError::Unknown(session.clone()))
        }
    }

    /// Run the `disconnect` lifecycle event.
    pub async fn disconnect(&self, session: &SessionId, ctx: &RouterContext) {
        if let Err(err) = self.invoke("disconnect", session, Value::Null, ctx).await {
            warn!(session_id = %session, error = %err, "disconnect failed");
        }
    }

    /// Decode and dispatch one text frame.
    pub async fn handle_text(&self, session: &SessionId, text: &str, ctx: &RouterContext) -> Reply {
        match InboundFrame::parse(text) {
            Ok(frame) => self.dispatch(session, frame, ctx).await,
            Err(err) => {
                if !ctx.server.registry().contains(session) {
                    warn!(session_id = %session, "frame from unknown session ignored");
                    return Reply::none();
                }
                let _ = ctx.server.registry().touch(session, Value::String(text.to_owned()));
                counter!("command_errors_total", "event" => "invalid", "error_type" => err.kind()).increment(1);
                debug!(session_id = %session, error = %err, "malformed frame");
                Reply::envelope(Envelope::for_error(&err, "invalid"))
            }
        }
    }

    /// Dispatch a decoded event from a connected session.
    ///
    /// Events from unknown sessions are logged and dropped without a reply.
    pub async fn dispatch(&self, session: &SessionId, frame: InboundFrame, ctx: &RouterContext) -> Reply {
        let InboundFrame { event, data } = frame;

        if ctx
            .server
            .registry()
            .touch(session, json!({"event": event, "data": data}))
            .is_err()
        {
            warn!(session_id = %session, event, "event from unknown session ignored");
            return Reply::none();
        }

        if RESERVED_EVENTS.contains(&event.as_str()) {
            let err = CommandError::Malformed(format!("'{event}' is raised by the transport"));
            counter!("command_errors_total", "event" => event.clone(), "error_type" => err.kind()).increment(1);
            return Reply::envelope(Envelope::for_error(&err, &event));
        }

        match self.invoke(&event, session, data, ctx).await {
            Ok(reply) => reply,
            Err(err) => {
                debug!(session_id = %session, event, error = %err, "command failed");
                Reply::envelope(Envelope::for_error(&err, &event))
            }
        }
    }

    async fn invoke(
        &self,
        event: &str,
        session: &SessionId,
        data: Value,
        ctx: &RouterContext,
    ) -> Result<Reply, CommandError> {
        counter!("commands_total", "event" => event.to_owned()).increment(1);

        let Some(handler) = self.handlers.get(event) else {
            let err = CommandError::UnknownEvent(event.to_owned());
            counter!("command_errors_total", "event" => event.to_owned(), "error_type" => err.kind()).increment(1);
            return Err(err);
        };

        let start = Instant::now();
        let result = handler.handle(session, data, ctx).await;
        histogram!("command_duration_seconds", "event" => event.to_owned())
            .record(start.elapsed().as_secs_f64());

        if let Err(err) = &result {
            counter!("command_errors_total", "event" => event.to_owned(), "error_type" => err.kind()).increment(1);
        }
        result
    }

    /// Registered event names (sorted).
    pub fn events(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether an event has a handler.
    pub fn has_event(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }
}

impl Default for CommandRouter {
    fn default() -> Self {
        Self::new()
    }
}
