//! Built-in command handlers.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sockloop_core::{CommandError, Envelope, MessageCommand, SessionId};
use sockloop_runtime::{RemoteContext, ShutdownTrigger};
use tracing::{debug, info};

use super::{CommandHandler, CommandRouter, Reply, RouterContext};

/// Register every built-in handler.
pub fn register_all(router: &mut CommandRouter) {
    router.register("connect", ConnectHandler);
    router.register("disconnect", DisconnectHandler);
    router.register("short_request", ShortRequestHandler);
    router.register("long_request", LongRequestHandler);
    router.register("shutdown", ShutdownHandler);
    router.register("connections", ConnectionsHandler);
    router.register("message", MessageHandler);
}

/// The blocking stand-in for slow synchronous work.
pub fn block_for(delay: Duration) {
    debug!(delay_ms = delay.as_millis(), "blocking");
    thread::sleep(delay);
}

fn shutdown_action(ctx: &RouterContext) -> impl FnOnce() + Send + 'static {
    let coordinator = ctx.server.coordinator().clone();
    move || {
        let _ = coordinator.trigger(ShutdownTrigger::Command);
    }
}

/// Adds the session to the registry.
pub struct ConnectHandler;

#[async_trait]
impl CommandHandler for ConnectHandler {
    async fn handle(
        &self,
        session: &SessionId,
        data: Value,
        ctx: &RouterContext,
    ) -> Result<Reply, CommandError> {
        let remote: RemoteContext = match data {
            Value::Null => BTreeMap::new(),
            other => serde_json::from_value(other)
                .map_err(|err| CommandError::Malformed(format!("remote context: {err}")))?,
        };
        // Duplicates are logged by the registry; the first entry stays.
        let _ = ctx.server.registry().add(session.clone(), remote);
        Ok(Reply::none())
    }
}

/// Removes the session from the registry.
pub struct DisconnectHandler;

#[async_trait]
impl CommandHandler for DisconnectHandler {
    async fn handle(
        &self,
        session: &SessionId,
        _data: Value,
        ctx: &RouterContext,
    ) -> Result<Reply, CommandError> {
        let _ = ctx.server.registry().remove(session);
        Ok(Reply::none())
    }
}

/// Immediate acknowledgement.
pub struct ShortRequestHandler;

#[async_trait]
impl CommandHandler for ShortRequestHandler {
    async fn handle(
        &self,
        _session: &SessionId,
        _data: Value,
        _ctx: &RouterContext,
    ) -> Result<Reply, CommandError> {
        Ok(Reply::envelope(Envelope::ok("short_request")))
    }
}

/// Runs [`block_for`] on the offload pool, then acknowledges.
pub struct LongRequestHandler;

#[async_trait]
impl CommandHandler for LongRequestHandler {
    async fn handle(
        &self,
        session: &SessionId,
        _data: Value,
        ctx: &RouterContext,
    ) -> Result<Reply, CommandError> {
        let delay = ctx.long_request_delay;
        let job = ctx.server.offload().submit(move || {
            block_for(delay);
            Ok::<_, Infallible>(())
        });
        debug!(session_id = %session, job_id = %job.id(), "long request offloaded");

        match ctx.long_request_timeout {
            Some(limit) => job.with_timeout(limit).await?,
            None => job.await?,
        }
        Ok(Reply::envelope(Envelope::ok("long_request")))
    }
}

/// Acknowledges, then starts shutdown.
pub struct ShutdownHandler;

#[async_trait]
impl CommandHandler for ShutdownHandler {
    async fn handle(
        &self,
        session: &SessionId,
        _data: Value,
        ctx: &RouterContext,
    ) -> Result<Reply, CommandError> {
        info!(session_id = %session, "shutdown requested by client");
        Ok(Reply::envelope(Envelope::ok("shutdown")).then(shutdown_action(ctx)))
    }
}

/// Lists connected session ids.
pub struct ConnectionsHandler;

#[async_trait]
impl CommandHandler for ConnectionsHandler {
    async fn handle(
        &self,
        _session: &SessionId,
        _data: Value,
        ctx: &RouterContext,
    ) -> Result<Reply, CommandError> {
        let ids: Vec<Value> = ctx
            .server
            .registry()
            .snapshot_ids()
            .into_iter()
            .map(|id| Value::String(id.into_inner()))
            .collect();
        Ok(Reply::envelope(Envelope::ok_with(
            "connections",
            Value::Array(ids),
        )))
    }
}

/// Free-text messages: `CMD:SHUTDOWN`, other `CMD:` commands, or text to echo reversed.
pub struct MessageHandler;

#[async_trait]
impl CommandHandler for MessageHandler {
    async fn handle(
        &self,
        session: &SessionId,
        data: Value,
        ctx: &RouterContext,
    ) -> Result<Reply, CommandError> {
        let Value::String(text) = data else {
            return Err(CommandError::Malformed("message payload must be text".into()));
        };

        match MessageCommand::parse(&text) {
            MessageCommand::Shutdown => {
                info!(session_id = %session, "shutdown command received");
                Ok(Reply::envelope(Envelope::ok("message")).then(shutdown_action(ctx)))
            }
            MessageCommand::Unknown(cmd) => {
                Err(CommandError::Malformed(format!("unknown command '{cmd}'")))
            }
            MessageCommand::Text(text) => {
                let reversed: String = text.chars().rev().collect();
                Ok(Reply::envelope(Envelope::ok_with(
                    "message",
                    Value::String(reversed),
                )))
            }
        }
    }
}
