//! The loop-hosted HTTP service.
//!
//! `setup` binds the listener and spawns the Axum server on the loop;
//! `cleanup` asks it to stop accepting and waits (bounded) for it to drain.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use sockloop_core::LoopError;
use sockloop_runtime::{LoopHandle, LoopService, ServerContext, ShutdownCoordinator, ShutdownTrigger};
use sockloop_settings::{ServerSettings, SockloopSettings};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::http::{AppState, DEFAULT_INDEX, build_router};
use crate::router::{CommandRouter, RouterContext};

/// HTTP + WebSocket server hosted on the event loop.
pub struct SockloopService {
    settings: ServerSettings,
    router: Arc<CommandRouter>,
    ctx: Arc<RouterContext>,
    stop: CancellationToken,
    serve_task: Option<JoinHandle<()>>,
    listening: Option<oneshot::Sender<SocketAddr>>,
    stop_signal: Option<BoxFuture<'static, ()>>,
}

impl SockloopService {
    /// Service with the default command table.
    pub fn new(settings: &SockloopSettings, server: Arc<ServerContext>) -> Self {
        Self::with_router(settings, server, CommandRouter::with_defaults())
    }

    /// Service with a custom command table.
    pub fn with_router(
        settings: &SockloopSettings,
        server: Arc<ServerContext>,
        router: CommandRouter,
    ) -> Self {
        Self {
            settings: settings.server.clone(),
            router: Arc::new(router),
            ctx: Arc::new(RouterContext::new(server, &settings.offload)),
            stop: CancellationToken::new(),
            serve_task: None,
            listening: None,
            stop_signal: None,
        }
    }

    /// Resolves with the bound address once the listener is up.
    pub fn on_listening(&mut self) -> oneshot::Receiver<SocketAddr> {
        let (tx, rx) = oneshot::channel();
        self.listening = Some(tx);
        rx
    }

    /// Trigger shutdown when `signal` resolves, instead of on Ctrl-C/SIGTERM.
    #[must_use]
    pub fn with_stop_signal(mut self, signal: impl Future<Output = ()> + Send + 'static) -> Self {
        self.stop_signal = Some(signal.boxed());
        self
    }
}

#[async_trait]
impl LoopService for SockloopService {
    async fn setup(&mut self, handle: LoopHandle) -> Result<(), LoopError> {
        let index = load_index(self.settings.index_path.as_deref()).await?;

        let bind_addr = self.settings.bind_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|err| LoopError::Setup(format!("failed to bind {bind_addr}: {err}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| LoopError::Setup(err.to_string()))?;

        let state = AppState {
            router: self.router.clone(),
            ctx: self.ctx.clone(),
            loop_handle: handle.clone(),
            started_at: Instant::now(),
            index,
            max_message_size: self.settings.max_message_size,
        };
        let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
        let stop = self.stop.clone();
        self.serve_task = Some(tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
            {
                error!(error = %err, "http server failed");
            }
        }));
        info!(%local_addr, "sockloop server listening");

        let signal = match self.stop_signal.take() {
            Some(signal) => Some(signal),
            None if self.settings.handle_signals => Some(os_stop_signal().boxed()),
            None => None,
        };
        if let Some(signal) = signal {
            let coordinator = self.ctx.server.coordinator().clone();
            let _ = handle.spawn("signal-watch", watch_signals(coordinator, signal));
        }

        if let Some(tx) = self.listening.take() {
            let _ = tx.send(local_addr);
        }
        Ok(())
    }

    async fn cleanup(&mut self) {
        self.stop.cancel();
        let Some(task) = self.serve_task.take() else {
            return;
        };
        let limit = self.settings.cleanup_timeout();
        match tokio::time::timeout(limit, task).await {
            Ok(_) => info!("http server stopped"),
            Err(_elapsed) => warn!(timeout_ms = limit.as_millis(), "http server did not drain in time"),
        }
    }
}

async fn load_index(path: Option<&str>) -> Result<Arc<str>, LoopError> {
    match path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .map(Arc::from)
            .map_err(|err| LoopError::Setup(format!("failed to read index page {path}: {err}"))),
        None => Ok(Arc::from(DEFAULT_INDEX)),
    }
}

/// Trigger shutdown once `signal` resolves.
async fn watch_signals(coordinator: Arc<ShutdownCoordinator>, signal: impl Future<Output = ()>) {
    signal.await;
    info!("stop signal received");
    let _ = coordinator.trigger(ShutdownTrigger::Signal);
}

/// Resolves on Ctrl-C or SIGTERM. Never resolves if neither can be watched.
async fn os_stop_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                let _ = stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
