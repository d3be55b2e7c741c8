//! Process-wide server context.
//!
//! Owns the loop controller, registry, offload pool and shutdown
//! coordinator, and exposes the start / wait / shutdown lifecycle.

use std::io;
use std::sync::Arc;

use sockloop_core::LoopError;
use tracing::info;

use crate::event_loop::{EventLoopController, LoopControl, LoopHandle, LoopService};
use crate::offload::OffloadPool;
use crate::registry::ConnectionRegistry;
use crate::shutdown::{ShutdownCoordinator, ShutdownTrigger};

/// Shared ownership of every runtime component.
pub struct ServerContext {
    controller: Arc<EventLoopController>,
    registry: Arc<ConnectionRegistry>,
    offload: Arc<OffloadPool>,
    coordinator: Arc<ShutdownCoordinator>,
}

impl ServerContext {
    /// Build all components. The loop is not started yet.
    pub fn init(pool_size: usize) -> io::Result<Self> {
        let controller = Arc::new(EventLoopController::new());
        let control: Arc<dyn LoopControl> = controller.clone();
        Ok(Self {
            registry: Arc::new(ConnectionRegistry::new()),
            offload: Arc::new(OffloadPool::new(pool_size)?),
            coordinator: Arc::new(ShutdownCoordinator::new(control)),
            controller,
        })
    }

    /// Start the loop hosting `service`.
    ///
    /// A shutdown triggered before the loop was running is honored right away.
    pub fn start<S: LoopService>(&self, service: S) -> Result<LoopHandle, LoopError> {
        let handle = self.controller.start(service)?;
        if self.coordinator.replay_undelivered() {
            info!("shutdown triggered before start, stopping loop");
        }
        Ok(handle)
    }

    /// Block until the loop thread exits, then stop the offload workers.
    pub fn wait(&self) -> Result<(), LoopError> {
        let result = self.controller.join();
        self.offload.shutdown();
        info!(ok = result.is_ok(), "server context stopped");
        result
    }

    /// Trigger shutdown as the owner and wait for it to finish.
    pub fn shutdown(&self) -> Result<(), LoopError> {
        let _ = self.coordinator.trigger(ShutdownTrigger::Owner);
        self.wait()
    }

    /// The loop controller.
    pub fn controller(&self) -> &Arc<EventLoopController> {
        &self.controller
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The offload pool.
    pub fn offload(&self) -> &Arc<OffloadPool> {
        &self.offload
    }

    /// The shutdown coordinator.
    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }
}
