//! Event loop controller.
//!
//! Owns one cooperative event loop (a current-thread tokio runtime) running
//! on a dedicated, named OS thread. Other threads never touch the runtime
//! directly; they enqueue [`LoopCommand`]s through a [`LoopHandle`] and the
//! loop thread executes them in FIFO order.
//!
//! Lifecycle:
//!
//! ```text
//! Created ──start──▶ Running ──request_stop──▶ StopRequested ──▶ Stopped { fault }
//!                       └───────────── setup error / panic ────────▶ Stopped { fault: Some }
//! ```
//!
//! After the command loop ends the state becomes `Stopped`, the hosted
//! [`LoopService`] runs its cleanup, the runtime is shut down and the
//! published handle is cleared.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sockloop_core::LoopError;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::panic_message;

/// Default name of the loop thread.
pub const DEFAULT_THREAD_NAME: &str = "sockloop-event-loop";

/// How long runtime shutdown waits for leftover tasks.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

type BoxTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Commands accepted by the loop thread.
enum LoopCommand {
    /// Spawn a tracked task.
    Spawn { name: &'static str, task: BoxTask },
    /// Run a closure on the loop thread.
    Call(Box<dyn FnOnce() + Send + 'static>),
    /// Abort every tracked task.
    CancelAll,
    /// Leave the command loop.
    Stop,
}

/// Lifecycle state of the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopState {
    /// Not started yet.
    Created,
    /// The loop thread is executing commands.
    Running,
    /// A stop command has been enqueued.
    StopRequested,
    /// The loop has left its command loop. `fault` is set when it stopped abnormally.
    Stopped {
        /// Reason the loop faulted, if it did.
        fault: Option<String>,
    },
}

impl LoopState {
    /// Short label for logs and health output.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::StopRequested => "stop_requested",
            Self::Stopped { fault: None } => "stopped",
            Self::Stopped { fault: Some(_) } => "faulted",
        }
    }
}

/// Thread-safe handle for scheduling work on the loop.
#[derive(Clone, Debug)]
pub struct LoopHandle {
    tx: mpsc::UnboundedSender<LoopCommand>,
    thread: ThreadId,
}

impl std::fmt::Debug for LoopCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn { name, .. } => write!(f, "Spawn({name})"),
            Self::Call(_) => f.write_str("Call"),
            Self::CancelAll => f.write_str("CancelAll"),
            Self::Stop => f.write_str("Stop"),
        }
    }
}

impl LoopHandle {
    /// Spawn `task` on the loop as a tracked task.
    ///
    /// Tracked tasks are aborted by a cancel-all pass. Returns `false` if
    /// the loop has already exited.
    pub fn spawn<F>(&self, name: &'static str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.send(LoopCommand::Spawn {
            name,
            task: Box::pin(task),
        })
    }

    /// Run `f` on the loop thread as soon as it reaches the command.
    pub fn call_soon<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.send(LoopCommand::Call(Box::new(f)))
    }

    /// Whether the caller is running on the loop thread.
    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Whether the loop has exited and dropped its command receiver.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, command: LoopCommand) -> bool {
        match self.tx.send(command) {
            Ok(()) => true,
            Err(mpsc::error::SendError(command)) => {
                debug!(?command, "loop already exited, command dropped");
                false
            }
        }
    }
}

/// Work hosted on the loop thread.
#[async_trait]
pub trait LoopService: Send + 'static {
    /// Runs once on the loop thread before any command is processed.
    async fn setup(&mut self, handle: LoopHandle) -> Result<(), LoopError>;

    /// Runs once on the loop thread after the loop reached `Stopped`.
    async fn cleanup(&mut self) {}
}

/// The two operations the shutdown coordinator needs from a loop.
#[cfg_attr(test, mockall::automock)]
pub trait LoopControl: Send + Sync {
    /// Abort every tracked task on the loop.
    fn cancel_all_pending(&self) -> bool;
    /// Ask the loop to stop.
    fn request_stop(&self) -> bool;
}

struct Shared {
    state: Mutex<LoopState>,
    handle: Mutex<Option<LoopHandle>>,
}

impl Shared {
    fn publish(&self, handle: LoopHandle) {
        let mut state = self.state.lock();
        *state = LoopState::Running;
        *self.handle.lock() = Some(handle);
    }

    fn mark_stopped(&self, fault: Option<String>) {
        let mut state = self.state.lock();
        let fault = match &*state {
            LoopState::Stopped { fault: Some(previous) } => Some(previous.clone()),
            _ => fault,
        };
        *state = LoopState::Stopped { fault };
    }

    fn finish(&self, fault: Option<String>) {
        self.mark_stopped(fault);
        *self.handle.lock() = None;
    }
}

/// Owns the loop thread and its lifecycle.
pub struct EventLoopController {
    thread_name: String,
    started: AtomicBool,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    stop_requests: AtomicUsize,
    cancel_passes: AtomicUsize,
}

impl EventLoopController {
    /// Create a controller in the `Created` state.
    pub fn new() -> Self {
        Self::with_thread_name(DEFAULT_THREAD_NAME)
    }

    /// Create a controller whose loop thread gets `name`.
    pub fn with_thread_name(name: impl Into<String>) -> Self {
        Self {
            thread_name: name.into(),
            started: AtomicBool::new(false),
            shared: Arc::new(Shared {
                state: Mutex::new(LoopState::Created),
                handle: Mutex::new(None),
            }),
            thread: Mutex::new(None),
            stop_requests: AtomicUsize::new(0),
            cancel_passes: AtomicUsize::new(0),
        }
    }

    /// Start the loop thread hosting `service`.
    ///
    /// Blocks only until the runtime exists and the state is `Running`.
    pub fn start<S: LoopService>(&self, service: S) -> Result<LoopHandle, LoopError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(LoopError::AlreadyStarted);
        }

        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || run_loop_thread(service, &ready_tx, &shared));

        let thread = match spawned {
            Ok(thread) => thread,
            Err(err) => {
                let err = LoopError::Spawn(err.to_string());
                self.shared.finish(Some(err.to_string()));
                return Err(err);
            }
        };

        match ready_rx.recv() {
            Ok(Ok(handle)) => {
                *self.thread.lock() = Some(thread);
                info!(thread = %self.thread_name, "event loop started");
                Ok(handle)
            }
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_disconnected) => {
                let _ = thread.join();
                let err = LoopError::Runtime("loop thread exited before reporting ready".into());
                self.shared.finish(Some(err.to_string()));
                Err(err)
            }
        }
    }

    /// Enqueue a stop command. Only valid while `Running`.
    pub fn request_stop(&self) -> bool {
        let mut state = self.shared.state.lock();
        if *state != LoopState::Running {
            debug!(state = state.label(), "stop request ignored");
            return false;
        }
        let Some(handle) = self.shared.handle.lock().clone() else {
            return false;
        };
        if !handle.send(LoopCommand::Stop) {
            return false;
        }
        *state = LoopState::StopRequested;
        let _ = self.stop_requests.fetch_add(1, Ordering::SeqCst);
        info!("event loop stop requested");
        true
    }

    /// Enqueue a cancel-all pass. Valid while `Running` or `StopRequested`.
    pub fn cancel_all_pending(&self) -> bool {
        let state = self.shared.state.lock();
        if !matches!(*state, LoopState::Running | LoopState::StopRequested) {
            debug!(state = state.label(), "cancel pass ignored");
            return false;
        }
        let Some(handle) = self.shared.handle.lock().clone() else {
            return false;
        };
        if !handle.send(LoopCommand::CancelAll) {
            return false;
        }
        let _ = self.cancel_passes.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Wait for the loop thread to exit.
    ///
    /// Returns `Ok` when the loop was never started or stopped cleanly.
    pub fn join(&self) -> Result<(), LoopError> {
        let Some(thread) = self.thread.lock().take() else {
            return self.fault_result();
        };
        if thread.thread().id() == thread::current().id() {
            *self.thread.lock() = Some(thread);
            return Err(LoopError::Fault("join called from the loop thread".into()));
        }
        if thread.join().is_err() {
            return Err(LoopError::Fault("loop thread panicked".into()));
        }
        self.fault_result()
    }

    fn fault_result(&self) -> Result<(), LoopError> {
        match &*self.shared.state.lock() {
            LoopState::Stopped { fault: Some(fault) } => Err(LoopError::Fault(fault.clone())),
            _ => Ok(()),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LoopState {
        self.shared.state.lock().clone()
    }

    /// Handle to the active loop, `None` before start and after exit.
    pub fn handle(&self) -> Option<LoopHandle> {
        self.shared.handle.lock().clone()
    }

    /// Stop commands successfully enqueued.
    pub fn stop_requests(&self) -> usize {
        self.stop_requests.load(Ordering::SeqCst)
    }

    /// Cancel-all passes successfully enqueued.
    pub fn cancel_passes(&self) -> usize {
        self.cancel_passes.load(Ordering::SeqCst)
    }
}

impl Default for EventLoopController {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopControl for EventLoopController {
    fn cancel_all_pending(&self) -> bool {
        EventLoopController::cancel_all_pending(self)
    }

    fn request_stop(&self) -> bool {
        EventLoopController::request_stop(self)
    }
}

fn run_loop_thread<S: LoopService>(
    mut service: S,
    ready: &std_mpsc::SyncSender<Result<LoopHandle, LoopError>>,
    shared: &Shared,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            let err = LoopError::Runtime(err.to_string());
            shared.finish(Some(err.to_string()));
            let _ = ready.send(Err(err));
            return;
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let handle = LoopHandle {
        tx,
        thread: thread::current().id(),
    };
    shared.publish(handle.clone());
    if ready.send(Ok(handle.clone())).is_err() {
        warn!("loop owner went away before start completed");
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.block_on(drive(&mut service, handle, rx, shared))
    }));
    let fault = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err.to_string()),
        Err(payload) => {
            let message = format!("loop panicked: {}", panic_message(payload.as_ref()));
            error!(%message, "event loop faulted");
            Some(message)
        }
    };

    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    shared.finish(fault);
    info!("event loop thread exiting");
}

async fn drive<S: LoopService>(
    service: &mut S,
    handle: LoopHandle,
    mut rx: mpsc::UnboundedReceiver<LoopCommand>,
    shared: &Shared,
) -> Result<(), LoopError> {
    if let Err(err) = service.setup(handle).await {
        error!(error = %err, "event loop setup failed");
        shared.mark_stopped(Some(err.to_string()));
        service.cleanup().await;
        return Err(err);
    }

    let mut tasks: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(LoopCommand::Spawn { name, task }) => {
                    debug!(task = name, tracked = tasks.len() + 1, "task spawned");
                    let _ = tasks.spawn(task);
                }
                Some(LoopCommand::Call(f)) => f(),
                Some(LoopCommand::CancelAll) => {
                    info!(tasks = tasks.len(), "cancelling pending tasks");
                    tasks.abort_all();
                }
                Some(LoopCommand::Stop) | None => break,
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(err) = joined {
                    if err.is_panic() {
                        error!(error = %err, "loop task panicked");
                    }
                }
            }
        }
    }

    shared.mark_stopped(None);
    info!(tasks = tasks.len(), "event loop stopped");
    service.cleanup().await;
    tasks.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicBool;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct Probe {
        setup_fail: bool,
        setup_ran: Arc<AtomicBool>,
        cleanup_ran: Arc<AtomicBool>,
    }

    #[async_trait]
    impl LoopService for Probe {
        async fn setup(&mut self, _handle: LoopHandle) -> Result<(), LoopError> {
            self.setup_ran.store(true, Ordering::SeqCst);
            if self.setup_fail {
                return Err(LoopError::Setup("port in use".into()));
            }
            Ok(())
        }

        async fn cleanup(&mut self) {
            self.cleanup_ran.store(true, Ordering::SeqCst);
        }
    }

    struct DropSignal(std_mpsc::Sender<()>);

    impl Drop for DropSignal {
        fn drop(&mut self) {
            let _ = self.0.send(());
        }
    }

    #[test]
    fn start_reaches_running() {
        let controller = EventLoopController::new();
        assert_eq!(controller.state(), LoopState::Created);
        assert!(controller.handle().is_none());

        let handle = controller.start(Probe::default()).unwrap();
        assert_eq!(controller.state(), LoopState::Running);
        assert!(controller.handle().is_some());
        assert!(!handle.is_loop_thread());

        assert!(controller.request_stop());
        controller.join().unwrap();
    }

    #[test]
    fn second_start_is_rejected() {
        let controller = EventLoopController::new();
        let _handle = controller.start(Probe::default()).unwrap();
        assert_matches!(
            controller.start(Probe::default()),
            Err(LoopError::AlreadyStarted)
        );
        assert!(controller.request_stop());
        controller.join().unwrap();
        assert_matches!(
            controller.start(Probe::default()),
            Err(LoopError::AlreadyStarted)
        );
    }

    #[test]
    fn call_soon_runs_on_loop_thread() {
        let controller = EventLoopController::with_thread_name("loop-under-test");
        let handle = controller.start(Probe::default()).unwrap();

        let (tx, rx) = std_mpsc::channel();
        let probe = handle.clone();
        assert!(handle.call_soon(move || {
            let name = thread::current().name().map(str::to_owned);
            let _ = tx.send((probe.is_loop_thread(), name));
        }));
        let (on_loop, name) = rx.recv_timeout(WAIT).unwrap();
        assert!(on_loop);
        assert_eq!(name.as_deref(), Some("loop-under-test"));

        assert!(controller.request_stop());
        controller.join().unwrap();
    }

    #[test]
    fn stop_runs_cleanup_and_clears_handle() {
        let cleanup_ran = Arc::new(AtomicBool::new(false));
        let controller = EventLoopController::new();
        let handle = controller
            .start(Probe {
                cleanup_ran: cleanup_ran.clone(),
                ..Probe::default()
            })
            .unwrap();

        assert!(controller.request_stop());
        assert!(matches!(
            controller.state(),
            LoopState::StopRequested | LoopState::Stopped { .. }
        ));
        controller.join().unwrap();

        assert_eq!(controller.state(), LoopState::Stopped { fault: None });
        assert!(cleanup_ran.load(Ordering::SeqCst));
        assert!(controller.handle().is_none());
        assert!(handle.is_closed());
        assert!(!handle.call_soon(|| {}));
    }

    #[test]
    fn stop_before_start_is_noop() {
        let controller = EventLoopController::new();
        assert!(!controller.request_stop());
        assert!(!controller.cancel_all_pending());
        assert_eq!(controller.state(), LoopState::Created);
        controller.join().unwrap();
    }

    #[test]
    fn repeated_stop_requests_enqueue_once() {
        let controller = EventLoopController::new();
        let _handle = controller.start(Probe::default()).unwrap();
        assert!(controller.request_stop());
        assert!(!controller.request_stop());
        controller.join().unwrap();
        assert!(!controller.request_stop());
        assert_eq!(controller.stop_requests(), 1);
    }

    #[test]
    fn cancel_all_aborts_tracked_tasks() {
        let controller = EventLoopController::new();
        let handle = controller.start(Probe::default()).unwrap();

        let (started_tx, started_rx) = std_mpsc::channel();
        let (dropped_tx, dropped_rx) = std_mpsc::channel();
        assert!(handle.spawn("sleeper", async move {
            let _signal = DropSignal(dropped_tx);
            let _ = started_tx.send(());
            tokio::time::sleep(Duration::from_secs(600)).await;
        }));
        started_rx.recv_timeout(WAIT).unwrap();

        assert!(controller.cancel_all_pending());
        dropped_rx.recv_timeout(WAIT).unwrap();
        assert_eq!(controller.cancel_passes(), 1);

        // The loop keeps running after a cancel pass.
        assert_eq!(controller.state(), LoopState::Running);
        let (tx, rx) = std_mpsc::channel();
        assert!(handle.call_soon(move || {
            let _ = tx.send(());
        }));
        rx.recv_timeout(WAIT).unwrap();

        assert!(controller.request_stop());
        controller.join().unwrap();
    }

    #[test]
    fn cancel_then_stop_is_processed_in_order() {
        let controller = EventLoopController::new();
        let handle = controller.start(Probe::default()).unwrap();
        let (dropped_tx, dropped_rx) = std_mpsc::channel();
        assert!(handle.spawn("sleeper", async move {
            let _signal = DropSignal(dropped_tx);
            tokio::time::sleep(Duration::from_secs(600)).await;
        }));

        assert!(controller.cancel_all_pending());
        assert!(controller.request_stop());
        assert!(controller.cancel_all_pending());
        controller.join().unwrap();
        dropped_rx.recv_timeout(WAIT).unwrap();
    }

    #[test]
    fn setup_failure_records_fault() {
        let cleanup_ran = Arc::new(AtomicBool::new(false));
        let controller = EventLoopController::new();
        let _handle = controller
            .start(Probe {
                setup_fail: true,
                cleanup_ran: cleanup_ran.clone(),
                ..Probe::default()
            })
            .unwrap();

        let err = controller.join().unwrap_err();
        assert_matches!(err, LoopError::Fault(reason) if reason.contains("port in use"));
        assert_matches!(controller.state(), LoopState::Stopped { fault: Some(_) });
        assert_eq!(controller.state().label(), "faulted");
        assert!(cleanup_ran.load(Ordering::SeqCst));
        assert!(controller.handle().is_none());
    }

    #[test]
    fn task_panic_is_contained() {
        let controller = EventLoopController::new();
        let handle = controller.start(Probe::default()).unwrap();
        assert!(handle.spawn("bad", async { panic!("task boom") }));

        let (tx, rx) = std_mpsc::channel();
        assert!(handle.call_soon(move || {
            let _ = tx.send(());
        }));
        rx.recv_timeout(WAIT).unwrap();
        assert_eq!(controller.state(), LoopState::Running);

        assert!(controller.request_stop());
        controller.join().unwrap();
    }

    #[test]
    fn panic_in_loop_body_faults_the_loop() {
        let controller = EventLoopController::new();
        let handle = controller.start(Probe::default()).unwrap();
        assert!(handle.call_soon(|| panic!("loop boom")));

        let err = controller.join().unwrap_err();
        assert_matches!(err, LoopError::Fault(reason) if reason.contains("loop boom"));
        assert!(controller.handle().is_none());
        assert!(!controller.request_stop());
    }
}
