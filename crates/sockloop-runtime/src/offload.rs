//! Blocking work offload.
//!
//! A fixed set of named worker threads share one FIFO queue. Submitting
//! never blocks and never rejects for capacity; the caller gets an
//! [`OffloadHandle`] future that resolves once a worker has run the job.
//!
//! Cancellation is cooperative. A job cancelled (or whose handle was
//! dropped) before a worker picks it up is skipped. A job already running
//! always runs to completion and its result is discarded.

use std::fmt::Display;
use std::future::Future;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use sockloop_core::{JobId, OffloadError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::panic_message;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueuedJob {
    id: JobId,
    token: CancellationToken,
    run: Job,
}

#[derive(Default)]
struct Stats {
    queued: AtomicUsize,
    active: AtomicUsize,
}

/// Fixed-size pool of blocking worker threads.
pub struct OffloadPool {
    size: usize,
    sender: Mutex<Option<std_mpsc::Sender<QueuedJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<Stats>,
}

impl OffloadPool {
    /// Spawn `size` workers (at least one).
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = std_mpsc::channel::<QueuedJob>();
        let receiver = Arc::new(Mutex::new(receiver));
        let stats = Arc::new(Stats::default());

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let stats = stats.clone();
            let worker = thread::Builder::new()
                .name(format!("offload-worker-{index}"))
                .spawn(move || worker_loop(&receiver, &stats))?;
            workers.push(worker);
        }
        info!(size, "offload pool started");

        Ok(Self {
            size,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            stats,
        })
    }

    /// Queue `work` for a worker thread.
    ///
    /// `Err` from the closure resolves the handle to [`OffloadError::Failed`];
    /// a panic resolves it to [`OffloadError::Panicked`]. The worker survives both.
    pub fn submit<F, T, E>(&self, work: F) -> OffloadHandle<T>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Display,
    {
        let id = JobId::new();
        let token = CancellationToken::new();
        let (tx, rx) = oneshot::channel();

        let job_id = id.clone();
        let run: Job = Box::new(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(work)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(OffloadError::Failed(err.to_string())),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(job_id = %job_id, panic = %message, "offloaded job panicked");
                    Err(OffloadError::Panicked(message))
                }
            };
            if tx.send(outcome).is_err() {
                debug!(job_id = %job_id, "result discarded, no waiter");
            }
        });

        let job = QueuedJob {
            id: id.clone(),
            token: token.clone(),
            run,
        };

        let _ = self.stats.queued.fetch_add(1, Ordering::SeqCst);
        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        };
        if sent {
            counter!("offload_jobs_total").increment(1);
            debug!(job_id = %id, queued = self.queued(), "job submitted");
        } else {
            let _ = self.stats.queued.fetch_sub(1, Ordering::SeqCst);
            warn!(job_id = %id, "submit after offload pool shutdown");
        }

        OffloadHandle {
            id,
            token,
            rx,
            finished: false,
        }
    }

    /// Configured worker count.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.stats.queued.load(Ordering::SeqCst)
    }

    /// Jobs currently running.
    pub fn active(&self) -> usize {
        self.stats.active.load(Ordering::SeqCst)
    }

    /// Close the queue and join every worker.
    ///
    /// Jobs already queued still run unless cancelled. Blocks; never call
    /// from the event loop thread.
    pub fn shutdown(&self) {
        let Some(sender) = self.sender.lock().take() else {
            return;
        };
        drop(sender);

        let workers = std::mem::take(&mut *self.workers.lock());
        let count = workers.len();
        for worker in workers {
            if worker.join().is_err() {
                warn!("offload worker exited abnormally");
            }
        }
        info!(workers = count, "offload pool stopped");
    }
}

impl Drop for OffloadPool {
    fn drop(&mut self) {
        // Workers exit once the queue drains; they are not joined here.
        drop(self.sender.lock().take());
    }
}

fn worker_loop(receiver: &Mutex<std_mpsc::Receiver<QueuedJob>>, stats: &Stats) {
    loop {
        let next = receiver.lock().recv();
        let Ok(job) = next else {
            break;
        };
        let _ = stats.queued.fetch_sub(1, Ordering::SeqCst);

        if job.token.is_cancelled() {
            debug!(job_id = %job.id, "skipping cancelled job");
            continue;
        }

        let _ = stats.active.fetch_add(1, Ordering::SeqCst);
        (job.run)();
        let _ = stats.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Future resolving to the result of an offloaded job.
///
/// Dropping the handle before it resolves cancels the job.
pub struct OffloadHandle<T> {
    id: JobId,
    token: CancellationToken,
    rx: oneshot::Receiver<Result<T, OffloadError>>,
    finished: bool,
}

impl<T> OffloadHandle<T> {
    /// Job identifier.
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Cancel the job. A job that has not started never runs.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Token that cancels this job when cancelled elsewhere.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait at most `limit` for the result.
    pub async fn with_timeout(self, limit: Duration) -> Result<T, OffloadError> {
        match tokio::time::timeout(limit, self).await {
            Ok(result) => result,
            Err(_elapsed) => Err(OffloadError::TimedOut(limit)),
        }
    }
}

impl<T> Unpin for OffloadHandle<T> {}

impl<T> Future for OffloadHandle<T> {
    type Output = Result<T, OffloadError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.token.is_cancelled() {
            this.finished = true;
            return Poll::Ready(Err(OffloadError::Cancelled));
        }
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                this.finished = true;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_closed)) => {
                this.finished = true;
                if this.token.is_cancelled() {
                    Poll::Ready(Err(OffloadError::Cancelled))
                } else {
                    Poll::Ready(Err(OffloadError::PoolClosed))
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for OffloadHandle<T> {
    fn drop(&mut self) {
        if !self.finished {
            self.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    fn sleep_then<T: Send + 'static>(
        ms: u64,
        value: T,
    ) -> impl FnOnce() -> Result<T, Infallible> + Send + 'static {
        move || {
            thread::sleep(Duration::from_millis(ms));
            Ok(value)
        }
    }

    #[tokio::test]
    async fn returns_value() {
        let pool = OffloadPool::new(2).unwrap();
        let value = pool.submit(sleep_then(5, 42)).await.unwrap();
        assert_eq!(value, 42);
        pool.shutdown();
    }

    #[tokio::test]
    async fn runs_on_worker_thread() {
        let pool = OffloadPool::new(1).unwrap();
        let name = pool
            .submit(|| Ok::<_, Infallible>(thread::current().name().map(str::to_owned)))
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some("offload-worker-0"));
        pool.shutdown();
    }

    #[tokio::test]
    async fn error_becomes_failed() {
        let pool = OffloadPool::new(1).unwrap();
        let result = pool.submit(|| Err::<(), _>("disk on fire")).await;
        assert_eq!(result, Err(OffloadError::Failed("disk on fire".into())));
        pool.shutdown();
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let pool = OffloadPool::new(1).unwrap();
        let result = pool
            .submit(|| -> Result<(), Infallible> { panic!("worker boom") })
            .await;
        assert_matches!(result, Err(OffloadError::Panicked(msg)) if msg.contains("worker boom"));

        // The single worker is still alive.
        assert_eq!(pool.submit(sleep_then(1, 7)).await.unwrap(), 7);
        pool.shutdown();
    }

    #[tokio::test]
    async fn excess_jobs_queue_and_all_complete() {
        let pool = OffloadPool::new(2).unwrap();
        let start = Instant::now();
        let handles: Vec<_> = (0..5).map(|i| pool.submit(sleep_then(50, i))).collect();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert_eq!(results, vec![0, 1, 2, 3, 4]);
        // Three waves of two workers.
        assert!(start.elapsed() >= Duration::from_millis(140));
        pool.shutdown();
    }

    #[tokio::test]
    async fn awaiting_does_not_block_the_runtime() {
        let pool = OffloadPool::new(1).unwrap();
        let slow = pool.submit(sleep_then(200, ()));
        let quick = tokio::spawn(async { Instant::now() });
        let started = Instant::now();
        let quick_done = quick.await.unwrap();
        assert!(quick_done.duration_since(started) < Duration::from_millis(100));
        slow.await.unwrap();
        pool.shutdown();
    }

    #[tokio::test]
    async fn cancelled_before_start_never_runs() {
        let pool = OffloadPool::new(1).unwrap();
        let blocker = pool.submit(sleep_then(100, ()));

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let victim = pool.submit(move || {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, Infallible>(())
        });
        victim.cancel();
        assert_eq!(victim.await, Err(OffloadError::Cancelled));

        blocker.await.unwrap();
        pool.shutdown();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dropped_handle_cancels_queued_job() {
        let pool = OffloadPool::new(1).unwrap();
        let blocker = pool.submit(sleep_then(100, ()));

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        drop(pool.submit(move || {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, Infallible>(())
        }));

        blocker.await.unwrap();
        pool.shutdown();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn timeout_reports_timed_out() {
        let pool = OffloadPool::new(1).unwrap();
        let result = pool
            .submit(sleep_then(300, ()))
            .with_timeout(Duration::from_millis(20))
            .await;
        assert_eq!(result, Err(OffloadError::TimedOut(Duration::from_millis(20))));
        pool.shutdown();
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_pool_closed() {
        let pool = OffloadPool::new(1).unwrap();
        pool.shutdown();
        let result = pool.submit(sleep_then(1, ())).await;
        assert_eq!(result, Err(OffloadError::PoolClosed));
    }

    #[test]
    fn counters_settle_to_zero() {
        let pool = OffloadPool::new(2).unwrap();
        assert_eq!(pool.size(), 2);
        let handles: Vec<_> = (0..4).map(|i| pool.submit(sleep_then(10, i))).collect();
        pool.shutdown();
        assert_eq!(pool.queued(), 0);
        assert_eq!(pool.active(), 0);
        drop(handles);
    }

    #[test]
    fn zero_size_is_clamped() {
        let pool = OffloadPool::new(0).unwrap();
        assert_eq!(pool.size(), 1);
        pool.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let pool = OffloadPool::new(1).unwrap();
        pool.shutdown();
        pool.shutdown();
    }
}
