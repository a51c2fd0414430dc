//! The write queue — the single serialization point for all mutations.
//!
//! Every mutating operation against the store is wrapped in a job and
//! submitted here. A bounded channel holds pending jobs; exactly one worker
//! drains them, which gives a total order over all writes without any
//! per-record locking. Reads never pass through the queue.
//!
//! `submit` uses `try_send`: when the queue is full the caller gets
//! [`QueueError::Overloaded`] immediately instead of waiting, and the
//! dispatcher surfaces that as HTTP 503 with a retry hint. The ack for a
//! job is released only after its storage commit, so a submitter that waits
//! for the ack before issuing a read observes its own write.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::error::QueueError;

type Job = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Bounded, single-worker queue for mutating operations.
pub struct WriteQueue {
    tx: mpsc::Sender<Job>,
    depth: usize,
    closed: AtomicBool,
    completed: Arc<AtomicU64>,
}

impl WriteQueue {
    /// Start the queue with the given depth and spawn its worker task.
    ///
    /// The worker runs until the queue is dropped (all senders gone).
    #[must_use]
    pub fn start(depth: usize) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<Job>(depth.max(1));
        let completed = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&completed);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job().await;
                counter.fetch_add(1, Ordering::Relaxed);
            }
            debug!("write queue worker stopped");
        });

        Arc::new(Self {
            tx,
            depth: depth.max(1),
            closed: AtomicBool::new(false),
            completed,
        })
    }

    /// Submit a write job and wait for its completion.
    ///
    /// The job's future runs on the single worker; its return value is
    /// relayed back through a oneshot ack that fires only after the job
    /// finishes (i.e. after its storage commit).
    ///
    /// # Errors
    ///
    /// - [`QueueError::Overloaded`] when the queue is full.
    /// - [`QueueError::ShutDown`] after [`drain`](WriteQueue::drain).
    /// - [`QueueError::WorkerGone`] if the worker stopped mid-job.
    pub async fn submit<T, F, Fut>(&self, f: F) -> Result<T, QueueError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::ShutDown);
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let result = f().await;
                let _ = ack_tx.send(result);
            })
        });

        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Overloaded,
            mpsc::error::TrySendError::Closed(_) => QueueError::ShutDown,
        })?;

        ack_rx.await.map_err(|_| QueueError::WorkerGone)
    }

    /// Stop accepting jobs and wait until every queued job has committed.
    ///
    /// Called once during graceful shutdown, after in-flight requests have
    /// drained. Jobs submitted after this returns `ShutDown`.
    pub async fn drain(&self) {
        self.closed.store(true, Ordering::Release);

        // A sentinel job: once it completes, everything queued before it has.
        let (ack_tx, ack_rx) = oneshot::channel();
        let sentinel: Job = Box::new(move || {
            Box::pin(async move {
                let _ = ack_tx.send(());
            })
        });
        if self.tx.send(sentinel).await.is_ok() {
            let _ = ack_rx.await;
        }
        info!(
            completed = self.completed.load(Ordering::Relaxed),
            "write queue drained"
        );
    }

    /// Configured queue depth.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of jobs committed since start.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Current number of queued (not yet started) jobs.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.depth.saturating_sub(self.tx.capacity())
    }
}

impl std::fmt::Debug for WriteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteQueue")
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}
