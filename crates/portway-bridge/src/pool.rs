//! Bounded worker pool.
//!
//! A fixed set of workers consumes jobs from a bounded queue. Submission
//! never blocks: a full queue returns [`BridgeError::QueueFull`] immediately,
//! which is the backpressure signal the polling driver slows down on.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use portway_store::StagedJob;

use crate::error::BridgeError;

/// Executes one claimed job. The pool stays generic over this seam; the job
/// processor is the production implementation.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Runs the job to a terminal outcome, including its own failure
    /// handling and deadline.
    async fn run(&self, job: &StagedJob);

    /// Called instead of completion when the pool aborts the job (shutdown
    /// cancellation). Must route the row to its failure state so nothing
    /// stays `sending`.
    async fn abandon(&self, job: &StagedJob, reason: &str);
}

/// A reserved queue slot. Dispatching through a permit cannot fail, so the
/// polling driver reserves before committing its claim transaction.
pub struct JobPermit {
    permit: mpsc::OwnedPermit<StagedJob>,
}

impl JobPermit {
    /// Consumes the permit, enqueueing the job.
    pub fn dispatch(self, job: StagedJob) {
        self.permit.send(job);
    }
}

/// Submission handle to a running pool.
///
/// Handles must be dropped for [`WorkerPool::shutdown`] to drain: the queue
/// closes when the last sender goes away. The polling driver stops (and
/// drops its handle) before the pool shuts down.
#[derive(Clone)]
pub struct PoolHandle {
    sender: mpsc::Sender<StagedJob>,
}

impl PoolHandle {
    /// Submits a job without blocking.
    ///
    /// Returns [`BridgeError::QueueFull`] when the queue has no free slot;
    /// the job is never consumed on failure.
    pub fn submit(&self, job: StagedJob) -> Result<(), BridgeError> {
        match self.sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(BridgeError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BridgeError::Shutdown),
        }
    }

    /// Reserves a queue slot without blocking.
    pub fn reserve(&self) -> Result<JobPermit, BridgeError> {
        match self.sender.clone().try_reserve_owned() {
            Ok(permit) => Ok(JobPermit { permit }),
            Err(mpsc::error::TrySendError::Full(_)) => Err(BridgeError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BridgeError::Shutdown),
        }
    }

    /// Free slots remaining in the submission queue.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.sender.capacity()
    }
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("free_slots", &self.sender.capacity())
            .finish()
    }
}

/// Fixed-size worker pool over a bounded submission queue.
pub struct WorkerPool {
    sender: mpsc::Sender<StagedJob>,
    workers: Vec<JoinHandle<()>>,
    abort: CancellationToken,
}

impl WorkerPool {
    /// Spawns `pool_size` workers over a queue of `queue_size` slots.
    #[must_use]
    pub fn start(pool_size: usize, queue_size: usize, runner: Arc<dyn JobRunner>) -> Self {
        let (sender, receiver) = mpsc::channel::<StagedJob>(queue_size);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let abort = CancellationToken::new();

        let mut workers = Vec::with_capacity(pool_size);
        for worker_id in 0..pool_size {
            let receiver = Arc::clone(&receiver);
            let runner = Arc::clone(&runner);
            let abort = abort.clone();

            workers.push(tokio::spawn(async move {
                debug!(worker_id, "worker started");
                loop {
                    // Hold the receiver lock only while dequeuing so the
                    // other workers are not serialised behind a running job.
                    let job = { receiver.lock().await.recv().await };
                    let Some(job) = job else {
                        debug!(worker_id, "job queue closed");
                        break;
                    };

                    tokio::select! {
                        biased;

                        () = abort.cancelled() => {
                            runner.abandon(&job, "aborted by shutdown").await;
                        }

                        () = runner.run(&job) => {}
                    }
                }
                debug!(worker_id, "worker stopped");
            }));
        }

        info!(pool_size, queue_size, "worker pool started");

        Self {
            sender,
            workers,
            abort,
        }
    }

    /// Returns a cloneable submission handle.
    #[must_use]
    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            sender: self.sender.clone(),
        }
    }

    /// Submits a job without blocking. See [`PoolHandle::submit`].
    pub fn submit(&self, job: StagedJob) -> Result<(), BridgeError> {
        self.handle().submit(job)
    }

    /// Reserves a queue slot without blocking. See [`PoolHandle::reserve`].
    pub fn reserve(&self) -> Result<JobPermit, BridgeError> {
        self.handle().reserve()
    }

    /// Free slots remaining in the submission queue.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.sender.capacity()
    }

    /// Token that aborts in-flight jobs at their next suspension point.
    /// Aborted jobs are routed through [`JobRunner::abandon`].
    #[must_use]
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Graceful shutdown: stop accepting submissions, drain the queue, and
    /// wait for the workers to finish. No forced kill.
    pub async fn shutdown(self) {
        info!("stopping worker pool");
        drop(self.sender);

        for handle in self.workers {
            let _ = handle.await;
        }

        info!("worker pool stopped");
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("free_slots", &self.sender.capacity())
            .finish()
    }
}
