//! Polling driver: drains the staging table into the worker pool.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use portway_store::JobRepository;

use crate::error::BridgeError;
use crate::pool::PoolHandle;

/// How often the stale-row reaper runs.
const REAPER_INTERVAL: Duration = Duration::from_secs(30);

/// Periodically claims eligible rows and dispatches them to the pool.
///
/// Each tick claims a batch under `FOR UPDATE SKIP LOCKED`, reserves a pool
/// slot per row, and commits the claim with exactly the reserved rows marked
/// `sending`. When the pool is full the remaining rows are released
/// unchanged, so another tick or another bridge instance reclaims them; the
/// queue bound is the only backpressure the driver needs.
pub struct PollDriver {
    repo: JobRepository,
    pool: PoolHandle,
    batch_size: i64,
    interval: Duration,
}

impl PollDriver {
    /// Creates a polling driver.
    #[must_use]
    pub fn new(repo: JobRepository, pool: PoolHandle, batch_size: i64, interval: Duration) -> Self {
        Self {
            repo,
            pool,
            batch_size,
            interval,
        }
    }

    /// Runs the poll loop until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            batch_size = self.batch_size,
            "polling driver started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(0) => {}
                        Ok(dispatched) => debug!(dispatched, "dispatched claimed jobs"),
                        Err(e) => error!(error = %e, "poll tick failed"),
                    }
                }
            }
        }

        info!("polling driver stopped");
    }

    /// One claim-and-dispatch cycle. Returns the number of jobs dispatched.
    async fn tick(&self) -> Result<usize, BridgeError> {
        // Failed rows under the retry ceiling become eligible again on this
        // poll; rows at the ceiling stay failed.
        let requeued = self.repo.requeue_failed().await?;
        if requeued > 0 {
            debug!(requeued, "requeued failed jobs");
        }

        let mut batch = self.repo.claim_pending(self.batch_size).await?;
        if batch.jobs.is_empty() {
            batch.rollback().await?;
            return Ok(0);
        }

        let jobs = std::mem::take(&mut batch.jobs);

        // Reserve a slot per claimed row; stop at the first QueueFull. Slots
        // are reserved before the commit so dispatch below cannot fail.
        let mut permits = Vec::new();
        let mut ids = Vec::new();
        for job in &jobs {
            match self.pool.reserve() {
                Ok(permit) => {
                    ids.push(job.id);
                    permits.push(permit);
                }
                Err(BridgeError::QueueFull) => {
                    warn!(
                        claimed = jobs.len(),
                        reserved = permits.len(),
                        "worker queue full, releasing unreserved rows"
                    );
                    break;
                }
                Err(e) => {
                    batch.rollback().await?;
                    return Err(e);
                }
            }
        }

        if ids.is_empty() {
            // Full backpressure: release everything and let a later tick
            // reclaim.
            batch.rollback().await?;
            return Ok(0);
        }

        // Marks exactly the reserved rows `sending` under the claim locks;
        // the rest unlock untouched.
        batch.commit_dispatched(&ids).await?;

        let dispatched = permits.len();
        for (permit, job) in permits.into_iter().zip(jobs) {
            permit.dispatch(job);
        }

        Ok(dispatched)
    }
}

impl std::fmt::Debug for PollDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollDriver")
            .field("batch_size", &self.batch_size)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Demotes `sending` rows abandoned by a crashed process back to `pending`.
///
/// The grace window is twice the per-job deadline: past that point no live
/// worker can still hold the row, because deadline expiry would already have
/// routed it to `failed`.
pub async fn run_stale_reaper(
    repo: JobRepository,
    process_timeout: Duration,
    cancel: CancellationToken,
) {
    let grace = process_timeout * 2;
    let mut ticker = tokio::time::interval(REAPER_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            _ = ticker.tick() => {
                match repo.release_stale_sending(grace).await {
                    Ok(0) => {}
                    Ok(released) => warn!(released, "recovered stale sending rows"),
                    Err(e) => error!(error = %e, "stale-row sweep failed"),
                }
            }
        }
    }

    info!("stale-row reaper stopped");
}
