//! Per-job processing pipeline.
//!
//! A claimed row travels: mark sending → validate → transform → upstream
//! call → audit insert → transform back → deliver over the client socket →
//! mark complete → delete. Any failure before delivery routes the row to
//! `failed` with an incremented retry count, so a row never stays `sending`
//! after its worker lets go of it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use portway_proto::{encode_frame, Frame, FrameType, MAX_FRAME_SIZE};
use portway_store::{JobRepository, JobStatus, StagedJob};

use crate::error::BridgeError;
use crate::pool::JobRunner;
use crate::registry::ConnectionRegistry;
use crate::transform::PayloadTransformer;
use crate::upstream::UpstreamClient;

/// Executes the processing pipeline for claimed jobs.
pub struct JobProcessor {
    repo: JobRepository,
    upstream: UpstreamClient,
    transformer: Arc<dyn PayloadTransformer>,
    registry: Arc<ConnectionRegistry>,
    process_timeout: Duration,
}

impl JobProcessor {
    /// Creates a processor.
    #[must_use]
    pub fn new(
        repo: JobRepository,
        upstream: UpstreamClient,
        transformer: Arc<dyn PayloadTransformer>,
        registry: Arc<ConnectionRegistry>,
        process_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            upstream,
            transformer,
            registry,
            process_timeout,
        }
    }

    /// Runs the pipeline for one claimed job.
    ///
    /// Failures are already routed to the row's failure state when this
    /// returns; the result is for the caller's logging.
    pub async fn process(&self, job: &StagedJob) -> Result<(), BridgeError> {
        // Step 1: re-mark sending. The poller marked the row at dispatch;
        // this refreshes updated_at so the stale-row reaper leaves an
        // in-flight row alone.
        if let Err(e) = self.repo.mark(job.id, JobStatus::Sending, None).await {
            let e = BridgeError::from(e);
            self.handle_failure(job.id, &e).await;
            return Err(e);
        }

        // Step 2: validate the payload before spending an upstream call.
        if let Err(e) = validate_binary(&job.binary_data) {
            self.handle_failure(job.id, &e).await;
            return Err(e);
        }

        // Step 3: binary → API request.
        let api_request = match self.transformer.to_api_request(job) {
            Ok(request) => request,
            Err(e) => {
                self.handle_failure(job.id, &e).await;
                return Err(e);
            }
        };

        // Step 4: upstream call. The client retries internally; only the
        // final error surfaces here.
        let reply = match self.upstream.send(&api_request).await {
            Ok(reply) => reply,
            Err(e) => {
                self.handle_failure(job.id, &e).await;
                return Err(e);
            }
        };

        // Step 5: validate the reply.
        if let Err(e) = reply.validate() {
            self.handle_failure(job.id, &e).await;
            return Err(e);
        }

        // Step 6: audit insert. A completed upstream call is not lost to
        // cleanup flakiness, so DB errors here are non-fatal.
        if let Err(e) = self
            .repo
            .insert_response(job.id, reply.status_code, reply.message.as_bytes())
            .await
        {
            error!(id = job.id, error = %e, "failed to insert response record");
        }

        // Step 7: reply → wire payload.
        let wire = match self.transformer.to_wire(&reply) {
            Ok(wire) => wire,
            Err(e) => {
                self.handle_failure(job.id, &e).await;
                return Err(e);
            }
        };

        // Step 8: deliver to the originating socket.
        if let Err(e) = self.deliver(job.client_port, &wire).await {
            self.send_error_frame(job.client_port, "response delivery failed")
                .await;
            self.handle_failure(job.id, &e).await;
            return Err(e);
        }

        // Steps 9–10: terminal mark and cleanup, both non-fatal.
        if let Err(e) = self.repo.mark(job.id, JobStatus::Complete, None).await {
            error!(id = job.id, error = %e, "failed to mark job complete");
        }
        if let Err(e) = self.repo.delete(job.id).await {
            error!(id = job.id, error = %e, "failed to delete processed job");
        }

        Ok(())
    }

    async fn deliver(&self, port: u16, wire: &[u8]) -> Result<(), BridgeError> {
        let encoded = encode_frame(FrameType::Response, wire)?;
        self.registry.send(port, &encoded).await
    }

    /// Best-effort error frame on route failures. Other failure modes never
    /// write to the socket; its state is uncertain.
    async fn send_error_frame(&self, port: u16, message: &str) {
        let frame = Frame::error_text(message);
        match encode_frame(frame.frame_type, &frame.payload) {
            Ok(encoded) => {
                if let Err(e) = self.registry.send(port, &encoded).await {
                    debug!(port, error = %e, "error frame not delivered");
                }
            }
            Err(e) => debug!(port, error = %e, "error frame not encoded"),
        }
    }

    /// Routes a job to its failure state: status `failed`, error text set,
    /// retry count bumped. DB errors here are logged; the stale-row reaper
    /// is the backstop when even the failure mark cannot be written.
    async fn handle_failure(&self, id: i64, error: &BridgeError) {
        warn!(id, error = %error, "job processing failed");

        let text = error.to_string();
        if let Err(e) = self.repo.mark(id, JobStatus::Failed, Some(&text)).await {
            error!(id, error = %e, "failed to mark job failed");
        }
        if let Err(e) = self.repo.increment_retry(id).await {
            error!(id, error = %e, "failed to increment retry count");
        }
    }
}

impl std::fmt::Debug for JobProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobProcessor")
            .field("process_timeout", &self.process_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl JobRunner for JobProcessor {
    async fn run(&self, job: &StagedJob) {
        let started = Instant::now();

        let outcome = match timeout(self.process_timeout, self.process(job)).await {
            Ok(result) => result,
            Err(_) => {
                // The pipeline future was dropped mid-step; route the row to
                // its failure state here.
                let e = BridgeError::DeadlineExceeded;
                self.handle_failure(job.id, &e).await;
                Err(e)
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => info!(
                id = job.id,
                client_port = job.client_port,
                elapsed_ms,
                "job processed"
            ),
            Err(e) => debug!(id = job.id, elapsed_ms, error = %e, "job failed"),
        }
    }

    async fn abandon(&self, job: &StagedJob, reason: &str) {
        warn!(id = job.id, reason, "job abandoned");
        self.handle_failure(job.id, &BridgeError::Shutdown).await;
    }
}

fn validate_binary(data: &[u8]) -> Result<(), BridgeError> {
    if data.is_empty() {
        return Err(BridgeError::Transform("binary data is empty".into()));
    }
    if data.len() > MAX_FRAME_SIZE {
        return Err(BridgeError::Transform(format!(
            "binary data exceeds maximum size: {} bytes",
            data.len()
        )));
    }
    Ok(())
}
