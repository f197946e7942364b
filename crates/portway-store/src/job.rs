//! Staged-job and response-record models.

use chrono::{DateTime, Utc};

use crate::error::StoreError;

/// Processing status of a staged job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed and owned by a worker.
    Sending,
    /// Upstream call completed, delivery pending.
    Sent,
    /// Pipeline failure; eligible again while under the retry ceiling.
    Failed,
    /// Delivered; the row is deleted shortly after.
    Complete,
}

impl JobStatus {
    /// Returns the stored text representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Complete => "complete",
        }
    }

    /// Parses a stored text representation.
    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "pending" => Ok(Self::Pending),
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "complete" => Ok(Self::Complete),
            other => Err(StoreError::InvalidStatus(other.to_owned())),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A staged unit of work: one binary payload awaiting upstream delivery and
/// routing back to the client that owns `client_port`.
#[derive(Debug, Clone)]
pub struct StagedJob {
    /// Monotonic row identifier; echoed upstream as the request id.
    pub id: i64,
    /// Ephemeral source port of the originating TCP session.
    pub client_port: u16,
    /// Opaque binary payload.
    pub binary_data: Vec<u8>,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last status transition time.
    pub updated_at: DateTime<Utc>,
    /// Number of failed processing attempts so far.
    pub retry_count: i32,
    /// Message from the most recent failure, if any.
    pub last_error: Option<String>,
}

/// Audit record of one upstream reply, retained after the staged job row is
/// deleted.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    /// Row identifier.
    pub id: i64,
    /// Id of the staged job this reply answered.
    pub request_id: i64,
    /// Upstream HTTP status code.
    pub status_code: i32,
    /// Raw reply body.
    pub response_body: Vec<u8>,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        let statuses = [
            JobStatus::Pending,
            JobStatus::Sending,
            JobStatus::Sent,
            JobStatus::Failed,
            JobStatus::Complete,
        ];

        for status in statuses {
            assert_eq!(JobStatus::parse(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_rejected() {
        let result = JobStatus::parse("archived");
        assert!(matches!(result, Err(StoreError::InvalidStatus(_))));
    }

    #[test]
    fn status_display_matches_stored_form() {
        assert_eq!(JobStatus::Sending.to_string(), "sending");
    }
}
