use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of a [`Job`], assigned once at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// The unit of work flowing through the queue.
///
/// Identity is stable across every transition; only `status` and the timing
/// fields change. Once enqueued, the storage adapter owns the authoritative
/// record — values returned from adapter calls are transient copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job<T> {
    pub id: JobId,
    pub payload: T,
    /// Number of times a worker has begun processing this job.
    pub attempts: u16,
    pub max_attempts: u16,
    pub status: JobStatus,
    /// Set only while the job is parked for a delayed retry.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Maintained by the storage layer, not the caller.
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    /// Advisory: the worker that claimed the job, for diagnostics.
    pub worker_id: Option<String>,
    /// Message of the most recent failure.
    pub error: Option<String>,
}

/// Attempt ceiling applied when the producer does not specify one.
pub const DEFAULT_MAX_ATTEMPTS: u16 = 3;

impl<T> Job<T> {
    /// Creates a new pending job with a fresh id and zero attempts.
    pub fn new(payload: T) -> Self {
        Self {
            id: JobId::new(),
            payload,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            status: JobStatus::Pending,
            next_attempt_at: None,
            created_at: None,
            updated_at: None,
            processing_started_at: None,
            worker_id: None,
            error: None,
        }
    }

    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    pub(crate) fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }
}
