//! The persistence contract the queue and worker pool are written against.
//!
//! A [`StorageAdapter`] owns every job record for a single named queue and
//! provides the queue primitives — ready list, processing set, delayed set —
//! with the atomicity guarantees documented per method. The crate ships an
//! in-memory reference implementation ([`memory::InMemoryStorage`]); durable
//! implementations live in their own crates and must uphold the same
//! observable guarantees, in particular:
//!
//! - per-queue namespacing, so two queues sharing a server never collide;
//! - `enqueue` (capacity check + insert), `dequeue` (claim) and
//!   `recover_stuck_jobs` (scan + reclaim) each as a single atomic
//!   server-side operation rather than separate round-trips.
//!
//! Adapter methods fail only on backend errors: "queue full" is a `false`
//! return from [`StorageAdapter::enqueue`] and "job not found" is a `None`
//! or a no-op, never an `Err`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::job::{Job, JobId};

pub mod memory;
pub mod registry;
pub mod testing;

/// Poll cadence of the default [`StorageAdapter::await_vacancy`]
/// implementation.
const VACANCY_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend connection failed or was lost.
    #[error("error communicating with the storage backend: {0}")]
    Connection(String),
    /// Shared state was poisoned or otherwise unusable.
    #[error("storage in bad state")]
    BadState,
}

#[async_trait]
pub trait StorageAdapter<T>: Send + Sync
where
    T: Send + 'static,
{
    /// Establishes the backend connection. Idempotent.
    async fn connect(&self) -> Result<(), StorageError>;

    /// Releases all resources. Idempotent.
    ///
    /// The in-memory implementation additionally clears every job record and
    /// wakes any parked consumers and producers, simulating a process
    /// restart.
    async fn disconnect(&self) -> Result<(), StorageError>;

    /// Inserts `job` at the tail of the ready set if there is capacity,
    /// returning whether it was accepted.
    ///
    /// Stamps `created_at` on first insert and refreshes `updated_at`. The
    /// capacity check and the insert are one atomic step. If a consumer is
    /// blocked in [`StorageAdapter::dequeue`], the job may be handed to it
    /// directly without ever entering the ready set.
    async fn enqueue(&self, job: Job<T>) -> Result<bool, StorageError>;

    /// Atomically removes and returns the head of the ready set,
    /// transitioning it to `Processing`, incrementing `attempts` and
    /// stamping `processing_started_at`.
    ///
    /// With an empty ready set: a zero `timeout` returns `None` immediately;
    /// otherwise the caller is suspended (no polling) until a job arrives or
    /// the timeout elapses. Concurrent callers never receive the same job.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job<T>>, StorageError>;

    /// Returns the ready-set head without removing or mutating it.
    async fn peek(&self) -> Result<Option<Job<T>>, StorageError>;

    /// Number of jobs in the ready set (processing and delayed jobs are not
    /// counted).
    async fn size(&self) -> Result<usize, StorageError>;

    async fn is_full(&self) -> Result<bool, StorageError>;

    async fn is_empty(&self) -> Result<bool, StorageError>;

    /// Parks `job` in the delayed set until `execute_at`, clearing its claim
    /// (`processing_started_at`, `worker_id`) and setting `next_attempt_at`.
    async fn schedule_delayed(
        &self,
        job: Job<T>,
        execute_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Atomically moves every delayed job whose `execute_at` has passed into
    /// the ready set — or hands it directly to a blocked consumer — and
    /// returns how many were promoted.
    async fn promote_delayed_jobs(&self) -> Result<usize, StorageError>;

    /// Records which worker claimed an already-dequeued job. No-op if the
    /// job no longer exists.
    async fn mark_processing(&self, id: JobId, worker_id: &str) -> Result<(), StorageError>;

    /// Terminal success transition; removes the job from the processing set.
    /// Idempotent no-op if the job no longer exists.
    async fn mark_completed(&self, id: JobId) -> Result<(), StorageError>;

    /// Terminal failure transition; records `error` and removes the job from
    /// the processing set. Idempotent no-op if the job no longer exists.
    async fn mark_failed(&self, id: JobId, error: &str) -> Result<(), StorageError>;

    /// Point read of a job record, regardless of which set it is in.
    async fn get_job(&self, id: JobId) -> Result<Option<Job<T>>, StorageError>;

    /// Point write of a job record, bypassing queue membership.
    async fn update_job(&self, job: Job<T>) -> Result<(), StorageError>;

    /// Finds every processing job whose claim is older than `older_than`,
    /// resets it to pending and re-inserts it at the **front** of the ready
    /// set, ahead of freshly enqueued work. Returns the number reclaimed.
    ///
    /// The scan and the reclaim are one atomic step: two pools recovering
    /// concurrently never revive the same job twice.
    async fn recover_stuck_jobs(&self, older_than: Duration) -> Result<usize, StorageError>;

    /// Ids currently claimed by workers. Diagnostic.
    async fn processing_jobs(&self) -> Result<Vec<JobId>, StorageError>;

    /// Suspends until the ready set has spare capacity or `timeout` elapses,
    /// returning whether capacity was observed.
    ///
    /// Backends with a wakeup primitive should override this; the default
    /// polls [`StorageAdapter::is_full`] every 100ms, which preserves the
    /// timeout semantics at the cost of wakeup latency.
    async fn await_vacancy(&self, timeout: Duration) -> Result<bool, StorageError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.is_full().await? {
                return Ok(true);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(VACANCY_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}
