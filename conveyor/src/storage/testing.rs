//! Test suite for ensuring a correct implementation of a [`StorageAdapter`].
//!
//! Adapter implementors should instantiate the suite against their backend
//! with [`crate::storage_test_suite`]:
//!
//! ```
//! use conveyor::storage_test_suite;
//! use conveyor::storage::memory::InMemoryStorage;
//! storage_test_suite!(for: InMemoryStorage::new(10));
//! ```
use std::time::Duration;

use chrono::{TimeDelta, Utc};

use super::StorageAdapter;
use crate::job::{Job, JobId, JobStatus};

/// Upper bound used to detect adapters that never report fullness.
const UNBOUNDED_GUARD: usize = 10_000;

fn mock_job(payload: &str) -> Job<String> {
    Job::new(payload.to_owned())
}

/// Fills the storage until `enqueue` refuses, returning the accepted count.
async fn fill<S: StorageAdapter<String>>(storage: &S) -> usize {
    for accepted in 0..UNBOUNDED_GUARD {
        if !storage.enqueue(mock_job("filler")).await.unwrap() {
            return accepted;
        }
    }
    panic!("storage accepted {UNBOUNDED_GUARD} jobs without reporting fullness");
}

pub async fn enqueue_then_dequeue_is_fifo<S: StorageAdapter<String>>(storage: S) {
    for payload in ["a", "b", "c"] {
        assert!(storage.enqueue(mock_job(payload)).await.unwrap());
    }
    for payload in ["a", "b", "c"] {
        let job = storage.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(job.payload, payload);
    }
    assert!(storage.dequeue(Duration::ZERO).await.unwrap().is_none());
}

pub async fn enqueue_rejects_when_full<S: StorageAdapter<String>>(storage: S) {
    let capacity = fill(&storage).await;
    assert!(capacity > 0);
    assert_eq!(storage.size().await.unwrap(), capacity);
    assert!(storage.is_full().await.unwrap());

    // Still refused, and the rejected job leaves no trace.
    let rejected = mock_job("rejected");
    assert!(!storage.enqueue(rejected.clone()).await.unwrap());
    assert_eq!(storage.size().await.unwrap(), capacity);
    assert!(storage.get_job(rejected.id).await.unwrap().is_none());

    // One dequeue frees exactly one slot.
    storage.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert!(storage.enqueue(mock_job("fits")).await.unwrap());
    assert!(!storage.enqueue(mock_job("again full")).await.unwrap());
}

pub async fn dequeue_returns_none_immediately_with_zero_timeout<S: StorageAdapter<String>>(
    storage: S,
) {
    assert!(storage.dequeue(Duration::ZERO).await.unwrap().is_none());
}

pub async fn dequeue_blocks_until_a_job_arrives<S>(storage: S)
where
    S: StorageAdapter<String> + Clone + 'static,
{
    let handle = tokio::spawn({
        let storage = storage.clone();
        async move { storage.dequeue(Duration::from_secs(5)).await.unwrap() }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let job = mock_job("late arrival");
    assert!(storage.enqueue(job.clone()).await.unwrap());

    let received = handle.await.unwrap().expect("blocked consumer never woke");
    assert_eq!(received.id, job.id);
    assert_eq!(received.status, JobStatus::Processing);
}

pub async fn dequeue_returns_none_after_timeout<S: StorageAdapter<String>>(storage: S) {
    let timeout = Duration::from_millis(100);
    let started = tokio::time::Instant::now();
    assert!(storage.dequeue(timeout).await.unwrap().is_none());
    assert!(started.elapsed() >= timeout);
}

pub async fn concurrent_dequeues_claim_distinct_jobs<S>(storage: S)
where
    S: StorageAdapter<String> + Clone + 'static,
{
    assert!(storage.enqueue(mock_job("one")).await.unwrap());
    assert!(storage.enqueue(mock_job("two")).await.unwrap());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            tokio::spawn({
                let storage = storage.clone();
                async move { storage.dequeue(Duration::from_millis(200)).await.unwrap() }
            })
        })
        .collect();

    let mut claimed: Vec<JobId> = Vec::new();
    for handle in handles {
        if let Some(job) = handle.await.unwrap() {
            claimed.push(job.id);
        }
    }
    claimed.sort();
    claimed.dedup();
    assert_eq!(claimed.len(), 2, "each ready job claimed exactly once");
}

pub async fn dequeue_counts_attempts_across_retries<S: StorageAdapter<String>>(storage: S) {
    let job = mock_job("retried");
    assert!(storage.enqueue(job.clone()).await.unwrap());

    let claimed = storage.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(claimed.attempts, 1);
    assert!(claimed.processing_started_at.is_some());

    storage
        .schedule_delayed(claimed, Utc::now() - TimeDelta::seconds(1))
        .await
        .unwrap();
    assert_eq!(storage.promote_delayed_jobs().await.unwrap(), 1);

    let reclaimed = storage.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, job.id);
    assert_eq!(reclaimed.attempts, 2);
}

pub async fn peek_does_not_claim<S: StorageAdapter<String>>(storage: S) {
    assert!(storage.enqueue(mock_job("head")).await.unwrap());
    assert!(storage.enqueue(mock_job("tail")).await.unwrap());

    let peeked = storage.peek().await.unwrap().unwrap();
    assert_eq!(peeked.payload, "head");
    assert_eq!(peeked.attempts, 0);
    assert_eq!(peeked.status, JobStatus::Pending);
    assert_eq!(storage.size().await.unwrap(), 2);

    let dequeued = storage.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(dequeued.id, peeked.id);
}

pub async fn size_reflects_ready_set_only<S: StorageAdapter<String>>(storage: S) {
    assert!(storage.is_empty().await.unwrap());
    assert!(storage.enqueue(mock_job("a")).await.unwrap());
    assert!(storage.enqueue(mock_job("b")).await.unwrap());
    assert_eq!(storage.size().await.unwrap(), 2);

    let claimed = storage.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(storage.size().await.unwrap(), 1);

    storage
        .schedule_delayed(claimed, Utc::now() + TimeDelta::minutes(5))
        .await
        .unwrap();
    // Delayed jobs are not ready.
    assert_eq!(storage.size().await.unwrap(), 1);
    assert!(!storage.is_empty().await.unwrap());
}

pub async fn promote_moves_due_jobs_to_ready<S: StorageAdapter<String>>(storage: S) {
    let job = mock_job("due");
    assert!(storage.enqueue(job.clone()).await.unwrap());
    let claimed = storage.dequeue(Duration::ZERO).await.unwrap().unwrap();
    storage
        .schedule_delayed(claimed, Utc::now() - TimeDelta::seconds(1))
        .await
        .unwrap();
    assert_eq!(storage.size().await.unwrap(), 0);

    assert_eq!(storage.promote_delayed_jobs().await.unwrap(), 1);
    assert_eq!(storage.size().await.unwrap(), 1);

    let promoted = storage.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(promoted.status, JobStatus::Pending);
    assert!(promoted.next_attempt_at.is_none());
}

pub async fn promote_skips_jobs_scheduled_in_the_future<S: StorageAdapter<String>>(storage: S) {
    let job = mock_job("early");
    assert!(storage.enqueue(job.clone()).await.unwrap());
    let claimed = storage.dequeue(Duration::ZERO).await.unwrap().unwrap();
    let execute_at = Utc::now() + TimeDelta::minutes(5);
    storage.schedule_delayed(claimed, execute_at).await.unwrap();

    assert_eq!(storage.promote_delayed_jobs().await.unwrap(), 0);
    let parked = storage.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(parked.next_attempt_at, Some(execute_at));
}

pub async fn promoted_jobs_join_the_tail<S: StorageAdapter<String>>(storage: S) {
    let delayed = mock_job("promoted");
    assert!(storage.enqueue(delayed.clone()).await.unwrap());
    let claimed = storage.dequeue(Duration::ZERO).await.unwrap().unwrap();
    storage
        .schedule_delayed(claimed, Utc::now() - TimeDelta::seconds(1))
        .await
        .unwrap();

    assert!(storage.enqueue(mock_job("always ready")).await.unwrap());
    assert_eq!(storage.promote_delayed_jobs().await.unwrap(), 1);

    let first = storage.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(first.payload, "always ready");
    let second = storage.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(second.id, delayed.id);
}

pub async fn recover_requeues_stuck_jobs_at_the_front<S: StorageAdapter<String>>(storage: S) {
    let stuck = mock_job("stuck");
    assert!(storage.enqueue(stuck.clone()).await.unwrap());
    storage.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert!(storage.enqueue(mock_job("fresh")).await.unwrap());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let recovered = storage
        .recover_stuck_jobs(Duration::from_millis(25))
        .await
        .unwrap();
    assert_eq!(recovered, 1);

    // The reclaimed job goes ahead of work that was already ready.
    let first = storage.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(first.id, stuck.id);
    assert_eq!(first.attempts, 2);
    let second = storage.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(second.payload, "fresh");
}

pub async fn recover_ignores_recent_claims<S: StorageAdapter<String>>(storage: S) {
    let job = mock_job("in flight");
    assert!(storage.enqueue(job.clone()).await.unwrap());
    storage.dequeue(Duration::ZERO).await.unwrap().unwrap();

    let recovered = storage
        .recover_stuck_jobs(Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(recovered, 0);
    assert_eq!(storage.processing_jobs().await.unwrap(), vec![job.id]);
}

pub async fn mark_completed_is_terminal_and_idempotent<S: StorageAdapter<String>>(storage: S) {
    let job = mock_job("done");
    assert!(storage.enqueue(job.clone()).await.unwrap());
    storage.dequeue(Duration::ZERO).await.unwrap().unwrap();

    storage.mark_completed(job.id).await.unwrap();
    let completed = storage.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(completed.status, JobStatus::Completed);
    assert!(completed.processing_started_at.is_none());
    assert!(storage.processing_jobs().await.unwrap().is_empty());

    // Repeating, or completing an unknown id, is a no-op.
    storage.mark_completed(job.id).await.unwrap();
    storage.mark_completed(JobId::new()).await.unwrap();
}

pub async fn mark_failed_records_the_error<S: StorageAdapter<String>>(storage: S) {
    let job = mock_job("doomed");
    assert!(storage.enqueue(job.clone()).await.unwrap());
    storage.dequeue(Duration::ZERO).await.unwrap().unwrap();

    storage.mark_failed(job.id, "boom").await.unwrap();
    let failed = storage.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("boom"));
    assert!(storage.processing_jobs().await.unwrap().is_empty());

    storage.mark_failed(JobId::new(), "missing").await.unwrap();
}

pub async fn mark_processing_stamps_the_worker<S: StorageAdapter<String>>(storage: S) {
    let job = mock_job("claimed");
    assert!(storage.enqueue(job.clone()).await.unwrap());
    storage.dequeue(Duration::ZERO).await.unwrap().unwrap();

    storage.mark_processing(job.id, "worker-0").await.unwrap();
    let claimed = storage.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(claimed.worker_id.as_deref(), Some("worker-0"));
    assert_eq!(claimed.status, JobStatus::Processing);
}

pub async fn update_job_rewrites_the_record<S: StorageAdapter<String>>(storage: S) {
    let job = mock_job("original");
    assert!(storage.enqueue(job.clone()).await.unwrap());

    let mut updated = storage.get_job(job.id).await.unwrap().unwrap();
    updated.max_attempts = 7;
    storage.update_job(updated).await.unwrap();

    let read_back = storage.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(read_back.max_attempts, 7);
    assert!(read_back.updated_at.is_some());
}

pub async fn lifecycle_is_idempotent<S: StorageAdapter<String>>(storage: S) {
    storage.connect().await.unwrap();
    storage.connect().await.unwrap();
    storage.disconnect().await.unwrap();
    storage.disconnect().await.unwrap();
}

/// Create the [`StorageAdapter`] contract test suite for a backend.
///
/// The expression is re-evaluated per test, so each test runs against a
/// fresh storage. A different async test attribute can be supplied for
/// backends needing one.
#[macro_export]
macro_rules! storage_test_suite {
    (for: $storage:expr) => {
        $crate::storage_test_suite!(attr: tokio::test, storage: $storage);
    };
    (attr: $attr:meta, storage: $storage:expr) => {
        #[$attr]
        async fn enqueue_then_dequeue_is_fifo() {
            $crate::storage::testing::enqueue_then_dequeue_is_fifo($storage).await;
        }
        #[$attr]
        async fn enqueue_rejects_when_full() {
            $crate::storage::testing::enqueue_rejects_when_full($storage).await;
        }
        #[$attr]
        async fn dequeue_returns_none_immediately_with_zero_timeout() {
            $crate::storage::testing::dequeue_returns_none_immediately_with_zero_timeout($storage)
                .await;
        }
        #[$attr]
        async fn dequeue_blocks_until_a_job_arrives() {
            $crate::storage::testing::dequeue_blocks_until_a_job_arrives($storage).await;
        }
        #[$attr]
        async fn dequeue_returns_none_after_timeout() {
            $crate::storage::testing::dequeue_returns_none_after_timeout($storage).await;
        }
        #[$attr]
        async fn concurrent_dequeues_claim_distinct_jobs() {
            $crate::storage::testing::concurrent_dequeues_claim_distinct_jobs($storage).await;
        }
        #[$attr]
        async fn dequeue_counts_attempts_across_retries() {
            $crate::storage::testing::dequeue_counts_attempts_across_retries($storage).await;
        }
        #[$attr]
        async fn peek_does_not_claim() {
            $crate::storage::testing::peek_does_not_claim($storage).await;
        }
        #[$attr]
        async fn size_reflects_ready_set_only() {
            $crate::storage::testing::size_reflects_ready_set_only($storage).await;
        }
        #[$attr]
        async fn promote_moves_due_jobs_to_ready() {
            $crate::storage::testing::promote_moves_due_jobs_to_ready($storage).await;
        }
        #[$attr]
        async fn promote_skips_jobs_scheduled_in_the_future() {
            $crate::storage::testing::promote_skips_jobs_scheduled_in_the_future($storage).await;
        }
        #[$attr]
        async fn promoted_jobs_join_the_tail() {
            $crate::storage::testing::promoted_jobs_join_the_tail($storage).await;
        }
        #[$attr]
        async fn recover_requeues_stuck_jobs_at_the_front() {
            $crate::storage::testing::recover_requeues_stuck_jobs_at_the_front($storage).await;
        }
        #[$attr]
        async fn recover_ignores_recent_claims() {
            $crate::storage::testing::recover_ignores_recent_claims($storage).await;
        }
        #[$attr]
        async fn mark_completed_is_terminal_and_idempotent() {
            $crate::storage::testing::mark_completed_is_terminal_and_idempotent($storage).await;
        }
        #[$attr]
        async fn mark_failed_records_the_error() {
            $crate::storage::testing::mark_failed_records_the_error($storage).await;
        }
        #[$attr]
        async fn mark_processing_stamps_the_worker() {
            $crate::storage::testing::mark_processing_stamps_the_worker($storage).await;
        }
        #[$attr]
        async fn update_job_rewrites_the_record() {
            $crate::storage::testing::update_job_rewrites_the_record($storage).await;
        }
        #[$attr]
        async fn lifecycle_is_idempotent() {
            $crate::storage::testing::lifecycle_is_idempotent($storage).await;
        }
    };
}
