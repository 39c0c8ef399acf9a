//! The producer-facing queue API.
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::events::{DropReason, EventHandler, Hooks, QueueEvent};
use crate::job::{Job, JobId, JobStatus, DEFAULT_MAX_ATTEMPTS};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::storage::{StorageAdapter, StorageError};

/// How long a producer under [`BackpressureStrategy::BlockProducer`] parks in
/// the storage between enqueue retries. Backends with vacancy signalling wake
/// it earlier.
const BLOCK_PRODUCER_RETRY_INTERVAL: Duration = Duration::from_millis(500);

const EVICTED_ERROR: &str = "evicted: queue at capacity";

/// Producer behavior when the ready set is at capacity.
///
/// Strategies are mutually exclusive modes configured once per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressureStrategy {
    /// Suspend the producer until capacity frees up, then enqueue. Producers
    /// are served in arrival order.
    #[default]
    BlockProducer,
    /// Evict the ready-set head to make room for the incoming job. Jobs that
    /// are already being processed are never evicted.
    DropOldest,
    /// Discard the incoming job.
    DropNewest,
    /// Fail the `add` call immediately.
    Error,
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub backpressure: BackpressureStrategy,
    /// Attempt ceiling for jobs added without an explicit one.
    pub default_max_attempts: u16,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            backpressure: BackpressureStrategy::default(),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Per-job overrides for [`Queue::add_with_options`].
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub max_attempts: Option<u16>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue was full and the configured strategy discarded the job.
    #[error("queue `{queue}` is at capacity")]
    CapacityExceeded { queue: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The public submission API for a single named queue.
///
/// Composes a [`StorageAdapter`] with a backpressure strategy. Job outcomes
/// are observable through registered [`EventHandler`]s and
/// [`Queue::get_job`] polling; processing failures never surface through
/// `add`.
pub struct Queue<T, S> {
    name: String,
    storage: S,
    options: QueueOptions,
    hooks: Hooks<T>,
    metrics: Arc<dyn MetricsSink>,
    /// Serializes `DropOldest` evictions so two producers cannot both evict
    /// for the same slot.
    evict_lock: Mutex<()>,
}

impl<T, S> Queue<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: StorageAdapter<T>,
{
    pub fn new(name: impl Into<String>, storage: S) -> Self {
        Self {
            name: name.into(),
            storage,
            options: QueueOptions::default(),
            hooks: Hooks::default(),
            metrics: Arc::new(NoopMetrics),
            evict_lock: Mutex::new(()),
        }
    }

    pub fn with_options(mut self, options: QueueOptions) -> Self {
        self.options = options;
        self
    }

    /// Registers an observer for queue lifecycle notifications.
    pub fn on_event(self, handler: Arc<dyn EventHandler<T>>) -> Self {
        self.hooks.subscribe(handler);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub async fn connect(&self) -> Result<(), QueueError> {
        Ok(self.storage.connect().await?)
    }

    pub async fn disconnect(&self) -> Result<(), QueueError> {
        Ok(self.storage.disconnect().await?)
    }

    /// Adds a job with the queue's default options.
    pub async fn add(&self, payload: T) -> Result<Job<T>, QueueError> {
        self.add_with_options(payload, AddOptions::default()).await
    }

    /// Constructs a pending job and enqueues it, applying the configured
    /// backpressure strategy when the queue is full.
    pub async fn add_with_options(
        &self,
        payload: T,
        options: AddOptions,
    ) -> Result<Job<T>, QueueError> {
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.options.default_max_attempts);
        let job = Job::new(payload).with_max_attempts(max_attempts);

        if self.storage.enqueue(job.clone()).await? {
            return Ok(self.accepted(job));
        }
        self.handle_backpressure(job).await
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job<T>>, QueueError> {
        Ok(self.storage.get_job(id).await?)
    }

    pub async fn size(&self) -> Result<usize, QueueError> {
        Ok(self.storage.size().await?)
    }

    fn accepted(&self, job: Job<T>) -> Job<T> {
        self.metrics.job_added();
        self.hooks.emit(QueueEvent::Added { job: job.clone() });
        job
    }

    fn dropped(&self, job: Job<T>, reason: DropReason) {
        self.metrics.job_dropped();
        self.hooks.emit(QueueEvent::Dropped { job, reason });
    }

    fn capacity_error(&self) -> QueueError {
        QueueError::CapacityExceeded {
            queue: self.name.clone(),
        }
    }

    async fn handle_backpressure(&self, job: Job<T>) -> Result<Job<T>, QueueError> {
        match self.options.backpressure {
            BackpressureStrategy::Error => Err(self.capacity_error()),
            BackpressureStrategy::DropNewest => {
                tracing::debug!(queue = %self.name, job_id = %job.id, "queue full, dropping incoming job");
                self.dropped(job, DropReason::DropNewest);
                Err(self.capacity_error())
            }
            BackpressureStrategy::DropOldest => self.evict_oldest_and_enqueue(job).await,
            BackpressureStrategy::BlockProducer => self.block_until_enqueued(job).await,
        }
    }

    async fn evict_oldest_and_enqueue(&self, job: Job<T>) -> Result<Job<T>, QueueError> {
        let _guard = self.evict_lock.lock().await;

        // Capacity may have freed while waiting on the lock.
        if self.storage.enqueue(job.clone()).await? {
            return Ok(self.accepted(job));
        }

        let Some(mut evicted) = self.storage.dequeue(Duration::ZERO).await? else {
            // No ready job to displace; in-flight jobs are never dropped.
            self.dropped(job, DropReason::DropOldestFailed);
            return Err(self.capacity_error());
        };
        // The eviction dequeue stamped a claim on the victim; undo it.
        evicted.status = JobStatus::Pending;
        evicted.attempts = evicted.attempts.saturating_sub(1);
        evicted.processing_started_at = None;
        evicted.worker_id = None;

        if self.storage.enqueue(job.clone()).await? {
            // Retire the victim so it cannot linger in the processing set
            // and later be "recovered" as stuck.
            self.storage.mark_failed(evicted.id, EVICTED_ERROR).await?;
            tracing::debug!(queue = %self.name, evicted = %evicted.id, "evicted ready-set head to make room");
            self.dropped(evicted, DropReason::DropOldest);
            return Ok(self.accepted(job));
        }

        // A racing producer took the freed slot. Put the victim back rather
        // than lose it; the delayed set is the fallback when even that
        // re-insert finds the queue full.
        if !self.storage.enqueue(evicted.clone()).await? {
            self.storage.schedule_delayed(evicted, Utc::now()).await?;
        }
        self.dropped(job, DropReason::DropOldestFailed);
        Err(self.capacity_error())
    }

    async fn block_until_enqueued(&self, job: Job<T>) -> Result<Job<T>, QueueError> {
        loop {
            if self.storage.enqueue(job.clone()).await? {
                return Ok(self.accepted(job));
            }
            tracing::trace!(queue = %self.name, "queue full, producer waiting for capacity");
            self.storage
                .await_vacancy(BLOCK_PRODUCER_RETRY_INTERVAL)
                .await?;
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use assert_matches::assert_matches;

    use super::*;
    use crate::events::test::Recorder;
    use crate::metrics::test::CountingMetrics;
    use crate::storage::memory::InMemoryStorage;

    fn queue_with(
        capacity: usize,
        backpressure: BackpressureStrategy,
    ) -> (
        Queue<String, InMemoryStorage<String>>,
        InMemoryStorage<String>,
        Arc<Recorder<String>>,
    ) {
        let storage = InMemoryStorage::new(capacity);
        let recorder = Arc::new(Recorder::default());
        let queue = Queue::new("test", storage.clone())
            .with_options(QueueOptions {
                backpressure,
                ..Default::default()
            })
            .on_event(recorder.clone());
        (queue, storage, recorder)
    }

    #[tokio::test]
    async fn error_strategy_rejects_when_full() {
        let (queue, _storage, _recorder) = queue_with(2, BackpressureStrategy::Error);

        queue.add("a".to_owned()).await.unwrap();
        queue.add("b".to_owned()).await.unwrap();
        assert_matches!(
            queue.add("c".to_owned()).await,
            Err(QueueError::CapacityExceeded { queue }) if queue == "test"
        );
        assert_eq!(queue.size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn drop_newest_discards_the_incoming_job() {
        let (queue, storage, recorder) = queue_with(1, BackpressureStrategy::DropNewest);

        let kept = queue.add("kept".to_owned()).await.unwrap();
        assert_matches!(
            queue.add("dropped".to_owned()).await,
            Err(QueueError::CapacityExceeded { .. })
        );

        let dropped = recorder
            .events()
            .into_iter()
            .find_map(|event| match event {
                QueueEvent::Dropped { job, reason } => Some((job, reason)),
                _ => None,
            })
            .expect("drop notification should fire");
        assert_eq!(dropped.0.payload, "dropped");
        assert_eq!(dropped.1, DropReason::DropNewest);
        // Nothing was persisted for the dropped job.
        assert!(storage.get_job(dropped.0.id).await.unwrap().is_none());
        assert_eq!(storage.get_job(kept.id).await.unwrap().unwrap().payload, "kept");
    }

    #[tokio::test]
    async fn drop_oldest_evicts_the_ready_head() {
        let (queue, storage, recorder) = queue_with(2, BackpressureStrategy::DropOldest);

        let oldest = queue.add("a".to_owned()).await.unwrap();
        queue.add("b".to_owned()).await.unwrap();
        let newest = queue.add("c".to_owned()).await.unwrap();

        assert_eq!(queue.size().await.unwrap(), 2);

        // The victim is retired, not left claimed.
        let victim = storage.get_job(oldest.id).await.unwrap().unwrap();
        assert_eq!(victim.status, JobStatus::Failed);
        assert_eq!(victim.error.as_deref(), Some(EVICTED_ERROR));
        // The eviction dequeue counts as a claim on the stored record.
        assert_eq!(victim.attempts, 1);
        assert!(storage.processing_jobs().await.unwrap().is_empty());

        let head = storage.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(head.payload, "b");
        let tail = storage.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(tail.id, newest.id);

        assert_eq!(
            recorder.count(|event| matches!(
                event,
                QueueEvent::Dropped { reason: DropReason::DropOldest, .. }
            )),
            1
        );
    }

    #[tokio::test]
    async fn drop_oldest_never_touches_in_flight_jobs() {
        let (queue, storage, recorder) = queue_with(0, BackpressureStrategy::DropOldest);

        // Zero capacity: nothing ready to displace, and whatever is being
        // processed must not be dropped.
        assert_matches!(
            queue.add("rejected".to_owned()).await,
            Err(QueueError::CapacityExceeded { .. })
        );
        assert_eq!(
            recorder.count(|event| matches!(
                event,
                QueueEvent::Dropped { reason: DropReason::DropOldestFailed, .. }
            )),
            1
        );
        assert_eq!(storage.stats().unwrap().total, 0);
    }

    #[tokio::test]
    async fn block_producer_waits_for_a_vacancy() {
        let (queue, storage, _recorder) = queue_with(1, BackpressureStrategy::BlockProducer);
        queue.add("first".to_owned()).await.unwrap();

        let queue = Arc::new(queue);
        let blocked = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.add("second".to_owned()).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        // A consumer makes room; the parked producer finishes promptly.
        storage.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let added = blocked.await.unwrap().unwrap();
        assert_eq!(added.payload, "second");
        assert_eq!(queue.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn default_max_attempts_can_be_overridden_per_job() {
        let (queue, _storage, _recorder) = queue_with(10, BackpressureStrategy::Error);

        let default = queue.add("default".to_owned()).await.unwrap();
        assert_eq!(default.max_attempts, DEFAULT_MAX_ATTEMPTS);

        let custom = queue
            .add_with_options(
                "custom".to_owned(),
                AddOptions {
                    max_attempts: Some(7),
                },
            )
            .await
            .unwrap();
        assert_eq!(custom.max_attempts, 7);
    }

    #[tokio::test]
    async fn added_jobs_are_counted_and_announced() {
        let storage = InMemoryStorage::new(10);
        let metrics = Arc::new(CountingMetrics::default());
        let recorder = Arc::new(Recorder::default());
        let queue = Queue::new("test", storage)
            .with_metrics(metrics.clone())
            .on_event(recorder.clone());

        queue.add("a".to_owned()).await.unwrap();
        queue.add("b".to_owned()).await.unwrap();

        assert_eq!(metrics.added.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(
            recorder.count(|event| matches!(event, QueueEvent::Added { .. })),
            2
        );
    }
}
