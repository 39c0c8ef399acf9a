//! In-process implementation of [`StorageAdapter`].
//!
//! This is the reference implementation of the contract: correct under
//! concurrent producers, consumers and the housekeeping loops within a single
//! process. Instances are cheaply cloneable handles onto shared state, so a
//! [`crate::queue::Queue`] and a [`crate::worker::WorkerPool`] can operate on
//! the same queue by holding clones of one storage (usually obtained from a
//! [`super::registry::StorageRegistry`]).
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use fxhash::FxHashMap;
use tokio::sync::{oneshot, Notify};

use super::{StorageAdapter, StorageError};
use crate::job::{Job, JobId, JobStatus};

const DEFAULT_CAPACITY: usize = 1000;

/// A consumer parked in [`StorageAdapter::dequeue`] waiting for work.
struct Consumer<T> {
    token: u64,
    tx: oneshot::Sender<Job<T>>,
}

struct Inner<T> {
    /// Ids eligible for immediate dequeue, FIFO.
    ready: VecDeque<JobId>,
    /// Authoritative record of every job, whichever set it is in.
    jobs: FxHashMap<JobId, Job<T>>,
    /// Claimed ids, keyed by claim time.
    processing: FxHashMap<JobId, DateTime<Utc>>,
    /// Parked ids, keyed by scheduled execution time.
    delayed: FxHashMap<JobId, DateTime<Utc>>,
    consumers: VecDeque<Consumer<T>>,
    consumer_seq: u64,
}

impl<T> Default for Inner<T> {
    fn default() -> Self {
        Self {
            ready: Default::default(),
            jobs: Default::default(),
            processing: Default::default(),
            delayed: Default::default(),
            consumers: Default::default(),
            consumer_seq: 0,
        }
    }
}

/// Point-in-time set sizes, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStats {
    pub ready: usize,
    pub processing: usize,
    pub delayed: usize,
    pub total: usize,
}

/// An in-memory [`StorageAdapter`].
///
/// The ready list, job table, processing set, delayed set and consumer
/// wait-queue form one unit of mutual exclusion: every operation that touches
/// more than one of them does so under a single lock, which is never held
/// across an await point.
pub struct InMemoryStorage<T> {
    inner: Arc<Mutex<Inner<T>>>,
    vacancies: Arc<Notify>,
    capacity: usize,
}

impl<T> Clone for InMemoryStorage<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            vacancies: Arc::clone(&self.vacancies),
            capacity: self.capacity,
        }
    }
}

impl<T> Default for InMemoryStorage<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<T> InMemoryStorage<T> {
    /// Creates a storage bounded to `capacity` ready jobs.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            vacancies: Arc::new(Notify::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the set sizes.
    pub fn stats(&self) -> Result<StorageStats, StorageError> {
        let inner = self.lock()?;
        Ok(StorageStats {
            ready: inner.ready.len(),
            processing: inner.processing.len(),
            delayed: inner.delayed.len(),
            total: inner.jobs.len(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner<T>>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::BadState)
    }
}

impl<T> Job<T> {
    fn claim(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.attempts += 1;
        self.processing_started_at = Some(now);
        self.updated_at = Some(now);
    }

    fn release_claim(&mut self) {
        self.status = JobStatus::Pending;
        self.attempts -= 1;
        self.processing_started_at = None;
    }

    fn park(&mut self, execute_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.next_attempt_at = Some(execute_at);
        self.processing_started_at = None;
        self.worker_id = None;
        self.updated_at = Some(now);
    }

    fn unpark(&mut self, now: DateTime<Utc>) {
        self.next_attempt_at = None;
        self.updated_at = Some(now);
    }

    fn reset_to_pending(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.processing_started_at = None;
        self.worker_id = None;
        self.updated_at = Some(now);
    }

    fn complete(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.processing_started_at = None;
        self.updated_at = Some(now);
    }

    fn fail(&mut self, error: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.to_owned());
        self.processing_started_at = None;
        self.updated_at = Some(now);
    }
}

impl<T> Inner<T>
where
    T: Clone,
{
    /// Claims the ready-set head, skipping ids whose record has vanished.
    fn claim_next(&mut self, now: DateTime<Utc>) -> Option<Job<T>> {
        while let Some(id) = self.ready.pop_front() {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.claim(now);
                let claimed = job.clone();
                self.processing.insert(id, now);
                return Some(claimed);
            }
        }
        None
    }

    /// Hands the job straight to a parked consumer, returning whether one
    /// took it. The claim is stamped before the send and reverted when the
    /// consumer timed out between registering and receiving.
    fn try_deliver(&mut self, id: JobId, now: DateTime<Utc>) -> bool {
        while let Some(consumer) = self.consumers.pop_front() {
            if consumer.tx.is_closed() {
                continue;
            }
            let Some(job) = self.jobs.get_mut(&id) else {
                return false;
            };
            job.claim(now);
            let claimed = job.clone();
            match consumer.tx.send(claimed) {
                Ok(()) => {
                    self.processing.insert(id, now);
                    return true;
                }
                Err(_) => {
                    if let Some(job) = self.jobs.get_mut(&id) {
                        job.release_claim();
                    }
                }
            }
        }
        false
    }
}

#[async_trait]
impl<T> StorageAdapter<T> for InMemoryStorage<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn connect(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        {
            let mut inner = self.lock()?;
            inner.ready.clear();
            inner.jobs.clear();
            inner.processing.clear();
            inner.delayed.clear();
            // Dropping the senders wakes parked consumers with `None`.
            inner.consumers.clear();
        }
        // Parked producers re-check fullness and observe the cleared state.
        self.vacancies.notify_waiters();
        Ok(())
    }

    async fn enqueue(&self, mut job: Job<T>) -> Result<bool, StorageError> {
        let now = Utc::now();
        let mut inner = self.lock()?;
        job.status = JobStatus::Pending;
        job.created_at.get_or_insert(now);
        job.updated_at = Some(now);
        let id = job.id;
        // A re-inserted job must not keep membership in another set.
        inner.processing.remove(&id);
        inner.delayed.remove(&id);
        let existed = inner.jobs.insert(id, job).is_some();
        if inner.try_deliver(id, now) {
            return Ok(true);
        }
        if inner.ready.len() >= self.capacity {
            if !existed {
                inner.jobs.remove(&id);
            }
            return Ok(false);
        }
        inner.ready.push_back(id);
        Ok(true)
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job<T>>, StorageError> {
        let (token, receiver) = {
            let mut inner = self.lock()?;
            if let Some(job) = inner.claim_next(Utc::now()) {
                // A ready slot was freed.
                self.vacancies.notify_one();
                return Ok(Some(job));
            }
            if timeout.is_zero() {
                return Ok(None);
            }
            let (tx, rx) = oneshot::channel();
            inner.consumer_seq += 1;
            let token = inner.consumer_seq;
            inner.consumers.push_back(Consumer { token, tx });
            (token, rx)
        };
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(job)) => Ok(Some(job)),
            // Sender dropped: the storage was cleared while we were parked.
            Ok(Err(_)) => Ok(None),
            Err(_elapsed) => {
                let mut inner = self.lock()?;
                inner.consumers.retain(|consumer| consumer.token != token);
                Ok(None)
            }
        }
    }

    async fn peek(&self) -> Result<Option<Job<T>>, StorageError> {
        let inner = self.lock()?;
        for id in &inner.ready {
            if let Some(job) = inner.jobs.get(id) {
                return Ok(Some(job.clone()));
            }
        }
        Ok(None)
    }

    async fn size(&self) -> Result<usize, StorageError> {
        Ok(self.lock()?.ready.len())
    }

    async fn is_full(&self) -> Result<bool, StorageError> {
        Ok(self.lock()?.ready.len() >= self.capacity)
    }

    async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.lock()?.ready.is_empty())
    }

    async fn schedule_delayed(
        &self,
        mut job: Job<T>,
        execute_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        let mut inner = self.lock()?;
        job.park(execute_at, now);
        let id = job.id;
        inner.processing.remove(&id);
        inner.ready.retain(|ready_id| *ready_id != id);
        inner.delayed.insert(id, execute_at);
        inner.jobs.insert(id, job);
        Ok(())
    }

    async fn promote_delayed_jobs(&self) -> Result<usize, StorageError> {
        let now = Utc::now();
        let mut inner = self.lock()?;
        let due: Vec<JobId> = inner
            .delayed
            .iter()
            .filter(|(_, execute_at)| **execute_at <= now)
            .map(|(id, _)| *id)
            .collect();
        let mut promoted = 0;
        for id in due {
            inner.delayed.remove(&id);
            match inner.jobs.get_mut(&id) {
                None => continue,
                Some(job) => job.unpark(now),
            }
            if !inner.try_deliver(id, now) {
                // Promoted jobs join the tail; they do not jump ahead of
                // work that was always ready.
                inner.ready.push_back(id);
            }
            promoted += 1;
        }
        Ok(promoted)
    }

    async fn mark_processing(&self, id: JobId, worker_id: &str) -> Result<(), StorageError> {
        let now = Utc::now();
        let mut inner = self.lock()?;
        match inner.jobs.get_mut(&id) {
            None => Ok(()),
            Some(job) => {
                job.status = JobStatus::Processing;
                job.processing_started_at = Some(now);
                job.worker_id = Some(worker_id.to_owned());
                job.updated_at = Some(now);
                inner.processing.insert(id, now);
                Ok(())
            }
        }
    }

    async fn mark_completed(&self, id: JobId) -> Result<(), StorageError> {
        let now = Utc::now();
        let mut inner = self.lock()?;
        match inner.jobs.get_mut(&id) {
            None => Ok(()),
            Some(job) => {
                job.complete(now);
                inner.processing.remove(&id);
                Ok(())
            }
        }
    }

    async fn mark_failed(&self, id: JobId, error: &str) -> Result<(), StorageError> {
        let now = Utc::now();
        let mut inner = self.lock()?;
        match inner.jobs.get_mut(&id) {
            None => Ok(()),
            Some(job) => {
                job.fail(error, now);
                inner.processing.remove(&id);
                Ok(())
            }
        }
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job<T>>, StorageError> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }

    async fn update_job(&self, mut job: Job<T>) -> Result<(), StorageError> {
        job.updated_at = Some(Utc::now());
        self.lock()?.jobs.insert(job.id, job);
        Ok(())
    }

    async fn recover_stuck_jobs(&self, older_than: Duration) -> Result<usize, StorageError> {
        let now = Utc::now();
        let threshold = TimeDelta::from_std(older_than).unwrap_or(TimeDelta::MAX);
        let mut inner = self.lock()?;
        let mut stuck: Vec<(JobId, DateTime<Utc>)> = inner
            .processing
            .iter()
            .filter(|(_, started_at)| now.signed_duration_since(**started_at) >= threshold)
            .map(|(id, started_at)| (*id, *started_at))
            .collect();
        // Pushed to the front newest-first so the oldest claim ends up at
        // the very head of the ready set.
        stuck.sort_by_key(|(_, started_at)| std::cmp::Reverse(*started_at));
        let mut recovered = 0;
        for (id, _) in stuck {
            inner.processing.remove(&id);
            match inner.jobs.get_mut(&id) {
                None => continue,
                Some(job) => job.reset_to_pending(now),
            }
            if !inner.try_deliver(id, now) {
                inner.ready.push_front(id);
            }
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn processing_jobs(&self) -> Result<Vec<JobId>, StorageError> {
        Ok(self.lock()?.processing.keys().copied().collect())
    }

    async fn await_vacancy(&self, timeout: Duration) -> Result<bool, StorageError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut notified = std::pin::pin!(self.vacancies.notified());
            // Register before checking fullness so a wakeup between the
            // check and the await is not lost.
            notified.as_mut().enable();
            if self.lock()?.ready.len() < self.capacity {
                return Ok(true);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(false);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage_test_suite;

    storage_test_suite!(for: InMemoryStorage::new(5));

    #[tokio::test]
    async fn disconnect_clears_state_and_wakes_consumers() {
        let storage = InMemoryStorage::new(5);
        storage.enqueue(Job::new("payload")).await.unwrap();

        let handle = tokio::spawn({
            let storage = storage.clone();
            async move {
                // Drain the only job, then park.
                storage.dequeue(Duration::ZERO).await.unwrap();
                storage.dequeue(Duration::from_secs(5)).await.unwrap()
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        storage.disconnect().await.unwrap();
        assert!(handle.await.unwrap().is_none());

        let stats = storage.stats().unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.processing, 0);
    }

    #[tokio::test]
    async fn enqueue_hands_job_to_parked_consumer() {
        let storage = InMemoryStorage::new(5);
        let handle = tokio::spawn({
            let storage = storage.clone();
            async move { storage.dequeue(Duration::from_secs(5)).await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let job = Job::new("direct");
        assert!(storage.enqueue(job.clone()).await.unwrap());

        let received = handle.await.unwrap().expect("consumer should be woken");
        assert_eq!(received.id, job.id);
        assert_eq!(received.status, JobStatus::Processing);
        assert_eq!(received.attempts, 1);
        // The job never entered the ready set.
        assert_eq!(storage.size().await.unwrap(), 0);
        assert_eq!(storage.stats().unwrap().processing, 1);
    }

    #[tokio::test]
    async fn await_vacancy_wakes_on_dequeue() {
        let storage = InMemoryStorage::new(1);
        storage.enqueue(Job::new(1)).await.unwrap();
        assert!(storage.is_full().await.unwrap());

        let handle = tokio::spawn({
            let storage = storage.clone();
            async move { storage.await_vacancy(Duration::from_secs(5)).await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        storage.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn await_vacancy_times_out_while_full() {
        let storage = InMemoryStorage::new(1);
        storage.enqueue(Job::new(1)).await.unwrap();
        assert!(!storage
            .await_vacancy(Duration::from_millis(50))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn stats_reflect_set_membership() {
        let storage = InMemoryStorage::new(5);
        storage.enqueue(Job::new(1)).await.unwrap();
        storage.enqueue(Job::new(2)).await.unwrap();
        let claimed = storage.dequeue(Duration::ZERO).await.unwrap().unwrap();
        storage
            .schedule_delayed(claimed, Utc::now() + TimeDelta::minutes(5))
            .await
            .unwrap();

        let stats = storage.stats().unwrap();
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.total, 2);
    }
}
