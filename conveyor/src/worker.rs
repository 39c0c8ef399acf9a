//! The consumer side: a pool of worker loops with retry, delayed-job
//! promotion and stuck-job recovery.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::{BackoffStrategy, Exponential, Strategy};
use crate::events::{EventHandler, Hooks, QueueEvent};
use crate::job::{Job, JobStatus};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::storage::{StorageAdapter, StorageError};

/// Default retry schedule: the job's `n`th failed attempt is retried after
/// `2^n` seconds.
const DEFAULT_BACKOFF: BackoffStrategy<Exponential> =
    BackoffStrategy::exponential(TimeDelta::seconds(2));

/// Pause after a storage error in a worker loop before retrying.
const STORAGE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Executes jobs. Business failures are returned as [`ProcessingError`]s and
/// drive the retry state machine; they are never surfaced to producers.
#[async_trait]
pub trait Processor<T>: Send + Sync {
    async fn process(&self, job: &Job<T>) -> Result<(), ProcessingError>;
}

/// A business-logic failure reported by a [`Processor`].
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProcessingError {
    message: String,
}

impl ProcessingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<&str> for ProcessingError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for ProcessingError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

#[derive(Clone)]
pub struct WorkerPoolOptions {
    /// Number of concurrent worker loops.
    pub concurrency: usize,
    /// Age at which a claimed job is presumed abandoned.
    pub stuck_job_timeout: Duration,
    /// How long each worker loop blocks waiting for work per iteration.
    pub dequeue_timeout: Duration,
    /// Cadence of the delayed-job promotion loop.
    pub promote_interval: Duration,
    /// Cadence of the periodic stuck-job scan (recovery also runs once at
    /// startup).
    pub recovery_interval: Duration,
    /// Retry schedule applied to failed jobs with attempts remaining.
    pub backoff: Arc<dyn Strategy + Send + Sync>,
}

impl Default for WorkerPoolOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            stuck_job_timeout: Duration::from_secs(30),
            dequeue_timeout: Duration::from_secs(5),
            promote_interval: Duration::from_millis(100),
            recovery_interval: Duration::from_secs(30),
            backoff: Arc::new(DEFAULT_BACKOFF),
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerPoolError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// In-flight jobs did not drain within the graceful shutdown timeout.
    /// Storage is disconnected regardless; the in-flight processor calls
    /// were not cancelled and their jobs will be reclaimed as stuck.
    #[error("worker pool did not drain within the graceful shutdown timeout")]
    GracefulShutdownTimedOut,
}

/// Everything the spawned loops need, shared behind one [`Arc`].
struct PoolContext<T, S> {
    queue_name: String,
    storage: S,
    processor: Arc<dyn Processor<T>>,
    options: WorkerPoolOptions,
    hooks: Hooks<T>,
    metrics: Arc<dyn MetricsSink>,
    active: Arc<AtomicUsize>,
}

/// A pool of workers consuming one named queue.
///
/// On [`WorkerPool::start`], jobs orphaned by a previous crashed instance are
/// reclaimed once, then `concurrency` worker loops and a housekeeping loop
/// (delayed-job promotion plus periodic recovery) run until
/// [`WorkerPool::stop`]. A claimed job always runs to completion or failure
/// of the processor; crash recovery, not cancellation, is how abandoned work
/// is returned to the queue.
pub struct WorkerPool<T, S> {
    queue_name: String,
    storage: S,
    processor: Arc<dyn Processor<T>>,
    options: WorkerPoolOptions,
    hooks: Hooks<T>,
    metrics: Arc<dyn MetricsSink>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    active: Arc<AtomicUsize>,
    running: bool,
}

impl<T, S> WorkerPool<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: StorageAdapter<T> + Clone + 'static,
{
    pub fn new(
        queue_name: impl Into<String>,
        storage: S,
        processor: impl Processor<T> + 'static,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            storage,
            processor: Arc::new(processor),
            options: WorkerPoolOptions::default(),
            hooks: Hooks::default(),
            metrics: Arc::new(NoopMetrics),
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
            active: Arc::new(AtomicUsize::new(0)),
            running: false,
        }
    }

    pub fn with_options(mut self, options: WorkerPoolOptions) -> Self {
        self.options = options;
        self
    }

    /// Registers an observer for worker lifecycle notifications.
    pub fn on_event(self, handler: Arc<dyn EventHandler<T>>) -> Self {
        self.hooks.subscribe(handler);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Number of jobs currently inside processor callbacks.
    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Connects storage, reclaims jobs abandoned by a crashed predecessor,
    /// and spawns the worker and housekeeping loops. Idempotent while
    /// running.
    pub async fn start(&mut self) -> Result<(), WorkerPoolError> {
        if self.running {
            return Ok(());
        }
        self.storage.connect().await?;
        self.shutdown = CancellationToken::new();

        let context = Arc::new(PoolContext {
            queue_name: self.queue_name.clone(),
            storage: self.storage.clone(),
            processor: Arc::clone(&self.processor),
            options: self.options.clone(),
            hooks: self.hooks.clone(),
            metrics: Arc::clone(&self.metrics),
            active: Arc::clone(&self.active),
        });

        let recovered = context
            .storage
            .recover_stuck_jobs(context.options.stuck_job_timeout)
            .await?;
        if recovered > 0 {
            tracing::info!(queue = %context.queue_name, recovered, "reclaimed jobs abandoned by a previous run");
            context.metrics.jobs_recovered(recovered);
            context
                .hooks
                .emit(QueueEvent::StuckJobsRecovered { count: recovered });
        }

        self.handles = Vec::with_capacity(context.options.concurrency + 1);
        for index in 0..context.options.concurrency {
            let worker = format!("{}-worker-{index}", context.queue_name);
            self.handles.push(tokio::spawn(worker_loop(
                Arc::clone(&context),
                self.shutdown.clone(),
                worker,
            )));
        }
        self.handles.push(tokio::spawn(housekeeping_loop(
            Arc::clone(&context),
            self.shutdown.clone(),
        )));

        tracing::debug!(queue = %self.queue_name, concurrency = self.options.concurrency, "worker pool started");
        self.running = true;
        Ok(())
    }

    /// Signals every loop to stop, waits up to `graceful_timeout` for
    /// in-flight jobs to drain, then disconnects storage.
    pub async fn stop(&mut self, graceful_timeout: Duration) -> Result<(), WorkerPoolError> {
        if !self.running {
            return Ok(());
        }
        tracing::debug!(queue = %self.queue_name, "stopping worker pool");
        self.running = false;
        self.shutdown.cancel();

        let handles = std::mem::take(&mut self.handles);
        let drained = tokio::time::timeout(graceful_timeout, futures::future::join_all(handles))
            .await
            .is_ok();

        self.storage.disconnect().await?;
        if drained {
            Ok(())
        } else {
            Err(WorkerPoolError::GracefulShutdownTimedOut)
        }
    }
}

async fn worker_loop<T, S>(
    context: Arc<PoolContext<T, S>>,
    shutdown: CancellationToken,
    worker: String,
) where
    T: Clone + Send + Sync + 'static,
    S: StorageAdapter<T>,
{
    loop {
        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = context.storage.dequeue(context.options.dequeue_timeout) => result,
        };
        match result {
            Ok(Some(job)) => {
                let active = context.active.fetch_add(1, Ordering::SeqCst) + 1;
                context
                    .metrics
                    .worker_utilization(active, context.options.concurrency.saturating_sub(active));

                process_job(&context, job, &worker).await;

                let active = context.active.fetch_sub(1, Ordering::SeqCst) - 1;
                context
                    .metrics
                    .worker_utilization(active, context.options.concurrency.saturating_sub(active));
            }
            Ok(None) => {}
            Err(error) => {
                // Backend failures are transient to the loop, never fatal.
                tracing::warn!(%worker, ?error, "storage error in worker loop, backing off");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(STORAGE_ERROR_BACKOFF) => {}
                }
            }
        }
    }
    tracing::debug!(%worker, "worker loop stopped");
}

async fn process_job<T, S>(context: &PoolContext<T, S>, mut job: Job<T>, worker: &str)
where
    T: Clone + Send + Sync + 'static,
    S: StorageAdapter<T>,
{
    let started = Instant::now();
    match context.storage.mark_processing(job.id, worker).await {
        Ok(()) => job.worker_id = Some(worker.to_owned()),
        // The claim stamp is advisory; the job still runs.
        Err(error) => tracing::warn!(%worker, job_id = %job.id, ?error, "failed to record worker claim"),
    }
    context.hooks.emit(QueueEvent::ProcessingStarted {
        job: job.clone(),
        worker: worker.to_owned(),
    });
    tracing::debug!(%worker, job_id = %job.id, attempt = job.attempts, "processing job");

    match context.processor.process(&job).await {
        Ok(()) => {
            let _ = context
                .storage
                .mark_completed(job.id)
                .await
                .inspect_err(|err| {
                    tracing::error!(job_id = %job.id, ?err, "failed to mark job as completed")
                });
            let duration = started.elapsed();
            context.metrics.job_completed(duration);
            job.status = JobStatus::Completed;
            context.hooks.emit(QueueEvent::Completed { job, duration });
        }
        Err(error) if job.has_attempts_remaining() => {
            let delay = context.options.backoff.backoff(job.attempts);
            let next_attempt_at = Utc::now() + delay;
            tracing::warn!(
                job_id = %job.id,
                attempt = job.attempts,
                %error,
                "job failed, retry scheduled for {next_attempt_at}",
            );
            match context
                .storage
                .schedule_delayed(job.clone(), next_attempt_at)
                .await
            {
                Ok(()) => {
                    context.metrics.job_retried();
                    context.hooks.emit(QueueEvent::RetryScheduled {
                        job,
                        error: error.to_string(),
                        next_attempt_at,
                    });
                }
                Err(err) => {
                    tracing::error!(job_id = %job.id, ?err, "failed to park job for retry")
                }
            }
        }
        Err(error) => {
            let message = error.to_string();
            tracing::error!(
                job_id = %job.id,
                attempt = job.attempts,
                %error,
                "job failed permanently",
            );
            let _ = context
                .storage
                .mark_failed(job.id, &message)
                .await
                .inspect_err(|err| {
                    tracing::error!(job_id = %job.id, ?err, "failed to mark job as failed")
                });
            context.metrics.job_failed();
            job.status = JobStatus::Failed;
            job.error = Some(message.clone());
            context.hooks.emit(QueueEvent::Failed {
                job,
                error: message,
            });
        }
    }
}

async fn housekeeping_loop<T, S>(context: Arc<PoolContext<T, S>>, shutdown: CancellationToken)
where
    T: Clone + Send + Sync + 'static,
    S: StorageAdapter<T>,
{
    let mut promote = tokio::time::interval(context.options.promote_interval);
    promote.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut recover = tokio::time::interval(context.options.recovery_interval);
    recover.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = promote.tick() => match context.storage.promote_delayed_jobs().await {
                Ok(0) => {}
                Ok(count) => {
                    tracing::debug!(queue = %context.queue_name, count, "promoted delayed jobs");
                    context.metrics.jobs_promoted(count);
                    if let Ok(depth) = context.storage.size().await {
                        context.metrics.queue_depth(depth);
                    }
                    context.hooks.emit(QueueEvent::DelayedPromoted { count });
                }
                Err(error) => {
                    tracing::warn!(queue = %context.queue_name, ?error, "failed to promote delayed jobs")
                }
            },
            _ = recover.tick() => match context
                .storage
                .recover_stuck_jobs(context.options.stuck_job_timeout)
                .await
            {
                Ok(0) => {}
                Ok(count) => {
                    tracing::info!(queue = %context.queue_name, count, "recovered stuck jobs");
                    context.metrics.jobs_recovered(count);
                    context.hooks.emit(QueueEvent::StuckJobsRecovered { count });
                }
                Err(error) => {
                    tracing::warn!(queue = %context.queue_name, ?error, "failed to recover stuck jobs")
                }
            },
        }
    }
    tracing::debug!(queue = %context.queue_name, "housekeeping loop stopped");
}
