//! A bounded job queue with pluggable storage, backpressure and retry.
//!
//! Producers submit work through a [`queue::Queue`]; a [`worker::WorkerPool`]
//! consumes it against any [`storage::StorageAdapter`] implementation. The
//! queue has bounded capacity with a configurable
//! [`queue::BackpressureStrategy`], failed jobs are retried on a
//! [`backoff::Strategy`] schedule via a delayed set, and jobs abandoned by a
//! crashed worker are reclaimed when a pool starts. Delivery is
//! at-least-once: a processor may see a job again after a crash, so it
//! should be idempotent.
//!
//! Lifecycle transitions are observable through
//! [`events::EventHandler`]s, and raw counters/timings are reported to a
//! [`metrics::MetricsSink`].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use async_trait::async_trait;
//! use conveyor::prelude::*;
//! use conveyor::storage::registry::StorageRegistry;
//!
//! struct EmailSender;
//!
//! #[async_trait]
//! impl Processor<String> for EmailSender {
//!     async fn process(&self, job: &Job<String>) -> Result<(), ProcessingError> {
//!         tracing::info!("sending email to {}", job.payload);
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = StorageRegistry::new();
//! let storage = registry.storage("emails", 1000)?;
//!
//! let queue = Queue::new("emails", storage.clone());
//! let job = queue.add("hello@example.com".to_owned()).await?;
//!
//! let mut pool = WorkerPool::new("emails", storage, EmailSender).with_options(WorkerPoolOptions {
//!     concurrency: 4,
//!     ..Default::default()
//! });
//! pool.start().await?;
//! # tokio::time::sleep(Duration::from_millis(200)).await;
//! # assert_eq!(queue.get_job(job.id).await?.unwrap().status, JobStatus::Completed);
//! pool.stop(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod events;
pub mod job;
pub mod metrics;
pub mod prelude;
pub mod queue;
pub mod storage;
pub mod worker;

pub use job::{Job, JobId, JobStatus};
pub use queue::{BackpressureStrategy, Queue, QueueError};
pub use storage::{StorageAdapter, StorageError};
pub use worker::{ProcessingError, Processor, WorkerPool, WorkerPoolError};

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::prelude::*;
    use crate::storage::registry::StorageRegistry;

    struct Uppercase;

    #[async_trait]
    impl Processor<String> for Uppercase {
        async fn process(&self, job: &Job<String>) -> Result<(), ProcessingError> {
            job.payload
                .is_ascii()
                .then_some(())
                .ok_or_else(|| ProcessingError::new("non-ascii payload"))
        }
    }

    #[tokio::test]
    async fn queue_and_pool_share_storage_through_the_registry() {
        let registry = StorageRegistry::new();
        let queue = Queue::new("shared", registry.storage("shared", 100).unwrap());
        let mut pool = WorkerPool::new(
            "shared",
            registry.storage("shared", 100).unwrap(),
            Uppercase,
        )
        .with_options(WorkerPoolOptions {
            dequeue_timeout: Duration::from_millis(50),
            ..Default::default()
        });

        let job = queue.add("hello".to_owned()).await.unwrap();
        pool.start().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let current = queue.get_job(job.id).await.unwrap().unwrap();
            if current.status == JobStatus::Completed {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "job never completed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.stop(Duration::from_secs(1)).await.unwrap();
        registry.clear().unwrap();
    }
}
