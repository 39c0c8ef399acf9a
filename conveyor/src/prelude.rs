//! Prelude importing the types needed for common usage of the crate.
pub use crate::backoff::{BackoffStrategy, Jitter, Strategy};
pub use crate::events::{DropReason, EventHandler, QueueEvent};
pub use crate::job::{Job, JobId, JobStatus};
pub use crate::metrics::{MetricsSink, NoopMetrics};
pub use crate::queue::{AddOptions, BackpressureStrategy, Queue, QueueError, QueueOptions};
pub use crate::storage::{StorageAdapter, StorageError};
pub use crate::worker::{
    ProcessingError, Processor, WorkerPool, WorkerPoolError, WorkerPoolOptions,
};
