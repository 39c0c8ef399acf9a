//! Observer notifications for queue and worker lifecycle transitions.
//!
//! Handlers are registered explicitly on the [`Queue`](crate::queue::Queue)
//! or [`WorkerPool`](crate::worker::WorkerPool) and invoked synchronously,
//! fire-and-forget, after the corresponding state transition has been
//! committed to storage. Handlers must therefore be fast and must not block;
//! anything expensive belongs on a channel of the handler's own.
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::job::Job;

/// Why a job was dropped instead of enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The incoming job was discarded because the queue was full.
    DropNewest,
    /// The ready-set head was evicted to make room.
    DropOldest,
    /// Eviction found no ready job to displace (all capacity in flight).
    DropOldestFailed,
}

/// A lifecycle notification.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum QueueEvent<T> {
    /// A job was accepted into the queue.
    Added { job: Job<T> },
    /// A job was dropped by a backpressure strategy.
    Dropped { job: Job<T>, reason: DropReason },
    /// A worker claimed the job and is about to run it.
    ProcessingStarted { job: Job<T>, worker: String },
    /// The processor returned success.
    Completed { job: Job<T>, duration: Duration },
    /// The processor failed with attempts remaining; the job was parked.
    RetryScheduled {
        job: Job<T>,
        error: String,
        next_attempt_at: DateTime<Utc>,
    },
    /// The processor failed on the final attempt.
    Failed { job: Job<T>, error: String },
    /// Delayed jobs became due and re-entered the ready set.
    DelayedPromoted { count: usize },
    /// Abandoned processing jobs were reclaimed.
    StuckJobsRecovered { count: usize },
}

/// Receives [`QueueEvent`]s. Also implemented for plain closures.
pub trait EventHandler<T>: Send + Sync {
    fn on_event(&self, event: &QueueEvent<T>);
}

impl<T, F> EventHandler<T> for F
where
    F: Fn(&QueueEvent<T>) + Send + Sync,
{
    fn on_event(&self, event: &QueueEvent<T>) {
        self(event)
    }
}

/// A shared, registration-order list of handlers.
pub(crate) struct Hooks<T> {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler<T>>>>>,
}

impl<T> Clone for Hooks<T> {
    fn clone(&self) -> Self {
        Self {
            handlers: Arc::clone(&self.handlers),
        }
    }
}

impl<T> Default for Hooks<T> {
    fn default() -> Self {
        Self {
            handlers: Default::default(),
        }
    }
}

impl<T> Hooks<T> {
    pub(crate) fn subscribe(&self, handler: Arc<dyn EventHandler<T>>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.push(handler);
        }
    }

    /// Invokes every handler in registration order. A poisoned handler list
    /// silently drops the event rather than stalling the emitter.
    pub(crate) fn emit(&self, event: QueueEvent<T>) {
        if let Ok(handlers) = self.handlers.read() {
            for handler in handlers.iter() {
                handler.on_event(&event);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::Mutex;

    use super::*;

    /// Records every event it sees; used across the crate's tests.
    pub(crate) struct Recorder<T> {
        events: Mutex<Vec<QueueEvent<T>>>,
    }

    impl<T> Default for Recorder<T> {
        fn default() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }
    }

    impl<T: Clone> Recorder<T> {
        pub(crate) fn events(&self) -> Vec<QueueEvent<T>> {
            self.events.lock().unwrap().clone()
        }

        pub(crate) fn count(&self, matches: impl Fn(&QueueEvent<T>) -> bool) -> usize {
            self.events.lock().unwrap().iter().filter(|e| matches(e)).count()
        }
    }

    impl<T: Clone + Send> EventHandler<T> for Recorder<T> {
        fn on_event(&self, event: &QueueEvent<T>) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let hooks: Hooks<()> = Hooks::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            hooks.subscribe(Arc::new(move |_event: &QueueEvent<()>| {
                order.lock().unwrap().push(tag);
            }));
        }

        hooks.emit(QueueEvent::DelayedPromoted { count: 1 });
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn emit_without_handlers_is_a_noop() {
        let hooks: Hooks<()> = Hooks::default();
        hooks.emit(QueueEvent::StuckJobsRecovered { count: 3 });
    }
}
