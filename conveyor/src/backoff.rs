//! Retry backoff strategies for use with
//! [`crate::worker::WorkerPoolOptions`].
//!
//! The worker pool's default is an un-jittered exponential strategy with a
//! two second base, so a job that has failed its `n`th attempt is retried
//! after `2^n` seconds. Constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! # use conveyor::backoff::{BackoffStrategy, Strategy};
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::exponential(TimeDelta::seconds(2))
//!     .with_max(TimeDelta::seconds(30));
//!
//! assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
//! assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
//! assert_eq!(strategy.backoff(3), TimeDelta::seconds(8));
//! assert_eq!(strategy.backoff(5), TimeDelta::seconds(30));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given a job's attempt count, returns how long to wait before the job
    /// should be retried.
    fn backoff(&self, attempt: u16) -> TimeDelta;
}

/// Constant backoff: the same delay no matter the attempt.
///
/// Constructed via [`BackoffStrategy::constant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: TimeDelta,
}

impl Strategy for Constant {
    fn backoff(&self, _attempt: u16) -> TimeDelta {
        self.delay
    }
}

/// Exponential backoff: the delay is `base^attempt` seconds, optionally
/// clamped via [`BackoffStrategy::with_max`].
///
/// Constructed via [`BackoffStrategy::exponential`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let mut seconds = self
            .base
            .num_seconds()
            .checked_pow(attempt.into())
            .unwrap_or(i64::MAX);
        if let Some(max) = self.max {
            seconds = seconds.min(max.num_seconds());
        }
        TimeDelta::try_seconds(seconds).unwrap_or(TimeDelta::MAX)
    }
}

/// A random jitter applied on top of a computed backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Added jitter in the range `-delta ..= delta`.
    Absolute(TimeDelta),
    /// Added jitter as a proportion of the computed backoff.
    Relative(f64),
}

impl Jitter {
    fn apply(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        };
        if milliseconds == 0 {
            return value;
        }
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value + TimeDelta::milliseconds(jitter)
    }
}

/// A [`Strategy`] together with optional jitter and a minimum bound.
///
/// # Example
///
/// ```
/// # use conveyor::backoff::{BackoffStrategy, Jitter, Strategy};
/// # use chrono::TimeDelta;
/// let strategy = BackoffStrategy::constant(TimeDelta::seconds(20))
///     .with_jitter(Jitter::Absolute(TimeDelta::seconds(5)))
///     .with_min(TimeDelta::seconds(1));
///
/// assert!(strategy.backoff(1) >= TimeDelta::seconds(15));
/// assert!(strategy.backoff(1) <= TimeDelta::seconds(25));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl BackoffStrategy<Constant> {
    /// A strategy returning the same delay for every attempt.
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Exponential> {
    /// A strategy growing exponentially with each attempt: `base^attempt`
    /// seconds.
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Exponential { base, max: None })
    }

    /// Clamps the computed backoff (before jitter) to `max_delay`.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    /// Wraps a custom [`Strategy`]. The strategy-specific constructors
    /// ([`BackoffStrategy::constant`], [`BackoffStrategy::exponential`]) are
    /// the common entry points.
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    /// Adds a random jitter to every computed backoff.
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Lower-bounds the result, useful with large jitters.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let backoff = self.strategy.backoff(attempt);
        let backoff = match self.jitter {
            Some(jitter) => jitter.apply(backoff),
            None => backoff,
        };
        backoff.max(self.min)
    }
}
