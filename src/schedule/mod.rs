//! Timer scheduling abstraction.
//!
//! Wrappers never touch a clock or a timer directly. They ask a
//! [`Scheduler`] for the current time and for deferred execution, which lets
//! the same wrapper run against real tokio timers or a virtual clock.

mod manual;
mod runtime;

use std::fmt;
use std::time::Duration;

pub use manual::ManualScheduler;
pub use runtime::TokioScheduler;

/// Work to run when a timer fires.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a scheduled timer so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub(crate) u64);

impl TimerId {
    /// Get the raw timer number.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Trait for timer sources.
///
/// Time is a monotonic offset from the scheduler's own start. Implementations
/// must never run a task while holding a lock that `schedule` or `cancel`
/// also take, since tasks routinely schedule and cancel further timers.
pub trait Scheduler: Send + Sync {
    /// Current time, measured from when the scheduler was created.
    fn now(&self) -> Duration;

    /// Run `task` once `delay` has elapsed.
    fn schedule(&self, delay: Duration, task: Task) -> TimerId;

    /// Cancel a timer. Returns `false` if it already fired or was unknown.
    fn cancel(&self, id: TimerId) -> bool;
}
