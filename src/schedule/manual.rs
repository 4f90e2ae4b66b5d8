//! Deterministic virtual-clock scheduler.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use super::{Scheduler, Task, TimerId};

/// A scheduler whose clock only moves when told to.
///
/// Due tasks run in deadline order, ties in the order they were scheduled,
/// with the clock set to each task's deadline while it runs.
pub struct ManualScheduler {
    inner: Mutex<ManualState>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_id: u64,
    queue: BTreeMap<(Duration, TimerId), Task>,
    deadlines: HashMap<TimerId, Duration>,
}

impl ManualScheduler {
    /// Create a scheduler with its clock at zero.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ManualState::default()),
        }
    }

    /// Move the clock forward by `by`, running every task that comes due.
    ///
    /// Returns the number of tasks run.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.now().saturating_add(by);
        self.advance_to(target)
    }

    /// Move the clock to `target`, running every task due at or before it.
    ///
    /// A target in the past leaves the clock where it is.
    pub fn advance_to(&self, target: Duration) -> usize {
        let mut ran = 0;
        while let Some(task) = self.pop_due(target) {
            task();
            ran += 1;
        }

        let mut state = self.inner.lock();
        if target > state.now {
            state.now = target;
        }
        ran
    }

    /// Run tasks until none are left, moving the clock to each deadline.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.pop_due(Duration::MAX) {
            task();
            ran += 1;
        }
        ran
    }

    /// Number of timers that have not fired or been cancelled.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Deadline of the earliest pending timer.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.inner.lock().queue.keys().next().map(|(deadline, _)| *deadline)
    }

    fn pop_due(&self, target: Duration) -> Option<Task> {
        let mut state = self.inner.lock();
        let (&(deadline, id), _) = state.queue.iter().next()?;
        if deadline > target {
            return None;
        }

        let task = state.queue.remove(&(deadline, id))?;
        state.deadlines.remove(&id);
        if deadline > state.now {
            state.now = deadline;
        }
        trace!(timer = %id, at = ?deadline, "Firing timer");
        Some(task)
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> Duration {
        self.inner.lock().now
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerId {
        let mut state = self.inner.lock();
        state.next_id += 1;
        let id = TimerId(state.next_id);
        let deadline = state.now.saturating_add(delay);
        state.queue.insert((deadline, id), task);
        state.deadlines.insert(id, deadline);
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        let mut state = self.inner.lock();
        match state.deadlines.remove(&id) {
            Some(deadline) => state.queue.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }
}
