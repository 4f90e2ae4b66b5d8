//! Scheduler backed by tokio timers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{Scheduler, Task, TimerId};
use crate::error::{PacerError, Result};

/// A scheduler that spawns one tokio task per timer.
///
/// Cancelling a timer aborts its task. Time is read from
/// `tokio::time::Instant`, so paused-clock tests drive it deterministically.
pub struct TokioScheduler {
    handle: Handle,
    start: Instant,
    next_id: AtomicU64,
    timers: Arc<Mutex<HashMap<TimerId, AbortHandle>>>,
}

impl TokioScheduler {
    /// Create a scheduler on the current tokio runtime.
    pub fn new() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| PacerError::Runtime(format!("no tokio runtime available: {}", e)))?;
        Ok(Self::with_handle(handle))
    }

    /// Create a scheduler that spawns onto the given runtime.
    pub fn with_handle(handle: Handle) -> Self {
        let start = {
            let _guard = handle.enter();
            Instant::now()
        };

        Self {
            handle,
            start,
            next_id: AtomicU64::new(0),
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of timers that have not fired or been cancelled.
    pub fn pending_count(&self) -> usize {
        self.timers.lock().len()
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> Duration {
        let _guard = self.handle.enter();
        Instant::now().saturating_duration_since(self.start)
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let timers = Arc::clone(&self.timers);

        // Hold the map lock until the handle is registered, so a timer that
        // fires immediately still finds its own entry.
        let mut registry = self.timers.lock();
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if timers.lock().remove(&id).is_none() {
                return;
            }
            trace!(timer = %id, "Firing timer");
            task();
        });
        registry.insert(id, join.abort_handle());
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        match self.timers.lock().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        let timers: Vec<_> = self.timers.lock().drain().collect();
        if !timers.is_empty() {
            debug!(count = timers.len(), "Aborting outstanding timers");
        }
        for (_, handle) in timers {
            handle.abort();
        }
    }
}
