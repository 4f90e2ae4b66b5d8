//! The rate-limited invocation wrapper.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, trace};

use super::invocation::{CallOutcome, Invocation};
use super::policy::Policy;
use crate::error::{PacerError, Result};
use crate::schedule::{Scheduler, TimerId};

type TargetFn<C, A> = dyn Fn(C, A) -> anyhow::Result<()> + Send + Sync;
type ErrorHook = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

/// Counters describing what a wrapper has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WrapperStats {
    /// Calls accepted by the wrapper
    pub calls: u64,
    /// Times the target ran, leading and deferred
    pub invocations: u64,
    /// Times the target ran from a timer or a flush
    pub deferred_invocations: u64,
    /// Calls discarded by a leading throttle
    pub dropped: u64,
    /// Calls swallowed inside a leading-debounce burst
    pub suppressed: u64,
    /// Deferred runs whose target returned an error
    pub deferred_failures: u64,
}

/// A target callable filtered through a [`Policy`].
///
/// Handles are cheap to clone and share one state. Dropping the last handle,
/// or calling [`RateLimited::destroy`], cancels any pending deferred run.
pub struct RateLimited<C, A> {
    shared: Arc<Shared<C, A>>,
}

impl<C, A> Clone for RateLimited<C, A> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<C, A> {
    policy: Policy,
    target: Box<TargetFn<C, A>>,
    scheduler: Arc<dyn Scheduler>,
    on_deferred_error: ErrorHook,
    state: Mutex<State<C, A>>,
}

struct State<C, A> {
    /// The single outstanding timer, if any
    pending: Option<TimerId>,
    /// Call the pending timer will run with (trailing variants only)
    pending_call: Option<Invocation<C, A>>,
    /// Scheduler time of the last run (throttle family)
    last_invocation: Option<Duration>,
    /// Bumped whenever the pending timer changes; stale firings compare unequal
    epoch: u64,
    destroyed: bool,
    stats: WrapperStats,
}

/// Builder for [`RateLimited`] with optional hooks.
pub struct Builder {
    policy: Policy,
    on_deferred_error: Option<ErrorHook>,
}

impl Builder {
    /// Start building a wrapper for `policy`.
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            on_deferred_error: None,
        }
    }

    /// Handle failures of deferred runs, which have no caller to return to.
    ///
    /// Without a hook these failures are logged at error level.
    pub fn on_deferred_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&anyhow::Error) + Send + Sync + 'static,
    {
        self.on_deferred_error = Some(Arc::new(hook));
        self
    }

    /// Wrap `target` using `scheduler` for time and timers.
    pub fn build<C, A, F>(self, target: F, scheduler: Arc<dyn Scheduler>) -> RateLimited<C, A>
    where
        C: Send + 'static,
        A: Send + 'static,
        F: Fn(C, A) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let policy = self.policy;
        let on_deferred_error: ErrorHook = match self.on_deferred_error {
            Some(hook) => hook,
            None => Arc::new(move |err: &anyhow::Error| {
                error!(policy = %policy, error = %err, "Deferred invocation failed");
            }),
        };

        debug!(policy = %policy, "Creating rate-limited wrapper");

        RateLimited {
            shared: Arc::new(Shared {
                policy,
                target: Box::new(target),
                scheduler,
                on_deferred_error,
                state: Mutex::new(State {
                    pending: None,
                    pending_call: None,
                    last_invocation: None,
                    epoch: 0,
                    destroyed: false,
                    stats: WrapperStats::default(),
                }),
            }),
        }
    }
}

/// Run `target` once calls stop arriving for `delay`, with the last call's data.
pub fn debounce<C, A, F>(target: F, delay: Duration, scheduler: Arc<dyn Scheduler>) -> RateLimited<C, A>
where
    C: Send + 'static,
    A: Send + 'static,
    F: Fn(C, A) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Builder::new(Policy::Debounce { delay }).build(target, scheduler)
}

/// Debounce that runs on the leading edge of each burst when `immediate` is set.
pub fn debounce_immediate<C, A, F>(
    target: F,
    delay: Duration,
    immediate: bool,
    scheduler: Arc<dyn Scheduler>,
) -> RateLimited<C, A>
where
    C: Send + 'static,
    A: Send + 'static,
    F: Fn(C, A) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Builder::new(Policy::DebounceImmediate { delay, immediate }).build(target, scheduler)
}

/// Run `target` at most once per `interval`, dropping calls in between.
pub fn throttle<C, A, F>(target: F, interval: Duration, scheduler: Arc<dyn Scheduler>) -> RateLimited<C, A>
where
    C: Send + 'static,
    A: Send + 'static,
    F: Fn(C, A) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Builder::new(Policy::Throttle { interval }).build(target, scheduler)
}

/// Throttle with one trailing run carrying the latest call of each window.
pub fn throttle_trailing<C, A, F>(
    target: F,
    interval: Duration,
    scheduler: Arc<dyn Scheduler>,
) -> RateLimited<C, A>
where
    C: Send + 'static,
    A: Send + 'static,
    F: Fn(C, A) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Builder::new(Policy::ThrottleTrailing { interval }).build(target, scheduler)
}

impl<C, A> RateLimited<C, A>
where
    C: Send + 'static,
    A: Send + 'static,
{
    /// Wrap `target` with default hooks.
    pub fn new<F>(policy: Policy, target: F, scheduler: Arc<dyn Scheduler>) -> Self
    where
        F: Fn(C, A) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Builder::new(policy).build(target, scheduler)
    }

    /// Call the wrapper.
    ///
    /// A target failure on a synchronous (leading) run is returned as
    /// [`PacerError::Target`]. Calling a destroyed wrapper fails with
    /// [`PacerError::Destroyed`].
    pub fn call(&self, receiver: C, args: A) -> Result<CallOutcome> {
        let (outcome, run_now) = self.shared.decide(Invocation::new(receiver, args))?;
        if let Some(invocation) = run_now {
            self.shared.run(invocation)?;
        }
        Ok(outcome)
    }

    /// Run the pending deferred call now, as if its timer had fired.
    ///
    /// Returns whether the target ran. A leading debounce has nothing to run,
    /// so flushing it only ends the current burst.
    pub fn flush(&self) -> Result<bool> {
        let call = {
            let mut state = self.shared.state.lock();
            if state.destroyed {
                return Err(PacerError::Destroyed);
            }
            let Some(id) = state.pending.take() else {
                return Ok(false);
            };
            self.shared.scheduler.cancel(id);
            state.epoch += 1;
            self.shared.take_deferred(&mut state)
        };

        match call {
            Some(invocation) => {
                debug!(policy = %self.shared.policy, "Flushing pending call");
                self.shared.run(invocation)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Cancel the pending deferred call without destroying the wrapper.
    ///
    /// Returns whether a timer was pending.
    pub fn cancel(&self) -> bool {
        let mut state = self.shared.state.lock();
        let cancelled = self.shared.cancel_pending(&mut state);
        if cancelled {
            debug!(policy = %self.shared.policy, "Cancelled pending call");
        }
        cancelled
    }

    /// Release the wrapper: cancel pending work and reject further calls.
    pub fn destroy(&self) {
        let mut state = self.shared.state.lock();
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        self.shared.cancel_pending(&mut state);
        debug!(policy = %self.shared.policy, "Wrapper destroyed");
    }
}

impl<C, A> RateLimited<C, A> {
    /// The policy this wrapper applies.
    pub fn policy(&self) -> Policy {
        self.shared.policy
    }

    /// Whether a deferred run is scheduled.
    pub fn has_pending(&self) -> bool {
        self.shared.state.lock().pending.is_some()
    }

    /// Whether [`RateLimited::destroy`] has been called.
    pub fn is_destroyed(&self) -> bool {
        self.shared.state.lock().destroyed
    }

    /// Snapshot of the wrapper's counters.
    pub fn stats(&self) -> WrapperStats {
        self.shared.state.lock().stats
    }
}

impl<C, A> Shared<C, A>
where
    C: Send + 'static,
    A: Send + 'static,
{
    /// Apply the policy to one call. Returns the call to run synchronously, if any.
    fn decide(
        self: &Arc<Self>,
        invocation: Invocation<C, A>,
    ) -> Result<(CallOutcome, Option<Invocation<C, A>>)> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(PacerError::Destroyed);
        }
        state.stats.calls += 1;

        let now = self.scheduler.now();
        let decision = match self.policy {
            Policy::Debounce { delay } => self.debounce(&mut state, delay, false, invocation),
            Policy::DebounceImmediate { delay, immediate } => {
                self.debounce(&mut state, delay, immediate, invocation)
            }
            Policy::Throttle { interval } => Self::throttle(&mut state, now, interval, invocation),
            Policy::ThrottleTrailing { interval } => {
                self.throttle_trailing(&mut state, now, interval, invocation)
            }
        };

        trace!(
            policy = %self.policy,
            now = ?now,
            outcome = %decision.0,
            "Call filtered"
        );
        Ok(decision)
    }

    fn debounce(
        self: &Arc<Self>,
        state: &mut State<C, A>,
        delay: Duration,
        immediate: bool,
        invocation: Invocation<C, A>,
    ) -> (CallOutcome, Option<Invocation<C, A>>) {
        // A pending timer means a burst is in progress.
        let call_now = immediate && state.pending.is_none();
        let rescheduled = self.cancel_pending(state);
        self.arm(state, delay);

        if immediate {
            if call_now {
                state.stats.invocations += 1;
                (CallOutcome::Invoked, Some(invocation))
            } else {
                state.stats.suppressed += 1;
                (CallOutcome::Suppressed, None)
            }
        } else {
            state.pending_call = Some(invocation);
            let outcome = if rescheduled {
                CallOutcome::Rescheduled
            } else {
                CallOutcome::Scheduled
            };
            (outcome, None)
        }
    }

    fn throttle(
        state: &mut State<C, A>,
        now: Duration,
        interval: Duration,
        invocation: Invocation<C, A>,
    ) -> (CallOutcome, Option<Invocation<C, A>>) {
        let due = state
            .last_invocation
            .map_or(true, |last| now.saturating_sub(last) >= interval);

        if due {
            state.last_invocation = Some(now);
            state.stats.invocations += 1;
            (CallOutcome::Invoked, Some(invocation))
        } else {
            state.stats.dropped += 1;
            (CallOutcome::Dropped, None)
        }
    }

    fn throttle_trailing(
        self: &Arc<Self>,
        state: &mut State<C, A>,
        now: Duration,
        interval: Duration,
        invocation: Invocation<C, A>,
    ) -> (CallOutcome, Option<Invocation<C, A>>) {
        // `None` covers both the first call and `remaining <= 0`.
        let remaining = state
            .last_invocation
            .and_then(|last| interval.checked_sub(now.saturating_sub(last)))
            .filter(|remaining| !remaining.is_zero());

        match remaining {
            None => {
                // A pending trailing run loses to this newer call.
                self.cancel_pending(state);
                state.last_invocation = Some(now);
                state.stats.invocations += 1;
                (CallOutcome::Invoked, Some(invocation))
            }
            Some(remaining) if state.pending.is_none() => {
                state.pending_call = Some(invocation);
                self.arm(state, remaining);
                (CallOutcome::Scheduled, None)
            }
            Some(_) => {
                state.pending_call = Some(invocation);
                (CallOutcome::Coalesced, None)
            }
        }
    }

    /// Schedule the single deferred run `delay` from now.
    fn arm(self: &Arc<Self>, state: &mut State<C, A>, delay: Duration) {
        state.epoch += 1;
        let epoch = state.epoch;
        let weak: Weak<Self> = Arc::downgrade(self);

        let id = self.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.fire(epoch);
                }
            }),
        );

        debug!(policy = %self.policy, timer = %id, delay = ?delay, "Scheduled deferred call");
        state.pending = Some(id);
    }

    fn fire(&self, epoch: u64) {
        let call = {
            let mut state = self.state.lock();
            if state.destroyed || state.epoch != epoch || state.pending.is_none() {
                trace!(policy = %self.policy, epoch, "Ignoring stale timer");
                return;
            }
            state.pending = None;
            self.take_deferred(&mut state)
        };

        match call {
            Some(invocation) => {
                debug!(policy = %self.policy, "Running deferred call");
                if let Err(err) = (self.target)(invocation.receiver, invocation.args) {
                    self.state.lock().stats.deferred_failures += 1;
                    (self.on_deferred_error)(&err);
                }
            }
            None => trace!(policy = %self.policy, "Burst ended"),
        }
    }

    /// Take the stored call once its timer is consumed.
    fn take_deferred(&self, state: &mut State<C, A>) -> Option<Invocation<C, A>> {
        if let Policy::ThrottleTrailing { .. } = self.policy {
            state.last_invocation = Some(self.scheduler.now());
        }

        let call = state.pending_call.take();
        if call.is_some() {
            state.stats.invocations += 1;
            state.stats.deferred_invocations += 1;
        }
        call
    }

    fn run(&self, invocation: Invocation<C, A>) -> Result<()> {
        (self.target)(invocation.receiver, invocation.args).map_err(PacerError::Target)
    }
}

impl<C, A> Shared<C, A> {
    /// Cancel the pending timer and forget its call. Returns whether one existed.
    fn cancel_pending(&self, state: &mut State<C, A>) -> bool {
        state.pending_call = None;
        match state.pending.take() {
            Some(id) => {
                self.scheduler.cancel(id);
                state.epoch += 1;
                true
            }
            None => false,
        }
    }
}

impl<C, A> Drop for Shared<C, A> {
    fn drop(&mut self) {
        if let Some(id) = self.state.get_mut().pending.take() {
            self.scheduler.cancel(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ManualScheduler;
    use anyhow::anyhow;

    type Log = Arc<Mutex<Vec<(u64, &'static str, u32)>>>;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// A target that records (time in ms, receiver, arg) for each run.
    fn recording_target(
        log: &Log,
        scheduler: &Arc<ManualScheduler>,
    ) -> impl Fn(&'static str, u32) -> anyhow::Result<()> + Send + Sync + 'static {
        let log = Arc::clone(log);
        let scheduler = Arc::clone(scheduler);
        move |receiver: &'static str, arg: u32| -> anyhow::Result<()> {
            log.lock().push((scheduler.now().as_millis() as u64, receiver, arg));
            Ok(())
        }
    }

    fn setup() -> (Log, Arc<ManualScheduler>) {
        (Arc::new(Mutex::new(Vec::new())), Arc::new(ManualScheduler::new()))
    }

    fn call_at(
        scheduler: &ManualScheduler,
        wrapper: &RateLimited<&'static str, u32>,
        at: u64,
        receiver: &'static str,
        arg: u32,
    ) -> CallOutcome {
        scheduler.advance_to(ms(at));
        wrapper.call(receiver, arg).unwrap()
    }

    #[test]
    fn test_debounce_runs_once_after_burst_with_last_call() {
        let (log, scheduler) = setup();
        let wrapper = debounce(recording_target(&log, &scheduler), ms(100), scheduler.clone());

        assert_eq!(call_at(&scheduler, &wrapper, 0, "a", 1), CallOutcome::Scheduled);
        assert_eq!(call_at(&scheduler, &wrapper, 60, "b", 2), CallOutcome::Rescheduled);
        assert_eq!(call_at(&scheduler, &wrapper, 120, "c", 3), CallOutcome::Rescheduled);

        scheduler.advance_to(ms(219));
        assert!(log.lock().is_empty());

        scheduler.advance_to(ms(220));
        assert_eq!(*log.lock(), vec![(220, "c", 3)]);
        assert!(!wrapper.has_pending());
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn test_debounce_single_call_settles_to_one_run() {
        let (log, scheduler) = setup();
        let wrapper = debounce(recording_target(&log, &scheduler), ms(50), scheduler.clone());

        wrapper.call("only", 7).unwrap();
        scheduler.run_until_idle();

        assert_eq!(*log.lock(), vec![(50, "only", 7)]);
        let stats = wrapper.stats();
        assert_eq!(stats.calls, 1);
        assert_eq!(stats.invocations, 1);
        assert_eq!(stats.deferred_invocations, 1);
    }

    #[test]
    fn test_debounce_immediate_false_matches_trailing() {
        let (log, scheduler) = setup();
        let wrapper =
            debounce_immediate(recording_target(&log, &scheduler), ms(100), false, scheduler.clone());

        call_at(&scheduler, &wrapper, 0, "a", 1);
        call_at(&scheduler, &wrapper, 50, "b", 2);
        scheduler.run_until_idle();

        assert_eq!(*log.lock(), vec![(150, "b", 2)]);
    }

    #[test]
    fn test_debounce_immediate_leading_edge_only() {
        let (log, scheduler) = setup();
        let wrapper =
            debounce_immediate(recording_target(&log, &scheduler), ms(100), true, scheduler.clone());

        assert_eq!(call_at(&scheduler, &wrapper, 0, "a", 1), CallOutcome::Invoked);
        assert_eq!(call_at(&scheduler, &wrapper, 50, "b", 2), CallOutcome::Suppressed);
        assert_eq!(call_at(&scheduler, &wrapper, 140, "c", 3), CallOutcome::Suppressed);

        // Quiet from 140 to 240 clears the burst without a trailing run.
        scheduler.advance_to(ms(240));
        assert!(!wrapper.has_pending());
        assert_eq!(call_at(&scheduler, &wrapper, 300, "d", 4), CallOutcome::Invoked);

        assert_eq!(*log.lock(), vec![(0, "a", 1), (300, "d", 4)]);
        assert_eq!(wrapper.stats().suppressed, 2);
    }

    #[test]
    fn test_throttle_drops_calls_inside_window() {
        let (log, scheduler) = setup();
        let wrapper = throttle(recording_target(&log, &scheduler), ms(100), scheduler.clone());

        assert_eq!(call_at(&scheduler, &wrapper, 0, "a", 1), CallOutcome::Invoked);
        assert_eq!(call_at(&scheduler, &wrapper, 50, "b", 2), CallOutcome::Dropped);
        assert_eq!(call_at(&scheduler, &wrapper, 99, "c", 3), CallOutcome::Dropped);
        assert_eq!(call_at(&scheduler, &wrapper, 100, "d", 4), CallOutcome::Invoked);
        assert_eq!(call_at(&scheduler, &wrapper, 180, "e", 5), CallOutcome::Dropped);

        scheduler.run_until_idle();
        assert_eq!(*log.lock(), vec![(0, "a", 1), (100, "d", 4)]);
        assert_eq!(scheduler.pending_count(), 0);
        assert_eq!(wrapper.stats().dropped, 3);
    }

    #[test]
    fn test_throttle_first_call_always_runs() {
        let (log, scheduler) = setup();
        scheduler.advance_to(ms(5));
        let wrapper = throttle(recording_target(&log, &scheduler), ms(1000), scheduler.clone());

        assert!(wrapper.call("a", 1).unwrap().invoked());
    }

    #[test]
    fn test_throttle_trailing_uses_latest_call() {
        let (log, scheduler) = setup();
        let wrapper =
            throttle_trailing(recording_target(&log, &scheduler), ms(100), scheduler.clone());

        assert_eq!(call_at(&scheduler, &wrapper, 0, "a", 0), CallOutcome::Invoked);
        assert_eq!(call_at(&scheduler, &wrapper, 50, "b", 50), CallOutcome::Scheduled);
        assert_eq!(call_at(&scheduler, &wrapper, 80, "c", 80), CallOutcome::Coalesced);

        scheduler.advance_to(ms(100));
        assert_eq!(*log.lock(), vec![(0, "a", 0), (100, "c", 80)]);

        // The trailing run restarted the window at t=100.
        assert_eq!(call_at(&scheduler, &wrapper, 150, "d", 150), CallOutcome::Scheduled);
        scheduler.run_until_idle();
        assert_eq!(log.lock().last(), Some(&(200, "d", 150)));
    }

    #[test]
    fn test_throttle_trailing_boundary_runs_immediately() {
        let (log, scheduler) = setup();
        let wrapper =
            throttle_trailing(recording_target(&log, &scheduler), ms(100), scheduler.clone());

        call_at(&scheduler, &wrapper, 0, "a", 0);
        assert_eq!(call_at(&scheduler, &wrapper, 100, "b", 100), CallOutcome::Invoked);
        assert!(!wrapper.has_pending());
        assert_eq!(*log.lock(), vec![(0, "a", 0), (100, "b", 100)]);
    }

    /// Clock that moves on request but never fires its timers.
    #[derive(Default)]
    struct DriftingClock {
        now: Mutex<Duration>,
        next_id: Mutex<u64>,
        cancelled: Mutex<Vec<TimerId>>,
    }

    impl Scheduler for DriftingClock {
        fn now(&self) -> Duration {
            *self.now.lock()
        }

        fn schedule(&self, _delay: Duration, _task: crate::schedule::Task) -> TimerId {
            let mut next = self.next_id.lock();
            *next += 1;
            TimerId(*next)
        }

        fn cancel(&self, id: TimerId) -> bool {
            self.cancelled.lock().push(id);
            true
        }
    }

    #[test]
    fn test_throttle_trailing_overdue_timer_loses_to_immediate_run() {
        let clock = Arc::new(DriftingClock::default());
        let runs = Arc::new(Mutex::new(Vec::new()));
        let target_runs = Arc::clone(&runs);
        let wrapper = throttle_trailing(
            move |_: (), n: u32| {
                target_runs.lock().push(n);
                Ok(())
            },
            ms(100),
            clock.clone(),
        );

        wrapper.call((), 0).unwrap();
        *clock.now.lock() = ms(50);
        assert_eq!(wrapper.call((), 50).unwrap(), CallOutcome::Scheduled);

        // The timer for t=100 never fired; a call at t=170 sees remaining <= 0.
        *clock.now.lock() = ms(170);
        assert_eq!(wrapper.call((), 170).unwrap(), CallOutcome::Invoked);

        assert_eq!(*runs.lock(), vec![0, 170]);
        assert_eq!(*clock.cancelled.lock(), vec![TimerId(1)]);
        assert!(!wrapper.has_pending());
    }

    /// Scheduler whose `cancel` never reaches the timer, so cancelled tasks still run.
    #[derive(Default)]
    struct LateCancelClock {
        next_id: Mutex<u64>,
        tasks: Mutex<Vec<crate::schedule::Task>>,
    }

    impl Scheduler for LateCancelClock {
        fn now(&self) -> Duration {
            Duration::ZERO
        }

        fn schedule(&self, _delay: Duration, task: crate::schedule::Task) -> TimerId {
            self.tasks.lock().push(task);
            let mut next = self.next_id.lock();
            *next += 1;
            TimerId(*next)
        }

        fn cancel(&self, _id: TimerId) -> bool {
            false
        }
    }

    #[test]
    fn test_cancelled_timer_that_still_fires_is_ignored() {
        let clock = Arc::new(LateCancelClock::default());
        let runs = Arc::new(Mutex::new(Vec::new()));
        let target_runs = Arc::clone(&runs);
        let wrapper = debounce(
            move |_: (), n: u32| {
                target_runs.lock().push(n);
                Ok(())
            },
            ms(100),
            clock.clone(),
        );

        wrapper.call((), 1).unwrap();
        wrapper.call((), 2).unwrap();

        let mut tasks = std::mem::take(&mut *clock.tasks.lock()).into_iter();
        let stale = tasks.next().unwrap();
        let live = tasks.next().unwrap();

        stale();
        assert!(runs.lock().is_empty());
        assert!(wrapper.has_pending());

        live();
        assert_eq!(*runs.lock(), vec![2]);
        assert!(!wrapper.has_pending());
        assert_eq!(wrapper.stats().deferred_invocations, 1);
    }

    #[test]
    fn test_throttle_trailing_flush_runs_latest_and_restarts_window() {
        let (log, scheduler) = setup();
        let wrapper =
            throttle_trailing(recording_target(&log, &scheduler), ms(100), scheduler.clone());

        call_at(&scheduler, &wrapper, 0, "a", 0);
        call_at(&scheduler, &wrapper, 20, "b", 20);
        call_at(&scheduler, &wrapper, 40, "c", 40);

        assert!(wrapper.flush().unwrap());
        assert_eq!(*log.lock(), vec![(0, "a", 0), (40, "c", 40)]);
        assert_eq!(scheduler.pending_count(), 0);

        // The flush at t=40 opened a new window ending at t=140.
        assert_eq!(call_at(&scheduler, &wrapper, 120, "d", 120), CallOutcome::Scheduled);
        scheduler.advance_to(ms(140));
        assert_eq!(log.lock().last(), Some(&(140, "d", 120)));
    }

    #[test]
    fn test_throttle_trailing_cancel_discards_stored_call() {
        let (log, scheduler) = setup();
        let wrapper =
            throttle_trailing(recording_target(&log, &scheduler), ms(100), scheduler.clone());

        call_at(&scheduler, &wrapper, 0, "a", 0);
        call_at(&scheduler, &wrapper, 30, "b", 30);
        assert!(wrapper.cancel());
        assert!(!wrapper.flush().unwrap());

        scheduler.run_until_idle();
        assert_eq!(*log.lock(), vec![(0, "a", 0)]);

        // Window timing is untouched: t=60 is still inside the first window.
        assert_eq!(call_at(&scheduler, &wrapper, 60, "c", 60), CallOutcome::Scheduled);
    }

    #[test]
    fn test_cancel_keeps_wrapper_usable() {
        let (log, scheduler) = setup();
        let wrapper = debounce(recording_target(&log, &scheduler), ms(100), scheduler.clone());

        call_at(&scheduler, &wrapper, 0, "a", 1);
        assert!(wrapper.cancel());
        assert!(!wrapper.cancel());

        call_at(&scheduler, &wrapper, 30, "b", 2);
        scheduler.run_until_idle();
        assert_eq!(*log.lock(), vec![(130, "b", 2)]);
    }

    #[test]
    fn test_destroy_cancels_pending_and_rejects_calls() {
        let (log, scheduler) = setup();
        let wrapper = debounce(recording_target(&log, &scheduler), ms(100), scheduler.clone());

        wrapper.call("a", 1).unwrap();
        assert_eq!(scheduler.pending_count(), 1);

        wrapper.destroy();
        assert!(wrapper.is_destroyed());
        assert_eq!(scheduler.pending_count(), 0);

        scheduler.advance(ms(500));
        assert!(log.lock().is_empty());
        assert!(matches!(wrapper.call("b", 2), Err(PacerError::Destroyed)));
        assert!(matches!(wrapper.flush(), Err(PacerError::Destroyed)));
    }

    #[test]
    fn test_dropping_last_handle_cancels_timer() {
        let (log, scheduler) = setup();
        let wrapper = throttle_trailing(recording_target(&log, &scheduler), ms(100), scheduler.clone());
        let clone = wrapper.clone();

        wrapper.call("a", 1).unwrap();
        wrapper.call("b", 2).unwrap();
        drop(wrapper);
        assert_eq!(scheduler.pending_count(), 1);

        drop(clone);
        assert_eq!(scheduler.pending_count(), 0);
        scheduler.run_until_idle();
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_flush_runs_pending_call_now() {
        let (log, scheduler) = setup();
        let wrapper = debounce(recording_target(&log, &scheduler), ms(100), scheduler.clone());

        call_at(&scheduler, &wrapper, 10, "a", 1);
        assert!(wrapper.flush().unwrap());
        assert!(!wrapper.flush().unwrap());

        scheduler.run_until_idle();
        assert_eq!(*log.lock(), vec![(10, "a", 1)]);
    }

    #[test]
    fn test_leading_failure_is_returned() {
        let scheduler = Arc::new(ManualScheduler::new());
        let wrapper = throttle(
            |_: (), _: ()| Err(anyhow!("boom")),
            ms(10),
            scheduler.clone(),
        );

        let err = wrapper.call((), ()).unwrap_err();
        assert!(matches!(err, PacerError::Target(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_deferred_failure_reaches_hook() {
        let scheduler = Arc::new(ManualScheduler::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = Arc::clone(&seen);

        let wrapper = Builder::new(Policy::Debounce { delay: ms(20) })
            .on_deferred_error(move |err| hook_seen.lock().push(err.to_string()))
            .build(|_: (), n: u32| Err(anyhow!("failed with {}", n)), scheduler.clone());

        wrapper.call((), 3).unwrap();
        scheduler.run_until_idle();

        assert_eq!(*seen.lock(), vec!["failed with 3".to_string()]);
        assert_eq!(wrapper.stats().deferred_failures, 1);
    }

    #[test]
    fn test_target_may_reenter_wrapper() {
        let scheduler = Arc::new(ManualScheduler::new());
        let slot: Arc<Mutex<Option<RateLimited<(), u32>>>> = Arc::new(Mutex::new(None));
        let runs = Arc::new(Mutex::new(Vec::new()));

        let target_slot = Arc::clone(&slot);
        let target_runs = Arc::clone(&runs);
        let wrapper = debounce(
            move |_: (), n: u32| {
                target_runs.lock().push(n);
                let again = target_slot.lock().clone();
                if let Some(wrapper) = again {
                    if n < 3 {
                        wrapper.call((), n + 1)?;
                    }
                }
                Ok(())
            },
            ms(10),
            scheduler.clone(),
        );
        *slot.lock() = Some(wrapper.clone());

        wrapper.call((), 1).unwrap();
        scheduler.run_until_idle();

        assert_eq!(*runs.lock(), vec![1, 2, 3]);
        slot.lock().take();
    }
}
