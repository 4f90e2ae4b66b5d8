//! Replay call traces against a wrapper on a virtual clock.
//!
//! Used by `pacer simulate` to show what a policy does with a burst of calls
//! without waiting for real timers.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::debug;

use crate::error::{PacerError, Result};
use crate::limiter::{CallOutcome, Policy, RateLimited, WrapperStats};
use crate::schedule::{ManualScheduler, Scheduler};

/// Call times in milliseconds, in ascending order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Trace {
    calls: Vec<u64>,
}

impl Trace {
    /// Build a trace from call times. Times are sorted.
    pub fn new(mut calls: Vec<u64>) -> Self {
        calls.sort_unstable();
        Self { calls }
    }

    /// Parse a comma-separated list of millisecond offsets, e.g. `0,50,80`.
    pub fn parse(list: &str) -> Result<Self> {
        let calls = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<u64>()
                    .map_err(|e| PacerError::Config(format!("invalid call time '{}': {}", s, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(calls))
    }

    /// Generate `count` calls starting at zero with random gaps up to `max_gap_ms`.
    ///
    /// Times saturate at `u64::MAX` rather than wrapping.
    pub fn random(count: usize, max_gap_ms: u64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut at: u64 = 0;
        let mut calls = Vec::with_capacity(count);
        for i in 0..count {
            if i > 0 {
                at = at.saturating_add(rng.gen_range(0..=max_gap_ms));
            }
            calls.push(at);
        }
        Self { calls }
    }

    /// The call times.
    pub fn calls(&self) -> &[u64] {
        &self.calls
    }
}

/// Which edge produced an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    /// Ran synchronously inside the call
    Leading,
    /// Ran later from a timer
    Trailing,
}

/// One run of the target during a simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Execution {
    /// Virtual time of the run
    pub at_ms: u64,
    /// Index into the trace of the call whose data was used
    pub call_index: usize,
    /// Which edge produced it
    pub edge: Edge,
}

/// Result of replaying a trace.
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    /// Policy description
    pub policy: String,
    /// Call times that were replayed
    pub calls: Vec<u64>,
    /// What the wrapper did with each call
    pub outcomes: Vec<CallOutcome>,
    /// Target runs in time order
    pub executions: Vec<Execution>,
    /// Wrapper counters at the end
    pub stats: WrapperStats,
}

/// Replay `trace` through a wrapper using `policy`, then let pending timers fire.
pub fn simulate(policy: Policy, trace: &Trace) -> Result<SimReport> {
    let scheduler = Arc::new(ManualScheduler::new());
    let executions = Arc::new(Mutex::new(Vec::new()));
    let in_call = Arc::new(Mutex::new(false));

    let target = {
        let executions = Arc::clone(&executions);
        let in_call = Arc::clone(&in_call);
        let clock = Arc::clone(&scheduler);
        move |_: (), call_index: usize| -> anyhow::Result<()> {
            let edge = if *in_call.lock() {
                Edge::Leading
            } else {
                Edge::Trailing
            };
            executions.lock().push(Execution {
                at_ms: clock.now().as_millis() as u64,
                call_index,
                edge,
            });
            Ok(())
        }
    };

    let wrapper: RateLimited<(), usize> = RateLimited::new(policy, target, scheduler.clone());
    let mut outcomes = Vec::with_capacity(trace.calls.len());

    for (index, &at) in trace.calls.iter().enumerate() {
        scheduler.advance_to(Duration::from_millis(at));
        *in_call.lock() = true;
        let outcome = wrapper.call((), index);
        *in_call.lock() = false;
        outcomes.push(outcome?);
    }
    let fired = scheduler.run_until_idle();
    debug!(policy = %policy, calls = trace.calls.len(), fired, "Simulation finished");

    let stats = wrapper.stats();
    wrapper.destroy();
    let executions = executions.lock().clone();

    Ok(SimReport {
        policy: policy.to_string(),
        calls: trace.calls.clone(),
        outcomes,
        executions,
        stats,
    })
}
