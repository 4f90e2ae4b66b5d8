//! Invocation events and call outcomes.

use serde::Serialize;
use std::fmt;

/// A single call to a wrapper: the receiver it was made on and its arguments.
///
/// The wrapper moves invocations, never clones them, so the target always
/// sees exactly the data of a real call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation<C, A> {
    /// The invocation context
    pub receiver: C,
    /// The argument tuple
    pub args: A,
}

impl<C, A> Invocation<C, A> {
    /// Create a new invocation.
    pub fn new(receiver: C, args: A) -> Self {
        Self { receiver, args }
    }
}

/// What a wrapper did with a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    /// The target ran synchronously (leading edge)
    Invoked,
    /// A deferred run was scheduled with this call's data
    Scheduled,
    /// The previous deferred run was cancelled and a new one scheduled
    Rescheduled,
    /// A deferred run was already pending; it will use this call's data
    Coalesced,
    /// Inside a leading-debounce burst; the suppression timer was re-armed
    Suppressed,
    /// Inside a throttle window; the call was discarded
    Dropped,
}

impl CallOutcome {
    /// Whether the target ran during the call.
    pub fn invoked(&self) -> bool {
        matches!(self, CallOutcome::Invoked)
    }
}

impl fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallOutcome::Invoked => "invoked",
            CallOutcome::Scheduled => "scheduled",
            CallOutcome::Rescheduled => "rescheduled",
            CallOutcome::Coalesced => "coalesced",
            CallOutcome::Suppressed => "suppressed",
            CallOutcome::Dropped => "dropped",
        };
        f.write_str(name)
    }
}
