//! Rate limiting policies and their configuration form.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{PacerError, Result};

/// How a wrapper filters calls to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Run once, with the last call's data, after `delay` passes with no calls.
    Debounce { delay: Duration },
    /// Leading edge when `immediate`, otherwise the same as [`Policy::Debounce`].
    DebounceImmediate { delay: Duration, immediate: bool },
    /// Run at most once per `interval`; calls inside the window are dropped.
    Throttle { interval: Duration },
    /// Leading run per window plus one trailing run with the latest call.
    ThrottleTrailing { interval: Duration },
}

impl Policy {
    /// Build a policy from a kind and a delay in milliseconds.
    ///
    /// Negative, NaN, infinite and overflowing delays are rejected, as is
    /// `immediate` on any kind other than `debounce_immediate`.
    pub fn from_millis(kind: PolicyKind, delay_ms: f64, immediate: bool) -> Result<Self> {
        if immediate && kind != PolicyKind::DebounceImmediate {
            return Err(PacerError::Config(format!(
                "immediate only applies to debounce_immediate, not {}",
                kind
            )));
        }
        let delay = duration_from_millis(delay_ms)?;
        Ok(match kind {
            PolicyKind::Debounce => Policy::Debounce { delay },
            PolicyKind::DebounceImmediate => Policy::DebounceImmediate { delay, immediate },
            PolicyKind::Throttle => Policy::Throttle { interval: delay },
            PolicyKind::ThrottleTrailing => Policy::ThrottleTrailing { interval: delay },
        })
    }

    /// The delay (debounce) or interval (throttle) of this policy.
    pub fn period(&self) -> Duration {
        match *self {
            Policy::Debounce { delay } | Policy::DebounceImmediate { delay, .. } => delay,
            Policy::Throttle { interval } | Policy::ThrottleTrailing { interval } => interval,
        }
    }

    /// The kind of this policy.
    pub fn kind(&self) -> PolicyKind {
        match self {
            Policy::Debounce { .. } => PolicyKind::Debounce,
            Policy::DebounceImmediate { .. } => PolicyKind::DebounceImmediate,
            Policy::Throttle { .. } => PolicyKind::Throttle,
            Policy::ThrottleTrailing { .. } => PolicyKind::ThrottleTrailing,
        }
    }

    /// Whether calls are run synchronously on the leading edge.
    pub fn is_leading(&self) -> bool {
        match *self {
            Policy::Debounce { .. } => false,
            Policy::DebounceImmediate { immediate, .. } => immediate,
            Policy::Throttle { .. } | Policy::ThrottleTrailing { .. } => true,
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::DebounceImmediate { delay, immediate } => {
                write!(f, "debounce_immediate({:?}, immediate={})", delay, immediate)
            }
            other => write!(f, "{}({:?})", other.kind(), other.period()),
        }
    }
}

/// Policy kind as written in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Debounce,
    DebounceImmediate,
    Throttle,
    ThrottleTrailing,
}

impl PolicyKind {
    /// Configuration name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::Debounce => "debounce",
            PolicyKind::DebounceImmediate => "debounce_immediate",
            PolicyKind::Throttle => "throttle",
            PolicyKind::ThrottleTrailing => "throttle_trailing",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PolicyKind {
    type Err = PacerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "debounce" => Ok(PolicyKind::Debounce),
            "debounce_immediate" => Ok(PolicyKind::DebounceImmediate),
            "throttle" => Ok(PolicyKind::Throttle),
            "throttle_trailing" => Ok(PolicyKind::ThrottleTrailing),
            other => Err(PacerError::Config(format!("unknown policy kind: {}", other))),
        }
    }
}

/// A policy as it appears in configuration, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySpec {
    /// The policy kind
    pub kind: PolicyKind,
    /// Delay (debounce) or interval (throttle) in milliseconds
    pub delay_ms: f64,
    /// Leading-edge flag, only meaningful for `debounce_immediate`
    #[serde(default)]
    pub immediate: bool,
}

impl TryFrom<&PolicySpec> for Policy {
    type Error = PacerError;

    fn try_from(spec: &PolicySpec) -> Result<Self> {
        Policy::from_millis(spec.kind, spec.delay_ms, spec.immediate)
    }
}

fn duration_from_millis(ms: f64) -> Result<Duration> {
    if !ms.is_finite() {
        return Err(PacerError::InvalidTiming(format!("delay must be finite, got {}", ms)));
    }
    if ms < 0.0 {
        return Err(PacerError::InvalidTiming(format!("delay must not be negative, got {}ms", ms)));
    }
    Duration::try_from_secs_f64(ms / 1000.0)
        .map_err(|e| PacerError::InvalidTiming(format!("delay {}ms out of range: {}", ms, e)))
}
