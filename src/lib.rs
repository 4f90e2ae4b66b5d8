//! Pacer - Debounce and Throttle Wrappers
//!
//! This crate wraps a target callable in a rate-limiting policy (trailing
//! debounce, leading-or-trailing debounce, leading throttle, or leading and
//! trailing throttle). Timers come from an injected [`schedule::Scheduler`],
//! so the same wrapper runs on a tokio runtime or on a virtual clock.

pub mod config;
pub mod error;
pub mod limiter;
pub mod schedule;
pub mod sim;

pub use error::{PacerError, Result};
pub use limiter::{
    debounce, debounce_immediate, throttle, throttle_trailing, CallOutcome, Invocation, Policy,
    RateLimited, WrapperStats,
};
pub use schedule::{ManualScheduler, Scheduler, TimerId, TokioScheduler};
