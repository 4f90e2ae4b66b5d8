//! Rate-limited invocation wrappers and their policies.

mod invocation;
mod policy;
mod wrapper;

pub use invocation::{CallOutcome, Invocation};
pub use policy::{Policy, PolicyKind, PolicySpec};
pub use wrapper::{
    debounce, debounce_immediate, throttle, throttle_trailing, Builder, RateLimited, WrapperStats,
};
