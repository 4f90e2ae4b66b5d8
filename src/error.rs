//! Error types for Pacer.

use thiserror::Error;

/// Main error type for Pacer operations.
#[derive(Error, Debug)]
pub enum PacerError {
    /// A delay or interval that cannot be turned into a non-negative duration
    #[error("Invalid timing: {0}")]
    InvalidTiming(String),

    /// The wrapper was destroyed and can no longer accept calls
    #[error("Invalid wrapper: called after destroy")]
    Destroyed,

    /// The target callable failed during a synchronous invocation
    #[error("Target failed: {0}")]
    Target(anyhow::Error),

    /// No async runtime available for a runtime-backed scheduler
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Pacer operations.
pub type Result<T> = std::result::Result<T, PacerError>;
