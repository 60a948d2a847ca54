//! Error types for pipeline construction.

use thiserror::Error;

/// Rejected configuration, raised at construction time only.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// Sampling probability outside `[0.0, 1.0]`
    #[error("sample rate must be within [0.0, 1.0], got {0}")]
    SampleRate(f64),

    /// A size or interval that must be positive was zero
    #[error("{field} must be greater than zero")]
    NonPositive { field: &'static str },

    /// The batch worker needs a Tokio runtime to be spawned on
    #[error("pipeline must be built inside a Tokio runtime")]
    NoRuntime,

    /// Configuration document could not be parsed
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for ValidationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}
