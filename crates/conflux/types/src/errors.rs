//! Validation errors for Conflux configuration types

/// Errors raised when configuration data is malformed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    #[error("Invalid entrypoint '{0}': expected 'path:function'")]
    InvalidEntrypoint(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}
