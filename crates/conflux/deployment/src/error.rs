//! Deployment error types

use conflux_types::ValidationError;
use thiserror::Error;

/// Deployment registry and resolution errors
#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("Deployment not found: {0}")]
    NotFound(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Raised before any flow run exists for the deployment
    #[error("Failed to resolve deployment {deployment}: {reason}")]
    Resolution { deployment: String, reason: String },

    #[error("Failed to fetch source {source_location}: {reason}")]
    SourceFetch {
        source_location: String,
        reason: String,
    },
}

impl DeploymentError {
    pub(crate) fn resolution(deployment: impl Into<String>, reason: impl ToString) -> Self {
        DeploymentError::Resolution {
            deployment: deployment.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for deployment operations
pub type Result<T> = std::result::Result<T, DeploymentError>;
