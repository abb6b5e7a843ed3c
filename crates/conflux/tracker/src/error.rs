//! Run tracker error types

use chrono::{DateTime, Utc};
use conflux_types::{RunId, StateType};
use thiserror::Error;

/// Run tracker errors
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Run not found: {0}")]
    NotFound(RunId),

    #[error("Run already registered with different metadata: {0}")]
    AlreadyExists(RunId),

    #[error("Transition for {run_id} at {attempted} is older than the last recorded transition at {last}")]
    OutOfOrder {
        run_id: RunId,
        last: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },

    #[error("Stale transition for {run_id}: expected current state {expected:?}, found {actual}")]
    StaleTransition {
        run_id: RunId,
        expected: Option<StateType>,
        actual: StateType,
    },

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result type for run tracker operations
pub type Result<T> = std::result::Result<T, TrackerError>;
