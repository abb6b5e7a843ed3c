//! Engine error types

use conflux_tracker::TrackerError;
use conflux_types::{FlowRunId, RunId, StateType, ValidationError};
use thiserror::Error;

/// Rejected state change
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Illegal transition for {run_id}: {from} -> {to}")]
    IllegalTransition {
        run_id: RunId,
        from: StateType,
        to: StateType,
    },
}

/// Orchestration errors
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Run tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Flow not registered: {0}")]
    FlowNotFound(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Flow run {0} was cancelled")]
    Cancelled(FlowRunId),
}

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;
