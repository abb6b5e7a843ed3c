//! Dispatch error types

use conflux_deployment::DeploymentError;
use conflux_engine::OrchestrationError;
use conflux_tracker::TrackerError;
use conflux_types::{BackendKind, FlowRunId};
use thiserror::Error;

/// Dispatcher, work pool and backend errors
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Deployment(#[from] DeploymentError),

    #[error("Run tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    #[error("Unknown work pool: {0}")]
    UnknownWorkPool(String),

    #[error("No execution backend for {0} work pools")]
    NoBackend(BackendKind),

    #[error("Backend rejected flow run {flow_run_id}: {reason}")]
    Backend {
        flow_run_id: FlowRunId,
        reason: String,
    },
}

/// Result type for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;
