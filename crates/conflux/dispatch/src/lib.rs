//! Conflux Dispatch - from deployments to executing flow runs
//!
//! - [`Dispatcher`]: fires deployment schedules, creates flow runs and
//!   submits them to work pools
//! - [`WorkPools`]: per-pool queues with concurrency limits and pausing
//! - [`ExecutionBackend`]: where runs execute; [`InProcessBackend`] drives
//!   them through the orchestrator
//! - [`CrashMonitor`]: marks runs whose heartbeat went stale as Crashed

#![deny(unsafe_code)]

mod backend;
mod dispatcher;
mod error;
mod monitor;
mod pools;

pub use backend::{
    BackendEvent, BackendEvents, ExecutionBackend, InProcessBackend, EXIT_FLOW_FAILED,
    EXIT_ORCHESTRATION_ERROR,
};
pub use dispatcher::{Dispatcher, DispatcherConfig, TickReport};
pub use error::{DispatchError, Result};
pub use monitor::{CrashMonitor, CrashMonitorConfig};
pub use pools::{PoolStatus, QueuedRun, WorkPools};
