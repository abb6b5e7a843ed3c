//! Conflux Types - core data model for flow/task run orchestration
//!
//! Conflux turns plain function call graphs into tracked, retryable,
//! remotely schedulable units of work. This crate holds the data every
//! other Conflux crate shares.
//!
//! # Key Concepts
//!
//! - **FlowRun**: one execution of a flow, owning its task runs and history
//! - **TaskRun**: one attempt of a task invocation inside a flow run
//! - **State**: Scheduled, Pending, Running, Completed, Failed, Crashed or
//!   Cancelled, with a timestamp and optional message/result reference
//! - **StateTransition**: an immutable, append-only history record
//! - **RetryPolicy**: attempt budget, delay strategy and retry condition
//! - **Deployment**: a named, schedulable binding of a flow to a work pool
//! - **WorkPool**: a named grouping of execution infrastructure
//! - **RunEvent**: observable notification of a stored transition

#![deny(unsafe_code)]

mod deployment;
mod errors;
mod events;
mod failure;
mod ids;
mod names;
mod retry;
mod run;
mod state;
mod work_pool;

pub use deployment::*;
pub use errors::*;
pub use events::*;
pub use failure::*;
pub use ids::*;
pub use names::*;
pub use retry::*;
pub use run::*;
pub use state::*;
pub use work_pool::*;

/// Named input values for a flow or task
pub type Parameters = serde_json::Map<String, serde_json::Value>;
