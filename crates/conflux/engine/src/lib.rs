//! Conflux Engine - turning flow bodies into tracked runs
//!
//! - [`StateMachine`]: the only legal way to change a run's state
//! - [`RetryPolicyEngine`]: retry decisions and jittered delays
//! - [`Orchestrator`]: drives flow runs, their task runs and subflows
//! - [`FlowContext`] / [`TaskContext`]: explicit contexts passed to user code
//!
//! User code plugs in through the [`FlowCallable`] and [`TaskCallable`]
//! capability traits, or the [`flow_fn`] and [`task_fn`] closure adapters.

#![deny(unsafe_code)]

mod context;
mod error;
mod flow;
mod orchestrator;
mod recorder;
mod retry;
mod state_machine;
mod task;

pub use context::{FlowContext, TaskContext};
pub use error::{OrchestrationError, Result, TransitionError};
pub use flow::{flow_fn, FailurePropagation, FlowCallable, FlowRegistry, FlowSpec, FnFlow};
pub use orchestrator::{FlowOutcome, Orchestrator, OrchestratorConfig};
pub use recorder::RunRecorder;
pub use retry::{apply_jitter, RetryPolicyEngine};
pub use state_machine::StateMachine;
pub use task::{task_fn, FnTask, TaskCallable, TaskHandle, TaskSpec};
