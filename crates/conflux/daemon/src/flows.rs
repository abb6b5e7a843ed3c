//! Flows compiled into confluxd
//!
//! Deployments reference these by entrypoint function name.

use conflux_engine::{flow_fn, task_fn, FlowRegistry, FlowSpec, TaskSpec};
use conflux_types::{Failure, Parameters, RetryPolicy};
use serde_json::{json, Value};
use std::time::Duration;

/// `noop`: completes immediately
pub fn noop() -> FlowSpec {
    FlowSpec::new(
        "noop",
        flow_fn(|_ctx, _params| async move { Ok::<_, Failure>(Value::Null) }),
    )
}

/// `echo`: returns its parameters through a task
pub fn echo() -> FlowSpec {
    let task = TaskSpec::new(
        "echo",
        task_fn(|_ctx, params: Parameters| async move { Ok::<_, Failure>(json!(params)) }),
    );
    FlowSpec::new(
        "echo",
        flow_fn(move |ctx, params| {
            let task = task.clone();
            async move { ctx.run_task(&task, params).await }
        }),
    )
}

/// `sleep`: waits `seconds` (default 1) unless cancelled first
pub fn sleep() -> FlowSpec {
    let task = TaskSpec::new(
        "sleep",
        task_fn(|ctx, params: Parameters| async move {
            let seconds = params.get("seconds").and_then(Value::as_f64).unwrap_or(1.0);
            if !seconds.is_finite() || seconds < 0.0 {
                return Err(Failure::new("ValueError", format!("invalid seconds: {}", seconds)));
            }
            tokio::select! {
                _ = ctx.cancelled() => Err(Failure::cancelled("sleep interrupted")),
                _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => Ok(json!(seconds)),
            }
        }),
    )
    .with_retry_policy(RetryPolicy::none());
    FlowSpec::new(
        "sleep",
        flow_fn(move |ctx, params| {
            let task = task.clone();
            async move { ctx.run_task(&task, params).await }
        }),
    )
}

/// Registry holding every built-in flow
pub fn builtin() -> FlowRegistry {
    let registry = FlowRegistry::new();
    registry.register(noop());
    registry.register(echo());
    registry.register(sleep());
    registry
}
