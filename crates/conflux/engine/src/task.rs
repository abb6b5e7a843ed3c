//! Task specifications, callables and handles

use crate::context::TaskContext;
use async_trait::async_trait;
use conflux_types::{Failure, Parameters, RetryPolicy, TaskKey};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::oneshot;

/// User code executed as a task body
#[async_trait]
pub trait TaskCallable: Send + Sync {
    async fn invoke(&self, ctx: TaskContext, parameters: Parameters) -> Result<Value, Failure>;
}

/// Adapter turning an async closure into a [`TaskCallable`]
pub struct FnTask<F, Fut> {
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> TaskCallable for FnTask<F, Fut>
where
    F: Fn(TaskContext, Parameters) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, Failure>> + Send,
{
    async fn invoke(&self, ctx: TaskContext, parameters: Parameters) -> Result<Value, Failure> {
        (self.f)(ctx, parameters).await
    }
}

/// Wrap an async closure as a task body
pub fn task_fn<F, Fut>(f: F) -> Arc<dyn TaskCallable>
where
    F: Fn(TaskContext, Parameters) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Failure>> + Send + 'static,
{
    Arc::new(FnTask {
        f,
        _future: PhantomData,
    })
}

/// A task: its name, body and retry configuration
#[derive(Clone)]
pub struct TaskSpec {
    pub name: String,
    pub callable: Arc<dyn TaskCallable>,
    pub retry_policy: RetryPolicy,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, callable: Arc<dyn TaskCallable>) -> Self {
        Self {
            name: name.into(),
            callable,
            retry_policy: RetryPolicy::none(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

/// Handle to a submitted task (or subflow) invocation.
///
/// Resolves once the invocation reaches its final outcome, after all retries.
#[derive(Debug)]
pub struct TaskHandle {
    task_name: String,
    task_key: TaskKey,
    outcome: oneshot::Receiver<Result<Value, Failure>>,
}

impl TaskHandle {
    pub(crate) fn new(
        task_name: String,
        task_key: TaskKey,
        outcome: oneshot::Receiver<Result<Value, Failure>>,
    ) -> Self {
        Self {
            task_name,
            task_key,
            outcome,
        }
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn task_key(&self) -> &TaskKey {
        &self.task_key
    }

    /// Wait for the final value or failure of the invocation
    pub async fn join(self) -> Result<Value, Failure> {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Failure::new(
                Failure::ORCHESTRATION,
                format!("task {} ended without reporting an outcome", self.task_key),
            )),
        }
    }
}
