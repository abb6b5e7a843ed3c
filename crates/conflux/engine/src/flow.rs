//! Flow specifications and the flow registry

use crate::context::FlowContext;
use async_trait::async_trait;
use conflux_types::{Entrypoint, Failure, Parameters};
use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// User code executed as a flow body
#[async_trait]
pub trait FlowCallable: Send + Sync {
    async fn invoke(&self, ctx: FlowContext, parameters: Parameters) -> Result<Value, Failure>;
}

/// Adapter turning an async closure into a [`FlowCallable`]
pub struct FnFlow<F, Fut> {
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> FlowCallable for FnFlow<F, Fut>
where
    F: Fn(FlowContext, Parameters) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, Failure>> + Send,
{
    async fn invoke(&self, ctx: FlowContext, parameters: Parameters) -> Result<Value, Failure> {
        (self.f)(ctx, parameters).await
    }
}

/// Wrap an async closure as a flow body
pub fn flow_fn<F, Fut>(f: F) -> Arc<dyn FlowCallable>
where
    F: Fn(FlowContext, Parameters) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Failure>> + Send + 'static,
{
    Arc::new(FnFlow {
        f,
        _future: PhantomData,
    })
}

/// When a task failure fails the enclosing flow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePropagation {
    /// Only if the flow body returns the failure
    #[default]
    Unhandled,
    /// Whenever any task run of the flow gives up in Failed
    AnyTaskFailure,
}

/// A flow: its name, body and failure propagation mode
#[derive(Clone)]
pub struct FlowSpec {
    pub name: String,
    pub callable: Arc<dyn FlowCallable>,
    pub failure_propagation: FailurePropagation,
}

impl FlowSpec {
    pub fn new(name: impl Into<String>, callable: Arc<dyn FlowCallable>) -> Self {
        Self {
            name: name.into(),
            callable,
            failure_propagation: FailurePropagation::default(),
        }
    }

    pub fn with_failure_propagation(mut self, propagation: FailurePropagation) -> Self {
        self.failure_propagation = propagation;
        self
    }
}

impl fmt::Debug for FlowSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowSpec")
            .field("name", &self.name)
            .field("failure_propagation", &self.failure_propagation)
            .finish_non_exhaustive()
    }
}

/// Flows known to this process, by name
#[derive(Debug, Default)]
pub struct FlowRegistry {
    flows: DashMap<String, FlowSpec>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow, replacing any flow with the same name
    pub fn register(&self, spec: FlowSpec) {
        self.flows.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<FlowSpec> {
        self.flows.get(name).map(|spec| spec.value().clone())
    }

    /// Find the flow for a deployment: entrypoint function first, then flow name
    pub fn resolve(&self, entrypoint: Option<&Entrypoint>, flow_name: &str) -> Option<FlowSpec> {
        entrypoint
            .and_then(|entrypoint| self.get(&entrypoint.function))
            .or_else(|| self.get(flow_name))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.flows.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
