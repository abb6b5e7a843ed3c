//! Strongly-typed identifiers for Conflux entities
//!
//! All IDs are UUID-based but wrapped in newtype structs for type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a flow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowRunId(Uuid);

impl FlowRunId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for FlowRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow-run:{}", self.0)
    }
}

/// Unique identifier for a single task run attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskRunId(Uuid);

impl TaskRunId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TaskRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-run:{}", self.0)
    }
}

/// Unique identifier for a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeploymentId(Uuid);

impl DeploymentId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deploy:{}", self.0)
    }
}

/// Stable key shared by every retry attempt of one task invocation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey(String);

impl TaskKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for the `index`-th invocation of `task_name` inside a flow run
    pub fn for_invocation(task_name: &str, index: u64) -> Self {
        Self(format!("{}-{}", task_name, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of any tracked run, flow or task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RunId {
    Flow(FlowRunId),
    Task(TaskRunId),
}

impl RunId {
    pub fn as_flow(&self) -> Option<FlowRunId> {
        match self {
            RunId::Flow(id) => Some(*id),
            RunId::Task(_) => None,
        }
    }

    pub fn as_task(&self) -> Option<TaskRunId> {
        match self {
            RunId::Task(id) => Some(*id),
            RunId::Flow(_) => None,
        }
    }

    pub fn as_uuid(&self) -> &Uuid {
        match self {
            RunId::Flow(id) => id.as_uuid(),
            RunId::Task(id) => id.as_uuid(),
        }
    }
}

impl From<FlowRunId> for RunId {
    fn from(id: FlowRunId) -> Self {
        RunId::Flow(id)
    }
}

impl From<TaskRunId> for RunId {
    fn from(id: TaskRunId) -> Self {
        RunId::Task(id)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunId::Flow(id) => id.fmt(f),
            RunId::Task(id) => id.fmt(f),
        }
    }
}
