//! Flow runs and task runs
//!
//! A run's current state and history are only changed through
//! [`TrackedRun::apply_transition`], which the engine's state machine calls
//! after validating the transition.

use crate::{
    generate_run_name, Deployment, DeploymentId, FlowRunId, Parameters, RetryPolicy, RunId, State,
    StateTransition, StateType, TaskKey, TaskRunId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Common view over flow runs and task runs
pub trait TrackedRun {
    fn run_id(&self) -> RunId;

    fn state(&self) -> &State;

    fn history(&self) -> &[StateTransition];

    /// Append a validated transition and make its target the current state.
    ///
    /// Callers outside the state machine must not use this directly.
    fn apply_transition(&mut self, transition: StateTransition);

    fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }
}

/// Whether a run is a flow run or a task run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Flow,
    Task,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunKind::Flow => f.write_str("flow-run"),
            RunKind::Task => f.write_str("task-run"),
        }
    }
}

/// One execution of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRun {
    pub id: FlowRunId,
    /// Generated `adjective-noun` name
    pub name: String,
    pub flow_name: String,
    pub parameters: Parameters,
    /// Set when this run is a subflow invoked from a task run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_run: Option<TaskRunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<DeploymentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_pool: Option<String>,
    /// Entrypoint snapshot taken from the deployment at creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    state: State,
    history: Vec<StateTransition>,
}

impl FlowRun {
    /// Create a run in `initial` state with a generated name
    pub fn new(flow_name: impl Into<String>, parameters: Parameters, initial: State) -> Self {
        Self::with_name(
            flow_name,
            generate_run_name(&mut rand::thread_rng()),
            parameters,
            initial,
        )
    }

    pub fn with_name(
        flow_name: impl Into<String>,
        name: impl Into<String>,
        parameters: Parameters,
        initial: State,
    ) -> Self {
        let id = FlowRunId::generate();
        let created_at = initial.timestamp;
        Self {
            id,
            name: name.into(),
            flow_name: flow_name.into(),
            parameters,
            parent_task_run: None,
            deployment_id: None,
            work_pool: None,
            entrypoint: None,
            tags: Vec::new(),
            created_at,
            history: vec![StateTransition::initial(RunId::Flow(id), initial.clone())],
            state: initial,
        }
    }

    /// Create a Scheduled run from a deployment.
    ///
    /// Parameters are the deployment defaults overlaid with `overrides`; the
    /// entrypoint, pool and tags are copied so later re-registrations of the
    /// deployment do not affect this run.
    pub fn from_deployment(
        deployment: &Deployment,
        overrides: Parameters,
        scheduled_for: DateTime<Utc>,
    ) -> Self {
        let mut parameters = deployment.parameters.clone();
        parameters.extend(overrides);

        let mut run = Self::new(
            deployment.flow_name.clone(),
            parameters,
            State::scheduled(scheduled_for),
        );
        run.deployment_id = Some(deployment.id);
        run.work_pool = Some(deployment.work_pool.clone());
        run.entrypoint = Some(deployment.entrypoint.clone());
        run.tags = deployment.tags.clone();
        run
    }

    pub fn with_parent_task_run(mut self, parent: TaskRunId) -> Self {
        self.parent_task_run = Some(parent);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn state_type(&self) -> StateType {
        self.state.state_type
    }
}

impl TrackedRun for FlowRun {
    fn run_id(&self) -> RunId {
        RunId::Flow(self.id)
    }

    fn state(&self) -> &State {
        &self.state
    }

    fn history(&self) -> &[StateTransition] {
        &self.history
    }

    fn apply_transition(&mut self, transition: StateTransition) {
        self.state = transition.to.clone();
        self.history.push(transition);
    }
}

/// One attempt of a task invocation inside a flow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: TaskRunId,
    pub flow_run_id: FlowRunId,
    pub task_name: String,
    pub task_key: TaskKey,
    /// 1-based attempt counter
    pub attempt: u32,
    pub retry_policy: RetryPolicy,
    pub created_at: DateTime<Utc>,
    state: State,
    history: Vec<StateTransition>,
}

impl TaskRun {
    pub fn new(
        flow_run_id: FlowRunId,
        task_name: impl Into<String>,
        task_key: TaskKey,
        attempt: u32,
        retry_policy: RetryPolicy,
        initial: State,
    ) -> Self {
        let id = TaskRunId::generate();
        let created_at = initial.timestamp;
        Self {
            id,
            flow_run_id,
            task_name: task_name.into(),
            task_key,
            attempt,
            retry_policy,
            created_at,
            history: vec![StateTransition::initial(RunId::Task(id), initial.clone())],
            state: initial,
        }
    }

    /// The next attempt of the same invocation, Scheduled for `scheduled_for`
    pub fn next_attempt(&self, scheduled_for: DateTime<Utc>) -> Self {
        Self::new(
            self.flow_run_id,
            self.task_name.clone(),
            self.task_key.clone(),
            self.attempt + 1,
            self.retry_policy.clone(),
            State::scheduled(scheduled_for),
        )
    }

    pub fn state_type(&self) -> StateType {
        self.state.state_type
    }
}

impl TrackedRun for TaskRun {
    fn run_id(&self) -> RunId {
        RunId::Task(self.id)
    }

    fn state(&self) -> &State {
        &self.state
    }

    fn history(&self) -> &[StateTransition] {
        &self.history
    }

    fn apply_transition(&mut self, transition: StateTransition) {
        self.state = transition.to.clone();
        self.history.push(transition);
    }
}

/// Either kind of run, as stored by the run tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunRecord {
    Flow(FlowRun),
    Task(TaskRun),
}

impl RunRecord {
    pub fn kind(&self) -> RunKind {
        match self {
            RunRecord::Flow(_) => RunKind::Flow,
            RunRecord::Task(_) => RunKind::Task,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            RunRecord::Flow(run) => run.created_at,
            RunRecord::Task(run) => run.created_at,
        }
    }

    pub fn as_flow(&self) -> Option<&FlowRun> {
        match self {
            RunRecord::Flow(run) => Some(run),
            RunRecord::Task(_) => None,
        }
    }

    pub fn as_task(&self) -> Option<&TaskRun> {
        match self {
            RunRecord::Task(run) => Some(run),
            RunRecord::Flow(_) => None,
        }
    }

    /// Parent flow run of a task run; a flow run's own id
    pub fn flow_run_id(&self) -> FlowRunId {
        match self {
            RunRecord::Flow(run) => run.id,
            RunRecord::Task(run) => run.flow_run_id,
        }
    }
}

impl TrackedRun for RunRecord {
    fn run_id(&self) -> RunId {
        match self {
            RunRecord::Flow(run) => run.run_id(),
            RunRecord::Task(run) => run.run_id(),
        }
    }

    fn state(&self) -> &State {
        match self {
            RunRecord::Flow(run) => run.state(),
            RunRecord::Task(run) => run.state(),
        }
    }

    fn history(&self) -> &[StateTransition] {
        match self {
            RunRecord::Flow(run) => run.history(),
            RunRecord::Task(run) => run.history(),
        }
    }

    fn apply_transition(&mut self, transition: StateTransition) {
        match self {
            RunRecord::Flow(run) => run.apply_transition(transition),
            RunRecord::Task(run) => run.apply_transition(transition),
        }
    }
}

impl From<FlowRun> for RunRecord {
    fn from(run: FlowRun) -> Self {
        RunRecord::Flow(run)
    }
}

impl From<TaskRun> for RunRecord {
    fn from(run: TaskRun) -> Self {
        RunRecord::Task(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Schedule, SourceLocation};
    use serde_json::json;

    fn params(value: serde_json::Value) -> Parameters {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_new_flow_run_has_initial_transition() {
        let run = FlowRun::new("etl", Parameters::new(), State::pending());
        assert_eq!(run.state_type(), StateType::Pending);
        assert_eq!(run.history().len(), 1);
        assert_eq!(run.history()[0].from, None);
        assert!(run.name.contains('-'));
    }

    #[test]
    fn test_from_deployment_snapshots_configuration() {
        let deployment = Deployment::new(
            "nightly",
            "etl",
            SourceLocation::local("/srv/flows"),
            "etl.rs:etl",
            "default-pool",
        )
        .with_parameters(params(json!({"region": "eu", "limit": 10})))
        .with_schedule(Schedule::interval(std::time::Duration::from_secs(60)));

        let scheduled_for = Utc::now();
        let run = FlowRun::from_deployment(
            &deployment,
            params(json!({"limit": 5})),
            scheduled_for,
        );

        assert_eq!(run.deployment_id, Some(deployment.id));
        assert_eq!(run.work_pool.as_deref(), Some("default-pool"));
        assert_eq!(run.entrypoint.as_deref(), Some("etl.rs:etl"));
        assert_eq!(run.parameters["region"], json!("eu"));
        assert_eq!(run.parameters["limit"], json!(5));
        assert_eq!(run.state().scheduled_time, Some(scheduled_for));
    }

    #[test]
    fn test_next_attempt_keeps_task_key() {
        let task = TaskRun::new(
            FlowRunId::generate(),
            "extract",
            TaskKey::for_invocation("extract", 0),
            1,
            RetryPolicy::none(),
            State::scheduled(Utc::now()),
        );
        let next = task.next_attempt(Utc::now());
        assert_eq!(next.attempt, 2);
        assert_eq!(next.task_key, task.task_key);
        assert_ne!(next.id, task.id);
        assert_eq!(next.flow_run_id, task.flow_run_id);
    }

    #[test]
    fn test_run_record_accessors() {
        let flow = FlowRun::new("etl", Parameters::new(), State::pending());
        let record = RunRecord::from(flow.clone());
        assert_eq!(record.kind(), RunKind::Flow);
        assert_eq!(record.flow_run_id(), flow.id);
        assert_eq!(record.run_id(), RunId::Flow(flow.id));
    }
}
