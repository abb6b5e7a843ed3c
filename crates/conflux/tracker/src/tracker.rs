//! The run tracker contract
//!
//! The tracker is the single source of truth for run state. Writers register
//! runs and append transitions; observers read snapshots, page through
//! queries, and subscribe to [`RunEvent`]s. Nothing here rewrites history.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conflux_types::{
    DeploymentId, FlowRunId, RunEvent, RunId, RunKind, RunRecord, State, StateTransition,
    StateType, TrackedRun,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Persistence and query interface for run state
#[async_trait]
pub trait RunTracker: Send + Sync {
    /// Store a new run with its initial transition.
    ///
    /// Registering an identical record again is a no-op.
    async fn register(&self, run: RunRecord) -> Result<()>;

    /// Append a transition to a run's history.
    ///
    /// A retransmission of an already stored transition (same run id, target
    /// state and timestamp) is reported as [`RecordOutcome::Duplicate`].
    async fn record(&self, transition: StateTransition) -> Result<RecordOutcome>;

    /// Latest materialized snapshot of a run
    async fn get(&self, run_id: &RunId) -> Result<RunSnapshot>;

    /// One page of runs matching `filter`, newest first.
    ///
    /// `filter.limit` is applied by [`RunQuery`](crate::RunQuery), not here.
    async fn query_page(
        &self,
        filter: &RunFilter,
        cursor: Option<&QueryCursor>,
        page_size: usize,
    ) -> Result<RunPage>;

    /// Record a liveness heartbeat for a flow run
    async fn heartbeat(&self, flow_run_id: &FlowRunId, at: DateTime<Utc>) -> Result<()>;

    /// Archive every task run of a flow run; returns how many were archived
    async fn archive_task_runs(&self, flow_run_id: &FlowRunId) -> Result<usize>;

    /// Subscribe to an event per stored transition
    fn subscribe(&self) -> broadcast::Receiver<RunEvent>;
}

/// Result of appending a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Appended,
    Duplicate,
}

/// Materialized view of a run: metadata, current state and full history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: RunRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archived: bool,
}

impl RunSnapshot {
    pub fn run_id(&self) -> RunId {
        self.run.run_id()
    }

    pub fn kind(&self) -> RunKind {
        self.run.kind()
    }

    pub fn state(&self) -> &State {
        self.run.state()
    }

    pub fn state_type(&self) -> StateType {
        self.run.state().state_type
    }

    pub fn history(&self) -> &[StateTransition] {
        self.run.history()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.run.created_at()
    }

    pub fn cursor(&self) -> QueryCursor {
        QueryCursor {
            created_at: self.created_at(),
            run_id: self.run_id(),
        }
    }
}

/// Position after the last item of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryCursor {
    pub created_at: DateTime<Utc>,
    pub run_id: RunId,
}

/// One page of query results
#[derive(Debug, Clone, Default)]
pub struct RunPage {
    pub runs: Vec<RunSnapshot>,
    /// `None` when no further runs match
    pub next_cursor: Option<QueryCursor>,
}

/// Criteria for selecting runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunFilter {
    pub kind: Option<RunKind>,
    pub states: Option<Vec<StateType>>,
    pub flow_name: Option<String>,
    pub task_name: Option<String>,
    /// Task runs of this flow run (and the flow run itself)
    pub flow_run_id: Option<FlowRunId>,
    pub deployment_id: Option<DeploymentId>,
    pub work_pool: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub archived: Option<bool>,
    pub limit: Option<usize>,
}

impl RunFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flow_runs() -> Self {
        Self {
            kind: Some(RunKind::Flow),
            ..Self::default()
        }
    }

    pub fn task_runs_of(flow_run_id: FlowRunId) -> Self {
        Self {
            kind: Some(RunKind::Task),
            flow_run_id: Some(flow_run_id),
            ..Self::default()
        }
    }

    pub fn in_states(mut self, states: impl IntoIterator<Item = StateType>) -> Self {
        self.states = Some(states.into_iter().collect());
        self
    }

    pub fn with_flow_name(mut self, name: impl Into<String>) -> Self {
        self.flow_name = Some(name.into());
        self
    }

    pub fn with_task_name(mut self, name: impl Into<String>) -> Self {
        self.task_name = Some(name.into());
        self
    }

    pub fn with_deployment(mut self, deployment_id: DeploymentId) -> Self {
        self.deployment_id = Some(deployment_id);
        self
    }

    pub fn with_work_pool(mut self, pool: impl Into<String>) -> Self {
        self.work_pool = Some(pool.into());
        self
    }

    pub fn created_between(
        mut self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_after = after;
        self.created_before = before;
        self
    }

    pub fn archived(mut self, archived: bool) -> Self {
        self.archived = Some(archived);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, snapshot: &RunSnapshot) -> bool {
        if let Some(kind) = self.kind {
            if snapshot.kind() != kind {
                return false;
            }
        }
        if let Some(states) = &self.states {
            if !states.contains(&snapshot.state_type()) {
                return false;
            }
        }
        if let Some(archived) = self.archived {
            if snapshot.archived != archived {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if snapshot.created_at() < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if snapshot.created_at() >= before {
                return false;
            }
        }
        if let Some(flow_run_id) = self.flow_run_id {
            if snapshot.run.flow_run_id() != flow_run_id {
                return false;
            }
        }

        match &snapshot.run {
            RunRecord::Flow(run) => {
                if self.task_name.is_some() {
                    return false;
                }
                if let Some(name) = &self.flow_name {
                    if &run.flow_name != name {
                        return false;
                    }
                }
                if let Some(deployment_id) = self.deployment_id {
                    if run.deployment_id != Some(deployment_id) {
                        return false;
                    }
                }
                if let Some(pool) = &self.work_pool {
                    if run.work_pool.as_ref() != Some(pool) {
                        return false;
                    }
                }
                true
            }
            RunRecord::Task(run) => {
                if self.flow_name.is_some()
                    || self.deployment_id.is_some()
                    || self.work_pool.is_some()
                {
                    return false;
                }
                if let Some(name) = &self.task_name {
                    if &run.task_name != name {
                        return false;
                    }
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_types::{FlowRun, Parameters, RetryPolicy, TaskKey, TaskRun};

    fn flow_snapshot(name: &str) -> RunSnapshot {
        RunSnapshot {
            run: RunRecord::Flow(FlowRun::new(name, Parameters::new(), State::pending())),
            last_heartbeat: None,
            archived: false,
        }
    }

    fn task_snapshot(flow_run_id: FlowRunId, name: &str) -> RunSnapshot {
        RunSnapshot {
            run: RunRecord::Task(TaskRun::new(
                flow_run_id,
                name,
                TaskKey::for_invocation(name, 0),
                1,
                RetryPolicy::none(),
                State::scheduled(Utc::now()),
            )),
            last_heartbeat: None,
            archived: false,
        }
    }

    #[test]
    fn test_filter_by_kind_and_state() {
        let flow = flow_snapshot("etl");
        let filter = RunFilter::flow_runs().in_states([StateType::Pending]);
        assert!(filter.matches(&flow));
        assert!(!RunFilter::flow_runs()
            .in_states([StateType::Running])
            .matches(&flow));
    }

    #[test]
    fn test_task_filter_by_parent() {
        let flow_run_id = FlowRunId::generate();
        let task = task_snapshot(flow_run_id, "extract");
        assert!(RunFilter::task_runs_of(flow_run_id).matches(&task));
        assert!(!RunFilter::task_runs_of(FlowRunId::generate()).matches(&task));
        assert!(RunFilter::new().with_task_name("extract").matches(&task));
        assert!(!RunFilter::new().with_task_name("load").matches(&task));
    }

    #[test]
    fn test_flow_only_criteria_exclude_tasks() {
        let task = task_snapshot(FlowRunId::generate(), "extract");
        assert!(!RunFilter::new().with_flow_name("etl").matches(&task));
        assert!(RunFilter::new().with_flow_name("etl").matches(&flow_snapshot("etl")));
    }

    #[test]
    fn test_archived_filter() {
        let mut task = task_snapshot(FlowRunId::generate(), "extract");
        task.archived = true;
        assert!(RunFilter::new().matches(&task));
        assert!(!RunFilter::new().archived(false).matches(&task));
    }
}
