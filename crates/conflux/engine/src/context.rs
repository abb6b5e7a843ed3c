//! Explicit execution contexts
//!
//! There is no ambient "current run". A flow body receives a [`FlowContext`]
//! for submitting tasks and subflows; a task body receives a [`TaskContext`]
//! describing the attempt it is executing.

use crate::error::{OrchestrationError, Result};
use crate::flow::FlowSpec;
use crate::orchestrator::{panic_message, Orchestrator};
use crate::retry::RetryPolicyEngine;
use crate::task::{TaskHandle, TaskSpec};
use chrono::{DateTime, Utc};
use conflux_types::{
    Failure, FlowRunId, Parameters, ResultRef, RetryDecision, RetryPolicy, RunId, State,
    StateType, TaskKey, TaskRun, TaskRunId, TrackedRun,
};
use dashmap::DashMap;
use futures::future::{self, FutureExt};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// A run guarded by its single-writer lock
pub(crate) type RunCell<T> = Arc<Mutex<T>>;

const CANCELLED_MESSAGE: &str = "flow run cancelled";

/// Context handed to a flow body
#[derive(Clone)]
pub struct FlowContext {
    scope: Arc<FlowScope>,
}

impl FlowContext {
    pub(crate) fn new(scope: Arc<FlowScope>) -> Self {
        Self { scope }
    }

    pub fn flow_run_id(&self) -> FlowRunId {
        self.scope.flow_run_id
    }

    pub fn flow_name(&self) -> &str {
        &self.scope.flow_name
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.token.is_cancelled()
    }

    /// Resolves when the flow run is cancelled
    pub async fn cancelled(&self) {
        self.scope.token.cancelled().await
    }

    /// Start a task invocation and return a handle to its final outcome.
    ///
    /// The invocation runs concurrently with the flow body; retries happen
    /// behind the handle.
    pub fn submit(&self, spec: &TaskSpec, parameters: Parameters) -> Result<TaskHandle> {
        spec.retry_policy.validate()?;
        if self.is_cancelled() {
            return Err(OrchestrationError::Cancelled(self.scope.flow_run_id));
        }

        let key = self.scope.next_key(&spec.name);
        let (tx, rx) = oneshot::channel();
        let scope = self.scope.clone();
        let task = spec.clone();
        let span = info_span!("task", task = %spec.name, task_key = %key);
        let handle = TaskHandle::new(spec.name.clone(), key.clone(), rx);

        self.scope.tasks.spawn(
            async move {
                let outcome = scope.drive_task(&task, key, parameters).await;
                // The body may have dropped the handle
                let _ = tx.send(outcome);
            }
            .instrument(span),
        );
        Ok(handle)
    }

    /// Submit a task and wait for its final outcome
    pub async fn run_task(
        &self,
        spec: &TaskSpec,
        parameters: Parameters,
    ) -> std::result::Result<Value, Failure> {
        self.submit(spec, parameters)
            .map_err(submission_failure)?
            .join()
            .await
    }

    /// Join handles in order
    pub async fn join_all(
        &self,
        handles: Vec<TaskHandle>,
    ) -> Vec<std::result::Result<Value, Failure>> {
        future::join_all(handles.into_iter().map(TaskHandle::join)).await
    }

    /// Start a registered flow as a child of this flow run.
    ///
    /// A wrapper task run represents the subflow inside this flow run; the
    /// child flow run records it as its parent.
    pub fn submit_subflow(&self, flow_name: &str, parameters: Parameters) -> Result<TaskHandle> {
        let spec = self
            .scope
            .orchestrator
            .registry()
            .get(flow_name)
            .ok_or_else(|| OrchestrationError::FlowNotFound(flow_name.to_string()))?;
        if self.is_cancelled() {
            return Err(OrchestrationError::Cancelled(self.scope.flow_run_id));
        }

        let key = self.scope.next_key(&spec.name);
        let (tx, rx) = oneshot::channel();
        let scope = self.scope.clone();
        let span = info_span!("subflow", flow = %spec.name, task_key = %key);
        let handle = TaskHandle::new(spec.name.clone(), key.clone(), rx);

        self.scope.tasks.spawn(
            async move {
                let outcome = scope.drive_subflow(spec, key, parameters).await;
                let _ = tx.send(outcome);
            }
            .instrument(span),
        );
        Ok(handle)
    }

    /// Run a registered flow as a subflow and wait for it
    pub async fn run_subflow(
        &self,
        flow_name: &str,
        parameters: Parameters,
    ) -> std::result::Result<Value, Failure> {
        self.submit_subflow(flow_name, parameters)
            .map_err(submission_failure)?
            .join()
            .await
    }
}

impl std::fmt::Debug for FlowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowContext")
            .field("flow_run_id", &self.scope.flow_run_id)
            .field("flow_name", &self.scope.flow_name)
            .finish()
    }
}

/// Context handed to a task body for one attempt
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_run_id: TaskRunId,
    flow_run_id: FlowRunId,
    task_name: String,
    task_key: TaskKey,
    attempt: u32,
    token: CancellationToken,
}

impl TaskContext {
    pub fn task_run_id(&self) -> TaskRunId {
        self.task_run_id
    }

    pub fn flow_run_id(&self) -> FlowRunId {
        self.flow_run_id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn task_key(&self) -> &TaskKey {
        &self.task_key
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

fn submission_failure(error: OrchestrationError) -> Failure {
    match error {
        OrchestrationError::Cancelled(_) => Failure::cancelled(error.to_string()),
        other => Failure::new(Failure::ORCHESTRATION, other.to_string()),
    }
}

/// Result of a single task run attempt
enum Attempt {
    Succeeded(Value),
    Failed(Failure),
    Cancelled,
}

/// Shared state of one executing flow run
pub(crate) struct FlowScope {
    pub(crate) flow_run_id: FlowRunId,
    pub(crate) flow_name: String,
    pub(crate) orchestrator: Orchestrator,
    pub(crate) token: CancellationToken,
    /// Every spawned task and subflow driver
    pub(crate) tasks: TaskTracker,
    task_runs: DashMap<TaskRunId, RunCell<TaskRun>>,
    invocations: DashMap<String, u64>,
    any_task_failed: AtomicBool,
}

impl FlowScope {
    pub(crate) fn new(
        flow_run_id: FlowRunId,
        flow_name: String,
        orchestrator: Orchestrator,
        token: CancellationToken,
    ) -> Self {
        Self {
            flow_run_id,
            flow_name,
            orchestrator,
            token,
            tasks: TaskTracker::new(),
            task_runs: DashMap::new(),
            invocations: DashMap::new(),
            any_task_failed: AtomicBool::new(false),
        }
    }

    pub(crate) fn any_task_failed(&self) -> bool {
        self.any_task_failed.load(Ordering::SeqCst)
    }

    fn mark_task_failed(&self) {
        self.any_task_failed.store(true, Ordering::SeqCst);
    }

    fn next_key(&self, task_name: &str) -> TaskKey {
        let mut counter = self.invocations.entry(task_name.to_string()).or_insert(0);
        let key = TaskKey::for_invocation(task_name, *counter);
        *counter += 1;
        key
    }

    fn cells(&self) -> Vec<RunCell<TaskRun>> {
        self.task_runs.iter().map(|e| e.value().clone()).collect()
    }

    /// Register a new task run and start tracking it.
    ///
    /// Fails with [`OrchestrationError::Cancelled`] and cancels the scope when
    /// the flow run was already finished by another writer.
    async fn track(&self, run: TaskRun) -> Result<RunCell<TaskRun>> {
        let recorder = self.orchestrator.recorder();
        let flow_run = recorder
            .tracker()
            .get(&RunId::Flow(self.flow_run_id))
            .await?;
        if flow_run.state().is_terminal() {
            warn!(
                state = %flow_run.state_type(),
                task = %run.task_name,
                "Flow run already finished, not starting task"
            );
            self.token.cancel();
            return Err(OrchestrationError::Cancelled(self.flow_run_id));
        }
        recorder.tracker().register(run.clone().into()).await?;
        let id = run.id;
        let cell = Arc::new(Mutex::new(run));
        self.task_runs.insert(id, cell.clone());
        Ok(cell)
    }

    /// Cancel `cell` if the flow was cancelled; returns whether it was.
    ///
    /// Called after a cell becomes visible to [`cancel_task_runs`] so a
    /// concurrent cancellation reaches the run one way or the other.
    ///
    /// [`cancel_task_runs`]: Self::cancel_task_runs
    async fn cancel_if_requested(&self, cell: &RunCell<TaskRun>) -> Result<bool> {
        if !self.token.is_cancelled() {
            return Ok(false);
        }
        let mut run = cell.lock().await;
        self.orchestrator
            .recorder()
            .transition_if_active(&mut *run, State::cancelled(CANCELLED_MESSAGE))
            .await?;
        Ok(true)
    }

    /// Move every non-terminal task run of this flow run to Cancelled
    pub(crate) async fn cancel_task_runs(&self) {
        let recorder = self.orchestrator.recorder();
        for cell in self.cells() {
            let mut run = cell.lock().await;
            if let Err(e) = recorder
                .transition_if_active(&mut *run, State::cancelled(CANCELLED_MESSAGE))
                .await
            {
                error!(task_run_id = %run.id, error = %e, "Failed to cancel task run");
            }
        }
    }

    /// Timestamp of the most recent transition of any task run
    pub(crate) async fn latest_task_timestamp(&self) -> Option<DateTime<Utc>> {
        let mut latest = None;
        for cell in self.cells() {
            let timestamp = cell.lock().await.state().timestamp;
            latest = latest.max(Some(timestamp));
        }
        latest
    }

    async fn drive_task(
        &self,
        spec: &TaskSpec,
        key: TaskKey,
        parameters: Parameters,
    ) -> std::result::Result<Value, Failure> {
        match self.try_drive_task(spec, key, parameters).await {
            Ok(outcome) => outcome,
            Err(e @ OrchestrationError::Cancelled(_)) => Err(submission_failure(e)),
            Err(e) => {
                error!(error = %e, "Task orchestration failed");
                Err(submission_failure(e))
            }
        }
    }

    async fn try_drive_task(
        &self,
        spec: &TaskSpec,
        key: TaskKey,
        parameters: Parameters,
    ) -> Result<std::result::Result<Value, Failure>> {
        let first = TaskRun::new(
            self.flow_run_id,
            spec.name.clone(),
            key,
            1,
            spec.retry_policy.clone(),
            State::scheduled(Utc::now()),
        );
        let mut cell = self.track(first).await?;

        loop {
            if self.cancel_if_requested(&cell).await? {
                return Ok(Err(Failure::cancelled(CANCELLED_MESSAGE)));
            }

            let due = cell.lock().await.state().scheduled_time;
            if let Some(wait) = due.and_then(|due| (due - Utc::now()).to_std().ok()) {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => {
                        self.cancel_if_requested(&cell).await?;
                        return Ok(Err(Failure::cancelled(CANCELLED_MESSAGE)));
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }

            let failure = match self.run_attempt(spec, &cell, &parameters).await? {
                Attempt::Succeeded(value) => return Ok(Ok(value)),
                Attempt::Cancelled => return Ok(Err(Failure::cancelled(CANCELLED_MESSAGE))),
                Attempt::Failed(failure) => failure,
            };

            let run = cell.lock().await.clone();
            let decision = {
                let mut rng = self.orchestrator.rng().lock().await;
                RetryPolicyEngine::on_failure(&run, &failure, &mut *rng)
            };
            match decision {
                RetryDecision::Retry(delay) => {
                    info!(
                        task_run_id = %run.id,
                        attempt = run.attempt,
                        delay_ms = delay.as_millis() as u64,
                        failure = %failure,
                        "Retrying task"
                    );
                    let scheduled_for = chrono::Duration::from_std(delay)
                        .ok()
                        .and_then(|delay| Utc::now().checked_add_signed(delay))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    cell = self.track(run.next_attempt(scheduled_for)).await?;
                }
                RetryDecision::GiveUp => {
                    warn!(
                        task_run_id = %run.id,
                        attempt = run.attempt,
                        failure = %failure,
                        "Task failed, giving up"
                    );
                    self.mark_task_failed();
                    return Ok(Err(failure));
                }
            }
        }
    }

    /// Pending -> Running -> body -> Completed | Failed for one attempt
    async fn run_attempt(
        &self,
        spec: &TaskSpec,
        cell: &RunCell<TaskRun>,
        parameters: &Parameters,
    ) -> Result<Attempt> {
        let recorder = self.orchestrator.recorder();

        let ctx = {
            let mut run = cell.lock().await;
            if recorder
                .transition_if_active(&mut *run, State::pending())
                .await?
                .is_none()
            {
                return Ok(Attempt::Cancelled);
            }
            recorder.transition(&mut *run, State::running()).await?;
            TaskContext {
                task_run_id: run.id,
                flow_run_id: self.flow_run_id,
                task_name: run.task_name.clone(),
                task_key: run.task_key.clone(),
                attempt: run.attempt,
                token: self.token.clone(),
            }
        };
        debug!(task_run_id = %ctx.task_run_id, attempt = ctx.attempt, "Task run started");

        let body = AssertUnwindSafe(spec.callable.invoke(ctx, parameters.clone())).catch_unwind();
        let outcome = tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            outcome = body => Some(outcome),
        };

        let mut run = cell.lock().await;
        let outcome = match outcome {
            Some(outcome) if !self.token.is_cancelled() => outcome,
            _ => {
                recorder
                    .transition_if_active(&mut *run, State::cancelled(CANCELLED_MESSAGE))
                    .await?;
                return Ok(Attempt::Cancelled);
            }
        };

        match outcome {
            Ok(Ok(value)) => {
                let result = ResultRef::for_run(&run.run_id());
                self.orchestrator
                    .results()
                    .put(result.clone(), value.clone())
                    .await?;
                let completed = State::completed().with_result(result);
                match recorder.transition_if_active(&mut *run, completed).await? {
                    Some(_) => {
                        debug!(task_run_id = %run.id, "Task run completed");
                        Ok(Attempt::Succeeded(value))
                    }
                    None => Ok(Attempt::Cancelled),
                }
            }
            Ok(Err(failure)) => self.fail_attempt(&mut run, failure).await,
            Err(panic) => {
                let failure = Failure::panic(panic_message(panic.as_ref()));
                self.fail_attempt(&mut run, failure).await
            }
        }
    }

    async fn fail_attempt(&self, run: &mut TaskRun, failure: Failure) -> Result<Attempt> {
        let failed = State::failed(failure.to_string());
        match self
            .orchestrator
            .recorder()
            .transition_if_active(run, failed)
            .await?
        {
            Some(_) => Ok(Attempt::Failed(failure)),
            None => Ok(Attempt::Cancelled),
        }
    }

    async fn drive_subflow(
        &self,
        spec: FlowSpec,
        key: TaskKey,
        parameters: Parameters,
    ) -> std::result::Result<Value, Failure> {
        match self.try_drive_subflow(spec, key, parameters).await {
            Ok(outcome) => outcome,
            Err(e @ OrchestrationError::Cancelled(_)) => Err(submission_failure(e)),
            Err(e) => {
                error!(error = %e, "Subflow orchestration failed");
                Err(submission_failure(e))
            }
        }
    }

    async fn try_drive_subflow(
        &self,
        spec: FlowSpec,
        key: TaskKey,
        parameters: Parameters,
    ) -> Result<std::result::Result<Value, Failure>> {
        let recorder = self.orchestrator.recorder();
        let wrapper = TaskRun::new(
            self.flow_run_id,
            spec.name.clone(),
            key,
            1,
            RetryPolicy::none(),
            State::scheduled(Utc::now()),
        );
        let cell = self.track(wrapper).await?;
        if self.cancel_if_requested(&cell).await? {
            return Ok(Err(Failure::cancelled(CANCELLED_MESSAGE)));
        }

        let wrapper_id = {
            let mut run = cell.lock().await;
            if recorder
                .transition_if_active(&mut *run, State::pending())
                .await?
                .is_none()
            {
                return Ok(Err(Failure::cancelled(CANCELLED_MESSAGE)));
            }
            recorder.transition(&mut *run, State::running()).await?;
            run.id
        };

        let child = self
            .orchestrator
            .new_flow_run(&spec.name, parameters)
            .await
            .with_parent_task_run(wrapper_id);
        recorder.tracker().register(child.clone().into()).await?;
        info!(child_flow_run_id = %child.id, "Subflow run created");

        let outcome = self
            .orchestrator
            .execute(child, spec, self.token.child_token())
            .await?;

        let mut run = cell.lock().await;
        match outcome.state.state_type {
            StateType::Completed => {
                let mut completed = State::completed();
                if let Some(result) = outcome.state.result.clone() {
                    completed = completed.with_result(result);
                }
                recorder.transition_if_active(&mut *run, completed).await?;
                Ok(Ok(outcome.value.unwrap_or(Value::Null)))
            }
            StateType::Cancelled => {
                recorder
                    .transition_if_active(&mut *run, State::cancelled(CANCELLED_MESSAGE))
                    .await?;
                Ok(Err(Failure::cancelled(CANCELLED_MESSAGE)))
            }
            other => {
                let failure = outcome.failure.unwrap_or_else(|| {
                    Failure::new(
                        "FlowFailure",
                        format!("subflow {} ended {}", outcome.flow_run_id, other),
                    )
                });
                if recorder
                    .transition_if_active(&mut *run, State::failed(failure.to_string()))
                    .await?
                    .is_some()
                {
                    self.mark_task_failed();
                }
                Ok(Err(failure))
            }
        }
    }
}
