//! Flow run orchestrator
//!
//! Drives one flow run at a time from Pending (or Scheduled) to a terminal
//! state: runs the flow body with a [`FlowContext`], waits for every task it
//! submitted, and records the outcome. Many flow runs may be driven
//! concurrently through one orchestrator.

use crate::context::{FlowContext, FlowScope, RunCell};
use crate::error::{OrchestrationError, Result};
use crate::flow::{FailurePropagation, FlowRegistry, FlowSpec};
use crate::recorder::RunRecorder;
use chrono::{Duration as ChronoDuration, Utc};
use conflux_tracker::{ResultStore, RunTracker, TrackerError};
use conflux_types::{
    generate_run_name, Failure, FlowRun, FlowRunId, Parameters, ResultRef, RunId, State,
    StateType, TrackedRun,
};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often a running flow run reports liveness
    pub heartbeat_interval: Duration,
    /// Archive a flow run's task runs once the flow run is terminal
    pub archive_task_runs: bool,
    /// Seed for retry jitter and run names; entropy when absent
    pub rng_seed: Option<u64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            archive_task_runs: true,
            rng_seed: None,
        }
    }
}

/// Final outcome of driving a flow run
#[derive(Debug, Clone, PartialEq)]
pub struct FlowOutcome {
    pub flow_run_id: FlowRunId,
    pub state: State,
    /// Return value of the flow body when Completed
    pub value: Option<Value>,
    pub failure: Option<Failure>,
}

impl FlowOutcome {
    pub fn state_type(&self) -> StateType {
        self.state.state_type
    }

    pub fn is_completed(&self) -> bool {
        self.state.is_final_success()
    }

    fn from_state(flow_run_id: FlowRunId, state: State) -> Self {
        Self {
            flow_run_id,
            state,
            value: None,
            failure: None,
        }
    }
}

/// Drives flow runs to completion
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    recorder: RunRecorder,
    results: Arc<dyn ResultStore>,
    registry: Arc<FlowRegistry>,
    config: OrchestratorConfig,
    rng: Mutex<StdRng>,
    /// Cancellation tokens of flow runs currently driven here
    active: DashMap<FlowRunId, CancellationToken>,
}

impl Orchestrator {
    pub fn new(
        tracker: Arc<dyn RunTracker>,
        results: Arc<dyn ResultStore>,
        registry: Arc<FlowRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            inner: Arc::new(OrchestratorInner {
                recorder: RunRecorder::new(tracker),
                results,
                registry,
                config,
                rng: Mutex::new(rng),
                active: DashMap::new(),
            }),
        }
    }

    pub fn tracker(&self) -> &Arc<dyn RunTracker> {
        self.inner.recorder.tracker()
    }

    pub fn results(&self) -> &Arc<dyn ResultStore> {
        &self.inner.results
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub(crate) fn recorder(&self) -> &RunRecorder {
        &self.inner.recorder
    }

    pub(crate) fn rng(&self) -> &Mutex<StdRng> {
        &self.inner.rng
    }

    /// Flow runs currently being driven by this orchestrator
    pub fn active_flow_runs(&self) -> Vec<FlowRunId> {
        self.inner.active.iter().map(|e| *e.key()).collect()
    }

    /// A new Pending flow run with a generated name
    pub(crate) async fn new_flow_run(&self, flow_name: &str, parameters: Parameters) -> FlowRun {
        let name = {
            let mut rng = self.inner.rng.lock().await;
            generate_run_name(&mut *rng)
        };
        FlowRun::with_name(flow_name, name, parameters, State::pending())
    }

    /// Create a flow run for a registered flow and drive it to completion
    #[instrument(skip(self, parameters))]
    pub async fn invoke(&self, flow_name: &str, parameters: Parameters) -> Result<FlowOutcome> {
        let spec = self
            .inner
            .registry
            .get(flow_name)
            .ok_or_else(|| OrchestrationError::FlowNotFound(flow_name.to_string()))?;
        let run = self.new_flow_run(flow_name, parameters).await;
        self.tracker().register(run.clone().into()).await?;
        self.execute(run, spec, CancellationToken::new()).await
    }

    /// Drive an existing flow run, typically one created from a deployment.
    ///
    /// The tracked copy of the run is authoritative; an unknown run is
    /// registered first. A run that is already terminal is not started.
    #[instrument(skip(self, flow_run), fields(flow_run_id = %flow_run.id, flow = %flow_run.flow_name))]
    pub async fn run_flow(&self, flow_run: FlowRun) -> Result<FlowOutcome> {
        let entrypoint = flow_run
            .entrypoint
            .as_deref()
            .and_then(|entrypoint| entrypoint.parse().ok());
        let spec = self
            .inner
            .registry
            .resolve(entrypoint.as_ref(), &flow_run.flow_name)
            .ok_or_else(|| OrchestrationError::FlowNotFound(flow_run.flow_name.clone()))?;

        let flow_run_id = flow_run.id;
        let flow_name = flow_run.flow_name.clone();

        // Visible to cancel() before the tracked copy is read
        let token = CancellationToken::new();
        self.inner.active.insert(flow_run_id, token.clone());

        let tracked = match self.tracker().get(&RunId::Flow(flow_run_id)).await {
            Ok(snapshot) => snapshot.run.as_flow().cloned(),
            Err(TrackerError::NotFound(_)) => {
                if let Err(e) = self.tracker().register(flow_run.clone().into()).await {
                    self.inner.active.remove(&flow_run_id);
                    return Err(e.into());
                }
                Some(flow_run)
            }
            Err(e) => {
                self.inner.active.remove(&flow_run_id);
                return Err(e.into());
            }
        };
        let Some(run) = tracked else {
            self.inner.active.remove(&flow_run_id);
            return Err(OrchestrationError::FlowNotFound(flow_name));
        };

        if run.is_terminal() {
            info!(state = %run.state_type(), "Flow run already finished, not starting");
            self.inner.active.remove(&run.id);
            return Ok(FlowOutcome::from_state(run.id, run.state().clone()));
        }

        self.execute(run, spec, token).await
    }

    /// Request cancellation of a flow run.
    ///
    /// A run driven here is cancelled cooperatively; a tracked run that is
    /// not being driven is moved to Cancelled directly. Returns false when
    /// the run had already finished.
    pub async fn cancel(&self, flow_run_id: &FlowRunId) -> Result<bool> {
        if let Some(token) = self.inner.active.get(flow_run_id) {
            info!(flow_run_id = %flow_run_id, "Cancelling flow run");
            token.cancel();
            return Ok(true);
        }

        let snapshot = self.tracker().get(&RunId::Flow(*flow_run_id)).await?;
        let Some(mut run) = snapshot.run.as_flow().cloned() else {
            return Ok(false);
        };
        let cancelled = self
            .inner
            .recorder
            .transition_if_active(&mut run, State::cancelled("cancelled before start"))
            .await?;
        if cancelled.is_some() {
            self.archive_task_runs(flow_run_id).await;
        }
        Ok(cancelled.is_some())
    }

    async fn archive_task_runs(&self, flow_run_id: &FlowRunId) {
        if !self.inner.config.archive_task_runs {
            return;
        }
        match self.tracker().archive_task_runs(flow_run_id).await {
            Ok(count) => debug!(archived = count, "Task runs archived"),
            Err(e) => warn!(error = %e, "Failed to archive task runs"),
        }
    }

    /// Drive `run` under `token` until it is terminal
    pub(crate) fn execute(
        &self,
        run: FlowRun,
        spec: FlowSpec,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<FlowOutcome>> {
        let this = self.clone();
        let flow_run_id = run.id;
        let span = info_span!("flow_run", flow_run_id = %flow_run_id, flow = %spec.name);

        async move {
            this.inner.active.insert(flow_run_id, token.clone());
            let result = this.drive(run, spec, token).await;
            this.inner.active.remove(&flow_run_id);
            this.archive_task_runs(&flow_run_id).await;
            if let Err(e) = &result {
                error!(error = %e, "Flow run orchestration failed");
            }
            result
        }
        .instrument(span)
        .boxed()
    }

    async fn drive(
        &self,
        run: FlowRun,
        spec: FlowSpec,
        token: CancellationToken,
    ) -> Result<FlowOutcome> {
        let flow_run_id = run.id;
        let parameters = run.parameters.clone();
        let cell: RunCell<FlowRun> = Arc::new(Mutex::new(run));
        let scope = Arc::new(FlowScope::new(
            flow_run_id,
            spec.name.clone(),
            self.clone(),
            token.clone(),
        ));

        {
            let mut run = cell.lock().await;
            if token.is_cancelled() {
                drop(run);
                return self.finish_cancelled(&cell, &scope).await;
            }
            if run.state_type() == StateType::Scheduled {
                self.inner
                    .recorder
                    .transition(&mut *run, State::pending())
                    .await?;
            }
            self.inner
                .recorder
                .transition(&mut *run, State::running())
                .await?;
        }
        info!("Flow run started");

        let heartbeat = token.child_token();
        let _heartbeat_guard = heartbeat.clone().drop_guard();
        self.spawn_heartbeat(flow_run_id, token.clone(), heartbeat);

        let ctx = FlowContext::new(scope.clone());
        let body = AssertUnwindSafe(spec.callable.invoke(ctx, parameters)).catch_unwind();
        let body = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            outcome = body => Some(outcome),
        };
        let body = match body {
            None => return self.finish_cancelled(&cell, &scope).await,
            Some(Ok(result)) => result,
            Some(Err(panic)) => Err(Failure::panic(panic_message(panic.as_ref()))),
        };

        scope.tasks.close();
        tokio::select! {
            biased;
            _ = token.cancelled() => return self.finish_cancelled(&cell, &scope).await,
            _ = scope.tasks.wait() => {}
        }

        let (target, value, failure) = match body {
            Ok(_)
                if spec.failure_propagation == FailurePropagation::AnyTaskFailure
                    && scope.any_task_failed() =>
            {
                let failure = Failure::new("TaskFailure", "a task run of this flow run failed");
                (State::failed(failure.to_string()), None, Some(failure))
            }
            Ok(value) => {
                let result = ResultRef::for_run(&RunId::Flow(flow_run_id));
                self.inner.results.put(result.clone(), value.clone()).await?;
                (State::completed().with_result(result), Some(value), None)
            }
            Err(failure) => (State::failed(failure.to_string()), None, Some(failure)),
        };

        // Strictly after every task run transition of this flow run
        let mut at = Utc::now();
        if let Some(latest) = scope.latest_task_timestamp().await {
            at = at.max(latest + ChronoDuration::microseconds(1));
        }

        let mut run = cell.lock().await;
        let recorded = self
            .inner
            .recorder
            .transition_if_active(&mut *run, target.with_timestamp(at))
            .await?;
        match recorded {
            Some(transition) => {
                info!(state = %transition.to.state_type, "Flow run finished");
                Ok(FlowOutcome {
                    flow_run_id,
                    state: transition.to,
                    value,
                    failure,
                })
            }
            None => Ok(FlowOutcome::from_state(flow_run_id, run.state().clone())),
        }
    }

    /// Cancel every open task run, wait for their drivers, then the flow run
    async fn finish_cancelled(
        &self,
        cell: &RunCell<FlowRun>,
        scope: &FlowScope,
    ) -> Result<FlowOutcome> {
        scope.cancel_task_runs().await;
        scope.tasks.close();
        scope.tasks.wait().await;

        let mut at = Utc::now();
        if let Some(latest) = scope.latest_task_timestamp().await {
            at = at.max(latest + ChronoDuration::microseconds(1));
        }

        let mut run = cell.lock().await;
        self.inner
            .recorder
            .transition_if_active(
                &mut *run,
                State::cancelled("flow run cancelled").with_timestamp(at),
            )
            .await?;
        info!(state = %run.state_type(), "Flow run cancelled");
        let failure = match run.state_type() {
            StateType::Cancelled => Failure::cancelled("flow run cancelled"),
            other => Failure::new(
                Failure::ORCHESTRATION,
                format!("flow run ended {} outside this orchestrator", other),
            ),
        };
        Ok(FlowOutcome {
            flow_run_id: run.id,
            state: run.state().clone(),
            value: None,
            failure: Some(failure),
        })
    }

    /// Beat until `stop` fires; cancels `flow` once the stored run is terminal
    fn spawn_heartbeat(
        &self,
        flow_run_id: FlowRunId,
        flow: CancellationToken,
        stop: CancellationToken,
    ) {
        let tracker = self.tracker().clone();
        let every = self.inner.config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = tracker.heartbeat(&flow_run_id, Utc::now()).await {
                            warn!(flow_run_id = %flow_run_id, error = %e, "Heartbeat failed");
                        }
                        match tracker.get(&RunId::Flow(flow_run_id)).await {
                            Ok(snapshot) if snapshot.state().is_terminal() => {
                                warn!(
                                    flow_run_id = %flow_run_id,
                                    state = %snapshot.state_type(),
                                    "Flow run finished elsewhere, stopping"
                                );
                                flow.cancel();
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(flow_run_id = %flow_run_id, error = %e, "Heartbeat state check failed");
                            }
                        }
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.inner.config)
            .field("active", &self.inner.active.len())
            .finish()
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}
