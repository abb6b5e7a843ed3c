//! Schedule-driven dispatch
//!
//! The dispatcher keeps a time-ordered queue of the next fire time of every
//! scheduled, unpaused deployment. Each tick it creates a Scheduled flow run
//! per due deployment, queues it on the deployment's work pool, then drains
//! the pools into their execution backends.
//!
//! Dispatch is at-least-once: the flow run is stored before the schedule is
//! advanced, so a crash in between creates the same fire time twice on
//! restart. Duplicate Scheduled runs are possible and are not an error.

use crate::backend::{BackendEvent, ExecutionBackend};
use crate::error::{DispatchError, Result};
use crate::monitor::crash_flow_run;
use crate::pools::{QueuedRun, WorkPools};
use chrono::{DateTime, Utc};
use conflux_deployment::{schedule, DeploymentResolver, ResolvedDeployment};
use conflux_engine::RunRecorder;
use conflux_types::{
    BackendKind, Deployment, DeploymentId, FlowRun, FlowRunId, Parameters, RunId, Schedule,
    State, StateType, TrackedRun,
};
use dashmap::DashMap;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often schedules are checked and pools drained
    pub tick_interval: Duration,
    /// Capacity of the backend event channel
    pub event_buffer: usize,
    /// Archive the task runs of flow runs crashed by backend events
    pub archive_task_runs: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            event_buffer: 1024,
            archive_task_runs: true,
        }
    }
}

/// What one dispatcher tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Flow runs created from due schedules
    pub created: Vec<FlowRunId>,
    /// Due deployments that could not be resolved or enqueued
    pub failed: usize,
    /// Flow runs handed to a backend
    pub submitted: usize,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.failed == 0 && self.submitted == 0
    }
}

#[derive(Debug)]
struct ScheduleEntry {
    version: u32,
    schedule: Schedule,
    next_fire: DateTime<Utc>,
    /// Matches exactly one live heap item
    generation: u64,
}

/// Next fire times ordered by time.
///
/// Every insert pushes a heap item tagged with a fresh generation; items
/// whose generation no longer matches their entry are skipped on pop.
#[derive(Debug, Default)]
struct ScheduleQueue {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, DeploymentId, u64)>>,
    entries: HashMap<DeploymentId, ScheduleEntry>,
    generation: u64,
}

impl ScheduleQueue {
    /// Track the schedules of active deployments, dropping the rest
    fn sync(&mut self, deployments: &[Deployment], now: DateTime<Utc>) {
        let active: HashSet<DeploymentId> = deployments
            .iter()
            .filter(|d| d.is_schedule_active())
            .map(|d| d.id)
            .collect();
        self.entries.retain(|id, _| active.contains(id));

        for deployment in deployments.iter().filter(|d| d.is_schedule_active()) {
            let Some(schedule) = &deployment.schedule else {
                continue;
            };
            if let Some(entry) = self.entries.get_mut(&deployment.id) {
                if &entry.schedule == schedule {
                    // Re-registered with the same schedule: keep the pending fire
                    entry.version = deployment.version;
                    continue;
                }
            }
            match schedule::next_after(schedule, now) {
                Ok(Some(next_fire)) => {
                    debug!(deployment = %deployment.name, next_fire = %next_fire, "Schedule tracked");
                    self.insert(deployment.id, deployment.version, schedule.clone(), next_fire);
                }
                Ok(None) => {
                    self.entries.remove(&deployment.id);
                }
                Err(e) => {
                    warn!(deployment = %deployment.name, error = %e, "Schedule ignored");
                    self.entries.remove(&deployment.id);
                }
            }
        }
    }

    fn insert(
        &mut self,
        id: DeploymentId,
        version: u32,
        schedule: Schedule,
        next_fire: DateTime<Utc>,
    ) {
        self.generation += 1;
        let generation = self.generation;
        self.entries.insert(
            id,
            ScheduleEntry {
                version,
                schedule,
                next_fire,
                generation,
            },
        );
        self.heap.push(Reverse((next_fire, id, generation)));
    }

    /// Remove and return every fire time at or before `now`
    fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<(DeploymentId, DateTime<Utc>)> {
        let mut due = Vec::new();
        while let Some(Reverse((fire_time, id, generation))) = self.heap.peek().copied() {
            if fire_time > now {
                break;
            }
            self.heap.pop();
            let current = self
                .entries
                .get(&id)
                .is_some_and(|entry| entry.generation == generation);
            if current {
                due.push((id, fire_time));
            }
        }
        due
    }

    /// Schedule the fire after `fired`. Fire times missed while the
    /// dispatcher was not ticking are skipped, not backfilled.
    fn advance(&mut self, id: DeploymentId, fired: DateTime<Utc>, now: DateTime<Utc>) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        let next = match schedule::next_after(&entry.schedule, fired) {
            Ok(Some(next)) if next <= now => schedule::next_after(&entry.schedule, now),
            other => other,
        };
        match next {
            Ok(Some(next_fire)) => {
                let (version, schedule) = (entry.version, entry.schedule.clone());
                self.insert(id, version, schedule, next_fire);
            }
            Ok(None) => {
                self.entries.remove(&id);
            }
            Err(e) => {
                warn!(deployment_id = %id, error = %e, "Schedule could not be advanced");
                self.entries.remove(&id);
            }
        }
    }

    fn next_fire(&self, id: &DeploymentId) -> Option<DateTime<Utc>> {
        self.entries.get(id).map(|entry| entry.next_fire)
    }
}

/// Turns deployment schedules and manual requests into submitted flow runs
pub struct Dispatcher {
    resolver: DeploymentResolver,
    recorder: RunRecorder,
    pools: Arc<WorkPools>,
    backends: HashMap<BackendKind, Arc<dyn ExecutionBackend>>,
    config: DispatcherConfig,
    schedules: Mutex<ScheduleQueue>,
    /// Pool holding the slot of each submitted run
    submitted: DashMap<FlowRunId, String>,
    events_tx: mpsc::Sender<BackendEvent>,
    events_rx: Mutex<mpsc::Receiver<BackendEvent>>,
}

impl Dispatcher {
    pub fn new(
        resolver: DeploymentResolver,
        recorder: RunRecorder,
        pools: Arc<WorkPools>,
        config: DispatcherConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        Self {
            resolver,
            recorder,
            pools,
            backends: HashMap::new(),
            config,
            schedules: Mutex::new(ScheduleQueue::default()),
            submitted: DashMap::new(),
            events_tx,
            events_rx: Mutex::new(events_rx),
        }
    }

    /// Route pools of the backend's kind to it
    pub fn with_backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    pub fn pools(&self) -> &Arc<WorkPools> {
        &self.pools
    }

    pub fn resolver(&self) -> &DeploymentResolver {
        &self.resolver
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Next tracked fire time of a deployment
    pub async fn next_fire(&self, id: &DeploymentId) -> Option<DateTime<Utc>> {
        self.schedules.lock().await.next_fire(id)
    }

    /// Create runs for due schedules, then drain the pools
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let deployments = self.resolver.registry().list().await?;
        let due = {
            let mut schedules = self.schedules.lock().await;
            schedules.sync(&deployments, now);
            schedules.pop_due(now)
        };

        let mut report = TickReport::default();
        for (deployment_id, fire_time) in due {
            match self.resolver.resolve(&deployment_id).await {
                Ok(resolved) => match self.enqueue(resolved, Parameters::new(), fire_time).await {
                    Ok(run) => report.created.push(run.id),
                    Err(e) => {
                        error!(deployment_id = %deployment_id, error = %e, "Scheduled run not created");
                        report.failed += 1;
                    }
                },
                Err(e) => {
                    error!(deployment_id = %deployment_id, error = %e, "Deployment resolution failed");
                    report.failed += 1;
                }
            }
            self.schedules
                .lock()
                .await
                .advance(deployment_id, fire_time, now);
        }

        report.submitted = self.dispatch().await?;
        Ok(report)
    }

    /// Create a run of a deployment now, regardless of its schedule or pause
    #[instrument(skip(self, parameters))]
    pub async fn run_deployment(
        &self,
        deployment_id: &DeploymentId,
        parameters: Parameters,
    ) -> Result<FlowRun> {
        let resolved = self.resolver.resolve(deployment_id).await?;
        self.enqueue(resolved, parameters, Utc::now()).await
    }

    #[instrument(skip(self, parameters))]
    pub async fn run_deployment_by_name(
        &self,
        name: &str,
        parameters: Parameters,
    ) -> Result<FlowRun> {
        let resolved = self.resolver.resolve_by_name(name).await?;
        self.enqueue(resolved, parameters, Utc::now()).await
    }

    async fn enqueue(
        &self,
        resolved: ResolvedDeployment,
        overrides: Parameters,
        scheduled_for: DateTime<Utc>,
    ) -> Result<FlowRun> {
        let deployment = resolved.deployment;
        if !self.pools.contains(&deployment.work_pool) {
            return Err(DispatchError::UnknownWorkPool(deployment.work_pool));
        }

        let run = FlowRun::from_deployment(&deployment, overrides, scheduled_for);
        self.recorder.tracker().register(run.clone().into()).await?;
        self.pools.enqueue(
            &deployment.work_pool,
            QueuedRun {
                flow_run: run.clone(),
                deployment: deployment.clone(),
            },
        )?;
        info!(
            flow_run_id = %run.id,
            run_name = %run.name,
            deployment = %deployment.name,
            pool = %deployment.work_pool,
            scheduled_for = %scheduled_for,
            "Flow run created"
        );
        Ok(run)
    }

    /// Submit queued runs up to each pool's free slots; returns how many
    /// were handed to a backend
    pub async fn dispatch(&self) -> Result<usize> {
        let mut submitted = 0;
        for pool_name in self.pools.names() {
            for queued in self.pools.take_ready(&pool_name) {
                let flow_run_id = queued.flow_run.id;
                match self.submit(&pool_name, queued).await {
                    Ok(true) => submitted += 1,
                    Ok(false) => self.release(&pool_name, &flow_run_id),
                    Err(e) => {
                        self.release(&pool_name, &flow_run_id);
                        error!(flow_run_id = %flow_run_id, pool = %pool_name, error = %e, "Submission failed");
                    }
                }
            }
        }
        Ok(submitted)
    }

    async fn submit(&self, pool_name: &str, queued: QueuedRun) -> Result<bool> {
        let flow_run_id = queued.flow_run.id;
        let snapshot = self
            .recorder
            .tracker()
            .get(&RunId::Flow(flow_run_id))
            .await?;
        let Some(mut run) = snapshot.run.as_flow().cloned() else {
            return Ok(false);
        };
        if run.is_terminal() {
            debug!(flow_run_id = %flow_run_id, state = %run.state_type(), "Run finished while queued");
            return Ok(false);
        }
        if run.state_type() == StateType::Scheduled {
            self.recorder.transition(&mut run, State::pending()).await?;
        }

        let resolved = match self.resolver.prepare(queued.deployment).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(flow_run_id = %flow_run_id, error = %e, "Source unavailable at submission");
                self.recorder
                    .transition_if_active(&mut run, State::crashed(format!("Source fetch failed: {}", e)))
                    .await?;
                return Ok(false);
            }
        };

        let backend = self
            .pools
            .get(pool_name)
            .map(|pool| self.backends.get(&pool.backend).cloned().ok_or(pool.backend));
        let backend = match backend {
            Some(Ok(backend)) => backend,
            Some(Err(kind)) => {
                self.recorder
                    .transition_if_active(&mut run, State::crashed(format!("No {} backend", kind)))
                    .await?;
                return Err(DispatchError::NoBackend(kind));
            }
            None => return Err(DispatchError::UnknownWorkPool(pool_name.to_string())),
        };

        self.submitted.insert(flow_run_id, pool_name.to_string());
        if let Err(e) = backend
            .submit(run.clone(), resolved, self.events_tx.clone())
            .await
        {
            self.recorder
                .transition_if_active(&mut run, State::crashed(format!("Submission failed: {}", e)))
                .await?;
            return Err(e);
        }
        info!(flow_run_id = %flow_run_id, pool = %pool_name, backend = %backend.kind(), "Flow run submitted");
        Ok(true)
    }

    fn release(&self, pool_name: &str, flow_run_id: &FlowRunId) {
        self.submitted.remove(flow_run_id);
        self.pools.release(pool_name, flow_run_id);
    }

    /// Apply a backend lifecycle event: free the slot on exit or loss and
    /// crash runs that did not finish cleanly
    pub async fn handle_event(&self, event: BackendEvent) -> Result<()> {
        let flow_run_id = event.flow_run_id();
        if event.is_final() {
            if let Some((_, pool_name)) = self.submitted.remove(&flow_run_id) {
                self.pools.release(&pool_name, &flow_run_id);
            }
        }

        let reason = match &event {
            BackendEvent::Started { .. } => {
                debug!(flow_run_id = %flow_run_id, "Backend started flow run");
                return Ok(());
            }
            BackendEvent::Exited { code: 0, .. } => {
                debug!(flow_run_id = %flow_run_id, "Backend run exited cleanly");
                return Ok(());
            }
            BackendEvent::Exited { code, .. } => format!("Backend exited with code {}", code),
            BackendEvent::Lost { reason, .. } => format!("Backend lost the run: {}", reason),
        };
        let archive = self.config.archive_task_runs;
        if crash_flow_run(&self.recorder, flow_run_id, &reason, archive).await? {
            warn!(flow_run_id = %flow_run_id, reason = %reason, "Flow run crashed");
        }
        Ok(())
    }

    /// Wait for the next backend event and apply it
    pub async fn process_next_event(&self) -> Result<Option<BackendEvent>> {
        let event = self.events_rx.lock().await.recv().await;
        if let Some(event) = &event {
            self.handle_event(event.clone()).await?;
        }
        Ok(event)
    }

    /// Tick and process backend events until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_ms = self.config.tick_interval.as_millis() as u64,
            backends = self.backends.len(),
            "Dispatcher started"
        );
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut events = self.events_rx.lock().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Dispatcher shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if !report.is_empty() => debug!(
                            created = report.created.len(),
                            failed = report.failed,
                            submitted = report.submitted,
                            "Dispatcher tick"
                        ),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Dispatcher tick failed"),
                    }
                }
                Some(event) = events.recv() => {
                    if let Err(e) = self.handle_event(event).await {
                        error!(error = %e, "Backend event handling failed");
                    }
                    // A slot may have opened up
                    if let Err(e) = self.dispatch().await {
                        error!(error = %e, "Dispatch pass failed");
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pools", &self.pools)
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
