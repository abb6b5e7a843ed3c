//! Crash detection
//!
//! A flow run that is Running but has stopped heartbeating is presumed dead
//! and moved to Crashed, together with its unfinished task runs. Crashed is
//! distinct from Failed: the flow never reported an outcome.

use crate::error::{DispatchError, Result};
use chrono::{DateTime, Utc};
use conflux_engine::{OrchestrationError, RunRecorder};
use conflux_tracker::{RunFilter, RunQuery, RunSnapshot, TrackerError};
use conflux_types::{FlowRunId, RunId, State, StateType};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const NON_TERMINAL: [StateType; 3] = [StateType::Scheduled, StateType::Pending, StateType::Running];

/// Crash monitor configuration
#[derive(Debug, Clone)]
pub struct CrashMonitorConfig {
    pub sweep_interval: Duration,
    /// A Running flow run without a heartbeat for this long is crashed
    pub heartbeat_timeout: Duration,
    /// Archive the task runs of crashed flow runs
    pub archive_task_runs: bool,
}

impl Default for CrashMonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            archive_task_runs: true,
        }
    }
}

/// Periodically marks flow runs with stale heartbeats as Crashed
#[derive(Debug, Clone)]
pub struct CrashMonitor {
    recorder: RunRecorder,
    config: CrashMonitorConfig,
}

impl CrashMonitor {
    pub fn new(recorder: RunRecorder, config: CrashMonitorConfig) -> Self {
        Self { recorder, config }
    }

    pub fn config(&self) -> &CrashMonitorConfig {
        &self.config
    }

    /// One pass over Running flow runs; returns the ids marked Crashed
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<FlowRunId>> {
        let running = RunQuery::new(
            self.recorder.tracker().clone(),
            RunFilter::flow_runs().in_states([StateType::Running]),
        )
        .collect()
        .await?;

        let mut crashed = Vec::new();
        for snapshot in running {
            let last_seen = last_seen(&snapshot);
            // Negative elapsed time means a heartbeat from the future
            match now.signed_duration_since(last_seen).to_std() {
                Ok(elapsed) if elapsed > self.config.heartbeat_timeout => {}
                _ => continue,
            }
            let Some(flow_run_id) = snapshot.run_id().as_flow() else {
                continue;
            };
            let reason = format!("no heartbeat since {}", last_seen.to_rfc3339());
            let archive = self.config.archive_task_runs;
            if crash_flow_run(&self.recorder, flow_run_id, &reason, archive).await? {
                warn!(flow_run_id = %flow_run_id, last_seen = %last_seen, "Flow run crashed");
                crashed.push(flow_run_id);
            }
        }
        Ok(crashed)
    }

    /// Sweep every `sweep_interval` until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.sweep_interval.as_secs(),
            timeout_secs = self.config.heartbeat_timeout.as_secs(),
            "Crash monitor started"
        );
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Crash monitor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.sweep(Utc::now()).await {
                        Ok(crashed) if !crashed.is_empty() => {
                            info!(count = crashed.len(), "Crash sweep marked flow runs crashed");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Crash sweep failed"),
                    }
                }
            }
        }
    }
}

/// Latest sign of life: the heartbeat, or the Running transition itself
fn last_seen(snapshot: &RunSnapshot) -> DateTime<Utc> {
    let running_since = snapshot.state().timestamp;
    snapshot
        .last_heartbeat
        .map_or(running_since, |beat| beat.max(running_since))
}

/// Move a flow run and its unfinished task runs to Crashed.
///
/// Task runs that never started are Cancelled instead. With `archive` the
/// task runs are archived once the flow run is Crashed. Returns false when
/// the flow run was already terminal or another writer got there first.
pub(crate) async fn crash_flow_run(
    recorder: &RunRecorder,
    flow_run_id: FlowRunId,
    reason: &str,
    archive: bool,
) -> Result<bool> {
    let tracker = recorder.tracker().clone();
    let tasks = RunQuery::new(
        tracker.clone(),
        RunFilter::task_runs_of(flow_run_id).in_states(NON_TERMINAL),
    )
    .collect()
    .await?;

    for snapshot in tasks {
        let Some(mut task_run) = snapshot.run.as_task().cloned() else {
            continue;
        };
        let target = match task_run.state_type() {
            StateType::Scheduled => State::cancelled(format!("flow run crashed: {}", reason)),
            _ => State::crashed(format!("flow run crashed: {}", reason)),
        };
        lost_race_is_ok(recorder.transition_if_active(&mut task_run, target).await)?;
    }

    let snapshot = match tracker.get(&RunId::Flow(flow_run_id)).await {
        Ok(snapshot) => snapshot,
        Err(TrackerError::NotFound(_)) => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let Some(mut flow_run) = snapshot.run.as_flow().cloned() else {
        return Ok(false);
    };
    if flow_run.state_type() == StateType::Scheduled {
        debug!(flow_run_id = %flow_run_id, "Scheduled flow run cannot crash, skipping");
        return Ok(false);
    }
    let crashed = lost_race_is_ok(
        recorder
            .transition_if_active(&mut flow_run, State::crashed(reason))
            .await,
    )?
    .flatten()
    .is_some();

    if crashed && archive {
        let count = tracker.archive_task_runs(&flow_run_id).await?;
        debug!(flow_run_id = %flow_run_id, archived = count, "Task runs archived");
    }
    Ok(crashed)
}

/// Treat a transition rejected because the run moved on as a no-op
fn lost_race_is_ok<T>(
    result: std::result::Result<T, OrchestrationError>,
) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(OrchestrationError::Tracker(
            e @ (TrackerError::StaleTransition { .. } | TrackerError::OutOfOrder { .. }),
        )) => {
            debug!(error = %e, "Run changed concurrently, leaving it alone");
            Ok(None)
        }
        Err(e) => Err(DispatchError::from(e)),
    }
}
