//! Execution backends
//!
//! A backend accepts a flow run together with its resolved deployment and
//! reports lifecycle events back to the dispatcher on a channel. Exit codes
//! follow process conventions: zero means the run reached Completed.

use crate::error::{DispatchError, Result};
use async_trait::async_trait;
use conflux_deployment::ResolvedDeployment;
use conflux_engine::Orchestrator;
use conflux_types::{BackendKind, FlowRun, FlowRunId};
use tokio::sync::mpsc;
use tracing::{debug, error, info, Instrument};

/// Exit code for a run whose flow finished in a non-Completed state
pub const EXIT_FLOW_FAILED: i32 = 1;
/// Exit code for a run the orchestrator could not drive
pub const EXIT_ORCHESTRATION_ERROR: i32 = 2;

/// Lifecycle notification from an execution backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Started { flow_run_id: FlowRunId },
    Exited { flow_run_id: FlowRunId, code: i32 },
    /// The backend no longer knows what happened to the run
    Lost { flow_run_id: FlowRunId, reason: String },
}

impl BackendEvent {
    pub fn flow_run_id(&self) -> FlowRunId {
        match self {
            BackendEvent::Started { flow_run_id }
            | BackendEvent::Exited { flow_run_id, .. }
            | BackendEvent::Lost { flow_run_id, .. } => *flow_run_id,
        }
    }

    /// Whether the run's pool slot is free after this event
    pub fn is_final(&self) -> bool {
        !matches!(self, BackendEvent::Started { .. })
    }
}

/// Sending half handed to backends with each submission
pub type BackendEvents = mpsc::Sender<BackendEvent>;

/// Infrastructure that executes flow runs
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Start executing `flow_run`. Returning `Ok` means the backend owns the
    /// run and will eventually report `Exited` or `Lost` on `events`.
    async fn submit(
        &self,
        flow_run: FlowRun,
        resolved: ResolvedDeployment,
        events: BackendEvents,
    ) -> Result<()>;
}

/// Runs flows inside the current process through an [`Orchestrator`]
#[derive(Clone)]
pub struct InProcessBackend {
    orchestrator: Orchestrator,
}

impl InProcessBackend {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}

#[async_trait]
impl ExecutionBackend for InProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::InProcess
    }

    async fn submit(
        &self,
        flow_run: FlowRun,
        resolved: ResolvedDeployment,
        events: BackendEvents,
    ) -> Result<()> {
        let flow_run_id = flow_run.id;
        if self
            .orchestrator
            .registry()
            .resolve(Some(&resolved.entrypoint), &flow_run.flow_name)
            .is_none()
        {
            return Err(DispatchError::Backend {
                flow_run_id,
                reason: format!("no flow registered for entrypoint {}", resolved.entrypoint),
            });
        }

        let orchestrator = self.orchestrator.clone();
        let span = tracing::info_span!("in_process", flow_run_id = %flow_run_id);
        tokio::spawn(
            async move {
                if events.send(BackendEvent::Started { flow_run_id }).await.is_err() {
                    debug!("Dispatcher gone, event dropped");
                }

                // Inner task so a panic surfaces as a JoinError instead of
                // losing the exit event
                let handle = tokio::spawn(async move { orchestrator.run_flow(flow_run).await });
                let event = match handle.await {
                    Ok(Ok(outcome)) => {
                        let code = if outcome.is_completed() {
                            0
                        } else {
                            EXIT_FLOW_FAILED
                        };
                        info!(state = %outcome.state_type(), code, "In-process run exited");
                        BackendEvent::Exited { flow_run_id, code }
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, "In-process run could not be driven");
                        BackendEvent::Exited {
                            flow_run_id,
                            code: EXIT_ORCHESTRATION_ERROR,
                        }
                    }
                    Err(e) => BackendEvent::Lost {
                        flow_run_id,
                        reason: format!("execution task aborted: {}", e),
                    },
                };
                if events.send(event).await.is_err() {
                    debug!("Dispatcher gone, event dropped");
                }
            }
            .instrument(span),
        );
        Ok(())
    }
}

impl std::fmt::Debug for InProcessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessBackend").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conflux_engine::{flow_fn, FlowRegistry, FlowSpec, OrchestratorConfig};
    use conflux_tracker::{InMemoryResultStore, InMemoryRunTracker, RunTracker};
    use conflux_types::{
        Deployment, Entrypoint, Failure, Parameters, RunId, SourceLocation, StateType,
    };
    use serde_json::json;
    use std::sync::Arc;

    fn backend(tracker: Arc<InMemoryRunTracker>) -> InProcessBackend {
        let registry = FlowRegistry::new();
        registry.register(FlowSpec::new(
            "ok",
            flow_fn(|_ctx, _params| async move { Ok::<_, Failure>(json!("done")) }),
        ));
        registry.register(FlowSpec::new(
            "broken",
            flow_fn(|_ctx, _params| async move {
                Err::<serde_json::Value, _>(Failure::new("ValueError", "bad input"))
            }),
        ));
        InProcessBackend::new(Orchestrator::new(
            tracker,
            Arc::new(InMemoryResultStore::new()),
            Arc::new(registry),
            OrchestratorConfig::default(),
        ))
    }

    fn resolved(flow_name: &str) -> (FlowRun, ResolvedDeployment) {
        let entrypoint = format!("flows.rs:{}", flow_name);
        let deployment = Deployment::new(
            format!("{}-deployment", flow_name),
            flow_name,
            SourceLocation::local("."),
            entrypoint.clone(),
            "default",
        );
        let run = FlowRun::from_deployment(&deployment, Parameters::new(), Utc::now());
        let resolved = ResolvedDeployment {
            entrypoint: entrypoint.parse::<Entrypoint>().unwrap(),
            local_path: ".".into(),
            deployment,
        };
        (run, resolved)
    }

    async fn exit_code(rx: &mut mpsc::Receiver<BackendEvent>) -> i32 {
        loop {
            match rx.recv().await.unwrap() {
                BackendEvent::Exited { code, .. } => return code,
                BackendEvent::Started { .. } => continue,
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_completed_flow_exits_zero() {
        let tracker = Arc::new(InMemoryRunTracker::new());
        let backend = backend(tracker.clone());
        let (tx, mut rx) = mpsc::channel(8);
        let (run, resolved) = resolved("ok");
        let id = run.id;

        backend.submit(run, resolved, tx).await.unwrap();
        assert_eq!(exit_code(&mut rx).await, 0);
        let snapshot = tracker.get(&RunId::Flow(id)).await.unwrap();
        assert_eq!(snapshot.state_type(), StateType::Completed);
    }

    #[tokio::test]
    async fn test_failed_flow_exits_non_zero() {
        let tracker = Arc::new(InMemoryRunTracker::new());
        let backend = backend(tracker);
        let (tx, mut rx) = mpsc::channel(8);
        let (run, resolved) = resolved("broken");

        backend.submit(run, resolved, tx).await.unwrap();
        assert_eq!(exit_code(&mut rx).await, EXIT_FLOW_FAILED);
    }

    #[tokio::test]
    async fn test_unknown_flow_rejected() {
        let tracker = Arc::new(InMemoryRunTracker::new());
        let backend = backend(tracker);
        let (tx, _rx) = mpsc::channel(8);
        let (run, resolved) = resolved("missing");

        let err = backend.submit(run, resolved, tx).await.unwrap_err();
        assert!(matches!(err, DispatchError::Backend { .. }));
    }
}
