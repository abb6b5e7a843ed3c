//! Worker assembly and lifecycle
//!
//! A [`Worker`] owns one of everything: run tracker, orchestrator,
//! deployment registry, work pools, dispatcher and crash monitor, wired
//! from a [`DaemonConfig`].

use crate::config::DaemonConfig;
use anyhow::Context;
use conflux_deployment::{
    DeploymentRegistry, DeploymentResolver, InMemoryDeploymentRegistry, LocalSourceFetcher,
};
use conflux_dispatch::{CrashMonitor, Dispatcher, InProcessBackend, WorkPools};
use conflux_engine::{FlowRegistry, Orchestrator, RunRecorder};
use conflux_tracker::{InMemoryResultStore, InMemoryRunTracker, RunTracker};
use conflux_types::{BackendKind, RunEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const DRAIN_POLL: Duration = Duration::from_millis(50);

/// A fully wired Conflux worker
pub struct Worker {
    config: DaemonConfig,
    tracker: Arc<InMemoryRunTracker>,
    orchestrator: Orchestrator,
    deployments: Arc<InMemoryDeploymentRegistry>,
    pools: Arc<WorkPools>,
    dispatcher: Arc<Dispatcher>,
    monitor: CrashMonitor,
}

impl Worker {
    /// Build the worker and register configured pools and deployments
    pub async fn build(config: DaemonConfig, flows: FlowRegistry) -> anyhow::Result<Self> {
        config.validate()?;

        let tracker = Arc::new(InMemoryRunTracker::new());
        let flows = Arc::new(flows);
        let orchestrator = Orchestrator::new(
            tracker.clone(),
            Arc::new(InMemoryResultStore::new()),
            flows.clone(),
            config.worker.orchestrator(),
        );

        let pools = Arc::new(WorkPools::new());
        for pool in &config.work_pools {
            if pool.backend != BackendKind::InProcess {
                warn!(
                    pool = %pool.name,
                    backend = %pool.backend,
                    "No backend of this kind in confluxd, runs on this pool will crash"
                );
            }
            pools.register(pool.clone());
        }

        let deployments = Arc::new(InMemoryDeploymentRegistry::new());
        let resolver = DeploymentResolver::new(deployments.clone(), Arc::new(LocalSourceFetcher::new()));
        let mut dispatcher_config = config.dispatcher.dispatcher();
        dispatcher_config.archive_task_runs = config.worker.archive_task_runs;
        let dispatcher = Dispatcher::new(
            resolver,
            RunRecorder::new(tracker.clone()),
            pools.clone(),
            dispatcher_config,
        )
        .with_backend(Arc::new(InProcessBackend::new(orchestrator.clone())));
        let mut monitor_config = config.monitor.monitor();
        monitor_config.archive_task_runs = config.worker.archive_task_runs;
        let monitor = CrashMonitor::new(RunRecorder::new(tracker.clone()), monitor_config);

        for declared in &config.deployments {
            let deployment = declared.to_deployment()?;
            let entrypoint = deployment.parsed_entrypoint().ok();
            if flows
                .resolve(entrypoint.as_ref(), &deployment.flow_name)
                .is_none()
            {
                warn!(
                    deployment = %deployment.name,
                    flow = %deployment.flow_name,
                    "Deployment references a flow this worker does not provide"
                );
            }
            let id = deployments
                .register(deployment)
                .await
                .with_context(|| format!("registering deployment '{}'", declared.name))?;
            info!(deployment = %declared.name, deployment_id = %id, "Deployment registered");
        }

        Ok(Self {
            config,
            tracker,
            orchestrator,
            deployments,
            pools,
            dispatcher: Arc::new(dispatcher),
            monitor,
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<InMemoryRunTracker> {
        &self.tracker
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn deployments(&self) -> &Arc<InMemoryDeploymentRegistry> {
        &self.deployments
    }

    pub fn pools(&self) -> &Arc<WorkPools> {
        &self.pools
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Run the dispatcher and crash monitor until `shutdown` fires, then
    /// drain executing flow runs
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            worker = %self.config.worker.name,
            pools = self.config.work_pools.len(),
            deployments = self.config.deployments.len(),
            "Worker starting"
        );

        let loops = CancellationToken::new();
        let tasks = TaskTracker::new();
        {
            let dispatcher = self.dispatcher.clone();
            let stop = loops.clone();
            tasks.spawn(async move { dispatcher.run(stop).await });
        }
        if self.config.monitor.enabled {
            tasks.spawn(self.monitor.clone().run(loops.clone()));
        }
        tasks.spawn(log_events(self.tracker.subscribe(), loops.clone()));
        tasks.close();

        shutdown.cancelled().await;
        info!("Worker stopping");

        if self.config.worker.cancel_on_shutdown {
            for flow_run_id in self.orchestrator.active_flow_runs() {
                if let Err(e) = self.orchestrator.cancel(&flow_run_id).await {
                    error!(flow_run_id = %flow_run_id, error = %e, "Failed to cancel flow run");
                }
            }
        }

        // Dispatcher keeps running so exit events are still applied
        let grace = Duration::from_secs(self.config.worker.shutdown_grace_secs);
        let drained = tokio::time::timeout(grace, async {
            while !self.orchestrator.active_flow_runs().is_empty() {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = self.orchestrator.active_flow_runs().len(),
                "Flow runs still active after shutdown grace period"
            );
        }

        loops.cancel();
        if tokio::time::timeout(grace, tasks.wait()).await.is_err() {
            warn!("Background loops did not stop in time");
        }
        info!("Worker stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

async fn log_events(mut events: broadcast::Receiver<RunEvent>, stop: CancellationToken) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => debug!(
                    event = %event.event_name(),
                    run_id = %event.run_id,
                    flow_run_id = %event.flow_run_id,
                    "Run event"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Run event log lagging"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
