//! Configuration for confluxd

use anyhow::{bail, Context};
use conflux_dispatch::{CrashMonitorConfig, DispatcherConfig};
use conflux_engine::OrchestratorConfig;
use conflux_types::{BackendKind, Deployment, Parameters, Schedule, SourceLocation, WorkPool};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Worker (orchestrator) configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Dispatcher configuration
    #[serde(default)]
    pub dispatcher: DispatcherSettings,

    /// Crash monitor configuration
    #[serde(default)]
    pub monitor: MonitorSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Work pools served by this worker
    #[serde(default = "default_work_pools")]
    pub work_pools: Vec<WorkPool>,

    /// Deployments registered at startup
    #[serde(default)]
    pub deployments: Vec<DeploymentConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            dispatcher: DispatcherSettings::default(),
            monitor: MonitorSettings::default(),
            logging: LoggingConfig::default(),
            work_pools: default_work_pools(),
            deployments: Vec::new(),
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker name, used in logs
    #[serde(default = "default_worker_name")]
    pub name: String,

    /// Heartbeat interval for running flow runs in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Archive task runs once their flow run finishes
    #[serde(default = "default_true")]
    pub archive_task_runs: bool,

    /// Fixed seed for retry jitter and run names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rng_seed: Option<u64>,

    /// Cancel flow runs still executing when the worker stops
    #[serde(default = "default_true")]
    pub cancel_on_shutdown: bool,

    /// How long to wait for flow runs and loops to stop, in seconds
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: default_worker_name(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            archive_task_runs: true,
            rng_seed: None,
            cancel_on_shutdown: true,
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl WorkerConfig {
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            archive_task_runs: self.archive_task_runs,
            rng_seed: self.rng_seed,
        }
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSettings {
    /// Schedule check interval in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Backend event channel capacity
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl DispatcherSettings {
    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms.max(1)),
            event_buffer: self.event_buffer,
            ..DispatcherConfig::default()
        }
    }
}

/// Crash monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Heartbeat age after which a running flow run is crashed, in seconds
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_secs: default_sweep_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
        }
    }
}

impl MonitorSettings {
    pub fn monitor(&self) -> CrashMonitorConfig {
        CrashMonitorConfig {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            ..CrashMonitorConfig::default()
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// A deployment declared in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub name: String,
    pub flow: String,
    /// Local directory holding the flow source
    pub source: PathBuf,
    /// `path:function` within `source`
    pub entrypoint: String,
    #[serde(default = "default_pool_name")]
    pub work_pool: String,
    #[serde(default)]
    pub parameters: Parameters,
    /// Cron expression (5 or 6 fields)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// IANA timezone for `cron`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Fixed interval in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl DeploymentConfig {
    pub fn to_deployment(&self) -> anyhow::Result<Deployment> {
        let mut deployment = Deployment::new(
            self.name.clone(),
            self.flow.clone(),
            SourceLocation::local(self.source.clone()),
            self.entrypoint.clone(),
            self.work_pool.clone(),
        )
        .with_parameters(self.parameters.clone())
        .with_tags(self.tags.clone());

        deployment.schedule = match (&self.cron, self.interval_secs) {
            (Some(_), Some(_)) => {
                bail!("deployment '{}' sets both cron and interval_secs", self.name)
            }
            (Some(expression), None) => Some(Schedule::Cron {
                expression: expression.clone(),
                timezone: self.timezone.clone(),
            }),
            (None, Some(0)) => bail!("deployment '{}' has a zero interval", self.name),
            (None, Some(secs)) => Some(Schedule::interval(Duration::from_secs(secs))),
            (None, None) => None,
        };
        deployment.paused = self.paused;
        Ok(deployment)
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_worker_name() -> String {
    "confluxd".to_string()
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_tick_interval() -> u64 {
    1000
}

fn default_event_buffer() -> usize {
    1024
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_heartbeat_timeout() -> u64 {
    90
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pool_name() -> String {
    "default".to_string()
}

fn default_work_pools() -> Vec<WorkPool> {
    vec![WorkPool::new(default_pool_name(), BackendKind::InProcess)]
}

impl DaemonConfig {
    /// Load configuration: defaults, then the optional file, then
    /// `CONFLUX_` environment variables (`CONFLUX_LOGGING__LEVEL=debug`)
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(
            config::Config::try_from(&DaemonConfig::default())
                .context("serializing default configuration")?,
        );

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CONFLUX")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: DaemonConfig = builder
            .build()
            .context("building configuration")?
            .try_deserialize()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot start a worker
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.work_pools.is_empty() {
            bail!("at least one work pool must be configured");
        }
        for (i, pool) in self.work_pools.iter().enumerate() {
            if self.work_pools[..i].iter().any(|p| p.name == pool.name) {
                bail!("work pool '{}' is configured twice", pool.name);
            }
        }
        for deployment in &self.deployments {
            if !self.work_pools.iter().any(|p| p.name == deployment.work_pool) {
                bail!(
                    "deployment '{}' targets unknown work pool '{}'",
                    deployment.name,
                    deployment.work_pool
                );
            }
        }
        Ok(())
    }
}
