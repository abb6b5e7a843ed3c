//! Deployment types
//!
//! A Deployment binds a flow (source location + entrypoint) to a named,
//! schedulable configuration targeting a work pool.

use crate::errors::ValidationError;
use crate::{DeploymentId, Parameters};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// A named, schedulable flow configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    /// Unique registration name
    pub name: String,
    pub flow_name: String,
    pub source: SourceLocation,
    /// `path:function` identifier of the flow inside the source
    pub entrypoint: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    pub work_pool: String,
    /// Paused deployments are not scheduled; manual runs are still allowed
    #[serde(default)]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Incremented on every re-registration under the same name
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

impl Deployment {
    pub fn new(
        name: impl Into<String>,
        flow_name: impl Into<String>,
        source: SourceLocation,
        entrypoint: impl Into<String>,
        work_pool: impl Into<String>,
    ) -> Self {
        Self {
            id: DeploymentId::generate(),
            name: name.into(),
            flow_name: flow_name.into(),
            source,
            entrypoint: entrypoint.into(),
            parameters: Parameters::new(),
            schedule: None,
            work_pool: work_pool.into(),
            paused: false,
            tags: Vec::new(),
            description: None,
            version: 1,
        }
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn paused(mut self) -> Self {
        self.paused = true;
        self
    }

    /// Whether the dispatcher should compute fire times for this deployment
    pub fn is_schedule_active(&self) -> bool {
        self.schedule.is_some() && !self.paused
    }

    pub fn parsed_entrypoint(&self) -> Result<Entrypoint, ValidationError> {
        self.entrypoint.parse()
    }
}

/// Where a deployment's flow code lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceLocation {
    /// A directory on the worker's filesystem
    Local { path: PathBuf },
    /// A remote repository pulled by a source fetcher
    Remote {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
    },
}

impl SourceLocation {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        SourceLocation::Local { path: path.into() }
    }

    pub fn remote(url: impl Into<String>) -> Self {
        SourceLocation::Remote {
            url: url.into(),
            reference: None,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocation::Local { path } => write!(f, "{}", path.display()),
            SourceLocation::Remote {
                url,
                reference: Some(reference),
            } => write!(f, "{}@{}", url, reference),
            SourceLocation::Remote { url, .. } => f.write_str(url),
        }
    }
}

/// Parsed `path:function` entrypoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entrypoint {
    pub path: PathBuf,
    pub function: String,
}

impl std::str::FromStr for Entrypoint {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, function) = s
            .rsplit_once(':')
            .ok_or_else(|| ValidationError::InvalidEntrypoint(s.to_string()))?;
        if path.trim().is_empty() || function.trim().is_empty() {
            return Err(ValidationError::InvalidEntrypoint(s.to_string()));
        }
        Ok(Self {
            path: PathBuf::from(path.trim()),
            function: function.trim().to_string(),
        })
    }
}

impl fmt::Display for Entrypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path.display(), self.function)
    }
}

/// When a deployment should run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Cron expression with 5 (min..dow) or 6 (sec..dow) fields
    Cron {
        expression: String,
        /// IANA timezone name, UTC when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    /// Fixed interval counted from `anchor`
    Interval {
        every: Duration,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor: Option<DateTime<Utc>>,
    },
}

impl Schedule {
    pub fn cron(expression: impl Into<String>) -> Self {
        Schedule::Cron {
            expression: expression.into(),
            timezone: None,
        }
    }

    pub fn interval(every: Duration) -> Self {
        Schedule::Interval { every, anchor: None }
    }
}
