//! Work pool types

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of execution backend a work pool submits runs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Runs execute inside the worker process
    InProcess,
    /// Runs execute as local subprocesses
    Process,
    /// Runs execute in containers
    Container,
    /// Runs execute as Kubernetes jobs
    Kubernetes,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::InProcess => "in_process",
            BackendKind::Process => "process",
            BackendKind::Container => "container",
            BackendKind::Kubernetes => "kubernetes",
        };
        f.write_str(name)
    }
}

/// A named grouping of execution infrastructure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkPool {
    pub name: String,
    pub backend: BackendKind,
    /// Maximum runs submitted and not yet exited; unlimited when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_limit: Option<usize>,
    #[serde(default)]
    pub paused: bool,
}

impl WorkPool {
    pub fn new(name: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            name: name.into(),
            backend,
            concurrency_limit: None,
            paused: false,
        }
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    /// Free submission slots given `in_flight` runs
    pub fn available_slots(&self, in_flight: usize) -> usize {
        if self.paused {
            return 0;
        }
        match self.concurrency_limit {
            Some(limit) => limit.saturating_sub(in_flight),
            None => usize::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_slots() {
        let pool = WorkPool::new("default", BackendKind::InProcess).with_concurrency_limit(2);
        assert_eq!(pool.available_slots(0), 2);
        assert_eq!(pool.available_slots(3), 0);

        let unlimited = WorkPool::new("wide", BackendKind::Process);
        assert_eq!(unlimited.available_slots(100), usize::MAX);
    }

    #[test]
    fn test_paused_pool_has_no_slots() {
        let mut pool = WorkPool::new("default", BackendKind::InProcess);
        pool.paused = true;
        assert_eq!(pool.available_slots(0), 0);
    }
}
