//! Work pool queues
//!
//! Each pool holds a FIFO of flow runs waiting for submission and the set of
//! runs submitted to its backend but not yet exited. A run is enqueued on
//! exactly one pool.

use crate::error::{DispatchError, Result};
use conflux_types::{Deployment, FlowRun, FlowRunId, WorkPool};
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info};

/// A flow run waiting for a pool slot, with the deployment it came from
#[derive(Debug, Clone)]
pub struct QueuedRun {
    pub flow_run: FlowRun,
    pub deployment: Deployment,
}

#[derive(Debug)]
struct PoolState {
    pool: WorkPool,
    queue: VecDeque<QueuedRun>,
    in_flight: HashSet<FlowRunId>,
}

/// Point-in-time view of a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub pool: WorkPool,
    pub queued: usize,
    pub in_flight: usize,
}

/// All work pools known to a dispatcher
#[derive(Debug, Default)]
pub struct WorkPools {
    pools: DashMap<String, PoolState>,
}

impl WorkPools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pool or replace its configuration, keeping queued runs
    pub fn register(&self, pool: WorkPool) {
        info!(pool = %pool.name, backend = %pool.backend, "Work pool registered");
        self.pools
            .entry(pool.name.clone())
            .and_modify(|state| state.pool = pool.clone())
            .or_insert_with(|| PoolState {
                pool,
                queue: VecDeque::new(),
                in_flight: HashSet::new(),
            });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<WorkPool> {
        self.pools.get(name).map(|state| state.pool.clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn status(&self, name: &str) -> Option<PoolStatus> {
        self.pools.get(name).map(|state| PoolStatus {
            pool: state.pool.clone(),
            queued: state.queue.len(),
            in_flight: state.in_flight.len(),
        })
    }

    pub fn pause(&self, name: &str) -> Result<()> {
        self.update(name, |pool| pool.paused = true)
    }

    pub fn resume(&self, name: &str) -> Result<()> {
        self.update(name, |pool| pool.paused = false)
    }

    pub fn set_concurrency_limit(&self, name: &str, limit: Option<usize>) -> Result<()> {
        self.update(name, |pool| pool.concurrency_limit = limit)
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut WorkPool)) -> Result<()> {
        let mut state = self
            .pools
            .get_mut(name)
            .ok_or_else(|| DispatchError::UnknownWorkPool(name.to_string()))?;
        f(&mut state.pool);
        info!(
            pool = %name,
            paused = state.pool.paused,
            concurrency_limit = ?state.pool.concurrency_limit,
            "Work pool updated"
        );
        Ok(())
    }

    pub fn enqueue(&self, pool_name: &str, run: QueuedRun) -> Result<()> {
        let mut state = self
            .pools
            .get_mut(pool_name)
            .ok_or_else(|| DispatchError::UnknownWorkPool(pool_name.to_string()))?;
        debug!(pool = %pool_name, flow_run_id = %run.flow_run.id, "Flow run queued");
        state.queue.push_back(run);
        Ok(())
    }

    /// Dequeue as many runs as the pool has free slots and mark them in flight
    pub fn take_ready(&self, pool_name: &str) -> Vec<QueuedRun> {
        let Some(mut state) = self.pools.get_mut(pool_name) else {
            return Vec::new();
        };
        let slots = state.pool.available_slots(state.in_flight.len());
        let count = slots.min(state.queue.len());
        let ready: Vec<QueuedRun> = state.queue.drain(..count).collect();
        for run in &ready {
            state.in_flight.insert(run.flow_run.id);
        }
        ready
    }

    /// Free the slot held by a run; false when it held none
    pub fn release(&self, pool_name: &str, flow_run_id: &FlowRunId) -> bool {
        self.pools
            .get_mut(pool_name)
            .map(|mut state| state.in_flight.remove(flow_run_id))
            .unwrap_or(false)
    }
}
