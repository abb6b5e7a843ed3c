//! In-memory run tracker
//!
//! Suitable for development, tests and single-process workers. Persistent
//! backends implement the same [`RunTracker`] trait.

use crate::error::{Result, TrackerError};
use crate::tracker::{QueryCursor, RecordOutcome, RunFilter, RunPage, RunSnapshot, RunTracker};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conflux_types::{FlowRunId, RunEvent, RunId, RunRecord, StateTransition, TrackedRun};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct RunEntry {
    record: RunRecord,
    last_heartbeat: Option<DateTime<Utc>>,
    archived: bool,
}

impl RunEntry {
    fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run: self.record.clone(),
            last_heartbeat: self.last_heartbeat,
            archived: self.archived,
        }
    }
}

/// In-memory run tracker backed by concurrent maps
pub struct InMemoryRunTracker {
    runs: DashMap<RunId, RunEntry>,
    /// Task run ids indexed by owning flow run
    by_flow_run: DashMap<FlowRunId, Vec<RunId>>,
    event_tx: broadcast::Sender<RunEvent>,
}

impl InMemoryRunTracker {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            runs: DashMap::new(),
            by_flow_run: DashMap::new(),
            event_tx,
        }
    }

    /// Number of tracked runs, flow and task
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    fn publish(&self, flow_run_id: FlowRunId, transition: &StateTransition) {
        // No subscribers is fine
        let _ = self
            .event_tx
            .send(RunEvent::from_transition(flow_run_id, transition));
    }
}

impl Default for InMemoryRunTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunTracker for InMemoryRunTracker {
    async fn register(&self, run: RunRecord) -> Result<()> {
        let run_id = run.run_id();
        let flow_run_id = run.flow_run_id();
        let initial = run.history().to_vec();
        let is_task = matches!(run, RunRecord::Task(_));

        match self.runs.entry(run_id) {
            Entry::Occupied(existing) => {
                if existing.get().record == run {
                    debug!(run_id = %run_id, "Duplicate run registration ignored");
                    return Ok(());
                }
                return Err(TrackerError::AlreadyExists(run_id));
            }
            Entry::Vacant(slot) => {
                slot.insert(RunEntry {
                    record: run,
                    last_heartbeat: None,
                    archived: false,
                });
            }
        }
        if is_task {
            self.by_flow_run.entry(flow_run_id).or_default().push(run_id);
        }

        for transition in &initial {
            self.publish(flow_run_id, transition);
        }
        debug!(run_id = %run_id, "Run registered");
        Ok(())
    }

    async fn record(&self, transition: StateTransition) -> Result<RecordOutcome> {
        let run_id = transition.run_id;
        let flow_run_id = {
            let mut entry = self
                .runs
                .get_mut(&run_id)
                .ok_or(TrackerError::NotFound(run_id))?;

            let identity = transition.identity();
            if entry
                .record
                .history()
                .iter()
                .any(|t| t.identity() == identity)
            {
                debug!(run_id = %run_id, state = %transition.to.state_type, "Duplicate transition ignored");
                return Ok(RecordOutcome::Duplicate);
            }

            let current = entry.record.state().clone();
            if transition.to.timestamp <= current.timestamp {
                warn!(run_id = %run_id, "Rejected out-of-order transition");
                return Err(TrackerError::OutOfOrder {
                    run_id,
                    last: current.timestamp,
                    attempted: transition.to.timestamp,
                });
            }
            if transition.from != Some(current.state_type) {
                warn!(
                    run_id = %run_id,
                    current = %current.state_type,
                    "Rejected stale transition"
                );
                return Err(TrackerError::StaleTransition {
                    run_id,
                    expected: transition.from,
                    actual: current.state_type,
                });
            }

            entry.record.apply_transition(transition.clone());
            entry.record.flow_run_id()
        };

        trace!(
            run_id = %run_id,
            from = ?transition.from,
            to = %transition.to.state_type,
            "Transition recorded"
        );
        self.publish(flow_run_id, &transition);
        Ok(RecordOutcome::Appended)
    }

    async fn get(&self, run_id: &RunId) -> Result<RunSnapshot> {
        self.runs
            .get(run_id)
            .map(|entry| entry.snapshot())
            .ok_or(TrackerError::NotFound(*run_id))
    }

    async fn query_page(
        &self,
        filter: &RunFilter,
        cursor: Option<&QueryCursor>,
        page_size: usize,
    ) -> Result<RunPage> {
        let mut matching: Vec<RunSnapshot> = self
            .runs
            .iter()
            .map(|entry| entry.snapshot())
            .filter(|snapshot| filter.matches(snapshot))
            .filter(|snapshot| cursor.map_or(true, |c| snapshot.cursor() < *c))
            .collect();

        // Newest first; id breaks ties so pages never overlap
        matching.sort_by(|a, b| b.cursor().cmp(&a.cursor()));

        let page_size = page_size.max(1);
        let has_more = matching.len() > page_size;
        matching.truncate(page_size);
        let next_cursor = if has_more {
            matching.last().map(RunSnapshot::cursor)
        } else {
            None
        };

        Ok(RunPage {
            runs: matching,
            next_cursor,
        })
    }

    async fn heartbeat(&self, flow_run_id: &FlowRunId, at: DateTime<Utc>) -> Result<()> {
        let run_id = RunId::Flow(*flow_run_id);
        let mut entry = self
            .runs
            .get_mut(&run_id)
            .ok_or(TrackerError::NotFound(run_id))?;
        if entry.last_heartbeat.map_or(true, |last| at > last) {
            entry.last_heartbeat = Some(at);
        }
        Ok(())
    }

    async fn archive_task_runs(&self, flow_run_id: &FlowRunId) -> Result<usize> {
        let task_ids = self
            .by_flow_run
            .get(flow_run_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();

        let mut archived = 0;
        for task_id in task_ids {
            if let Some(mut entry) = self.runs.get_mut(&task_id) {
                if !entry.archived {
                    entry.archived = true;
                    archived += 1;
                }
            }
        }
        debug!(flow_run_id = %flow_run_id, archived, "Task runs archived");
        Ok(archived)
    }

    fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.event_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RunQuery;
    use chrono::Duration;
    use conflux_types::{
        FlowRun, Parameters, RetryPolicy, RunKind, State, StateType, TaskKey, TaskRun,
    };
    use std::sync::Arc;

    fn flow_run() -> FlowRun {
        FlowRun::new("etl", Parameters::new(), State::pending())
    }

    fn next(run: &impl TrackedRun, state: State) -> StateTransition {
        let timestamp = run.state().timestamp + Duration::milliseconds(1);
        StateTransition {
            run_id: run.run_id(),
            from: Some(run.state().state_type),
            to: state.with_timestamp(timestamp),
        }
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let tracker = InMemoryRunTracker::new();
        let run = flow_run();
        tracker.register(run.clone().into()).await.unwrap();

        let snapshot = tracker.get(&run.run_id()).await.unwrap();
        assert_eq!(snapshot.state_type(), StateType::Pending);
        assert_eq!(snapshot.history().len(), 1);
        assert!(!snapshot.archived);
    }

    #[tokio::test]
    async fn test_get_unknown_run_is_not_found() {
        let tracker = InMemoryRunTracker::new();
        let missing = RunId::Flow(FlowRunId::generate());
        assert!(matches!(
            tracker.get(&missing).await,
            Err(TrackerError::NotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn test_record_is_idempotent() {
        let tracker = InMemoryRunTracker::new();
        let run = flow_run();
        tracker.register(run.clone().into()).await.unwrap();

        let transition = next(&run, State::running());
        assert_eq!(
            tracker.record(transition.clone()).await.unwrap(),
            RecordOutcome::Appended
        );
        assert_eq!(
            tracker.record(transition).await.unwrap(),
            RecordOutcome::Duplicate
        );

        let snapshot = tracker.get(&run.run_id()).await.unwrap();
        assert_eq!(snapshot.history().len(), 2);
        assert_eq!(snapshot.state_type(), StateType::Running);
    }

    #[tokio::test]
    async fn test_record_rejects_out_of_order() {
        let tracker = InMemoryRunTracker::new();
        let run = flow_run();
        tracker.register(run.clone().into()).await.unwrap();

        let mut transition = next(&run, State::running());
        transition.to.timestamp = run.state().timestamp - Duration::seconds(1);
        assert!(matches!(
            tracker.record(transition).await,
            Err(TrackerError::OutOfOrder { .. })
        ));
    }

    #[tokio::test]
    async fn test_record_rejects_stale_source_state() {
        let tracker = InMemoryRunTracker::new();
        let run = flow_run();
        tracker.register(run.clone().into()).await.unwrap();

        let mut transition = next(&run, State::completed());
        transition.from = Some(StateType::Running);
        assert!(matches!(
            tracker.record(transition).await,
            Err(TrackerError::StaleTransition { .. })
        ));
        assert_eq!(
            tracker.get(&run.run_id()).await.unwrap().state_type(),
            StateType::Pending
        );
    }

    #[tokio::test]
    async fn test_register_conflict() {
        let tracker = InMemoryRunTracker::new();
        let run = flow_run();
        tracker.register(run.clone().into()).await.unwrap();
        tracker.register(run.clone().into()).await.unwrap();

        let mut changed = run.clone();
        changed.flow_name = "other".into();
        assert!(matches!(
            tracker.register(changed.into()).await,
            Err(TrackerError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_query_orders_newest_first_across_pages() {
        let tracker = Arc::new(InMemoryRunTracker::new());
        let base = Utc::now();
        let mut ids = Vec::new();
        for i in 0..7 {
            let run = FlowRun::new(
                "etl",
                Parameters::new(),
                State::pending().with_timestamp(base + Duration::seconds(i)),
            );
            ids.push(run.run_id());
            tracker.register(run.into()).await.unwrap();
        }

        let query = RunQuery::new(tracker.clone(), RunFilter::flow_runs()).with_page_size(3);
        let runs = query.collect().await.unwrap();
        let got: Vec<_> = runs.iter().map(|s| s.run_id()).collect();
        ids.reverse();
        assert_eq!(got, ids);

        // Restartable: a second pass yields the same sequence
        let again = query.collect().await.unwrap();
        assert_eq!(again.len(), 7);

        let limited = RunQuery::new(tracker, RunFilter::flow_runs().with_limit(2))
            .collect()
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].run_id(), ids[0]);
    }

    #[tokio::test]
    async fn test_archive_task_runs() {
        let tracker = InMemoryRunTracker::new();
        let flow = flow_run();
        tracker.register(flow.clone().into()).await.unwrap();
        for i in 0..3 {
            let task = TaskRun::new(
                flow.id,
                "extract",
                TaskKey::for_invocation("extract", i),
                1,
                RetryPolicy::none(),
                State::scheduled(Utc::now()),
            );
            tracker.register(task.into()).await.unwrap();
        }

        assert_eq!(tracker.archive_task_runs(&flow.id).await.unwrap(), 3);
        assert_eq!(tracker.archive_task_runs(&flow.id).await.unwrap(), 0);

        let page = tracker
            .query_page(&RunFilter::task_runs_of(flow.id), None, 10)
            .await
            .unwrap();
        assert_eq!(page.runs.len(), 3);
        assert!(page.runs.iter().all(|s| s.archived && s.kind() == RunKind::Task));
    }

    #[tokio::test]
    async fn test_heartbeat_only_moves_forward() {
        let tracker = InMemoryRunTracker::new();
        let run = flow_run();
        tracker.register(run.clone().into()).await.unwrap();

        let now = Utc::now();
        tracker.heartbeat(&run.id, now).await.unwrap();
        tracker
            .heartbeat(&run.id, now - Duration::seconds(5))
            .await
            .unwrap();
        let snapshot = tracker.get(&run.run_id()).await.unwrap();
        assert_eq!(snapshot.last_heartbeat, Some(now));
    }

    #[tokio::test]
    async fn test_events_published_per_stored_transition() {
        let tracker = InMemoryRunTracker::new();
        let mut events = tracker.subscribe();
        let run = flow_run();
        tracker.register(run.clone().into()).await.unwrap();
        let transition = next(&run, State::running());
        tracker.record(transition.clone()).await.unwrap();
        tracker.record(transition).await.unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.to, StateType::Pending);
        let second = events.recv().await.unwrap();
        assert_eq!(second.event_name(), "conflux.flow-run.Running");
        assert!(events.try_recv().is_err());
    }
}
