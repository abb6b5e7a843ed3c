//! Run state change events
//!
//! Observers subscribe to these instead of polling the run tracker.

use crate::{FlowRunId, RunId, RunKind, StateTransition, StateType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Emitted once for every transition the run tracker stores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: RunId,
    pub kind: RunKind,
    /// Owning flow run (the run itself for flow runs)
    pub flow_run_id: FlowRunId,
    pub from: Option<StateType>,
    pub to: StateType,
    pub occurred: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RunEvent {
    pub fn from_transition(flow_run_id: FlowRunId, transition: &StateTransition) -> Self {
        let kind = match transition.run_id {
            RunId::Flow(_) => RunKind::Flow,
            RunId::Task(_) => RunKind::Task,
        };
        Self {
            run_id: transition.run_id,
            kind,
            flow_run_id,
            from: transition.from,
            to: transition.to.state_type,
            occurred: transition.to.timestamp,
            message: transition.to.message.clone(),
        }
    }

    /// Dotted event name, e.g. `conflux.flow-run.Running`
    pub fn event_name(&self) -> String {
        format!("conflux.{}.{}", self.kind, self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{State, TaskRunId};

    #[test]
    fn test_event_name() {
        let flow_run_id = FlowRunId::generate();
        let transition = StateTransition {
            run_id: RunId::Flow(flow_run_id),
            from: Some(StateType::Pending),
            to: State::running(),
        };
        let event = RunEvent::from_transition(flow_run_id, &transition);
        assert_eq!(event.event_name(), "conflux.flow-run.Running");
    }

    #[test]
    fn test_task_event_keeps_parent_flow() {
        let flow_run_id = FlowRunId::generate();
        let transition = StateTransition {
            run_id: RunId::Task(TaskRunId::generate()),
            from: Some(StateType::Running),
            to: State::failed("boom"),
        };
        let event = RunEvent::from_transition(flow_run_id, &transition);
        assert_eq!(event.kind, RunKind::Task);
        assert_eq!(event.flow_run_id, flow_run_id);
        assert_eq!(event.event_name(), "conflux.task-run.Failed");
        assert_eq!(event.message.as_deref(), Some("boom"));
    }
}
