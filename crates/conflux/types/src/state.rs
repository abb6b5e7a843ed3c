//! Run states and state transitions
//!
//! Flow runs and task runs share one finite set of states. A run has exactly
//! one current [`State`]; its history is an append-only list of
//! [`StateTransition`] records with strictly increasing timestamps.

use crate::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of a run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateType {
    Scheduled,
    Pending,
    Running,
    Completed,
    Failed,
    Crashed,
    Cancelled,
}

impl StateType {
    pub const ALL: [StateType; 7] = [
        StateType::Scheduled,
        StateType::Pending,
        StateType::Running,
        StateType::Completed,
        StateType::Failed,
        StateType::Crashed,
        StateType::Cancelled,
    ];

    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StateType::Completed | StateType::Failed | StateType::Crashed | StateType::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StateType::Scheduled => "Scheduled",
            StateType::Pending => "Pending",
            StateType::Running => "Running",
            StateType::Completed => "Completed",
            StateType::Failed => "Failed",
            StateType::Crashed => "Crashed",
            StateType::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a persisted run result
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultRef(String);

impl ResultRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn for_run(run_id: &RunId) -> Self {
        Self(format!("result/{}", run_id))
    }

    pub fn key(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResultRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A run state: kind, timestamp and optional details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub state_type: StateType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultRef>,
    /// When a Scheduled run is due to start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<DateTime<Utc>>,
}

impl State {
    pub fn new(state_type: StateType) -> Self {
        Self {
            state_type,
            timestamp: Utc::now(),
            message: None,
            result: None,
            scheduled_time: None,
        }
    }

    pub fn scheduled(at: DateTime<Utc>) -> Self {
        Self {
            scheduled_time: Some(at),
            ..Self::new(StateType::Scheduled)
        }
    }

    pub fn pending() -> Self {
        Self::new(StateType::Pending)
    }

    pub fn running() -> Self {
        Self::new(StateType::Running)
    }

    pub fn completed() -> Self {
        Self::new(StateType::Completed)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(StateType::Failed).with_message(message)
    }

    pub fn crashed(message: impl Into<String>) -> Self {
        Self::new(StateType::Crashed).with_message(message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StateType::Cancelled).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_result(mut self, result: ResultRef) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state_type.is_terminal()
    }

    pub fn is_final_success(&self) -> bool {
        self.state_type == StateType::Completed
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{} ({})", self.state_type, message),
            None => write!(f, "{}", self.state_type),
        }
    }
}

/// Immutable record of a run entering a state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub run_id: RunId,
    /// `None` for the initial state of a run
    pub from: Option<StateType>,
    pub to: State,
}

impl StateTransition {
    pub fn initial(run_id: RunId, state: State) -> Self {
        Self {
            run_id,
            from: None,
            to: state,
        }
    }

    /// The tuple that identifies a retransmission of the same transition
    pub fn identity(&self) -> (RunId, StateType, DateTime<Utc>) {
        (self.run_id, self.to.state_type, self.to.timestamp)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.to.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FlowRunId;

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = StateType::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .copied()
            .collect();
        assert_eq!(
            terminal,
            vec![
                StateType::Completed,
                StateType::Failed,
                StateType::Crashed,
                StateType::Cancelled
            ]
        );
    }

    #[test]
    fn test_state_constructors() {
        let failed = State::failed("boom");
        assert_eq!(failed.state_type, StateType::Failed);
        assert_eq!(failed.message.as_deref(), Some("boom"));
        assert_eq!(failed.to_string(), "Failed (boom)");

        let at = Utc::now();
        let scheduled = State::scheduled(at);
        assert_eq!(scheduled.scheduled_time, Some(at));
        assert!(!scheduled.is_terminal());
    }

    #[test]
    fn test_transition_identity() {
        let run_id = RunId::from(FlowRunId::generate());
        let state = State::pending();
        let transition = StateTransition::initial(run_id, state.clone());
        assert_eq!(
            transition.identity(),
            (run_id, StateType::Pending, state.timestamp)
        );
    }

    #[test]
    fn test_state_serde_skips_empty_fields() {
        let json = serde_json::to_value(State::running()).unwrap();
        assert_eq!(json["state_type"], "Running");
        assert!(json.get("message").is_none());
        assert!(json.get("scheduled_time").is_none());
    }
}
