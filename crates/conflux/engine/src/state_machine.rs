//! Run state machine
//!
//! The only place where a run's state may change. Flow runs and task runs
//! share the same transition table:
//!
//! ```text
//! Scheduled -> Pending -> Running -> Completed | Failed | Crashed
//!              Pending -> Crashed
//! any non-terminal     -> Cancelled
//! ```
//!
//! A retry never revives a Failed run; it creates a new task run attempt.

use crate::error::TransitionError;
use chrono::Duration;
use conflux_types::{State, StateTransition, StateType, TrackedRun};

/// Validates and applies run state transitions
#[derive(Debug, Clone, Copy, Default)]
pub struct StateMachine;

impl StateMachine {
    /// Whether `from -> to` is in the transition table
    pub fn is_legal(from: StateType, to: StateType) -> bool {
        use StateType::*;

        if from.is_terminal() {
            return false;
        }
        matches!(
            (from, to),
            (_, Cancelled)
                | (Scheduled, Pending)
                | (Pending, Running)
                | (Pending, Crashed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Crashed)
        )
    }

    /// States reachable from `from` in one step
    pub fn legal_targets(from: StateType) -> Vec<StateType> {
        StateType::ALL
            .iter()
            .copied()
            .filter(|to| Self::is_legal(from, *to))
            .collect()
    }

    /// Build the transition record for moving `run` to `target` without
    /// applying it.
    ///
    /// The target timestamp is raised to one microsecond after the current
    /// state when it does not already follow it.
    pub fn prepare<R: TrackedRun + ?Sized>(
        run: &R,
        mut target: State,
    ) -> Result<StateTransition, TransitionError> {
        let current = run.state();
        if !Self::is_legal(current.state_type, target.state_type) {
            return Err(TransitionError::IllegalTransition {
                run_id: run.run_id(),
                from: current.state_type,
                to: target.state_type,
            });
        }

        if target.timestamp <= current.timestamp {
            target.timestamp = current.timestamp + Duration::microseconds(1);
        }

        Ok(StateTransition {
            run_id: run.run_id(),
            from: Some(current.state_type),
            to: target,
        })
    }

    /// Validate and apply a transition, returning the new state
    pub fn transition<R: TrackedRun + ?Sized>(
        run: &mut R,
        target: State,
    ) -> Result<State, TransitionError> {
        let transition = Self::prepare(run, target)?;
        let state = transition.to.clone();
        run.apply_transition(transition);
        Ok(state)
    }
}
