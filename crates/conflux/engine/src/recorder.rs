//! Validated, persisted transitions
//!
//! Every state change in the engine goes through [`RunRecorder::transition`]:
//! the state machine validates it, the run tracker stores it, and only then
//! does the in-memory run advance.

use crate::error::Result;
use crate::state_machine::StateMachine;
use crate::error::OrchestrationError;
use conflux_tracker::{RecordOutcome, RunTracker, TrackerError};
use conflux_types::{State, StateTransition, TrackedRun};
use std::sync::Arc;
use tracing::debug;

/// Applies transitions to runs and persists them to the run tracker
#[derive(Clone)]
pub struct RunRecorder {
    tracker: Arc<dyn RunTracker>,
}

impl RunRecorder {
    pub fn new(tracker: Arc<dyn RunTracker>) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &Arc<dyn RunTracker> {
        &self.tracker
    }

    /// Move `run` to `target`; `run` is left untouched on any error
    pub async fn transition<R>(&self, run: &mut R, target: State) -> Result<StateTransition>
    where
        R: TrackedRun + Send + ?Sized,
    {
        let transition = StateMachine::prepare(run, target)?;
        if self.tracker.record(transition.clone()).await? == RecordOutcome::Duplicate {
            debug!(run_id = %transition.run_id, "Transition already stored");
        }
        run.apply_transition(transition.clone());
        Ok(transition)
    }

    /// Like [`transition`](Self::transition) but a no-op for terminal runs.
    ///
    /// Returns `None` when the run had already finished, which happens when a
    /// cancellation or crash sweep won the race for the run. A run finished
    /// by another writer is caught up with the stored history first.
    pub async fn transition_if_active<R>(
        &self,
        run: &mut R,
        target: State,
    ) -> Result<Option<StateTransition>>
    where
        R: TrackedRun + Send + ?Sized,
    {
        if run.is_terminal() {
            debug!(
                run_id = %run.run_id(),
                current = %run.state().state_type,
                target = %target.state_type,
                "Run already terminal, skipping transition"
            );
            return Ok(None);
        }
        match self.transition(run, target).await {
            Ok(transition) => Ok(Some(transition)),
            Err(OrchestrationError::Tracker(
                e @ (TrackerError::StaleTransition { .. } | TrackerError::OutOfOrder { .. }),
            )) => {
                if self.catch_up(run).await? {
                    debug!(
                        run_id = %run.run_id(),
                        current = %run.state().state_type,
                        "Run finished by another writer"
                    );
                    Ok(None)
                } else {
                    Err(e.into())
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Apply stored transitions missing from `run`; true when it is now terminal
    pub async fn catch_up<R>(&self, run: &mut R) -> Result<bool>
    where
        R: TrackedRun + Send + ?Sized,
    {
        let snapshot = self.tracker.get(&run.run_id()).await?;
        let known = run.history().len();
        for transition in snapshot.history().iter().skip(known) {
            run.apply_transition(transition.clone());
        }
        Ok(run.is_terminal())
    }
}

impl std::fmt::Debug for RunRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRecorder").finish_non_exhaustive()
    }
}
