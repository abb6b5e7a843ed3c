//! Typed failures raised by user code

use serde::{Deserialize, Serialize};
use std::fmt;

/// A failure reported by a task or flow body.
///
/// `kind` is the failure class used by retry conditions (for example
/// `TransientError` or `ValidationError`); `message` is free-form detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: String,
    pub message: String,
}

impl Failure {
    /// Kind assigned to panics captured inside user callables
    pub const PANIC: &'static str = "Panic";

    /// Kind reported to joiners of a task or subflow cut short by cancellation
    pub const CANCELLED: &'static str = "Cancelled";

    /// Kind reported when orchestration itself failed around a user callable
    pub const ORCHESTRATION: &'static str = "OrchestrationError";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self::new(Self::PANIC, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Self::CANCELLED, message)
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Failure {}
