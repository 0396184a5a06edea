//! Task identity, status, and outcomes

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConclaveError;
use crate::role::RoleId;

/// Unique identifier for one unit of in-flight work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a task.
///
/// Transitions are monotonic. In particular a task that has delegated never
/// returns to `Running`: it only resumes through its children's aggregated
/// result, and its next status is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Delegated,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Delegated)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Delegated, Succeeded)
                | (Delegated, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Delegated => "delegated",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One hop of a delegation chain, as reported in failures and audits.
/// Carries role and task text only; internal task ids never cross the
/// caller boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub role: RoleId,
    pub task: String,
}

/// A failed outcome: the error that ended the task plus the delegation chain
/// that produced it, root first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub error: ConclaveError,
    pub chain: Vec<ChainLink>,
}

impl TaskFailure {
    pub fn new(error: ConclaveError) -> Self {
        Self { error, chain: Vec::new() }
    }

    pub fn with_chain(error: ConclaveError, chain: Vec<ChainLink>) -> Self {
        Self { error, chain }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if !self.chain.is_empty() {
            write!(f, " (chain: ")?;
            for (i, link) in self.chain.iter().enumerate() {
                if i > 0 {
                    write!(f, " -> ")?;
                }
                write!(f, "{}", link.role)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Terminal result of a task: a JSON value on success, a [`TaskFailure`]
/// otherwise. Failures are ordinary return values to the parent, never
/// re-raised past the boundary that created them.
pub type Outcome = Result<serde_json::Value, TaskFailure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids_unique() {
        assert_ne!(TaskId::new(), TaskId::new());
    }

    #[test]
    fn test_status_monotonic() {
        use TaskStatus::*;

        assert!(Pending.can_transition(Running));
        assert!(Running.can_transition(Delegated));
        assert!(Running.can_transition(Succeeded));
        assert!(Delegated.can_transition(Failed));

        // delegated never resumes direct execution
        assert!(!Delegated.can_transition(Running));
        // no backwards motion, no leaving a terminal state
        assert!(!Running.can_transition(Pending));
        assert!(!Succeeded.can_transition(Failed));
        assert!(!Failed.can_transition(Running));
        // a task cannot succeed without ever running
        assert!(!Pending.can_transition(Succeeded));
    }

    #[test]
    fn test_terminal() {
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Delegated.is_terminal());
    }

    #[test]
    fn test_failure_display_includes_chain() {
        let failure = TaskFailure::with_chain(
            ConclaveError::Timeout,
            vec![
                ChainLink { role: "coder".into(), task: "build it".into() },
                ChainLink { role: "researcher".into(), task: "find callers".into() },
            ],
        );
        let rendered = failure.to_string();
        assert!(rendered.contains("deadline"));
        assert!(rendered.contains("coder -> researcher"));
    }
}
