//! Build tasks and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BranchName, TaskId};

/// One requested build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildTask {
    pub id: TaskId,
    pub branch: BranchName,
    /// Who asked for the build.
    pub requester: String,
    /// Where results and the artifact are delivered.
    pub destination: String,
    pub enqueued_at: DateTime<Utc>,
}

impl BuildTask {
    pub fn new(
        branch: BranchName,
        requester: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            branch,
            requester: requester.into(),
            destination: destination.into(),
            enqueued_at: Utc::now(),
        }
    }
}

/// Lifecycle state of a build task.
///
/// `Queued -> Running -> Uploading -> Completed`, with `Failed` reachable from
/// `Running` and `Cancelled` from any non-terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Queued,
    Running,
    Uploading,
    Completed,
    Failed { message: String },
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed { .. } | TaskState::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: &TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Queued, Running) => true,
            (Running, Uploading) | (Running, Failed { .. }) => true,
            (Uploading, Completed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(TaskState::Queued.can_transition_to(&TaskState::Running));
        assert!(TaskState::Running.can_transition_to(&TaskState::Uploading));
        assert!(TaskState::Uploading.can_transition_to(&TaskState::Completed));
    }

    #[test]
    fn test_cancel_from_any_live_state() {
        for state in [TaskState::Queued, TaskState::Running, TaskState::Uploading] {
            assert!(state.can_transition_to(&TaskState::Cancelled));
        }
        assert!(!TaskState::Completed.can_transition_to(&TaskState::Cancelled));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!TaskState::Queued.can_transition_to(&TaskState::Completed));
        assert!(
            !TaskState::Uploading.can_transition_to(&TaskState::Failed {
                message: "x".to_string()
            })
        );
        assert!(!TaskState::Completed.can_transition_to(&TaskState::Running));
    }
}
