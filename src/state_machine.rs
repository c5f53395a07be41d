// Task state machine: the allowed transitions for a task's lifecycle
// (§4.4). Stories and PRDs do not have their own transition tables —
// their status is a pure aggregate of child status, computed in
// executor::propagate_completion.

use crate::models::TaskStatus;
use serde::{Deserialize, Serialize};

/// Record of a state transition, persisted as part of a task's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from_status: TaskStatus,
    pub to_status: TaskStatus,
    pub reason: String,
    pub timestamp: String,
}

impl StatusTransition {
    pub fn new(from: TaskStatus, to: TaskStatus, reason: impl Into<String>) -> Self {
        Self {
            from_status: from,
            to_status: to,
            reason: reason.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Valid task status transitions, per §4.4:
///
/// ```text
/// PENDING ─┬→ QUEUED ──┬→ IN_PROGRESS ─┬→ COMPLETED
///          │           │               ├→ FAILED (retries exhausted or critical failure)
///          │           │               └→ QUEUED (retry: retry_count ++)
///          │           └→ FAILED (circular-dep or never scheduled)
///          └→ CANCELLED
/// ```
///
/// RUNNING_TESTS and VERIFYING are non-terminal sub-states of IN_PROGRESS
/// reporting granularity: the executor may pass through them while a task
/// is out for quality gates / verification, but they are reachable only
/// from IN_PROGRESS and return only to IN_PROGRESS or a terminal status.
pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;

    matches!(
        (from, to),
        (Pending, Queued)
            | (Pending, Cancelled)
            | (Queued, InProgress)
            | (Queued, Failed) // circular dependency or never scheduled
            | (Queued, Cancelled)
            | (InProgress, RunningTests)
            | (InProgress, Verifying)
            | (RunningTests, InProgress)
            | (RunningTests, Verifying)
            | (Verifying, InProgress)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Queued) // retry
            | (RunningTests, Failed)
            | (Verifying, Failed)
            | (InProgress, Cancelled)
            | (RunningTests, Cancelled)
            | (Verifying, Cancelled)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::*;

    #[test]
    fn happy_path_is_valid() {
        assert!(is_valid_transition(Pending, Queued));
        assert!(is_valid_transition(Queued, InProgress));
        assert!(is_valid_transition(InProgress, Completed));
    }

    #[test]
    fn retry_requeue_is_valid() {
        assert!(is_valid_transition(InProgress, Queued));
    }

    #[test]
    fn terminal_states_never_reentered() {
        assert!(!is_valid_transition(Completed, Queued));
        assert!(!is_valid_transition(Failed, Queued));
        assert!(!is_valid_transition(Cancelled, Queued));
    }

    #[test]
    fn circular_dependency_path_is_valid() {
        assert!(is_valid_transition(Queued, Failed));
    }

    #[test]
    fn pending_cannot_skip_to_in_progress() {
        assert!(!is_valid_transition(Pending, InProgress));
    }
}
