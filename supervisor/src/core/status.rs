//! Runner status and the transition table that governs it.
//!
//! `Pending` is the initial state. The four terminal states are absorbing:
//! once a runner reaches one of them no further transition is accepted.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Informational reason attached to a timed wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    /// A checkpoint sentinel was consumed; the agent restarts with fresh context.
    Checkpoint,
    /// The previous invocation failed.
    Backoff,
    /// The operator chose to continue after a missing checkpoint.
    Cooldown,
}

impl WaitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            WaitReason::Checkpoint => "checkpoint",
            WaitReason::Backoff => "backoff",
            WaitReason::Cooldown => "cooldown",
        }
    }
}

impl fmt::Display for WaitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a loop runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum RunnerStatus {
    Pending,
    Running,
    Waiting(WaitReason),
    Paused,
    MissingCheckpoint,
    Completed,
    Blocked,
    Stopped,
    Failed,
}

impl RunnerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunnerStatus::Completed
                | RunnerStatus::Blocked
                | RunnerStatus::Stopped
                | RunnerStatus::Failed
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: RunnerStatus) -> bool {
        use RunnerStatus::{
            Blocked, Completed, Failed, MissingCheckpoint, Paused, Pending, Running, Stopped,
            Waiting,
        };

        match (self, next) {
            (Pending, Running) => true,
            (Pending, _) => false,
            (
                Running,
                Paused | Waiting(_) | MissingCheckpoint | Completed | Blocked | Stopped | Failed,
            ) => true,
            (Running, Pending | Running) => false,
            // Done/blocked are only ever observed while running, so a wait can
            // only end in running or in an operator/fault termination.
            (Waiting(_), Running | Stopped | Failed) => true,
            (Waiting(_), _) => false,
            (Paused, Running | Stopped | Failed) => true,
            (Paused, _) => false,
            (MissingCheckpoint, Running | Stopped | Failed) => true,
            (MissingCheckpoint, _) => false,
            (Completed | Blocked | Stopped | Failed, _) => false,
        }
    }

    /// Stable lowercase label used by logs and the status surface.
    pub fn label(self) -> &'static str {
        match self {
            RunnerStatus::Pending => "pending",
            RunnerStatus::Running => "running",
            RunnerStatus::Waiting(_) => "waiting",
            RunnerStatus::Paused => "paused",
            RunnerStatus::MissingCheckpoint => "missing_checkpoint",
            RunnerStatus::Completed => "completed",
            RunnerStatus::Blocked => "blocked",
            RunnerStatus::Stopped => "stopped",
            RunnerStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerStatus::Waiting(reason) => write!(f, "waiting({reason})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Operator verdict at the missing-checkpoint gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointDecision {
    Continue,
    Stop,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [RunnerStatus; 11] = [
        RunnerStatus::Pending,
        RunnerStatus::Running,
        RunnerStatus::Waiting(WaitReason::Checkpoint),
        RunnerStatus::Waiting(WaitReason::Backoff),
        RunnerStatus::Waiting(WaitReason::Cooldown),
        RunnerStatus::Paused,
        RunnerStatus::MissingCheckpoint,
        RunnerStatus::Completed,
        RunnerStatus::Blocked,
        RunnerStatus::Stopped,
        RunnerStatus::Failed,
    ];

    #[test]
    fn terminal_states_are_absorbing() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(
                    !from.can_transition_to(to),
                    "{from} must not transition to {to}"
                );
            }
        }
    }

    #[test]
    fn pending_only_starts_running() {
        let reachable: Vec<RunnerStatus> = ALL
            .into_iter()
            .filter(|to| RunnerStatus::Pending.can_transition_to(*to))
            .collect();
        assert_eq!(reachable, vec![RunnerStatus::Running]);
    }

    #[test]
    fn terminal_states_only_reached_from_active_states() {
        for to in ALL.iter().filter(|s| s.is_terminal()) {
            for from in ALL {
                if from.can_transition_to(*to) {
                    assert!(
                        matches!(
                            from,
                            RunnerStatus::Running
                                | RunnerStatus::Waiting(_)
                                | RunnerStatus::Paused
                                | RunnerStatus::MissingCheckpoint
                        ),
                        "{from} reached terminal {to}"
                    );
                }
            }
        }
    }

    #[test]
    fn missing_checkpoint_resolves_to_running_or_stopped() {
        let from = RunnerStatus::MissingCheckpoint;
        assert!(from.can_transition_to(RunnerStatus::Running));
        assert!(from.can_transition_to(RunnerStatus::Stopped));
        assert!(!from.can_transition_to(RunnerStatus::Completed));
        assert!(!from.can_transition_to(RunnerStatus::Paused));
    }

    #[test]
    fn display_includes_wait_reason() {
        assert_eq!(
            RunnerStatus::Waiting(WaitReason::Backoff).to_string(),
            "waiting(backoff)"
        );
        assert_eq!(RunnerStatus::MissingCheckpoint.to_string(), "missing_checkpoint");
    }

    #[test]
    fn status_serializes_with_reason() {
        let json = serde_json::to_string(&RunnerStatus::Waiting(WaitReason::Cooldown))
            .expect("serialize");
        assert_eq!(json, r#"{"state":"waiting","reason":"cooldown"}"#);
        let json = serde_json::to_string(&RunnerStatus::Paused).expect("serialize");
        assert_eq!(json, r#"{"state":"paused"}"#);
    }
}
