//! Step exit state, run status and the environment state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};

/// Terminal state reported by a backend for one step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepState {
    /// The process exited (as opposed to the wait being interrupted).
    pub exited: bool,

    /// Exit code.
    pub exit_code: i64,

    /// The kernel killed the process for exceeding its memory limit.
    pub oom_killed: bool,
}

impl StepState {
    /// Creates an exited state with the given code.
    pub fn exited(exit_code: i64) -> Self {
        Self {
            exited: true,
            exit_code,
            oom_killed: false,
        }
    }
}

/// Status of a step, a task or a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Waiting to run.
    Pending,
    /// Currently running.
    Running,
    /// Finished with exit code zero.
    Success,
    /// Finished with a non-zero exit code.
    Failure,
    /// Stopped by a signal, a timeout or the OOM killer.
    Killed,
    /// Could not be run to completion because of an infrastructure error.
    Error,
    /// Not run because of earlier outcomes.
    Skipped,
}

impl Status {
    /// Maps a backend exit state to a status.
    pub fn from_state(state: &StepState) -> Self {
        match state {
            s if !s.exited => Self::Error,
            s if s.oom_killed => Self::Killed,
            s if s.exit_code == 128 || s.exit_code == 130 => Self::Killed,
            s if s.exit_code != 0 => Self::Failure,
            _ => Self::Success,
        }
    }

    /// Returns true once no further change is expected.
    pub fn is_done(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Returns true if this status fails the run.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure | Self::Killed | Self::Error)
    }

    /// Returns the lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Killed => "killed",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }

    /// Folds step statuses into a run status: the first failing status
    /// wins, otherwise success.
    pub fn aggregate<'a>(statuses: impl IntoIterator<Item = &'a Status>) -> Self {
        statuses
            .into_iter()
            .find(|s| s.is_failure())
            .copied()
            .unwrap_or(Self::Success)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle phase of one pipeline environment on a backend.
///
/// ```text
/// Created -(setup)-> Ready -(exec)-> Running -(wait)-> Succeeded | Failed | Killed
///    |                 |                                  |
///    +-----------------+------------(destroy)-------------+--> Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvPhase {
    /// Nothing provisioned yet.
    Created,
    /// Shared environment provisioned.
    Ready,
    /// At least one step started.
    Running,
    /// Every step succeeded.
    Succeeded,
    /// A step failed or errored.
    Failed,
    /// A step was killed.
    Killed,
    /// Environment torn down.
    Terminated,
}

impl EnvPhase {
    /// Returns true if `next` is a legal successor of this phase.
    pub fn can_transition_to(&self, next: EnvPhase) -> bool {
        use EnvPhase::*;
        matches!(
            (*self, next),
            (Created, Ready)
                | (Created, Terminated)
                | (Ready, Running)
                | (Ready, Succeeded)
                | (Ready, Terminated)
                | (Running, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Killed)
                | (Succeeded, Terminated)
                | (Failed, Terminated)
                | (Killed, Terminated)
        )
    }

    /// Moves to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: EnvPhase) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(CoreError::invalid_transition(*self, next));
        }
        *self = next;
        Ok(())
    }

    /// Returns the terminal phase matching a run status.
    pub fn from_status(status: Status) -> Self {
        match status {
            Status::Killed => Self::Killed,
            s if s.is_failure() => Self::Failed,
            _ => Self::Succeeded,
        }
    }

    /// Returns the lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Killed => "killed",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for EnvPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_state() {
        assert_eq!(Status::from_state(&StepState::exited(0)), Status::Success);
        assert_eq!(Status::from_state(&StepState::exited(1)), Status::Failure);
        assert_eq!(Status::from_state(&StepState::exited(128)), Status::Killed);
        assert_eq!(Status::from_state(&StepState::exited(130)), Status::Killed);
        assert_eq!(Status::from_state(&StepState::default()), Status::Error);

        let oom = StepState {
            exited: true,
            exit_code: 137,
            oom_killed: true,
        };
        assert_eq!(Status::from_state(&oom), Status::Killed);
    }

    #[test]
    fn test_status_aggregate() {
        let statuses = [Status::Success, Status::Skipped, Status::Failure, Status::Killed];
        assert_eq!(Status::aggregate(&statuses), Status::Failure);
        assert_eq!(Status::aggregate(&[Status::Success, Status::Skipped]), Status::Success);
        assert_eq!(Status::aggregate(&[]), Status::Success);
    }

    #[test]
    fn test_env_phase_happy_path() {
        let mut phase = EnvPhase::Created;
        phase.transition(EnvPhase::Ready).unwrap();
        phase.transition(EnvPhase::Running).unwrap();
        phase.transition(EnvPhase::Running).unwrap();
        phase.transition(EnvPhase::Failed).unwrap();
        phase.transition(EnvPhase::Terminated).unwrap();
        assert_eq!(phase, EnvPhase::Terminated);
    }

    #[test]
    fn test_env_phase_setup_failure_path() {
        let mut phase = EnvPhase::Created;
        phase.transition(EnvPhase::Terminated).unwrap();
    }

    #[test]
    fn test_env_phase_rejects_skipping_setup() {
        let mut phase = EnvPhase::Created;
        let err = phase.transition(EnvPhase::Running).unwrap_err();
        assert_eq!(err, CoreError::invalid_transition("created", "running"));
        assert_eq!(phase, EnvPhase::Created);
    }

    #[test]
    fn test_env_phase_terminated_is_final() {
        let mut phase = EnvPhase::Terminated;
        assert!(phase.transition(EnvPhase::Ready).is_err());
    }

    #[test]
    fn test_from_status() {
        assert_eq!(EnvPhase::from_status(Status::Success), EnvPhase::Succeeded);
        assert_eq!(EnvPhase::from_status(Status::Error), EnvPhase::Failed);
        assert_eq!(EnvPhase::from_status(Status::Killed), EnvPhase::Killed);
    }
}
