// ABOUTME: Sandbox lifecycle state machine and the desired-state vocabulary
// ABOUTME: Every lifecycle write in the store is checked against these transition rules

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal lifecycle transition {from} -> {to}")]
    Illegal {
        from: LifecycleStatus,
        to: LifecycleStatus,
    },
    #[error("invalid desired state '{0}': expected 'running' or 'deleted'")]
    InvalidDesiredState(String),
    #[error("unknown lifecycle status: {0}")]
    UnknownStatus(String),
    #[error("unknown history source: {0}")]
    UnknownSource(String),
}

/// The control plane's belief about a sandbox's actual condition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Pending,
    Running,
    Terminating,
    Terminated,
    Error,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Error => "error",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, TransitionError> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "terminating" => Ok(Self::Terminating),
            "terminated" => Ok(Self::Terminated),
            "error" => Ok(Self::Error),
            _ => Err(TransitionError::UnknownStatus(s.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Position on the linear path; `error` sits off the path.
    fn rank(&self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Running => Some(1),
            Self::Terminating => Some(2),
            Self::Terminated => Some(3),
            Self::Error => None,
        }
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator intent. Only these two values can ever be requested.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Deleted,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Deleted => "deleted",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, TransitionError> {
        match s {
            "running" => Ok(Self::Running),
            "deleted" => Ok(Self::Deleted),
            _ => Err(TransitionError::InvalidDesiredState(s.to_string())),
        }
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who caused a lifecycle transition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HistorySource {
    Api,
    Reconciler,
    SubstrateEvent,
}

impl HistorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Reconciler => "reconciler",
            Self::SubstrateEvent => "substrate-event",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, TransitionError> {
        match s {
            "api" => Ok(Self::Api),
            "reconciler" => Ok(Self::Reconciler),
            "substrate-event" => Ok(Self::SubstrateEvent),
            _ => Err(TransitionError::UnknownSource(s.to_string())),
        }
    }
}

/// Whether `from -> to` is a legal edge. Same-state pairs are not transitions.
pub fn can_transition(from: LifecycleStatus, to: LifecycleStatus) -> bool {
    use LifecycleStatus::*;

    if from == to || from.is_terminal() {
        return false;
    }

    match (from, to) {
        // any non-terminal state may fail
        (_, Error) => true,
        // recovery: retry creation or reclaim
        (Error, Pending) | (Error, Terminating) | (Error, Terminated) => true,
        (Error, _) => false,
        _ => match (from.rank(), to.rank()) {
            (Some(a), Some(b)) => b > a,
            _ => false,
        },
    }
}

/// The steps that carry `from` to `to`: the direct edge, or for a failed
/// sandbox whose workload came back, a retry through `pending` first.
pub fn transition_path(
    from: LifecycleStatus,
    to: LifecycleStatus,
) -> Option<Vec<LifecycleStatus>> {
    use LifecycleStatus::*;

    if can_transition(from, to) {
        return Some(vec![to]);
    }
    if from == Error && can_transition(Pending, to) {
        return Some(vec![Pending, to]);
    }
    None
}

pub fn validate_transition(
    from: LifecycleStatus,
    to: LifecycleStatus,
) -> Result<(), TransitionError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(TransitionError::Illegal { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleStatus::*;

    const ALL: [LifecycleStatus; 5] = [Pending, Running, Terminating, Terminated, Error];

    #[test]
    fn test_linear_path_is_legal() {
        assert!(can_transition(Pending, Running));
        assert!(can_transition(Running, Terminating));
        assert!(can_transition(Terminating, Terminated));
    }

    #[test]
    fn test_forward_skips_are_legal() {
        assert!(can_transition(Pending, Terminating));
        assert!(can_transition(Running, Terminated));
        assert!(can_transition(Pending, Terminated));
    }

    #[test]
    fn test_backward_moves_are_illegal() {
        assert!(!can_transition(Running, Pending));
        assert!(!can_transition(Terminating, Running));
        assert!(!can_transition(Terminating, Pending));
    }

    #[test]
    fn test_error_reachable_from_every_non_terminal_state() {
        for from in [Pending, Running, Terminating] {
            assert!(can_transition(from, Error), "{} -> error", from);
        }
        assert!(!can_transition(Terminated, Error));
    }

    #[test]
    fn test_error_only_exits_through_recovery() {
        assert!(can_transition(Error, Pending));
        assert!(can_transition(Error, Terminating));
        assert!(can_transition(Error, Terminated));
        assert!(!can_transition(Error, Running));
    }

    #[test]
    fn test_failed_sandbox_recovers_through_pending() {
        assert_eq!(transition_path(Error, Running), Some(vec![Pending, Running]));
        assert_eq!(transition_path(Error, Pending), Some(vec![Pending]));
        assert_eq!(transition_path(Error, Terminated), Some(vec![Terminated]));
        assert_eq!(transition_path(Pending, Running), Some(vec![Running]));
        assert_eq!(transition_path(Running, Pending), None);
        assert_eq!(transition_path(Terminated, Running), None);
    }

    #[test]
    fn test_terminated_is_final() {
        for to in ALL {
            assert!(!can_transition(Terminated, to));
        }
    }

    #[test]
    fn test_same_state_is_not_a_transition() {
        for s in ALL {
            assert!(!can_transition(s, s));
        }
    }

    #[test]
    fn test_validate_reports_edge() {
        let err = validate_transition(Terminated, Running).unwrap_err();
        assert_eq!(
            err,
            TransitionError::Illegal {
                from: Terminated,
                to: Running
            }
        );
        assert_eq!(err.to_string(), "illegal lifecycle transition terminated -> running");
    }

    #[test]
    fn test_desired_state_parsing() {
        assert_eq!(DesiredState::from_str("running").unwrap(), DesiredState::Running);
        assert_eq!(DesiredState::from_str("deleted").unwrap(), DesiredState::Deleted);
        assert!(matches!(
            DesiredState::from_str("paused"),
            Err(TransitionError::InvalidDesiredState(_))
        ));
    }

    #[test]
    fn test_status_and_source_strings() {
        for s in ALL {
            assert_eq!(LifecycleStatus::from_str(s.as_str()).unwrap(), s);
        }
        assert_eq!(HistorySource::SubstrateEvent.as_str(), "substrate-event");
        assert_eq!(
            HistorySource::from_str("reconciler").unwrap(),
            HistorySource::Reconciler
        );
        assert_eq!(
            serde_json::to_string(&HistorySource::SubstrateEvent).unwrap(),
            "\"substrate-event\""
        );
    }
}
