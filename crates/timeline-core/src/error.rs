use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{timeline::TimelineMergeError, types::SyncState};

/// Broad error kind used for presentation handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimelineErrorKind {
    /// Event source or network failure during a load. Recoverable by retry.
    Sync,
    /// A newer batch arrived older than the current tail and was dropped.
    OutOfOrder,
    /// Input that should have been sorted (or keyed) was not.
    InvalidOrder,
    /// Operation attempted after `dispose`.
    Disposed,
    /// Operation not valid in the current lifecycle state.
    InvalidState,
}

/// Stable error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{kind:?}:{code}: {message}")]
pub struct TimelineError {
    /// High-level error kind.
    pub kind: TimelineErrorKind,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl TimelineError {
    /// Construct a new error.
    pub fn new(
        kind: TimelineErrorKind,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Event source failure.
    pub fn sync(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(TimelineErrorKind::Sync, code, message)
    }

    /// Use-after-dispose error.
    pub fn disposed(action: &str) -> Self {
        Self::new(
            TimelineErrorKind::Disposed,
            "controller_disposed",
            format!("cannot run '{action}' after dispose"),
        )
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: SyncState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            TimelineErrorKind::InvalidState,
            "invalid_state_transition",
            format!("cannot run '{action}' while controller is in state {current:?}"),
        )
    }
}

impl From<TimelineMergeError> for TimelineError {
    fn from(err: TimelineMergeError) -> Self {
        let (kind, code) = match &err {
            TimelineMergeError::OutOfOrder { .. } => {
                (TimelineErrorKind::OutOfOrder, "out_of_order")
            }
            TimelineMergeError::InvalidOrder { .. } => {
                (TimelineErrorKind::InvalidOrder, "invalid_order")
            }
            TimelineMergeError::DuplicateId(_) => (TimelineErrorKind::InvalidOrder, "duplicate_id"),
            TimelineMergeError::Malformed { .. } => {
                (TimelineErrorKind::InvalidOrder, "malformed_item")
            }
        };
        Self::new(kind, code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_invalid_state_error_code_stable() {
        let err = TimelineError::invalid_state(SyncState::Ready, "load_initial");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(err.kind, TimelineErrorKind::InvalidState);
        assert!(err.message.contains("Ready"));
    }

    #[test]
    fn maps_merge_errors_to_kinds() {
        let err = TimelineError::from(TimelineMergeError::OutOfOrder {
            earliest: 4,
            latest: 5,
        });
        assert_eq!(err.kind, TimelineErrorKind::OutOfOrder);
        assert_eq!(err.code, "out_of_order");

        let err = TimelineError::from(TimelineMergeError::DuplicateId("m-1".into()));
        assert_eq!(err.kind, TimelineErrorKind::InvalidOrder);
        assert_eq!(err.code, "duplicate_id");
    }

    #[test]
    fn disposed_errors_name_the_rejected_action() {
        let err = TimelineError::disposed("load_older");
        assert_eq!(err.kind, TimelineErrorKind::Disposed);
        assert_eq!(err.code, "controller_disposed");
        assert!(err.message.contains("load_older"));
    }
}
