//! Fix-session state machine
//!
//! ```text
//! STRATEGIZING -> EDITING -> TESTING -> REVIEWING -> MERGING -> DONE
//!       ^            ^  |                   |
//!       |            |  +-- (test repair) --+-> STRATEGIZING
//!       |            +---- (lint/CI fix) ---+
//! ```
//!
//! `FAILED` and `CANCELLED` are absorbing and reachable from every live state.

use crate::error::StateMachineError;
use serde::{Deserialize, Serialize};

/// State of one fix session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Asking the oracle for a plan of edits
    Strategizing,
    /// Applying edits on the session branch
    Editing,
    /// Running the test suite
    Testing,
    /// Pull request open, waiting on CI
    Reviewing,
    /// Merging the pull request
    Merging,
    /// Merged
    Done,
    /// Gave up
    Failed,
    /// Stopped on operator request
    Cancelled,
}

impl SessionState {
    /// Absorbing states
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    /// Uppercase label used in status output
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strategizing => "STRATEGIZING",
            Self::Editing => "EDITING",
            Self::Testing => "TESTING",
            Self::Reviewing => "REVIEWING",
            Self::Merging => "MERGING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validates a state transition against the table.
///
/// # Errors
/// Returns [`StateMachineError::IllegalTransition`] when `to` is not reachable from `from`.
pub fn validate_transition(from: SessionState, to: SessionState) -> Result<(), StateMachineError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

/// Every state reachable in one step from `from`
#[must_use]
pub fn allowed_transitions(from: SessionState) -> Vec<SessionState> {
    use SessionState::{Cancelled, Done, Editing, Failed, Merging, Reviewing, Strategizing, Testing};
    match from {
        Strategizing => vec![Editing, Failed, Cancelled],
        Editing => vec![Testing, Failed, Cancelled],
        Testing => vec![Reviewing, Strategizing, Failed, Cancelled],
        Reviewing => vec![Merging, Editing, Failed, Cancelled],
        Merging => vec![Done, Failed, Cancelled],
        Done | Failed | Cancelled => vec![],
    }
}

fn allowed(from: SessionState, to: SessionState) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}
