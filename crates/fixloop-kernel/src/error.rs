//! Error types for the Fixloop kernel

use crate::state_machine::SessionState;

/// Session state-machine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    /// Transition not present in the transition table
    #[error("illegal session transition: {from:?} -> {to:?}")]
    IllegalTransition {
        /// State the session was in
        from: SessionState,
        /// State that was requested
        to: SessionState,
    },
}

/// Record log errors
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Hash chain broken at the given record index
    #[error("hash chain broken at record {index}")]
    IntegrityViolation {
        /// Index of the first bad record
        index: usize,
    },

    /// Record could not be encoded for hashing or persistence
    #[error("record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors returned by the reasoning oracle boundary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    /// Transport or service failure; safe to retry
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    /// Content-policy refusal; never retried
    #[error("oracle refused: {0}")]
    Refused(String),
}

impl OracleError {
    /// Only transport failures are worth another attempt
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
