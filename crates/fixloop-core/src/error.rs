//! Error types for the coordinator
//!
//! Oracle, worker and budget errors stop at the session boundary, where they
//! become a [`SessionFailure`] and drive the session to a terminal state.
//! [`CoordinatorError`] covers ingress problems, which are reported to
//! egress and never take the process down.

use fixloop_kernel::{OracleError, SessionState};
use fixloop_safety::CostDenied;
use fixloop_workers::WorkerError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Why a session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network or API hiccup that outlived its retries
    TransientExternal,
    /// Budget ceiling reached
    BudgetExceeded,
    /// Oracle refused on content policy
    PolicyRefusal,
    /// Worker reported failure past its repair bound
    WorkerFailure,
    /// Oracle output unusable even after a corrective prompt
    ProtocolViolation,
    /// Operator cancelled
    Cancelled,
    /// Bug in the coordinator itself
    Internal,
}

impl FailureKind {
    /// Only transient failures are worth retrying in place
    #[inline]
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransientExternal)
    }

    /// Stable label used in lessons and notifications
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::TransientExternal => "transient_external",
            Self::BudgetExceeded => "budget_exceeded",
            Self::PolicyRefusal => "policy_refusal",
            Self::WorkerFailure => "worker_failure",
            Self::ProtocolViolation => "protocol_violation",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Terminal failure of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {reason}")]
pub struct SessionFailure {
    /// Taxonomy bucket
    pub kind: FailureKind,
    /// Human-readable reason
    pub reason: String,
    /// Finer class for lesson signatures (`test_failure`, `lint`, ...)
    #[serde(default)]
    pub error_class: Option<String>,
}

impl SessionFailure {
    /// Create failure
    #[must_use]
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            error_class: None,
        }
    }

    /// With a finer error class
    #[must_use]
    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.error_class = Some(class.into());
        self
    }

    /// Operator cancellation
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "cancelled by operator")
    }

    /// Worker reported failure
    #[must_use]
    pub fn worker(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::WorkerFailure, reason)
    }
}

impl From<OracleError> for SessionFailure {
    fn from(err: OracleError) -> Self {
        match err {
            OracleError::Unavailable(msg) => Self::new(FailureKind::TransientExternal, msg)
                .with_class("oracle_unavailable"),
            OracleError::Refused(msg) => {
                Self::new(FailureKind::PolicyRefusal, msg).with_class("oracle_refused")
            }
        }
    }
}

impl From<WorkerError> for SessionFailure {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Unavailable(msg) => Self::new(FailureKind::TransientExternal, msg)
                .with_class("worker_unavailable"),
            WorkerError::Invocation(msg) => {
                Self::new(FailureKind::WorkerFailure, msg).with_class("worker_invocation")
            }
        }
    }
}

impl From<CostDenied> for SessionFailure {
    fn from(err: CostDenied) -> Self {
        let class = if err.is_global() {
            "daily_ceiling"
        } else {
            "session_ceiling"
        };
        Self::new(FailureKind::BudgetExceeded, err.to_string()).with_class(class)
    }
}

/// Coordinator-level errors, reported to egress
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    /// Ingress line could not be understood
    #[error("malformed ingress message: {0}")]
    Malformed(String),

    /// No session or queued issue with this id
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// Only FAILED or CANCELLED sessions can be retried
    #[error("session {session} is {state} and cannot be retried")]
    NotRetryable {
        /// Session id
        session: String,
        /// Its current state
        state: SessionState,
    },
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File unreadable
    #[error("cannot read config {}: {source}", path.display())]
    Io {
        /// Path tried
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Malformed TOML
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Environment override unparsable
    #[error("environment variable {var} has unusable value {value:?}")]
    Env {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
    },

    /// Semantically invalid
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixloop_kernel::SessionId;
    use fixloop_safety::Usd;

    #[test]
    fn oracle_errors_map_to_taxonomy() {
        let transient: SessionFailure = OracleError::Unavailable("503".into()).into();
        assert_eq!(transient.kind, FailureKind::TransientExternal);
        assert!(transient.kind.is_retryable());

        let refused: SessionFailure = OracleError::Refused("policy".into()).into();
        assert_eq!(refused.kind, FailureKind::PolicyRefusal);
        assert!(!refused.kind.is_retryable());
    }

    #[test]
    fn budget_denial_is_budget_exceeded() {
        let denied = CostDenied::SessionCeiling {
            session: SessionId::new(),
            committed: Usd(10),
            outstanding: Usd::ZERO,
            requested: Usd(5),
            cap: Usd(12),
        };
        let failure: SessionFailure = denied.into();
        assert_eq!(failure.kind, FailureKind::BudgetExceeded);
        assert_eq!(failure.kind.label(), "budget_exceeded");
        assert_eq!(failure.error_class.as_deref(), Some("session_ceiling"));
    }

    #[test]
    fn display_leads_with_label() {
        let failure = SessionFailure::worker("tests still failing");
        assert_eq!(failure.to_string(), "worker_failure: tests still failing");
    }
}
