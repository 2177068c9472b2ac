//! Worker errors
//!
//! A worker that ran and reported failure (tests red, merge conflict) is
//! not an error: it returns a [`WorkerReport`](crate::WorkerReport) with
//! `success = false`. Errors are reserved for failing to run at all.

/// Failure to invoke an external tool
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    /// Tool or service temporarily unreachable (timeout, network); retry is safe
    #[error("worker unavailable: {0}")]
    Unavailable(String),

    /// Tool missing or invoked wrongly; retrying will not help
    #[error("worker invocation failed: {0}")]
    Invocation(String),
}

impl WorkerError {
    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
