//! Learning store errors

use fixloop_kernel::LogError;

/// Failures reading or writing the lesson ledger
#[derive(Debug, thiserror::Error)]
pub enum LearningError {
    /// Backing file could not be read or appended
    #[error("lesson store I/O: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted line is not a ledger record
    #[error("lesson store line {line} is malformed: {source}")]
    Decode {
        /// One-based line number
        line: usize,
        /// Parse failure
        source: serde_json::Error,
    },

    /// Hash chain broken or record not encodable
    #[error(transparent)]
    Log(#[from] LogError),
}
