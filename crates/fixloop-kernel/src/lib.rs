//! Fixloop kernel
//!
//! Shared vocabulary for every other crate in the workspace:
//! - Issue reports, personas and identifiers
//! - The fix-session state machine and its transition table
//! - A hash-chained append-only record log
//! - The reasoning oracle boundary

#![warn(unreachable_pub)]

pub mod error;
pub mod oracle;
pub mod record_log;
pub mod state_machine;
pub mod types;

pub use error::{LogError, OracleError, StateMachineError};
pub use oracle::{Oracle, OracleReply, TokenUsage};
pub use record_log::{Record, RecordLog, GENESIS_HASH};
pub use state_machine::{allowed_transitions, validate_transition, SessionState};
pub use types::{slugify, Category, Issue, IssueId, Persona, SessionId, Severity, ThreadId};
