//! Fixloop core: the Mastermind coordinator
//!
//! Turns issue reports into merged fixes:
//! - [`Coordinator`]: admission, FIFO queue, live-session supervision, operator commands
//! - [`SessionManager`]: one fix session through STRATEGIZING → EDITING → TESTING →
//!   REVIEWING → MERGING, with bounded repair loops
//! - [`plan`]: strategy prompts and plan parsing
//! - [`ingress`] / [`egress`]: the line protocol in and notifications out
//! - [`HttpOracle`]: the reasoning oracle over HTTP
//!
//! # Example
//!
//! ```rust,ignore
//! use fixloop_core::{Coordinator, MastermindConfig, SessionServices};
//!
//! # async fn example(services: SessionServices) {
//! let mut coordinator = Coordinator::new(MastermindConfig::new(), services);
//! coordinator.submit(issue).await;
//! coordinator.run_until_idle().await;
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod config;
pub mod coordinator;
pub mod egress;
pub mod error;
pub mod ingress;
pub mod oracle_http;
pub mod plan;
pub mod session;
pub mod session_manager;

pub use config::{
    BudgetConfig, LearningConfig, MastermindConfig, OracleConfig, PricingConfig, RateConfig,
    SessionConfig,
};
pub use coordinator::{
    Admission, CompletedCounts, Coordinator, DeferReason, RejectReason, StatusSnapshot,
};
pub use egress::{
    ChannelEgress, Egress, JsonLinesEgress, Notification, NotificationKind, RateLimitedEgress,
};
pub use error::{ConfigError, CoordinatorError, FailureKind, SessionFailure};
pub use ingress::{parse_line, IngressMessage, IssueReport, OperatorCommand};
pub use oracle_http::HttpOracle;
pub use plan::{parse_plan, Plan, PlanError};
pub use session::{branch_name, ActionEntry, RetryCounters, SessionRecord, SessionSnapshot};
pub use session_manager::{CancelFlag, SessionManager, SessionOutcome, SessionServices};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
