//! Fixloop safety layer
//!
//! The only state shared between fix sessions:
//! - [`CostTracker`]: reserve-before-call budget ceilings, per session and per day
//! - [`RateLimiter`]: fixed windows per external surface with per-session draw caps

#![warn(unreachable_pub)]

pub mod cost;
pub mod error;
pub mod rate;

pub use cost::{
    prompt_token_bound, CommitReceipt, CostLimits, CostTracker, Pricing, Reservation, SessionSpend,
    UsageSummary, Usd,
};
pub use error::CostDenied;
pub use rate::{Acquire, Caller, RateLimit, RateLimiter, Surface, WindowStats};
