//! Error types for the safety layer

use crate::cost::Usd;
use fixloop_kernel::SessionId;

/// Why a cost reservation was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CostDenied {
    /// The session's own ceiling would be crossed
    #[error("session {session} budget exceeded: {committed} spent + {outstanding} reserved + {requested} requested > {cap}")]
    SessionCeiling {
        /// Session asking
        session: SessionId,
        /// Already committed by the session
        committed: Usd,
        /// Reserved but not yet committed
        outstanding: Usd,
        /// Size of the refused reservation
        requested: Usd,
        /// Configured per-session cap
        cap: Usd,
    },

    /// The global daily ceiling would be crossed
    #[error("daily budget exceeded: {committed} spent + {outstanding} reserved + {requested} requested > {cap}")]
    DailyCeiling {
        /// Committed today across all sessions
        committed: Usd,
        /// Reserved but not yet committed
        outstanding: Usd,
        /// Size of the refused reservation
        requested: Usd,
        /// Configured daily cap
        cap: Usd,
    },
}

impl CostDenied {
    /// True when the whole coordinator is out of money, not just one session
    #[inline]
    #[must_use]
    pub fn is_global(&self) -> bool {
        matches!(self, Self::DailyCeiling { .. })
    }
}
