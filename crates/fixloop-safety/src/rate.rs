//! Rate Limiter
//!
//! Fixed-window counters, one per external surface. Each window is a shared
//! bucket plus a per-caller draw cap so one busy session cannot drain the
//! bucket for everyone else.

use fixloop_kernel::SessionId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// External surface being rate limited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Surface {
    /// Reasoning oracle
    Oracle,
    /// Chat transport
    Chat,
}

/// Who is drawing from a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Caller {
    /// A fix session; subject to the per-session cap
    Session(SessionId),
    /// Coordinator itself (summaries, operator replies); bucket only
    System,
}

/// Window configuration for one surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Grants per window across all callers
    pub limit: u32,
    /// Window length in seconds
    pub window_secs: u64,
    /// Grants per window for any single session
    pub per_session_cap: u32,
}

impl RateLimit {
    /// Oracle default: 100 calls per hour, 25 per session
    #[must_use]
    pub fn oracle_default() -> Self {
        Self {
            limit: 100,
            window_secs: 3600,
            per_session_cap: 25,
        }
    }

    /// Chat default: 30 messages per minute, 10 per session
    #[must_use]
    pub fn chat_default() -> Self {
        Self {
            limit: 30,
            window_secs: 60,
            per_session_cap: 10,
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Result of `acquire`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// Proceed now
    Granted,
    /// Try again after this long (the current window's remaining time)
    MustWait(Duration),
}

/// Per-surface usage snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStats {
    /// Grants in the current window
    pub used: u32,
    /// Configured limit
    pub limit: u32,
    /// Time until the window resets
    pub resets_in: Duration,
}

#[derive(Debug)]
struct Window {
    config: RateLimit,
    started: Instant,
    used: u32,
    per_session: HashMap<SessionId, u32>,
}

impl Window {
    fn new(config: RateLimit) -> Self {
        Self {
            config,
            started: Instant::now(),
            used: 0,
            per_session: HashMap::new(),
        }
    }

    fn advance(&mut self, now: Instant) {
        let window = self.config.window();
        if now.duration_since(self.started) >= window {
            // Align to window boundaries so resets are predictable.
            let elapsed = now.duration_since(self.started);
            let windows = elapsed.as_nanos() / window.as_nanos().max(1);
            let skip = u32::try_from(windows).unwrap_or(u32::MAX);
            self.started += window.saturating_mul(skip);
            self.used = 0;
            self.per_session.clear();
        }
    }

    fn remaining(&self, now: Instant) -> Duration {
        (self.started + self.config.window()).saturating_duration_since(now)
    }
}

/// Shared limiter for every surface
#[derive(Debug)]
pub struct RateLimiter {
    oracle: Mutex<Window>,
    chat: Mutex<Window>,
}

impl RateLimiter {
    /// Limiter with one window per surface
    #[must_use]
    pub fn new(oracle: RateLimit, chat: RateLimit) -> Self {
        Self {
            oracle: Mutex::new(Window::new(oracle)),
            chat: Mutex::new(Window::new(chat)),
        }
    }

    fn window(&self, surface: Surface) -> &Mutex<Window> {
        match surface {
            Surface::Oracle => &self.oracle,
            Surface::Chat => &self.chat,
        }
    }

    /// Take one unit from `surface`, or learn how long to wait
    pub fn acquire(&self, surface: Surface, caller: Caller) -> Acquire {
        let now = Instant::now();
        let mut w = self.window(surface).lock();
        w.advance(now);

        if w.used >= w.config.limit {
            return Acquire::MustWait(w.remaining(now));
        }
        if let Caller::Session(id) = caller {
            let drawn = w.per_session.get(&id).copied().unwrap_or(0);
            if drawn >= w.config.per_session_cap {
                tracing::debug!(session = %id, ?surface, drawn, "per-session rate cap reached");
                return Acquire::MustWait(w.remaining(now));
            }
            w.per_session.insert(id, drawn + 1);
        }
        w.used += 1;
        Acquire::Granted
    }

    /// Suspend until a unit of `surface` is granted
    pub async fn wait(&self, surface: Surface, caller: Caller) {
        loop {
            match self.acquire(surface, caller) {
                Acquire::Granted => return,
                Acquire::MustWait(delay) => {
                    tracing::info!(?surface, wait_ms = delay.as_millis() as u64, "rate limited, waiting for window reset");
                    // A zero delay means the window boundary is now; yield once.
                    tokio::time::sleep(delay.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    /// Usage of one surface
    #[must_use]
    pub fn stats(&self, surface: Surface) -> WindowStats {
        let now = Instant::now();
        let mut w = self.window(surface).lock();
        w.advance(now);
        WindowStats {
            used: w.used,
            limit: w.config.limit,
            resets_in: w.remaining(now),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimit::oracle_default(), RateLimit::chat_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(limit: u32, per_session_cap: u32) -> RateLimiter {
        let cfg = RateLimit {
            limit,
            window_secs: 60,
            per_session_cap,
        };
        RateLimiter::new(cfg, cfg)
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_exhaustion_reports_time_to_reset() {
        let rl = limiter(2, 10);
        assert_eq!(rl.acquire(Surface::Oracle, Caller::System), Acquire::Granted);
        assert_eq!(rl.acquire(Surface::Oracle, Caller::System), Acquire::Granted);
        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(
            rl.acquire(Surface::Oracle, Caller::System),
            Acquire::MustWait(Duration::from_secs(45))
        );
        // Surfaces are independent.
        assert_eq!(rl.acquire(Surface::Chat, Caller::System), Acquire::Granted);
    }

    #[tokio::test(start_paused = true)]
    async fn per_session_cap_leaves_room_for_others() {
        let rl = limiter(10, 2);
        let greedy = SessionId::new();
        let other = SessionId::new();
        for _ in 0..2 {
            assert_eq!(rl.acquire(Surface::Oracle, Caller::Session(greedy)), Acquire::Granted);
        }
        assert!(matches!(
            rl.acquire(Surface::Oracle, Caller::Session(greedy)),
            Acquire::MustWait(_)
        ));
        assert_eq!(rl.acquire(Surface::Oracle, Caller::Session(other)), Acquire::Granted);
        assert_eq!(rl.stats(Surface::Oracle).used, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_expiry() {
        let rl = limiter(1, 1);
        let s = SessionId::new();
        assert_eq!(rl.acquire(Surface::Oracle, Caller::Session(s)), Acquire::Granted);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(rl.acquire(Surface::Oracle, Caller::Session(s)), Acquire::Granted);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_suspends_until_window_resets() {
        let rl = Arc::new(limiter(1, 5));
        rl.wait(Surface::Oracle, Caller::System).await;

        let start = Instant::now();
        rl.wait(Surface::Oracle, Caller::System).await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }
}
