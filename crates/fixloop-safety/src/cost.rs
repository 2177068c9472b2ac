//! Cost Tracker
//!
//! Every costed oracle call goes through `reserve` first, then either
//! `commit` (with what the call actually cost) or `release` (call never
//! billed). A reservation counts against both ceilings while outstanding,
//! so concurrent sessions cannot jointly overshoot the daily cap.
//!
//! A commit is never charged more than its reservation held. Oracle calls
//! reserve through [`CostTracker::reserve_call`], which bounds the prompt at
//! one token per byte and shrinks the completion allowance to what still
//! fits under both ceilings.

use crate::error::CostDenied;
use chrono::{NaiveDate, Utc};
use fixloop_kernel::{SessionId, TokenUsage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

const MICROS_PER_DOLLAR: u64 = 1_000_000;
const TOKENS_PER_MTOK: u128 = 1_000_000;
/// Message framing the API adds around a prompt
const FRAMING_TOKENS: u64 = 32;
/// Finished sessions whose ledgers stay itemised by default
const DEFAULT_RETAINED_SESSIONS: usize = 256;

/// Money in integer micro-dollars
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Usd(pub u64);

impl Usd {
    /// Zero dollars
    pub const ZERO: Usd = Usd(0);

    /// Convert from a dollar amount; negative and NaN clamp to zero
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_dollars(dollars: f64) -> Self {
        if dollars.is_nan() || dollars <= 0.0 {
            return Self::ZERO;
        }
        Self((dollars * MICROS_PER_DOLLAR as f64).round() as u64)
    }

    /// Dollar amount for display
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_dollars(self) -> f64 {
        self.0 as f64 / MICROS_PER_DOLLAR as f64
    }

    /// Saturating sum
    #[inline]
    #[must_use]
    pub fn saturating_add(self, other: Usd) -> Usd {
        Usd(self.0.saturating_add(other.0))
    }

    /// Saturating difference
    #[inline]
    #[must_use]
    pub fn saturating_sub(self, other: Usd) -> Usd {
        Usd(self.0.saturating_sub(other.0))
    }
}

impl std::fmt::Display for Usd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${:.4}", self.as_dollars())
    }
}

/// Per-million-token prices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    /// Price per million prompt tokens
    pub input_per_mtok: Usd,
    /// Price per million completion tokens
    pub output_per_mtok: Usd,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            input_per_mtok: Usd::from_dollars(3.0),
            output_per_mtok: Usd::from_dollars(15.0),
        }
    }
}

impl Pricing {
    /// Cost of a completed call, rounded up to the next micro-dollar
    #[must_use]
    pub fn cost(&self, usage: TokenUsage) -> Usd {
        let micros = u128::from(usage.input) * u128::from(self.input_per_mtok.0)
            + u128::from(usage.output) * u128::from(self.output_per_mtok.0);
        let rounded = micros.div_ceil(TOKENS_PER_MTOK);
        Usd(u64::try_from(rounded).unwrap_or(u64::MAX))
    }

    /// Upper bound for a call that has not happened yet
    ///
    /// No tokenizer emits more tokens than the prompt has bytes, so the
    /// prompt is counted at one token per byte plus framing, and the
    /// completion at its full allowance.
    #[must_use]
    pub fn estimate(&self, prompt_bytes: usize, max_tokens: u32) -> Usd {
        self.cost(TokenUsage::new(prompt_token_bound(prompt_bytes), u64::from(max_tokens)))
    }

    /// Most completion tokens affordable within `room` after `input` prompt tokens
    ///
    /// `None` when the prompt alone does not fit.
    #[must_use]
    pub fn affordable_output(&self, input: u64, room: Usd) -> Option<u64> {
        let budget = u128::from(room.0) * TOKENS_PER_MTOK;
        let prompt = u128::from(input) * u128::from(self.input_per_mtok.0);
        let left = budget.checked_sub(prompt)?;
        if self.output_per_mtok.0 == 0 {
            return Some(u64::MAX);
        }
        Some(u64::try_from(left / u128::from(self.output_per_mtok.0)).unwrap_or(u64::MAX))
    }
}

/// Prompt tokens a prompt of `bytes` bytes can possibly use
#[must_use]
pub fn prompt_token_bound(bytes: usize) -> u64 {
    u64::try_from(bytes).unwrap_or(u64::MAX).saturating_add(FRAMING_TOKENS)
}

/// Configured ceilings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostLimits {
    /// Most any one session may spend
    pub per_session: Usd,
    /// Most all sessions together may spend per UTC day
    pub daily: Usd,
    /// Fraction of `daily` at which a one-off warning is raised
    pub warn_fraction: f64,
}

impl Default for CostLimits {
    fn default() -> Self {
        Self {
            per_session: Usd::from_dollars(2.0),
            daily: Usd::from_dollars(10.0),
            warn_fraction: 0.8,
        }
    }
}

/// Proof of a successful `reserve`; consumed by `commit` or `release`
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a reservation holds budget until it is committed or released"]
pub struct Reservation {
    id: u64,
    session: SessionId,
    amount: Usd,
    max_output: Option<u32>,
}

impl Reservation {
    /// Session the reservation belongs to
    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Amount held
    #[must_use]
    pub fn amount(&self) -> Usd {
        self.amount
    }

    /// Completion allowance the held amount covers, for call reservations
    #[must_use]
    pub fn max_output(&self) -> Option<u32> {
        self.max_output
    }
}

/// What a commit changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Amount charged, never more than was reserved
    pub charged: Usd,
    /// What the reported usage would have cost at list price
    pub reported: Usd,
    /// Session total after the charge
    pub session_total: Usd,
    /// Today's total after the charge
    pub daily_total: Usd,
    /// Set exactly once per day, on the commit that crosses the warning line
    pub crossed_warning: bool,
}

/// Per-session spend in the usage summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSpend {
    /// Session
    pub session: SessionId,
    /// Committed spend
    pub spent: Usd,
    /// Oracle calls billed
    pub calls: u64,
}

/// Snapshot for the `cost` operator command and periodic summaries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    /// Current UTC day
    pub day: NaiveDate,
    /// Spent today
    pub daily_spend: Usd,
    /// Daily ceiling
    pub daily_limit: Usd,
    /// Reserved but not committed
    pub outstanding: Usd,
    /// Spent since start
    pub global_spend: Usd,
    /// Calls billed since start
    pub calls: u64,
    /// Prompt tokens since start
    pub input_tokens: u64,
    /// Completion tokens since start
    pub output_tokens: u64,
    /// Per-session breakdown, most expensive first
    pub sessions: Vec<SessionSpend>,
    /// Finished sessions no longer itemised; their spend stays in the totals
    #[serde(default)]
    pub folded_sessions: u64,
}

impl UsageSummary {
    /// Fraction of today's ceiling already spent
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn daily_fraction(&self) -> f64 {
        if self.daily_limit.0 == 0 {
            return 1.0;
        }
        self.daily_spend.0 as f64 / self.daily_limit.0 as f64
    }
}

#[derive(Debug, Default)]
struct SessionLedger {
    committed: Usd,
    outstanding: Usd,
    calls: u64,
}

#[derive(Debug)]
struct Ledger {
    day: NaiveDate,
    daily_committed: Usd,
    outstanding: Usd,
    global_committed: Usd,
    calls: u64,
    input_tokens: u64,
    output_tokens: u64,
    warned_day: Option<NaiveDate>,
    next_reservation: u64,
    sessions: HashMap<SessionId, SessionLedger>,
    closed: VecDeque<SessionId>,
    folded_sessions: u64,
}

impl Ledger {
    fn roll_to(&mut self, today: NaiveDate) {
        if today != self.day {
            tracing::info!(from = %self.day, to = %today, spent = %self.daily_committed, "daily cost ledger rolled over");
            self.day = today;
            self.daily_committed = Usd::ZERO;
        }
    }

    /// Room left under each ceiling for `session`: (session, daily)
    fn room(&self, session: SessionId, limits: &CostLimits) -> (Usd, Usd) {
        let (committed, outstanding) = self.session_totals(session);
        (
            limits.per_session.saturating_sub(committed.saturating_add(outstanding)),
            limits
                .daily
                .saturating_sub(self.daily_committed.saturating_add(self.outstanding)),
        )
    }

    fn session_totals(&self, session: SessionId) -> (Usd, Usd) {
        self.sessions
            .get(&session)
            .map_or((Usd::ZERO, Usd::ZERO), |s| (s.committed, s.outstanding))
    }

    fn denial(&self, session: SessionId, requested: Usd, limits: &CostLimits) -> CostDenied {
        let (session_room, daily_room) = self.room(session, limits);
        if session_room <= daily_room {
            let (committed, outstanding) = self.session_totals(session);
            CostDenied::SessionCeiling {
                session,
                committed,
                outstanding,
                requested,
                cap: limits.per_session,
            }
        } else {
            CostDenied::DailyCeiling {
                committed: self.daily_committed,
                outstanding: self.outstanding,
                requested,
                cap: limits.daily,
            }
        }
    }

    fn hold(&mut self, session: SessionId, amount: Usd, max_output: Option<u32>) -> Reservation {
        self.outstanding = self.outstanding.saturating_add(amount);
        let entry = self.sessions.entry(session).or_default();
        entry.outstanding = entry.outstanding.saturating_add(amount);
        let id = self.next_reservation;
        self.next_reservation += 1;
        Reservation {
            id,
            session,
            amount,
            max_output,
        }
    }
}

type DaySource = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

/// Cross-session spend ledger with per-session and daily ceilings
pub struct CostTracker {
    limits: CostLimits,
    pricing: Pricing,
    retained_sessions: usize,
    today: DaySource,
    ledger: Mutex<Ledger>,
}

impl std::fmt::Debug for CostTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostTracker")
            .field("limits", &self.limits)
            .field("pricing", &self.pricing)
            .finish_non_exhaustive()
    }
}

impl CostTracker {
    /// Tracker on the UTC wall clock
    #[must_use]
    pub fn new(limits: CostLimits, pricing: Pricing) -> Self {
        Self::with_day_source(limits, pricing, Arc::new(|| Utc::now().date_naive()))
    }

    /// Tracker whose notion of "today" comes from `today`
    #[must_use]
    pub fn with_day_source(limits: CostLimits, pricing: Pricing, today: DaySource) -> Self {
        let day = today();
        Self {
            limits,
            pricing,
            retained_sessions: DEFAULT_RETAINED_SESSIONS,
            today,
            ledger: Mutex::new(Ledger {
                day,
                daily_committed: Usd::ZERO,
                outstanding: Usd::ZERO,
                global_committed: Usd::ZERO,
                calls: 0,
                input_tokens: 0,
                output_tokens: 0,
                warned_day: None,
                next_reservation: 0,
                sessions: HashMap::new(),
                closed: VecDeque::new(),
                folded_sessions: 0,
            }),
        }
    }

    /// Keep itemised ledgers for at most `n` finished sessions
    #[must_use]
    pub fn with_retained_sessions(mut self, n: usize) -> Self {
        self.retained_sessions = n;
        self
    }

    /// Configured ceilings
    #[must_use]
    pub fn limits(&self) -> CostLimits {
        self.limits
    }

    /// Configured prices
    #[must_use]
    pub fn pricing(&self) -> Pricing {
        self.pricing
    }

    /// Hold `estimate` against both ceilings before a costed call.
    ///
    /// # Errors
    /// [`CostDenied`] when either ceiling would be crossed; nothing is held.
    pub fn reserve(&self, session: SessionId, estimate: Usd) -> Result<Reservation, CostDenied> {
        let mut ledger = self.ledger.lock();
        ledger.roll_to((self.today)());

        let (session_room, daily_room) = ledger.room(session, &self.limits);
        if estimate > session_room.min(daily_room) {
            return Err(ledger.denial(session, estimate, &self.limits));
        }
        Ok(ledger.hold(session, estimate, None))
    }

    /// Reserve an oracle call of `prompt_bytes` with up to `max_tokens` of completion.
    ///
    /// The completion allowance shrinks to what both ceilings still allow;
    /// [`Reservation::max_output`] carries the allowance to pass to the oracle.
    ///
    /// # Errors
    /// [`CostDenied`] when not even `min_tokens` of completion fit.
    pub fn reserve_call(
        &self,
        session: SessionId,
        prompt_bytes: usize,
        max_tokens: u32,
        min_tokens: u32,
    ) -> Result<Reservation, CostDenied> {
        let input = prompt_token_bound(prompt_bytes);
        let floor = min_tokens.min(max_tokens);
        let mut ledger = self.ledger.lock();
        ledger.roll_to((self.today)());

        let (session_room, daily_room) = ledger.room(session, &self.limits);
        let affordable = match self.pricing.affordable_output(input, session_room.min(daily_room)) {
            Some(tokens) if tokens >= u64::from(floor) => tokens,
            _ => {
                let requested = self.pricing.cost(TokenUsage::new(input, u64::from(floor)));
                return Err(ledger.denial(session, requested, &self.limits));
            }
        };
        let allowance = u32::try_from(affordable).unwrap_or(u32::MAX).min(max_tokens);
        if allowance < max_tokens {
            tracing::debug!(%session, allowance, max_tokens, "completion allowance shrunk to fit budget");
        }
        let amount = self.pricing.cost(TokenUsage::new(input, u64::from(allowance)));
        Ok(ledger.hold(session, amount, Some(allowance)))
    }

    /// Replace a reservation with the real cost of the call
    pub fn commit(&self, reservation: Reservation, usage: TokenUsage) -> CommitReceipt {
        let reported = self.pricing.cost(usage);
        let charged = reported.min(reservation.amount);
        if reported > charged {
            tracing::warn!(
                session = %reservation.session,
                reported = %reported,
                reserved = %reservation.amount,
                "reported usage exceeds the reservation, charge capped"
            );
        }
        let mut ledger = self.ledger.lock();
        ledger.roll_to((self.today)());

        ledger.outstanding = ledger.outstanding.saturating_sub(reservation.amount);
        ledger.daily_committed = ledger.daily_committed.saturating_add(charged);
        ledger.global_committed = ledger.global_committed.saturating_add(charged);
        ledger.calls += 1;
        ledger.input_tokens += usage.input;
        ledger.output_tokens += usage.output;

        let entry = ledger.sessions.entry(reservation.session).or_default();
        entry.outstanding = entry.outstanding.saturating_sub(reservation.amount);
        entry.committed = entry.committed.saturating_add(charged);
        entry.calls += 1;
        let session_total = entry.committed;

        let daily_total = ledger.daily_committed;
        let warn_line = Usd::from_dollars(self.limits.daily.as_dollars() * self.limits.warn_fraction);
        let crossed_warning = daily_total >= warn_line && ledger.warned_day != Some(ledger.day);
        if crossed_warning {
            ledger.warned_day = Some(ledger.day);
            tracing::warn!(spent = %daily_total, limit = %self.limits.daily, "daily spend crossed warning threshold");
        }

        tracing::debug!(
            session = %reservation.session,
            reservation = reservation.id,
            charged = %charged,
            session_total = %session_total,
            "cost committed"
        );
        CommitReceipt {
            charged,
            reported,
            session_total,
            daily_total,
            crossed_warning,
        }
    }

    /// Drop a reservation whose call was never billed
    pub fn release(&self, reservation: Reservation) {
        let mut ledger = self.ledger.lock();
        ledger.outstanding = ledger.outstanding.saturating_sub(reservation.amount);
        if let Some(entry) = ledger.sessions.get_mut(&reservation.session) {
            entry.outstanding = entry.outstanding.saturating_sub(reservation.amount);
        }
    }

    /// Stop itemising a finished session once enough newer ones have finished
    ///
    /// Its spend stays in the daily and global totals.
    pub fn close_session(&self, session: SessionId) {
        let mut ledger = self.ledger.lock();
        if !ledger.sessions.contains_key(&session) || ledger.closed.contains(&session) {
            return;
        }
        ledger.closed.push_back(session);
        while ledger.closed.len() > self.retained_sessions {
            let Some(oldest) = ledger.closed.pop_front() else {
                break;
            };
            if ledger.sessions.remove(&oldest).is_some() {
                ledger.folded_sessions += 1;
            }
        }
    }

    /// Total committed since start, across all days
    #[must_use]
    pub fn global_spend(&self) -> Usd {
        self.ledger.lock().global_committed
    }

    /// Committed today
    #[must_use]
    pub fn daily_spend(&self) -> Usd {
        let mut ledger = self.ledger.lock();
        ledger.roll_to((self.today)());
        ledger.daily_committed
    }

    /// Committed by one session; zero once its ledger has been folded
    #[must_use]
    pub fn session_spend(&self, session: SessionId) -> Usd {
        self.ledger
            .lock()
            .sessions
            .get(&session)
            .map_or(Usd::ZERO, |s| s.committed)
    }

    /// True once today's committed plus outstanding spend has reached the cap
    #[must_use]
    pub fn daily_exhausted(&self) -> bool {
        let mut ledger = self.ledger.lock();
        ledger.roll_to((self.today)());
        ledger.daily_committed.saturating_add(ledger.outstanding) >= self.limits.daily
    }

    /// Snapshot of all counters
    #[must_use]
    pub fn usage_summary(&self) -> UsageSummary {
        let mut ledger = self.ledger.lock();
        ledger.roll_to((self.today)());
        let mut sessions: Vec<SessionSpend> = ledger
            .sessions
            .iter()
            .filter(|(_, s)| s.calls > 0)
            .map(|(id, s)| SessionSpend {
                session: *id,
                spent: s.committed,
                calls: s.calls,
            })
            .collect();
        sessions.sort_by(|a, b| b.spent.cmp(&a.spent).then(a.session.cmp(&b.session)));
        UsageSummary {
            day: ledger.day,
            daily_spend: ledger.daily_committed,
            daily_limit: self.limits.daily,
            outstanding: ledger.outstanding,
            global_spend: ledger.global_committed,
            calls: ledger.calls,
            input_tokens: ledger.input_tokens,
            output_tokens: ledger.output_tokens,
            sessions,
            folded_sessions: ledger.folded_sessions,
        }
    }
}
