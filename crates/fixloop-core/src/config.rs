//! Coordinator configuration
//!
//! Loaded from TOML, then overridden from the environment, then validated.
//! Every ceiling and retry cap lives here rather than in code.

use crate::error::ConfigError;
use fixloop_safety::{CostLimits, Pricing, RateLimit, Usd};
use fixloop_workers::WorkerSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment override for the daily budget, in dollars
pub const ENV_DAILY_COST_LIMIT: &str = "MASTERMIND_DAILY_COST_LIMIT";
/// Environment override for the live-session limit
pub const ENV_MAX_CONCURRENT_FIXES: &str = "MASTERMIND_MAX_CONCURRENT_FIXES";
/// Environment override for the repository checkout
pub const ENV_REPO_PATH: &str = "MASTERMIND_REPO_PATH";

/// Spend ceilings, in dollars
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Most one session may spend
    pub per_session_usd: f64,
    /// Most all sessions may spend per UTC day
    pub daily_usd: f64,
    /// Fraction of the daily budget that triggers a warning
    pub warn_fraction: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            per_session_usd: 2.0,
            daily_usd: 10.0,
            warn_fraction: 0.8,
        }
    }
}

/// Oracle prices in dollars per million tokens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Prompt tokens
    pub input_per_mtok: f64,
    /// Completion tokens
    pub output_per_mtok: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
        }
    }
}

/// Rate windows per external surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Reasoning oracle
    pub oracle: RateLimit,
    /// Chat egress
    pub chat: RateLimit,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            oracle: RateLimit::oracle_default(),
            chat: RateLimit::chat_default(),
        }
    }
}

/// Per-session retry caps and prompt sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Oracle attempts per STRATEGIZING entry, transient retries included
    pub max_strategy_retries: u32,
    /// Test-failure repair loops before the session fails
    pub max_repair_attempts: u32,
    /// Lint/format repairs driven by CI
    pub max_ci_fix_attempts: u32,
    /// Re-runs of CI checks that failed for unknown reasons or timed out
    pub max_ci_retries: u32,
    /// Retries of a worker call that reported itself unavailable
    pub max_transient_retries: u32,
    /// First backoff delay; doubles per attempt
    pub backoff_base_ms: u64,
    /// Completion budget for strategy prompts
    pub strategy_max_tokens: u32,
    /// Smallest completion budget worth a call once the session cap squeezes it
    pub strategy_min_tokens: u32,
    /// Lessons placed in a strategy prompt
    pub lesson_limit: usize,
    /// Rebuild and health-check the service after a merge
    pub redeploy_after_merge: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_strategy_retries: 3,
            max_repair_attempts: 2,
            max_ci_fix_attempts: 3,
            max_ci_retries: 2,
            max_transient_retries: 3,
            backoff_base_ms: 500,
            strategy_max_tokens: 6000,
            strategy_min_tokens: 1024,
            lesson_limit: 5,
            redeploy_after_merge: false,
        }
    }
}

impl SessionConfig {
    /// Backoff before retry number `attempt` (1-based), capped at 30s
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor)).min(Duration::from_secs(30))
    }
}

/// Learning store location
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// JSON-lines file; in-memory when unset
    pub store_path: Option<PathBuf>,
}

/// Reasoning oracle endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Base URL of the messages API
    pub endpoint: String,
    /// Model name
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Per-request timeout
    pub request_timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.anthropic.com".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            request_timeout_secs: 120,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MastermindConfig {
    /// Sessions allowed to run at once
    pub max_live_sessions: usize,
    /// Spend ceilings
    pub budget: BudgetConfig,
    /// Oracle prices
    pub pricing: PricingConfig,
    /// Rate windows
    pub rate: RateConfig,
    /// Session retry caps
    pub session: SessionConfig,
    /// Worker tooling
    pub workers: WorkerSettings,
    /// Learning store
    pub learning: LearningConfig,
    /// Oracle endpoint
    pub oracle: OracleConfig,
    /// Coordinator tick period
    pub tick_interval_ms: u64,
    /// Period of the cost-summary notification; zero disables it
    pub cost_summary_interval_secs: u64,
    /// Finished sessions kept for `retry` and per-session cost detail
    pub archive_limit: usize,
}

impl Default for MastermindConfig {
    fn default() -> Self {
        Self {
            max_live_sessions: 3,
            budget: BudgetConfig::default(),
            pricing: PricingConfig::default(),
            rate: RateConfig::default(),
            session: SessionConfig::default(),
            workers: WorkerSettings::default(),
            learning: LearningConfig::default(),
            oracle: OracleConfig::default(),
            tick_interval_ms: 1000,
            cost_summary_interval_secs: 3600,
            archive_limit: 256,
        }
    }
}

impl MastermindConfig {
    /// Create default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a TOML file; missing keys take their defaults
    ///
    /// # Errors
    /// [`ConfigError::Io`] or [`ConfigError::Parse`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parse TOML text
    ///
    /// # Errors
    /// [`ConfigError::Parse`] on malformed TOML or mistyped keys.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `MASTERMIND_*` overrides from the process environment
    ///
    /// # Errors
    /// [`ConfigError::Env`] when a variable is set but unparsable.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup
    ///
    /// # Errors
    /// [`ConfigError::Env`] when a variable is set but unparsable.
    pub fn apply_env_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(raw) = lookup(ENV_DAILY_COST_LIMIT) {
            self.budget.daily_usd = raw.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_DAILY_COST_LIMIT,
                value: raw.clone(),
            })?;
        }
        if let Some(raw) = lookup(ENV_MAX_CONCURRENT_FIXES) {
            self.max_live_sessions = raw.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_MAX_CONCURRENT_FIXES,
                value: raw.clone(),
            })?;
        }
        if let Some(raw) = lookup(ENV_REPO_PATH) {
            if !raw.trim().is_empty() {
                self.workers.repo_path = PathBuf::from(raw.trim());
            }
        }
        Ok(self)
    }

    /// Reject configurations no session could run under
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.max_live_sessions == 0 {
            return invalid("max_live_sessions must be at least 1");
        }
        if !positive(self.budget.per_session_usd) {
            return invalid("budget.per_session_usd must be positive");
        }
        if !positive(self.budget.daily_usd) {
            return invalid("budget.daily_usd must be positive");
        }
        if self.budget.per_session_usd > self.budget.daily_usd {
            return invalid("budget.per_session_usd exceeds budget.daily_usd");
        }
        if !(0.0..=1.0).contains(&self.budget.warn_fraction) {
            return invalid("budget.warn_fraction must be within 0..=1");
        }
        if self.pricing.input_per_mtok < 0.0 || self.pricing.output_per_mtok < 0.0 {
            return invalid("pricing must not be negative");
        }
        for (name, rate) in [("rate.oracle", self.rate.oracle), ("rate.chat", self.rate.chat)] {
            if rate.limit == 0 || rate.window_secs == 0 || rate.per_session_cap == 0 {
                return Err(ConfigError::Invalid(format!("{name} limits must be non-zero")));
            }
        }
        if self.session.max_strategy_retries == 0 {
            return invalid("session.max_strategy_retries must be at least 1");
        }
        if self.session.strategy_max_tokens == 0 {
            return invalid("session.strategy_max_tokens must be non-zero");
        }
        if self.session.strategy_min_tokens == 0
            || self.session.strategy_min_tokens > self.session.strategy_max_tokens
        {
            return invalid("session.strategy_min_tokens must be in 1..=strategy_max_tokens");
        }
        if self.archive_limit == 0 {
            return invalid("archive_limit must be non-zero");
        }
        if self.workers.test_command.is_empty() {
            return invalid("workers.test_command is empty");
        }
        if self.tick_interval_ms == 0 {
            return invalid("tick_interval_ms must be non-zero");
        }
        Ok(())
    }

    /// Ceilings for the cost tracker
    #[must_use]
    pub fn cost_limits(&self) -> CostLimits {
        CostLimits {
            per_session: Usd::from_dollars(self.budget.per_session_usd),
            daily: Usd::from_dollars(self.budget.daily_usd),
            warn_fraction: self.budget.warn_fraction,
        }
    }

    /// Prices for the cost tracker
    #[must_use]
    pub fn pricing(&self) -> Pricing {
        Pricing {
            input_per_mtok: Usd::from_dollars(self.pricing.input_per_mtok),
            output_per_mtok: Usd::from_dollars(self.pricing.output_per_mtok),
        }
    }

    /// Tick period
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// With live-session limit
    #[must_use]
    pub fn with_max_live_sessions(mut self, n: usize) -> Self {
        self.max_live_sessions = n;
        self
    }

    /// With the number of finished sessions remembered
    #[must_use]
    pub fn with_archive_limit(mut self, n: usize) -> Self {
        self.archive_limit = n;
        self
    }

    /// With per-session budget in dollars
    #[must_use]
    pub fn with_session_budget(mut self, usd: f64) -> Self {
        self.budget.per_session_usd = usd;
        self
    }

    /// With daily budget in dollars
    #[must_use]
    pub fn with_daily_budget(mut self, usd: f64) -> Self {
        self.budget.daily_usd = usd;
        self
    }

    /// With repair-loop bound
    #[must_use]
    pub fn with_max_repair_attempts(mut self, n: u32) -> Self {
        self.session.max_repair_attempts = n;
        self
    }

    /// With session settings
    #[must_use]
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// With worker settings
    #[must_use]
    pub fn with_workers(mut self, workers: WorkerSettings) -> Self {
        self.workers = workers;
        self
    }

    /// With learning store path
    #[must_use]
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.learning.store_path = Some(path.into());
        self
    }
}

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_valid() {
        let config = MastermindConfig::new();
        config.validate().unwrap();
        assert_eq!(config.max_live_sessions, 3);
        assert_eq!(config.session.max_repair_attempts, 2);
        assert_eq!(config.cost_limits().daily, Usd::from_dollars(10.0));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = MastermindConfig::from_toml(
            r#"
            max_live_sessions = 5

            [budget]
            daily_usd = 25.0

            [session]
            max_repair_attempts = 4

            [workers]
            repo_path = "/srv/app"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_live_sessions, 5);
        assert_eq!(config.budget.daily_usd, 25.0);
        assert_eq!(config.budget.per_session_usd, 2.0);
        assert_eq!(config.session.max_repair_attempts, 4);
        assert_eq!(config.session.max_ci_retries, 2);
        assert_eq!(config.workers.repo_path, PathBuf::from("/srv/app"));
        assert_eq!(config.workers.base_branch, "main");
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = MastermindConfig::from_toml("max_live_sessions = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let config = MastermindConfig::new()
            .apply_env_from(|key| match key {
                ENV_DAILY_COST_LIMIT => Some("42.5".to_string()),
                ENV_MAX_CONCURRENT_FIXES => Some("7".to_string()),
                ENV_REPO_PATH => Some("/repo".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.budget.daily_usd, 42.5);
        assert_eq!(config.max_live_sessions, 7);
        assert_eq!(config.workers.repo_path, PathBuf::from("/repo"));
    }

    #[test]
    fn bad_env_value_is_reported() {
        let err = MastermindConfig::new()
            .apply_env_from(|key| (key == ENV_MAX_CONCURRENT_FIXES).then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: ENV_MAX_CONCURRENT_FIXES, .. }));
    }

    #[test]
    fn validation_catches_inverted_budgets() {
        let config = MastermindConfig::new().with_session_budget(20.0).with_daily_budget(5.0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(MastermindConfig::new().with_max_live_sessions(0).validate().is_err());
    }

    #[test]
    fn completion_floor_must_fit_under_the_allowance() {
        let mut config = MastermindConfig::new();
        config.session.strategy_min_tokens = config.session.strategy_max_tokens + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.session.strategy_min_tokens = config.session.strategy_max_tokens;
        assert!(config.validate().is_ok());
        assert!(MastermindConfig::new().with_archive_limit(0).validate().is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let session = SessionConfig::default();
        assert_eq!(session.backoff(1), Duration::from_millis(500));
        assert_eq!(session.backoff(2), Duration::from_millis(1000));
        assert_eq!(session.backoff(3), Duration::from_millis(2000));
        assert_eq!(session.backoff(40), Duration::from_secs(30));
    }
}
