//! Configuration types.
//!
//! Process settings (paths, ports, poll intervals) come from the environment
//! with defaults. Engagement policy (backoff, scoring, budgets, campaigns) is
//! read from a JSON file and every numeric field in it is required.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::campaign::Campaign;
use crate::error::ConfigError;

/// Process-level settings.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Port for the webhook + reporting HTTP server.
    pub port: u16,
    /// Path to the policy/campaign JSON file.
    pub policy_path: PathBuf,
    /// Directory for rotating log files (stderr only when unset).
    pub log_dir: Option<PathBuf>,
    /// How often the dispatcher drains its queues.
    pub dispatch_interval: Duration,
    /// How often the timer ticker looks for due reply timeouts.
    pub timer_interval: Duration,
    /// Public origin the channel calls back on. Enables webhook signature checks.
    pub public_url: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/lead-engage.db"),
            port: 8080,
            policy_path: PathBuf::from("./lead-engage.json"),
            log_dir: None,
            dispatch_interval: Duration::from_millis(500),
            timer_interval: Duration::from_secs(5),
            public_url: None,
        }
    }
}

impl ServiceConfig {
    /// Build from `LEAD_ENGAGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            db_path: std::env::var("LEAD_ENGAGE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            port: env_parse("LEAD_ENGAGE_PORT")?.unwrap_or(defaults.port),
            policy_path: std::env::var("LEAD_ENGAGE_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.policy_path),
            log_dir: std::env::var("LEAD_ENGAGE_LOG_DIR").ok().map(PathBuf::from),
            dispatch_interval: env_parse("LEAD_ENGAGE_DISPATCH_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.dispatch_interval),
            timer_interval: env_parse("LEAD_ENGAGE_TIMER_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.timer_interval),
            public_url: std::env::var("LEAD_ENGAGE_PUBLIC_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, the first one included.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Add up to 25% random jitter (still capped at `max_backoff_ms`).
    #[serde(default)]
    pub jitter: bool,
}

impl RetryPolicy {
    /// Delay before the attempt that follows `attempts_made` failed attempts.
    pub fn backoff_for_attempt(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1) as i32;
        let base = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_backoff_ms as f64);

        let with_jitter = if self.jitter {
            capped * (1.0 + rand::thread_rng().gen_range(0.0..0.25))
        } else {
            capped
        };

        Duration::from_millis(with_jitter.min(self.max_backoff_ms as f64) as u64)
    }

    /// Whether another attempt is allowed after `attempts_made`.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    fn validate(&self, key: &str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(invalid(key, "max_attempts must be at least 1"));
        }
        if self.multiplier < 1.0 {
            return Err(invalid(key, "multiplier must be >= 1.0"));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(invalid(key, "initial_backoff_ms exceeds max_backoff_ms"));
        }
        Ok(())
    }
}

/// Score update parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringPolicy {
    pub delivered_increment: f64,
    pub positive_reply_base: f64,
    /// Replies faster than this earn a proportional bonus on top of the base.
    pub fast_reply_window_secs: u64,
    pub decay_threshold_secs: u64,
    pub decay_per_day: f64,
}

impl ScoringPolicy {
    fn validate(&self) -> Result<(), ConfigError> {
        let non_negative = [
            ("scoring.delivered_increment", self.delivered_increment),
            ("scoring.positive_reply_base", self.positive_reply_base),
            ("scoring.decay_per_day", self.decay_per_day),
        ];
        for (key, value) in non_negative {
            if value < 0.0 {
                return Err(invalid(key, "must not be negative"));
            }
        }
        Ok(())
    }
}

/// A send budget over a rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateBudget {
    pub max_sends: u32,
    pub window_secs: u64,
}

impl RateBudget {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs as i64)
    }
}

/// Everything the orchestrator reads from the policy file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Transport attempts per outbound action.
    pub delivery_retry: RetryPolicy,
    /// Text-generation attempts per outbound action.
    pub render_retry: RetryPolicy,
    pub scoring: ScoringPolicy,
    /// Budget shared by every campaign sending on the channel.
    pub channel_budget: RateBudget,
    /// Queue depth that raises a process-level alert.
    pub max_queue_depth: usize,
    /// Inbound replies matching one of these (whole word, case-insensitive) opt the lead out.
    #[serde(default)]
    pub opt_out_keywords: Vec<String>,
    /// Receipt error codes treated as fatal. Empty means the channel adapter's defaults.
    #[serde(default)]
    pub fatal_error_codes: Vec<String>,
    pub campaigns: Vec<Campaign>,
}

impl PolicyConfig {
    /// Load and validate the policy file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_json(&raw)?;
        tracing::info!(
            path = %path.display(),
            campaigns = config.campaigns.len(),
            "Loaded policy configuration"
        );
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.delivery_retry.validate("delivery_retry")?;
        self.render_retry.validate("render_retry")?;
        self.scoring.validate()?;
        if self.channel_budget.max_sends == 0 || self.channel_budget.window_secs == 0 {
            return Err(invalid("channel_budget", "max_sends and window_secs must be positive"));
        }
        for campaign in &self.campaigns {
            campaign
                .validate()
                .map_err(|e| invalid("campaigns", &e.to_string()))?;
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let p = policy(false);
        assert_eq!(p.backoff_for_attempt(1), Duration::from_millis(1_000));
        assert_eq!(p.backoff_for_attempt(2), Duration::from_millis(2_000));
        assert_eq!(p.backoff_for_attempt(3), Duration::from_millis(4_000));
        assert_eq!(p.backoff_for_attempt(4), Duration::from_millis(5_000));
        assert_eq!(p.backoff_for_attempt(30), Duration::from_millis(5_000));
    }

    #[test]
    fn jitter_stays_within_cap() {
        let p = policy(true);
        for attempt in 1..10 {
            let d = p.backoff_for_attempt(attempt);
            assert!(d <= Duration::from_millis(5_000));
            assert!(d >= Duration::from_millis(1_000));
        }
    }

    #[test]
    fn attempt_cap() {
        let p = policy(false);
        assert!(p.allows_another(2));
        assert!(!p.allows_another(3));
    }

    #[test]
    fn policy_file_requires_numeric_fields() {
        let err = PolicyConfig::from_json(r#"{"campaigns": []}"#).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn policy_file_rejects_zero_attempts() {
        let raw = r#"{
            "delivery_retry": {"max_attempts": 0, "initial_backoff_ms": 10, "max_backoff_ms": 100, "multiplier": 2.0},
            "render_retry": {"max_attempts": 2, "initial_backoff_ms": 10, "max_backoff_ms": 100, "multiplier": 2.0},
            "scoring": {"delivered_increment": 1.0, "positive_reply_base": 10.0, "fast_reply_window_secs": 3600,
                        "decay_threshold_secs": 86400, "decay_per_day": 0.5},
            "channel_budget": {"max_sends": 10, "window_secs": 60},
            "max_queue_depth": 1000,
            "campaigns": []
        }"#;
        let err = PolicyConfig::from_json(raw).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "delivery_retry"));
    }
}
