//! Configuration structures for the escalation engine.
//!
//! These structs are designed to be deserialized from a configuration file
//! (e.g., a TOML file) using `serde`, so countdown bounds and retry behavior
//! can be tuned per deployment without touching application code. Every
//! field has a default matching the product's stock behavior.

use serde::Deserialize;
use std::time::Duration;

/// The top-level configuration for the `EscalationEngine`.
///
/// Typically loaded from `vitalwatch.toml` at startup via [`load`], with
/// `VITALWATCH_`-prefixed environment variables layered on top.
///
/// [`load`]: VitalWatchConfig::load
#[derive(Debug, Clone, Deserialize)]
pub struct VitalWatchConfig {
    /// Countdown bounds and the budget applied when a trigger does not
    /// specify one.
    #[serde(default)]
    pub countdown: CountdownConfig,

    /// Retry behavior for notification dispatch.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Countdown bounds, mirroring the product settings screen: 180 seconds by
/// default, user-adjustable between 30 and 300.
#[derive(Debug, Clone, Deserialize)]
pub struct CountdownConfig {
    /// Budget used when an episode is triggered without an explicit one.
    #[serde(default = "default_countdown_secs")]
    pub default_secs: u32,

    /// Smallest countdown a trigger may request.
    #[serde(default = "default_min_secs")]
    pub min_secs: u32,

    /// Largest countdown a trigger may request.
    #[serde(default = "default_max_secs")]
    pub max_secs: u32,
}

/// Bounded exponential backoff settings for dispatch retries.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total dispatch attempts before the engine gives up and escalates
    /// with delivery marked as failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry. Doubles for each retry after that.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl RetryConfig {
    /// Backoff to sleep after failed attempt number `attempt` (1-based):
    /// `base_delay_ms * 2^(attempt - 1)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let doubling = 2u32.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms) * doubling
    }
}

// --- Default value functions for serde ---

fn default_countdown_secs() -> u32 {
    180
}

fn default_min_secs() -> u32 {
    30
}

fn default_max_secs() -> u32 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2_000
}

impl Default for CountdownConfig {
    fn default() -> Self {
        Self {
            default_secs: default_countdown_secs(),
            min_secs: default_min_secs(),
            max_secs: default_max_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl Default for VitalWatchConfig {
    fn default() -> Self {
        Self {
            countdown: CountdownConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl VitalWatchConfig {
    /// Loads configuration from an optional `vitalwatch.toml` in the working
    /// directory, layered with `VITALWATCH_`-prefixed environment overrides
    /// (e.g. `VITALWATCH_COUNTDOWN__DEFAULT_SECS=60`).
    pub fn load() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("vitalwatch").required(false))
            .add_source(config::Environment::with_prefix("VITALWATCH").separator("__"))
            .build()?;
        settings.try_deserialize()
    }
}
