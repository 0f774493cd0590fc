//! Guard configuration.
//!
//! One [`GuardConfig`] per protected upstream. Every section defaults to the
//! provider's documented policy, so an empty YAML document is valid.
//!
//! ```yaml
//! service: youtube_api
//! breaker:
//!   failure_threshold: 5
//!   timeout: 30s
//! quota:
//!   daily_limit: 10000
//!   timezone: America/Los_Angeles
//! retry:
//!   retries: 3
//!   initial_backoff: 1s
//! ```

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use quotaguard_core::{QuotaCalendar, QuotaPolicy, DEFAULT_DAILY_LIMIT, DEFAULT_QUOTA_TIMEZONE};

use crate::resilience::CircuitBreakerConfig;

/// Errors from loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper for durations written as "30s", "1h 30m", "250ms".
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Configuration for one guarded upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Circuit key in the store (e.g. "youtube_api")
    pub service: String,

    pub breaker: CircuitBreakerConfig,
    pub quota: QuotaConfig,
    pub retry: RetryConfig,
    pub monitor: MonitorConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            service: "youtube_api".to_string(),
            breaker: CircuitBreakerConfig::default(),
            quota: QuotaConfig::default(),
            retry: RetryConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl GuardConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    /// Reject settings the guard cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.trim().is_empty() {
            return Err(ConfigError::Invalid("service must not be empty".into()));
        }
        self.breaker.validate()?;
        self.quota.validate()?;
        if self.monitor.interval.is_zero() {
            return Err(ConfigError::Invalid("monitor.interval must be positive".into()));
        }
        Ok(())
    }
}

/// Daily budget settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub daily_limit: u64,

    /// IANA zone the provider resets in
    pub timezone: Tz,

    /// Alert fractions of `daily_limit`
    pub warning: f64,
    pub critical: f64,
    pub block: f64,

    /// Calls slower than this are logged
    #[serde(with = "duration_str")]
    pub slow_call_threshold: Duration,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        let policy = QuotaPolicy::default();
        Self {
            daily_limit: DEFAULT_DAILY_LIMIT,
            timezone: DEFAULT_QUOTA_TIMEZONE,
            warning: policy.warning,
            critical: policy.critical,
            block: policy.block,
            slow_call_threshold: Duration::from_secs(5),
        }
    }
}

impl QuotaConfig {
    pub fn policy(&self) -> QuotaPolicy {
        QuotaPolicy {
            daily_limit: self.daily_limit,
            warning: self.warning,
            critical: self.critical,
            block: self.block,
        }
    }

    pub fn calendar(&self) -> QuotaCalendar {
        QuotaCalendar::new(self.timezone)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.daily_limit == 0 {
            return Err(ConfigError::Invalid("quota.daily_limit must be positive".into()));
        }
        for (name, value) in [
            ("warning", self.warning),
            ("critical", self.critical),
            ("block", self.block),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "quota.{name} must be in (0, 1], got {value}"
                )));
            }
        }
        if !(self.warning < self.critical && self.critical <= self.block) {
            return Err(ConfigError::Invalid(
                "quota thresholds must satisfy warning < critical <= block".into(),
            ));
        }
        Ok(())
    }
}

/// Retry loop settings for the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub retries: u32,

    /// Delay before the first retry; doubles for each further retry
    #[serde(with = "duration_str")]
    pub initial_backoff: Duration,

    /// Longest Retry-After the orchestrator will wait out
    #[serde(with = "duration_str")]
    pub max_retry_after: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            initial_backoff: Duration::from_millis(1000),
            max_retry_after: Duration::from_secs(300),
        }
    }
}

/// Periodic quota monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(with = "duration_str")]
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}
