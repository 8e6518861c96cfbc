//! Configuration management for Tally.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TallyError};
use crate::ratelimit::{Policy, TimeUnit};

/// Prefix for environment variable overrides, e.g.
/// `TALLY__LIMITER__CLEANUP_INTERVAL_MS=1000`.
pub const ENV_PREFIX: &str = "TALLY";

/// Main configuration for Tally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TallyConfig {
    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Rate limit policies
    #[serde(default = "default_policies")]
    pub policies: Vec<PolicyConfig>,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            limiter: LimiterConfig::default(),
            policies: default_policies(),
        }
    }
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// How often expired windows are evicted, in milliseconds
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

impl LimiterConfig {
    /// Get the cleanup interval as a duration.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

fn default_cleanup_interval_ms() -> u64 {
    5 * 60 * 1000
}

/// A single policy as written in configuration.
///
/// Exactly one of `unit` and `window_ms` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Policy name
    pub name: String,
    /// Requests allowed per window
    pub requests_per_unit: u64,
    /// Window as a time unit
    #[serde(default)]
    pub unit: Option<TimeUnit>,
    /// Window in milliseconds
    #[serde(default)]
    pub window_ms: Option<u64>,
}

impl PolicyConfig {
    fn per_unit(name: &str, requests_per_unit: u64, unit: TimeUnit) -> Self {
        Self {
            name: name.to_string(),
            requests_per_unit,
            unit: Some(unit),
            window_ms: None,
        }
    }

    /// Validate and convert into a [`Policy`].
    pub fn to_policy(&self) -> Result<Policy> {
        if self.name.is_empty() {
            return Err(TallyError::Config("policy name must not be empty".to_string()));
        }

        let window = match (self.unit, self.window_ms) {
            (Some(unit), None) => unit.duration(),
            (None, Some(0)) => {
                return Err(TallyError::Config(format!(
                    "policy {}: window_ms must be greater than zero",
                    self.name
                )))
            }
            (None, Some(ms)) => Duration::from_millis(ms),
            (Some(_), Some(_)) => {
                return Err(TallyError::Config(format!(
                    "policy {}: set either unit or window_ms, not both",
                    self.name
                )))
            }
            (None, None) => {
                return Err(TallyError::Config(format!(
                    "policy {}: one of unit or window_ms is required",
                    self.name
                )))
            }
        };

        Ok(Policy::new(self.name.clone(), self.requests_per_unit, window))
    }
}

fn default_policies() -> Vec<PolicyConfig> {
    vec![
        PolicyConfig::per_unit("message", 5, TimeUnit::Second),
        PolicyConfig::per_unit("transaction", 3, TimeUnit::Day),
        PolicyConfig::per_unit("ip", 10_000, TimeUnit::Minute),
    ]
}

impl TallyConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TallyConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TallyError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from an optional YAML file layered with
    /// `TALLY__`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Yaml),
            );
        }

        let config: TallyConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values a limiter would reject.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.cleanup_interval_ms == 0 {
            return Err(TallyError::Config(
                "limiter.cleanup_interval_ms must be greater than zero".to_string(),
            ));
        }

        for policy in &self.policies {
            policy.to_policy()?;
        }

        Ok(())
    }
}
