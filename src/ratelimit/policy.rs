//! Named rate limit policies.
//!
//! A request-handling layer usually enforces several independent limits at
//! once (messages per user, failed transactions per user, requests per IP).
//! Each [`Policy`] names one `(limit, window)` pair, and a [`PolicySet`] owns
//! one [`Limiter`] per policy so their key spaces never mix.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use super::limiter::Limiter;
use crate::config::TallyConfig;
use crate::error::{Result, TallyError};

/// Time unit for rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeUnit {
    /// Get the duration of this time unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// A named limit applied to every key checked against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Name used to select the policy
    pub name: String,
    /// Maximum admissions per window
    pub limit: u64,
    /// Window length
    pub window: Duration,
}

impl Policy {
    /// Create a policy with an explicit window.
    pub fn new(name: impl Into<String>, limit: u64, window: Duration) -> Self {
        Self {
            name: name.into(),
            limit,
            window,
        }
    }

    /// Create a policy admitting `requests_per_unit` requests per `unit`.
    pub fn per_unit(name: impl Into<String>, requests_per_unit: u64, unit: TimeUnit) -> Self {
        Self::new(name, requests_per_unit, unit.duration())
    }
}

/// A policy together with the limiter enforcing it.
#[derive(Debug)]
pub struct PolicyLimiter {
    policy: Policy,
    limiter: Limiter,
}

impl PolicyLimiter {
    /// Decide whether a request for `key` is admitted under this policy.
    pub fn check(&self, key: &str) -> bool {
        self.limiter
            .allow(key, self.policy.limit, self.policy.window)
    }

    /// Get the policy.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Get the underlying limiter.
    pub fn limiter(&self) -> &Limiter {
        &self.limiter
    }
}

/// A set of independent policies, each with its own limiter.
#[derive(Debug)]
pub struct PolicySet {
    policies: HashMap<String, PolicyLimiter>,
}

impl PolicySet {
    /// Build one limiter per policy, all sharing `cleanup_interval`.
    ///
    /// Duplicate policy names are rejected.
    pub fn new(policies: Vec<Policy>, cleanup_interval: Duration) -> Result<Self> {
        let mut set = HashMap::with_capacity(policies.len());

        for policy in policies {
            if set.contains_key(&policy.name) {
                return Err(TallyError::Config(format!(
                    "duplicate policy name: {}",
                    policy.name
                )));
            }

            debug!(
                policy = %policy.name,
                limit = policy.limit,
                window = ?policy.window,
                "Creating policy limiter"
            );

            let limiter = Limiter::new(cleanup_interval)?;
            set.insert(policy.name.clone(), PolicyLimiter { policy, limiter });
        }

        info!(count = set.len(), "Policy set created");

        Ok(Self { policies: set })
    }

    /// Build a policy set from configuration.
    pub fn from_config(config: &TallyConfig) -> Result<Self> {
        let policies = config
            .policies
            .iter()
            .map(|p| p.to_policy())
            .collect::<Result<Vec<_>>>()?;

        Self::new(policies, config.limiter.cleanup_interval())
    }

    /// Decide whether a request for `key` is admitted under the named policy.
    pub fn check(&self, policy: &str, key: &str) -> Result<bool> {
        if key.is_empty() {
            return Err(TallyError::EmptyKey);
        }

        let entry = self
            .policies
            .get(policy)
            .ok_or_else(|| TallyError::UnknownPolicy(policy.to_string()))?;

        Ok(entry.check(key))
    }

    /// Get a policy and its limiter by name.
    pub fn get(&self, policy: &str) -> Option<&PolicyLimiter> {
        self.policies.get(policy)
    }

    /// Get the policy names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Get the number of policies.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether the set has no policies.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Close every limiter in the set.
    pub fn close_all(&self) {
        for entry in self.policies.values() {
            entry.limiter.close();
        }
    }

    /// Close every limiter and wait for all reapers to exit.
    pub async fn shutdown(&self) {
        for (name, entry) in &self.policies {
            entry.limiter.shutdown().await;
            debug!(policy = %name, "Policy limiter stopped");
        }
    }
}
