//! Dispatcher configuration.

use std::time::Duration;

use uuid::Uuid;

use crate::backoff::{BackoffPolicy, BackoffStrategy};

pub const ENV_POLL_INTERVAL_MS: &str = "OUTBOX_POLL_INTERVAL_MS";
pub const ENV_POLL_JITTER: &str = "OUTBOX_POLL_JITTER";
pub const ENV_BATCH_SIZE: &str = "OUTBOX_BATCH_SIZE";
pub const ENV_CLAIM_DURATION_MINUTES: &str = "OUTBOX_CLAIM_DURATION_MINUTES";
pub const ENV_MAX_ATTEMPTS: &str = "OUTBOX_MAX_ATTEMPTS";
pub const ENV_BACKOFF_STRATEGY: &str = "OUTBOX_BACKOFF_STRATEGY";
pub const ENV_BACKOFF_BASE_MS: &str = "OUTBOX_BACKOFF_BASE_MS";
pub const ENV_BACKOFF_MAX_MS: &str = "OUTBOX_BACKOFF_MAX_MS";
pub const ENV_BACKOFF_JITTER: &str = "OUTBOX_BACKOFF_JITTER";
pub const ENV_INSTANCE_NAME: &str = "OUTBOX_INSTANCE_NAME";

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {key}={value:?}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

impl ConfigError {
    fn new(key: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key,
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Dispatcher tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Prefix of every claim id this instance generates; shows up in logs and
    /// in the `claimed_by` column.
    pub instance_name: String,
    /// Idle sleep between due-checks.
    pub poll_interval: Duration,
    /// Fraction of `poll_interval` to randomize the idle sleep by.
    pub poll_jitter: f64,
    pub batch_size: usize,
    /// How long a claim is held before other instances may take the row.
    pub claim_duration: Duration,
    /// Rows with this many attempts are no longer due.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            instance_name: format!("dispatcher-{}", Uuid::now_v7()),
            poll_interval: Duration::from_millis(1000),
            poll_jitter: 0.2,
            batch_size: 50,
            claim_duration: Duration::from_secs(5 * 60),
            max_attempts: 10,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    /// Defaults overridden by `OUTBOX_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the `OUTBOX_*` keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(name) = get(ENV_INSTANCE_NAME) {
            config.instance_name = name.trim().to_string();
        }
        if let Some(v) = get(ENV_POLL_INTERVAL_MS) {
            config.poll_interval = Duration::from_millis(parse_number(ENV_POLL_INTERVAL_MS, &v)?);
        }
        if let Some(v) = get(ENV_POLL_JITTER) {
            config.poll_jitter = parse_number(ENV_POLL_JITTER, &v)?;
        }
        if let Some(v) = get(ENV_BATCH_SIZE) {
            config.batch_size = parse_number(ENV_BATCH_SIZE, &v)?;
        }
        if let Some(v) = get(ENV_CLAIM_DURATION_MINUTES) {
            let minutes: u64 = parse_number(ENV_CLAIM_DURATION_MINUTES, &v)?;
            config.claim_duration = Duration::from_secs(minutes.saturating_mul(60));
        }
        if let Some(v) = get(ENV_MAX_ATTEMPTS) {
            config.max_attempts = parse_number(ENV_MAX_ATTEMPTS, &v)?;
        }
        if let Some(v) = get(ENV_BACKOFF_STRATEGY) {
            config.backoff.strategy = v
                .parse::<BackoffStrategy>()
                .map_err(|reason| ConfigError::new(ENV_BACKOFF_STRATEGY, v.as_str(), reason))?;
        }
        if let Some(v) = get(ENV_BACKOFF_BASE_MS) {
            config.backoff.base_delay = Duration::from_millis(parse_number(ENV_BACKOFF_BASE_MS, &v)?);
        }
        if let Some(v) = get(ENV_BACKOFF_MAX_MS) {
            config.backoff.max_delay = Duration::from_millis(parse_number(ENV_BACKOFF_MAX_MS, &v)?);
        }
        if let Some(v) = get(ENV_BACKOFF_JITTER) {
            config.backoff.jitter = parse_number(ENV_BACKOFF_JITTER, &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_name.is_empty() {
            return Err(ConfigError::new(ENV_INSTANCE_NAME, "", "must not be empty"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::new(ENV_POLL_INTERVAL_MS, "0", "must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::new(ENV_BATCH_SIZE, "0", "must be >= 1"));
        }
        if self.claim_duration.is_zero() {
            return Err(ConfigError::new(ENV_CLAIM_DURATION_MINUTES, "0", "must be > 0"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::new(ENV_MAX_ATTEMPTS, "0", "must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.poll_jitter) {
            return Err(ConfigError::new(
                ENV_POLL_JITTER,
                self.poll_jitter.to_string(),
                "must be within 0.0..=1.0",
            ));
        }
        if self.backoff.base_delay.is_zero() {
            return Err(ConfigError::new(ENV_BACKOFF_BASE_MS, "0", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(ConfigError::new(
                ENV_BACKOFF_JITTER,
                self.backoff.jitter.to_string(),
                "must be within 0.0..=1.0",
            ));
        }
        if self.backoff.max_delay < self.backoff.base_delay {
            return Err(ConfigError::new(
                ENV_BACKOFF_MAX_MS,
                self.backoff.max_delay.as_millis().to_string(),
                "must be >= the base delay",
            ));
        }
        Ok(())
    }

    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_jitter(mut self, jitter: f64) -> Self {
        self.poll_jitter = jitter;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_claim_duration(mut self, duration: Duration) -> Self {
        self.claim_duration = duration;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::new(key, value, e.to_string()))
}
