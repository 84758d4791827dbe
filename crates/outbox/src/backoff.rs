//! Retry delays for transient publish failures, and poll jitter.

use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// `base * attempt`
    Linear,
    /// `base * 2^(attempt - 1)`
    #[default]
    Exponential,
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!(
                "unknown backoff strategy {other:?} (expected fixed, linear or exponential)"
            )),
        }
    }
}

/// How long a row waits before it may be claimed again after a transient
/// failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    /// Upper bound on any delay, jitter included.
    pub max_delay: Duration,
    /// Fraction (0.0-1.0) of the delay to randomize by, in both directions.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5 * 60),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay after the `attempt`-th failure (1-indexed). Zero for attempt 0.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Linear => base_ms * f64::from(attempt),
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                base_ms * exp
            }
        }
        .min(max_ms);

        let jittered = jitter_ms(delay_ms, self.jitter);
        Duration::from_millis(jittered.clamp(0.0, max_ms) as u64)
    }
}

/// `duration` randomized by up to `factor` of itself in either direction.
pub fn jitter(duration: Duration, factor: f64) -> Duration {
    Duration::from_millis(jitter_ms(duration.as_millis() as f64, factor).max(0.0) as u64)
}

fn jitter_ms(ms: f64, factor: f64) -> f64 {
    if !factor.is_finite() || !ms.is_finite() {
        return ms;
    }
    let factor = factor.clamp(0.0, 1.0);
    if factor == 0.0 || ms <= 0.0 {
        return ms;
    }
    let spread = ms * factor;
    ms + rand::thread_rng().gen_range(-spread..=spread)
}
