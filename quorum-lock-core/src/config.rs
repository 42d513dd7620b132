//! Lock configuration.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{LockError, Result};

/// A store call may use at most `ttl / STORE_TIMEOUT_TTL_DIVISOR`.
pub const STORE_TIMEOUT_TTL_DIVISOR: u32 = 10;

const MIN_STORE_TIMEOUT: Duration = Duration::from_millis(1);

/// Configuration shared by every acquisition made through one lock manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Upper bound on a single store call. Capped further at a tenth of the TTL.
    #[serde(rename = "store_timeout_ms", with = "duration_ms")]
    pub store_timeout: Duration,
    /// Maximum number of acquisition attempts per `acquire` call.
    pub max_attempts: u32,
    /// Backoff between failed attempts.
    pub backoff: BackoffConfig,
    /// Fraction of the TTL reserved for clock drift between contender and stores.
    pub drift_factor: f64,
    /// Fixed drift allowance added on top of `drift_factor * ttl`.
    #[serde(rename = "drift_floor_ms", with = "duration_ms")]
    pub drift_floor: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_millis(50),
            max_attempts: 10,
            backoff: BackoffConfig::default(),
            drift_factor: 0.01,
            drift_floor: Duration::from_millis(2),
        }
    }
}

impl LockConfig {
    /// Create a builder.
    pub fn builder() -> LockConfigBuilder {
        LockConfigBuilder::new()
    }

    /// Safety margin subtracted from `ttl` when computing the validity window.
    pub fn drift_margin(&self, ttl: Duration) -> Duration {
        ttl.mul_f64(self.drift_factor) + self.drift_floor
    }

    /// Timeout for one store call of an attempt with the given TTL.
    ///
    /// A store that never answers costs the attempt at most a tenth of the
    /// TTL, so the answers of the others still leave a usable window.
    pub fn store_timeout_for(&self, ttl: Duration) -> Duration {
        let share = (ttl / STORE_TIMEOUT_TTL_DIVISOR).max(MIN_STORE_TIMEOUT);
        self.store_timeout.min(share)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(LockError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        if self.store_timeout.is_zero() {
            return Err(LockError::InvalidConfig(
                "store_timeout must be greater than zero".to_string(),
            ));
        }

        if !self.drift_factor.is_finite() || !(0.0..1.0).contains(&self.drift_factor) {
            return Err(LockError::InvalidConfig(format!(
                "drift_factor must be in [0, 1), got {}",
                self.drift_factor
            )));
        }

        self.backoff.validate()
    }
}

/// Randomized backoff: a base delay drawn from `[base_min, base_max]` plus
/// an independent jitter drawn from `[0, jitter_max]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(rename = "base_min_ms", with = "duration_ms")]
    pub base_min: Duration,
    #[serde(rename = "base_max_ms", with = "duration_ms")]
    pub base_max: Duration,
    #[serde(rename = "jitter_max_ms", with = "duration_ms")]
    pub jitter_max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_min: Duration::from_millis(50),
            base_max: Duration::from_millis(250),
            jitter_max: Duration::from_millis(100),
        }
    }
}

impl BackoffConfig {
    /// Create a backoff range.
    pub fn new(base_min: Duration, base_max: Duration, jitter_max: Duration) -> Self {
        Self {
            base_min,
            base_max,
            jitter_max,
        }
    }

    /// Longest delay this configuration can produce.
    pub fn max_delay(&self) -> Duration {
        self.base_max + self.jitter_max
    }

    /// Draw one delay from `rng`.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Duration {
        let base = micros(self.base_min)..=micros(self.base_max);
        let base = Duration::from_micros(rng.random_range(base));
        let jitter = Duration::from_micros(rng.random_range(0..=micros(self.jitter_max)));
        base + jitter
    }

    /// Validate the backoff range.
    pub fn validate(&self) -> Result<()> {
        if self.base_min > self.base_max {
            return Err(LockError::InvalidConfig(format!(
                "backoff base_min ({:?}) exceeds base_max ({:?})",
                self.base_min, self.base_max
            )));
        }
        Ok(())
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

/// Builder for lock configuration.
#[derive(Default)]
pub struct LockConfigBuilder {
    config: LockConfig,
}

impl LockConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: LockConfig::default(),
        }
    }

    /// Set the per-store call timeout.
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.config.store_timeout = timeout;
        self
    }

    /// Set the maximum number of attempts.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Set the backoff range.
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// Set the drift factor.
    pub fn drift_factor(mut self, factor: f64) -> Self {
        self.config.drift_factor = factor;
        self
    }

    /// Set the fixed drift allowance.
    pub fn drift_floor(mut self, floor: Duration) -> Self {
        self.config.drift_floor = floor;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<LockConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Serialize durations as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
