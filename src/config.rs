//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::{Result, TollgateError};

/// Environment variable prefix used by [`TollgateConfig::load`].
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,
}

/// Token bucket limiter configuration.
///
/// Durations are kept at full precision. Only the YAML and environment
/// surface is expressed in whole milliseconds (`interval_ms`,
/// `idle_timeout_ms`, `sweep_interval_ms`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Burst size, also the number of tokens granted per interval
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Interval over which `limit` tokens are refilled
    #[serde(rename = "interval_ms", with = "duration_ms", default = "default_interval")]
    pub interval: Duration,

    /// How long a bucket may go untouched before it is evicted
    #[serde(
        rename = "idle_timeout_ms",
        with = "duration_ms",
        default = "default_idle_timeout"
    )]
    pub idle_timeout: Duration,

    /// Period of the background eviction sweep
    #[serde(
        rename = "sweep_interval_ms",
        with = "duration_ms",
        default = "default_sweep_interval"
    )]
    pub sweep_interval: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            interval: default_interval(),
            idle_timeout: default_idle_timeout(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_limit() -> u64 {
    5
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

/// Serde adapter storing a [`Duration`] as whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

impl LimiterConfig {
    /// Create a configuration for `limit` tokens per `interval` with the
    /// default eviction settings.
    pub fn new(limit: u64, interval: Duration) -> Self {
        Self {
            limit,
            interval,
            ..Self::default()
        }
    }

    /// Override the idle timeout.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Override the sweep period.
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Refill interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Sweep period.
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Check that the configuration can build a limiter.
    ///
    /// An idle timeout shorter than the refill interval is accepted but
    /// logged: such a bucket can be evicted before it would have refilled,
    /// and its recreated state grants a full burst earlier than lazy refill
    /// alone would have.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(TollgateError::InvalidLimit(self.limit));
        }
        if self.interval.is_zero() {
            return Err(TollgateError::InvalidInterval);
        }
        if self.sweep_interval.is_zero() {
            return Err(TollgateError::InvalidSweep(
                "sweep interval must be positive".to_string(),
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(TollgateError::InvalidSweep(
                "idle timeout must be positive".to_string(),
            ));
        }

        if self.idle_timeout < self.interval {
            warn!(
                idle_timeout = ?self.idle_timeout,
                interval = ?self.interval,
                "Idle timeout is shorter than the refill interval; evicted buckets reset to full capacity early"
            );
        }

        Ok(())
    }
}

impl TollgateConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TollgateConfig = serde_yaml::from_str(&contents)
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration by layering defaults, an optional YAML file and
    /// `TOLLGATE__`-prefixed environment variables, in that order.
    ///
    /// Nested keys are separated by a double underscore, so
    /// `TOLLGATE__LIMITER__LIMIT=10` sets `limiter.limit`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        let config = ::config::Config::builder()
            .add_source(::config::Config::try_from(&base)?)
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }
}
