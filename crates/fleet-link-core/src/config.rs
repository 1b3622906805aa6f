//! Agent configuration for the control-plane link.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum time to wait between messages before disconnecting.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);
/// Upper bound of the random extension added to the heartbeat timeout.
pub const DEFAULT_HEARTBEAT_JITTER: Duration = Duration::from_secs(60);
/// Reconnect delay once the control service reports the instance inactive.
pub const DEFAULT_INACTIVE_INSTANCE_RECONNECT_DELAY: Duration = Duration::from_secs(60 * 60);
/// Smallest reconnect delay.
pub const DEFAULT_BACKOFF_MIN: Duration = Duration::from_millis(250);
/// Largest reconnect delay.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(120);
/// Growth factor between consecutive reconnect delays.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 1.5;
/// Proportional jitter applied to reconnect delays.
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.2;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Agent build metadata advertised to the control service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildInfo {
    /// Agent release version.
    pub version: String,
    /// Source revision the agent was built from.
    pub git_hash: String,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            git_hash: option_env!("FLEET_LINK_GIT_HASH")
                .unwrap_or("UNKNOWN")
                .to_string(),
        }
    }
}

/// Reconnect backoff bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(rename = "min_ms", with = "duration_ms")]
    pub min: Duration,
    #[serde(rename = "max_ms", with = "duration_ms")]
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the computed delay added as random jitter (0.0–1.0).
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: DEFAULT_BACKOFF_MIN,
            max: DEFAULT_BACKOFF_MAX,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: DEFAULT_BACKOFF_JITTER,
        }
    }
}

/// Connection timing knobs.
///
/// The defaults are what production uses; overriding them is meant for tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    #[serde(rename = "heartbeat_timeout_ms", with = "duration_ms")]
    pub heartbeat_timeout: Duration,
    #[serde(rename = "heartbeat_jitter_ms", with = "duration_ms")]
    pub heartbeat_jitter: Duration,
    #[serde(rename = "inactive_instance_reconnect_delay_ms", with = "duration_ms")]
    pub inactive_instance_reconnect_delay: Duration,
    pub backoff: BackoffConfig,
}

impl TimingConfig {
    /// Read/write deadline for the transport: long enough to cover two
    /// missed heartbeats plus jitter.
    #[must_use]
    pub fn rw_timeout(&self) -> Duration {
        self.heartbeat_timeout
            .saturating_mul(2)
            .saturating_add(self.heartbeat_jitter)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            heartbeat_jitter: DEFAULT_HEARTBEAT_JITTER,
            inactive_instance_reconnect_delay: DEFAULT_INACTIVE_INSTANCE_RECONNECT_DELAY,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Agent configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Cluster the managed instance belongs to.
    pub cluster: String,
    pub timing: TimingConfig,
    pub build: BuildInfo,
}

impl AgentConfig {
    /// Create a configuration with default timings.
    #[must_use]
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            ..Self::default()
        }
    }

    /// Load and validate a JSON configuration file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed, or fails validation.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the session relies on.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.trim().is_empty() {
            return Err(ConfigError::Invalid("cluster must not be empty".into()));
        }
        let backoff = &self.timing.backoff;
        if backoff.min > backoff.max {
            return Err(ConfigError::Invalid(format!(
                "backoff min {:?} exceeds max {:?}",
                backoff.min, backoff.max
            )));
        }
        if backoff.multiplier.is_nan() || backoff.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff multiplier must be >= 1, got {}",
                backoff.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&backoff.jitter) {
            return Err(ConfigError::Invalid(format!(
                "backoff jitter must be within [0, 1], got {}",
                backoff.jitter
            )));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
