//! Environment-driven pipeline configuration
//!
//! Every knob has a documented default; values that are present but malformed
//! are reported as [`ConfigError`] instead of being silently replaced.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregator::AggregatorConfig;
use crate::alerts::AlertConfig;
use crate::broadcast::{BroadcastConfig, MetricsConfig};
use crate::classifier::ClassifierConfig;
use crate::worker::IngestionConfig;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is present but cannot be parsed
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    /// A required variable is missing
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
}

/// Complete configuration of the processing engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub ingestion: IngestionConfig,
    pub classifier: ClassifierConfig,
    pub aggregator: AggregatorConfig,
    pub alerts: AlertConfig,
    pub broadcast: BroadcastConfig,
    pub metrics: MetricsConfig,
}

impl PipelineConfig {
    /// Read configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            ingestion: IngestionConfig::from_env()?,
            classifier: ClassifierConfig::from_env()?,
            aggregator: AggregatorConfig::from_env()?,
            alerts: AlertConfig::from_env()?,
            broadcast: BroadcastConfig::from_env()?,
            metrics: MetricsConfig::from_env()?,
        })
    }
}

/// Parse `key` if set, otherwise use `default`
pub(crate) fn env_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

pub(crate) fn env_string(key: &'static str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub(crate) fn env_millis(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    env_or(key, default.as_millis() as u64).map(Duration::from_millis)
}

pub(crate) fn env_secs(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    env_or(key, default.as_secs()).map(Duration::from_secs)
}

/// Shortest period accepted for tickers and blocking reads
pub(crate) const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Reject a zero duration read from `key`
pub(crate) fn non_zero(key: &'static str, value: Duration) -> Result<Duration, ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
