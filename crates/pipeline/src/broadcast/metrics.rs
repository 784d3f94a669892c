//! Periodic `metrics_update` broadcast

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::hub::Broadcaster;
use super::message::{MetricsData, OutboundMessage, WindowCounts};
use crate::aggregator::{AggregateError, Aggregator};
use crate::config::{env_secs, non_zero, ConfigError, MIN_PERIOD};

/// A named trailing window reported in every metrics update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsWindow {
    pub name: String,
    pub hours: u32,
}

impl MetricsWindow {
    pub fn new(name: impl Into<String>, hours: u32) -> Self {
        Self {
            name: name.into(),
            hours,
        }
    }
}

/// Metrics broadcast configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(with = "crate::config::duration_millis")]
    pub interval: Duration,
    pub windows: Vec<MetricsWindow>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            windows: vec![
                MetricsWindow::new("last_hour", 1),
                MetricsWindow::new("last_24h", 24),
            ],
        }
    }
}

impl MetricsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            interval: non_zero(
                "METRICS_BROADCAST_INTERVAL_SECS",
                env_secs("METRICS_BROADCAST_INTERVAL_SECS", defaults.interval)?,
            )?,
            ..defaults
        })
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_PERIOD);
        self
    }
}

/// Pushes aggregate counts to every subscriber on a fixed cadence
pub struct MetricsPublisher {
    aggregator: Arc<Aggregator>,
    broadcaster: Arc<Broadcaster>,
    config: MetricsConfig,
}

impl MetricsPublisher {
    pub fn new(
        aggregator: Arc<Aggregator>,
        broadcaster: Arc<Broadcaster>,
        config: MetricsConfig,
    ) -> Self {
        Self {
            aggregator,
            broadcaster,
            config,
        }
    }

    /// Compute every window and broadcast one `metrics_update`
    ///
    /// Returns the number of subscribers that accepted the message.
    pub async fn publish_once(&self) -> Result<usize, AggregateError> {
        let mut windows = BTreeMap::new();
        for window in &self.config.windows {
            let d = self.aggregator.distribution(window.hours, None).await?;
            windows.insert(
                window.name.clone(),
                WindowCounts {
                    total: d.total,
                    positive: d.positive,
                    negative: d.negative,
                    neutral: d.neutral,
                },
            );
        }

        let message = OutboundMessage::MetricsUpdate {
            data: MetricsData {
                windows,
                timestamp: Utc::now(),
            },
        };
        Ok(self.broadcaster.publish(message))
    }

    /// Spawn the periodic loop; it exits when `shutdown_rx` flips
    pub fn start(self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.publish_once().await {
                            Ok(delivered) => debug!(delivered, "Published metrics update"),
                            Err(e) => error!("Metrics update failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Metrics loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Metrics loop exited");
        })
    }
}
