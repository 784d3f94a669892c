//! Real-time fan-out to live subscribers
//!
//! This module provides:
//! - [`Broadcaster`] - subscriber registry with bounded per-subscriber queues
//! - [`OutboundMessage`] - the `connected` / `new_result` / `metrics_update` schema
//! - [`MetricsPublisher`] - periodic aggregate updates
//!
//! # Architecture
//!
//! ```text
//! IngestionPool ──new_result──┐
//!                             ▼
//! MetricsPublisher ──────► Broadcaster ──► [queue 1] ──► subscriber 1
//!    (30s)                    │        ──► [queue 2] ──► subscriber 2
//!                             │        ──► [queue N] ──► subscriber N
//!                             └─ full queue: subscriber removed
//! ```

mod hub;
mod message;
mod metrics;

use serde::{Deserialize, Serialize};

use crate::config::{env_or, ConfigError};

pub use hub::{BroadcastError, Broadcaster, Subscription};
pub use message::{
    preview, MetricsData, NewResultData, OutboundMessage, WindowCounts, CONTENT_PREVIEW_CHARS,
};
pub use metrics::{MetricsConfig, MetricsPublisher, MetricsWindow};

/// Broadcaster configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Messages buffered per subscriber before it is disconnected
    pub queue_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
        }
    }
}

impl BroadcastConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            queue_capacity: env_or("SUBSCRIBER_QUEUE_CAPACITY", Self::default().queue_capacity)?,
        })
    }
}
