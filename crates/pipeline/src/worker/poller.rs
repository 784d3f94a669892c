//! Stream reading with backoff on read failures
//!
//! A healthy read blocks inside the log for up to `block`, so no extra poll
//! delay is needed. When reads fail, the poller waits with exponential
//! backoff and resets after the next successful read.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::stream::{StreamClient, StreamEntry, StreamError};

/// Where and how a poller reads
#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub stream_name: String,
    pub consumer_group: String,
    pub batch_size: usize,
    pub block: Duration,
    /// First delay after a failed read
    pub min_backoff: Duration,
    /// Delay cap while reads keep failing
    pub max_backoff: Duration,
}

/// Reads batches for one consumer
pub struct StreamPoller {
    stream: Arc<dyn StreamClient>,
    consumer: String,
    settings: PollerSettings,
    current_backoff: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl StreamPoller {
    pub fn new(
        stream: Arc<dyn StreamClient>,
        consumer: String,
        settings: PollerSettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream,
            consumer,
            current_backoff: settings.min_backoff,
            settings,
            shutdown_rx,
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Read the next batch, returning early and empty if shutdown is signaled
    pub async fn poll(&mut self) -> Result<Vec<StreamEntry>, StreamError> {
        if self.is_shutdown() {
            return Ok(vec![]);
        }

        let read = self.stream.read_group(
            &self.settings.stream_name,
            &self.settings.consumer_group,
            &self.consumer,
            self.settings.batch_size,
            self.settings.block,
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        let entries = tokio::select! {
            result = read => result?,
            _ = shutdown_rx.changed() => {
                debug!(consumer = %self.consumer, "Shutdown signal received during read");
                return Ok(vec![]);
            }
        };

        self.current_backoff = self.settings.min_backoff;
        if entries.is_empty() {
            trace!(consumer = %self.consumer, "No entries within block timeout");
        } else {
            debug!(consumer = %self.consumer, count = entries.len(), "Read entries");
        }
        Ok(entries)
    }

    /// Sleep for the current backoff after a failed read, then grow it
    ///
    /// Returns true if shutdown was signaled while waiting.
    pub async fn backoff(&mut self, error: &StreamError) -> bool {
        warn!(
            consumer = %self.consumer,
            error = %error,
            transient = error.is_transient(),
            delay_ms = self.current_backoff.as_millis() as u64,
            "Stream read failed, backing off"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        let interrupted = tokio::select! {
            _ = tokio::time::sleep(self.current_backoff) => false,
            _ = shutdown_rx.changed() => true,
        };

        self.current_backoff = (self.current_backoff * 2).min(self.settings.max_backoff);
        interrupted
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}
