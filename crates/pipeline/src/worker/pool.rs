//! Ingestion worker pool
//!
//! Runs `worker_count` consumers in one consumer group plus a low-frequency
//! reclaim loop that takes over entries left pending by dead consumers.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::counters::PipelineCounters;
use super::poller::{PollerSettings, StreamPoller};
use super::processor::{EntryProcessor, Outcome, ProcessorSettings};
use crate::broadcast::Broadcaster;
use crate::classifier::Classifier;
use crate::config::{env_millis, env_or, env_secs, env_string, non_zero, ConfigError, MIN_PERIOD};
use crate::persistence::SentimentStore;
use crate::stream::{StreamClient, StreamError};

/// Ingestion configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Stream key the producers append to
    pub stream_name: String,

    /// Consumer group shared by all workers
    pub consumer_group: String,

    /// Prefix for generated consumer names
    pub consumer_prefix: String,

    /// Number of parallel workers
    pub worker_count: usize,

    /// Entries requested per read
    pub batch_size: usize,

    /// How long a read waits for new entries
    #[serde(with = "crate::config::duration_millis")]
    pub block: Duration,

    #[serde(with = "crate::config::duration_millis")]
    pub classify_timeout: Duration,

    #[serde(with = "crate::config::duration_millis")]
    pub persist_timeout: Duration,

    /// How often pending entries of dead consumers are reclaimed
    #[serde(with = "crate::config::duration_millis")]
    pub reclaim_interval: Duration,

    /// Minimum idle time before a pending entry is reclaimed
    #[serde(with = "crate::config::duration_millis")]
    pub reclaim_min_idle: Duration,

    /// Entries claimed per reclaim pass
    pub reclaim_batch_size: usize,

    /// Backoff bounds after failed reads
    #[serde(with = "crate::config::duration_millis")]
    pub read_backoff_min: Duration,

    #[serde(with = "crate::config::duration_millis")]
    pub read_backoff_max: Duration,

    /// Upper bound on waiting for workers to finish at shutdown
    #[serde(with = "crate::config::duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            stream_name: "social_posts_stream".to_string(),
            consumer_group: "sentiment_workers".to_string(),
            consumer_prefix: "worker".to_string(),
            worker_count: 4,
            batch_size: 10,
            block: Duration::from_millis(5000),
            classify_timeout: Duration::from_millis(5000),
            persist_timeout: Duration::from_millis(5000),
            reclaim_interval: Duration::from_secs(60),
            reclaim_min_idle: Duration::from_millis(300_000),
            reclaim_batch_size: 100,
            read_backoff_min: Duration::from_secs(1),
            read_backoff_max: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl IngestionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            stream_name: env_string("REDIS_STREAM_NAME", &defaults.stream_name),
            consumer_group: env_string("REDIS_CONSUMER_GROUP", &defaults.consumer_group),
            worker_count: env_or("WORKER_COUNT", defaults.worker_count)?,
            batch_size: env_or("WORKER_BATCH_SIZE", defaults.batch_size)?,
            block: non_zero("STREAM_BLOCK_MS", env_millis("STREAM_BLOCK_MS", defaults.block)?)?,
            classify_timeout: env_millis("CLASSIFY_TIMEOUT_MS", defaults.classify_timeout)?,
            persist_timeout: env_millis("PERSIST_TIMEOUT_MS", defaults.persist_timeout)?,
            reclaim_interval: non_zero(
                "RECLAIM_INTERVAL_SECS",
                env_secs("RECLAIM_INTERVAL_SECS", defaults.reclaim_interval)?,
            )?,
            reclaim_min_idle: env_millis("RECLAIM_MIN_IDLE_MS", defaults.reclaim_min_idle)?,
            ..defaults
        })
    }

    pub fn with_stream(mut self, stream_name: impl Into<String>, group: impl Into<String>) -> Self {
        self.stream_name = stream_name.into();
        self.consumer_group = group.into();
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block.max(MIN_PERIOD);
        self
    }

    pub fn with_classify_timeout(mut self, timeout: Duration) -> Self {
        self.classify_timeout = timeout;
        self
    }

    pub fn with_reclaim(mut self, interval: Duration, min_idle: Duration) -> Self {
        self.reclaim_interval = interval.max(MIN_PERIOD);
        self.reclaim_min_idle = min_idle;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            stream_name: self.stream_name.clone(),
            consumer_group: self.consumer_group.clone(),
            classify_timeout: self.classify_timeout,
            persist_timeout: self.persist_timeout,
        }
    }

    fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            stream_name: self.stream_name.clone(),
            consumer_group: self.consumer_group.clone(),
            batch_size: self.batch_size,
            block: self.block,
            min_backoff: self.read_backoff_min,
            max_backoff: self.read_backoff_max,
        }
    }

    fn consumer_name(&self, role: &str) -> String {
        format!("{}-{}-{}", self.consumer_prefix, role, Uuid::now_v7().simple())
    }
}

/// Ingestion pool errors
#[derive(Debug, thiserror::Error)]
pub enum IngestionPoolError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("ingestion pool is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Parallel consumers draining the stream into the classifier and store
///
/// # Example
///
/// ```ignore
/// let pool = IngestionPool::new(stream, classifier, store, broadcaster, config);
/// pool.start(shutdown_rx.clone()).await?;
///
/// // ... later
/// shutdown_tx.send(true)?;
/// pool.join().await?;
/// ```
pub struct IngestionPool {
    stream: Arc<dyn StreamClient>,
    processor: Arc<EntryProcessor>,
    counters: Arc<PipelineCounters>,
    config: IngestionConfig,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl IngestionPool {
    pub fn new(
        stream: Arc<dyn StreamClient>,
        classifier: Arc<dyn Classifier>,
        store: Arc<dyn SentimentStore>,
        broadcaster: Arc<Broadcaster>,
        config: IngestionConfig,
    ) -> Self {
        let counters = Arc::new(PipelineCounters::new());
        let processor = Arc::new(EntryProcessor::new(
            Arc::clone(&stream),
            classifier,
            store,
            broadcaster,
            Arc::clone(&counters),
            config.processor_settings(),
        ));

        Self {
            stream,
            processor,
            counters,
            config,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn counters(&self) -> Arc<PipelineCounters> {
        Arc::clone(&self.counters)
    }

    pub fn config(&self) -> &IngestionConfig {
        &self.config
    }

    /// Ensure the consumer group exists and spawn workers and the reclaim loop
    #[instrument(skip(self, shutdown_rx), fields(stream = %self.config.stream_name))]
    pub async fn start(&self, shutdown_rx: watch::Receiver<bool>) -> Result<(), IngestionPoolError> {
        if !self.handles.lock().is_empty() {
            return Err(IngestionPoolError::AlreadyRunning);
        }

        self.stream
            .ensure_group(&self.config.stream_name, &self.config.consumer_group)
            .await?;

        info!(
            group = %self.config.consumer_group,
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            "Starting ingestion pool"
        );

        let mut handles = Vec::with_capacity(self.config.worker_count + 1);
        for index in 0..self.config.worker_count.max(1) {
            let consumer = self.config.consumer_name(&index.to_string());
            handles.push(self.spawn_worker(consumer, shutdown_rx.clone()));
        }
        handles.push(self.spawn_reclaim_loop(shutdown_rx));

        *self.handles.lock() = handles;
        Ok(())
    }

    /// Claim entries idle past the threshold and process them once
    ///
    /// Returns the number of entries claimed.
    pub async fn reclaim_once(&self, shutdown_rx: &watch::Receiver<bool>) -> Result<usize, StreamError> {
        let consumer = self.config.consumer_name("reclaim");
        reclaim_stale(
            self.stream.as_ref(),
            &self.processor,
            &self.config,
            &consumer,
            shutdown_rx,
        )
        .await
    }

    /// Wait for every spawned task to exit, bounded by `shutdown_timeout`
    ///
    /// Call after the shutdown signal has been sent.
    #[instrument(skip(self))]
    pub async fn join(&self) -> Result<(), IngestionPoolError> {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return Ok(());
        }

        match tokio::time::timeout(self.config.shutdown_timeout, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!("Ingestion task ended abnormally: {}", e);
                    }
                }
                info!(counters = ?self.counters.snapshot(), "Ingestion pool stopped");
                Ok(())
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                    "Shutdown timeout reached"
                );
                Err(IngestionPoolError::ShutdownTimeout)
            }
        }
    }

    fn spawn_worker(&self, consumer: String, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let stream = Arc::clone(&self.stream);
        let processor = Arc::clone(&self.processor);
        let settings = self.config.poller_settings();

        tokio::spawn(async move {
            let mut poller =
                StreamPoller::new(Arc::clone(&stream), consumer, settings.clone(), shutdown_rx.clone());
            debug!(consumer = %poller.consumer(), "Worker started");

            while !poller.is_shutdown() {
                let entries = match poller.poll().await {
                    Ok(entries) => entries,
                    Err(e) => {
                        if matches!(e, StreamError::GroupNotFound { .. }) {
                            // Group vanished (stream deleted externally); recreate from the start.
                            if let Err(create_err) = stream
                                .ensure_group(&settings.stream_name, &settings.consumer_group)
                                .await
                            {
                                error!("Failed to recreate consumer group: {}", create_err);
                            }
                        }
                        if poller.backoff(&e).await {
                            break;
                        }
                        continue;
                    }
                };

                for entry in &entries {
                    if *shutdown_rx.borrow() {
                        debug!(
                            consumer = %poller.consumer(),
                            "Shutdown requested, leaving rest of batch pending"
                        );
                        break;
                    }
                    if let Outcome::Deferred = processor.process(entry, &shutdown_rx).await {
                        break;
                    }
                }
            }

            debug!(consumer = %poller.consumer(), "Worker loop exited");
        })
    }

    fn spawn_reclaim_loop(&self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let stream = Arc::clone(&self.stream);
        let processor = Arc::clone(&self.processor);
        let config = self.config.clone();
        let consumer = config.consumer_name("reclaim");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.reclaim_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match reclaim_stale(stream.as_ref(), &processor, &config, &consumer, &shutdown_rx).await {
                            Ok(0) => {}
                            Ok(claimed) => info!(count = claimed, "Reclaimed stale entries"),
                            Err(e) => error!("Stale entry reclamation failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Reclaim loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Reclaim loop exited");
        })
    }
}

async fn reclaim_stale(
    stream: &dyn StreamClient,
    processor: &EntryProcessor,
    config: &IngestionConfig,
    consumer: &str,
    shutdown_rx: &watch::Receiver<bool>,
) -> Result<usize, StreamError> {
    let entries = stream
        .claim_stale(
            &config.stream_name,
            &config.consumer_group,
            consumer,
            config.reclaim_min_idle,
            config.reclaim_batch_size,
        )
        .await?;

    for entry in &entries {
        if *shutdown_rx.borrow() {
            break;
        }
        processor.process(entry, shutdown_rx).await;
    }
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::LexiconClassifier;
    use crate::persistence::InMemorySentimentStore;
    use crate::stream::{InMemoryStreamClient, StreamFields};

    const STREAM: &str = "posts";
    const GROUP: &str = "workers";

    fn config() -> IngestionConfig {
        IngestionConfig::default()
            .with_stream(STREAM, GROUP)
            .with_worker_count(2)
            .with_block(Duration::from_millis(20))
            .with_shutdown_timeout(Duration::from_secs(5))
    }

    fn post(id: &str, content: &str) -> StreamFields {
        let mut fields = StreamFields::new();
        fields.insert("external_id".into(), id.into());
        fields.insert("content".into(), content.into());
        fields
    }

    fn pool(
        stream: Arc<InMemoryStreamClient>,
        store: Arc<InMemorySentimentStore>,
        config: IngestionConfig,
    ) -> IngestionPool {
        IngestionPool::new(
            stream,
            Arc::new(LexiconClassifier::new()),
            store,
            Arc::new(Broadcaster::new(64)),
            config,
        )
    }

    async fn wait_until(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_default_config() {
        let config = IngestionConfig::default();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.block, Duration::from_millis(5000));
        assert_eq!(config.reclaim_min_idle, Duration::from_secs(300));
    }

    #[test]
    fn test_zero_periods_are_rejected() {
        std::env::set_var("RECLAIM_INTERVAL_SECS", "0");
        let reclaim = IngestionConfig::from_env();
        std::env::remove_var("RECLAIM_INTERVAL_SECS");
        assert!(matches!(
            reclaim,
            Err(ConfigError::Invalid {
                key: "RECLAIM_INTERVAL_SECS",
                ..
            })
        ));

        std::env::set_var("STREAM_BLOCK_MS", "0");
        let block = IngestionConfig::from_env();
        std::env::remove_var("STREAM_BLOCK_MS");
        assert!(matches!(
            block,
            Err(ConfigError::Invalid {
                key: "STREAM_BLOCK_MS",
                ..
            })
        ));

        let clamped = IngestionConfig::default()
            .with_block(Duration::ZERO)
            .with_reclaim(Duration::ZERO, Duration::ZERO);
        assert_eq!(clamped.block, MIN_PERIOD);
        assert_eq!(clamped.reclaim_interval, MIN_PERIOD);
        assert_eq!(clamped.reclaim_min_idle, Duration::ZERO);
    }

    #[test]
    fn test_consumer_names_are_unique() {
        let config = IngestionConfig::default();
        let a = config.consumer_name("0");
        let b = config.consumer_name("0");
        assert!(a.starts_with("worker-0-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_config_serialization_uses_millis() {
        let json = serde_json::to_value(IngestionConfig::default()).unwrap();
        assert_eq!(json["block"], 5000);
        assert_eq!(json["reclaim_interval"], 60_000);
    }

    #[tokio::test]
    async fn test_pool_drains_stream_and_stops() {
        let stream = Arc::new(InMemoryStreamClient::new());
        let store = Arc::new(InMemorySentimentStore::new());
        let pool = pool(stream.clone(), store.clone(), config());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        pool.start(shutdown_rx).await.unwrap();
        for i in 0..20 {
            stream
                .append(STREAM, &post(&format!("p{i}"), "good news"))
                .await
                .unwrap();
        }

        let counters = pool.counters();
        wait_until(|| counters.snapshot().processed == 20).await;
        assert_eq!(store.analysis_count(), 20);
        assert_eq!(stream.pending_count(STREAM, GROUP), 0);

        shutdown_tx.send(true).unwrap();
        pool.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let stream = Arc::new(InMemoryStreamClient::new());
        let pool = pool(stream, Arc::new(InMemorySentimentStore::new()), config());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        pool.start(shutdown_rx.clone()).await.unwrap();
        assert!(matches!(
            pool.start(shutdown_rx).await,
            Err(IngestionPoolError::AlreadyRunning)
        ));

        shutdown_tx.send(true).unwrap();
        pool.join().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaim_processes_entries_of_dead_consumer() {
        let stream = Arc::new(InMemoryStreamClient::new());
        stream.ensure_group(STREAM, GROUP).await.unwrap();
        stream.append(STREAM, &post("p1", "sad day")).await.unwrap();
        // Delivered to a consumer that never acks.
        stream
            .read_group(STREAM, GROUP, "dead", 10, Duration::ZERO)
            .await
            .unwrap();

        let store = Arc::new(InMemorySentimentStore::new());
        let config = config().with_reclaim(Duration::from_secs(60), Duration::from_secs(300));
        let pool = pool(stream.clone(), store.clone(), config);
        let (_tx, shutdown_rx) = watch::channel(false);

        assert_eq!(pool.reclaim_once(&shutdown_rx).await.unwrap(), 0);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(pool.reclaim_once(&shutdown_rx).await.unwrap(), 1);
        assert_eq!(store.analysis_count(), 1);
        assert_eq!(stream.pending_count(STREAM, GROUP), 0);
    }
}
