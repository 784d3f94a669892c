//! # Sentiflow Pipeline
//!
//! Real-time sentiment processing over a durable append-only log.
//!
//! ## Features
//!
//! - **Consumer-group ingestion**: parallel workers with at-least-once delivery and reclaim of entries left by dead consumers
//! - **Pluggable classification**: local lexicon, remote LLM API, or a fallback chain behind one port
//! - **Idempotent persistence**: events and analyses upserted by external id
//! - **Aggregation**: trailing-window distributions and gap-free time buckets
//! - **Alerting**: sliding-window negative/positive ratio detection
//! - **Live fan-out**: bounded per-subscriber queues; slow subscribers are dropped
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                StreamClient (Redis streams)                  │
//! │      (append, read_group, ack, claim_stale, ensure_group)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      IngestionPool                           │
//! │   (validate → classify → persist → publish → ack, reclaim)  │
//! └─────────────────────────────────────────────────────────────┘
//!               │                                 │
//!               ▼                                 ▼
//! ┌──────────────────────────┐      ┌──────────────────────────┐
//! │  SentimentStore (PG)     │      │      Broadcaster         │
//! │  events, analyses, alerts│      │  (per-subscriber queues) │
//! └──────────────────────────┘      └──────────────────────────┘
//!        │            │                           ▲
//!        ▼            ▼                           │
//!   Aggregator   AlertDetector            MetricsPublisher
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use sentiflow_pipeline::prelude::*;
//!
//! let config = PipelineConfig::from_env()?;
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!
//! let stream = Arc::new(InMemoryStreamClient::new());
//! let store = Arc::new(InMemorySentimentStore::new());
//! let broadcaster = Arc::new(Broadcaster::new(config.broadcast.queue_capacity));
//! let classifier = build_classifier(&config.classifier)?;
//!
//! let pool = IngestionPool::new(stream, classifier, store, broadcaster, config.ingestion);
//! pool.start(shutdown_rx).await?;
//! ```

pub mod aggregator;
pub mod alerts;
pub mod broadcast;
pub mod classifier;
pub mod config;
pub mod model;
pub mod persistence;
pub mod reliability;
pub mod stream;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::aggregator::{AggregateError, Aggregator, AggregatorConfig, Distribution};
    pub use crate::alerts::{AlertConfig, AlertDetector, AlertError, Evaluation};
    pub use crate::broadcast::{
        BroadcastConfig, Broadcaster, MetricsConfig, MetricsPublisher, OutboundMessage,
        Subscription,
    };
    pub use crate::classifier::{
        build_classifier, Classification, ClassificationError, Classifier, ClassifierConfig,
        ClassifierMode,
    };
    pub use crate::config::{ConfigError, PipelineConfig};
    pub use crate::model::{
        AggregateBucket, Alert, Analysis, Emotion, Event, Period, SentimentLabel,
    };
    pub use crate::persistence::{
        InMemorySentimentStore, PersistError, PostgresSentimentStore, SentimentStore,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::stream::{
        InMemoryStreamClient, RedisStreamClient, StreamClient, StreamEntry, StreamError,
        StreamFields,
    };
    pub use crate::worker::{
        CounterSnapshot, IngestionConfig, IngestionPool, IngestionPoolError, PipelineCounters,
    };
}

// Re-export key types at crate root
pub use aggregator::{AggregateError, Aggregator, AggregatorConfig, Distribution};
pub use alerts::{AlertConfig, AlertDetector, AlertError};
pub use broadcast::{BroadcastConfig, Broadcaster, MetricsConfig, MetricsPublisher, OutboundMessage};
pub use classifier::{build_classifier, ClassificationError, Classifier, ClassifierConfig};
pub use config::{ConfigError, PipelineConfig};
pub use persistence::{InMemorySentimentStore, PersistError, PostgresSentimentStore, SentimentStore};
pub use reliability::RetryPolicy;
pub use stream::{InMemoryStreamClient, RedisStreamClient, StreamClient, StreamError};
pub use worker::{IngestionConfig, IngestionPool, IngestionPoolError, PipelineCounters};
