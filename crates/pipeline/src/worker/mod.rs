//! Ingestion workers
//!
//! This module provides:
//! - `IngestionPool`: N consumers sharing one consumer group, plus a reclaim loop
//! - `StreamPoller`: blocking group reads with backoff on failure
//! - `EntryProcessor`: the validate → classify → persist → publish → ack cycle
//! - `PipelineCounters`: processed / failed / rejected totals
//!
//! ```text
//!            ┌──────────────────────────────┐
//!            │        durable log           │
//!            └──────┬──────────┬────────────┘
//!        read_group │          │ claim_stale (every reclaim_interval)
//!        ┌──────────▼──┐   ┌───▼──────────┐
//!        │ worker 0..N │   │ reclaim loop │
//!        └──────┬──────┘   └───┬──────────┘
//!               └──────┬───────┘
//!                      ▼
//!               EntryProcessor ──► Classifier ──► SentimentStore ──► Broadcaster
//!                      │
//!                      └──► ack
//! ```

mod counters;
mod poller;
mod pool;
mod processor;

pub use counters::{CounterSnapshot, PipelineCounters};
pub use poller::{PollerSettings, StreamPoller};
pub use pool::{IngestionConfig, IngestionPool, IngestionPoolError};
pub use processor::{
    event_fields, parse_event, EntryProcessor, IngestionError, Outcome, ProcessorSettings,
    ValidationError,
};
