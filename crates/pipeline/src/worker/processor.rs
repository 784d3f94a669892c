//! Per-entry processing: validate, classify, persist, publish, ack

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use super::counters::PipelineCounters;
use crate::broadcast::{Broadcaster, OutboundMessage};
use crate::classifier::{ClassificationError, Classifier};
use crate::model::{Analysis, Event};
use crate::persistence::{PersistError, SentimentStore};
use crate::stream::{StreamClient, StreamEntry, StreamError, StreamFields};

const DEFAULT_SOURCE: &str = "unknown";
const DEFAULT_AUTHOR: &str = "unknown";

/// Column widths of `sentiment_events`, in characters
pub const MAX_EXTERNAL_ID_CHARS: usize = 255;
pub const MAX_SOURCE_CHARS: usize = 50;
pub const MAX_AUTHOR_CHARS: usize = 255;

/// A malformed log entry; acked and never retried
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing or empty field: {0}")]
    MissingField(&'static str),

    #[error("invalid created_at {value:?}: {reason}")]
    InvalidTimestamp { value: String, reason: String },

    #[error("field {field} exceeds {max} characters")]
    FieldTooLong { field: &'static str, max: usize },
}

/// Why an entry was left pending
#[derive(Debug, thiserror::Error)]
pub enum IngestionError {
    #[error(transparent)]
    Classification(#[from] ClassificationError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("ack failed: {0}")]
    Ack(#[from] StreamError),
}

/// Result of processing one entry
#[derive(Debug)]
pub enum Outcome {
    /// Stored, published and acked
    Processed,
    /// Malformed; acked without processing
    Rejected(ValidationError),
    /// Left pending for reclaim
    Failed(IngestionError),
    /// Shutdown began before persistence; left pending without counting
    Deferred,
}

/// Build an [`Event`] from log entry fields
///
/// `external_id` (or its legacy alias `post_id`) and `content` are required.
/// `source` and `author` default to `"unknown"`, `created_at` to `ingested_at`.
/// Values wider than their storage column are rejected.
pub fn parse_event(
    entry: &StreamEntry,
    ingested_at: DateTime<Utc>,
) -> Result<Event, ValidationError> {
    let non_empty = |name: &str| entry.field(name).map(str::trim).filter(|v| !v.is_empty());

    let external_id = non_empty("external_id")
        .or_else(|| non_empty("post_id"))
        .ok_or(ValidationError::MissingField("external_id"))?;
    let content = non_empty("content").ok_or(ValidationError::MissingField("content"))?;

    let created_at = match non_empty("created_at") {
        Some(raw) => parse_timestamp(raw)?,
        None => ingested_at,
    };

    let source = non_empty("source").unwrap_or(DEFAULT_SOURCE);
    let author = non_empty("author").unwrap_or(DEFAULT_AUTHOR);
    check_width("external_id", external_id, MAX_EXTERNAL_ID_CHARS)?;
    check_width("source", source, MAX_SOURCE_CHARS)?;
    check_width("author", author, MAX_AUTHOR_CHARS)?;

    Ok(Event {
        external_id: external_id.to_string(),
        source: source.to_string(),
        content: content.to_string(),
        author: author.to_string(),
        created_at,
        ingested_at,
    })
}

fn check_width(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.chars().count() > max {
        return Err(ValidationError::FieldTooLong { field, max });
    }
    Ok(())
}

/// Log entry fields for `event`, as a producer would append them
pub fn event_fields(event: &Event) -> StreamFields {
    let mut fields = StreamFields::new();
    fields.insert("external_id".into(), event.external_id.clone());
    fields.insert("source".into(), event.source.clone());
    fields.insert("content".into(), event.content.clone());
    fields.insert("author".into(), event.author.clone());
    fields.insert("created_at".into(), event.created_at.to_rfc3339());
    fields
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    // Offset-less ISO timestamps are taken as UTC.
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| ValidationError::InvalidTimestamp {
            value: raw.to_string(),
            reason: e.to_string(),
        })
}

/// Settings the processor needs from the ingestion config
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub stream_name: String,
    pub consumer_group: String,
    pub classify_timeout: Duration,
    pub persist_timeout: Duration,
}

/// Runs the validate → classify → persist → publish → ack cycle for one entry
pub struct EntryProcessor {
    stream: Arc<dyn StreamClient>,
    classifier: Arc<dyn Classifier>,
    store: Arc<dyn SentimentStore>,
    broadcaster: Arc<Broadcaster>,
    counters: Arc<PipelineCounters>,
    settings: ProcessorSettings,
}

impl EntryProcessor {
    pub fn new(
        stream: Arc<dyn StreamClient>,
        classifier: Arc<dyn Classifier>,
        store: Arc<dyn SentimentStore>,
        broadcaster: Arc<Broadcaster>,
        counters: Arc<PipelineCounters>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            stream,
            classifier,
            store,
            broadcaster,
            counters,
            settings,
        }
    }

    /// Process one entry and update the counters
    ///
    /// Once `shutdown` is set, no new persistence call is started; the entry
    /// stays pending and is reported as [`Outcome::Deferred`].
    pub async fn process(&self, entry: &StreamEntry, shutdown: &watch::Receiver<bool>) -> Outcome {
        let outcome = self.run(entry, shutdown).await;
        match &outcome {
            Outcome::Processed => self.counters.record_processed(),
            Outcome::Rejected(reason) => {
                warn!(entry_id = %entry.id, %reason, "Rejected malformed entry");
                self.counters.record_rejected();
            }
            Outcome::Failed(e) => {
                error!(entry_id = %entry.id, error = %e, "Entry failed, left pending");
                self.counters.record_failed();
            }
            Outcome::Deferred => {
                debug!(entry_id = %entry.id, "Shutdown in progress, entry left pending");
            }
        }
        outcome
    }

    async fn run(&self, entry: &StreamEntry, shutdown: &watch::Receiver<bool>) -> Outcome {
        let ingested_at = Utc::now();
        let event = match parse_event(entry, ingested_at) {
            Ok(event) => event,
            Err(reason) => {
                if let Err(e) = self.ack(&entry.id).await {
                    // Still rejected; the entry resurfaces via reclaim and is rejected again.
                    warn!(entry_id = %entry.id, error = %e, "Failed to ack rejected entry");
                }
                return Outcome::Rejected(reason);
            }
        };

        let classification = match self
            .classifier
            .classify_with_timeout(&event.content, self.settings.classify_timeout)
            .await
        {
            Ok(c) => c,
            Err(e) => return Outcome::Failed(e.into()),
        };

        if *shutdown.borrow() {
            return Outcome::Deferred;
        }

        let analysis = Analysis {
            event_id: event.external_id.clone(),
            model_name: classification.model_name,
            label: classification.label,
            confidence: classification.confidence.clamp(0.0, 1.0),
            emotion: classification.emotion,
            analyzed_at: Utc::now(),
        };

        let persisted = tokio::time::timeout(
            self.settings.persist_timeout,
            self.store.upsert_event_and_analysis(&event, &analysis),
        )
        .await;
        match persisted {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Outcome::Failed(e.into()),
            Err(_) => return Outcome::Failed(PersistError::Timeout.into()),
        }

        let delivered = self
            .broadcaster
            .publish(OutboundMessage::new_result(&event, &analysis));
        debug!(
            entry_id = %entry.id,
            event_id = %event.external_id,
            label = %analysis.label,
            delivered,
            "Published result"
        );

        match self.ack(&entry.id).await {
            Ok(()) => Outcome::Processed,
            Err(e) => Outcome::Failed(e.into()),
        }
    }

    async fn ack(&self, entry_id: &str) -> Result<(), StreamError> {
        self.stream
            .ack(
                &self.settings.stream_name,
                &self.settings.consumer_group,
                entry_id,
            )
            .await
    }
}
