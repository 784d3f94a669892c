//! SentimentStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Alert, Analysis, AnalysisRecord, Event, SentimentLabel};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// A stored value could not be mapped back into the model
    #[error("corrupt row: {0}")]
    CorruptRow(String),

    /// The operation did not finish within its deadline
    #[error("persistence timed out")]
    Timeout,
}

/// Which timestamp a time-range query filters on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeField {
    /// When the event was created upstream
    CreatedAt,
    /// When the analysis was produced
    AnalyzedAt,
}

/// Time range and filters for reading analyses
///
/// Both range bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisQuery {
    pub time_field: TimeField,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub source: Option<String>,
}

impl AnalysisQuery {
    pub fn new(time_field: TimeField, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            time_field,
            start,
            end,
            source: None,
        }
    }

    /// Restrict to events from one source
    pub fn with_source(mut self, source: Option<impl Into<String>>) -> Self {
        self.source = source.map(Into::into);
        self
    }

    /// Whether a record falls inside this query
    pub fn matches(&self, record: &AnalysisRecord) -> bool {
        let ts = match self.time_field {
            TimeField::CreatedAt => record.created_at,
            TimeField::AnalyzedAt => record.analyzed_at,
        };
        ts >= self.start
            && ts <= self.end
            && self
                .source
                .as_deref()
                .map_or(true, |s| s == record.source)
    }
}

/// Per-label counts over a query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelCounts {
    pub positive: u64,
    pub negative: u64,
    pub neutral: u64,
}

impl LabelCounts {
    pub fn total(&self) -> u64 {
        self.positive + self.negative + self.neutral
    }

    pub fn record(&mut self, label: SentimentLabel) {
        match label {
            SentimentLabel::Positive => self.positive += 1,
            SentimentLabel::Negative => self.negative += 1,
            SentimentLabel::Neutral => self.neutral += 1,
        }
    }
}

impl FromIterator<SentimentLabel> for LabelCounts {
    fn from_iter<I: IntoIterator<Item = SentimentLabel>>(iter: I) -> Self {
        let mut counts = Self::default();
        for label in iter {
            counts.record(label);
        }
        counts
    }
}

/// Persistence port for events, analyses and alerts
///
/// Implementations must be idempotent on `Event::external_id`: storing the
/// same event twice leaves exactly one event row and one analysis row.
#[async_trait]
pub trait SentimentStore: Send + Sync + 'static {
    /// Insert the event if new and insert or update its single analysis
    async fn upsert_event_and_analysis(
        &self,
        event: &Event,
        analysis: &Analysis,
    ) -> Result<(), PersistError>;

    /// Analyses (joined with their event) matching `query`, oldest first
    async fn query_analyses(
        &self,
        query: &AnalysisQuery,
    ) -> Result<Vec<AnalysisRecord>, PersistError>;

    /// Label counts matching `query`
    ///
    /// The default folds [`query_analyses`](SentimentStore::query_analyses);
    /// SQL stores push the aggregation down.
    async fn count_labels(&self, query: &AnalysisQuery) -> Result<LabelCounts, PersistError> {
        let records = self.query_analyses(query).await?;
        Ok(records.into_iter().map(|r| r.label).collect())
    }

    /// Append an alert record
    async fn insert_alert(&self, alert: &Alert) -> Result<(), PersistError>;

    /// Cheap reachability check
    async fn ping(&self) -> Result<(), PersistError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(source: &str, created_at: DateTime<Utc>) -> AnalysisRecord {
        AnalysisRecord {
            event_id: "e1".into(),
            source: source.into(),
            label: SentimentLabel::Positive,
            confidence: 0.9,
            emotion: None,
            created_at,
            analyzed_at: created_at + Duration::seconds(1),
        }
    }

    #[test]
    fn test_query_bounds_are_inclusive() {
        let start = Utc::now() - Duration::hours(1);
        let end = Utc::now();
        let query = AnalysisQuery::new(TimeField::CreatedAt, start, end);

        assert!(query.matches(&record("twitter", start)));
        assert!(query.matches(&record("twitter", end)));
        assert!(!query.matches(&record("twitter", start - Duration::seconds(1))));
    }

    #[test]
    fn test_query_source_filter() {
        let now = Utc::now();
        let query = AnalysisQuery::new(TimeField::CreatedAt, now - Duration::hours(1), now)
            .with_source(Some("reddit"));

        assert!(query.matches(&record("reddit", now)));
        assert!(!query.matches(&record("twitter", now)));
    }

    #[test]
    fn test_query_by_analyzed_at() {
        let now = Utc::now();
        let query = AnalysisQuery::new(TimeField::AnalyzedAt, now, now + Duration::seconds(1));
        // analyzed_at is one second after created_at
        assert!(query.matches(&record("twitter", now)));
    }

    #[test]
    fn test_label_counts_from_iter() {
        let counts: LabelCounts = [
            SentimentLabel::Negative,
            SentimentLabel::Negative,
            SentimentLabel::Neutral,
        ]
        .into_iter()
        .collect();

        assert_eq!(counts.negative, 2);
        assert_eq!(counts.neutral, 1);
        assert_eq!(counts.total(), 3);
    }
}
