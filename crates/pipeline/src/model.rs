//! Core data model shared by every pipeline component

use std::str::FromStr;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

/// Sentiment label assigned by a classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentLabel {
    Positive,
    Negative,
    Neutral,
}

impl SentimentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Neutral => "neutral",
        }
    }
}

impl std::fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SentimentLabel {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "positive" | "pos" => Ok(Self::Positive),
            "negative" | "neg" => Ok(Self::Negative),
            "neutral" => Ok(Self::Neutral),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Emotion detected alongside the sentiment label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emotion {
    Joy,
    Sadness,
    Anger,
    Fear,
    Surprise,
    Disgust,
    Neutral,
}

impl Emotion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Joy => "joy",
            Self::Sadness => "sadness",
            Self::Anger => "anger",
            Self::Fear => "fear",
            Self::Surprise => "surprise",
            Self::Disgust => "disgust",
            Self::Neutral => "neutral",
        }
    }
}

impl std::fmt::Display for Emotion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Emotion {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "joy" | "happiness" => Ok(Self::Joy),
            "sadness" => Ok(Self::Sadness),
            "anger" => Ok(Self::Anger),
            "fear" => Ok(Self::Fear),
            "surprise" => Ok(Self::Surprise),
            "disgust" => Ok(Self::Disgust),
            "neutral" => Ok(Self::Neutral),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Returned when a stored or received string does not name a known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown variant: {0}")]
pub struct UnknownVariant(pub String);

/// A short text event produced upstream and read from the durable log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub external_id: String,
    pub source: String,
    pub content: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
}

/// Classification result persisted for an event (one per event)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub event_id: String,
    pub model_name: String,
    pub label: SentimentLabel,
    pub confidence: f64,
    pub emotion: Option<Emotion>,
    pub analyzed_at: DateTime<Utc>,
}

/// Analysis joined with the event columns the aggregator filters on
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRecord {
    pub event_id: String,
    pub source: String,
    pub label: SentimentLabel,
    pub confidence: f64,
    pub emotion: Option<Emotion>,
    pub created_at: DateTime<Utc>,
    pub analyzed_at: DateTime<Utc>,
}

/// Width of an aggregate bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Minute,
    Hour,
    Day,
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    /// Length of one bucket
    pub fn duration(&self) -> Duration {
        match self {
            Self::Minute => Duration::minutes(1),
            Self::Hour => Duration::hours(1),
            Self::Day => Duration::days(1),
        }
    }

    /// Start of the bucket containing `ts` (UTC alignment)
    pub fn floor(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        // Truncation only fails for timestamps outside chrono's i64-nanosecond range.
        ts.duration_trunc(self.duration()).unwrap_or(ts)
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minute" => Ok(Self::Minute),
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Sentiment counts for one fixed-width time bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateBucket {
    pub bucket_start: DateTime<Utc>,
    pub period: Period,
    pub positive: u64,
    pub negative: u64,
    pub neutral: u64,
}

impl AggregateBucket {
    pub fn empty(bucket_start: DateTime<Utc>, period: Period) -> Self {
        Self {
            bucket_start,
            period,
            positive: 0,
            negative: 0,
            neutral: 0,
        }
    }

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

/// Alert written when a window violates the configured policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_type: String,
    pub threshold_value: f64,
    pub actual_value: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub post_count: u64,
    pub triggered_at: DateTime<Utc>,
    pub details: serde_json::Value,
}
