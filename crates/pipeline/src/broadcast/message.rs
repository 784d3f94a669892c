//! Outbound message schema for live subscribers

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Analysis, Emotion, Event, SentimentLabel};

/// Characters of content carried in a `new_result` preview
pub const CONTENT_PREVIEW_CHARS: usize = 120;

/// Message pushed to subscribers, serialized as `{"type": ..., ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// First message on every new subscription
    Connected {
        #[serde(rename = "subscriberId")]
        subscriber_id: u64,
    },

    /// One classified event
    NewResult { data: NewResultData },

    /// Periodic aggregate counts
    MetricsUpdate { data: MetricsData },
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::NewResult { .. } => "new_result",
            Self::MetricsUpdate { .. } => "metrics_update",
        }
    }

    /// Compact `new_result` for a freshly stored analysis
    pub fn new_result(event: &Event, analysis: &Analysis) -> Self {
        Self::NewResult {
            data: NewResultData {
                event_id: event.external_id.clone(),
                source: event.source.clone(),
                content_preview: preview(&event.content),
                label: analysis.label,
                confidence: analysis.confidence,
                emotion: analysis.emotion,
                timestamp: analysis.analyzed_at,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewResultData {
    pub event_id: String,
    pub source: String,
    pub content_preview: String,
    pub label: SentimentLabel,
    pub confidence: f64,
    pub emotion: Option<Emotion>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsData {
    /// Keyed by window name, e.g. `last_hour`
    pub windows: BTreeMap<String, WindowCounts>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCounts {
    pub total: u64,
    pub positive: u64,
    pub negative: u64,
    pub neutral: u64,
}

/// First [`CONTENT_PREVIEW_CHARS`] characters of `content`
pub fn preview(content: &str) -> String {
    match content.char_indices().nth(CONTENT_PREVIEW_CHARS) {
        Some((idx, _)) => content[..idx].to_string(),
        None => content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connected_wire_format() {
        let value = serde_json::to_value(OutboundMessage::Connected { subscriber_id: 7 }).unwrap();
        assert_eq!(value, json!({ "type": "connected", "subscriberId": 7 }));
    }

    #[test]
    fn test_new_result_wire_format() {
        let ts = "2024-05-17T13:42:19Z".parse::<DateTime<Utc>>().unwrap();
        let event = Event {
            external_id: "p-42".into(),
            source: "twitter".into(),
            content: "loving the new release".into(),
            author: "bob".into(),
            created_at: ts,
            ingested_at: ts,
        };
        let analysis = Analysis {
            event_id: "p-42".into(),
            model_name: "lexicon-v1".into(),
            label: SentimentLabel::Positive,
            confidence: 0.9,
            emotion: Some(Emotion::Joy),
            analyzed_at: ts,
        };

        let value = serde_json::to_value(OutboundMessage::new_result(&event, &analysis)).unwrap();
        assert_eq!(value["type"], "new_result");
        assert_eq!(value["data"]["eventId"], "p-42");
        assert_eq!(value["data"]["source"], "twitter");
        assert_eq!(value["data"]["contentPreview"], "loving the new release");
        assert_eq!(value["data"]["label"], "positive");
        assert_eq!(value["data"]["confidence"], 0.9);
        assert_eq!(value["data"]["emotion"], "joy");
        assert_eq!(value["data"]["timestamp"], "2024-05-17T13:42:19Z");
    }

    #[test]
    fn test_metrics_update_wire_format() {
        let mut windows = BTreeMap::new();
        windows.insert(
            "last_hour".to_string(),
            WindowCounts {
                total: 3,
                positive: 1,
                negative: 1,
                neutral: 1,
            },
        );
        let msg = OutboundMessage::MetricsUpdate {
            data: MetricsData {
                windows,
                timestamp: Utc::now(),
            },
        };

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "metrics_update");
        assert_eq!(value["data"]["windows"]["last_hour"]["total"], 3);
        assert_eq!(msg.kind(), "metrics_update");
    }

    #[test]
    fn test_preview_is_char_safe() {
        let long: String = "é".repeat(200);
        let p = preview(&long);
        assert_eq!(p.chars().count(), CONTENT_PREVIEW_CHARS);

        assert_eq!(preview("short"), "short");
    }
}
