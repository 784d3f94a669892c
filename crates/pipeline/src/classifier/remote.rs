//! Remote classifier over an OpenAI-compatible chat completions API

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{Classification, ClassificationError, Classifier};
use crate::model::{Emotion, SentimentLabel};

pub(crate) const DEFAULT_API_URL: &str = "https://api.groq.com/openai/v1/chat/completions";
pub(crate) const DEFAULT_MODEL: &str = "llama-3.1-8b-instant";

const SYSTEM_PROMPT: &str = "You are a sentiment classifier for short social media posts. \
Reply with a JSON object with keys \"label\" (one of positive, negative, neutral), \
\"confidence\" (number between 0 and 1) and \"emotion\" (one of joy, sadness, anger, fear, \
surprise, disgust, neutral). Reply with the JSON object only.";

/// Classifier backed by a hosted LLM
///
/// # Example
///
/// ```ignore
/// use sentiflow_pipeline::classifier::RemoteClassifier;
///
/// let classifier = RemoteClassifier::new(
///     "your-api-key",
///     "https://api.groq.com/openai/v1/chat/completions",
///     "llama-3.1-8b-instant",
///     Duration::from_secs(10),
/// )?;
/// ```
#[derive(Clone)]
pub struct RemoteClassifier {
    client: Client,
    api_key: String,
    api_url: String,
    model: String,
}

impl RemoteClassifier {
    pub fn new(
        api_key: impl Into<String>,
        api_url: impl Into<String>,
        model: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            api_url: api_url.into(),
            model: model.into(),
        })
    }

    /// Get the API URL
    pub fn api_url(&self) -> &str {
        &self.api_url
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    response_format: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Verdict {
    label: String,
    confidence: Option<f64>,
    emotion: Option<String>,
}

#[async_trait]
impl Classifier for RemoteClassifier {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn classify(&self, text: &str) -> Result<Classification, ClassificationError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: text,
                },
            ],
            temperature: 0.0,
            response_format: json!({ "type": "json_object" }),
        };

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ClassificationError::Unavailable(format!("failed to send request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            warn!(%status, "Remote classifier returned an error");
            return Err(ClassificationError::Unavailable(format!(
                "API error ({}): {}",
                status, error_text
            )));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ClassificationError::InvalidResponse(e.to_string()))?;

        let classification = parse_completion(body, &self.model)?;
        debug!(label = %classification.label, "Remote classification");
        Ok(classification)
    }
}

fn parse_completion(body: ChatResponse, model: &str) -> Result<Classification, ClassificationError> {
    let content = body
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| ClassificationError::InvalidResponse("empty completion".to_string()))?;

    // Some models wrap JSON in a fenced block despite the response format.
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let verdict: Verdict = serde_json::from_str(trimmed)
        .map_err(|e| ClassificationError::InvalidResponse(format!("{}: {}", e, trimmed)))?;

    let label = verdict
        .label
        .parse::<SentimentLabel>()
        .map_err(|e| ClassificationError::InvalidResponse(e.to_string()))?;

    Ok(Classification {
        label,
        confidence: verdict.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        emotion: verdict.emotion.and_then(|e| e.parse::<Emotion>().ok()),
        model_name: model.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(content: &str) -> ChatResponse {
        serde_json::from_value(json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }]
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_well_formed_verdict() {
        let result = parse_completion(
            completion(r#"{"label": "negative", "confidence": 0.83, "emotion": "anger"}"#),
            DEFAULT_MODEL,
        )
        .unwrap();

        assert_eq!(result.label, SentimentLabel::Negative);
        assert_eq!(result.confidence, 0.83);
        assert_eq!(result.emotion, Some(Emotion::Anger));
        assert_eq!(result.model_name, DEFAULT_MODEL);
    }

    #[test]
    fn test_parse_fenced_verdict_and_clamps_confidence() {
        let result = parse_completion(
            completion("```json\n{\"label\": \"Positive\", \"confidence\": 1.7}\n```"),
            DEFAULT_MODEL,
        )
        .unwrap();

        assert_eq!(result.label, SentimentLabel::Positive);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.emotion, None);
    }

    #[test]
    fn test_parse_rejects_unknown_label() {
        let result = parse_completion(
            completion(r#"{"label": "mixed", "confidence": 0.5}"#),
            DEFAULT_MODEL,
        );
        assert!(matches!(result, Err(ClassificationError::InvalidResponse(_))));
    }

    #[test]
    fn test_parse_rejects_empty_choices() {
        let body: ChatResponse = serde_json::from_value(json!({ "choices": [] })).unwrap();
        assert!(matches!(
            parse_completion(body, DEFAULT_MODEL),
            Err(ClassificationError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_unavailable() {
        let classifier = RemoteClassifier::new(
            "key",
            "http://127.0.0.1:9/v1/chat/completions",
            DEFAULT_MODEL,
            Duration::from_secs(2),
        )
        .unwrap();

        let result = classifier.classify("hello").await;
        assert!(matches!(result, Err(ClassificationError::Unavailable(_))));
    }
}
