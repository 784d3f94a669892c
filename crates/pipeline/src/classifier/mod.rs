//! Classification dispatch
//!
//! One [`Classifier`] port with variant implementations chosen at construction:
//! - [`LexiconClassifier`] - local rule-based sentiment and emotion
//! - [`RemoteClassifier`] - OpenAI-compatible chat completions API
//! - [`FallbackClassifier`] - primary with a secondary on failure

mod fallback;
mod lexicon;
mod remote;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{env_millis, env_or, env_string, ConfigError};
use crate::model::{Emotion, SentimentLabel};

pub use fallback::FallbackClassifier;
pub use lexicon::LexiconClassifier;
pub use remote::RemoteClassifier;

/// Result of classifying one text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: SentimentLabel,
    /// In `[0, 1]`
    pub confidence: f64,
    pub emotion: Option<Emotion>,
    pub model_name: String,
}

/// Classification errors
#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    /// The classifier did not answer within the deadline
    #[error("classification timed out after {0:?}")]
    Timeout(Duration),

    /// The backing model or service could not be reached
    #[error("classifier unavailable: {0}")]
    Unavailable(String),

    /// The backing model answered with something unusable
    #[error("invalid classifier response: {0}")]
    InvalidResponse(String),
}

/// Sentiment classification port
#[async_trait]
pub trait Classifier: Send + Sync + 'static {
    /// Model identifier recorded with each analysis
    fn model_name(&self) -> &str;

    /// Classify `text`
    async fn classify(&self, text: &str) -> Result<Classification, ClassificationError>;

    /// Classify `text`, failing with [`ClassificationError::Timeout`] after `timeout`
    async fn classify_with_timeout(
        &self,
        text: &str,
        timeout: Duration,
    ) -> Result<Classification, ClassificationError> {
        match tokio::time::timeout(timeout, self.classify(text)).await {
            Ok(result) => result,
            Err(_) => Err(ClassificationError::Timeout(timeout)),
        }
    }
}

/// Which classifier variant to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierMode {
    #[default]
    Local,
    Remote,
    /// Local first, remote when the local model fails
    Fallback,
}

impl std::str::FromStr for ClassifierMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" | "external" => Ok(Self::Remote),
            "fallback" => Ok(Self::Fallback),
            other => Err(format!("expected local, remote or fallback, got {other}")),
        }
    }
}

/// Classifier configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub mode: ClassifierMode,

    /// Chat completions endpoint of the remote model
    pub api_url: String,

    #[serde(skip)]
    pub api_key: Option<String>,

    pub model: String,

    /// HTTP request timeout for the remote model
    #[serde(with = "crate::config::duration_millis")]
    pub request_timeout: Duration,
}

impl std::fmt::Debug for ClassifierConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassifierConfig")
            .field("mode", &self.mode)
            .field("api_url", &self.api_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            mode: ClassifierMode::Local,
            api_url: remote::DEFAULT_API_URL.to_string(),
            api_key: None,
            model: remote::DEFAULT_MODEL.to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl ClassifierConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            mode: env_or("CLASSIFIER_MODE", defaults.mode)?,
            api_url: env_string("EXTERNAL_LLM_API_URL", &defaults.api_url),
            api_key: std::env::var("EXTERNAL_LLM_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            model: env_string("EXTERNAL_LLM_MODEL", &defaults.model),
            request_timeout: env_millis("EXTERNAL_LLM_TIMEOUT_MS", defaults.request_timeout)?,
        })
    }

    pub fn with_mode(mut self, mode: ClassifierMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

/// Construct the classifier selected by `config.mode`
pub fn build_classifier(config: &ClassifierConfig) -> Result<Arc<dyn Classifier>, ConfigError> {
    let remote = || -> Result<RemoteClassifier, ConfigError> {
        let key = config
            .api_key
            .clone()
            .ok_or(ConfigError::Missing("EXTERNAL_LLM_API_KEY"))?;
        RemoteClassifier::new(key, &config.api_url, &config.model, config.request_timeout).map_err(
            |e| ConfigError::Invalid {
                key: "EXTERNAL_LLM_API_URL",
                value: config.api_url.clone(),
                reason: e.to_string(),
            },
        )
    };

    let classifier: Arc<dyn Classifier> = match config.mode {
        ClassifierMode::Local => Arc::new(LexiconClassifier::new()),
        ClassifierMode::Remote => Arc::new(remote()?),
        ClassifierMode::Fallback => Arc::new(FallbackClassifier::new(
            Arc::new(LexiconClassifier::new()),
            Arc::new(remote()?),
        )),
    };

    info!(mode = ?config.mode, model = classifier.model_name(), "Classifier ready");
    Ok(classifier)
}
