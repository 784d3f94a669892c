//! Primary/secondary classifier composition

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{Classification, ClassificationError, Classifier};

/// Tries `primary`, then `secondary` if the primary fails
///
/// The returned [`Classification::model_name`] names whichever model answered.
pub struct FallbackClassifier {
    primary: Arc<dyn Classifier>,
    secondary: Arc<dyn Classifier>,
    name: String,
}

impl FallbackClassifier {
    pub fn new(primary: Arc<dyn Classifier>, secondary: Arc<dyn Classifier>) -> Self {
        let name = format!("{}+{}", primary.model_name(), secondary.model_name());
        Self {
            primary,
            secondary,
            name,
        }
    }
}

#[async_trait]
impl Classifier for FallbackClassifier {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn classify(&self, text: &str) -> Result<Classification, ClassificationError> {
        match self.primary.classify(text).await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(
                    primary = self.primary.model_name(),
                    secondary = self.secondary.model_name(),
                    error = %e,
                    "Primary classifier failed, using secondary"
                );
                self.secondary.classify(text).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::LexiconClassifier;
    use crate::model::SentimentLabel;

    struct Broken;

    #[async_trait]
    impl Classifier for Broken {
        fn model_name(&self) -> &str {
            "broken"
        }

        async fn classify(&self, _text: &str) -> Result<Classification, ClassificationError> {
            Err(ClassificationError::Unavailable("model not loaded".into()))
        }
    }

    #[tokio::test]
    async fn test_falls_back_on_primary_failure() {
        let classifier =
            FallbackClassifier::new(Arc::new(Broken), Arc::new(LexiconClassifier::new()));

        let result = classifier.classify("happy customers").await.unwrap();
        assert_eq!(result.label, SentimentLabel::Positive);
        assert_eq!(result.model_name, "lexicon-v1");
        assert_eq!(classifier.model_name(), "broken+lexicon-v1");
    }

    #[tokio::test]
    async fn test_both_failing_returns_secondary_error() {
        let classifier = FallbackClassifier::new(Arc::new(Broken), Arc::new(Broken));
        assert!(classifier.classify("anything").await.is_err());
    }

    #[tokio::test]
    async fn test_primary_success_skips_secondary() {
        let classifier =
            FallbackClassifier::new(Arc::new(LexiconClassifier::new()), Arc::new(Broken));
        let result = classifier.classify("sad news").await.unwrap();
        assert_eq!(result.label, SentimentLabel::Negative);
    }
}
