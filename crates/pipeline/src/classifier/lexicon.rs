//! Local rule-based classifier

use async_trait::async_trait;

use super::{Classification, ClassificationError, Classifier};
use crate::model::{Emotion, SentimentLabel};

const MODEL_NAME: &str = "lexicon-v1";

const POSITIVE: &[&str] = &[
    "good", "great", "happy", "love", "loved", "loving", "excellent", "amazing", "awesome",
    "fantastic", "wonderful", "best", "nice", "glad", "excited", "delighted", "enjoy",
    "enjoyed", "perfect", "beautiful", "brilliant", "thanks", "thank", "impressive", "win",
    "recommend", "fast", "helpful", "smooth",
];

const NEGATIVE: &[&str] = &[
    "bad", "sad", "hate", "hated", "terrible", "awful", "horrible", "worst", "poor", "angry",
    "disappointed", "disappointing", "broken", "slow", "useless", "annoying", "fail",
    "failed", "failure", "bug", "crash", "crashed", "scam", "refund", "upset", "disgusting",
    "worried", "afraid", "problem", "waste",
];

const NEGATORS: &[&str] = &["not", "no", "never", "nothing", "hardly", "without"];

const EMOTIONS: &[(Emotion, &[&str])] = &[
    (
        Emotion::Joy,
        &["happy", "joy", "love", "excited", "delighted", "glad", "great", "awesome", "enjoy"],
    ),
    (
        Emotion::Sadness,
        &["sad", "unhappy", "depressed", "cry", "crying", "miss", "lonely", "disappointed"],
    ),
    (
        Emotion::Anger,
        &["angry", "furious", "hate", "mad", "outraged", "annoyed", "annoying", "scam"],
    ),
    (
        Emotion::Fear,
        &["afraid", "scared", "fear", "worried", "anxious", "terrified", "nervous"],
    ),
    (
        Emotion::Surprise,
        &["surprised", "wow", "shocked", "unexpected", "unbelievable", "omg"],
    ),
    (
        Emotion::Disgust,
        &["disgusting", "gross", "nasty", "revolting", "vile", "yuck"],
    ),
];

/// Keyword-lexicon sentiment and emotion classifier
///
/// Counts positive and negative terms, flipping a term that directly follows
/// a negator ("not good" counts as negative). A single unopposed hit yields
/// confidence 0.9; text with no hits is neutral at 0.6.
#[derive(Debug, Default, Clone)]
pub struct LexiconClassifier;

impl LexiconClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify synchronously; the local model never fails
    pub fn analyze(&self, text: &str) -> Classification {
        let tokens = tokenize(text);

        let mut positive = 0u32;
        let mut negative = 0u32;
        for (i, token) in tokens.iter().enumerate() {
            let negated = i > 0 && is_negator(&tokens[i - 1]);
            let polarity = if POSITIVE.contains(&token.as_str()) {
                1
            } else if NEGATIVE.contains(&token.as_str()) {
                -1
            } else {
                0
            };
            match (polarity, negated) {
                (1, false) | (-1, true) => positive += 1,
                (-1, false) | (1, true) => negative += 1,
                _ => {}
            }
        }

        let hits = positive + negative;
        let (label, confidence) = if hits == 0 {
            (SentimentLabel::Neutral, 0.6)
        } else {
            let score = positive as f64 - negative as f64;
            let strength = score.abs() / hits as f64;
            let label = if score > 0.0 {
                SentimentLabel::Positive
            } else if score < 0.0 {
                SentimentLabel::Negative
            } else {
                SentimentLabel::Neutral
            };
            (label, 0.5 + 0.4 * strength)
        };

        Classification {
            label,
            confidence,
            emotion: Some(detect_emotion(&tokens)),
            model_name: MODEL_NAME.to_string(),
        }
    }
}

#[async_trait]
impl Classifier for LexiconClassifier {
    fn model_name(&self) -> &str {
        MODEL_NAME
    }

    async fn classify(&self, text: &str) -> Result<Classification, ClassificationError> {
        Ok(self.analyze(text))
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|t| !t.is_empty())
        .map(|t| t.trim_matches('\'').to_string())
        .collect()
}

fn is_negator(token: &str) -> bool {
    NEGATORS.contains(&token) || token.ends_with("n't")
}

fn detect_emotion(tokens: &[String]) -> Emotion {
    let mut best = (Emotion::Neutral, 0usize);
    for (emotion, words) in EMOTIONS {
        let hits = tokens
            .iter()
            .filter(|t| words.contains(&t.as_str()))
            .count();
        if hits > best.1 {
            best = (*emotion, hits);
        }
    }
    best.0
}
