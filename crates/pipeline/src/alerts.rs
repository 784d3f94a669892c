//! Sliding-window negative-sentiment alerting
//!
//! Every check interval the detector counts analyses produced in the trailing
//! window. With at least `min_posts` of them, it computes
//! `negative / max(positive, 1)` and writes one alert when the ratio reaches
//! the threshold. Consecutive breaching intervals each produce an alert.
//! Stored alerts are also published on the configured pub/sub channel when a
//! notifier is attached; a failed publish never undoes the stored alert.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{env_or, env_secs, env_string, non_zero, ConfigError, MIN_PERIOD};
use crate::model::Alert;
use crate::persistence::{AnalysisQuery, PersistError, SentimentStore, TimeField};
use crate::stream::StreamClient;

/// Alert type written for negative-ratio breaches
pub const HIGH_NEGATIVE_RATIO: &str = "high_negative_ratio";

/// Alert detector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    pub window_minutes: u32,
    pub threshold_ratio: f64,
    pub min_posts: u64,
    #[serde(with = "crate::config::duration_millis")]
    pub check_interval: Duration,
    /// Pub/sub channel that receives each stored alert
    pub channel: String,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            window_minutes: 5,
            threshold_ratio: 2.0,
            min_posts: 10,
            check_interval: Duration::from_secs(60),
            channel: "sentiment_alerts".to_string(),
        }
    }
}

impl AlertConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            window_minutes: env_or("ALERT_WINDOW_MINUTES", defaults.window_minutes)?,
            threshold_ratio: env_or("ALERT_NEGATIVE_RATIO_THRESHOLD", defaults.threshold_ratio)?,
            min_posts: env_or("ALERT_MIN_POSTS", defaults.min_posts)?,
            check_interval: non_zero(
                "ALERT_CHECK_INTERVAL_SECS",
                env_secs("ALERT_CHECK_INTERVAL_SECS", defaults.check_interval)?,
            )?,
            channel: env_string("ALERT_CHANNEL", &defaults.channel),
        })
    }

    pub fn with_window_minutes(mut self, minutes: u32) -> Self {
        self.window_minutes = minutes;
        self
    }

    pub fn with_threshold_ratio(mut self, ratio: f64) -> Self {
        self.threshold_ratio = ratio;
        self
    }

    pub fn with_min_posts(mut self, min_posts: u64) -> Self {
        self.min_posts = min_posts;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.max(MIN_PERIOD);
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }
}

/// Alert errors
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("alert evaluation failed: {0}")]
    Store(#[from] PersistError),
}

/// Detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertState {
    Idle,
    Evaluating,
    Triggered,
}

/// Outcome of one evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// Fewer than `min_posts` analyses in the window
    InsufficientData { post_count: u64 },
    /// Enough data, ratio under the threshold
    BelowThreshold { ratio: f64, post_count: u64 },
    /// Ratio reached the threshold; the alert has been stored
    Triggered(Alert),
}

/// Evaluates the trailing window and records alerts
pub struct AlertDetector {
    store: Arc<dyn SentimentStore>,
    notifier: Option<Arc<dyn StreamClient>>,
    config: AlertConfig,
    state: Mutex<AlertState>,
}

impl AlertDetector {
    pub fn new(store: Arc<dyn SentimentStore>, config: AlertConfig) -> Self {
        Self {
            store,
            notifier: None,
            config,
            state: Mutex::new(AlertState::Idle),
        }
    }

    /// Publish every stored alert on `config.channel` through `notifier`
    pub fn with_notifier(mut self, notifier: Arc<dyn StreamClient>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn state(&self) -> AlertState {
        *self.state.lock()
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    fn transition(&self, next: AlertState) {
        let mut state = self.state.lock();
        debug!(from = ?*state, to = ?next, "Alert detector transition");
        *state = next;
    }

    /// Evaluate the window ending now
    pub async fn evaluate(&self) -> Result<Evaluation, AlertError> {
        self.evaluate_at(Utc::now()).await
    }

    /// Evaluate the window `[now - window_minutes, now]`
    #[instrument(skip(self))]
    pub async fn evaluate_at(&self, now: DateTime<Utc>) -> Result<Evaluation, AlertError> {
        self.transition(AlertState::Evaluating);
        let result = self.evaluate_window(now).await;
        self.transition(AlertState::Idle);
        result
    }

    async fn evaluate_window(&self, now: DateTime<Utc>) -> Result<Evaluation, AlertError> {
        let window_start = now - chrono::Duration::minutes(i64::from(self.config.window_minutes));
        let counts = self
            .store
            .count_labels(&AnalysisQuery::new(TimeField::AnalyzedAt, window_start, now))
            .await?;

        let post_count = counts.total();
        if post_count < self.config.min_posts {
            return Ok(Evaluation::InsufficientData { post_count });
        }

        // Floor at one positive so an all-negative window still yields a finite ratio.
        let ratio = counts.negative as f64 / counts.positive.max(1) as f64;
        if ratio < self.config.threshold_ratio {
            return Ok(Evaluation::BelowThreshold { ratio, post_count });
        }

        let alert = Alert {
            alert_type: HIGH_NEGATIVE_RATIO.to_string(),
            threshold_value: self.config.threshold_ratio,
            actual_value: ratio,
            window_start,
            window_end: now,
            post_count,
            triggered_at: Utc::now(),
            details: json!({
                "positive_count": counts.positive,
                "negative_count": counts.negative,
                "neutral_count": counts.neutral,
                "total_count": post_count,
                "window_minutes": self.config.window_minutes,
            }),
        };

        self.store.insert_alert(&alert).await?;
        self.transition(AlertState::Triggered);
        self.notify(&alert).await;
        warn!(
            ratio,
            threshold = self.config.threshold_ratio,
            post_count,
            "Negative sentiment alert triggered"
        );
        Ok(Evaluation::Triggered(alert))
    }

    async fn notify(&self, alert: &Alert) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let payload = match serde_json::to_string(alert) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize alert: {}", e);
                return;
            }
        };
        match notifier.publish(&self.config.channel, &payload).await {
            Ok(receivers) => debug!(channel = %self.config.channel, receivers, "Published alert"),
            Err(e) => warn!(channel = %self.config.channel, error = %e, "Failed to publish alert"),
        }
    }

    /// Spawn the periodic evaluation loop; it exits when `shutdown_rx` flips
    pub fn start(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                window_minutes = self.config.window_minutes,
                threshold = self.config.threshold_ratio,
                min_posts = self.config.min_posts,
                "Starting alert detector"
            );
            let mut ticker = tokio::time::interval(self.config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.evaluate().await {
                            Ok(outcome) => debug!(?outcome, "Alert evaluation finished"),
                            Err(e) => error!("Alert evaluation failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Alert loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Alert loop exited");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Analysis, Event, SentimentLabel};
    use crate::persistence::InMemorySentimentStore;
    use crate::stream::InMemoryStreamClient;

    async fn seed(store: &InMemorySentimentStore, label: SentimentLabel, n: usize, at: DateTime<Utc>) {
        for _ in 0..n {
            let id = uuid::Uuid::now_v7().to_string();
            let event = Event {
                external_id: id.clone(),
                source: "twitter".into(),
                content: "text".into(),
                author: "a".into(),
                created_at: at,
                ingested_at: at,
            };
            let analysis = Analysis {
                event_id: id,
                model_name: "test".into(),
                label,
                confidence: 0.9,
                emotion: None,
                analyzed_at: at,
            };
            store
                .upsert_event_and_analysis(&event, &analysis)
                .await
                .unwrap();
        }
    }

    fn detector(store: Arc<InMemorySentimentStore>) -> AlertDetector {
        AlertDetector::new(
            store,
            AlertConfig::default()
                .with_window_minutes(5)
                .with_threshold_ratio(2.0)
                .with_min_posts(10),
        )
    }

    #[tokio::test]
    async fn test_below_min_posts_never_triggers() {
        let store = Arc::new(InMemorySentimentStore::new());
        let now = Utc::now();
        seed(&store, SentimentLabel::Positive, 1, now).await;
        seed(&store, SentimentLabel::Negative, 5, now).await;

        let outcome = detector(store.clone()).evaluate_at(now).await.unwrap();
        assert_eq!(outcome, Evaluation::InsufficientData { post_count: 6 });
        assert!(store.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_breach_writes_exactly_one_alert() {
        let store = Arc::new(InMemorySentimentStore::new());
        let now = Utc::now();
        seed(&store, SentimentLabel::Positive, 3, now).await;
        seed(&store, SentimentLabel::Negative, 9, now).await;

        let detector = detector(store.clone());
        let outcome = detector.evaluate_at(now).await.unwrap();

        let alerts = store.alerts();
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.alert_type, HIGH_NEGATIVE_RATIO);
        assert_eq!(alert.actual_value, 3.0);
        assert_eq!(alert.threshold_value, 2.0);
        assert_eq!(alert.post_count, 12);
        assert_eq!(alert.window_end - alert.window_start, chrono::Duration::minutes(5));
        assert_eq!(alert.details["negative_count"], 9);
        assert_eq!(outcome, Evaluation::Triggered(alert.clone()));
        assert_eq!(detector.state(), AlertState::Idle);
    }

    #[tokio::test]
    async fn test_ratio_exactly_at_threshold_triggers() {
        let store = Arc::new(InMemorySentimentStore::new());
        let now = Utc::now();
        seed(&store, SentimentLabel::Positive, 4, now).await;
        seed(&store, SentimentLabel::Negative, 8, now).await;

        let outcome = detector(store).evaluate_at(now).await.unwrap();
        assert!(matches!(outcome, Evaluation::Triggered(ref a) if a.actual_value == 2.0));
    }

    #[tokio::test]
    async fn test_zero_positive_uses_floor_of_one() {
        let store = Arc::new(InMemorySentimentStore::new());
        let now = Utc::now();
        seed(&store, SentimentLabel::Negative, 10, now).await;

        let outcome = detector(store).evaluate_at(now).await.unwrap();
        assert!(matches!(outcome, Evaluation::Triggered(ref a) if a.actual_value == 10.0));
    }

    #[tokio::test]
    async fn test_neutral_counts_toward_min_posts_only() {
        let store = Arc::new(InMemorySentimentStore::new());
        let now = Utc::now();
        seed(&store, SentimentLabel::Positive, 5, now).await;
        seed(&store, SentimentLabel::Negative, 5, now).await;
        seed(&store, SentimentLabel::Neutral, 5, now).await;

        let outcome = detector(store).evaluate_at(now).await.unwrap();
        assert_eq!(
            outcome,
            Evaluation::BelowThreshold {
                ratio: 1.0,
                post_count: 15
            }
        );
    }

    #[tokio::test]
    async fn test_each_breaching_interval_alerts_again() {
        let store = Arc::new(InMemorySentimentStore::new());
        let now = Utc::now();
        seed(&store, SentimentLabel::Negative, 12, now).await;

        let detector = detector(store.clone());
        detector.evaluate_at(now).await.unwrap();
        detector
            .evaluate_at(now + chrono::Duration::seconds(60))
            .await
            .unwrap();

        assert_eq!(store.alerts().len(), 2);
    }

    #[tokio::test]
    async fn test_old_analyses_outside_window_ignored() {
        let store = Arc::new(InMemorySentimentStore::new());
        let now = Utc::now();
        seed(&store, SentimentLabel::Negative, 20, now - chrono::Duration::minutes(10)).await;

        let outcome = detector(store).evaluate_at(now).await.unwrap();
        assert_eq!(outcome, Evaluation::InsufficientData { post_count: 0 });
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_error() {
        let store = Arc::new(InMemorySentimentStore::new());
        store.set_failing(true);

        let detector = detector(store);
        assert!(detector.evaluate().await.is_err());
        assert_eq!(detector.state(), AlertState::Idle);
    }

    #[test]
    fn test_zero_check_interval_is_rejected() {
        std::env::set_var("ALERT_CHECK_INTERVAL_SECS", "0");
        let result = AlertConfig::from_env();
        std::env::remove_var("ALERT_CHECK_INTERVAL_SECS");

        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                key: "ALERT_CHECK_INTERVAL_SECS",
                ..
            })
        ));
        assert_eq!(
            AlertConfig::default()
                .with_check_interval(Duration::ZERO)
                .check_interval,
            crate::config::MIN_PERIOD
        );
    }

    #[tokio::test]
    async fn test_triggered_alert_is_published() {
        let store = Arc::new(InMemorySentimentStore::new());
        let notifier = Arc::new(InMemoryStreamClient::new());
        let now = Utc::now();
        seed(&store, SentimentLabel::Positive, 2, now).await;
        seed(&store, SentimentLabel::Negative, 10, now).await;

        let detector = detector(store.clone()).with_notifier(notifier.clone());
        detector.evaluate_at(now).await.unwrap();

        let published = notifier.published("sentiment_alerts");
        assert_eq!(published.len(), 1);
        let payload: serde_json::Value = serde_json::from_str(&published[0]).unwrap();
        assert_eq!(payload["alert_type"], HIGH_NEGATIVE_RATIO);
        assert_eq!(payload["actual_value"], 5.0);
        assert_eq!(store.alerts().len(), 1);
    }

    #[tokio::test]
    async fn test_quiet_window_publishes_nothing() {
        let store = Arc::new(InMemorySentimentStore::new());
        let notifier = Arc::new(InMemoryStreamClient::new());
        let now = Utc::now();
        seed(&store, SentimentLabel::Positive, 10, now).await;
        seed(&store, SentimentLabel::Negative, 2, now).await;

        let detector = detector(store).with_notifier(notifier.clone());
        detector.evaluate_at(now).await.unwrap();

        assert!(notifier.published("sentiment_alerts").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_alerts_once_per_breaching_interval() {
        let store = Arc::new(InMemorySentimentStore::new());
        seed(&store, SentimentLabel::Positive, 3, Utc::now()).await;
        seed(&store, SentimentLabel::Negative, 9, Utc::now()).await;

        let detector = AlertDetector::new(
            store.clone(),
            AlertConfig::default().with_check_interval(Duration::from_secs(60)),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = Arc::new(detector).start(shutdown_rx);

        // First tick fires at start, the second one interval later.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.alerts().len(), 2);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(store.alerts().len(), 2);
    }
}
