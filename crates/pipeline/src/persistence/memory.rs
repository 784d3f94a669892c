//! In-memory implementation of SentimentStore for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::store::*;
use crate::model::{Alert, Analysis, AnalysisRecord, Event};

/// In-memory implementation of SentimentStore
///
/// Provides the same upsert semantics as the PostgreSQL implementation.
/// Failures can be injected with [`set_failing`](Self::set_failing).
///
/// # Example
///
/// ```
/// use sentiflow_pipeline::InMemorySentimentStore;
///
/// let store = InMemorySentimentStore::new();
/// assert_eq!(store.analysis_count(), 0);
/// ```
#[derive(Default)]
pub struct InMemorySentimentStore {
    events: RwLock<HashMap<String, Event>>,
    analyses: RwLock<HashMap<String, Analysis>>,
    alerts: RwLock<Vec<Alert>>,
    failing: AtomicBool,
}

impl InMemorySentimentStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_count(&self) -> usize {
        self.events.read().len()
    }

    pub fn analysis_count(&self) -> usize {
        self.analyses.read().len()
    }

    pub fn analysis(&self, event_id: &str) -> Option<Analysis> {
        self.analyses.read().get(event_id).cloned()
    }

    /// All alerts written so far, in insertion order
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().clone()
    }

    /// Make every operation fail with a database error until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), PersistError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(PersistError::Database("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SentimentStore for InMemorySentimentStore {
    async fn upsert_event_and_analysis(
        &self,
        event: &Event,
        analysis: &Analysis,
    ) -> Result<(), PersistError> {
        self.check_available()?;

        // Lock order: events, then analyses.
        let mut events = self.events.write();
        let mut analyses = self.analyses.write();

        events
            .entry(event.external_id.clone())
            .or_insert_with(|| event.clone());

        analyses
            .entry(event.external_id.clone())
            .and_modify(|existing| {
                existing.model_name = analysis.model_name.clone();
                existing.label = analysis.label;
                existing.confidence = analysis.confidence;
                existing.emotion = analysis.emotion;
            })
            .or_insert_with(|| Analysis {
                event_id: event.external_id.clone(),
                ..analysis.clone()
            });

        Ok(())
    }

    async fn query_analyses(
        &self,
        query: &AnalysisQuery,
    ) -> Result<Vec<AnalysisRecord>, PersistError> {
        self.check_available()?;

        let events = self.events.read();
        let analyses = self.analyses.read();

        let mut records: Vec<AnalysisRecord> = analyses
            .values()
            .filter_map(|a| {
                let event = events.get(&a.event_id)?;
                Some(AnalysisRecord {
                    event_id: a.event_id.clone(),
                    source: event.source.clone(),
                    label: a.label,
                    confidence: a.confidence,
                    emotion: a.emotion,
                    created_at: event.created_at,
                    analyzed_at: a.analyzed_at,
                })
            })
            .filter(|r| query.matches(r))
            .collect();

        records.sort_by_key(|r| match query.time_field {
            TimeField::CreatedAt => r.created_at,
            TimeField::AnalyzedAt => r.analyzed_at,
        });
        Ok(records)
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<(), PersistError> {
        self.check_available()?;
        self.alerts.write().push(alert.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<(), PersistError> {
        self.check_available()
    }
}
