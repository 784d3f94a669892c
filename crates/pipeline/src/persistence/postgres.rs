//! PostgreSQL implementation of SentimentStore
//!
//! Idempotency comes from primary keys on the external event id:
//! - events are inserted with `ON CONFLICT DO NOTHING` (immutable once stored)
//! - analyses are upserted with `ON CONFLICT DO UPDATE`, keeping the first `analyzed_at`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, info, instrument};

use super::store::*;
use crate::model::{Alert, Analysis, AnalysisRecord, Emotion, Event, SentimentLabel};

/// PostgreSQL implementation of SentimentStore
///
/// # Example
///
/// ```ignore
/// use sentiflow_pipeline::PostgresSentimentStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/sentiflow").await?;
/// let store = PostgresSentimentStore::new(pool);
/// store.run_migrations().await?;
/// ```
#[derive(Clone)]
pub struct PostgresSentimentStore {
    pool: PgPool,
}

impl PostgresSentimentStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn run_migrations(&self) -> Result<(), PersistError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                PersistError::Database(e.to_string())
            })?;

        info!("Database migrations completed");
        Ok(())
    }
}

fn time_column(field: TimeField) -> &'static str {
    match field {
        TimeField::CreatedAt => "e.created_at",
        TimeField::AnalyzedAt => "a.analyzed_at",
    }
}

#[async_trait]
impl SentimentStore for PostgresSentimentStore {
    #[instrument(skip(self, event, analysis), fields(event_id = %event.external_id))]
    async fn upsert_event_and_analysis(
        &self,
        event: &Event,
        analysis: &Analysis,
    ) -> Result<(), PersistError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to begin transaction: {}", e);
            PersistError::Database(e.to_string())
        })?;

        sqlx::query(
            r#"
            INSERT INTO sentiment_events (external_id, source, content, author, created_at, ingested_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (external_id) DO NOTHING
            "#,
        )
        .bind(&event.external_id)
        .bind(&event.source)
        .bind(&event.content)
        .bind(&event.author)
        .bind(event.created_at)
        .bind(event.ingested_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to insert event: {}", e);
            PersistError::Database(e.to_string())
        })?;

        sqlx::query(
            r#"
            INSERT INTO sentiment_analyses (event_id, model_name, label, confidence, emotion, analyzed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (event_id) DO UPDATE
            SET model_name = EXCLUDED.model_name,
                label = EXCLUDED.label,
                confidence = EXCLUDED.confidence,
                emotion = EXCLUDED.emotion
            "#,
        )
        .bind(&event.external_id)
        .bind(&analysis.model_name)
        .bind(analysis.label.as_str())
        .bind(analysis.confidence)
        .bind(analysis.emotion.map(|e| e.as_str()))
        .bind(analysis.analyzed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to upsert analysis: {}", e);
            PersistError::Database(e.to_string())
        })?;

        tx.commit().await.map_err(|e| {
            error!("Failed to commit upsert: {}", e);
            PersistError::Database(e.to_string())
        })?;

        debug!(label = %analysis.label, "stored analysis");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn query_analyses(
        &self,
        query: &AnalysisQuery,
    ) -> Result<Vec<AnalysisRecord>, PersistError> {
        let column = time_column(query.time_field);
        let sql = format!(
            r#"
            SELECT a.event_id, e.source, a.label, a.confidence, a.emotion, e.created_at, a.analyzed_at
            FROM sentiment_analyses a
            JOIN sentiment_events e ON e.external_id = a.event_id
            WHERE {column} >= $1 AND {column} <= $2
              AND ($3::text IS NULL OR e.source = $3)
            ORDER BY {column} ASC
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(query.start)
            .bind(query.end)
            .bind(query.source.as_deref())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to query analyses: {}", e);
                PersistError::Database(e.to_string())
            })?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn count_labels(&self, query: &AnalysisQuery) -> Result<LabelCounts, PersistError> {
        let column = time_column(query.time_field);
        let sql = format!(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE a.label = 'positive') AS positive,
                COUNT(*) FILTER (WHERE a.label = 'negative') AS negative,
                COUNT(*) FILTER (WHERE a.label = 'neutral') AS neutral
            FROM sentiment_analyses a
            JOIN sentiment_events e ON e.external_id = a.event_id
            WHERE {column} >= $1 AND {column} <= $2
              AND ($3::text IS NULL OR e.source = $3)
            "#
        );

        let row = sqlx::query(&sql)
            .bind(query.start)
            .bind(query.end)
            .bind(query.source.as_deref())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to count labels: {}", e);
                PersistError::Database(e.to_string())
            })?;

        let positive: i64 = row.get("positive");
        let negative: i64 = row.get("negative");
        let neutral: i64 = row.get("neutral");

        Ok(LabelCounts {
            positive: positive.max(0) as u64,
            negative: negative.max(0) as u64,
            neutral: neutral.max(0) as u64,
        })
    }

    #[instrument(skip(self, alert), fields(alert_type = %alert.alert_type))]
    async fn insert_alert(&self, alert: &Alert) -> Result<(), PersistError> {
        sqlx::query(
            r#"
            INSERT INTO sentiment_alerts
                (alert_type, threshold_value, actual_value, window_start, window_end,
                 post_count, triggered_at, details)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&alert.alert_type)
        .bind(alert.threshold_value)
        .bind(alert.actual_value)
        .bind(alert.window_start)
        .bind(alert.window_end)
        .bind(alert.post_count as i64)
        .bind(alert.triggered_at)
        .bind(&alert.details)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert alert: {}", e);
            PersistError::Database(e.to_string())
        })?;

        Ok(())
    }

    async fn ping(&self) -> Result<(), PersistError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| PersistError::Database(e.to_string()))?;
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> Result<AnalysisRecord, PersistError> {
    let label: String = row.get("label");
    let emotion: Option<String> = row.get("emotion");
    let created_at: DateTime<Utc> = row.get("created_at");
    let analyzed_at: DateTime<Utc> = row.get("analyzed_at");

    Ok(AnalysisRecord {
        event_id: row.get("event_id"),
        source: row.get("source"),
        label: label
            .parse::<SentimentLabel>()
            .map_err(|e| PersistError::CorruptRow(e.to_string()))?,
        confidence: row.get("confidence"),
        // Unknown emotions from older classifier versions are dropped rather than failing the read.
        emotion: emotion.and_then(|e| e.parse::<Emotion>().ok()),
        created_at,
        analyzed_at,
    })
}
