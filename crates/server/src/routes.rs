// Read-only HTTP routes over the pipeline
//
// Thin adapters: every number comes from the Aggregator, the pipeline
// counters or a reachability check.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use sentiflow_pipeline::aggregator::{AggregateError, Aggregator, Percentages};
use sentiflow_pipeline::broadcast::Broadcaster;
use sentiflow_pipeline::model::Period;
use sentiflow_pipeline::persistence::SentimentStore;
use sentiflow_pipeline::stream::StreamClient;
use sentiflow_pipeline::worker::{CounterSnapshot, PipelineCounters};

/// Longest distribution window accepted over HTTP (one week)
const MAX_DISTRIBUTION_HOURS: u32 = 168;

// ============================================
// App State and Routes
// ============================================

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SentimentStore>,
    pub stream: Arc<dyn StreamClient>,
    pub aggregator: Arc<Aggregator>,
    pub broadcaster: Arc<Broadcaster>,
    pub counters: Arc<PipelineCounters>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sentiment/distribution", get(distribution))
        .route("/api/sentiment/aggregate", get(aggregate))
        .route("/api/stats", get(stats))
        .with_state(state)
}

/// Standard error body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn aggregate_error(e: AggregateError) -> Response {
    match e {
        AggregateError::Store(inner) => {
            error!("Aggregate query failed: {}", inner);
            error_response(StatusCode::SERVICE_UNAVAILABLE, "store unavailable")
        }
        other => error_response(StatusCode::BAD_REQUEST, other.to_string()),
    }
}

// ============================================
// Health
// ============================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub services: ServiceStatus,
    pub stats: StatsResponse,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub database: String,
    pub redis: String,
}

fn connection_status(ok: bool) -> String {
    if ok { "connected" } else { "disconnected" }.to_string()
}

/// GET /health - healthy (200) when both backends answer, otherwise degraded or unhealthy (503)
async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (db, redis) = tokio::join!(state.store.ping(), state.stream.ping());
    if let Err(e) = &db {
        warn!("Health check: database unreachable: {}", e);
    }
    if let Err(e) = &redis {
        warn!("Health check: redis unreachable: {}", e);
    }

    let (db_ok, redis_ok) = (db.is_ok(), redis.is_ok());
    let status = match (db_ok, redis_ok) {
        (true, true) => "healthy",
        (false, false) => "unhealthy",
        _ => "degraded",
    };
    let code = if db_ok && redis_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            timestamp: Utc::now(),
            services: ServiceStatus {
                database: connection_status(db_ok),
                redis: connection_status(redis_ok),
            },
            stats: StatsResponse::collect(&state),
        }),
    )
}

// ============================================
// Stats
// ============================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub counters: CounterSnapshot,
    pub subscribers: usize,
}

impl StatsResponse {
    fn collect(state: &AppState) -> Self {
        Self {
            counters: state.counters.snapshot(),
            subscribers: state.broadcaster.subscriber_count(),
        }
    }
}

/// GET /api/stats - pipeline counters and live subscriber count
async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse::collect(&state))
}

// ============================================
// Distribution
// ============================================

#[derive(Debug, Deserialize)]
pub struct DistributionQuery {
    pub hours: Option<u32>,
    pub source: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LabelCountsBody {
    pub positive: u64,
    pub negative: u64,
    pub neutral: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DistributionResponse {
    pub timeframe_hours: u32,
    pub source: Option<String>,
    pub distribution: LabelCountsBody,
    pub percentages: Percentages,
    pub total: u64,
    pub computed_at: DateTime<Utc>,
}

/// GET /api/sentiment/distribution?hours=&source=
async fn distribution(
    State(state): State<AppState>,
    Query(query): Query<DistributionQuery>,
) -> Response {
    let hours = query.hours.unwrap_or(24);
    if !(1..=MAX_DISTRIBUTION_HOURS).contains(&hours) {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("hours must be between 1 and {MAX_DISTRIBUTION_HOURS}"),
        );
    }

    let source = query.source.as_deref().filter(|s| !s.is_empty());
    match state.aggregator.distribution(hours, source).await {
        Ok(d) => Json(DistributionResponse {
            timeframe_hours: d.hours,
            percentages: d.percentages(),
            distribution: LabelCountsBody {
                positive: d.positive,
                negative: d.negative,
                neutral: d.neutral,
            },
            total: d.total,
            source: d.source,
            computed_at: d.computed_at,
        })
        .into_response(),
        Err(e) => aggregate_error(e),
    }
}

// ============================================
// Aggregate
// ============================================

#[derive(Debug, Deserialize)]
pub struct AggregateQuery {
    pub period: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub source: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BucketBody {
    pub timestamp: DateTime<Utc>,
    pub positive: u64,
    pub negative: u64,
    pub neutral: u64,
    pub total: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AggregateResponse {
    pub period: Period,
    pub data: Vec<BucketBody>,
}

/// GET /api/sentiment/aggregate?period=minute|hour|day&start=&end=&source=
async fn aggregate(
    State(state): State<AppState>,
    Query(query): Query<AggregateQuery>,
) -> Response {
    let period: Period = match query.period.parse() {
        Ok(p) => p,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("invalid period: {e}")),
    };

    let source = query.source.as_deref().filter(|s| !s.is_empty());
    match state
        .aggregator
        .bucketed(period, query.start, query.end, source)
        .await
    {
        Ok(buckets) => Json(AggregateResponse {
            period,
            data: buckets
                .into_iter()
                .map(|b| BucketBody {
                    timestamp: b.bucket_start,
                    total: b.total(),
                    positive: b.positive,
                    negative: b.negative,
                    neutral: b.neutral,
                })
                .collect(),
        })
        .into_response(),
        Err(e) => aggregate_error(e),
    }
}
