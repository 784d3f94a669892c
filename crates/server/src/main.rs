mod config;
mod routes;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, Method};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sentiflow_pipeline::prelude::*;

use crate::config::ServerConfig;

/// Wait budget for periodic tasks after the shutdown signal
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "sentiflow_pipeline=info,sentiflow_server=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("sentiflow-server starting...");

    let server_config = ServerConfig::from_env()?;
    let config = PipelineConfig::from_env().context("Invalid pipeline configuration")?;
    tracing::info!(
        bind = %server_config.bind_address(),
        ingestion = ?config.ingestion,
        classifier = ?config.classifier,
        aggregator = ?config.aggregator,
        alerts = ?config.alerts,
        broadcast = ?config.broadcast,
        metrics = ?config.metrics,
        "Configuration loaded"
    );

    let connect_policy = RetryPolicy::exponential().with_max_attempts(8);

    let stream = connect_policy
        .retry(
            "connect to redis",
            StreamError::is_transient,
            || RedisStreamClient::connect(&server_config.redis_url),
        )
        .await
        .context("Failed to connect to Redis")?;
    let stream: Arc<dyn StreamClient> = Arc::new(stream);

    let pool = connect_policy
        .retry(
            "connect to database",
            |_: &sqlx::Error| true,
            || {
                PgPoolOptions::new()
                    .max_connections(server_config.database_max_connections)
                    .acquire_timeout(Duration::from_secs(5))
                    .connect(&server_config.database_url)
            },
        )
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Connected to database");

    let postgres = PostgresSentimentStore::new(pool);
    postgres
        .run_migrations()
        .await
        .context("Failed to run database migrations")?;
    let store: Arc<dyn SentimentStore> = Arc::new(postgres);

    let classifier = build_classifier(&config.classifier).context("Failed to build classifier")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let broadcaster = Arc::new(Broadcaster::new(config.broadcast.queue_capacity));
    let aggregator = Arc::new(Aggregator::new(store.clone(), config.aggregator.clone()));

    let alert_detector =
        AlertDetector::new(store.clone(), config.alerts.clone()).with_notifier(stream.clone());
    let alert_handle = Arc::new(alert_detector).start(shutdown_rx.clone());
    let metrics_handle = MetricsPublisher::new(
        aggregator.clone(),
        broadcaster.clone(),
        config.metrics.clone(),
    )
    .start(shutdown_rx.clone());

    let ingestion = IngestionPool::new(
        stream.clone(),
        classifier,
        store.clone(),
        broadcaster.clone(),
        config.ingestion.clone(),
    );
    ingestion
        .start(shutdown_rx.clone())
        .await
        .context("Failed to start ingestion pool")?;

    let state = routes::AppState {
        store,
        stream,
        aggregator,
        broadcaster: broadcaster.clone(),
        counters: ingestion.counters(),
    };

    let app = Router::new()
        .merge(routes::routes(state))
        .merge(ws::routes(broadcaster.clone()));
    let app = with_cors(app).layer(TraceLayer::new_for_http());

    let addr = server_config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("HTTP server listening on {}", addr);

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone(), broadcaster.clone()))
        .await;

    // Also reached when the server fails on its own.
    begin_shutdown(&shutdown_tx, &broadcaster);

    if let Err(e) = ingestion.join().await {
        tracing::warn!("Ingestion pool did not stop cleanly: {}", e);
    }
    for (name, handle) in [("alerts", alert_handle), ("metrics", metrics_handle)] {
        if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, handle).await.is_err() {
            tracing::warn!(task = name, "Periodic task did not stop in time");
        }
    }

    serve_result.context("Server error")?;
    tracing::info!("Server shutdown complete");
    Ok(())
}

fn with_cors(app: Router) -> Router {
    let cors_origins: Vec<HeaderValue> = std::env::var("CORS_ALLOWED_ORIGINS")
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| s.split(',').filter_map(|s| s.trim().parse().ok()).collect())
        .unwrap_or_default();

    if cors_origins.is_empty() {
        tracing::info!("CORS not configured (same-origin requests only)");
        return app;
    }

    tracing::info!(origins = ?cors_origins, "CORS origins configured");
    app.layer(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(cors_origins))
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::ORIGIN]),
    )
}

fn begin_shutdown(shutdown_tx: &watch::Sender<bool>, broadcaster: &Broadcaster) {
    if *shutdown_tx.borrow() {
        return;
    }
    let _ = shutdown_tx.send(true);
    broadcaster.close_all();
}

/// Resolves on Ctrl-C or SIGTERM after signalling every task to stop
async fn shutdown_signal(shutdown_tx: Arc<watch::Sender<bool>>, broadcaster: Arc<Broadcaster>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
    begin_shutdown(&shutdown_tx, &broadcaster);
}
