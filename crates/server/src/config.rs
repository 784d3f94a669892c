// Server process configuration
//
// Pipeline knobs live in sentiflow_pipeline::PipelineConfig; this only covers
// what the binary itself needs to bind and connect.

use anyhow::{Context, Result};

/// Bind address and backing service URLs
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub redis_url: String,
    /// Upper bound on database pool size
    pub database_max_connections: u32,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let port = match std::env::var("API_PORT") {
            Ok(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("invalid API_PORT: {raw:?}"))?,
            Err(_) => 8000,
        };
        let database_max_connections = match std::env::var("DATABASE_MAX_CONNECTIONS") {
            Ok(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("invalid DATABASE_MAX_CONNECTIONS: {raw:?}"))?,
            Err(_) => 10,
        };

        Ok(Self {
            host: std::env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port,
            database_url: std::env::var("DATABASE_URL")
                .context("DATABASE_URL environment variable required")?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            database_max_connections,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
