//! On-demand sentiment aggregation over persisted analyses
//!
//! - [`Aggregator::distribution`] counts labels over a trailing window of
//!   event creation time, served from a short-lived [`DistributionCache`]
//! - [`Aggregator::bucketed`] splits an analysis-time range into contiguous,
//!   fixed-width buckets, emitting zero buckets where nothing was analyzed

mod cache;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::{env_or, env_secs, ConfigError};
use crate::model::{AggregateBucket, Period};
use crate::persistence::{AnalysisQuery, PersistError, SentimentStore, TimeField};

pub use cache::DistributionCache;

/// Aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatorConfig {
    /// How long a distribution result is reused
    #[serde(with = "crate::config::duration_millis")]
    pub cache_ttl: Duration,

    /// Buckets returned when no start date is given
    pub default_buckets: u32,

    /// Upper bound on buckets in one request
    pub max_buckets: u32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            default_buckets: 24,
            max_buckets: 10_000,
        }
    }
}

impl AggregatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            cache_ttl: env_secs("AGGREGATE_CACHE_TTL_SECS", defaults.cache_ttl)?,
            default_buckets: env_or("AGGREGATE_DEFAULT_BUCKETS", defaults.default_buckets)?,
            max_buckets: env_or("AGGREGATE_MAX_BUCKETS", defaults.max_buckets)?,
        })
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }
}

/// Aggregation errors
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("window must cover at least one hour")]
    InvalidHours,

    #[error("start {start} is after end {end}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("range needs {requested} buckets, limit is {max}")]
    TooManyBuckets { requested: i64, max: u32 },

    #[error(transparent)]
    Store(#[from] PersistError),
}

/// Label counts over a trailing window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    pub hours: u32,
    pub source: Option<String>,
    pub positive: u64,
    pub negative: u64,
    pub neutral: u64,
    pub total: u64,
    /// When the counts were read from the store (preserved on cache hits)
    pub computed_at: DateTime<Utc>,
}

/// Share of each label, in percent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Percentages {
    pub positive: f64,
    pub negative: f64,
    pub neutral: f64,
}

impl Distribution {
    /// `100 * count / total` per label; all zero when `total == 0`
    pub fn percentages(&self) -> Percentages {
        let pct = |count: u64| {
            if self.total == 0 {
                0.0
            } else {
                count as f64 * 100.0 / self.total as f64
            }
        };
        Percentages {
            positive: pct(self.positive),
            negative: pct(self.negative),
            neutral: pct(self.neutral),
        }
    }
}

/// Read-side aggregation over the persistence port
pub struct Aggregator {
    store: Arc<dyn SentimentStore>,
    cache: DistributionCache,
    config: AggregatorConfig,
}

impl Aggregator {
    pub fn new(store: Arc<dyn SentimentStore>, config: AggregatorConfig) -> Self {
        Self {
            store,
            cache: DistributionCache::new(config.cache_ttl),
            config,
        }
    }

    /// Label counts for events created in the last `hours`
    pub async fn distribution(
        &self,
        hours: u32,
        source: Option<&str>,
    ) -> Result<Distribution, AggregateError> {
        self.distribution_at(hours, source, Utc::now()).await
    }

    /// [`distribution`](Self::distribution) evaluated at `now`
    #[instrument(skip(self))]
    pub async fn distribution_at(
        &self,
        hours: u32,
        source: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Distribution, AggregateError> {
        if hours == 0 {
            return Err(AggregateError::InvalidHours);
        }

        if let Some(hit) = self.cache.get(hours, source, now) {
            debug!(hours, "Distribution cache hit");
            return Ok(hit);
        }

        let query = AnalysisQuery::new(
            TimeField::CreatedAt,
            now - chrono::Duration::hours(i64::from(hours)),
            now,
        )
        .with_source(source);
        let counts = self.store.count_labels(&query).await?;

        let distribution = Distribution {
            hours,
            source: source.map(str::to_string),
            positive: counts.positive,
            negative: counts.negative,
            neutral: counts.neutral,
            total: counts.total(),
            computed_at: now,
        };
        self.cache.insert(hours, source, now, distribution.clone());
        Ok(distribution)
    }

    /// Contiguous buckets of width `period` covering `[start, end]`
    ///
    /// `end` defaults to now; `start` defaults to the beginning of the
    /// `default_buckets`-th bucket back from `end`.
    pub async fn bucketed(
        &self,
        period: Period,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        source: Option<&str>,
    ) -> Result<Vec<AggregateBucket>, AggregateError> {
        self.bucketed_at(period, start, end, source, Utc::now())
            .await
    }

    /// [`bucketed`](Self::bucketed) evaluated at `now`
    #[instrument(skip(self))]
    pub async fn bucketed_at(
        &self,
        period: Period,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        source: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<AggregateBucket>, AggregateError> {
        let width = period.duration();
        let end = end.unwrap_or(now);
        let start = start.unwrap_or_else(|| {
            period.floor(end) - width * (self.config.default_buckets.max(1) as i32 - 1)
        });
        if start > end {
            return Err(AggregateError::InvalidRange { start, end });
        }

        let first = period.floor(start);
        let last = period.floor(end);
        let width_secs = width.num_seconds();
        let requested = (last - first).num_seconds() / width_secs + 1;
        if requested > i64::from(self.config.max_buckets) {
            return Err(AggregateError::TooManyBuckets {
                requested,
                max: self.config.max_buckets,
            });
        }

        let mut buckets: Vec<AggregateBucket> = (0..requested)
            .map(|i| AggregateBucket::empty(first + width * i as i32, period))
            .collect();

        let query = AnalysisQuery::new(
            TimeField::AnalyzedAt,
            first,
            last + width - chrono::Duration::microseconds(1),
        )
        .with_source(source);

        for record in self.store.query_analyses(&query).await? {
            let offset = (period.floor(record.analyzed_at) - first).num_seconds() / width_secs;
            if let Some(bucket) = usize::try_from(offset).ok().and_then(|i| buckets.get_mut(i)) {
                bucket.record(record.label);
            }
        }

        Ok(buckets)
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }
}
