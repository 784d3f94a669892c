//! Persistence layer for events, analyses and alerts
//!
//! This module provides:
//! - [`SentimentStore`] trait, idempotent on the external event id
//! - [`InMemorySentimentStore`] for testing
//! - [`PostgresSentimentStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemorySentimentStore;
pub use postgres::PostgresSentimentStore;
pub use store::{AnalysisQuery, LabelCounts, PersistError, SentimentStore, TimeField};
