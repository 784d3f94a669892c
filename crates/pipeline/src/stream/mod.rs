//! Durable log access through consumer groups
//!
//! This module provides:
//! - [`StreamClient`] trait: the four group verbs plus `append` and group setup
//! - [`InMemoryStreamClient`] for testing
//! - [`RedisStreamClient`] backed by Redis Streams
//!
//! Consumer-group state (cursor and pending-entries list) belongs to the log.
//! Callers only move it forward through `ack` and `claim_stale`.

mod client;
mod memory;
mod redis_stream;

pub use client::{StreamClient, StreamEntry, StreamError, StreamFields};
pub use memory::InMemoryStreamClient;
pub use redis_stream::RedisStreamClient;
