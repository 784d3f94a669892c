//! StreamClient trait definition

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

/// Field/value pairs of one log entry
pub type StreamFields = BTreeMap<String, String>;

/// An entry read from the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Log-assigned identifier, monotonically increasing per stream
    pub id: String,
    pub fields: StreamFields,
}

impl StreamEntry {
    pub fn new(id: impl Into<String>, fields: StreamFields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Field value, if present
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Error type for log operations
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Connectivity loss; safe to retry
    #[error("stream connection error: {0}")]
    Connection(String),

    /// The consumer group does not exist on the stream
    #[error("consumer group {group} not found on stream {stream}")]
    GroupNotFound { stream: String, group: String },

    /// Any other command failure
    #[error("stream command failed: {0}")]
    Command(String),
}

impl StreamError {
    /// Whether the operation may succeed if repeated after a delay
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Access to a durable append-only log with consumer groups
///
/// Entries are delivered in append order per stream. An entry delivered by
/// [`read_group`](StreamClient::read_group) stays pending until it is acked or
/// claimed by another consumer; the client never deletes entries.
#[async_trait]
pub trait StreamClient: Send + Sync + 'static {
    /// Create the stream and group if missing. Existing groups are left untouched.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StreamError>;

    /// Append an entry, returning the id the log assigned to it
    async fn append(&self, stream: &str, fields: &StreamFields) -> Result<String, StreamError>;

    /// Read up to `count` never-delivered entries for `consumer`, waiting up
    /// to `block` for the first one. Returned entries are pending for `consumer`.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// Acknowledge an entry, removing it from the pending list
    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), StreamError>;

    /// Transfer up to `count` entries pending longer than `min_idle` to
    /// `consumer` and return them
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// Fire-and-forget pub/sub notification, returning how many listeners received it
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StreamError>;

    /// Cheap reachability check
    async fn ping(&self) -> Result<(), StreamError>;
}
