//! Redis Streams implementation of StreamClient
//!
//! Commands map one-to-one onto the trait:
//! - `ensure_group` -> `XGROUP CREATE <stream> <group> 0 MKSTREAM` (BUSYGROUP is success)
//! - `append` -> `XADD <stream> *`
//! - `read_group` -> `XREADGROUP GROUP <group> <consumer> COUNT n BLOCK ms STREAMS <stream> >`
//! - `ack` -> `XACK`
//! - `claim_stale` -> `XAUTOCLAIM <stream> <group> <consumer> <min-idle> 0-0 COUNT n`
//! - `publish` -> `PUBLISH <channel> <payload>`

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client, RedisError};
use tracing::{debug, info, instrument, warn};

use super::client::*;
use crate::reliability::RetryPolicy;

/// Redis-backed log client
///
/// Ordinary commands share one [`ConnectionManager`], which reconnects on its
/// own. Blocking `XREADGROUP` calls get a dedicated connection per consumer so
/// a parked read never stalls acks or appends issued by other workers.
///
/// # Example
///
/// ```ignore
/// use sentiflow_pipeline::stream::RedisStreamClient;
///
/// let client = RedisStreamClient::connect("redis://127.0.0.1:6379").await?;
/// client.ensure_group("social_posts_stream", "sentiment_workers").await?;
/// ```
pub struct RedisStreamClient {
    client: Client,
    manager: ConnectionManager,
    readers: Mutex<HashMap<String, MultiplexedConnection>>,
    retry: RetryPolicy,
}

impl RedisStreamClient {
    /// Open a client and establish the shared connection
    pub async fn connect(url: &str) -> Result<Self, StreamError> {
        let client = Client::open(url).map_err(map_redis_error)?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(map_redis_error)?;

        info!("Connected to Redis");
        Ok(Self {
            client,
            manager,
            readers: Mutex::new(HashMap::new()),
            retry: RetryPolicy::exponential().with_max_attempts(5),
        })
    }

    /// Set the retry policy applied to appends
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    async fn reader_connection(&self, consumer: &str) -> Result<MultiplexedConnection, StreamError> {
        if let Some(conn) = self.readers.lock().get(consumer) {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        self.readers
            .lock()
            .insert(consumer.to_string(), conn.clone());
        debug!(consumer, "Opened dedicated read connection");
        Ok(conn)
    }

    fn drop_reader(&self, consumer: &str) {
        self.readers.lock().remove(consumer);
    }
}

#[async_trait]
impl StreamClient for RedisStreamClient {
    #[instrument(skip(self))]
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StreamError> {
        let mut conn = self.manager.clone();
        let result: Result<(), RedisError> = conn.xgroup_create_mkstream(stream, group, "0").await;

        match result {
            Ok(()) => {
                info!(stream, group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream, group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(map_redis_error(e)),
        }
    }

    #[instrument(skip(self, fields))]
    async fn append(&self, stream: &str, fields: &StreamFields) -> Result<String, StreamError> {
        let items: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        self.retry
            .retry("stream.append", StreamError::is_transient, || {
                let mut conn = self.manager.clone();
                let items = &items;
                async move {
                    let id: String = conn
                        .xadd(stream, "*", items.as_slice())
                        .await
                        .map_err(map_redis_error)?;
                    Ok(id)
                }
            })
            .await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut conn = self.reader_connection(consumer).await?;
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count.max(1))
            .block(block_millis(block));

        let reply: Option<StreamReadReply> =
            match conn.xread_options(&[stream], &[">"], &options).await {
                Ok(reply) => reply,
                Err(e) => {
                    let err = map_redis_error(e);
                    if err.is_transient() {
                        self.drop_reader(consumer);
                    }
                    return Err(err);
                }
            };

        let Some(reply) = reply else {
            return Ok(vec![]);
        };

        let entries: Vec<StreamEntry> = reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(convert_entry)
            .collect();

        if !entries.is_empty() {
            debug!(consumer, count = entries.len(), "Read entries from stream");
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), StreamError> {
        let mut conn = self.manager.clone();
        let acked: i64 = conn
            .xack(stream, group, &[entry_id])
            .await
            .map_err(map_redis_error)?;

        if acked == 0 {
            debug!(entry_id, "Entry was not pending at ack time");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut conn = self.manager.clone();
        let options = StreamAutoClaimOptions::default().count(count.max(1));
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                stream,
                group,
                consumer,
                min_idle.as_millis() as u64,
                "0-0",
                options,
            )
            .await
            .map_err(map_redis_error)?;

        if !reply.deleted_ids.is_empty() {
            warn!(
                count = reply.deleted_ids.len(),
                "Pending entries were trimmed from the stream before reclaim"
            );
        }

        Ok(reply.claimed.into_iter().map(convert_entry).collect())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StreamError> {
        let mut conn = self.manager.clone();
        let receivers: usize = conn
            .publish(channel, payload)
            .await
            .map_err(map_redis_error)?;
        Ok(receivers)
    }

    async fn ping(&self) -> Result<(), StreamError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }
}

/// `BLOCK` argument for `block`; zero becomes a 1 ms poll since `BLOCK 0` waits forever
fn block_millis(block: Duration) -> usize {
    block.as_millis().max(1) as usize
}

fn convert_entry(raw: StreamId) -> StreamEntry {
    let fields = raw
        .map
        .iter()
        .filter_map(|(k, v)| {
            redis::from_redis_value::<String>(v)
                .ok()
                .map(|value| (k.clone(), value))
        })
        .collect();
    StreamEntry::new(raw.id, fields)
}

fn map_redis_error(e: RedisError) -> StreamError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
    {
        StreamError::Connection(e.to_string())
    } else if e.code() == Some("NOGROUP") {
        StreamError::GroupNotFound {
            stream: String::new(),
            group: e.detail().unwrap_or_default().to_string(),
        }
    } else {
        StreamError::Command(e.to_string())
    }
}
