//! In-memory implementation of StreamClient for testing

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::client::*;

struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Default)]
struct GroupState {
    /// Index of the next never-delivered entry
    next_index: usize,
    /// Pending entries keyed by their index in the stream
    pending: BTreeMap<usize, PendingEntry>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<StreamEntry>,
    positions: HashMap<String, usize>,
    groups: HashMap<String, GroupState>,
    last_millis: i64,
    sequence: u64,
}

impl StreamState {
    fn next_id(&mut self) -> String {
        let millis = Utc::now().timestamp_millis().max(self.last_millis);
        if millis == self.last_millis {
            self.sequence += 1;
        } else {
            self.last_millis = millis;
            self.sequence = 0;
        }
        format!("{}-{}", self.last_millis, self.sequence)
    }
}

/// In-memory log with consumer-group semantics
///
/// Mirrors the Redis Streams behaviour the pipeline relies on: groups start
/// at the beginning of the stream, delivered entries stay pending until acked,
/// and stale pending entries can be claimed by another consumer.
///
/// # Example
///
/// ```
/// use sentiflow_pipeline::stream::InMemoryStreamClient;
///
/// let client = InMemoryStreamClient::new();
/// assert_eq!(client.len("posts"), 0);
/// ```
#[derive(Default)]
pub struct InMemoryStreamClient {
    streams: Mutex<HashMap<String, StreamState>>,
    appended: Notify,
    published: Mutex<Vec<(String, String)>>,
}

impl InMemoryStreamClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries ever appended to `stream`
    pub fn len(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    /// Number of delivered but unacknowledged entries
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    /// Ids of pending entries owned by `consumer`
    pub fn pending_for(&self, stream: &str, group: &str, consumer: &str) -> Vec<String> {
        let streams = self.streams.lock();
        let Some(state) = streams.get(stream) else {
            return vec![];
        };
        state
            .groups
            .get(group)
            .map(|g| {
                g.pending
                    .iter()
                    .filter(|(_, p)| p.consumer == consumer)
                    .map(|(idx, _)| state.entries[*idx].id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Payloads published on `channel`, oldest first
    pub fn published(&self, channel: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Times the entry has been delivered, if it is pending
    pub fn delivery_count(&self, stream: &str, group: &str, entry_id: &str) -> Option<u32> {
        let streams = self.streams.lock();
        let state = streams.get(stream)?;
        let idx = state.positions.get(entry_id)?;
        state
            .groups
            .get(group)?
            .pending
            .get(idx)
            .map(|p| p.delivery_count)
    }

    fn try_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut streams = self.streams.lock();
        let not_found = || StreamError::GroupNotFound {
            stream: stream.to_string(),
            group: group.to_string(),
        };
        let state = streams.get_mut(stream).ok_or_else(not_found)?;
        let group_state = state.groups.get_mut(group).ok_or_else(not_found)?;

        let start = group_state.next_index;
        let end = (start + count).min(state.entries.len());
        let now = Instant::now();

        for idx in start..end {
            group_state.pending.insert(
                idx,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
        }
        group_state.next_index = end;

        Ok(state.entries[start..end].to_vec())
    }
}

#[async_trait]
impl StreamClient for InMemoryStreamClient {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StreamError> {
        let mut streams = self.streams.lock();
        streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn append(&self, stream: &str, fields: &StreamFields) -> Result<String, StreamError> {
        let id = {
            let mut streams = self.streams.lock();
            let state = streams.entry(stream.to_string()).or_default();
            let id = state.next_id();
            state.positions.insert(id.clone(), state.entries.len());
            state.entries.push(StreamEntry::new(id.clone(), fields.clone()));
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let deadline = Instant::now() + block;
        loop {
            // Register interest before checking so an append in between is not missed.
            let notified = self.appended.notified();

            let entries = self.try_read(stream, group, consumer, count.max(1))?;
            if !entries.is_empty() || Instant::now() >= deadline {
                return Ok(entries);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(vec![]);
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), StreamError> {
        let mut streams = self.streams.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(());
        };
        let Some(idx) = state.positions.get(entry_id).copied() else {
            return Ok(());
        };
        if let Some(group_state) = state.groups.get_mut(group) {
            group_state.pending.remove(&idx);
        }
        Ok(())
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut streams = self.streams.lock();
        let not_found = || StreamError::GroupNotFound {
            stream: stream.to_string(),
            group: group.to_string(),
        };
        let state = streams.get_mut(stream).ok_or_else(not_found)?;
        let group_state = state.groups.get_mut(group).ok_or_else(not_found)?;

        let now = Instant::now();
        let mut claimed = Vec::new();
        for (idx, pending) in group_state.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            if now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.delivery_count += 1;
            claimed.push(state.entries[*idx].clone());
        }

        Ok(claimed)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StreamError> {
        self.published
            .lock()
            .push((channel.to_string(), payload.to_string()));
        Ok(0)
    }

    async fn ping(&self) -> Result<(), StreamError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "posts";
    const GROUP: &str = "workers";

    fn fields(id: &str) -> StreamFields {
        let mut f = StreamFields::new();
        f.insert("external_id".into(), id.into());
        f.insert("content".into(), format!("content of {id}"));
        f
    }

    async fn client_with_group() -> InMemoryStreamClient {
        let client = InMemoryStreamClient::new();
        client.ensure_group(STREAM, GROUP).await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_read_group_delivers_in_append_order() {
        let client = client_with_group().await;
        for i in 0..5 {
            client.append(STREAM, &fields(&format!("p{i}"))).await.unwrap();
        }

        let first = client
            .read_group(STREAM, GROUP, "c1", 3, Duration::ZERO)
            .await
            .unwrap();
        let second = client
            .read_group(STREAM, GROUP, "c2", 3, Duration::ZERO)
            .await
            .unwrap();

        let ids: Vec<_> = first
            .iter()
            .chain(second.iter())
            .map(|e| e.field("external_id").unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["p0", "p1", "p2", "p3", "p4"]);
        assert_eq!(client.pending_count(STREAM, GROUP), 5);
    }

    #[tokio::test]
    async fn test_entry_ids_increase() {
        let client = client_with_group().await;
        let a = client.append(STREAM, &fields("a")).await.unwrap();
        let b = client.append(STREAM, &fields("b")).await.unwrap();

        let parse = |id: &str| {
            let (ms, seq) = id.split_once('-').unwrap();
            (ms.parse::<i64>().unwrap(), seq.parse::<u64>().unwrap())
        };
        assert!(parse(&a) < parse(&b));
    }

    #[tokio::test]
    async fn test_ack_removes_from_pending() {
        let client = client_with_group().await;
        let id = client.append(STREAM, &fields("a")).await.unwrap();
        client
            .read_group(STREAM, GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(client.pending_for(STREAM, GROUP, "c1"), vec![id.clone()]);

        client.ack(STREAM, GROUP, &id).await.unwrap();
        assert_eq!(client.pending_count(STREAM, GROUP), 0);

        // Acking twice is harmless
        client.ack(STREAM, GROUP, &id).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_group_on_missing_group_fails() {
        let client = InMemoryStreamClient::new();
        let result = client
            .read_group(STREAM, "nope", "c1", 1, Duration::ZERO)
            .await;
        assert!(matches!(result, Err(StreamError::GroupNotFound { .. })));
    }

    #[tokio::test]
    async fn test_ensure_group_is_idempotent() {
        let client = client_with_group().await;
        client.append(STREAM, &fields("a")).await.unwrap();
        client
            .read_group(STREAM, GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();

        client.ensure_group(STREAM, GROUP).await.unwrap();
        assert_eq!(client.pending_count(STREAM, GROUP), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_group_blocks_until_append() {
        let client = std::sync::Arc::new(client_with_group().await);

        let reader = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .read_group(STREAM, GROUP, "c1", 10, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        client.append(STREAM, &fields("late")).await.unwrap();

        let entries = reader.await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].field("external_id"), Some("late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_group_times_out_empty() {
        let client = client_with_group().await;
        let entries = client
            .read_group(STREAM, GROUP, "c1", 10, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_stale_respects_idle_threshold() {
        let client = client_with_group().await;
        let id = client.append(STREAM, &fields("a")).await.unwrap();
        client
            .read_group(STREAM, GROUP, "dead", 10, Duration::ZERO)
            .await
            .unwrap();

        let fresh = client
            .claim_stale(STREAM, GROUP, "reclaimer", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(fresh.is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;

        let claimed = client
            .claim_stale(STREAM, GROUP, "reclaimer", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(client.pending_for(STREAM, GROUP, "reclaimer"), vec![id.clone()]);
        assert_eq!(client.delivery_count(STREAM, GROUP, &id), Some(2));
    }

    #[tokio::test]
    async fn test_publish_records_per_channel() {
        let client = InMemoryStreamClient::new();
        client.publish("alerts", "one").await.unwrap();
        client.publish("other", "x").await.unwrap();
        client.publish("alerts", "two").await.unwrap();

        assert_eq!(client.published("alerts"), vec!["one", "two"]);
        assert!(client.published("missing").is_empty());
    }
}
