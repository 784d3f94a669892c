//! Short-lived cache for distribution results

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::Distribution;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    hours: u32,
    source: Option<String>,
    slot: i64,
}

/// Distribution results keyed by `(hours, source, slot-of-now)`
///
/// A slot is `ttl` wide, so an entry is served for at most `ttl` and then
/// simply stops matching. Entries from earlier slots are pruned on insert.
/// A zero TTL disables caching.
pub struct DistributionCache {
    ttl_secs: i64,
    entries: Mutex<HashMap<CacheKey, Distribution>>,
}

impl DistributionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl_secs: ttl.as_secs() as i64,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.ttl_secs > 0
    }

    fn key(&self, hours: u32, source: Option<&str>, now: DateTime<Utc>) -> Option<CacheKey> {
        if !self.is_enabled() {
            return None;
        }
        Some(CacheKey {
            hours,
            source: source.map(str::to_string),
            slot: now.timestamp().div_euclid(self.ttl_secs),
        })
    }

    pub fn get(&self, hours: u32, source: Option<&str>, now: DateTime<Utc>) -> Option<Distribution> {
        let key = self.key(hours, source, now)?;
        self.entries.lock().get(&key).cloned()
    }

    pub fn insert(&self, hours: u32, source: Option<&str>, now: DateTime<Utc>, value: Distribution) {
        let Some(key) = self.key(hours, source, now) else {
            return;
        };
        let mut entries = self.entries.lock();
        entries.retain(|k, _| k.slot >= key.slot);
        entries.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
