//! Versioned, TTL-expiring state cache
//!
//! The cache is the source of truth each relay instance consults:
//! - `set` writes a new record with version = previous + 1 and re-arms its TTL
//! - `merge` applies a record coming from a peer instance (last-writer-wins)
//! - every local `set` is announced on an in-process broadcast channel
//!
//! Expiry is handled by Moka: an entry's time-to-live restarts on each write,
//! so a renewed key is never evicted by the deadline of an earlier write.

use chrono::Utc;
use moka::ops::compute::{CompResult, Op};
use moka::sync::Cache;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::models::StateRecord;

/// Default record lifetime (5 minutes)
pub const DEFAULT_TTL: Duration = Duration::from_millis(300_000);

/// Default upper bound on cached keys
pub const DEFAULT_MAX_CAPACITY: u64 = 100_000;

/// Capacity of the "updated" broadcast channel
const UPDATE_CHANNEL_CAPACITY: usize = 4096;

#[derive(Clone)]
pub struct StateCache {
    entries: Cache<String, StateRecord>,
    updates: broadcast::Sender<StateRecord>,
    ttl: Duration,
}

impl StateCache {
    #[must_use]
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        Self {
            entries,
            updates,
            ttl,
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_CAPACITY)
    }

    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store a new version of `key` and announce it to local listeners
    pub fn set(&self, key: impl Into<String>, payload: serde_json::Value) -> StateRecord {
        let key = key.into();
        let record = self
            .entries
            .entry(key.clone())
            .and_upsert_with(|existing| StateRecord {
                version: existing.map_or(1, |entry| entry.value().version + 1),
                key,
                payload,
                updated_at: Utc::now(),
            })
            .into_value();

        trace!(key = %record.key, version = record.version, "State record written");

        // No listeners is fine: nothing to fan out to yet
        let _ = self.updates.send(record.clone());
        record
    }

    /// Apply a record written by another instance.
    ///
    /// The record is kept only when its version is higher than the local copy.
    /// A version 1 record written after the local copy also wins: its origin
    /// lost the key (cleared, evicted or expired) and started over. Merging
    /// does not announce on the update channel.
    pub fn merge(&self, record: StateRecord) -> bool {
        let key = record.key.clone();
        let result = self.entries.entry(key).and_compute_with(|existing| match existing {
            Some(entry) if !supersedes(&record, entry.value()) => Op::Nop,
            _ => Op::Put(record),
        });

        let applied = matches!(result, CompResult::Inserted(_) | CompResult::ReplacedWith(_));
        if !applied {
            debug!("Ignored stale remote state record");
        }
        applied
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<StateRecord> {
        self.entries.get(key)
    }

    /// One slot per requested key, in request order, `None` where absent
    #[must_use]
    pub fn get_many<S: AsRef<str>>(&self, keys: &[S]) -> Vec<Option<StateRecord>> {
        keys.iter().map(|key| self.get(key.as_ref())).collect()
    }

    /// Every live record, in no particular order
    #[must_use]
    pub fn all(&self) -> Vec<StateRecord> {
        self.entries.iter().map(|(_, record)| record).collect()
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    /// Receive every record written through `set` on this instance
    #[must_use]
    pub fn subscribe_updates(&self) -> broadcast::Receiver<StateRecord> {
        self.updates.subscribe()
    }
}

fn supersedes(incoming: &StateRecord, local: &StateRecord) -> bool {
    incoming.version > local.version
        || (incoming.version == 1 && incoming.updated_at > local.updated_at)
}

impl Default for StateCache {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_versions_strictly_increase() {
        let cache = StateCache::with_defaults();

        for expected in 1..=50u64 {
            let record = cache.set("u1", json!({ "n": expected }));
            assert_eq!(record.version, expected);
        }
        assert_eq!(cache.get("u1").unwrap().payload, json!({ "n": 50 }));
    }

    #[test]
    fn test_versions_are_per_key() {
        let cache = StateCache::with_defaults();
        cache.set("a", json!(1));
        cache.set("a", json!(2));
        let b = cache.set("b", json!(1));

        assert_eq!(b.version, 1);
        assert_eq!(cache.get("a").unwrap().version, 2);
    }

    #[test]
    fn test_get_many_preserves_order_and_gaps() {
        let cache = StateCache::with_defaults();
        cache.set("a", json!("A"));
        cache.set("c", json!("C"));

        let slots = cache.get_many(&["c", "b", "a"]);
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].as_ref().unwrap().key, "c");
        assert!(slots[1].is_none());
        assert_eq!(slots[2].as_ref().unwrap().key, "a");
    }

    #[test]
    fn test_all_clear_and_size() {
        let cache = StateCache::with_defaults();
        cache.set("a", json!(1));
        cache.set("b", json!(2));

        assert_eq!(cache.size(), 2);
        let mut keys: Vec<_> = cache.all().into_iter().map(|r| r.key).collect();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

        cache.clear();
        assert_eq!(cache.size(), 0);
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn test_expired_record_is_unreadable() {
        let cache = StateCache::new(Duration::from_millis(100), 100);
        cache.set("u1", json!("online"));
        assert!(cache.get("u1").is_some());

        std::thread::sleep(Duration::from_millis(200));
        assert!(cache.get("u1").is_none());
    }

    #[test]
    fn test_renewal_extends_lifetime() {
        let cache = StateCache::new(Duration::from_millis(300), 100);
        cache.set("u1", json!("online"));

        std::thread::sleep(Duration::from_millis(200));
        cache.set("u1", json!("away"));

        // Past the first write's deadline, within the second's
        std::thread::sleep(Duration::from_millis(200));
        let record = cache.get("u1").unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.payload, json!("away"));

        std::thread::sleep(Duration::from_millis(200));
        assert!(cache.get("u1").is_none());
    }

    #[test]
    fn test_version_restarts_after_expiry() {
        let cache = StateCache::new(Duration::from_millis(50), 100);
        cache.set("u1", json!(1));
        cache.set("u1", json!(2));
        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(cache.set("u1", json!(3)).version, 1);
    }

    #[test]
    fn test_merge_is_last_writer_wins() {
        let cache = StateCache::with_defaults();
        cache.set("u1", json!("local-1"));
        cache.set("u1", json!("local-2"));

        let stale = StateRecord {
            key: "u1".to_string(),
            payload: json!("remote-old"),
            version: 2,
            updated_at: Utc::now(),
        };
        assert!(!cache.merge(stale));
        assert_eq!(cache.get("u1").unwrap().payload, json!("local-2"));

        let newer = StateRecord {
            key: "u1".to_string(),
            payload: json!("remote-new"),
            version: 5,
            updated_at: Utc::now(),
        };
        assert!(cache.merge(newer));
        assert_eq!(cache.get("u1").unwrap().version, 5);

        // Local writes continue from the merged version
        assert_eq!(cache.set("u1", json!("local-3")).version, 6);
    }

    #[test]
    fn test_merge_accepts_restarted_origin() {
        let cache = StateCache::with_defaults();
        let earlier = Utc::now();
        let record = |version, payload, updated_at| StateRecord {
            key: "u1".to_string(),
            payload,
            version,
            updated_at,
        };
        assert!(cache.merge(record(4, json!("before-clear"), earlier)));

        // The origin cleared its cache and wrote the key again
        let restarted = record(1, json!("after-clear"), earlier + chrono::Duration::seconds(1));
        assert!(cache.merge(restarted));
        assert_eq!(cache.get("u1").unwrap().payload, json!("after-clear"));

        // An old version 1 replayed late does not win
        let replayed = record(1, json!("ancient"), earlier - chrono::Duration::seconds(5));
        assert!(!cache.merge(replayed));
        assert_eq!(cache.get("u1").unwrap().version, 1);
        assert_eq!(cache.get("u1").unwrap().payload, json!("after-clear"));

        // Higher versions of the new lineage apply as usual
        assert!(cache.merge(record(2, json!("next"), earlier + chrono::Duration::seconds(2))));
    }

    #[tokio::test]
    async fn test_set_announces_but_merge_does_not() {
        let cache = StateCache::with_defaults();
        let mut rx = cache.subscribe_updates();

        cache.merge(StateRecord {
            key: "remote".to_string(),
            payload: json!(null),
            version: 1,
            updated_at: Utc::now(),
        });
        cache.set("local", json!(true));

        let announced = rx.recv().await.unwrap();
        assert_eq!(announced.key, "local");
        assert!(rx.try_recv().is_err());
    }
}
