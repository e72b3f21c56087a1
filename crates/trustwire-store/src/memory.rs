//! In-memory implementation of the AttributeStore trait.
//!
//! Same semantics as SQLite, no persistence. Used by tests and by nodes that
//! do not need state to survive a restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use trustwire_core::now_millis;

use crate::error::{Result, StoreError};
use crate::traits::{expiry_for, is_expired, AttrKey, AttributeStore, SweepReport};

/// In-memory store. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Attributes, ordered so bucket scans are range queries.
    attrs: BTreeMap<AttrKey, StoredAttr>,

    /// Secondary index: (index, lookup) -> encoded target.
    index: HashMap<(String, String), String>,
}

struct StoredAttr {
    value: Value,
    expires_at: Option<i64>,
}

impl StoredAttr {
    fn live(&self, now: i64) -> Option<&Value> {
        (!is_expired(self.expires_at, now)).then_some(&self.value)
    }
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn bucket_range<'a>(
    attrs: &'a BTreeMap<AttrKey, StoredAttr>,
    actor_id: &str,
    bucket: &str,
) -> impl Iterator<Item = (&'a AttrKey, &'a StoredAttr)> {
    let start = AttrKey::new(actor_id, bucket, "");
    let actor_id = actor_id.to_string();
    let bucket = bucket.to_string();
    attrs
        .range(start..)
        .take_while(move |(k, _)| k.actor_id == actor_id && k.bucket == bucket)
}

#[async_trait]
impl AttributeStore for MemoryStore {
    async fn get_attr(&self, key: &AttrKey) -> Result<Option<Value>> {
        let now = now_millis();
        let inner = self.read()?;
        Ok(inner
            .attrs
            .get(key)
            .and_then(|stored| stored.live(now))
            .cloned())
    }

    async fn set_attr(&self, key: &AttrKey, value: Value, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| expiry_for(now_millis(), ttl));
        let mut inner = self.write()?;
        inner
            .attrs
            .insert(key.clone(), StoredAttr { value, expires_at });
        Ok(())
    }

    async fn delete_attr(&self, key: &AttrKey) -> Result<bool> {
        let now = now_millis();
        let mut inner = self.write()?;
        Ok(inner
            .attrs
            .remove(key)
            .is_some_and(|stored| !is_expired(stored.expires_at, now)))
    }

    async fn conditional_update_attr(
        &self,
        key: &AttrKey,
        old: Option<&Value>,
        new: Value,
    ) -> Result<bool> {
        let now = now_millis();
        let mut inner = self.write()?;

        let current = inner.attrs.get(key).and_then(|stored| stored.live(now));
        if current != old {
            return Ok(false);
        }

        inner.attrs.insert(
            key.clone(),
            StoredAttr {
                value: new,
                expires_at: None,
            },
        );
        Ok(true)
    }

    async fn list_bucket(&self, actor_id: &str, bucket: &str) -> Result<BTreeMap<String, Value>> {
        let now = now_millis();
        let inner = self.read()?;
        Ok(bucket_range(&inner.attrs, actor_id, bucket)
            .filter_map(|(k, stored)| stored.live(now).map(|v| (k.name.clone(), v.clone())))
            .collect())
    }

    async fn delete_bucket(&self, actor_id: &str, bucket: &str) -> Result<usize> {
        let now = now_millis();
        let mut inner = self.write()?;
        let keys: Vec<AttrKey> = bucket_range(&inner.attrs, actor_id, bucket)
            .map(|(k, _)| k.clone())
            .collect();

        let mut removed = 0;
        for key in keys {
            if let Some(stored) = inner.attrs.remove(&key) {
                if !is_expired(stored.expires_at, now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn list_buckets(&self, actor_id: &str) -> Result<Vec<String>> {
        let now = now_millis();
        let inner = self.read()?;
        let mut buckets: Vec<String> = inner
            .attrs
            .iter()
            .filter(|(k, stored)| k.actor_id == actor_id && stored.live(now).is_some())
            .map(|(k, _)| k.bucket.clone())
            .collect();
        buckets.dedup();
        Ok(buckets)
    }

    async fn set_index(&self, index: &str, lookup: &str, target: &AttrKey) -> Result<()> {
        let mut inner = self.write()?;
        inner.index.insert(
            (index.to_string(), lookup.to_string()),
            target.to_index_target(),
        );
        Ok(())
    }

    async fn lookup_index(&self, index: &str, lookup: &str) -> Result<Option<AttrKey>> {
        let inner = self.read()?;
        Ok(inner
            .index
            .get(&(index.to_string(), lookup.to_string()))
            .and_then(|target| AttrKey::from_index_target(target)))
    }

    async fn delete_index(&self, index: &str, lookup: &str) -> Result<bool> {
        let mut inner = self.write()?;
        Ok(inner
            .index
            .remove(&(index.to_string(), lookup.to_string()))
            .is_some())
    }

    async fn sweep_expired(&self, now: i64) -> Result<SweepReport> {
        let mut inner = self.write()?;
        let mut report = SweepReport::default();

        let before = inner.attrs.len();
        inner
            .attrs
            .retain(|_, stored| !is_expired(stored.expires_at, now));
        report.expired = before - inner.attrs.len();

        let MemoryStoreInner { attrs, index } = &mut *inner;
        index.retain(|_, target| match AttrKey::from_index_target(target) {
            Some(key) if attrs.contains_key(&key) => true,
            Some(_) => {
                report.orphaned_index += 1;
                false
            }
            None => {
                report.malformed_index += 1;
                true
            }
        });

        if report.malformed_index > 0 {
            tracing::warn!(count = report.malformed_index, "skipped malformed index entries");
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StoreExt;
    use serde_json::json;
    use std::sync::Arc;

    fn key(name: &str) -> AttrKey {
        AttrKey::new("alice", "_trust", name)
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStore::new();
        assert_eq!(store.get_attr(&key("bob")).await.unwrap(), None);

        store
            .set_attr(&key("bob"), json!({"approved": true}), None)
            .await
            .unwrap();
        assert_eq!(
            store.get_attr(&key("bob")).await.unwrap(),
            Some(json!({"approved": true}))
        );

        assert!(store.delete_attr(&key("bob")).await.unwrap());
        assert!(!store.delete_attr(&key("bob")).await.unwrap());
    }

    #[tokio::test]
    async fn test_buckets_are_isolated() {
        let store = MemoryStore::new();
        store.set_attr(&key("bob"), json!(1), None).await.unwrap();
        store.set_attr(&key("carol"), json!(2), None).await.unwrap();
        store
            .set_attr(&AttrKey::new("alice", "_trusty", "dave"), json!(3), None)
            .await
            .unwrap();
        store
            .set_attr(&AttrKey::new("bob", "_trust", "alice"), json!(4), None)
            .await
            .unwrap();

        let bucket = store.list_bucket("alice", "_trust").await.unwrap();
        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket["carol"], json!(2));

        assert_eq!(
            store.list_buckets("alice").await.unwrap(),
            vec!["_trust".to_string(), "_trusty".to_string()]
        );

        assert_eq!(store.delete_bucket("alice", "_trust").await.unwrap(), 2);
        assert!(store.list_bucket("alice", "_trust").await.unwrap().is_empty());
        assert_eq!(store.list_bucket("alice", "_trusty").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cas_absent_and_present() {
        let store = MemoryStore::new();
        let k = key("seq");

        assert!(store.conditional_update_attr(&k, None, json!(1)).await.unwrap());
        assert!(!store.conditional_update_attr(&k, None, json!(2)).await.unwrap());
        assert!(!store
            .conditional_update_attr(&k, Some(&json!(7)), json!(2))
            .await
            .unwrap());
        assert!(store
            .conditional_update_attr(&k, Some(&json!(1)), json!(2))
            .await
            .unwrap());
        assert_eq!(store.get_attr(&k).await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_cas_ignores_key_order() {
        let store = MemoryStore::new();
        let k = key("state");
        store
            .set_attr(&k, json!({"a": 1, "b": [1, 2]}), None)
            .await
            .unwrap();

        let old: Value = serde_json::from_str(r#"{"b":[1,2],"a":1}"#).unwrap();
        assert!(store
            .conditional_update_attr(&k, Some(&old), json!({"a": 2}))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_cas_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let k = key("race");
        store.set_attr(&k, json!(0), None).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                store
                    .conditional_update_attr(&k, Some(&json!(0)), json!(i + 1))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_increment_counter() {
        let store = Arc::new(MemoryStore::new());
        let k = key("counter");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                store.increment_counter(&k).await.unwrap()
            }));
        }
        let mut seen = Vec::new();
        for h in handles {
            seen.push(h.await.unwrap());
        }
        seen.sort();
        assert_eq!(seen, (1..=8).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_sweep_expired_and_orphans() {
        let store = MemoryStore::new();
        store
            .set_attr(&key("short"), json!(1), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        store.set_attr(&key("long"), json!(2), None).await.unwrap();
        store.set_index("by_secret", "s1", &key("short")).await.unwrap();
        store.set_index("by_secret", "s2", &key("long")).await.unwrap();

        // Still visible inside the skew buffer.
        assert!(store.get_attr(&key("short")).await.unwrap().is_some());

        let later = now_millis() + 10 * 60 * 1000;
        let report = store.sweep_expired(later).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.orphaned_index, 1);
        assert_eq!(report.malformed_index, 0);

        assert_eq!(store.lookup_index("by_secret", "s1").await.unwrap(), None);
        assert_eq!(
            store.lookup_index("by_secret", "s2").await.unwrap(),
            Some(key("long"))
        );
    }

    #[tokio::test]
    async fn test_malformed_index_entry_is_skipped() {
        let store = MemoryStore::new();
        store
            .write()
            .unwrap()
            .index
            .insert(("idx".into(), "bad".into()), "{not a target".into());

        assert_eq!(store.lookup_index("idx", "bad").await.unwrap(), None);
        let report = store.sweep_expired(now_millis()).await.unwrap();
        assert_eq!(report.malformed_index, 1);
        assert_eq!(report.orphaned_index, 0);
    }
}
