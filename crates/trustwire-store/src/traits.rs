//! AttributeStore trait: the abstract interface for per-actor attribute
//! persistence.
//!
//! Everything Trustwire persists (trust relationships, permission overrides,
//! peer permission snapshots, sequencing state, counters) lives in buckets of
//! JSON values keyed by `(actor_id, bucket, name)`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, StoreError};

/// Added on top of every TTL so that peers with slightly skewed clocks do
/// not see an entry vanish before the lifetime they were promised.
pub const TTL_CLOCK_SKEW_BUFFER: Duration = Duration::from_secs(300);

/// Attempts made by [`StoreExt::increment_counter`] before giving up.
pub const MAX_CAS_ATTEMPTS: usize = 16;

/// Address of a single attribute.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttrKey {
    pub actor_id: String,
    pub bucket: String,
    pub name: String,
}

impl AttrKey {
    /// Create a key.
    pub fn new(
        actor_id: impl Into<String>,
        bucket: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            bucket: bucket.into(),
            name: name.into(),
        }
    }

    /// Encode as a secondary-index target.
    pub fn to_index_target(&self) -> String {
        serde_json::json!([self.actor_id, self.bucket, self.name]).to_string()
    }

    /// Decode a secondary-index target. `None` if malformed.
    pub fn from_index_target(target: &str) -> Option<Self> {
        let parts: Vec<String> = serde_json::from_str(target).ok()?;
        match <[String; 3]>::try_from(parts) {
            Ok([actor_id, bucket, name]) => Some(Self {
                actor_id,
                bucket,
                name,
            }),
            Err(_) => None,
        }
    }
}

/// Outcome of an expiry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired attributes removed.
    pub expired: usize,
    /// Index entries removed because their target no longer exists.
    pub orphaned_index: usize,
    /// Index entries that could not be decoded. Counted and left alone.
    pub malformed_index: usize,
}

/// Compute the absolute expiry (Unix ms) for a TTL starting at `now`.
pub fn expiry_for(now: i64, ttl: Duration) -> i64 {
    let total = ttl + TTL_CLOCK_SKEW_BUFFER;
    now.saturating_add(total.as_millis().min(i64::MAX as u128) as i64)
}

/// Whether an entry with `expires_at` is expired at `now`.
pub fn is_expired(expires_at: Option<i64>, now: i64) -> bool {
    matches!(expires_at, Some(at) if at <= now)
}

/// Serialize a JSON value with object keys sorted at every level, so equal
/// values always produce identical text.
pub fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let ordered: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, sorted(v))).collect();
                let mut out = serde_json::Map::new();
                for (k, v) in ordered {
                    out.insert(k.clone(), v);
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

/// The AttributeStore trait: async interface for keyed attribute storage.
///
/// # Design Notes
///
/// - **Expiry**: entries written with a TTL are invisible to reads once
///   expired, and removed by [`AttributeStore::sweep_expired`].
/// - **Compare-and-swap**: [`AttributeStore::conditional_update_attr`] is a
///   single atomic operation in the backend. Sequence counters and secret
///   rotation go through it; callers never read-modify-write.
/// - **Structural equality**: values compare as JSON, independent of object
///   key order.
#[async_trait]
pub trait AttributeStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Attribute Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Get an attribute. Expired entries read as absent.
    async fn get_attr(&self, key: &AttrKey) -> Result<Option<Value>>;

    /// Set an attribute, optionally expiring after `ttl` plus
    /// [`TTL_CLOCK_SKEW_BUFFER`].
    async fn set_attr(&self, key: &AttrKey, value: Value, ttl: Option<Duration>) -> Result<()>;

    /// Delete an attribute. Returns whether it existed.
    async fn delete_attr(&self, key: &AttrKey) -> Result<bool>;

    /// Atomically replace the stored value with `new` only if it is
    /// structurally equal to `old`. `old = None` requires the attribute to be
    /// absent. Returns whether the write happened; a `false` leaves the store
    /// untouched.
    async fn conditional_update_attr(
        &self,
        key: &AttrKey,
        old: Option<&Value>,
        new: Value,
    ) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Bucket Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// List all live attributes in a bucket, ordered by name.
    async fn list_bucket(&self, actor_id: &str, bucket: &str) -> Result<BTreeMap<String, Value>>;

    /// Delete every attribute in a bucket. Returns how many were removed.
    async fn delete_bucket(&self, actor_id: &str, bucket: &str) -> Result<usize>;

    /// List the names of an actor's non-empty buckets.
    async fn list_buckets(&self, actor_id: &str) -> Result<Vec<String>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Secondary Index
    // ─────────────────────────────────────────────────────────────────────────

    /// Point `(index, lookup)` at an attribute.
    async fn set_index(&self, index: &str, lookup: &str, target: &AttrKey) -> Result<()>;

    /// Resolve `(index, lookup)`. Malformed entries resolve to `None`.
    async fn lookup_index(&self, index: &str, lookup: &str) -> Result<Option<AttrKey>>;

    /// Remove an index entry. Returns whether it existed.
    async fn delete_index(&self, index: &str, lookup: &str) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Remove attributes expired at `now` (Unix ms) and index entries whose
    /// target is gone.
    async fn sweep_expired(&self, now: i64) -> Result<SweepReport>;
}

/// Extension trait for typed access and CAS-based counters.
pub trait StoreExt: AttributeStore {
    /// Get and deserialize an attribute.
    fn get_typed<T: DeserializeOwned + Send>(
        &self,
        key: &AttrKey,
    ) -> impl std::future::Future<Output = Result<Option<T>>> + Send;

    /// Serialize and set an attribute without TTL.
    fn set_typed<T: Serialize + Sync>(
        &self,
        key: &AttrKey,
        value: &T,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Atomically increment an integer counter, starting from 0 when absent.
    /// Returns the new value.
    fn increment_counter(
        &self,
        key: &AttrKey,
    ) -> impl std::future::Future<Output = Result<u64>> + Send;
}

impl<S: AttributeStore + ?Sized> StoreExt for S {
    async fn get_typed<T: DeserializeOwned + Send>(&self, key: &AttrKey) -> Result<Option<T>> {
        match self.get_attr(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn set_typed<T: Serialize + Sync>(&self, key: &AttrKey, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set_attr(key, value, None).await
    }

    async fn increment_counter(&self, key: &AttrKey) -> Result<u64> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get_attr(key).await?;
            let value = match &current {
                Some(v) => v.as_u64().ok_or_else(|| {
                    StoreError::InvalidData(format!("counter {} is not an integer", key.name))
                })?,
                None => 0,
            };
            let next = value + 1;
            if self
                .conditional_update_attr(key, current.as_ref(), Value::from(next))
                .await?
            {
                return Ok(next);
            }
            tracing::debug!(bucket = %key.bucket, name = %key.name, "counter CAS lost, retrying");
        }
        Err(StoreError::InvalidData(format!(
            "counter {} still contended after {} attempts",
            key.name, MAX_CAS_ATTEMPTS
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"d": [1, {"y": 2, "x": 1}], "c": null}});
        assert_eq!(
            canonical_json(&a),
            r#"{"a":{"c":null,"d":[1,{"x":1,"y":2}]},"b":1}"#
        );
    }

    #[test]
    fn test_index_target_roundtrip() {
        let key = AttrKey::new("alice", "_trust", "bob/with/slashes");
        let target = key.to_index_target();
        assert_eq!(AttrKey::from_index_target(&target), Some(key));
        assert_eq!(AttrKey::from_index_target("not json"), None);
        assert_eq!(AttrKey::from_index_target(r#"["only","two"]"#), None);
    }

    #[test]
    fn test_expiry_includes_buffer() {
        let at = expiry_for(1_000, Duration::from_secs(10));
        assert_eq!(at, 1_000 + 10_000 + 300_000);
        assert!(is_expired(Some(at), at));
        assert!(!is_expired(Some(at), at - 1));
        assert!(!is_expired(None, i64::MAX));
    }
}
