//! Mirror of the permissions peers have granted to us.
//!
//! Each snapshot replaces the previous one; [`PeerPermissionCache::store`]
//! reports what changed so callers can purge data we lost access to and
//! fetch data we gained access to.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use trustwire_core::{
    detect_permission_changes, now_millis, AccessDecision, ActorId, PermissionChanges,
    PermissionSet,
};
use trustwire_store::{AttrKey, AttributeStore, StoreExt, MAX_CAS_ATTEMPTS};

use crate::cache::ReadCache;
use crate::error::{PermsError, Result};

/// Bucket holding peer snapshots, keyed by the granting peer's id.
pub const PEER_PERMISSIONS_BUCKET: &str = "_peer_permissions";

/// What `peer_id` granted to `actor_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerPermissions {
    /// The receiving actor (us).
    pub actor_id: ActorId,
    /// The granting peer.
    pub peer_id: ActorId,
    #[serde(default)]
    pub permissions: PermissionSet,
    pub fetched_at: i64,
    /// Error from the last failed refresh, if any. The previous snapshot is
    /// kept when a refresh fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_error: Option<String>,
}

impl PeerPermissions {
    /// A freshly fetched snapshot.
    pub fn new(actor_id: ActorId, peer_id: ActorId, permissions: PermissionSet) -> Self {
        Self {
            actor_id,
            peer_id,
            permissions,
            fetched_at: now_millis(),
            fetch_error: None,
        }
    }
}

type CacheKey = (ActorId, ActorId);

/// Persistent, memory-cached peer permission snapshots.
pub struct PeerPermissionCache {
    store: Arc<dyn AttributeStore>,
    cache: ReadCache<CacheKey, Option<PeerPermissions>>,
}

fn snapshot_key(actor_id: &ActorId, peer_id: &ActorId) -> AttrKey {
    AttrKey::new(actor_id.as_str(), PEER_PERMISSIONS_BUCKET, peer_id.as_str())
}

impl PeerPermissionCache {
    pub fn new(store: Arc<dyn AttributeStore>) -> Self {
        Self {
            store,
            cache: ReadCache::new(),
        }
    }

    /// Replace the snapshot and report the delta against the previous one.
    ///
    /// The replace is a compare-and-swap against the snapshot the delta was
    /// computed from, so two concurrent refreshes each report changes
    /// relative to what the other wrote.
    pub async fn store(&self, snapshot: PeerPermissions) -> Result<PermissionChanges> {
        let key = snapshot_key(&snapshot.actor_id, &snapshot.peer_id);
        let new = serde_json::to_value(&snapshot)?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.store.get_attr(&key).await?;
            let previous = current
                .clone()
                .map(serde_json::from_value::<PeerPermissions>)
                .transpose()?;
            let changes = detect_permission_changes(
                previous.as_ref().map(|p| &p.permissions),
                &snapshot.permissions,
            );

            if !self
                .store
                .conditional_update_attr(&key, current.as_ref(), new.clone())
                .await?
            {
                continue;
            }

            if changes.has_revocations {
                tracing::info!(
                    actor_id = %snapshot.actor_id,
                    peer_id = %snapshot.peer_id,
                    revoked = ?changes.revoked_patterns,
                    "peer revoked permissions"
                );
            } else if !changes.is_empty() {
                tracing::debug!(
                    actor_id = %snapshot.actor_id,
                    peer_id = %snapshot.peer_id,
                    granted = ?changes.granted_patterns,
                    "peer granted permissions"
                );
            }
            self.invalidate(&snapshot.actor_id, &snapshot.peer_id);
            return Ok(changes);
        }

        Err(self.conflict(&snapshot.actor_id, &snapshot.peer_id))
    }

    /// Record a failed refresh without discarding the last good snapshot.
    pub async fn record_fetch_error(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        error: impl Into<String>,
    ) -> Result<()> {
        let key = snapshot_key(actor_id, peer_id);
        let error = error.into();

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.store.get_attr(&key).await?;
            let mut snapshot = match &current {
                Some(value) => serde_json::from_value::<PeerPermissions>(value.clone())?,
                None => PeerPermissions::new(actor_id.clone(), peer_id.clone(), PermissionSet::new()),
            };
            snapshot.fetch_error = Some(error.clone());
            snapshot.fetched_at = now_millis();

            if self
                .store
                .conditional_update_attr(&key, current.as_ref(), serde_json::to_value(&snapshot)?)
                .await?
            {
                self.invalidate(actor_id, peer_id);
                return Ok(());
            }
        }

        Err(self.conflict(actor_id, peer_id))
    }

    fn conflict(&self, actor_id: &ActorId, peer_id: &ActorId) -> PermsError {
        PermsError::Conflict(format!(
            "permissions granted by {} to {} changed concurrently",
            peer_id, actor_id
        ))
    }

    /// Current snapshot, if any.
    pub async fn get(&self, actor_id: &ActorId, peer_id: &ActorId) -> Result<Option<PeerPermissions>> {
        let cache_key = (actor_id.clone(), peer_id.clone());
        let generation = match self.cache.lookup(cache_key.clone()) {
            Ok(hit) => return Ok(hit),
            Err(generation) => generation,
        };

        let loaded: Option<PeerPermissions> =
            self.store.get_typed(&snapshot_key(actor_id, peer_id)).await?;
        self.cache.fill(cache_key, generation, loaded.clone());
        Ok(loaded)
    }

    /// Drop the snapshot. Returns whether one existed.
    pub async fn delete(&self, actor_id: &ActorId, peer_id: &ActorId) -> Result<bool> {
        let removed = self.store.delete_attr(&snapshot_key(actor_id, peer_id)).await?;
        self.invalidate(actor_id, peer_id);
        Ok(removed)
    }

    /// May we perform `operation` on the peer's property `name`?
    /// `Unknown` when we hold no snapshot.
    pub async fn has_property_access(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        name: &str,
        operation: &str,
    ) -> Result<AccessDecision> {
        Ok(self
            .get(actor_id, peer_id)
            .await?
            .map(|s| s.permissions.has_property_access(name, operation))
            .unwrap_or(AccessDecision::Unknown))
    }

    /// May we call the peer's method `name`?
    pub async fn has_method_access(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        name: &str,
    ) -> Result<AccessDecision> {
        Ok(self
            .get(actor_id, peer_id)
            .await?
            .map(|s| s.permissions.has_method_access(name))
            .unwrap_or(AccessDecision::Unknown))
    }

    /// May we use the peer's tool `name`?
    pub async fn has_tool_access(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        name: &str,
    ) -> Result<AccessDecision> {
        Ok(self
            .get(actor_id, peer_id)
            .await?
            .map(|s| s.permissions.has_tool_access(name))
            .unwrap_or(AccessDecision::Unknown))
    }

    fn invalidate(&self, actor_id: &ActorId, peer_id: &ActorId) {
        self.cache.invalidate((actor_id.clone(), peer_id.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustwire_core::{CategoryRules, PermissionCategory};
    use trustwire_store::MemoryStore;

    fn props(patterns: &[&str]) -> PermissionSet {
        PermissionSet::new().with(
            PermissionCategory::Properties,
            CategoryRules::patterns(patterns.iter().copied(), ["read"]),
        )
    }

    fn snapshot(patterns: &[&str]) -> PeerPermissions {
        PeerPermissions::new(ActorId::from("alice"), ActorId::from("bob"), props(patterns))
    }

    #[tokio::test]
    async fn test_initial_then_revocation() {
        let cache = PeerPermissionCache::new(Arc::new(MemoryStore::new()));

        let first = cache.store(snapshot(&["memory_*", "profile_*"])).await.unwrap();
        assert!(first.is_initial);
        assert_eq!(first.granted_patterns, ["memory_*", "profile_*"]);

        let second = cache.store(snapshot(&["memory_*"])).await.unwrap();
        assert!(!second.is_initial);
        assert!(second.has_revocations);
        assert_eq!(second.revoked_patterns, ["profile_*"]);
        assert!(second.granted_patterns.is_empty());
    }

    #[tokio::test]
    async fn test_delta_is_against_stored_snapshot() {
        let store: Arc<dyn AttributeStore> = Arc::new(MemoryStore::new());
        let first = PeerPermissionCache::new(store.clone());
        let second = PeerPermissionCache::new(store);

        first.store(snapshot(&["a/*", "b/*"])).await.unwrap();
        // warm the second cache, then change the snapshot behind its back
        second.get(&ActorId::from("alice"), &ActorId::from("bob")).await.unwrap();
        first.store(snapshot(&["a/*"])).await.unwrap();

        let changes = second.store(snapshot(&["a/*", "c/*"])).await.unwrap();
        assert_eq!(changes.granted_patterns, ["c/*"]);
        assert!(!changes.has_revocations);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_stores_serialize_deltas() {
        for _ in 0..20 {
            let cache = Arc::new(PeerPermissionCache::new(Arc::new(MemoryStore::new())));
            cache.store(snapshot(&["a/*", "b/*"])).await.unwrap();

            let left = tokio::spawn({
                let cache = cache.clone();
                async move { cache.store(snapshot(&["a/*"])).await.unwrap() }
            });
            let right = tokio::spawn({
                let cache = cache.clone();
                async move { cache.store(snapshot(&["b/*"])).await.unwrap() }
            });
            let (left, right) = (left.await.unwrap(), right.await.unwrap());

            // whichever landed second regained the pattern the first revoked
            let granted = left.granted_patterns.len() + right.granted_patterns.len();
            assert_eq!(granted, 1);
            assert!(left.has_revocations && right.has_revocations);
        }
    }

    #[tokio::test]
    async fn test_access_through_snapshot() {
        let cache = PeerPermissionCache::new(Arc::new(MemoryStore::new()));
        let alice = ActorId::from("alice");
        let bob = ActorId::from("bob");

        assert_eq!(
            cache.has_property_access(&alice, &bob, "memory_x", "read").await.unwrap(),
            AccessDecision::Unknown
        );

        cache.store(snapshot(&["memory_*"])).await.unwrap();
        assert_eq!(
            cache.has_property_access(&alice, &bob, "memory_x", "read").await.unwrap(),
            AccessDecision::Allowed
        );
        assert_eq!(
            cache.has_property_access(&alice, &bob, "memory_x", "write").await.unwrap(),
            AccessDecision::Unknown
        );
    }

    #[tokio::test]
    async fn test_fetch_error_keeps_snapshot() {
        let store: Arc<dyn AttributeStore> = Arc::new(MemoryStore::new());
        let cache = PeerPermissionCache::new(store.clone());
        let alice = ActorId::from("alice");
        let bob = ActorId::from("bob");

        cache.store(snapshot(&["memory_*"])).await.unwrap();
        cache.record_fetch_error(&alice, &bob, "timeout").await.unwrap();

        // Read through a fresh cache to prove it was persisted.
        let reloaded = PeerPermissionCache::new(store);
        let got = reloaded.get(&alice, &bob).await.unwrap().unwrap();
        assert_eq!(got.fetch_error.as_deref(), Some("timeout"));
        assert_eq!(got.permissions.property_patterns(), ["memory_*"]);

        assert!(reloaded.delete(&alice, &bob).await.unwrap());
        assert!(reloaded.get(&alice, &bob).await.unwrap().is_none());
    }
}
