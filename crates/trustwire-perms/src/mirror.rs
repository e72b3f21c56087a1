//! Local copy of data received from peers.
//!
//! Subscription callbacks write into a per-peer bucket `_remote:{peer_id}`.
//! A companion bucket `_remote_owner:{peer_id}` records which subscription
//! last wrote each name, so a resync of one subscription replaces only its
//! own entries. When a peer revokes access, entries whose names match a
//! revoked pattern are purged with the same glob matcher that permission
//! evaluation uses, whichever subscription wrote them.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use trustwire_core::{matches_any, ActorId, SubscriptionId};
use trustwire_store::{AttrKey, AttributeStore};

use crate::error::{PermsError, Result};

/// Prefix of mirror buckets.
pub const REMOTE_BUCKET_PREFIX: &str = "_remote:";

/// Prefix of the buckets mapping mirrored names to their subscription.
pub const OWNER_BUCKET_PREFIX: &str = "_remote_owner:";

/// Bucket name for data mirrored from `peer_id`.
pub fn remote_bucket(peer_id: &ActorId) -> String {
    format!("{}{}", REMOTE_BUCKET_PREFIX, peer_id)
}

fn owner_bucket(peer_id: &ActorId) -> String {
    format!("{}{}", OWNER_BUCKET_PREFIX, peer_id)
}

/// Peer-sourced data cache.
#[derive(Clone)]
pub struct RemoteMirror {
    store: Arc<dyn AttributeStore>,
}

impl RemoteMirror {
    pub fn new(store: Arc<dyn AttributeStore>) -> Self {
        Self { store }
    }

    fn key(actor_id: &ActorId, peer_id: &ActorId, name: &str) -> AttrKey {
        AttrKey::new(actor_id.as_str(), remote_bucket(peer_id), name)
    }

    fn owner_key(actor_id: &ActorId, peer_id: &ActorId, name: &str) -> AttrKey {
        AttrKey::new(actor_id.as_str(), owner_bucket(peer_id), name)
    }

    async fn remove(&self, actor_id: &ActorId, peer_id: &ActorId, name: &str) -> Result<()> {
        self.store.delete_attr(&Self::key(actor_id, peer_id, name)).await?;
        self.store
            .delete_attr(&Self::owner_key(actor_id, peer_id, name))
            .await?;
        Ok(())
    }

    /// Get one mirrored value.
    pub async fn get(&self, actor_id: &ActorId, peer_id: &ActorId, name: &str) -> Result<Option<Value>> {
        Ok(self.store.get_attr(&Self::key(actor_id, peer_id, name)).await?)
    }

    /// Everything mirrored from a peer, across subscriptions.
    pub async fn list(&self, actor_id: &ActorId, peer_id: &ActorId) -> Result<BTreeMap<String, Value>> {
        Ok(self
            .store
            .list_bucket(actor_id.as_str(), &remote_bucket(peer_id))
            .await?)
    }

    /// Names last written by `subscription_id`.
    pub async fn owned_by(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<String>> {
        let owners = self
            .store
            .list_bucket(actor_id.as_str(), &owner_bucket(peer_id))
            .await?;
        Ok(owners
            .into_iter()
            .filter(|(_, owner)| owner.as_str() == Some(subscription_id.as_str()))
            .map(|(name, _)| name)
            .collect())
    }

    /// Apply a diff received on `subscription_id`: each key is a property
    /// name; `null` deletes it. Returns the number of entries touched.
    pub async fn apply_diff(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        subscription_id: &SubscriptionId,
        data: &Value,
    ) -> Result<usize> {
        let Value::Object(entries) = data else {
            return Err(PermsError::Invalid(format!(
                "diff from {} is not an object",
                peer_id
            )));
        };

        for (name, value) in entries {
            if value.is_null() {
                self.remove(actor_id, peer_id, name).await?;
                continue;
            }
            self.store
                .set_attr(&Self::key(actor_id, peer_id, name), value.clone(), None)
                .await?;
            self.store
                .set_attr(
                    &Self::owner_key(actor_id, peer_id, name),
                    Value::String(subscription_id.to_string()),
                    None,
                )
                .await?;
        }
        Ok(entries.len())
    }

    /// Replace what `subscription_id` mirrored from a peer with
    /// authoritative state. Entries written by other subscriptions stay.
    pub async fn replace_all(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        subscription_id: &SubscriptionId,
        data: &Value,
    ) -> Result<usize> {
        if !data.is_object() {
            return Err(PermsError::Invalid(format!(
                "state from {} is not an object",
                peer_id
            )));
        }
        for name in self.owned_by(actor_id, peer_id, subscription_id).await? {
            self.remove(actor_id, peer_id, &name).await?;
        }
        self.apply_diff(actor_id, peer_id, subscription_id, data).await
    }

    /// Delete every entry whose name matches one of `patterns`. Returns the
    /// deleted names.
    pub async fn purge_matching<S: AsRef<str> + Sync>(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        patterns: &[S],
    ) -> Result<Vec<String>> {
        if patterns.is_empty() {
            return Ok(Vec::new());
        }

        let mut purged = Vec::new();
        for name in self.list(actor_id, peer_id).await?.into_keys() {
            if matches_any(patterns, &name) {
                self.remove(actor_id, peer_id, &name).await?;
                purged.push(name);
            }
        }

        if !purged.is_empty() {
            tracing::info!(
                actor_id = %actor_id,
                peer_id = %peer_id,
                count = purged.len(),
                "purged mirrored data after revocation"
            );
        }
        Ok(purged)
    }

    /// Drop everything mirrored from a peer. Returns the number of values
    /// removed.
    pub async fn clear(&self, actor_id: &ActorId, peer_id: &ActorId) -> Result<usize> {
        self.store
            .delete_bucket(actor_id.as_str(), &owner_bucket(peer_id))
            .await?;
        Ok(self
            .store
            .delete_bucket(actor_id.as_str(), &remote_bucket(peer_id))
            .await?)
    }
}
