//! Per-relationship permission overrides.
//!
//! An override narrows or widens what a trust type grants one specific peer.
//! Categories left `None` inherit the trust type default; the effective set
//! is computed with [`merge_permissions`] in fail-safe union mode.
//!
//! Writes can notify the peer of its new effective permissions. Notification
//! is best effort: failures are logged and never change the outcome of the
//! write that triggered them.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use trustwire_core::{
    merge_permissions, now_millis, ActorId, CategoryRules, PermissionCategory, PermissionSet,
};
use trustwire_store::{AttrKey, AttributeStore, StoreExt};

use crate::cache::ReadCache;
use crate::error::{PermsError, Result};
use crate::registry::TrustTypeRegistry;

/// Bucket holding overrides, keyed by peer id.
pub const TRUST_PERMISSIONS_BUCKET: &str = "_trust_permissions";

/// A stored override for one (actor, peer) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustPermissions {
    pub actor_id: ActorId,
    pub peer_id: ActorId,
    pub trust_type: String,
    /// Per-category override. `None` categories inherit.
    #[serde(default)]
    pub permissions: PermissionSet,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl TrustPermissions {
    /// Create an override with no categories set.
    pub fn new(actor_id: ActorId, peer_id: ActorId, trust_type: impl Into<String>) -> Self {
        Self {
            actor_id,
            peer_id,
            trust_type: trust_type.into(),
            permissions: PermissionSet::new(),
            created_by: String::new(),
            created_at: 0,
            updated_at: 0,
            notes: None,
        }
    }

    /// Builder: set one category.
    pub fn with_category(
        mut self,
        category: PermissionCategory,
        rules: CategoryRules,
    ) -> Self {
        self.permissions.set(category, Some(rules));
        self
    }

    /// Builder: record who made the change.
    pub fn created_by(mut self, who: impl Into<String>) -> Self {
        self.created_by = who.into();
        self
    }

    fn validate(&self) -> Result<()> {
        if self.actor_id.is_empty() {
            return Err(PermsError::Invalid("actor_id is required".into()));
        }
        if self.peer_id.is_empty() {
            return Err(PermsError::Invalid("peer_id is required".into()));
        }
        if self.trust_type.is_empty() {
            return Err(PermsError::Invalid("trust_type is required".into()));
        }
        Ok(())
    }
}

/// A partial update. Only fields that are set are applied.
#[derive(Debug, Clone, Default)]
pub struct PermissionUpdate {
    pub trust_type: Option<String>,
    /// Categories set here replace the stored category.
    pub set: PermissionSet,
    /// Categories reset to inherit the trust type default.
    pub clear: Vec<PermissionCategory>,
    pub notes: Option<String>,
}

/// Where an effective permission set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionSource {
    CustomOverride,
    TrustTypeDefault,
}

/// The resolved permissions a peer holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectivePermissions {
    pub trust_type: String,
    pub source: PermissionSource,
    pub permissions: PermissionSet,
}

/// Delivers "your permissions changed" to a peer.
#[async_trait]
pub trait PermissionNotifier: Send + Sync {
    async fn notify_permissions_changed(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        effective: &EffectivePermissions,
    ) -> anyhow::Result<()>;
}

type CacheKey = (ActorId, ActorId);

/// Store of permission overrides with a read cache and optional peer
/// notification.
pub struct TrustPermissionStore {
    store: Arc<dyn AttributeStore>,
    registry: Arc<TrustTypeRegistry>,
    cache: ReadCache<CacheKey, Option<TrustPermissions>>,
    notifier: Option<Arc<dyn PermissionNotifier>>,
    notify_by_default: bool,
}

fn permissions_key(actor_id: &ActorId, peer_id: &ActorId) -> AttrKey {
    AttrKey::new(actor_id.as_str(), TRUST_PERMISSIONS_BUCKET, peer_id.as_str())
}

impl TrustPermissionStore {
    /// Create a store without notification.
    pub fn new(store: Arc<dyn AttributeStore>, registry: Arc<TrustTypeRegistry>) -> Self {
        Self {
            store,
            registry,
            cache: ReadCache::new(),
            notifier: None,
            notify_by_default: false,
        }
    }

    /// Attach a notifier. `notify_by_default` applies when a write does not
    /// say whether to notify.
    pub fn with_notifier(
        mut self,
        notifier: Arc<dyn PermissionNotifier>,
        notify_by_default: bool,
    ) -> Self {
        self.notifier = Some(notifier);
        self.notify_by_default = notify_by_default;
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Persist an override and, if enabled, wait for the peer notification
    /// to finish. The notification outcome never affects the result.
    pub async fn store_permissions(
        &self,
        perm: TrustPermissions,
        notify_peer: Option<bool>,
    ) -> Result<TrustPermissions> {
        let (stored, handle) = self.write_and_dispatch(perm, notify_peer).await?;
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "permission notification task failed");
            }
        }
        Ok(stored)
    }

    /// Persist an override and notify the peer in the background. The
    /// returned handle may be awaited or dropped.
    pub async fn store_permissions_background(
        &self,
        perm: TrustPermissions,
        notify_peer: Option<bool>,
    ) -> Result<(TrustPermissions, Option<JoinHandle<()>>)> {
        self.write_and_dispatch(perm, notify_peer).await
    }

    /// Apply a partial update to an existing override.
    pub async fn update_permissions(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        update: PermissionUpdate,
        notify_peer: Option<bool>,
    ) -> Result<TrustPermissions> {
        let mut perm = self.get_permissions(actor_id, peer_id).await?.ok_or_else(|| {
            PermsError::PermissionsNotFound {
                actor_id: actor_id.to_string(),
                peer_id: peer_id.to_string(),
            }
        })?;

        if let Some(trust_type) = update.trust_type {
            perm.trust_type = trust_type;
        }
        for (category, rules) in update.set.iter() {
            perm.permissions.set(category, Some(rules.clone()));
        }
        for category in update.clear {
            perm.permissions.set(category, None);
        }
        if update.notes.is_some() {
            perm.notes = update.notes;
        }

        self.store_permissions(perm, notify_peer).await
    }

    /// Delete an override. Returns whether one existed.
    pub async fn delete_permissions(&self, actor_id: &ActorId, peer_id: &ActorId) -> Result<bool> {
        let removed = self
            .store
            .delete_attr(&permissions_key(actor_id, peer_id))
            .await?;
        self.invalidate(actor_id, peer_id);
        Ok(removed)
    }

    async fn write_and_dispatch(
        &self,
        mut perm: TrustPermissions,
        notify_peer: Option<bool>,
    ) -> Result<(TrustPermissions, Option<JoinHandle<()>>)> {
        perm.validate()?;
        let trust_type = self.registry.require(&perm.trust_type)?;
        if !trust_type.allow_user_override && !perm.permissions.is_empty() {
            return Err(PermsError::OverrideNotAllowed(trust_type.name));
        }

        let now = now_millis();
        if let Some(existing) = self.get_permissions(&perm.actor_id, &perm.peer_id).await? {
            perm.created_at = existing.created_at;
            if perm.created_by.is_empty() {
                perm.created_by = existing.created_by;
            }
        } else if perm.created_at == 0 {
            perm.created_at = now;
        }
        perm.updated_at = now;

        self.store
            .set_typed(&permissions_key(&perm.actor_id, &perm.peer_id), &perm)
            .await?;
        self.invalidate(&perm.actor_id, &perm.peer_id);
        tracing::debug!(actor_id = %perm.actor_id, peer_id = %perm.peer_id, "stored permission override");

        let handle = match &self.notifier {
            Some(notifier) if notify_peer.unwrap_or(self.notify_by_default) => {
                let effective = EffectivePermissions {
                    trust_type: perm.trust_type.clone(),
                    source: PermissionSource::CustomOverride,
                    permissions: merge_permissions(
                        &trust_type.base_permissions,
                        &perm.permissions,
                        true,
                    ),
                };
                Some(spawn_notification(
                    notifier.clone(),
                    perm.actor_id.clone(),
                    perm.peer_id.clone(),
                    effective,
                ))
            }
            _ => None,
        };

        Ok((perm, handle))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the override for a pair, if any. Cached.
    pub async fn get_permissions(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
    ) -> Result<Option<TrustPermissions>> {
        let cache_key = (actor_id.clone(), peer_id.clone());
        let generation = match self.cache.lookup(cache_key.clone()) {
            Ok(hit) => return Ok(hit),
            Err(generation) => generation,
        };

        let loaded: Option<TrustPermissions> = self
            .store
            .get_typed(&permissions_key(actor_id, peer_id))
            .await?;
        self.cache.fill(cache_key, generation, loaded.clone());
        Ok(loaded)
    }

    /// All overrides an actor has stored.
    pub async fn list_actor_permissions(&self, actor_id: &ActorId) -> Result<Vec<TrustPermissions>> {
        let bucket = self
            .store
            .list_bucket(actor_id.as_str(), TRUST_PERMISSIONS_BUCKET)
            .await?;
        bucket
            .into_values()
            .map(|v| serde_json::from_value(v).map_err(PermsError::from))
            .collect()
    }

    /// Resolve what `peer_id` may do, given the trust type of the
    /// relationship. A stored override is merged onto the trust type
    /// defaults; otherwise the defaults apply as-is.
    pub async fn effective_permissions(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        trust_type: &str,
    ) -> Result<EffectivePermissions> {
        let base = self.registry.require(trust_type)?;

        match self.get_permissions(actor_id, peer_id).await? {
            Some(over) if base.allow_user_override => Ok(EffectivePermissions {
                trust_type: base.name,
                source: PermissionSource::CustomOverride,
                permissions: merge_permissions(&base.base_permissions, &over.permissions, true),
            }),
            _ => Ok(EffectivePermissions {
                trust_type: base.name,
                source: PermissionSource::TrustTypeDefault,
                permissions: base.base_permissions,
            }),
        }
    }

    fn invalidate(&self, actor_id: &ActorId, peer_id: &ActorId) {
        self.cache.invalidate((actor_id.clone(), peer_id.clone()));
    }
}

fn spawn_notification(
    notifier: Arc<dyn PermissionNotifier>,
    actor_id: ActorId,
    peer_id: ActorId,
    effective: EffectivePermissions,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match notifier
            .notify_permissions_changed(&actor_id, &peer_id, &effective)
            .await
        {
            Ok(()) => tracing::debug!(actor_id = %actor_id, peer_id = %peer_id, "peer notified of permission change"),
            Err(e) => tracing::warn!(
                actor_id = %actor_id,
                peer_id = %peer_id,
                error = %e,
                "permission change notification failed"
            ),
        }
    })
}
