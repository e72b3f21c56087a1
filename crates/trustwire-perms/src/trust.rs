//! Trust relationships between actors.
//!
//! A relationship is stored once per side: `alice`'s `_trust` bucket holds
//! her view of `bob`, keyed by `bob`'s id. The shared secret authenticates
//! callbacks in both directions and is rotated with compare-and-swap so two
//! concurrent rotations can never both succeed.

use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use trustwire_core::{now_millis, ActorId};
use trustwire_store::{AttrKey, AttributeStore, StoreExt};

use crate::error::{PermsError, Result};

/// Bucket holding trust relationships, keyed by peer id.
pub const TRUST_BUCKET: &str = "_trust";

/// Secondary index from shared secret to relationship.
pub const SECRET_INDEX: &str = "trust_secret";

/// Length of generated secrets, in bytes before hex encoding.
pub const SECRET_BYTES: usize = 32;

/// One side of a trust link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRelationship {
    pub actor_id: ActorId,
    pub peer_id: ActorId,
    /// Name of the trust type granted to the peer.
    pub trust_type: String,
    /// Shared bearer secret.
    pub secret: String,
    /// Approved by this actor.
    #[serde(default)]
    pub approved: bool,
    /// Approved by the peer.
    #[serde(default)]
    pub peer_approved: bool,
    /// The peer proved control of its endpoint.
    #[serde(default)]
    pub verified: bool,
    /// Root of the peer's callback endpoints.
    pub base_uri: String,
    pub created_at: i64,
}

impl TrustRelationship {
    /// Both sides have approved.
    pub fn is_active(&self) -> bool {
        self.approved && self.peer_approved
    }

    /// Constant-time comparison against a presented secret.
    pub fn secret_matches(&self, presented: &str) -> bool {
        let a = self.secret.as_bytes();
        let b = presented.as_bytes();
        a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

/// Generate a fresh random secret.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Persistence for trust relationships.
#[derive(Clone)]
pub struct TrustStore {
    store: Arc<dyn AttributeStore>,
}

fn trust_key(actor_id: &ActorId, peer_id: &ActorId) -> AttrKey {
    AttrKey::new(actor_id.as_str(), TRUST_BUCKET, peer_id.as_str())
}

fn not_found(actor_id: &ActorId, peer_id: &ActorId) -> PermsError {
    PermsError::TrustNotFound {
        actor_id: actor_id.to_string(),
        peer_id: peer_id.to_string(),
    }
}

impl TrustStore {
    /// Create a trust store over an attribute store.
    pub fn new(store: Arc<dyn AttributeStore>) -> Self {
        Self { store }
    }

    /// Create (or replace) a relationship with a freshly generated secret.
    /// Neither side is approved yet.
    pub async fn create(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        trust_type: &str,
        base_uri: &str,
    ) -> Result<TrustRelationship> {
        self.create_with_secret(actor_id, peer_id, trust_type, base_uri, generate_secret())
            .await
    }

    /// Create a relationship with a secret agreed out of band (the peer's
    /// side of a handshake reuses the initiator's secret).
    pub async fn create_with_secret(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        trust_type: &str,
        base_uri: &str,
        secret: String,
    ) -> Result<TrustRelationship> {
        if actor_id.is_empty() || peer_id.is_empty() {
            return Err(PermsError::Invalid("actor_id and peer_id are required".into()));
        }
        if trust_type.is_empty() {
            return Err(PermsError::Invalid("trust_type is required".into()));
        }

        let trust = TrustRelationship {
            actor_id: actor_id.clone(),
            peer_id: peer_id.clone(),
            trust_type: trust_type.to_string(),
            secret,
            approved: false,
            peer_approved: false,
            verified: false,
            base_uri: base_uri.trim_end_matches('/').to_string(),
            created_at: now_millis(),
        };

        if let Some(previous) = self.get(actor_id, peer_id).await? {
            self.store.delete_index(SECRET_INDEX, &previous.secret).await?;
        }

        let key = trust_key(actor_id, peer_id);
        self.store.set_typed(&key, &trust).await?;
        self.store.set_index(SECRET_INDEX, &trust.secret, &key).await?;

        tracing::info!(actor_id = %actor_id, peer_id = %peer_id, trust_type, "trust created");
        Ok(trust)
    }

    /// Get the relationship, if any.
    pub async fn get(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
    ) -> Result<Option<TrustRelationship>> {
        Ok(self.store.get_typed(&trust_key(actor_id, peer_id)).await?)
    }

    /// Get the relationship or fail with [`PermsError::TrustNotFound`].
    pub async fn require(&self, actor_id: &ActorId, peer_id: &ActorId) -> Result<TrustRelationship> {
        self.get(actor_id, peer_id)
            .await?
            .ok_or_else(|| not_found(actor_id, peer_id))
    }

    /// All relationships of an actor.
    pub async fn list(&self, actor_id: &ActorId) -> Result<Vec<TrustRelationship>> {
        let bucket = self.store.list_bucket(actor_id.as_str(), TRUST_BUCKET).await?;
        let mut out = Vec::with_capacity(bucket.len());
        for (peer, value) in bucket {
            match serde_json::from_value(value) {
                Ok(trust) => out.push(trust),
                Err(e) => tracing::warn!(actor_id = %actor_id, peer_id = %peer, error = %e, "unreadable trust record"),
            }
        }
        Ok(out)
    }

    /// Resolve a relationship from its shared secret.
    pub async fn find_by_secret(&self, secret: &str) -> Result<Option<TrustRelationship>> {
        let Some(key) = self.store.lookup_index(SECRET_INDEX, secret).await? else {
            return Ok(None);
        };
        let trust: Option<TrustRelationship> = self.store.get_typed(&key).await?;
        Ok(trust.filter(|t| t.secret_matches(secret)))
    }

    /// Authenticate a request from `peer_id` presenting `secret`.
    ///
    /// Fails with `TrustNotFound` for an unknown peer, `InvalidSecret` for a
    /// wrong secret, and `TrustNotApproved` unless both sides approved.
    pub async fn authenticate(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        secret: &str,
    ) -> Result<TrustRelationship> {
        let trust = self.require(actor_id, peer_id).await?;
        if !trust.secret_matches(secret) {
            return Err(PermsError::InvalidSecret(peer_id.to_string()));
        }
        if !trust.is_active() {
            return Err(PermsError::TrustNotApproved {
                actor_id: actor_id.to_string(),
                peer_id: peer_id.to_string(),
            });
        }
        Ok(trust)
    }

    /// Mark approved by this actor.
    pub async fn approve(&self, actor_id: &ActorId, peer_id: &ActorId) -> Result<TrustRelationship> {
        self.modify(actor_id, peer_id, |t| t.approved = true).await
    }

    /// Record that the peer approved.
    pub async fn set_peer_approved(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        approved: bool,
    ) -> Result<TrustRelationship> {
        self.modify(actor_id, peer_id, |t| t.peer_approved = approved)
            .await
    }

    /// Record that the peer's endpoint was verified.
    pub async fn mark_verified(&self, actor_id: &ActorId, peer_id: &ActorId) -> Result<TrustRelationship> {
        self.modify(actor_id, peer_id, |t| t.verified = true).await
    }

    /// Change the trust type granted to the peer.
    pub async fn set_trust_type(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        trust_type: &str,
    ) -> Result<TrustRelationship> {
        let trust_type = trust_type.to_string();
        self.modify(actor_id, peer_id, move |t| t.trust_type = trust_type)
            .await
    }

    /// Replace the shared secret atomically. Fails with
    /// [`PermsError::Conflict`] if the record changed since it was read.
    pub async fn rotate_secret(&self, actor_id: &ActorId, peer_id: &ActorId) -> Result<String> {
        let secret = generate_secret();
        let updated = self
            .modify(actor_id, peer_id, |t| t.secret = secret)
            .await?;

        let key = trust_key(actor_id, peer_id);
        self.store.set_index(SECRET_INDEX, &updated.secret, &key).await?;
        tracing::info!(actor_id = %actor_id, peer_id = %peer_id, "secret rotated");
        Ok(updated.secret)
    }

    /// Delete the relationship. Returns the removed record.
    pub async fn delete(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
    ) -> Result<Option<TrustRelationship>> {
        let Some(trust) = self.get(actor_id, peer_id).await? else {
            return Ok(None);
        };
        self.store.delete_attr(&trust_key(actor_id, peer_id)).await?;
        self.store.delete_index(SECRET_INDEX, &trust.secret).await?;
        tracing::info!(actor_id = %actor_id, peer_id = %peer_id, "trust deleted");
        Ok(Some(trust))
    }

    /// Read, mutate, and write back with compare-and-swap. The old secret's
    /// index entry is removed when the secret changes.
    async fn modify<F>(&self, actor_id: &ActorId, peer_id: &ActorId, f: F) -> Result<TrustRelationship>
    where
        F: FnOnce(&mut TrustRelationship) + Send,
    {
        let key = trust_key(actor_id, peer_id);
        let current = self
            .store
            .get_attr(&key)
            .await?
            .ok_or_else(|| not_found(actor_id, peer_id))?;

        let mut trust: TrustRelationship = serde_json::from_value(current.clone())?;
        let old_secret = trust.secret.clone();
        f(&mut trust);
        let new = serde_json::to_value(&trust)?;

        if !self
            .store
            .conditional_update_attr(&key, Some(&current), new)
            .await?
        {
            return Err(PermsError::Conflict(format!(
                "trust {} -> {} changed concurrently",
                actor_id, peer_id
            )));
        }

        if old_secret != trust.secret {
            self.store.delete_index(SECRET_INDEX, &old_secret).await?;
        }
        Ok(trust)
    }
}
