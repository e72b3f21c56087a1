//! The Node: one actor's view of its peers.
//!
//! A node owns the stores and caches for a single actor and exposes the
//! operations an HTTP adapter or an application calls: trust lifecycle,
//! permission management, outbound publishing, resync and maintenance.
//! Inbound callback handling lives in [`crate::inbound`].

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use trustwire_core::{
    now_millis, AccessDecision, ActorId, PermissionChanges, PermissionSet, SubscriptionId,
    TrustType,
};
use trustwire_perms::{
    AccessRequest, PeerPermissionCache, PeerPermissions, PermissionEvaluator, PermissionNotifier,
    PermissionUpdate, PermsError, RemoteMirror, TrustPermissionStore, TrustPermissions,
    TrustRelationship, TrustStore, TrustTypeRegistry,
};
use trustwire_store::{AttributeStore, MemoryStore, SweepReport};
use trustwire_sync::{
    callback_url, CallbackEvent, CallbackHandler, CallbackKind, CallbackMessage, CallbackProcessor,
    CallbackTarget, CallbackTransport, DeliveryManager, DeliveryOutcome, HttpTransport,
    OutboundCallback, OutboundSequencer, PeerNotifier, SyncError,
};

use crate::config::TrustwireConfig;
use crate::error::{NodeError, Result};
use crate::fetch::{HttpFetcher, PeerFetcher, PermissionQuery};

/// Builder for [`Node`].
pub struct NodeBuilder {
    actor_id: ActorId,
    base_uri: String,
    config: TrustwireConfig,
    store: Option<Arc<dyn AttributeStore>>,
    transport: Option<Arc<dyn CallbackTransport>>,
    fetcher: Option<Arc<dyn PeerFetcher>>,
    handler: Option<Arc<dyn CallbackHandler>>,
}

impl NodeBuilder {
    pub fn new(actor_id: ActorId, base_uri: impl Into<String>) -> Self {
        Self {
            actor_id,
            base_uri: base_uri.into(),
            config: TrustwireConfig::default(),
            store: None,
            transport: None,
            fetcher: None,
            handler: None,
        }
    }

    pub fn config(mut self, config: TrustwireConfig) -> Self {
        self.config = config;
        self
    }

    /// Storage backend. Defaults to [`MemoryStore`].
    pub fn store(mut self, store: Arc<dyn AttributeStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Outbound transport. Defaults to [`HttpTransport`].
    pub fn transport(mut self, transport: Arc<dyn CallbackTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Source of peer state. Defaults to [`HttpFetcher`].
    pub fn fetcher(mut self, fetcher: Arc<dyn PeerFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Application hook called for every applied data callback, after
    /// mirroring.
    pub fn handler(mut self, handler: Arc<dyn CallbackHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub async fn build(self) -> Result<Node> {
        self.config.validate()?;
        if self.actor_id.is_empty() {
            return Err(NodeError::InvalidRequest("actor id is empty".into()));
        }

        let config = self.config;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn AttributeStore>);
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new()) as Arc<dyn CallbackTransport>);
        let fetcher = self.fetcher.unwrap_or_else(|| {
            Arc::new(HttpFetcher::new(config.request_timeout())) as Arc<dyn PeerFetcher>
        });

        let registry = Arc::new(TrustTypeRegistry::with_defaults(store.clone()).await?);
        let trusts = TrustStore::new(store.clone());
        let sequencer = OutboundSequencer::new(store.clone(), config.first_sequence);
        let delivery = DeliveryManager::new(transport, config.delivery_config());
        let notifier = PeerNotifier::new(trusts.clone(), sequencer.clone(), delivery.clone());
        let permissions = Arc::new(
            TrustPermissionStore::new(store.clone(), registry.clone())
                .with_notifier(Arc::new(notifier.clone()), config.notify_peer_on_change),
        );

        tracing::info!(actor_id = %self.actor_id, base_uri = %self.base_uri, "node started");
        Ok(Node {
            evaluator: PermissionEvaluator::new(trusts.clone(), registry.clone(), permissions.clone()),
            peer_permissions: Arc::new(PeerPermissionCache::new(store.clone())),
            mirror: RemoteMirror::new(store.clone()),
            processor: Arc::new(CallbackProcessor::new(
                self.actor_id.clone(),
                store.clone(),
                config.processor_config(),
            )),
            actor_id: self.actor_id,
            base_uri: self.base_uri.trim_end_matches('/').to_string(),
            config,
            store,
            registry,
            trusts,
            permissions,
            sequencer,
            delivery,
            notifier,
            fetcher,
            handler: self.handler,
        })
    }
}

/// Result of a [`Node::maintain`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub sweep: SweepReport,
    /// Subscriptions resynced because their gap timed out.
    pub resynced: Vec<(ActorId, SubscriptionId)>,
    /// Resyncs that failed and will be retried next pass.
    pub failed: usize,
}

/// One actor's trust, permission and callback state.
///
/// Clones share all state.
#[derive(Clone)]
pub struct Node {
    pub(crate) actor_id: ActorId,
    pub(crate) base_uri: String,
    pub(crate) config: TrustwireConfig,
    pub(crate) store: Arc<dyn AttributeStore>,
    pub(crate) registry: Arc<TrustTypeRegistry>,
    pub(crate) trusts: TrustStore,
    pub(crate) permissions: Arc<TrustPermissionStore>,
    pub(crate) evaluator: PermissionEvaluator,
    pub(crate) peer_permissions: Arc<PeerPermissionCache>,
    pub(crate) mirror: RemoteMirror,
    pub(crate) processor: Arc<CallbackProcessor>,
    pub(crate) sequencer: OutboundSequencer,
    pub(crate) delivery: DeliveryManager,
    pub(crate) notifier: PeerNotifier,
    pub(crate) fetcher: Arc<dyn PeerFetcher>,
    pub(crate) handler: Option<Arc<dyn CallbackHandler>>,
}

impl Node {
    pub fn builder(actor_id: ActorId, base_uri: impl Into<String>) -> NodeBuilder {
        NodeBuilder::new(actor_id, base_uri)
    }

    pub fn actor_id(&self) -> &ActorId {
        &self.actor_id
    }

    /// Root of this node's callback endpoints.
    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    pub fn config(&self) -> &TrustwireConfig {
        &self.config
    }

    pub fn registry(&self) -> &TrustTypeRegistry {
        &self.registry
    }

    pub fn trusts(&self) -> &TrustStore {
        &self.trusts
    }

    pub fn peer_permissions(&self) -> &PeerPermissionCache {
        &self.peer_permissions
    }

    /// Data mirrored from peers.
    pub fn mirror(&self) -> &RemoteMirror {
        &self.mirror
    }

    pub fn processor(&self) -> &CallbackProcessor {
        &self.processor
    }

    pub fn delivery(&self) -> &DeliveryManager {
        &self.delivery
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Trust Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Start a relationship with `peer_id`, reachable at `peer_base_uri`.
    pub async fn create_trust(
        &self,
        peer_id: &ActorId,
        trust_type: &str,
        peer_base_uri: &str,
    ) -> Result<TrustRelationship> {
        self.registry.require(trust_type)?;
        Ok(self
            .trusts
            .create(&self.actor_id, peer_id, trust_type, peer_base_uri)
            .await?)
    }

    /// Record the peer's side of a relationship it initiated, reusing its
    /// secret.
    pub async fn accept_trust(
        &self,
        peer_id: &ActorId,
        trust_type: &str,
        peer_base_uri: &str,
        secret: &str,
    ) -> Result<TrustRelationship> {
        self.registry.require(trust_type)?;
        Ok(self
            .trusts
            .create_with_secret(&self.actor_id, peer_id, trust_type, peer_base_uri, secret.to_string())
            .await?)
    }

    /// Approve on our side. Once both sides approved, the peer's grants are
    /// fetched.
    pub async fn approve_trust(&self, peer_id: &ActorId) -> Result<TrustRelationship> {
        let trust = self.trusts.approve(&self.actor_id, peer_id).await?;
        self.on_possibly_active(&trust).await;
        Ok(trust)
    }

    /// Record the peer's approval.
    pub async fn peer_approved(&self, peer_id: &ActorId) -> Result<TrustRelationship> {
        let trust = self
            .trusts
            .set_peer_approved(&self.actor_id, peer_id, true)
            .await?;
        self.on_possibly_active(&trust).await;
        Ok(trust)
    }

    async fn on_possibly_active(&self, trust: &TrustRelationship) {
        if !trust.is_active() {
            return;
        }
        if let Err(e) = self.refresh_peer_permissions(&trust.peer_id).await {
            tracing::warn!(
                actor_id = %self.actor_id,
                peer_id = %trust.peer_id,
                error = %e,
                "initial peer permission fetch failed"
            );
        }
    }

    /// Grant the peer a different trust type and tell it.
    pub async fn change_trust_type(
        &self,
        peer_id: &ActorId,
        trust_type: &str,
    ) -> Result<TrustRelationship> {
        let new_type = self.registry.require(trust_type)?;
        let trust = self
            .trusts
            .set_trust_type(&self.actor_id, peer_id, trust_type)
            .await?;
        self.retype_override(peer_id, &new_type).await?;
        if self.config.notify_peer_on_change && trust.is_active() {
            self.notify_peer(&trust).await;
        }
        Ok(trust)
    }

    // An override is always merged onto the relationship's current type.
    async fn retype_override(&self, peer_id: &ActorId, trust_type: &TrustType) -> Result<()> {
        let Some(existing) = self.permissions.get_permissions(&self.actor_id, peer_id).await? else {
            return Ok(());
        };
        if existing.trust_type == trust_type.name {
            return Ok(());
        }
        if !trust_type.allow_user_override {
            self.permissions
                .delete_permissions(&self.actor_id, peer_id)
                .await?;
            tracing::info!(
                peer_id = %peer_id,
                trust_type = %trust_type.name,
                "dropped override, trust type does not allow one"
            );
            return Ok(());
        }
        let update = PermissionUpdate {
            trust_type: Some(trust_type.name.clone()),
            ..Default::default()
        };
        self.permissions
            .update_permissions(&self.actor_id, peer_id, update, Some(false))
            .await?;
        Ok(())
    }

    async fn require_trust_type(&self, peer_id: &ActorId, trust_type: &str) -> Result<()> {
        let trust = self.trusts.require(&self.actor_id, peer_id).await?;
        if trust.trust_type != trust_type {
            return Err(NodeError::InvalidRequest(format!(
                "override names trust type {trust_type}, relationship with {peer_id} is {}",
                trust.trust_type
            )));
        }
        Ok(())
    }

    pub async fn rotate_secret(&self, peer_id: &ActorId) -> Result<String> {
        Ok(self.trusts.rotate_secret(&self.actor_id, peer_id).await?)
    }

    /// Remove a relationship and everything kept because of it: the
    /// override, the peer's grants, mirrored data and sequencing state.
    /// Returns whether the relationship existed.
    pub async fn delete_trust(&self, peer_id: &ActorId) -> Result<bool> {
        let existed = self.trusts.delete(&self.actor_id, peer_id).await?.is_some();
        self.permissions
            .delete_permissions(&self.actor_id, peer_id)
            .await?;
        self.peer_permissions.delete(&self.actor_id, peer_id).await?;
        let mirrored = self.mirror.clear(&self.actor_id, peer_id).await?;
        let subscriptions = self.processor.clear_all_state_for_peer(peer_id).await?;
        let counters = self.sequencer.clear_peer(&self.actor_id, peer_id).await?;

        tracing::info!(
            actor_id = %self.actor_id,
            peer_id = %peer_id,
            existed,
            mirrored,
            subscriptions,
            counters,
            "trust relationship removed"
        );
        Ok(existed)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Permissions We Grant
    // ─────────────────────────────────────────────────────────────────────────

    /// Store an override for a peer. The peer is notified per
    /// `notify_peer_on_change`, inline when `sync_callbacks` is set.
    pub async fn set_permissions(&self, perm: TrustPermissions) -> Result<TrustPermissions> {
        if perm.actor_id != self.actor_id {
            return Err(NodeError::InvalidRequest(format!(
                "override belongs to {}, not {}",
                perm.actor_id, self.actor_id
            )));
        }
        self.require_trust_type(&perm.peer_id, &perm.trust_type).await?;
        if self.config.sync_callbacks {
            Ok(self.permissions.store_permissions(perm, None).await?)
        } else {
            let (stored, _handle) = self.permissions.store_permissions_background(perm, None).await?;
            Ok(stored)
        }
    }

    /// Partially update a peer's override.
    pub async fn update_permissions(
        &self,
        peer_id: &ActorId,
        update: PermissionUpdate,
    ) -> Result<TrustPermissions> {
        if let Some(trust_type) = &update.trust_type {
            self.require_trust_type(peer_id, trust_type).await?;
        }
        Ok(self
            .permissions
            .update_permissions(&self.actor_id, peer_id, update, None)
            .await?)
    }

    /// Drop a peer's override, reverting it to its trust type defaults.
    pub async fn clear_permissions(&self, peer_id: &ActorId) -> Result<bool> {
        let removed = self
            .permissions
            .delete_permissions(&self.actor_id, peer_id)
            .await?;
        if removed && self.config.notify_peer_on_change {
            if let Some(trust) = self.trusts.get(&self.actor_id, peer_id).await? {
                if trust.is_active() {
                    self.notify_peer(&trust).await;
                }
            }
        }
        Ok(removed)
    }

    async fn notify_peer(&self, trust: &TrustRelationship) {
        let effective = match self
            .permissions
            .effective_permissions(&self.actor_id, &trust.peer_id, &trust.trust_type)
            .await
        {
            Ok(effective) => effective,
            Err(e) => {
                tracing::warn!(peer_id = %trust.peer_id, error = %e, "cannot resolve permissions to notify");
                return;
            }
        };

        let notifier = self.notifier.clone();
        let actor_id = self.actor_id.clone();
        let peer_id = trust.peer_id.clone();
        let task = async move {
            if let Err(e) = notifier
                .notify_permissions_changed(&actor_id, &peer_id, &effective)
                .await
            {
                tracing::warn!(
                    actor_id = %actor_id,
                    peer_id = %peer_id,
                    error = %e,
                    "permission change notification failed"
                );
            }
        };
        if self.config.sync_callbacks {
            task.await;
        } else {
            tokio::spawn(task);
        }
    }

    /// Decide a request made by `peer_id`.
    pub async fn check_access(
        &self,
        peer_id: &ActorId,
        request: AccessRequest<'_>,
    ) -> Result<AccessDecision> {
        Ok(self.evaluator.check(&self.actor_id, peer_id, request).await?)
    }

    /// Decide a raw request against the trust type's path ACL.
    pub async fn check_acl(&self, peer_id: &ActorId, path: &str, method: &str) -> Result<AccessDecision> {
        Ok(self
            .evaluator
            .check_acl(&self.actor_id, peer_id, path, method)
            .await?)
    }

    /// What `peer_id` may do here. Unknown peers are `TrustNotFound` (404),
    /// inactive relationships `TrustNotApproved` (403).
    pub async fn query_permissions(&self, peer_id: &ActorId) -> Result<PermissionQuery> {
        let trust = self.trusts.require(&self.actor_id, peer_id).await?;
        if !trust.is_active() {
            return Err(PermsError::TrustNotApproved {
                actor_id: self.actor_id.to_string(),
                peer_id: peer_id.to_string(),
            }
            .into());
        }
        self.permission_query(&trust).await
    }

    /// [`Node::query_permissions`] on behalf of a peer presenting `secret`.
    pub async fn serve_permissions(&self, peer_id: &ActorId, secret: &str) -> Result<PermissionQuery> {
        let trust = self.trusts.authenticate(&self.actor_id, peer_id, secret).await?;
        self.permission_query(&trust).await
    }

    async fn permission_query(&self, trust: &TrustRelationship) -> Result<PermissionQuery> {
        let effective = self
            .permissions
            .effective_permissions(&self.actor_id, &trust.peer_id, &trust.trust_type)
            .await?;
        let sequence = self
            .sequencer
            .current(&self.actor_id, &trust.peer_id, &SubscriptionId::permissions())
            .await?;
        Ok(PermissionQuery {
            actor_id: self.actor_id.clone(),
            peer_id: trust.peer_id.clone(),
            trust_type: effective.trust_type,
            source: effective.source,
            permissions: effective.permissions,
            sequence,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Permissions Granted To Us
    // ─────────────────────────────────────────────────────────────────────────

    /// Fetch what the peer grants us and apply the change.
    pub async fn refresh_peer_permissions(&self, peer_id: &ActorId) -> Result<PermissionChanges> {
        let trust = self.trusts.require(&self.actor_id, peer_id).await?;
        match self.fetcher.fetch_permissions(&trust).await {
            Ok(query) => self.apply_peer_permissions(&trust, query.permissions).await,
            Err(e) => {
                self.peer_permissions
                    .record_fetch_error(&self.actor_id, peer_id, format!("{e:#}"))
                    .await?;
                Err(NodeError::Fetch(e))
            }
        }
    }

    /// Store a new snapshot of the peer's grants. Revoked patterns purge
    /// mirrored data when `auto_delete_on_revocation` is set; newly granted
    /// patterns are fetched into the mirror.
    pub(crate) async fn apply_peer_permissions(
        &self,
        trust: &TrustRelationship,
        permissions: PermissionSet,
    ) -> Result<PermissionChanges> {
        let peer_id = &trust.peer_id;
        let changes = self
            .peer_permissions
            .store(PeerPermissions::new(self.actor_id.clone(), peer_id.clone(), permissions))
            .await?;

        if changes.has_revocations && self.config.auto_delete_on_revocation {
            self.mirror
                .purge_matching(&self.actor_id, peer_id, &changes.revoked_patterns)
                .await?;
        }

        if !changes.is_initial && !changes.granted_patterns.is_empty() && self.config.auto_storage {
            match self.fetcher.fetch_properties(trust, &changes.granted_patterns).await {
                Ok(data) if data.is_object() => {
                    // granted properties belong to the permission channel
                    self.mirror
                        .apply_diff(&self.actor_id, peer_id, &SubscriptionId::permissions(), &data)
                        .await?;
                }
                Ok(_) => tracing::debug!(peer_id = %peer_id, "granted properties response was not an object"),
                Err(e) => tracing::warn!(
                    peer_id = %peer_id,
                    error = %format!("{e:#}"),
                    "fetching newly granted properties failed"
                ),
            }
        }
        Ok(changes)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Publishing
    // ─────────────────────────────────────────────────────────────────────────

    async fn outbound(
        &self,
        peer_id: &ActorId,
        subscription_id: &SubscriptionId,
        kind: CallbackKind,
        data: Value,
    ) -> Result<OutboundCallback> {
        if subscription_id.is_permissions() {
            return Err(NodeError::InvalidRequest(format!(
                "subscription id {subscription_id} is reserved"
            )));
        }
        let trust = self.trusts.require(&self.actor_id, peer_id).await?;
        if !trust.is_active() {
            return Err(PermsError::TrustNotApproved {
                actor_id: self.actor_id.to_string(),
                peer_id: peer_id.to_string(),
            }
            .into());
        }

        let sequence = self
            .sequencer
            .next(&self.actor_id, peer_id, subscription_id)
            .await?;
        let message = CallbackMessage::new(sequence, kind, data)
            .for_subscription(subscription_id.clone())
            .at(now_millis());

        Ok(OutboundCallback {
            destination: peer_id.to_string(),
            url: callback_url(
                &trust.base_uri,
                CallbackTarget::Subscriptions,
                &self.actor_id,
                Some(subscription_id),
            ),
            secret: trust.secret,
            message,
            fallback_url: Some(format!(
                "{}/subscriptions/{}/{}/{}",
                self.base_uri, peer_id, subscription_id, sequence
            )),
        })
    }

    /// Send the next diff on a subscription and wait for the answer.
    pub async fn publish(
        &self,
        peer_id: &ActorId,
        subscription_id: &SubscriptionId,
        data: Value,
    ) -> Result<(u64, DeliveryOutcome)> {
        let callback = self
            .outbound(peer_id, subscription_id, CallbackKind::Diff, data)
            .await?;
        let sequence = callback.message.sequence;
        Ok((sequence, self.delivery.deliver(callback).await?))
    }

    /// Send the next diff per `sync_callbacks`: inline, or in the background
    /// with the handle returned. Failures are logged.
    pub async fn publish_background(
        &self,
        peer_id: &ActorId,
        subscription_id: &SubscriptionId,
        data: Value,
    ) -> Result<(u64, Option<JoinHandle<()>>)> {
        let callback = self
            .outbound(peer_id, subscription_id, CallbackKind::Diff, data)
            .await?;
        let sequence = callback.message.sequence;
        Ok((sequence, self.delivery.notify(callback).await))
    }

    /// Send full authoritative state, resetting the peer's ordering.
    pub async fn publish_resync(
        &self,
        peer_id: &ActorId,
        subscription_id: &SubscriptionId,
        state: Value,
    ) -> Result<(u64, DeliveryOutcome)> {
        let callback = self
            .outbound(peer_id, subscription_id, CallbackKind::Resync, state)
            .await?;
        let sequence = callback.message.sequence;
        Ok((sequence, self.delivery.deliver(callback).await?))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Resync And Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Re-fetch authoritative state for a subscription and continue
    /// sequencing after it. Returns the sequence resumed from, `None` when
    /// the peer reported none.
    pub async fn resync_subscription(
        &self,
        peer_id: &ActorId,
        subscription_id: &SubscriptionId,
    ) -> Result<Option<u64>> {
        let trust = self.trusts.require(&self.actor_id, peer_id).await?;

        if subscription_id.is_permissions() {
            let query = self
                .fetcher
                .fetch_permissions(&trust)
                .await
                .map_err(NodeError::Fetch)?;
            self.apply_peer_permissions(&trust, query.permissions).await?;
            match query.sequence {
                Some(sequence) => {
                    self.processor
                        .reset_after_resync(peer_id, subscription_id, sequence)
                        .await?
                }
                None => {
                    self.processor.clear_state(peer_id, subscription_id).await?;
                }
            }
            return Ok(query.sequence);
        }

        let snapshot = self
            .fetcher
            .fetch_subscription(&trust, subscription_id)
            .await
            .map_err(NodeError::Fetch)?;
        let event = CallbackEvent {
            peer_id: peer_id.clone(),
            subscription_id: subscription_id.clone(),
            sequence: snapshot.sequence,
            kind: CallbackKind::Resync,
            payload: snapshot.data,
        };
        self.apply_event(&trust, &event)
            .await
            .map_err(SyncError::Handler)?;
        self.processor
            .reset_after_resync(peer_id, subscription_id, snapshot.sequence)
            .await?;

        tracing::info!(
            actor_id = %self.actor_id,
            peer_id = %peer_id,
            subscription_id = %subscription_id,
            sequence = snapshot.sequence,
            "subscription resynced"
        );
        Ok(Some(snapshot.sequence))
    }

    /// Sweep expired storage entries and resync subscriptions whose gap
    /// timed out.
    pub async fn maintain(&self) -> Result<MaintenanceReport> {
        let sweep = self.store.sweep_expired(now_millis()).await?;
        let mut report = MaintenanceReport {
            sweep,
            ..Default::default()
        };

        for (peer_id, subscription_id) in self.processor.stale_subscriptions().await? {
            match self.resync_subscription(&peer_id, &subscription_id).await {
                Ok(_) => report.resynced.push((peer_id, subscription_id)),
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        peer_id = %peer_id,
                        subscription_id = %subscription_id,
                        error = %e,
                        "resync of stale subscription failed"
                    );
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustwire_sync::MemoryTransport;

    async fn node(config: TrustwireConfig) -> Result<Node> {
        Node::builder(ActorId::from("alice"), "https://alice.example/")
            .config(config)
            .transport(Arc::new(MemoryTransport::new()))
            .build()
            .await
    }

    #[tokio::test]
    async fn test_build_validates_config() {
        let err = node(TrustwireConfig {
            max_pending: 0,
            ..Default::default()
        })
        .await
        .err()
        .unwrap();
        assert!(matches!(err, NodeError::Config(_)));

        let node = node(TrustwireConfig::default()).await.unwrap();
        assert_eq!(node.base_uri(), "https://alice.example");
        assert!(node.registry().get("friend").is_some());
    }

    #[tokio::test]
    async fn test_set_permissions_rejects_foreign_override() {
        let node = node(TrustwireConfig::default()).await.unwrap();
        let perm = TrustPermissions::new(ActorId::from("carol"), ActorId::from("bob"), "friend");
        let err = node.set_permissions(perm).await.unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn test_maintain_sweeps_without_stale_subscriptions() {
        let node = node(TrustwireConfig::default()).await.unwrap();
        let report = node.maintain().await.unwrap();
        assert_eq!(report, MaintenanceReport::default());
    }
}
