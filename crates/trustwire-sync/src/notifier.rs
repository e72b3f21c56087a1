//! Permission-change notifications to peers.
//!
//! Permission callbacks ride the same sequencing as data callbacks, on the
//! reserved `permissions` subscription, so the peer applies them in order.

use async_trait::async_trait;
use trustwire_core::{now_millis, ActorId, SubscriptionId};
use trustwire_perms::{EffectivePermissions, PermissionNotifier, TrustStore};

use crate::delivery::{DeliveryManager, DeliveryOutcome, OutboundCallback};
use crate::messages::{callback_url, CallbackKind, CallbackMessage, CallbackTarget};
use crate::outbound::OutboundSequencer;

/// Sends a peer its new effective permissions.
#[derive(Clone)]
pub struct PeerNotifier {
    trusts: TrustStore,
    sequencer: OutboundSequencer,
    delivery: DeliveryManager,
}

impl PeerNotifier {
    pub fn new(trusts: TrustStore, sequencer: OutboundSequencer, delivery: DeliveryManager) -> Self {
        Self {
            trusts,
            sequencer,
            delivery,
        }
    }
}

#[async_trait]
impl PermissionNotifier for PeerNotifier {
    async fn notify_permissions_changed(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        effective: &EffectivePermissions,
    ) -> anyhow::Result<()> {
        let trust = self.trusts.require(actor_id, peer_id).await?;
        let subscription = SubscriptionId::permissions();
        let sequence = self.sequencer.next(actor_id, peer_id, &subscription).await?;

        let message =
            CallbackMessage::new(sequence, CallbackKind::Permission, serde_json::to_value(effective)?)
                .for_subscription(subscription)
                .at(now_millis());
        let callback = OutboundCallback {
            destination: peer_id.to_string(),
            url: callback_url(&trust.base_uri, CallbackTarget::Permissions, actor_id, None),
            secret: trust.secret,
            message,
            fallback_url: None,
        };

        match self.delivery.deliver(callback).await? {
            DeliveryOutcome::Delivered { status, .. } => {
                tracing::debug!(
                    actor_id = %actor_id,
                    peer_id = %peer_id,
                    sequence,
                    status,
                    "permission change delivered"
                );
                Ok(())
            }
            DeliveryOutcome::Backpressure { status } => {
                anyhow::bail!("peer {peer_id} refused permission callback {sequence} with {status}")
            }
        }
    }
}
