//! Receiving callbacks from peers.
//!
//! ```text
//! POST {base_uri}/callbacks/permissions/{peer_id}
//! POST {base_uri}/callbacks/subscriptions/{peer_id}/{subscription_id}
//! ```
//!
//! Every request is authenticated against the trust relationship with the
//! sender, sequenced by the [`CallbackProcessor`](trustwire_sync::CallbackProcessor)
//! and applied: permission callbacks update the peer permission cache, data
//! callbacks update the mirror and reach the application handler.

use async_trait::async_trait;
use serde_json::{json, Value};
use trustwire_core::{ActorId, SubscriptionId};
use trustwire_perms::{EffectivePermissions, TrustRelationship};
use trustwire_sync::{
    CallbackEndpoint, CallbackEvent, CallbackHandler, CallbackKind, CallbackMessage, CallbackTarget,
    ProcessResult,
};

use crate::error::{NodeError, Result};
use crate::node::Node;

/// Status and body to answer an inbound callback with.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundResponse {
    pub status: u16,
    pub body: Value,
    /// Seconds the sender should wait before retrying, for 429 answers.
    pub retry_after: Option<u64>,
}

impl InboundResponse {
    fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            retry_after: None,
        }
    }

    fn error(err: &NodeError) -> Self {
        Self::new(err.status(), json!({ "error": err.to_string() }))
    }
}

/// Applies sequenced callbacks from the peer on the other side of `trust`.
struct Applier<'a> {
    node: &'a Node,
    trust: &'a TrustRelationship,
}

#[async_trait]
impl CallbackHandler for Applier<'_> {
    async fn handle(&self, event: &CallbackEvent) -> anyhow::Result<()> {
        self.node.apply_event(self.trust, event).await
    }
}

impl Node {
    /// Handle a callback POSTed by `peer_id` with bearer `secret`.
    ///
    /// | Outcome                         | Status |
    /// |---------------------------------|--------|
    /// | applied or already applied      | 204    |
    /// | buffered, or resync started     | 202    |
    /// | buffer full                     | 429    |
    /// | malformed or misaddressed       | 400    |
    /// | wrong secret, inactive trust    | 403    |
    /// | unknown peer                    | 404    |
    pub async fn handle_callback(
        &self,
        target: CallbackTarget,
        peer_id: &ActorId,
        subscription_id: Option<&SubscriptionId>,
        secret: &str,
        body: &[u8],
    ) -> InboundResponse {
        match self
            .try_handle_callback(target, peer_id, subscription_id, secret, body)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    actor_id = %self.actor_id,
                    peer_id = %peer_id,
                    target = %target,
                    status = err.status(),
                    error = %err,
                    "callback refused"
                );
                InboundResponse::error(&err)
            }
        }
    }

    async fn try_handle_callback(
        &self,
        target: CallbackTarget,
        peer_id: &ActorId,
        subscription_id: Option<&SubscriptionId>,
        secret: &str,
        body: &[u8],
    ) -> Result<InboundResponse> {
        let trust = self.trusts.authenticate(&self.actor_id, peer_id, secret).await?;
        let message = CallbackMessage::from_slice(body)?;
        let subscription_id = resolve_subscription(target, subscription_id, &message)?;

        match (target, message.kind) {
            (CallbackTarget::Permissions, CallbackKind::Diff) => {
                return Err(NodeError::InvalidRequest(
                    "permission endpoint does not take data diffs".into(),
                ))
            }
            (CallbackTarget::Subscriptions, CallbackKind::Permission) => {
                return Err(NodeError::InvalidRequest(
                    "permission callbacks go to the permissions endpoint".into(),
                ))
            }
            _ => {}
        }

        let event = CallbackEvent {
            peer_id: peer_id.clone(),
            subscription_id,
            sequence: message.sequence,
            kind: message.kind,
            payload: message.payload(),
        };
        let applier = Applier {
            node: self,
            trust: &trust,
        };

        if !self.config.auto_sequence {
            applier
                .handle(&event)
                .await
                .map_err(trustwire_sync::SyncError::Handler)?;
            return Ok(InboundResponse::new(204, Value::Null));
        }

        let result = self.processor.process_callback(event.clone(), &applier).await?;
        Ok(self.respond(&event, result).await)
    }

    async fn respond(&self, event: &CallbackEvent, result: ProcessResult) -> InboundResponse {
        match result {
            ProcessResult::Processed { .. } | ProcessResult::Duplicate => {
                InboundResponse::new(204, Value::Null)
            }
            ProcessResult::Pending => {
                InboundResponse::new(202, json!({ "status": "pending", "sequence": event.sequence }))
            }
            ProcessResult::PendingRejected => InboundResponse {
                status: 429,
                body: json!({ "error": "too many pending callbacks" }),
                retry_after: Some(self.config.gap_timeout_seconds),
            },
            ProcessResult::ResyncTriggered => {
                self.start_resync(event.peer_id.clone(), event.subscription_id.clone())
                    .await;
                InboundResponse::new(202, json!({ "status": "resync" }))
            }
        }
    }

    async fn start_resync(&self, peer_id: ActorId, subscription_id: SubscriptionId) {
        let node = self.clone();
        let task = async move {
            if let Err(e) = node.resync_subscription(&peer_id, &subscription_id).await {
                tracing::warn!(
                    peer_id = %peer_id,
                    subscription_id = %subscription_id,
                    error = %e,
                    "resync failed, will retry on next maintenance pass"
                );
            }
        };
        if self.config.sync_callbacks {
            task.await;
        } else {
            tokio::spawn(task);
        }
    }

    /// Apply one sequenced callback from the peer on the other side of
    /// `trust`.
    pub(crate) async fn apply_event(
        &self,
        trust: &TrustRelationship,
        event: &CallbackEvent,
    ) -> anyhow::Result<()> {
        if event.subscription_id.is_permissions() {
            let permissions = match serde_json::from_value::<EffectivePermissions>(event.payload.clone()) {
                Ok(effective) => effective.permissions,
                Err(_) => {
                    tracing::debug!(peer_id = %event.peer_id, "permission callback without inline grants, fetching");
                    self.fetcher.fetch_permissions(trust).await?.permissions
                }
            };
            self.apply_peer_permissions(trust, permissions).await?;
            return Ok(());
        }

        let mut event = event.clone();
        if event.payload.is_null() {
            event.payload = self
                .fetcher
                .fetch_subscription(trust, &event.subscription_id)
                .await?
                .data;
            event.kind = CallbackKind::Resync;
        }

        if self.config.auto_storage && event.payload.is_object() {
            match event.kind {
                CallbackKind::Resync => {
                    self.mirror
                        .replace_all(&self.actor_id, &event.peer_id, &event.subscription_id, &event.payload)
                        .await?
                }
                _ => {
                    self.mirror
                        .apply_diff(&self.actor_id, &event.peer_id, &event.subscription_id, &event.payload)
                        .await?
                }
            };
        }

        if let Some(handler) = &self.handler {
            handler.handle(&event).await?;
        }
        Ok(())
    }
}

fn resolve_subscription(
    target: CallbackTarget,
    from_path: Option<&SubscriptionId>,
    message: &CallbackMessage,
) -> Result<SubscriptionId> {
    match target {
        CallbackTarget::Permissions => Ok(SubscriptionId::permissions()),
        CallbackTarget::Subscriptions => {
            let Some(from_path) = from_path else {
                return Err(NodeError::InvalidRequest("subscription id missing".into()));
            };
            if from_path.is_permissions() {
                return Err(NodeError::InvalidRequest(format!(
                    "subscription id {from_path} is reserved"
                )));
            }
            match &message.subscription_id {
                Some(in_body) if in_body != from_path => Err(NodeError::InvalidRequest(format!(
                    "body addresses subscription {in_body}, path {from_path}"
                ))),
                _ => Ok(from_path.clone()),
            }
        }
    }
}

/// Split `/callbacks/{target}/{peer_id}[/{subscription_id}]`.
fn parse_callback_path(path: &str) -> Option<(CallbackTarget, ActorId, Option<SubscriptionId>)> {
    let mut segments = path.trim_matches('/').split('/');
    if segments.next()? != "callbacks" {
        return None;
    }
    let target = CallbackTarget::parse(segments.next()?)?;
    let peer_id = ActorId::new(segments.next()?).ok()?;
    let subscription_id = segments
        .next()
        .filter(|s| !s.is_empty())
        .map(SubscriptionId::new);
    if segments.next().is_some() {
        return None;
    }
    Some((target, peer_id, subscription_id))
}

#[async_trait]
impl CallbackEndpoint for Node {
    async fn receive(&self, path: &str, secret: &str, body: &[u8]) -> u16 {
        let Some((target, peer_id, subscription_id)) = parse_callback_path(path) else {
            tracing::debug!(path, "no callback route");
            return 404;
        };
        self.handle_callback(target, &peer_id, subscription_id.as_ref(), secret, body)
            .await
            .status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_callback_path() {
        let (target, peer, sub) = parse_callback_path("/callbacks/subscriptions/bob/sub1").unwrap();
        assert_eq!(target, CallbackTarget::Subscriptions);
        assert_eq!(peer, ActorId::from("bob"));
        assert_eq!(sub, Some(SubscriptionId::new("sub1")));

        let (target, _, sub) = parse_callback_path("/callbacks/permissions/bob").unwrap();
        assert_eq!(target, CallbackTarget::Permissions);
        assert_eq!(sub, None);

        assert!(parse_callback_path("/callbacks/other/bob").is_none());
        assert!(parse_callback_path("/properties/bob").is_none());
        assert!(parse_callback_path("/callbacks/subscriptions/bob/s/extra").is_none());
        assert!(parse_callback_path("/callbacks/permissions").is_none());
    }

    #[test]
    fn test_subscription_must_match_path() {
        let path = SubscriptionId::new("sub1");
        let message = CallbackMessage::new(1, CallbackKind::Diff, json!({}))
            .for_subscription(SubscriptionId::new("sub2"));
        let err = resolve_subscription(CallbackTarget::Subscriptions, Some(&path), &message).unwrap_err();
        assert_eq!(err.status(), 400);

        let err = resolve_subscription(CallbackTarget::Subscriptions, None, &message).unwrap_err();
        assert_eq!(err.status(), 400);

        let reserved = SubscriptionId::permissions();
        let message = CallbackMessage::new(1, CallbackKind::Diff, json!({}));
        let err = resolve_subscription(CallbackTarget::Subscriptions, Some(&reserved), &message).unwrap_err();
        assert_eq!(err.status(), 400);

        let message = CallbackMessage::new(1, CallbackKind::Diff, json!({}));
        assert_eq!(
            resolve_subscription(CallbackTarget::Subscriptions, Some(&path), &message).unwrap(),
            path
        );
        assert_eq!(
            resolve_subscription(CallbackTarget::Permissions, None, &message).unwrap(),
            SubscriptionId::permissions()
        );
    }
}
