//! Pulling authoritative state from peers.
//!
//! Callbacks are pushed; everything else (resync snapshots, the permissions
//! a peer grants us, data that just became readable) is pulled through a
//! [`PeerFetcher`].

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use trustwire_core::{ActorId, PermissionSet, SubscriptionId};
use trustwire_perms::{PermissionSource, TrustRelationship};

/// Answer to "what may this peer do?", as served to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionQuery {
    pub actor_id: ActorId,
    pub peer_id: ActorId,
    pub trust_type: String,
    pub source: PermissionSource,
    pub permissions: PermissionSet,
    /// Last permission callback sequence sent to the peer, so a resync can
    /// continue from it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

/// Full state of a subscription at a sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub sequence: u64,
    pub data: Value,
}

/// Fetches state from the peer on the other side of `trust`.
///
/// `trust.actor_id` is us; requests authenticate with `trust.secret`.
#[async_trait]
pub trait PeerFetcher: Send + Sync {
    /// The permissions the peer grants us.
    async fn fetch_permissions(&self, trust: &TrustRelationship) -> anyhow::Result<PermissionQuery>;

    /// Authoritative state of one subscription.
    async fn fetch_subscription(
        &self,
        trust: &TrustRelationship,
        subscription_id: &SubscriptionId,
    ) -> anyhow::Result<SubscriptionSnapshot>;

    /// Properties whose names match any of `patterns`, as a JSON object.
    async fn fetch_properties(
        &self,
        trust: &TrustRelationship,
        patterns: &[String],
    ) -> anyhow::Result<Value>;
}

/// HTTP fetcher backed by `reqwest`.
///
/// ```text
/// GET {base_uri}/permissions/{actor_id}
/// GET {base_uri}/subscriptions/{actor_id}/{subscription_id}
/// GET {base_uri}/properties?patterns=a,b
/// ```
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), timeout)
    }

    pub fn with_client(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        trust: &TrustRelationship,
        url: String,
        query: &[(&str, String)],
    ) -> anyhow::Result<T> {
        let response = self
            .client
            .get(&url)
            .query(query)
            .bearer_auth(&trust.secret)
            .timeout(self.timeout)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        response
            .json()
            .await
            .with_context(|| format!("decoding response from {url}"))
    }
}

#[async_trait]
impl PeerFetcher for HttpFetcher {
    async fn fetch_permissions(&self, trust: &TrustRelationship) -> anyhow::Result<PermissionQuery> {
        let url = format!("{}/permissions/{}", trust.base_uri, trust.actor_id);
        self.get(trust, url, &[]).await
    }

    async fn fetch_subscription(
        &self,
        trust: &TrustRelationship,
        subscription_id: &SubscriptionId,
    ) -> anyhow::Result<SubscriptionSnapshot> {
        let url = format!(
            "{}/subscriptions/{}/{}",
            trust.base_uri, trust.actor_id, subscription_id
        );
        self.get(trust, url, &[]).await
    }

    async fn fetch_properties(
        &self,
        trust: &TrustRelationship,
        patterns: &[String],
    ) -> anyhow::Result<Value> {
        let url = format!("{}/properties", trust.base_uri);
        self.get(trust, url, &[("patterns", patterns.join(","))]).await
    }
}
