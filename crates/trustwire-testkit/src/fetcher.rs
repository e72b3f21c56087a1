//! In-memory [`PeerFetcher`] that answers from nodes in the same process.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::Value;
use trustwire::fetch::{PeerFetcher, PermissionQuery, SubscriptionSnapshot};
use trustwire::Node;
use trustwire_core::{matches_any, SubscriptionId};
use trustwire_perms::TrustRelationship;

/// Resolves permission queries against registered nodes and serves preset
/// subscription snapshots and properties.
///
/// Nodes are held weakly so a fixture can drop them.
#[derive(Default)]
pub struct MemoryFetcher {
    nodes: RwLock<HashMap<String, Weak<Node>>>,
    snapshots: Mutex<HashMap<(String, SubscriptionId), SubscriptionSnapshot>>,
    properties: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    fail: RwLock<bool>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer permission queries addressed to `node.base_uri()`.
    pub fn register(&self, node: &Arc<Node>) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.base_uri().to_string(), Arc::downgrade(node));
    }

    /// Serve `snapshot` for `subscription_id` on the node at `base_uri`.
    pub fn set_snapshot(&self, base_uri: &str, subscription_id: &SubscriptionId, snapshot: SubscriptionSnapshot) {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((base_uri.to_string(), subscription_id.clone()), snapshot);
    }

    /// Publish a property on the node at `base_uri`.
    pub fn set_property(&self, base_uri: &str, name: &str, value: Value) {
        self.properties
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(base_uri.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }

    /// Make every fetch fail until switched back.
    pub fn set_failing(&self, fail: bool) {
        *self.fail.write().unwrap_or_else(PoisonError::into_inner) = fail;
    }

    fn check_available(&self, trust: &TrustRelationship) -> anyhow::Result<()> {
        if *self.fail.read().unwrap_or_else(PoisonError::into_inner) {
            return Err(anyhow!("{} unreachable", trust.base_uri));
        }
        Ok(())
    }

    fn node(&self, base_uri: &str) -> anyhow::Result<Arc<Node>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(base_uri)
            .and_then(Weak::upgrade)
            .ok_or_else(|| anyhow!("no node at {base_uri}"))
    }
}

#[async_trait]
impl PeerFetcher for MemoryFetcher {
    async fn fetch_permissions(&self, trust: &TrustRelationship) -> anyhow::Result<PermissionQuery> {
        self.check_available(trust)?;
        let peer = self.node(&trust.base_uri)?;
        peer.serve_permissions(&trust.actor_id, &trust.secret)
            .await
            .with_context(|| format!("GET {}/permissions/{}", trust.base_uri, trust.actor_id))
    }

    async fn fetch_subscription(
        &self,
        trust: &TrustRelationship,
        subscription_id: &SubscriptionId,
    ) -> anyhow::Result<SubscriptionSnapshot> {
        self.check_available(trust)?;
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(trust.base_uri.clone(), subscription_id.clone()))
            .cloned()
            .ok_or_else(|| anyhow!("no snapshot of {subscription_id} at {}", trust.base_uri))
    }

    async fn fetch_properties(
        &self,
        trust: &TrustRelationship,
        patterns: &[String],
    ) -> anyhow::Result<Value> {
        self.check_available(trust)?;
        let properties = self.properties.lock().unwrap_or_else(PoisonError::into_inner);
        let matching = properties
            .get(&trust.base_uri)
            .into_iter()
            .flatten()
            .filter(|(name, _)| matches_any(patterns, name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Ok(Value::Object(matching))
    }
}
