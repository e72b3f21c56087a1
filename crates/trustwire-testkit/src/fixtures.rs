//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::Arc;

use trustwire::{Node, Result, TrustwireConfig};
use trustwire_core::ActorId;
use trustwire_store::{AttributeStore, MemoryStore};
use trustwire_sync::{CallbackEndpoint, CallbackHandler, CallbackTransport, MemoryTransport};

use crate::fetcher::MemoryFetcher;

/// Base URI a fixture node named `name` listens on.
pub fn base_uri(name: &str) -> String {
    format!("https://{name}.test")
}

/// Configuration that delivers callbacks inline so tests see their effects
/// as soon as the call returns.
pub fn test_config() -> TrustwireConfig {
    TrustwireConfig {
        sync_callbacks: true,
        ..Default::default()
    }
}

/// A network of nodes sharing one in-memory transport and fetcher.
#[derive(Clone, Default)]
pub struct TestNetwork {
    pub transport: MemoryTransport,
    pub fetcher: Arc<MemoryFetcher>,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a node named `name` and attach it to the network.
    pub async fn node(&self, name: &str, config: TrustwireConfig) -> Result<Arc<Node>> {
        self.node_with_handler(name, config, None).await
    }

    /// [`TestNetwork::node`] with an application callback handler.
    pub async fn node_with_handler(
        &self,
        name: &str,
        config: TrustwireConfig,
        handler: Option<Arc<dyn CallbackHandler>>,
    ) -> Result<Arc<Node>> {
        let mut builder = Node::builder(ActorId::from(name), base_uri(name))
            .config(config)
            .store(Arc::new(MemoryStore::new()) as Arc<dyn AttributeStore>)
            .transport(Arc::new(self.transport.clone()) as Arc<dyn CallbackTransport>)
            .fetcher(self.fetcher.clone());
        if let Some(handler) = handler {
            builder = builder.handler(handler);
        }
        let node = Arc::new(builder.build().await?);

        self.transport
            .register(node.base_uri(), node.clone() as Arc<dyn CallbackEndpoint>)
            .await;
        self.fetcher.register(&node);
        Ok(node)
    }

    /// Establish an approved relationship of `trust_type` in both
    /// directions and fetch each side's grants.
    pub async fn connect(&self, a: &Node, b: &Node, trust_type: &str) -> Result<()> {
        let trust = a.create_trust(b.actor_id(), trust_type, b.base_uri()).await?;
        b.accept_trust(a.actor_id(), trust_type, a.base_uri(), &trust.secret)
            .await?;

        a.approve_trust(b.actor_id()).await?;
        b.approve_trust(a.actor_id()).await?;
        a.peer_approved(b.actor_id()).await?;
        b.peer_approved(a.actor_id()).await?;

        a.refresh_peer_permissions(b.actor_id()).await?;
        b.refresh_peer_permissions(a.actor_id()).await?;
        Ok(())
    }
}

/// Two connected nodes, `alice` and `bob`.
pub struct NodePair {
    pub network: TestNetwork,
    pub alice: Arc<Node>,
    pub bob: Arc<Node>,
}

impl NodePair {
    /// A `friend` relationship with [`test_config`] on both sides.
    pub async fn new() -> Result<Self> {
        Self::with_config(test_config(), "friend").await
    }

    pub async fn with_config(config: TrustwireConfig, trust_type: &str) -> Result<Self> {
        Self::build(config, trust_type, None).await
    }

    /// Like [`NodePair::with_config`], with `handler` installed on bob.
    pub async fn with_bob_handler(
        config: TrustwireConfig,
        trust_type: &str,
        handler: Arc<dyn CallbackHandler>,
    ) -> Result<Self> {
        Self::build(config, trust_type, Some(handler)).await
    }

    async fn build(
        config: TrustwireConfig,
        trust_type: &str,
        bob_handler: Option<Arc<dyn CallbackHandler>>,
    ) -> Result<Self> {
        let network = TestNetwork::new();
        let alice = network.node("alice", config.clone()).await?;
        let bob = network.node_with_handler("bob", config, bob_handler).await?;
        network.connect(&alice, &bob, trust_type).await?;
        Ok(Self {
            network,
            alice,
            bob,
        })
    }
}
