//! # Trustwire
//!
//! The unified API for Trustwire: trust relationships between actors,
//! scoped permissions, and ordered callback delivery between peers.
//!
//! ## Overview
//!
//! A [`Node`] hosts one actor and provides:
//!
//! - **Trust**: Shared-secret relationships with peers, approved on both sides
//! - **Permissions**: Trust type defaults plus per-peer overrides, evaluated
//!   for every request a peer makes
//! - **Peer grants**: A cache of what each peer lets us do, with granted and
//!   revoked patterns detected on every change
//! - **Callbacks**: Sequenced, exactly-once application of inbound callbacks
//!   and concurrency-limited, circuit-broken delivery of outbound ones
//!
//! ## Key Concepts
//!
//! - **Trust type**: A named permission template (`friend`, `partner`, ...).
//! - **Override**: Per-peer permissions merged over the trust type.
//! - **Subscription**: A stream of sequenced data callbacks from one peer.
//! - **Resync**: Re-fetching authoritative state when a gap cannot be filled.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use trustwire::{ActorId, Node, SubscriptionId};
//!
//! async fn example() -> trustwire::Result<()> {
//!     trustwire::init_tracing("info");
//!
//!     let node = Node::builder(ActorId::from("alice"), "https://alice.example")
//!         .build()
//!         .await?;
//!
//!     let bob = ActorId::from("bob");
//!     node.create_trust(&bob, "friend", "https://bob.example").await?;
//!     node.approve_trust(&bob).await?;
//!
//!     let sub = SubscriptionId::new("profile");
//!     let (sequence, outcome) = node
//!         .publish(&bob, &sub, serde_json::json!({"status": "away"}))
//!         .await?;
//!     println!("sent #{sequence}: {outcome:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `trustwire::core` - Identifiers, permission sets and trust types
//! - `trustwire::store` - Attribute storage, in memory and SQLite
//! - `trustwire::perms` - Trust relationships and permission stores
//! - `trustwire::sync` - Callback sequencing and delivery

pub mod config;
pub mod error;
pub mod fetch;
pub mod inbound;
pub mod node;

// Re-export component crates
pub use trustwire_core as core;
pub use trustwire_perms as perms;
pub use trustwire_store as store;
pub use trustwire_sync as sync;

// Re-export main types for convenience
pub use config::TrustwireConfig;
pub use error::{NodeError, Result};
pub use fetch::{HttpFetcher, PeerFetcher, PermissionQuery, SubscriptionSnapshot};
pub use inbound::InboundResponse;
pub use node::{MaintenanceReport, Node, NodeBuilder};

// Re-export commonly used types
pub use trustwire_core::{
    AccessDecision, ActorId, CategoryRules, PermissionCategory, PermissionChanges, PermissionSet,
    SubscriptionId, TrustType,
};
pub use trustwire_perms::{AccessRequest, PermissionSource, TrustPermissions, TrustRelationship};
pub use trustwire_sync::{CallbackEvent, CallbackHandler, CallbackKind, DeliveryOutcome};

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_level`. Does nothing if a subscriber is already installed.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
