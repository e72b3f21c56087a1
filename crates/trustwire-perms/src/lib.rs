//! # Trustwire Permissions
//!
//! Trust relationships and the permissions that flow across them.
//!
//! ## Overview
//!
//! Two directions are tracked for every relationship:
//!
//! - **Outgoing**: what we grant a peer. A [`TrustType`](trustwire_core::TrustType)
//!   supplies defaults; a [`TrustPermissions`] override adjusts them for one
//!   peer. [`PermissionEvaluator`] answers "may this peer do X?".
//! - **Incoming**: what a peer granted us. [`PeerPermissionCache`] keeps the
//!   latest snapshot and reports grants and revocations between snapshots;
//!   [`RemoteMirror`] holds the peer data we received and can purge the
//!   parts we lost access to.
//!
//! ## Key Types
//!
//! - [`TrustTypeRegistry`] - Registered trust types, persisted per node
//! - [`TrustStore`] - Trust relationships and shared secrets
//! - [`TrustPermissionStore`] - Override CRUD, cache, peer notification
//! - [`PeerPermissionCache`] - Snapshots of peer grants with delta detection
//! - [`RemoteMirror`] - Data mirrored from peers
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trustwire_core::ActorId;
//! use trustwire_perms::{TrustPermissionStore, TrustStore, TrustTypeRegistry};
//! use trustwire_store::{AttributeStore, MemoryStore};
//!
//! async fn example() -> trustwire_perms::Result<()> {
//!     let store: Arc<dyn AttributeStore> = Arc::new(MemoryStore::new());
//!     let registry = Arc::new(TrustTypeRegistry::with_defaults(store.clone()).await?);
//!     let trusts = TrustStore::new(store.clone());
//!     let perms = TrustPermissionStore::new(store, registry);
//!
//!     let (alice, bob) = (ActorId::from("alice"), ActorId::from("bob"));
//!     let trust = trusts.create(&alice, &bob, "friend", "https://bob.example").await?;
//!     let effective = perms.effective_permissions(&alice, &bob, &trust.trust_type).await?;
//!     println!("{:?}", effective.source);
//!     Ok(())
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **No globals**: registry and stores are constructed explicitly and
//!   shared by `Arc`
//! - **Fail-safe merge**: overrides are merged in union mode, so an override
//!   can never drop an exclusion the trust type imposes
//! - **Best-effort notification**: a failed peer notification is logged and
//!   never fails the write

mod cache;
pub mod error;
pub mod evaluator;
pub mod mirror;
pub mod peer_cache;
pub mod permissions;
pub mod registry;
pub mod trust;

pub use error::{PermsError, Result};
pub use evaluator::{AccessRequest, PermissionEvaluator};
pub use mirror::{remote_bucket, RemoteMirror, OWNER_BUCKET_PREFIX, REMOTE_BUCKET_PREFIX};
pub use peer_cache::{PeerPermissionCache, PeerPermissions, PEER_PERMISSIONS_BUCKET};
pub use permissions::{
    EffectivePermissions, PermissionNotifier, PermissionSource, PermissionUpdate,
    TrustPermissionStore, TrustPermissions, TRUST_PERMISSIONS_BUCKET,
};
pub use registry::{TrustTypeRegistry, SYSTEM_ACTOR, TRUST_TYPES_BUCKET};
pub use trust::{generate_secret, TrustRelationship, TrustStore, TRUST_BUCKET};
