//! # Trustwire Store
//!
//! Keyed attribute storage for Trustwire. Provides a trait-based interface
//! with SQLite and in-memory implementations.
//!
//! ## Overview
//!
//! Every piece of Trustwire state is a JSON value addressed by
//! `(actor_id, bucket, name)`. The [`AttributeStore`] trait keeps the rest
//! of the system storage-agnostic; [`SqliteStore`] persists to disk and
//! [`MemoryStore`] backs tests.
//!
//! ## Key Types
//!
//! - [`AttributeStore`] - The async trait for all storage operations
//! - [`StoreExt`] - Typed get/set and CAS-backed counters
//! - [`AttrKey`] - Address of a single attribute
//! - [`SweepReport`] - What an expiry sweep removed
//!
//! ## Usage
//!
//! ```rust,no_run
//! use trustwire_store::{AttrKey, AttributeStore, SqliteStore, StoreExt};
//!
//! async fn example() -> trustwire_store::Result<()> {
//!     let store = SqliteStore::open("trustwire.db")?;
//!     let key = AttrKey::new("alice", "_outbound_sequence", "bob:sub1");
//!
//!     let next = store.increment_counter(&key).await?;
//!     assert!(next >= 1);
//!     Ok(())
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **TTL**: every expiry gets a clock-skew buffer of
//!   [`TTL_CLOCK_SKEW_BUFFER`] added on top
//! - **CAS**: `conditional_update_attr` compares structurally, never by
//!   object key order
//! - **Sweeps**: orphaned index entries are removed, malformed ones are
//!   counted and skipped

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
    canonical_json, AttrKey, AttributeStore, StoreExt, SweepReport, MAX_CAS_ATTEMPTS,
    TTL_CLOCK_SKEW_BUFFER,
};
