//! # Trustwire Testkit
//!
//! Testing utilities for Trustwire.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: Connected nodes on an in-memory network
//! - **Fetcher**: A [`PeerFetcher`](trustwire::PeerFetcher) answered by
//!   nodes in the same process
//! - **Generators**: Proptest strategies for property-based testing
//!
//! ## Test Fixtures
//!
//! Quickly set up two peers with an approved `friend` relationship:
//!
//! ```rust,no_run
//! use trustwire::SubscriptionId;
//! use trustwire_testkit::NodePair;
//!
//! async fn example() -> trustwire::Result<()> {
//!     let pair = NodePair::new().await?;
//!     let sub = SubscriptionId::new("profile");
//!     pair.alice
//!         .publish(pair.bob.actor_id(), &sub, serde_json::json!({"public/name": "Alice"}))
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use trustwire_testkit::generators::sequence_permutation;
//!
//! proptest! {
//!     #[test]
//!     fn applies_in_order(order in sequence_permutation(1, 10)) {
//!         // deliver `order`, expect 1..=10 applied
//!     }
//! }
//! ```

pub mod fetcher;
pub mod fixtures;
pub mod generators;

pub use fetcher::MemoryFetcher;
pub use fixtures::{base_uri, test_config, NodePair, TestNetwork};
pub use generators::{permission_set, sequence_permutation};
