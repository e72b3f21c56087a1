//! # Trustwire Sync
//!
//! Ordered, exactly-once application of peer callbacks and reliable
//! delivery of our own.
//!
//! ## Overview
//!
//! Callbacks travel over HTTP with at-least-once, unordered delivery. Each
//! carries a per-subscription sequence number allocated by the publisher.
//! The receiver's [`CallbackProcessor`] applies them strictly in sequence,
//! buffering early arrivals and asking for a resync when a gap does not fill
//! in time.
//!
//! ## Key Properties
//!
//! - **Exactly-once application**: a handler sees each sequence once, in
//!   increasing order, no matter how often or in what order it arrives
//! - **Bounded buffering**: at most `max_pending` early callbacks per
//!   subscription; overflow is rejected so the sender backs off
//! - **Fail-fast delivery**: a destination that keeps failing is skipped
//!   until its circuit cools down
//! - **Per-key isolation**: subscriptions never block each other
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trustwire_core::{ActorId, SubscriptionId};
//! use trustwire_store::MemoryStore;
//! use trustwire_sync::{CallbackEvent, CallbackKind, CallbackProcessor, ProcessorConfig};
//!
//! async fn example() -> trustwire_sync::Result<()> {
//!     let processor = CallbackProcessor::new(
//!         ActorId::from("alice"),
//!         Arc::new(MemoryStore::new()),
//!         ProcessorConfig::default(),
//!     );
//!     let handler = |event: CallbackEvent| async move {
//!         println!("apply {} {}", event.sequence, event.payload);
//!         Ok::<(), anyhow::Error>(())
//!     };
//!     let event = CallbackEvent {
//!         peer_id: ActorId::from("bob"),
//!         subscription_id: SubscriptionId::new("sub1"),
//!         sequence: 1,
//!         kind: CallbackKind::Diff,
//!         payload: serde_json::json!({"name": "value"}),
//!     };
//!     let result = processor.process_callback(event, &handler).await?;
//!     println!("{result:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Publisher                                   Subscriber
//!   OutboundSequencer::next  -> seq 7
//!   DeliveryManager::deliver --- POST #7 ---->  CallbackProcessor
//!                                               expected 6: buffer #7
//!   DeliveryManager::deliver --- POST #6 ---->  apply #6, flush #7
//! ```

pub mod circuit;
pub mod delivery;
pub mod error;
pub mod messages;
pub mod notifier;
pub mod outbound;
pub mod processor;
pub mod transport;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitState};
pub use delivery::{DeliveryConfig, DeliveryManager, DeliveryOutcome, OutboundCallback};
pub use error::{DeliveryError, Result, SyncError};
pub use messages::{callback_url, CallbackKind, CallbackMessage, CallbackTarget, Granularity};
pub use notifier::PeerNotifier;
pub use outbound::{OutboundSequencer, OUTBOUND_SEQUENCE_BUCKET};
pub use processor::{
    CallbackEvent, CallbackHandler, CallbackProcessor, ProcessResult, ProcessorConfig,
    SubscriptionState, CALLBACK_STATE_BUCKET,
};
pub use transport::{CallbackEndpoint, CallbackTransport, HttpTransport, MemoryTransport, SentCallback};
