//! Error types for the sync module.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while processing inbound callbacks.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Message failed validation.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The application handler rejected a callback. Sequencing state is
    /// left unchanged.
    #[error("callback handler failed: {0:#}")]
    Handler(anyhow::Error),

    /// Another writer changed the subscription state between our read and
    /// our compare-and-swap.
    #[error("sequencing state changed concurrently for {peer_id}:{subscription_id}")]
    StateConflict {
        peer_id: String,
        subscription_id: String,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Outbound delivery failed.
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] trustwire_store::StoreError),

    /// Trust or permission operation failed.
    #[error("permission error: {0}")]
    Perms(#[from] trustwire_perms::PermsError),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// Errors from a single outbound delivery attempt.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The destination's circuit is open; no request was made.
    #[error("circuit open for {destination}, retry in {retry_after:?}")]
    CircuitOpen {
        destination: String,
        retry_after: Duration,
    },

    /// The request did not complete within the per-call timeout.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Connection-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer answered with a failure status.
    #[error("peer responded with status {0}")]
    Status(u16),

    /// The message could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The delivery manager is shutting down.
    #[error("delivery manager closed")]
    Closed,
}

impl DeliveryError {
    /// Whether this attempt counts against the destination's circuit.
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            DeliveryError::Timeout(_) | DeliveryError::Transport(_) | DeliveryError::Status(_)
        )
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
