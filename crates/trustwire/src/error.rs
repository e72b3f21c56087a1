//! Error types for the node facade.

use thiserror::Error;
use trustwire_perms::PermsError;
use trustwire_store::StoreError;
use trustwire_sync::{DeliveryError, SyncError};

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration is unreadable or out of range.
    #[error("configuration error: {0}")]
    Config(String),

    /// File access failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Trust or permission error.
    #[error("permission error: {0}")]
    Perms(#[from] PermsError),

    /// Callback sequencing error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Outbound delivery error.
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Fetching authoritative state from a peer failed.
    #[error("peer fetch failed: {0:#}")]
    Fetch(anyhow::Error),

    /// The request is well-formed JSON but not acceptable.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl NodeError {
    /// HTTP status an adapter should answer with.
    pub fn status(&self) -> u16 {
        match self {
            NodeError::Perms(e) => perms_status(e),
            NodeError::Sync(SyncError::Perms(e)) => perms_status(e),
            NodeError::Sync(SyncError::InvalidMessage(_)) => 400,
            NodeError::Sync(SyncError::Delivery(e)) | NodeError::Delivery(e) => delivery_status(e),
            NodeError::InvalidRequest(_) => 400,
            NodeError::Fetch(_) => 502,
            _ => 500,
        }
    }
}

fn perms_status(e: &PermsError) -> u16 {
    match e {
        PermsError::TrustNotFound { .. } | PermsError::PermissionsNotFound { .. } => 404,
        PermsError::InvalidSecret(_) | PermsError::TrustNotApproved { .. } => 403,
        PermsError::UnknownTrustType(_) | PermsError::OverrideNotAllowed(_) | PermsError::Invalid(_) => 400,
        PermsError::Conflict(_) => 409,
        _ => 500,
    }
}

fn delivery_status(e: &DeliveryError) -> u16 {
    match e {
        DeliveryError::CircuitOpen { .. } | DeliveryError::Closed => 503,
        DeliveryError::Timeout(_) => 504,
        DeliveryError::Transport(_) | DeliveryError::Status(_) => 502,
        DeliveryError::Serialization(_) => 500,
    }
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
