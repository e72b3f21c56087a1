//! Error types for the permissions module.

use thiserror::Error;

/// Errors that can occur during trust and permission operations.
#[derive(Debug, Error)]
pub enum PermsError {
    /// No trust relationship between the two actors.
    #[error("trust relationship not found: {actor_id} -> {peer_id}")]
    TrustNotFound { actor_id: String, peer_id: String },

    /// Trust exists but is not approved by both sides.
    #[error("trust relationship not approved: {actor_id} -> {peer_id}")]
    TrustNotApproved { actor_id: String, peer_id: String },

    /// The presented shared secret does not match.
    #[error("invalid secret for peer {0}")]
    InvalidSecret(String),

    /// Named trust type is not registered.
    #[error("unknown trust type: {0}")]
    UnknownTrustType(String),

    /// The trust type does not accept per-relationship overrides.
    #[error("trust type {0} does not allow permission overrides")]
    OverrideNotAllowed(String),

    /// No permission override stored for the pair.
    #[error("no permission override for {actor_id} -> {peer_id}")]
    PermissionsNotFound { actor_id: String, peer_id: String },

    /// Input failed validation.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// A concurrent writer changed the record first.
    #[error("concurrent update lost: {0}")]
    Conflict(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Storage error.
    #[error("store error: {0}")]
    Store(#[from] trustwire_store::StoreError),

    /// Core error.
    #[error("core error: {0}")]
    Core(#[from] trustwire_core::CoreError),
}

impl From<serde_json::Error> for PermsError {
    fn from(e: serde_json::Error) -> Self {
        PermsError::Serialization(e.to_string())
    }
}

/// Result type for permission operations.
pub type Result<T> = std::result::Result<T, PermsError>;
