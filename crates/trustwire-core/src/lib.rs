//! # Trustwire Core
//!
//! Pure primitives for Trustwire: identifiers, the permission model, glob
//! matching, and the merge and delta algorithms.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`ActorId`] / [`SubscriptionId`] - Identifier newtypes
//! - [`PermissionSet`] - Per-category rules, `None` meaning "inherit"
//! - [`TrustType`] - A named role with default permissions
//! - [`PermissionChanges`] - Grants and revocations between two snapshots
//!
//! ## Merging
//!
//! [`merge_permissions`] applies a relationship override on top of trust
//! type defaults. With `merge_base`, pattern lists are unioned so an
//! override can never silently drop an inherited exclusion.
//!
//! ```rust
//! use trustwire_core::{merge_permissions, CategoryRules, PermissionCategory, PermissionSet};
//!
//! let base = PermissionSet::new().with(
//!     PermissionCategory::Properties,
//!     CategoryRules::patterns(["public/*"], ["read"]).with_excluded(["security/*"]),
//! );
//! let over = PermissionSet::new().with(
//!     PermissionCategory::Properties,
//!     CategoryRules::patterns(["memory_*"], ["read"]).with_excluded(Vec::<String>::new()),
//! );
//!
//! let merged = merge_permissions(&base, &over, true);
//! assert_eq!(merged.property_patterns(), ["public/*", "memory_*"]);
//! ```

pub mod delta;
pub mod error;
pub mod glob;
pub mod permission;
pub mod trust_type;
pub mod types;

pub use delta::{detect_permission_changes, PermissionChanges};
pub use error::{CoreError, Result};
pub use glob::{glob_matches, matches_any};
pub use permission::{
    merge_permissions, AccessDecision, CategoryRules, PermissionCategory, PermissionSet,
};
pub use trust_type::{default_trust_types, AclAccess, AclRule, TrustType};
pub use types::{now_millis, ActorId, SubscriptionId};
