//! Grant/revocation delta detection between permission snapshots.

use serde::{Deserialize, Serialize};

use crate::permission::PermissionSet;

/// What changed between two snapshots of the permissions a peer granted us.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionChanges {
    /// No previous snapshot existed.
    pub is_initial: bool,
    /// Property patterns present now but not before.
    pub granted_patterns: Vec<String>,
    /// Property patterns present before but not now.
    pub revoked_patterns: Vec<String>,
    /// Shorthand for `!revoked_patterns.is_empty()`.
    pub has_revocations: bool,
}

impl PermissionChanges {
    /// Whether anything was granted or revoked.
    pub fn is_empty(&self) -> bool {
        self.granted_patterns.is_empty() && self.revoked_patterns.is_empty()
    }
}

/// Compare property `patterns` of two snapshots.
///
/// On the initial snapshot every pattern counts as granted and nothing as
/// revoked. Output lists keep the order of the snapshot they come from.
pub fn detect_permission_changes(
    old: Option<&PermissionSet>,
    new: &PermissionSet,
) -> PermissionChanges {
    let new_patterns = new.property_patterns();

    let Some(old) = old else {
        return PermissionChanges {
            is_initial: true,
            granted_patterns: dedup(new_patterns.iter()),
            revoked_patterns: Vec::new(),
            has_revocations: false,
        };
    };

    let old_patterns = old.property_patterns();
    let granted = dedup(new_patterns.iter().filter(|p| !old_patterns.contains(*p)));
    let revoked = dedup(old_patterns.iter().filter(|p| !new_patterns.contains(*p)));

    PermissionChanges {
        is_initial: false,
        has_revocations: !revoked.is_empty(),
        granted_patterns: granted,
        revoked_patterns: revoked,
    }
}

fn dedup<'a>(items: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}
