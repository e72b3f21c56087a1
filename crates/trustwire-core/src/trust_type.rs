//! Trust types: named roles carrying default permissions.

use serde::{Deserialize, Serialize};

use crate::glob::glob_matches;
use crate::permission::{AccessDecision, CategoryRules, PermissionCategory, PermissionSet};

/// Whether an ACL rule grants or refuses access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclAccess {
    Allow,
    Deny,
}

/// A path/method rule attached to a trust type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRule {
    /// Glob over request paths.
    pub path: String,
    /// HTTP methods this rule covers. Empty means all methods.
    #[serde(default)]
    pub methods: Vec<String>,
    pub access: AclAccess,
}

/// A named role with default permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustType {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub base_permissions: PermissionSet,
    #[serde(default)]
    pub acl_rules: Vec<AclRule>,
    /// Whether per-relationship overrides may be stored for this type.
    #[serde(default = "default_true")]
    pub allow_user_override: bool,
}

fn default_true() -> bool {
    true
}

impl TrustType {
    /// Create a trust type with the given base permissions.
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        base_permissions: PermissionSet,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            description: String::new(),
            base_permissions,
            acl_rules: Vec::new(),
            allow_user_override: true,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Append an ACL rule.
    pub fn with_acl_rule(mut self, rule: AclRule) -> Self {
        self.acl_rules.push(rule);
        self
    }

    /// Evaluate ACL rules for a request. First matching rule wins.
    pub fn check_acl(&self, path: &str, method: &str) -> AccessDecision {
        self.acl_rules
            .iter()
            .find(|rule| {
                glob_matches(&rule.path, path)
                    && (rule.methods.is_empty()
                        || rule.methods.iter().any(|m| m.eq_ignore_ascii_case(method)))
            })
            .map(|rule| match rule.access {
                AclAccess::Allow => AccessDecision::Allowed,
                AclAccess::Deny => AccessDecision::Denied,
            })
            .unwrap_or(AccessDecision::Unknown)
    }
}

/// The built-in trust types every node starts with.
pub fn default_trust_types() -> Vec<TrustType> {
    let read = ["read"];
    vec![
        TrustType::new(
            "associate",
            "Associate",
            PermissionSet::new().with(
                PermissionCategory::Properties,
                CategoryRules::patterns(["public/*"], read),
            ),
        )
        .with_description("Minimal access to public data"),
        TrustType::new(
            "viewer",
            "Viewer",
            PermissionSet::new()
                .with(
                    PermissionCategory::Properties,
                    CategoryRules::patterns(["public/*", "shared/*"], read)
                        .with_excluded(["private/*", "security/*"]),
                )
                .with(
                    PermissionCategory::Methods,
                    CategoryRules::allow(["get_*", "list_*"]),
                ),
        )
        .with_description("Read-only access to shared data"),
        TrustType::new(
            "friend",
            "Friend",
            PermissionSet::new()
                .with(
                    PermissionCategory::Properties,
                    CategoryRules::patterns(["public/*", "shared/*", "profile/*"], ["read", "subscribe"])
                        .with_excluded(["private/*", "security/*"]),
                )
                .with(
                    PermissionCategory::Methods,
                    CategoryRules::allow(["get_*", "list_*", "search_*"]),
                )
                .with(PermissionCategory::Actions, CategoryRules::allow(["notify"])),
        )
        .with_description("Trusted peer with subscription access"),
        TrustType::new(
            "partner",
            "Partner",
            PermissionSet::new()
                .with(
                    PermissionCategory::Properties,
                    CategoryRules::patterns(["*"], ["read", "write", "subscribe"])
                        .with_excluded(["private/*", "security/*"]),
                )
                .with(
                    PermissionCategory::Methods,
                    CategoryRules::allow(["*"]).with_denied(["admin_*"]),
                )
                .with(
                    PermissionCategory::Actions,
                    CategoryRules::allow(["*"]).with_denied(["delete_*"]),
                ),
        )
        .with_description("Business partner with broad access"),
        TrustType::new(
            "admin",
            "Administrator",
            PermissionSet::new()
                .with(
                    PermissionCategory::Properties,
                    CategoryRules::patterns(["*"], ["read", "write", "delete", "subscribe"]),
                )
                .with(PermissionCategory::Methods, CategoryRules::allow(["*"]))
                .with(PermissionCategory::Actions, CategoryRules::allow(["*"]))
                .with(PermissionCategory::Tools, CategoryRules::allow(["*"]))
                .with(
                    PermissionCategory::Resources,
                    CategoryRules::patterns(["*"], ["read", "write"]),
                )
                .with(PermissionCategory::Prompts, CategoryRules::allow(["*"])),
        )
        .with_description("Full administrative access"),
        TrustType::new(
            "mcp_client",
            "AI Assistant",
            PermissionSet::new()
                .with(
                    PermissionCategory::Properties,
                    CategoryRules::patterns(["public/*", "memory_*"], ["read", "write"])
                        .with_excluded(["private/*", "security/*", "_*"]),
                )
                .with(
                    PermissionCategory::Tools,
                    CategoryRules::allow(["search", "fetch", "create_note"])
                        .with_denied(["delete_*", "admin_*"]),
                )
                .with(
                    PermissionCategory::Resources,
                    CategoryRules::patterns(["notes://*"], ["read"]),
                )
                .with(PermissionCategory::Prompts, CategoryRules::allow(["*"])),
        )
        .with_description("AI assistant connected over the tool protocol"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_unique() {
        let types = default_trust_types();
        let mut names: Vec<_> = types.iter().map(|t| t.name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), types.len());
    }

    #[test]
    fn test_acl_first_match_wins() {
        let tt = TrustType::new("t", "T", PermissionSet::new())
            .with_acl_rule(AclRule {
                path: "properties/private/*".into(),
                methods: vec![],
                access: AclAccess::Deny,
            })
            .with_acl_rule(AclRule {
                path: "properties/*".into(),
                methods: vec!["GET".into()],
                access: AclAccess::Allow,
            });

        assert_eq!(tt.check_acl("properties/private/x", "GET"), AccessDecision::Denied);
        assert_eq!(tt.check_acl("properties/name", "get"), AccessDecision::Allowed);
        assert_eq!(tt.check_acl("properties/name", "PUT"), AccessDecision::Unknown);
    }

    #[test]
    fn test_serde_defaults() {
        let json = serde_json::json!({
            "name": "x",
            "display_name": "X",
            "base_permissions": {}
        });
        let tt: TrustType = serde_json::from_value(json).unwrap();
        assert!(tt.allow_user_override);
        assert!(tt.acl_rules.is_empty());
    }
}
