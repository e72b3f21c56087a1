//! Permission data model, the fail-safe merge, and access evaluation.
//!
//! A [`PermissionSet`] holds one optional [`CategoryRules`] per
//! [`PermissionCategory`]. Pattern-based categories (properties, resources)
//! use `patterns` / `excluded_patterns` / `operations`; name-based categories
//! (methods, actions, tools, prompts) use `allowed` / `denied`. Every field is
//! optional so that a per-relationship override can name only what it
//! changes: `None` always means "inherit", never "empty".

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::glob::matches_any;

/// The categories a trust relationship can grant access to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionCategory {
    Properties,
    Methods,
    Actions,
    Tools,
    Resources,
    Prompts,
}

impl PermissionCategory {
    /// All categories in wire order.
    pub const ALL: [PermissionCategory; 6] = [
        PermissionCategory::Properties,
        PermissionCategory::Methods,
        PermissionCategory::Actions,
        PermissionCategory::Tools,
        PermissionCategory::Resources,
        PermissionCategory::Prompts,
    ];

    /// Wire name of the category.
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionCategory::Properties => "properties",
            PermissionCategory::Methods => "methods",
            PermissionCategory::Actions => "actions",
            PermissionCategory::Tools => "tools",
            PermissionCategory::Resources => "resources",
            PermissionCategory::Prompts => "prompts",
        }
    }
}

impl fmt::Display for PermissionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionCategory {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PermissionCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| CoreError::UnknownCategory(s.to_string()))
    }
}

/// Rules for one permission category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRules {
    /// Glob patterns granting access.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patterns: Option<Vec<String>>,

    /// Glob patterns that are always denied, regardless of `patterns`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_patterns: Option<Vec<String>>,

    /// Operations allowed on matching names (e.g. `read`, `write`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<String>>,

    /// Glob patterns of names that may be invoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,

    /// Glob patterns of names that may never be invoked. Deny wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied: Option<Vec<String>>,
}

impl CategoryRules {
    /// Pattern-based rules with the given operations.
    pub fn patterns<S: Into<String>>(
        patterns: impl IntoIterator<Item = S>,
        operations: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            patterns: Some(patterns.into_iter().map(Into::into).collect()),
            operations: Some(operations.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    /// Name-based allow rules.
    pub fn allow<S: Into<String>>(allowed: impl IntoIterator<Item = S>) -> Self {
        Self {
            allowed: Some(allowed.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    /// Add exclusion patterns.
    pub fn with_excluded<S: Into<String>>(mut self, excluded: impl IntoIterator<Item = S>) -> Self {
        self.excluded_patterns = Some(excluded.into_iter().map(Into::into).collect());
        self
    }

    /// Add denied names.
    pub fn with_denied<S: Into<String>>(mut self, denied: impl IntoIterator<Item = S>) -> Self {
        self.denied = Some(denied.into_iter().map(Into::into).collect());
        self
    }

    /// The `patterns` list, empty when unset.
    pub fn pattern_list(&self) -> &[String] {
        self.patterns.as_deref().unwrap_or_default()
    }

    /// Evaluate pattern-based access for `name` under `operation`.
    ///
    /// Exclusions deny independent of operation; an unlisted operation or an
    /// unmatched name is [`AccessDecision::Unknown`] so the caller can apply
    /// its own default.
    pub fn check_pattern_access(&self, name: &str, operation: &str) -> AccessDecision {
        if let Some(excluded) = &self.excluded_patterns {
            if matches_any(excluded, name) {
                return AccessDecision::Denied;
            }
        }

        let operation_listed = self
            .operations
            .as_ref()
            .map(|ops| ops.iter().any(|op| op == operation))
            .unwrap_or(false);
        if !operation_listed {
            return AccessDecision::Unknown;
        }

        if matches_any(self.pattern_list(), name) {
            AccessDecision::Allowed
        } else {
            AccessDecision::Unknown
        }
    }

    /// Evaluate name-based access. `denied` takes precedence over `allowed`.
    pub fn check_name_access(&self, name: &str) -> AccessDecision {
        if let Some(denied) = &self.denied {
            if matches_any(denied, name) {
                return AccessDecision::Denied;
            }
        }
        match &self.allowed {
            Some(allowed) if matches_any(allowed, name) => AccessDecision::Allowed,
            _ => AccessDecision::Unknown,
        }
    }
}

/// Outcome of evaluating a single access request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessDecision {
    Allowed,
    Denied,
    /// No explicit rule covers the request.
    Unknown,
}

impl AccessDecision {
    /// Resolve to a boolean, treating `Unknown` as `default`.
    pub fn or_default(self, default: bool) -> bool {
        match self {
            AccessDecision::Allowed => true,
            AccessDecision::Denied => false,
            AccessDecision::Unknown => default,
        }
    }
}

/// Permissions across all categories. `None` means "not specified here".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<CategoryRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<CategoryRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<CategoryRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<CategoryRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<CategoryRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<CategoryRules>,
}

impl PermissionSet {
    /// Create an empty permission set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the rules for a category.
    pub fn get(&self, category: PermissionCategory) -> Option<&CategoryRules> {
        match category {
            PermissionCategory::Properties => self.properties.as_ref(),
            PermissionCategory::Methods => self.methods.as_ref(),
            PermissionCategory::Actions => self.actions.as_ref(),
            PermissionCategory::Tools => self.tools.as_ref(),
            PermissionCategory::Resources => self.resources.as_ref(),
            PermissionCategory::Prompts => self.prompts.as_ref(),
        }
    }

    fn slot_mut(&mut self, category: PermissionCategory) -> &mut Option<CategoryRules> {
        match category {
            PermissionCategory::Properties => &mut self.properties,
            PermissionCategory::Methods => &mut self.methods,
            PermissionCategory::Actions => &mut self.actions,
            PermissionCategory::Tools => &mut self.tools,
            PermissionCategory::Resources => &mut self.resources,
            PermissionCategory::Prompts => &mut self.prompts,
        }
    }

    /// Set (or clear, with `None`) the rules for a category.
    pub fn set(&mut self, category: PermissionCategory, rules: Option<CategoryRules>) {
        *self.slot_mut(category) = rules;
    }

    /// Builder-style [`PermissionSet::set`].
    pub fn with(mut self, category: PermissionCategory, rules: CategoryRules) -> Self {
        self.set(category, Some(rules));
        self
    }

    /// Whether no category is specified.
    pub fn is_empty(&self) -> bool {
        PermissionCategory::ALL.iter().all(|c| self.get(*c).is_none())
    }

    /// Iterate over the specified categories.
    pub fn iter(&self) -> impl Iterator<Item = (PermissionCategory, &CategoryRules)> {
        PermissionCategory::ALL
            .into_iter()
            .filter_map(move |c| self.get(c).map(|r| (c, r)))
    }

    /// Property `patterns`, empty when unset.
    pub fn property_patterns(&self) -> &[String] {
        self.properties
            .as_ref()
            .map(CategoryRules::pattern_list)
            .unwrap_or_default()
    }

    /// Evaluate property access.
    pub fn has_property_access(&self, name: &str, operation: &str) -> AccessDecision {
        self.pattern_access(PermissionCategory::Properties, name, operation)
    }

    /// Evaluate resource access.
    pub fn has_resource_access(&self, uri: &str, operation: &str) -> AccessDecision {
        self.pattern_access(PermissionCategory::Resources, uri, operation)
    }

    /// Evaluate method access.
    pub fn has_method_access(&self, name: &str) -> AccessDecision {
        self.name_access(PermissionCategory::Methods, name)
    }

    /// Evaluate action access.
    pub fn has_action_access(&self, name: &str) -> AccessDecision {
        self.name_access(PermissionCategory::Actions, name)
    }

    /// Evaluate tool access.
    pub fn has_tool_access(&self, name: &str) -> AccessDecision {
        self.name_access(PermissionCategory::Tools, name)
    }

    /// Evaluate prompt access.
    pub fn has_prompt_access(&self, name: &str) -> AccessDecision {
        self.name_access(PermissionCategory::Prompts, name)
    }

    fn pattern_access(
        &self,
        category: PermissionCategory,
        name: &str,
        operation: &str,
    ) -> AccessDecision {
        self.get(category)
            .map(|r| r.check_pattern_access(name, operation))
            .unwrap_or(AccessDecision::Unknown)
    }

    fn name_access(&self, category: PermissionCategory, name: &str) -> AccessDecision {
        self.get(category)
            .map(|r| r.check_name_access(name))
            .unwrap_or(AccessDecision::Unknown)
    }
}

/// Merge an override onto base permissions.
///
/// With `merge_base`, `patterns` and `excluded_patterns` become the ordered,
/// de-duplicated union of base and override (base first); an empty override
/// list therefore never clears an inherited exclusion. All other fields, and
/// every field when `merge_base` is false, are replaced by the override when
/// the override sets them. Unset categories and fields inherit from base.
pub fn merge_permissions(
    base: &PermissionSet,
    overrides: &PermissionSet,
    merge_base: bool,
) -> PermissionSet {
    let mut merged = base.clone();

    for (category, over) in overrides.iter() {
        let rules = match base.get(category) {
            Some(base_rules) => merge_category(base_rules, over, merge_base),
            None => over.clone(),
        };
        merged.set(category, Some(rules));
    }

    merged
}

fn merge_category(base: &CategoryRules, over: &CategoryRules, merge_base: bool) -> CategoryRules {
    let pattern_field = |b: &Option<Vec<String>>, o: &Option<Vec<String>>| match (b, o) {
        (Some(b), Some(o)) if merge_base => Some(union_ordered(b, o)),
        (_, Some(o)) => Some(o.clone()),
        (b, None) => b.clone(),
    };
    let replace_field = |b: &Option<Vec<String>>, o: &Option<Vec<String>>| match o {
        Some(o) => Some(o.clone()),
        None => b.clone(),
    };

    CategoryRules {
        patterns: pattern_field(&base.patterns, &over.patterns),
        excluded_patterns: pattern_field(&base.excluded_patterns, &over.excluded_patterns),
        operations: replace_field(&base.operations, &over.operations),
        allowed: replace_field(&base.allowed, &over.allowed),
        denied: replace_field(&base.denied, &over.denied),
    }
}

fn union_ordered(base: &[String], over: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(base.len() + over.len());
    for item in base.iter().chain(over.iter()) {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}
