//! Access decisions for requests made by peers.
//!
//! Combines the trust relationship, the trust type defaults and any stored
//! override into one decision. A peer without an active relationship is
//! denied everything.

use std::sync::Arc;

use trustwire_core::{AccessDecision, ActorId, PermissionCategory};

use crate::error::Result;
use crate::permissions::{EffectivePermissions, TrustPermissionStore};
use crate::registry::TrustTypeRegistry;
use crate::trust::TrustStore;

/// What a peer is asking to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessRequest<'a> {
    Property { name: &'a str, operation: &'a str },
    Resource { uri: &'a str, operation: &'a str },
    Method(&'a str),
    Action(&'a str),
    Tool(&'a str),
    Prompt(&'a str),
}

impl AccessRequest<'_> {
    /// Category the request falls under.
    pub fn category(&self) -> PermissionCategory {
        match self {
            AccessRequest::Property { .. } => PermissionCategory::Properties,
            AccessRequest::Resource { .. } => PermissionCategory::Resources,
            AccessRequest::Method(_) => PermissionCategory::Methods,
            AccessRequest::Action(_) => PermissionCategory::Actions,
            AccessRequest::Tool(_) => PermissionCategory::Tools,
            AccessRequest::Prompt(_) => PermissionCategory::Prompts,
        }
    }

    fn evaluate(&self, effective: &EffectivePermissions) -> AccessDecision {
        let p = &effective.permissions;
        match *self {
            AccessRequest::Property { name, operation } => p.has_property_access(name, operation),
            AccessRequest::Resource { uri, operation } => p.has_resource_access(uri, operation),
            AccessRequest::Method(name) => p.has_method_access(name),
            AccessRequest::Action(name) => p.has_action_access(name),
            AccessRequest::Tool(name) => p.has_tool_access(name),
            AccessRequest::Prompt(name) => p.has_prompt_access(name),
        }
    }
}

/// Evaluates peer requests against effective permissions.
#[derive(Clone)]
pub struct PermissionEvaluator {
    trusts: TrustStore,
    registry: Arc<TrustTypeRegistry>,
    permissions: Arc<TrustPermissionStore>,
}

impl PermissionEvaluator {
    pub fn new(
        trusts: TrustStore,
        registry: Arc<TrustTypeRegistry>,
        permissions: Arc<TrustPermissionStore>,
    ) -> Self {
        Self {
            trusts,
            registry,
            permissions,
        }
    }

    /// Decide a request from `peer_id` against `actor_id`'s data.
    pub async fn check(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        request: AccessRequest<'_>,
    ) -> Result<AccessDecision> {
        let Some(trust) = self.trusts.get(actor_id, peer_id).await? else {
            return Ok(AccessDecision::Denied);
        };
        if !trust.is_active() {
            return Ok(AccessDecision::Denied);
        }

        let effective = self
            .permissions
            .effective_permissions(actor_id, peer_id, &trust.trust_type)
            .await?;
        let decision = request.evaluate(&effective);

        tracing::debug!(
            actor_id = %actor_id,
            peer_id = %peer_id,
            category = %request.category(),
            ?decision,
            "evaluated peer access"
        );
        Ok(decision)
    }

    /// [`PermissionEvaluator::check`] collapsed to a boolean, with
    /// `default` applied to `Unknown`.
    pub async fn is_allowed(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        request: AccessRequest<'_>,
        default: bool,
    ) -> Result<bool> {
        Ok(self.check(actor_id, peer_id, request).await?.or_default(default))
    }

    /// Evaluate the trust type's path/method ACL for a raw request.
    pub async fn check_acl(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        path: &str,
        method: &str,
    ) -> Result<AccessDecision> {
        let Some(trust) = self.trusts.get(actor_id, peer_id).await? else {
            return Ok(AccessDecision::Denied);
        };
        if !trust.is_active() {
            return Ok(AccessDecision::Denied);
        }
        Ok(self.registry.require(&trust.trust_type)?.check_acl(path, method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustwire_core::{AclAccess, AclRule, CategoryRules, PermissionSet, TrustType};
    use trustwire_store::{AttributeStore, MemoryStore};

    use crate::permissions::TrustPermissions;

    async fn setup() -> (PermissionEvaluator, TrustStore, Arc<TrustPermissionStore>) {
        let store: Arc<dyn AttributeStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(TrustTypeRegistry::with_defaults(store.clone()).await.unwrap());
        registry
            .register(
                TrustType::new("api", "API", PermissionSet::new()).with_acl_rule(AclRule {
                    path: "/admin/*".into(),
                    methods: vec![],
                    access: AclAccess::Deny,
                }),
            )
            .await
            .unwrap();
        let trusts = TrustStore::new(store.clone());
        let perms = Arc::new(TrustPermissionStore::new(store, registry.clone()));
        (
            PermissionEvaluator::new(trusts.clone(), registry, perms.clone()),
            trusts,
            perms,
        )
    }

    async fn active_trust(trusts: &TrustStore, trust_type: &str) {
        let alice = ActorId::from("alice");
        let bob = ActorId::from("bob");
        trusts.create(&alice, &bob, trust_type, "https://bob").await.unwrap();
        trusts.approve(&alice, &bob).await.unwrap();
        trusts.set_peer_approved(&alice, &bob, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_trust_is_denied() {
        let (eval, _, _) = setup().await;
        let decision = eval
            .check(
                &ActorId::from("alice"),
                &ActorId::from("bob"),
                AccessRequest::Method("get_profile"),
            )
            .await
            .unwrap();
        assert_eq!(decision, AccessDecision::Denied);
    }

    #[tokio::test]
    async fn test_unapproved_trust_is_denied() {
        let (eval, trusts, _) = setup().await;
        let alice = ActorId::from("alice");
        let bob = ActorId::from("bob");
        trusts.create(&alice, &bob, "admin", "https://bob").await.unwrap();

        let decision = eval
            .check(&alice, &bob, AccessRequest::Tool("anything"))
            .await
            .unwrap();
        assert_eq!(decision, AccessDecision::Denied);
    }

    #[tokio::test]
    async fn test_trust_type_defaults_and_override() {
        let (eval, trusts, perms) = setup().await;
        active_trust(&trusts, "viewer").await;
        let alice = ActorId::from("alice");
        let bob = ActorId::from("bob");

        let read_shared = AccessRequest::Property {
            name: "shared/doc",
            operation: "read",
        };
        assert_eq!(
            eval.check(&alice, &bob, read_shared).await.unwrap(),
            AccessDecision::Allowed
        );
        assert!(!eval
            .is_allowed(&alice, &bob, AccessRequest::Tool("search"), false)
            .await
            .unwrap());

        perms
            .store_permissions(
                TrustPermissions::new(alice.clone(), bob.clone(), "viewer")
                    .with_category(PermissionCategory::Tools, CategoryRules::allow(["search"])),
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            eval.check(&alice, &bob, AccessRequest::Tool("search")).await.unwrap(),
            AccessDecision::Allowed
        );
        assert_eq!(
            eval.check(
                &alice,
                &bob,
                AccessRequest::Property {
                    name: "private/diary",
                    operation: "read"
                }
            )
            .await
            .unwrap(),
            AccessDecision::Denied
        );
    }

    #[tokio::test]
    async fn test_acl() {
        let (eval, trusts, _) = setup().await;
        active_trust(&trusts, "api").await;
        let alice = ActorId::from("alice");
        let bob = ActorId::from("bob");

        assert_eq!(
            eval.check_acl(&alice, &bob, "/admin/users", "GET").await.unwrap(),
            AccessDecision::Denied
        );
        assert_eq!(
            eval.check_acl(&alice, &bob, "/properties", "GET").await.unwrap(),
            AccessDecision::Unknown
        );
    }
}
