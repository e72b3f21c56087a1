//! Trust type registry.
//!
//! Trust types are persisted under the system actor so every node process
//! sharing a store sees the same roles. Reads go through an in-memory copy.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use trustwire_core::{default_trust_types, TrustType};
use trustwire_store::{AttrKey, AttributeStore, StoreExt};

use crate::error::{PermsError, Result};

/// Actor id that owns node-wide configuration.
pub const SYSTEM_ACTOR: &str = "_system";

/// Bucket holding trust type definitions.
pub const TRUST_TYPES_BUCKET: &str = "trust_types";

/// Registry of trust types, backed by the attribute store.
pub struct TrustTypeRegistry {
    store: Arc<dyn AttributeStore>,
    types: RwLock<BTreeMap<String, TrustType>>,
}

impl TrustTypeRegistry {
    /// Load whatever is already persisted.
    pub async fn load(store: Arc<dyn AttributeStore>) -> Result<Self> {
        let mut types = BTreeMap::new();
        for (name, value) in store.list_bucket(SYSTEM_ACTOR, TRUST_TYPES_BUCKET).await? {
            match serde_json::from_value::<TrustType>(value) {
                Ok(tt) => {
                    types.insert(name, tt);
                }
                Err(e) => {
                    tracing::warn!(trust_type = %name, error = %e, "skipping unreadable trust type");
                }
            }
        }

        Ok(Self {
            store,
            types: RwLock::new(types),
        })
    }

    /// Load persisted types and register the built-in ones that are missing.
    /// Existing definitions are left untouched.
    pub async fn with_defaults(store: Arc<dyn AttributeStore>) -> Result<Self> {
        let registry = Self::load(store).await?;
        for tt in default_trust_types() {
            if registry.get(&tt.name).is_none() {
                registry.register(tt).await?;
            }
        }
        Ok(registry)
    }

    /// Register or replace a trust type.
    pub async fn register(&self, trust_type: TrustType) -> Result<()> {
        if trust_type.name.is_empty() {
            return Err(PermsError::Invalid("trust type name is empty".into()));
        }

        let key = AttrKey::new(SYSTEM_ACTOR, TRUST_TYPES_BUCKET, &trust_type.name);
        self.store.set_typed(&key, &trust_type).await?;

        tracing::debug!(trust_type = %trust_type.name, "registered trust type");
        self.types
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(trust_type.name.clone(), trust_type);
        Ok(())
    }

    /// Look up a trust type by name.
    pub fn get(&self, name: &str) -> Option<TrustType> {
        self.types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Look up a trust type, failing if unknown.
    pub fn require(&self, name: &str) -> Result<TrustType> {
        self.get(name)
            .ok_or_else(|| PermsError::UnknownTrustType(name.to_string()))
    }

    /// All registered trust types, ordered by name.
    pub fn list(&self) -> Vec<TrustType> {
        self.types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
