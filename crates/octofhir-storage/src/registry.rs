//! Static type-name to pool mapping.
//!
//! The registry is assembled once at startup and is immutable afterwards.
//! Lookups are case-insensitive on the type name. When a priority tier is
//! configured it is consulted before the default tier, which is how a server
//! that serves two model releases side by side prefers one set of handlers.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StorageError;
use crate::traits::{DynPool, ResourcePool};

/// Immutable registry of resource pools.
#[derive(Clone, Default)]
pub struct PoolRegistry {
    priority: HashMap<String, DynPool>,
    default: HashMap<String, DynPool>,
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("priority", &self.priority.keys().collect::<Vec<_>>())
            .field("default", &self.default.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PoolRegistry {
    pub fn builder() -> PoolRegistryBuilder {
        PoolRegistryBuilder::default()
    }

    /// Resolves the pool for `data_type`, priority tier first.
    pub fn resolve(&self, data_type: &str) -> Option<DynPool> {
        let key = data_type.to_ascii_lowercase();
        self.priority
            .get(&key)
            .or_else(|| self.default.get(&key))
            .cloned()
    }

    /// Like [`resolve`](Self::resolve) but fails with `UnknownResourceType`.
    pub fn require(&self, data_type: &str) -> Result<DynPool, StorageError> {
        self.resolve(data_type)
            .ok_or_else(|| StorageError::unknown_resource_type(data_type))
    }

    /// Canonical type names served by either tier, sorted.
    pub fn resource_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .priority
            .values()
            .chain(self.default.values())
            .map(|pool| pool.resource_type().to_string())
            .collect();
        types.sort();
        types.dedup();
        types
    }
}

/// Builder for [`PoolRegistry`]. The first registration for a type in a tier wins.
#[derive(Default)]
pub struct PoolRegistryBuilder {
    priority: HashMap<String, DynPool>,
    default: HashMap<String, DynPool>,
}

impl PoolRegistryBuilder {
    #[must_use]
    pub fn pool(mut self, pool: DynPool) -> Self {
        Self::insert(&mut self.default, pool);
        self
    }

    #[must_use]
    pub fn priority_pool(mut self, pool: DynPool) -> Self {
        Self::insert(&mut self.priority, pool);
        self
    }

    /// Registers a concrete pool in the default tier.
    #[must_use]
    pub fn with<P: ResourcePool + 'static>(self, pool: P) -> Self {
        self.pool(Arc::new(pool))
    }

    pub fn build(self) -> PoolRegistry {
        tracing::debug!(
            priority = self.priority.len(),
            default = self.default.len(),
            "Built resource pool registry"
        );
        PoolRegistry {
            priority: self.priority,
            default: self.default,
        }
    }

    fn insert(tier: &mut HashMap<String, DynPool>, pool: DynPool) {
        let key = pool.resource_type().to_ascii_lowercase();
        tier.entry(key).or_insert(pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryPool;

    #[test]
    fn test_resolve_is_case_insensitive() {
        let registry = PoolRegistry::builder()
            .with(InMemoryPool::new("Observation"))
            .build();

        assert!(registry.resolve("observation").is_some());
        assert!(registry.resolve("OBSERVATION").is_some());
        assert!(registry.resolve("Observations").is_none());
    }

    #[test]
    fn test_priority_tier_wins() {
        let preferred: DynPool = Arc::new(InMemoryPool::new("Patient"));
        let fallback: DynPool = Arc::new(InMemoryPool::new("Patient"));
        let registry = PoolRegistry::builder()
            .pool(fallback.clone())
            .priority_pool(preferred.clone())
            .with(InMemoryPool::new("Condition"))
            .build();

        let resolved = registry.resolve("patient").unwrap();
        assert!(Arc::ptr_eq(&resolved, &preferred));
        assert!(registry.resolve("condition").is_some());
        assert_eq!(registry.resource_types(), vec!["Condition", "Patient"]);
    }

    #[test]
    fn test_require_unknown_type() {
        let registry = PoolRegistry::builder().build();
        let err = registry.require("Widget").err().unwrap();
        assert!(err.is_not_found());
    }
}
