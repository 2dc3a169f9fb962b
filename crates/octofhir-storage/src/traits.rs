//! The typed resource pool capability.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageError;
use crate::query::SearchQuery;
use crate::types::{SearchResult, StoredResource};

/// A pool of records of a single resource type.
///
/// Every backend exposes one pool per type it serves. Implementations must be
/// thread-safe (`Send + Sync`); the services call them concurrently from
/// independent requests.
///
/// # Example
///
/// ```ignore
/// use octofhir_storage::{ResourcePool, StorageError, StoredResource};
///
/// async fn get_measure(pool: &dyn ResourcePool, id: &str) -> Result<StoredResource, StorageError> {
///     pool.read(id)
///         .await?
///         .ok_or_else(|| StorageError::not_found(pool.resource_type(), id))
/// }
/// ```
#[async_trait]
pub trait ResourcePool: Send + Sync {
    /// The resource type served by this pool, in canonical casing.
    fn resource_type(&self) -> &str;

    /// Reads a record by ID. Returns `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues, not for missing records.
    async fn read(&self, id: &str) -> Result<Option<StoredResource>, StorageError>;

    /// Executes a query descriptor against this pool.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidResource` for filters the backend cannot
    /// express, or an infrastructure error.
    async fn search(&self, query: &SearchQuery) -> Result<SearchResult, StorageError>;

    /// Creates a new record. A missing `id` is generated by the backend.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::AlreadyExists` if the ID is taken and
    /// `StorageError::InvalidResource` if the body is of another type.
    async fn create(&self, resource: &Value) -> Result<StoredResource, StorageError>;

    /// Replaces a record, creating it when absent.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidResource` if the body has no `id` or is of
    /// another type.
    async fn update(&self, resource: &Value) -> Result<StoredResource, StorageError>;
}

/// Shared handle to a pool.
pub type DynPool = Arc<dyn ResourcePool>;

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time check that ResourcePool is object-safe
    fn _assert_pool_object_safe(_: &dyn ResourcePool) {}
}
