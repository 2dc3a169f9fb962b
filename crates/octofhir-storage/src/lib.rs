//! # octofhir-storage
//!
//! Record-store boundary for the OctoFHIR clinical quality services.
//!
//! This crate defines what the measure evaluator and bulk exporter need from a
//! persistence layer, and nothing more:
//! - [`ResourcePool`]: one typed pool per resource type with read, search,
//!   create and update
//! - [`SearchQuery`]: a backend-agnostic filter set (token, reference and date
//!   filters plus a last-updated window and a row cap)
//! - [`PoolRegistry`]: a static mapping from type name to pool, built once at
//!   startup
//!
//! [`InMemoryPool`] is a small reference backend used by tests and embedders.
//!
//! ## Example
//!
//! ```ignore
//! use octofhir_storage::{PoolRegistry, SearchQuery, Token};
//!
//! async fn diabetics(registry: &PoolRegistry) -> Result<usize, StorageError> {
//!     let pool = registry.require("Condition")?;
//!     let query = SearchQuery::new()
//!         .with_tokens("code", vec![Token::new("http://snomed.info/sct", "44054006")])
//!         .with_count(100);
//!     Ok(pool.search(&query).await?.len())
//! }
//! ```

mod error;
pub mod memory;
pub mod query;
mod registry;
mod traits;
mod types;

pub use error::{ErrorCategory, StorageError};
pub use memory::InMemoryPool;
pub use query::{DateBounds, FilterValue, SearchFilter, SearchQuery, Token};
pub use registry::{PoolRegistry, PoolRegistryBuilder};
pub use traits::{DynPool, ResourcePool};
pub use types::{SearchResult, StoredResource};

/// Type alias for a storage result.
pub type StorageResult<T> = Result<T, StorageError>;
