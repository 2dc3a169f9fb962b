//! Compiled library cache
//!
//! Libraries are compiled at most once per process and shared as
//! `Arc<CompiledLibrary>`. Each library id owns a slot: reads go through an
//! [`ArcSwapOption`] without locking, while loads and replacements for the
//! same id are serialized by the slot's mutex so concurrent first requests
//! compile once.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use octofhir_storage::{
    DynPool, ResourcePool, SearchQuery, SearchResult, StorageError, StoredResource,
};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{CompilerDiagnostic, CqfError, CqfResult};

/// Translates CQL source into an ELM JSON document.
pub trait LibraryCompiler: Send + Sync {
    fn compile(&self, source: &str) -> Result<Value, Vec<CompilerDiagnostic>>;
}

/// Library id with an optional version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionedLibraryId {
    pub id: String,
    pub version: Option<String>,
}

impl VersionedLibraryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: None,
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Parses `Library/id`, `Library/id/_history/v`, a bare id, or a
    /// canonical URL `http://.../Library/id|version`.
    pub fn from_reference(reference: &str) -> Self {
        let (path, version) = match reference.split_once('|') {
            Some((path, version)) => (path, Some(version.to_string())),
            None => (reference, None),
        };
        let segments: Vec<&str> = path.trim_end_matches('/').split('/').collect();
        match segments.as_slice() {
            [.., "Library", id, "_history", v] => Self {
                id: (*id).to_string(),
                version: Some((*v).to_string()),
            },
            [.., last] => Self {
                id: (*last).to_string(),
                version,
            },
            [] => Self::new(path),
        }
    }
}

impl std::fmt::Display for VersionedLibraryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}|{}", self.id, v),
            None => write!(f, "{}", self.id),
        }
    }
}

/// An `include ... called alias` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryInclude {
    pub alias: String,
    pub path: String,
    pub version: Option<String>,
}

/// A compiled library: its ELM plus the header fields evaluation needs.
#[derive(Debug, Clone)]
pub struct CompiledLibrary {
    /// Cache key; the id of the Library resource.
    pub id: String,
    /// Name declared in the library header.
    pub name: String,
    pub version: Option<String>,
    pub includes: Vec<LibraryInclude>,
    pub statements: Vec<String>,
    pub elm: Value,
}

impl CompiledLibrary {
    pub fn from_elm(id: &str, fallback_version: Option<&str>, elm: Value) -> CqfResult<Self> {
        let Some(library) = elm.get("library").filter(|l| l.is_object()) else {
            return Err(CqfError::CompileFailure {
                library: id.to_string(),
                diagnostics: vec![CompilerDiagnostic::new(
                    "Content is not an ELM library document",
                )],
            });
        };
        let text = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).map(str::to_string);
        let defs = |pointer: &str| {
            library
                .pointer(pointer)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        };

        let identifier = library.get("identifier").cloned().unwrap_or_default();
        let includes = defs("/includes/def")
            .iter()
            .filter_map(|def| {
                Some(LibraryInclude {
                    alias: text(def, "localIdentifier")?,
                    path: text(def, "path")?,
                    version: text(def, "version"),
                })
            })
            .collect();
        let statements = defs("/statements/def")
            .iter()
            .filter_map(|def| text(def, "name"))
            .collect();

        Ok(Self {
            id: id.to_string(),
            name: text(&identifier, "id").unwrap_or_else(|| id.to_string()),
            version: text(&identifier, "version").or(fallback_version.map(str::to_string)),
            includes,
            statements,
            elm,
        })
    }

    pub fn includes_alias(&self, alias: &str) -> bool {
        self.includes.iter().any(|i| i.alias == alias)
    }

    pub fn defines(&self, statement: &str) -> bool {
        self.statements.iter().any(|s| s == statement)
    }
}

#[derive(Default)]
struct LibrarySlot {
    load: Mutex<()>,
    current: ArcSwapOption<CompiledLibrary>,
    loaded_seq: AtomicU64,
}

/// Process-wide cache of compiled libraries keyed by library id.
pub struct LibraryCache {
    slots: DashMap<String, Arc<LibrarySlot>>,
    source: DynPool,
    compiler: Arc<dyn LibraryCompiler>,
    sequence: AtomicU64,
}

impl LibraryCache {
    /// `source` is the Library pool misses are fetched from.
    pub fn new(source: DynPool, compiler: Arc<dyn LibraryCompiler>) -> Self {
        Self {
            slots: DashMap::new(),
            source,
            compiler,
            sequence: AtomicU64::new(0),
        }
    }

    /// Returns the compiled library for `id`, fetching and compiling it on
    /// first use. Repeated calls return the same instance.
    pub async fn resolve(&self, id: &VersionedLibraryId) -> CqfResult<Arc<CompiledLibrary>> {
        if id.id.is_empty() {
            return Err(CqfError::InvalidArgument(
                "Library identifier id is required".into(),
            ));
        }
        let slot = self.slot(&id.id);
        if let Some(library) = slot.current.load_full() {
            Self::check_version(&library, id)?;
            return Ok(library);
        }

        let _load = slot.load.lock().await;
        if let Some(library) = slot.current.load_full() {
            Self::check_version(&library, id)?;
            return Ok(library);
        }

        tracing::debug!(library = %id, "Compiling library from source");
        let stored = self
            .source
            .read(&id.id)
            .await?
            .ok_or_else(|| CqfError::NotFound(format!("Library/{}", id.id)))?;
        let library = Arc::new(self.compile_resource(&id.id, &stored.resource)?);
        Self::check_version(&library, id)?;
        self.install(&slot, library.clone());
        Ok(library)
    }

    /// Recompiles from a changed Library resource and replaces the cached
    /// entry. On failure the entry is evicted so the next resolve refetches.
    pub async fn update(&self, resource: &Value) -> CqfResult<Arc<CompiledLibrary>> {
        let id = resource
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CqfError::InvalidArgument("Library resource has no id".into()))?;
        let slot = self.slot(id);
        let _load = slot.load.lock().await;
        self.recompile(&slot, id, resource)
    }

    /// Runs a store write for library `id` and recompiles from what was
    /// stored, holding the id's slot lock across both steps so concurrent
    /// writes install in the order they reached the store. A write that
    /// does not compile still succeeds and evicts the entry.
    pub async fn store<F>(&self, id: Option<&str>, write: F) -> Result<StoredResource, StorageError>
    where
        F: Future<Output = Result<StoredResource, StorageError>> + Send,
    {
        let Some(id) = id.filter(|id| !id.is_empty()) else {
            // The backend assigns a fresh id, so no other writer can target it yet.
            let stored = write.await?;
            let slot = self.slot(&stored.id);
            let _load = slot.load.lock().await;
            self.refresh(&slot, &stored);
            return Ok(stored);
        };

        let slot = self.slot(id);
        let _load = slot.load.lock().await;
        let stored = write.await?;
        self.refresh(&slot, &stored);
        Ok(stored)
    }

    fn refresh(&self, slot: &LibrarySlot, stored: &StoredResource) {
        if let Err(e) = self.recompile(slot, &stored.id, &stored.resource) {
            tracing::warn!(library = %stored.id, error = %e, "Stored library does not compile");
        }
    }

    /// Caller holds the slot's load lock.
    fn recompile(
        &self,
        slot: &LibrarySlot,
        id: &str,
        resource: &Value,
    ) -> CqfResult<Arc<CompiledLibrary>> {
        match self.compile_resource(id, resource) {
            Ok(library) => {
                let library = Arc::new(library);
                self.install(slot, library.clone());
                tracing::info!(library = id, version = ?library.version, "Library cache updated");
                Ok(library)
            }
            Err(e) => {
                slot.current.store(None);
                Err(e)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<CompiledLibrary>> {
        self.slots.get(id).and_then(|slot| slot.current.load_full())
    }

    /// Every loaded library, most recently loaded first.
    pub fn libraries(&self) -> Vec<Arc<CompiledLibrary>> {
        let mut loaded: Vec<(u64, Arc<CompiledLibrary>)> = self
            .slots
            .iter()
            .filter_map(|slot| {
                slot.current
                    .load_full()
                    .map(|lib| (slot.loaded_seq.load(Ordering::Acquire), lib))
            })
            .collect();
        loaded.sort_by(|a, b| b.0.cmp(&a.0));
        loaded.into_iter().map(|(_, lib)| lib).collect()
    }

    pub fn evict(&self, id: &str) {
        if let Some(slot) = self.slots.get(id) {
            slot.current.store(None);
        }
    }

    /// Clear all cached libraries
    pub fn clear(&self) {
        self.slots.clear();
        tracing::info!("Cleared library cache");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self
                .slots
                .iter()
                .filter(|slot| slot.current.load().is_some())
                .count(),
        }
    }

    fn slot(&self, id: &str) -> Arc<LibrarySlot> {
        self.slots
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(LibrarySlot::default()))
            .value()
            .clone()
    }

    fn install(&self, slot: &LibrarySlot, library: Arc<CompiledLibrary>) {
        let seq = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        slot.current.store(Some(library));
        slot.loaded_seq.store(seq, Ordering::Release);
    }

    fn check_version(library: &CompiledLibrary, id: &VersionedLibraryId) -> CqfResult<()> {
        match (&id.version, &library.version) {
            (Some(requested), Some(loaded)) if requested != loaded => {
                Err(CqfError::VersionConflict {
                    id: id.id.clone(),
                    requested: requested.clone(),
                    loaded: loaded.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Compiles the first usable attachment: ELM JSON is taken as is, CQL
    /// source goes through the compiler.
    fn compile_resource(&self, id: &str, resource: &Value) -> CqfResult<CompiledLibrary> {
        let version = resource.get("version").and_then(Value::as_str);
        let attachments = resource
            .get("content")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for attachment in attachments {
            let Some(data) = attachment.get("data").and_then(Value::as_str) else {
                continue;
            };
            match attachment.get("contentType").and_then(Value::as_str) {
                Some("application/elm+json") => {
                    let elm = serde_json::from_slice(&decode_attachment(id, data)?)?;
                    return CompiledLibrary::from_elm(id, version, elm);
                }
                Some("text/cql") => {
                    let source = String::from_utf8(decode_attachment(id, data)?).map_err(|e| {
                        CqfError::InvalidArgument(format!(
                            "Library {id} CQL content is not UTF-8: {e}"
                        ))
                    })?;
                    let elm = self.compiler.compile(&source).map_err(|diagnostics| {
                        CqfError::CompileFailure {
                            library: id.to_string(),
                            diagnostics,
                        }
                    })?;
                    return CompiledLibrary::from_elm(id, version, elm);
                }
                _ => continue,
            }
        }

        Err(CqfError::NotFound(format!(
            "Library {id} has no ELM or CQL content"
        )))
    }
}

fn decode_attachment(id: &str, data: &str) -> CqfResult<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| CqfError::InvalidArgument(format!("Library {id} content is not base64: {e}")))
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub size: usize,
}

/// Library pool that keeps the compiled cache in step with writes.
///
/// Every create or update of a Library resource recompiles it. A write that
/// does not compile still succeeds; the stale cache entry is dropped.
pub struct LibraryWriteThrough {
    inner: DynPool,
    cache: Arc<LibraryCache>,
}

impl LibraryWriteThrough {
    pub fn new(inner: DynPool, cache: Arc<LibraryCache>) -> Self {
        Self { inner, cache }
    }
}

fn resource_id(resource: &Value) -> Option<&str> {
    resource.get("id").and_then(Value::as_str)
}

#[async_trait]
impl ResourcePool for LibraryWriteThrough {
    fn resource_type(&self) -> &str {
        self.inner.resource_type()
    }

    async fn read(&self, id: &str) -> Result<Option<StoredResource>, StorageError> {
        self.inner.read(id).await
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchResult, StorageError> {
        self.inner.search(query).await
    }

    async fn create(&self, resource: &Value) -> Result<StoredResource, StorageError> {
        self.cache
            .store(resource_id(resource), self.inner.create(resource))
            .await
    }

    async fn update(&self, resource: &Value) -> Result<StoredResource, StorageError> {
        self.cache
            .store(resource_id(resource), self.inner.update(resource))
            .await
    }
}
