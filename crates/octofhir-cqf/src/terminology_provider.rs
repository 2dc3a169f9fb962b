//! Terminology access for retrieves and expression evaluation
//!
//! [`TerminologyProvider`] answers three questions: which codes a value set
//! expands to, whether a code belongs to a value set, and what a code system
//! says about a code. [`StoreTerminologyProvider`] answers them from the
//! server's own ValueSet and CodeSystem pools; the remote provider asks an
//! external terminology server. [`CachingTerminologyProvider`] sits in front
//! of either for the duration of one evaluation run.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use octofhir_storage::{PoolRegistry, SearchQuery, Token};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::CqfResult;

/// A coded value: `system|code` plus optional display and system version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Code {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Code {
    pub fn new(system: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            code: code.into(),
            display: None,
            version: None,
        }
    }

    #[must_use]
    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    /// Exact system and code match. Codes without a system never match.
    pub fn same_concept(&self, other: &Code) -> bool {
        self.system.is_some() && self.system == other.system && self.code == other.code
    }

    pub fn to_token(&self) -> Token {
        Token {
            system: self.system.clone(),
            code: self.code.clone(),
        }
    }

    fn from_json(value: &Value, default_system: Option<&str>) -> Option<Self> {
        let code = value.get("code").and_then(Value::as_str)?;
        Some(Self {
            system: value
                .get("system")
                .and_then(Value::as_str)
                .or(default_system)
                .map(str::to_string),
            code: code.to_string(),
            display: value
                .get("display")
                .and_then(Value::as_str)
                .map(str::to_string),
            version: value
                .get("version")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

#[async_trait]
pub trait TerminologyProvider: Send + Sync {
    /// Codes of the value set. An unknown value set expands to nothing.
    async fn expand(&self, value_set: &str) -> CqfResult<Vec<Code>>;

    async fn in_value_set(&self, code: &Code, value_set: &str) -> CqfResult<bool> {
        Ok(self
            .expand(value_set)
            .await?
            .iter()
            .any(|member| member.same_concept(code)))
    }

    /// Returns `code` enriched with the code system's display, or unchanged
    /// when the code system or concept is unknown.
    async fn lookup(&self, code: &Code, code_system: &str) -> CqfResult<Code>;
}

/// Extracts the member codes of a ValueSet resource.
///
/// The expansion wins when present and non-empty; otherwise the concepts
/// enumerated in `compose.include` are used. Filter-based includes are not
/// evaluated.
pub fn codes_from_value_set(value_set: &Value) -> Vec<Code> {
    let mut codes = Vec::new();
    if let Some(contains) = value_set
        .pointer("/expansion/contains")
        .and_then(Value::as_array)
    {
        collect_expansion(contains, &mut codes);
    }
    if !codes.is_empty() {
        return codes;
    }

    let includes = value_set
        .pointer("/compose/include")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for include in includes {
        let system = include.get("system").and_then(Value::as_str);
        let concepts = include
            .get("concept")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        codes.extend(concepts.iter().filter_map(|c| Code::from_json(c, system)));
    }
    codes
}

fn collect_expansion(contains: &[Value], out: &mut Vec<Code>) {
    for entry in contains {
        if let Some(code) = Code::from_json(entry, None) {
            out.push(code);
        }
        if let Some(nested) = entry.get("contains").and_then(Value::as_array) {
            collect_expansion(nested, out);
        }
    }
}

fn find_concept<'a>(concepts: &'a [Value], code: &str) -> Option<&'a Value> {
    concepts.iter().find_map(|concept| {
        if concept.get("code").and_then(Value::as_str) == Some(code) {
            return Some(concept);
        }
        concept
            .get("concept")
            .and_then(Value::as_array)
            .and_then(|nested| find_concept(nested, code))
    })
}

/// Terminology backed by the ValueSet and CodeSystem pools.
pub struct StoreTerminologyProvider {
    pools: Arc<PoolRegistry>,
}

impl StoreTerminologyProvider {
    pub fn new(pools: Arc<PoolRegistry>) -> Self {
        Self { pools }
    }

    /// Finds a terminology resource by canonical URL (`url|version` allowed)
    /// or by logical id.
    async fn find(&self, resource_type: &str, reference: &str) -> CqfResult<Option<Value>> {
        let Some(pool) = self.pools.resolve(resource_type) else {
            tracing::warn!(resource_type, "No pool registered for terminology lookups");
            return Ok(None);
        };

        if Url::parse(reference).is_err() {
            return Ok(pool.read(reference).await?.map(|r| r.resource));
        }

        let (url, version) = match reference.split_once('|') {
            Some((url, version)) => (url, Some(version)),
            None => (reference, None),
        };
        let query = SearchQuery::new().with_tokens("url", vec![Token::code_only(url)]);
        let found = pool
            .search(&query)
            .await?
            .into_resources()
            .into_iter()
            .find(|resource| {
                version.is_none_or(|v| resource.get("version").and_then(Value::as_str) == Some(v))
            });
        Ok(found)
    }
}

#[async_trait]
impl TerminologyProvider for StoreTerminologyProvider {
    async fn expand(&self, value_set: &str) -> CqfResult<Vec<Code>> {
        match self.find("ValueSet", value_set).await? {
            Some(resource) => Ok(codes_from_value_set(&resource)),
            None => {
                tracing::debug!(value_set, "Value set not found, expanding to nothing");
                Ok(Vec::new())
            }
        }
    }

    async fn lookup(&self, code: &Code, code_system: &str) -> CqfResult<Code> {
        let Some(resource) = self.find("CodeSystem", code_system).await? else {
            return Ok(code.clone());
        };
        let concepts = resource
            .get("concept")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let Some(concept) = find_concept(concepts, &code.code) else {
            return Ok(code.clone());
        };

        Ok(Code {
            system: resource
                .get("url")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| Some(code_system.to_string())),
            code: code.code.clone(),
            display: concept
                .get("display")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| code.display.clone()),
            version: resource
                .get("version")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// Per-run expansion cache.
///
/// Holds at most `capacity` expansions; once full, further expansions are
/// passed through without being stored. Dropped with the run that owns it.
pub struct CachingTerminologyProvider {
    inner: Arc<dyn TerminologyProvider>,
    expansions: DashMap<String, Arc<Vec<Code>>>,
    capacity: usize,
}

impl CachingTerminologyProvider {
    pub fn new(inner: Arc<dyn TerminologyProvider>, capacity: usize) -> Self {
        Self {
            inner,
            expansions: DashMap::new(),
            capacity,
        }
    }

    pub fn cached_expansions(&self) -> usize {
        self.expansions.len()
    }
}

#[async_trait]
impl TerminologyProvider for CachingTerminologyProvider {
    async fn expand(&self, value_set: &str) -> CqfResult<Vec<Code>> {
        if let Some(hit) = self.expansions.get(value_set) {
            return Ok(Vec::clone(&hit));
        }
        let codes = self.inner.expand(value_set).await?;
        if self.expansions.len() < self.capacity {
            self.expansions
                .insert(value_set.to_string(), Arc::new(codes.clone()));
        }
        Ok(codes)
    }

    async fn lookup(&self, code: &Code, code_system: &str) -> CqfResult<Code> {
        self.inner.lookup(code, code_system).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use octofhir_storage::InMemoryPool;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> Arc<PoolRegistry> {
        let value_sets = InMemoryPool::with_resources(
            "ValueSet",
            vec![
                json!({
                    "resourceType": "ValueSet",
                    "id": "diabetes",
                    "url": "http://example.org/ValueSet/diabetes",
                    "version": "1.0",
                    "expansion": {"contains": [
                        {"system": "http://snomed.info/sct", "code": "44054006", "display": "Type 2 diabetes"},
                        {"code": "no-system"},
                        {"system": "http://snomed.info/sct", "code": "46635009",
                         "contains": [{"system": "http://snomed.info/sct", "code": "190330002"}]}
                    ]}
                }),
                json!({
                    "resourceType": "ValueSet",
                    "id": "composed",
                    "compose": {"include": [{
                        "system": "http://loinc.org",
                        "concept": [{"code": "4548-4"}, {"code": "17856-6"}]
                    }]}
                }),
            ],
        );
        let code_systems = InMemoryPool::with_resources(
            "CodeSystem",
            vec![json!({
                "resourceType": "CodeSystem",
                "id": "local",
                "url": "http://example.org/CodeSystem/local",
                "concept": [{
                    "code": "parent",
                    "display": "Parent",
                    "concept": [{"code": "child", "display": "Child concept"}]
                }]
            })],
        );
        Arc::new(
            PoolRegistry::builder()
                .with(value_sets)
                .with(code_systems)
                .build(),
        )
    }

    #[tokio::test]
    async fn test_expand_by_url_and_id() {
        let provider = StoreTerminologyProvider::new(registry());

        let by_url = provider
            .expand("http://example.org/ValueSet/diabetes")
            .await
            .unwrap();
        assert_eq!(by_url.len(), 4);
        assert_eq!(by_url[0].display.as_deref(), Some("Type 2 diabetes"));

        let by_version = provider
            .expand("http://example.org/ValueSet/diabetes|2.0")
            .await
            .unwrap();
        assert!(by_version.is_empty());

        let composed = provider.expand("composed").await.unwrap();
        assert_eq!(composed.len(), 2);
        assert_eq!(composed[0].system.as_deref(), Some("http://loinc.org"));
    }

    #[tokio::test]
    async fn test_unknown_value_set_is_empty() {
        let provider = StoreTerminologyProvider::new(registry());
        assert!(provider.expand("missing").await.unwrap().is_empty());

        let no_pools = StoreTerminologyProvider::new(Arc::new(PoolRegistry::builder().build()));
        assert!(no_pools.expand("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_value_set_requires_exact_match() {
        let provider = StoreTerminologyProvider::new(registry());
        let vs = "diabetes";

        assert!(
            provider
                .in_value_set(&Code::new("http://snomed.info/sct", "44054006"), vs)
                .await
                .unwrap()
        );
        assert!(
            !provider
                .in_value_set(&Code::new("http://other", "44054006"), vs)
                .await
                .unwrap()
        );
        let systemless = Code {
            system: None,
            code: "no-system".into(),
            display: None,
            version: None,
        };
        assert!(!provider.in_value_set(&systemless, vs).await.unwrap());
    }

    #[tokio::test]
    async fn test_lookup_nested_concept() {
        let provider = StoreTerminologyProvider::new(registry());
        let code = Code::new("http://example.org/CodeSystem/local", "child");

        let found = provider.lookup(&code, "local").await.unwrap();
        assert_eq!(found.display.as_deref(), Some("Child concept"));

        let unknown = Code::new("http://example.org/CodeSystem/local", "nope");
        assert_eq!(provider.lookup(&unknown, "local").await.unwrap(), unknown);
    }

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TerminologyProvider for CountingProvider {
        async fn expand(&self, value_set: &str) -> CqfResult<Vec<Code>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Code::new("http://example.org", value_set)])
        }

        async fn lookup(&self, code: &Code, _code_system: &str) -> CqfResult<Code> {
            Ok(code.clone())
        }
    }

    #[tokio::test]
    async fn test_caching_provider_respects_capacity() {
        let inner = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let cache = CachingTerminologyProvider::new(inner.clone(), 1);

        cache.expand("a").await.unwrap();
        cache.expand("a").await.unwrap();
        assert!(
            cache
                .in_value_set(&Code::new("http://example.org", "a"), "a")
                .await
                .unwrap()
        );
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        cache.expand("b").await.unwrap();
        cache.expand("b").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.cached_expansions(), 1);
    }
}
