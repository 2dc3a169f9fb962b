//! In-memory resource pool.
//!
//! Filters are evaluated directly against the JSON body. A search parameter
//! name maps to the camel-cased field of the same name (`general-practitioner`
//! → `generalPractitioner`), with a few aliases for the common `patient` and
//! `date` parameters. Good enough for tests and small embedded deployments.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::query::{DateBounds, FilterValue, SearchFilter, SearchQuery, Token};
use crate::traits::ResourcePool;
use crate::types::{SearchResult, StoredResource};

pub struct InMemoryPool {
    resource_type: String,
    records: RwLock<BTreeMap<String, StoredResource>>,
}

impl InMemoryPool {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            records: RwLock::new(BTreeMap::new()),
        }
    }

    /// Creates a pool pre-loaded with `resources`. Bodies without an `id` get one.
    pub fn with_resources(resource_type: impl Into<String>, resources: Vec<Value>) -> Self {
        let resource_type = resource_type.into();
        let mut records = BTreeMap::new();
        for mut resource in resources {
            let id = ensure_id(&mut resource);
            records.insert(
                id.clone(),
                StoredResource::new(id, "1", resource_type.clone(), resource),
            );
        }
        Self {
            resource_type,
            records: RwLock::new(records),
        }
    }

    /// Inserts or replaces a record as-is, including its timestamps.
    pub async fn put(&self, record: StoredResource) {
        self.records.write().await.insert(record.id.clone(), record);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn check_type(&self, resource: &Value) -> Result<(), StorageError> {
        match resource.get("resourceType").and_then(Value::as_str) {
            Some(rt) if rt == self.resource_type => Ok(()),
            Some(rt) => Err(StorageError::invalid_resource(format!(
                "Expected {} but got {}",
                self.resource_type, rt
            ))),
            None => Err(StorageError::invalid_resource("Missing resourceType")),
        }
    }
}

#[async_trait]
impl ResourcePool for InMemoryPool {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    async fn read(&self, id: &str) -> Result<Option<StoredResource>, StorageError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchResult, StorageError> {
        let records = self.records.read().await;
        let matched: Vec<StoredResource> = records
            .values()
            .filter(|record| matches_query(record, query))
            .cloned()
            .collect();

        let total = matched.len();
        let entries: Vec<StoredResource> = match query.count {
            Some(count) => matched.into_iter().take(count as usize).collect(),
            None => matched,
        };
        let has_more = entries.len() < total;

        Ok(SearchResult {
            entries,
            total: Some(total as u32),
            has_more,
        })
    }

    async fn create(&self, resource: &Value) -> Result<StoredResource, StorageError> {
        self.check_type(resource)?;
        let mut body = resource.clone();
        let id = ensure_id(&mut body);

        let mut records = self.records.write().await;
        if records.contains_key(&id) {
            return Err(StorageError::already_exists(&self.resource_type, id));
        }
        let stored = StoredResource::new(id.clone(), "1", self.resource_type.clone(), body);
        records.insert(id, stored.clone());
        Ok(stored)
    }

    async fn update(&self, resource: &Value) -> Result<StoredResource, StorageError> {
        self.check_type(resource)?;
        let id = resource
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| StorageError::invalid_resource("Update requires an id"))?
            .to_string();

        let mut records = self.records.write().await;
        let version = records
            .get(&id)
            .and_then(|r| r.version_id.parse::<u64>().ok())
            .map_or(1, |v| v + 1);
        let stored = StoredResource::new(
            id.clone(),
            version.to_string(),
            self.resource_type.clone(),
            resource.clone(),
        );
        records.insert(id, stored.clone());
        Ok(stored)
    }
}

fn ensure_id(resource: &mut Value) -> String {
    if let Some(id) = resource.get("id").and_then(Value::as_str) {
        return id.to_string();
    }
    let id = uuid::Uuid::new_v4().to_string();
    if let Some(obj) = resource.as_object_mut() {
        obj.insert("id".to_string(), Value::String(id.clone()));
    }
    id
}

fn matches_query(record: &StoredResource, query: &SearchQuery) -> bool {
    if let Some(bounds) = &query.last_updated
        && !bounds.contains(record.last_updated)
    {
        return false;
    }
    query.filters.iter().all(|filter| matches_filter(record, filter))
}

fn matches_filter(record: &StoredResource, filter: &SearchFilter) -> bool {
    if filter.param == "_id" {
        return match &filter.value {
            FilterValue::AnyReference { references } => references
                .iter()
                .any(|r| r.rsplit('/').next() == Some(record.id.as_str())),
            FilterValue::AnyToken { tokens } => tokens.iter().any(|t| t.code == record.id),
            FilterValue::Date { .. } => false,
        };
    }

    let values: Vec<&Value> = candidate_fields(&filter.param)
        .iter()
        .filter_map(|field| record.resource.get(field.as_str()))
        .collect();

    match &filter.value {
        FilterValue::AnyReference { references } => values.iter().any(|v| {
            let mut found = Vec::new();
            collect_references(v, &mut found);
            found.iter().any(|r| references.iter().any(|target| target == r))
        }),
        FilterValue::AnyToken { tokens } => values
            .iter()
            .any(|v| tokens.iter().any(|token| token_matches(v, token))),
        FilterValue::Date { bounds } => values.iter().any(|v| date_matches(v, bounds)),
    }
}

fn candidate_fields(param: &str) -> Vec<String> {
    match param {
        "patient" => vec!["patient".into(), "subject".into()],
        "date" => vec![
            "date".into(),
            "effectiveDateTime".into(),
            "effectivePeriod".into(),
            "performedDateTime".into(),
            "performedPeriod".into(),
            "period".into(),
        ],
        "onset-date" => vec!["onsetDateTime".into(), "onsetPeriod".into()],
        "abatement-date" => vec!["abatementDateTime".into(), "abatementPeriod".into()],
        "authoredon" => vec!["authoredOn".into()],
        "code" => vec!["code".into(), "medicationCodeableConcept".into()],
        _ => vec![kebab_to_camel(param)],
    }
}

fn kebab_to_camel(param: &str) -> String {
    let mut out = String::with_capacity(param.len());
    let mut upper = false;
    for ch in param.chars() {
        if ch == '-' {
            upper = true;
        } else if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

fn collect_references<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::Object(map) => {
            if let Some(reference) = map.get("reference").and_then(Value::as_str) {
                out.push(reference);
            }
            for nested in map.values() {
                collect_references(nested, out);
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_references(item, out)),
        _ => {}
    }
}

fn token_matches(value: &Value, token: &Token) -> bool {
    match value {
        Value::String(s) => token.system.is_none() && *s == token.code,
        Value::Object(map) => {
            let code_hit = map.get("code").and_then(Value::as_str) == Some(token.code.as_str());
            let system_hit = match &token.system {
                Some(system) => map.get("system").and_then(Value::as_str) == Some(system.as_str()),
                None => true,
            };
            (code_hit && system_hit) || map.values().any(|v| token_matches(v, token))
        }
        Value::Array(items) => items.iter().any(|item| token_matches(item, token)),
        _ => false,
    }
}

fn date_matches(value: &Value, bounds: &DateBounds) -> bool {
    match value {
        Value::String(s) => parse_instant(s).is_some_and(|instant| bounds.contains(instant)),
        Value::Object(map) => ["start", "end"]
            .iter()
            .filter_map(|key| map.get(*key).and_then(Value::as_str))
            .filter_map(parse_instant)
            .any(|instant| bounds.contains(instant)),
        _ => false,
    }
}

fn parse_instant(s: &str) -> Option<OffsetDateTime> {
    if let Ok(instant) = OffsetDateTime::parse(s, &Rfc3339) {
        return Some(instant);
    }
    Date::parse(s, format_description!("[year]-[month]-[day]"))
        .ok()
        .map(|date| date.midnight().assume_utc())
}
