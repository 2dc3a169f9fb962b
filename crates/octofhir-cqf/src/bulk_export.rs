//! Bulk data export
//!
//! Patient-level and group-level `$export`. Requests are checked against the
//! async bulk data preconditions first; a failed precondition or a missing or
//! empty group is reported as a rejected outcome rather than an error. The
//! matching records are collected per resource type.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use octofhir_storage::{DateBounds, PoolRegistry, SearchQuery};
use serde_json::{Value, json};
use time::OffsetDateTime;

use crate::compartment;
use crate::config::BulkExportConfig;
use crate::date::{Boundary, DateBoundaryResolver};
use crate::error::CqfResult;

pub const FHIR_JSON: &str = "application/fhir+json";
pub const RESPOND_ASYNC: &str = "respond-async";
const NDJSON_FORMATS: [&str; 3] = ["application/fhir+ndjson", "application/ndjson", "ndjson"];

/// Headers and parameters of an `$export` request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkExportRequest {
    pub accept: Option<String>,
    pub prefer: Option<String>,
    pub output_format: Option<String>,
    pub since: Option<String>,
    pub types: Option<Vec<String>>,
}

impl BulkExportRequest {
    /// A request carrying the mandatory `Accept` and `Prefer` values.
    pub fn async_fhir_json() -> Self {
        Self {
            accept: Some(FHIR_JSON.into()),
            prefer: Some(RESPOND_ASYNC.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
        self.accept = Some(accept.into());
        self
    }

    #[must_use]
    pub fn with_prefer(mut self, prefer: impl Into<String>) -> Self {
        self.prefer = Some(prefer.into());
        self
    }

    #[must_use]
    pub fn with_output_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = Some(format.into());
        self
    }

    #[must_use]
    pub fn with_since(mut self, since: impl Into<String>) -> Self {
        self.since = Some(since.into());
        self
    }

    /// Parses a comma-separated `_type` value.
    #[must_use]
    pub fn with_type_param(mut self, types: &str) -> Self {
        let parsed: Vec<String> = types
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        self.types = (!parsed.is_empty()).then_some(parsed);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BulkExportOutcome {
    Rejected { message: String },
    /// Records per resource type, in export order. Types without matches
    /// are left out.
    Completed { resources: IndexMap<String, Vec<Value>> },
}

impl BulkExportOutcome {
    fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Rejected { message } => Some(message),
            Self::Completed { .. } => None,
        }
    }

    pub fn resources(&self, resource_type: &str) -> &[Value] {
        match self {
            Self::Completed { resources } => resources
                .get(resource_type)
                .map(Vec::as_slice)
                .unwrap_or_default(),
            Self::Rejected { .. } => &[],
        }
    }

    /// One newline-delimited JSON document per resource type.
    pub fn to_ndjson(&self) -> IndexMap<String, String> {
        let Self::Completed { resources } = self else {
            return IndexMap::new();
        };
        resources
            .iter()
            .map(|(resource_type, rows)| {
                let body = rows
                    .iter()
                    .map(Value::to_string)
                    .collect::<Vec<_>>()
                    .join("\n");
                (resource_type.clone(), body)
            })
            .collect()
    }

    pub fn to_operation_outcome(&self) -> Value {
        match self {
            Self::Rejected { message } => json!({
                "resourceType": "OperationOutcome",
                "issue": [{"severity": "error", "code": "processing", "diagnostics": message}]
            }),
            Self::Completed { resources } => {
                let exported: usize = resources.values().map(Vec::len).sum();
                json!({
                    "resourceType": "OperationOutcome",
                    "issue": [{
                        "severity": "information",
                        "code": "informational",
                        "diagnostics": format!("Exported {exported} resources of {} types", resources.len())
                    }]
                })
            }
        }
    }
}

pub struct BulkExporter {
    pools: Arc<PoolRegistry>,
    dates: Arc<dyn DateBoundaryResolver>,
    default_types: Vec<String>,
}

impl BulkExporter {
    pub fn new(
        pools: Arc<PoolRegistry>,
        dates: Arc<dyn DateBoundaryResolver>,
        config: &BulkExportConfig,
    ) -> Self {
        Self {
            pools,
            dates,
            default_types: config
                .default_types
                .clone()
                .unwrap_or_else(compartment::compartment_types),
        }
    }

    /// Exports every record of the requested types.
    pub async fn export_patient_data(
        &self,
        request: &BulkExportRequest,
    ) -> CqfResult<BulkExportOutcome> {
        let base = match self.base_query(request) {
            Ok(query) => query,
            Err(rejection) => return Ok(rejection),
        };

        let mut resources = IndexMap::new();
        for resource_type in self.types(request) {
            let Some(pool) = self.pools.resolve(&resource_type) else {
                tracing::warn!(resource_type = %resource_type, "Skipping export of unsupported type");
                continue;
            };
            let rows = pool.search(&base).await?.into_resources();
            if !rows.is_empty() {
                resources.insert(resource_type, rows);
            }
        }
        Ok(BulkExportOutcome::Completed { resources })
    }

    /// Exports the records of the group's patient members. Each type is
    /// searched once per patient compartment parameter and the results are
    /// merged by record id.
    pub async fn export_group_data(
        &self,
        group_id: &str,
        request: &BulkExportRequest,
    ) -> CqfResult<BulkExportOutcome> {
        let base = match self.base_query(request) {
            Ok(query) => query,
            Err(rejection) => return Ok(rejection),
        };

        let group = match self.pools.resolve("Group") {
            Some(pool) => pool.read(group_id).await?,
            None => None,
        };
        let Some(group) = group else {
            return Ok(BulkExportOutcome::rejected(format!(
                "Group with id {group_id} could not be found"
            )));
        };
        let members = patient_members(&group.resource);
        if members.is_empty() {
            return Ok(BulkExportOutcome::rejected(format!(
                "No patients found in the Group with id: {group_id}"
            )));
        }
        tracing::info!(group = group_id, members = members.len(), "Exporting group data");

        let mut resources = IndexMap::new();
        for resource_type in self.types(request) {
            let Some(pool) = self.pools.resolve(&resource_type) else {
                tracing::warn!(resource_type = %resource_type, "Skipping export of unsupported type");
                continue;
            };
            let params = compartment::patient_params(&resource_type);
            if params.is_empty() {
                tracing::warn!(resource_type = %resource_type, "Skipping type outside the patient compartment");
                continue;
            }

            let mut merged: IndexMap<String, Value> = IndexMap::new();
            for param in params {
                let query = base.clone().with_references(*param, members.clone());
                for row in pool.search(&query).await?.entries {
                    merged.entry(row.id).or_insert(row.resource);
                }
            }
            if !merged.is_empty() {
                resources.insert(resource_type, merged.into_values().collect());
            }
        }
        Ok(BulkExportOutcome::Completed { resources })
    }

    fn base_query(&self, request: &BulkExportRequest) -> Result<SearchQuery, BulkExportOutcome> {
        check_preconditions(request)?;
        let query = SearchQuery::new();
        let Some(since) = &request.since else {
            return Ok(query);
        };
        let lower = self
            .dates
            .resolve(since, Boundary::Start)
            .map_err(|_| BulkExportOutcome::rejected(format!("Invalid _since parameter: {since}")))?;
        Ok(query.with_last_updated(DateBounds::between(lower, OffsetDateTime::now_utc())))
    }

    fn types(&self, request: &BulkExportRequest) -> Vec<String> {
        request
            .types
            .clone()
            .unwrap_or_else(|| self.default_types.clone())
    }
}

fn check_preconditions(request: &BulkExportRequest) -> Result<(), BulkExportOutcome> {
    match request.accept.as_deref() {
        None => {
            return Err(BulkExportOutcome::rejected(
                "Please provide the Accept header, which must be set to application/fhir+json",
            ));
        }
        Some(accept) if accept != FHIR_JSON => {
            return Err(BulkExportOutcome::rejected(
                "Only the application/fhir+json value for the Accept header is currently supported",
            ));
        }
        Some(_) => {}
    }
    match request.prefer.as_deref() {
        None => {
            return Err(BulkExportOutcome::rejected(
                "Please provide the Prefer header, which must be set to respond-async",
            ));
        }
        Some(prefer) if prefer != RESPOND_ASYNC => {
            return Err(BulkExportOutcome::rejected(
                "Only the respond-async value for the Prefer header is currently supported",
            ));
        }
        Some(_) => {}
    }
    if let Some(format) = request.output_format.as_deref()
        && !NDJSON_FORMATS.contains(&format)
    {
        return Err(BulkExportOutcome::rejected(
            "Only ndjson for the _outputFormat parameter is currently supported",
        ));
    }
    Ok(())
}

/// Distinct `Patient/<id>` member references of a Group.
fn patient_members(group: &Value) -> Vec<String> {
    let mut seen = HashSet::new();
    group
        .get("member")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(|m| m.pointer("/entity/reference").and_then(Value::as_str))
        .filter(|r| r.starts_with("Patient/"))
        .filter(|r| seen.insert(r.to_string()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date::FhirDateResolver;
    use octofhir_storage::{InMemoryPool, StoredResource};
    use time::macros::datetime;

    fn patient(id: &str) -> Value {
        json!({"resourceType": "Patient", "id": id})
    }

    fn condition(id: &str, patient: &str) -> Value {
        json!({"resourceType": "Condition", "id": id, "subject": {"reference": format!("Patient/{patient}")}})
    }

    async fn exporter(default_types: Option<Vec<String>>) -> BulkExporter {
        let observations = InMemoryPool::new("Observation");
        observations
            .put(
                StoredResource::new(
                    "old",
                    "1",
                    "Observation",
                    json!({"resourceType": "Observation", "id": "old", "subject": {"reference": "Patient/p1"}}),
                )
                .with_last_updated(datetime!(2019-06-01 00:00:00 UTC)),
            )
            .await;
        observations
            .put(StoredResource::new(
                "recent",
                "1",
                "Observation",
                json!({"resourceType": "Observation", "id": "recent",
                       "subject": {"reference": "Patient/p2"}, "performer": [{"reference": "Patient/p1"}]}),
            ))
            .await;

        let pools = PoolRegistry::builder()
            .with(InMemoryPool::with_resources(
                "Patient",
                vec![patient("p1"), patient("p2"), patient("p3")],
            ))
            .with(InMemoryPool::with_resources(
                "Condition",
                vec![condition("c1", "p1"), condition("c2", "p3")],
            ))
            .with(observations)
            .with(InMemoryPool::with_resources(
                "Organization",
                vec![json!({"resourceType": "Organization", "id": "org"})],
            ))
            .with(InMemoryPool::with_resources(
                "Group",
                vec![
                    json!({"resourceType": "Group", "id": "g1", "member": [
                        {"entity": {"reference": "Patient/p1"}},
                        {"entity": {"reference": "Patient/p1"}},
                        {"entity": {"reference": "Practitioner/dr1"}}
                    ]}),
                    json!({"resourceType": "Group", "id": "empty", "member": [
                        {"entity": {"reference": "Device/d1"}}
                    ]}),
                ],
            ))
            .build();
        BulkExporter::new(
            Arc::new(pools),
            Arc::new(FhirDateResolver),
            &BulkExportConfig { default_types },
        )
    }

    fn ids(rows: &[Value]) -> Vec<&str> {
        rows.iter().filter_map(|r| r["id"].as_str()).collect()
    }

    #[tokio::test]
    async fn test_precondition_messages() {
        let exporter = exporter(None).await;
        let cases = [
            (
                BulkExportRequest::default(),
                "Please provide the Accept header, which must be set to application/fhir+json",
            ),
            (
                BulkExportRequest::default().with_accept("application/json"),
                "Only the application/fhir+json value for the Accept header is currently supported",
            ),
            (
                BulkExportRequest::default().with_accept(FHIR_JSON),
                "Please provide the Prefer header, which must be set to respond-async",
            ),
            (
                BulkExportRequest::default()
                    .with_accept(FHIR_JSON)
                    .with_prefer("respond-sync"),
                "Only the respond-async value for the Prefer header is currently supported",
            ),
            (
                BulkExportRequest::async_fhir_json().with_output_format("text/csv"),
                "Only ndjson for the _outputFormat parameter is currently supported",
            ),
        ];
        for (request, expected) in cases {
            let outcome = exporter.export_patient_data(&request).await.unwrap();
            assert_eq!(outcome.message(), Some(expected));
            let outcome = exporter.export_group_data("g1", &request).await.unwrap();
            assert_eq!(outcome.message(), Some(expected));
        }
    }

    #[tokio::test]
    async fn test_patient_export_with_types_and_since() {
        let exporter = exporter(None).await;
        let request = BulkExportRequest::async_fhir_json()
            .with_output_format("application/fhir+ndjson")
            .with_type_param("Observation, Condition,Widget");

        let outcome = exporter.export_patient_data(&request).await.unwrap();
        assert_eq!(ids(outcome.resources("Observation")), vec!["old", "recent"]);
        assert_eq!(ids(outcome.resources("Condition")), vec!["c1", "c2"]);
        assert!(outcome.resources("Widget").is_empty());
        let BulkExportOutcome::Completed { resources } = &outcome else {
            panic!("expected a completed export");
        };
        assert_eq!(resources.keys().collect::<Vec<_>>(), vec!["Observation", "Condition"]);

        let outcome = exporter
            .export_patient_data(&request.clone().with_since("2020-01-01"))
            .await
            .unwrap();
        assert_eq!(ids(outcome.resources("Observation")), vec!["recent"]);

        let outcome = exporter
            .export_patient_data(&request.with_since("last tuesday"))
            .await
            .unwrap();
        assert!(outcome.is_rejected());
    }

    #[tokio::test]
    async fn test_patient_export_default_types() {
        let exporter = exporter(Some(vec!["Patient".into(), "Organization".into()])).await;
        let outcome = exporter
            .export_patient_data(&BulkExportRequest::async_fhir_json())
            .await
            .unwrap();
        assert_eq!(ids(outcome.resources("Patient")), vec!["p1", "p2", "p3"]);
        assert_eq!(outcome.resources("Organization").len(), 1);

        let ndjson = outcome.to_ndjson();
        assert_eq!(ndjson["Patient"].lines().count(), 3);
    }

    #[tokio::test]
    async fn test_group_export_unions_compartment_params() {
        let exporter = exporter(None).await;
        let request = BulkExportRequest::async_fhir_json()
            .with_type_param("Patient,Condition,Observation,Organization");

        let outcome = exporter.export_group_data("g1", &request).await.unwrap();
        assert_eq!(ids(outcome.resources("Patient")), vec!["p1"]);
        assert_eq!(ids(outcome.resources("Condition")), vec!["c1"]);
        // "old" via subject, "recent" via performer
        assert_eq!(ids(outcome.resources("Observation")), vec!["old", "recent"]);
        assert!(outcome.resources("Organization").is_empty());
    }

    #[tokio::test]
    async fn test_group_rejections() {
        let exporter = exporter(None).await;
        let request = BulkExportRequest::async_fhir_json();

        let outcome = exporter.export_group_data("nope", &request).await.unwrap();
        assert_eq!(
            outcome.message(),
            Some("Group with id nope could not be found")
        );

        let outcome = exporter.export_group_data("empty", &request).await.unwrap();
        assert_eq!(
            outcome.message(),
            Some("No patients found in the Group with id: empty")
        );
        assert_eq!(
            outcome.to_operation_outcome()["issue"][0]["severity"],
            "error"
        );
    }

    #[test]
    fn test_type_param_parsing() {
        let request = BulkExportRequest::default().with_type_param(" , ");
        assert!(request.types.is_none());
        let request = BulkExportRequest::default().with_type_param("Patient,Encounter");
        assert_eq!(
            request.types,
            Some(vec!["Patient".to_string(), "Encounter".to_string()])
        );
    }
}
