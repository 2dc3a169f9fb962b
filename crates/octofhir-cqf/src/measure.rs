//! Measure definitions and measure reports

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::engine::Interval;
use crate::error::{CqfError, CqfResult};
use crate::library_cache::CompiledLibrary;

pub const INITIAL_POPULATION: &str = "initial-population";

/// The parts of a Measure resource evaluation depends on.
#[derive(Debug, Clone)]
pub struct Measure {
    pub id: String,
    pub url: Option<String>,
    /// Library references in declaration order; `#id` points at a contained resource.
    pub library_refs: Vec<String>,
    pub groups: Vec<MeasureGroup>,
    pub contained: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct MeasureGroup {
    pub identifier: Option<Value>,
    pub populations: Vec<MeasurePopulation>,
}

#[derive(Debug, Clone)]
pub struct MeasurePopulation {
    pub code: Option<Value>,
    pub identifier: Option<Value>,
    /// Expression name, possibly `Alias.Name`.
    pub criteria: String,
}

impl MeasurePopulation {
    /// First coding's code, e.g. `numerator`.
    pub fn code_value(&self) -> Option<&str> {
        self.code
            .as_ref()?
            .pointer("/coding/0/code")
            .and_then(Value::as_str)
    }

    pub fn is_initial_population(&self) -> bool {
        self.code_value() == Some(INITIAL_POPULATION)
    }
}

impl Measure {
    /// Reads both the string criteria form and the `Expression` form.
    pub fn from_resource(id: &str, resource: &Value) -> CqfResult<Self> {
        if resource.get("resourceType").and_then(Value::as_str) != Some("Measure") {
            return Err(CqfError::InvalidArgument(format!(
                "Measure/{id} is not a Measure resource"
            )));
        }

        let library_refs = array(resource, "library")
            .iter()
            .filter_map(|lib| match lib {
                Value::String(canonical) => Some(canonical.clone()),
                other => other
                    .get("reference")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
            .collect();

        let mut groups = Vec::new();
        for group in array(resource, "group") {
            let mut populations = Vec::new();
            for population in array(group, "population") {
                let criteria = match population.get("criteria") {
                    Some(Value::String(name)) => Some(name.clone()),
                    Some(expression) => expression
                        .get("expression")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    None => None,
                };
                let code = population.get("code").cloned();
                let criteria = criteria.ok_or_else(|| {
                    let name = code
                        .as_ref()
                        .and_then(|c| c.pointer("/coding/0/code"))
                        .and_then(Value::as_str)
                        .unwrap_or("population");
                    CqfError::InvalidArgument(format!(
                        "Population {name} of Measure/{id} has no criteria"
                    ))
                })?;
                populations.push(MeasurePopulation {
                    code,
                    identifier: population.get("identifier").cloned(),
                    criteria,
                });
            }
            groups.push(MeasureGroup {
                identifier: group.get("identifier").cloned(),
                populations,
            });
        }

        Ok(Self {
            id: id.to_string(),
            url: resource.get("url").and_then(Value::as_str).map(str::to_string),
            library_refs,
            groups,
            contained: array(resource, "contained").to_vec(),
        })
    }

    pub fn contained_library(&self, id: &str) -> Option<&Value> {
        self.contained.iter().find(|r| {
            r.get("resourceType").and_then(Value::as_str) == Some("Library")
                && r.get("id").and_then(Value::as_str) == Some(id)
        })
    }

    pub fn criteria_expressions(&self) -> Vec<&str> {
        self.groups
            .iter()
            .flat_map(|g| g.populations.iter().map(|p| p.criteria.as_str()))
            .collect()
    }
}

fn array<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Picks the library criteria expressions are evaluated against.
///
/// Expressions are scanned in criteria order and, for each namespaced one
/// (`Alias.Name`), `candidates` are scanned most recently loaded first. The
/// first candidate that includes the alias wins, so an earlier expression
/// outranks a more recent library. Otherwise `default_id`.
///
/// Callers pass only the measure's own libraries. A library cached for some
/// other measure never becomes primary here even if it includes the alias,
/// unlike a lookup over every cached library.
pub fn resolve_primary_library(
    candidates: &[Arc<CompiledLibrary>],
    default_id: &str,
    expressions: &[&str],
) -> String {
    expressions
        .iter()
        .filter_map(|expr| expr.split_once('.').map(|(alias, _)| alias))
        .find_map(|alias| candidates.iter().find(|lib| lib.includes_alias(alias)))
        .map_or_else(|| default_id.to_string(), |lib| lib.id.clone())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportType {
    Individual,
    PatientList,
    Summary,
}

impl ReportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Individual => "individual",
            Self::PatientList => "patient-list",
            Self::Summary => "summary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopulationReport {
    pub code: Option<Value>,
    pub identifier: Option<Value>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupReport {
    pub identifier: Option<Value>,
    pub populations: Vec<PopulationReport>,
}

/// A subject whose evaluation failed under the continue policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubjectError {
    pub subject: String,
    pub expression: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct MeasureReport {
    pub id: String,
    /// `Measure/<id>`
    pub measure: String,
    pub report_type: ReportType,
    /// `Patient/<id>` for individual reports.
    pub patient: Option<String>,
    pub period: Interval,
    pub groups: Vec<GroupReport>,
    /// Records returned by list-valued criteria, keyed by `Type/id`.
    pub evaluated_resources: IndexMap<String, Value>,
    pub errors: Vec<SubjectError>,
}

impl MeasureReport {
    pub fn new(measure_id: &str, report_type: ReportType, period: Interval) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            measure: format!("Measure/{measure_id}"),
            report_type,
            patient: None,
            period,
            groups: Vec::new(),
            evaluated_resources: IndexMap::new(),
            errors: Vec::new(),
        }
    }

    /// Count of the population with `code` in group `group`.
    pub fn population_count(&self, group: usize, code: &str) -> Option<usize> {
        self.groups.get(group)?.populations.iter().find_map(|p| {
            let matches = p
                .code
                .as_ref()
                .and_then(|c| c.pointer("/coding/0/code"))
                .and_then(Value::as_str)
                == Some(code);
            matches.then_some(p.count)
        })
    }

    /// Renders the report as a MeasureReport resource with the evaluated
    /// records in a contained collection bundle.
    pub fn to_resource(&self) -> Value {
        let bundle_id = uuid::Uuid::new_v4().to_string();
        let entries: Vec<Value> = self
            .evaluated_resources
            .values()
            .map(|r| json!({"resource": r}))
            .collect();
        let mut contained = vec![json!({
            "resourceType": "Bundle",
            "id": bundle_id,
            "type": "collection",
            "entry": entries
        })];
        if !self.errors.is_empty() {
            let issues: Vec<Value> = self
                .errors
                .iter()
                .map(|e| {
                    json!({
                        "severity": "error",
                        "code": "exception",
                        "diagnostics": format!("Patient/{}: {}: {}", e.subject, e.expression, e.message)
                    })
                })
                .collect();
            contained.push(json!({
                "resourceType": "OperationOutcome",
                "id": "evaluation-errors",
                "issue": issues
            }));
        }

        let groups: Vec<Value> = self
            .groups
            .iter()
            .map(|g| {
                let populations: Vec<Value> = g
                    .populations
                    .iter()
                    .map(|p| {
                        let mut population = json!({"count": p.count});
                        if let Some(code) = &p.code {
                            population["code"] = code.clone();
                        }
                        if let Some(identifier) = &p.identifier {
                            population["identifier"] = identifier.clone();
                        }
                        population
                    })
                    .collect();
                let mut group = json!({"population": populations});
                if let Some(identifier) = &g.identifier {
                    group["identifier"] = identifier.clone();
                }
                group
            })
            .collect();

        let mut report = json!({
            "resourceType": "MeasureReport",
            "id": self.id,
            "status": "complete",
            "type": self.report_type.as_str(),
            "measure": self.measure,
            "period": {
                "start": instant(self.period.low),
                "end": instant(self.period.high)
            },
            "group": groups,
            "contained": contained,
            "evaluatedResources": {"reference": format!("#{bundle_id}")}
        });
        if let Some(patient) = &self.patient {
            report["patient"] = json!({"reference": patient});
        }
        report
    }
}

fn instant(value: OffsetDateTime) -> Value {
    value.format(&Rfc3339).map(Value::String).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_include;
    use time::macros::datetime;

    fn library(id: &str, aliases: &[&str]) -> Arc<CompiledLibrary> {
        let includes: Vec<Value> = aliases
            .iter()
            .map(|a| json!({"localIdentifier": a, "path": a}))
            .collect();
        Arc::new(
            CompiledLibrary::from_elm(
                id,
                None,
                json!({"library": {"identifier": {"id": id}, "includes": {"def": includes}}}),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_primary_library_by_namespace() {
        let candidates = vec![library("Newer", &["Common"]), library("Older", &["Common"])];
        assert_eq!(
            resolve_primary_library(&candidates, "Default", &["Numerator", "Common.InDemographic"]),
            "Newer"
        );
        assert_eq!(
            resolve_primary_library(&candidates, "Default", &["Numerator"]),
            "Default"
        );
        assert_eq!(
            resolve_primary_library(&candidates, "Default", &["Other.Numerator"]),
            "Default"
        );
        assert_eq!(resolve_primary_library(&[], "Default", &["Common.X"]), "Default");
    }

    #[test]
    fn test_primary_library_expression_order_outranks_recency() {
        let candidates = vec![library("Newer", &["Helpers"]), library("Older", &["Common"])];
        assert_eq!(
            resolve_primary_library(&candidates, "Default", &["Common.InDemographic", "Helpers.Age"]),
            "Older"
        );
        assert_eq!(
            resolve_primary_library(&candidates, "Default", &["Helpers.Age", "Common.InDemographic"]),
            "Newer"
        );
    }

    #[test]
    fn test_parse_measure_forms() {
        let resource = json!({
            "resourceType": "Measure",
            "id": "m1",
            "library": ["http://example.org/Library/CMS|1.0", {"reference": "#inline"}],
            "group": [{
                "identifier": {"value": "g1"},
                "population": [
                    {"code": {"coding": [{"code": "initial-population"}]}, "criteria": "Initial Population"},
                    {"code": {"coding": [{"code": "numerator"}]},
                     "criteria": {"language": "text/cql", "expression": "Numerator"}}
                ]
            }],
            "contained": [{"resourceType": "Library", "id": "inline"}]
        });

        let measure = Measure::from_resource("m1", &resource).unwrap();
        assert_eq!(
            measure.library_refs,
            vec!["http://example.org/Library/CMS|1.0", "#inline"]
        );
        assert!(measure.groups[0].populations[0].is_initial_population());
        assert_eq!(measure.groups[0].populations[1].criteria, "Numerator");
        assert!(measure.contained_library("inline").is_some());
        assert_eq!(measure.criteria_expressions(), vec!["Initial Population", "Numerator"]);
    }

    #[test]
    fn test_parse_rejects_missing_criteria() {
        let resource = json!({
            "resourceType": "Measure",
            "group": [{"population": [{"code": {"coding": [{"code": "denominator"}]}}]}]
        });
        let err = Measure::from_resource("m1", &resource).unwrap_err();
        assert!(err.to_string().contains("denominator"));

        let err = Measure::from_resource("m1", &json!({"resourceType": "Library"})).unwrap_err();
        assert_eq!(err.category(), "invalid");
    }

    #[test]
    fn test_report_resource_shape() {
        let period = Interval::closed(
            datetime!(2024-01-01 00:00:00 UTC),
            datetime!(2024-12-31 23:59:59 UTC),
        );
        let mut report = MeasureReport::new("m1", ReportType::Individual, period);
        report.patient = Some("Patient/p1".into());
        report.groups.push(GroupReport {
            identifier: None,
            populations: vec![PopulationReport {
                code: Some(json!({"coding": [{"code": "numerator"}]})),
                identifier: None,
                count: 1,
            }],
        });
        report.evaluated_resources.insert(
            "Encounter/e1".into(),
            json!({"resourceType": "Encounter", "id": "e1"}),
        );

        assert_eq!(report.population_count(0, "numerator"), Some(1));
        let resource = report.to_resource();
        assert_json_include!(
            actual: resource.clone(),
            expected: json!({
                "resourceType": "MeasureReport",
                "type": "individual",
                "measure": "Measure/m1",
                "patient": {"reference": "Patient/p1"},
                "period": {"start": "2024-01-01T00:00:00Z"},
                "group": [{"population": [{"count": 1}]}]
            })
        );
        let bundle_ref = resource["evaluatedResources"]["reference"].as_str().unwrap();
        assert_eq!(
            format!("#{}", resource["contained"][0]["id"].as_str().unwrap()),
            bundle_ref
        );
        assert_eq!(resource["contained"][0]["entry"][0]["resource"]["id"], "e1");
    }
}
