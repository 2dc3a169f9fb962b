//! Retrieve translation
//!
//! Turns an engine retrieve (data type, subject context, code and date
//! criteria) into a [`SearchQuery`] against the pool registered for the data
//! type, and runs it with a hard row cap.

use std::sync::Arc;

use octofhir_storage::{DateBounds, DynPool, FilterValue, PoolRegistry, SearchFilter, SearchQuery};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::compartment;
use crate::config::CqfConfig;
use crate::date::{Boundary, DateBoundaryResolver};
use crate::error::{CqfError, CqfResult};
use crate::terminology_provider::{Code, TerminologyProvider};

/// Date range criterion of a retrieve. Either side may be open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateInterval {
    pub low: Option<String>,
    pub high: Option<String>,
}

impl DateInterval {
    pub fn new(low: Option<&str>, high: Option<&str>) -> Self {
        Self {
            low: low.map(str::to_string),
            high: high.map(str::to_string),
        }
    }
}

/// A single retrieve as issued by the expression engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrieveRequest {
    pub context_type: Option<String>,
    pub context_value: Option<String>,
    pub data_type: Option<String>,
    pub template_id: Option<String>,
    pub code_path: Option<String>,
    #[serde(default)]
    pub codes: Vec<Code>,
    pub value_set: Option<String>,
    pub date_path: Option<String>,
    pub date_range: Option<DateInterval>,
}

impl RetrieveRequest {
    pub fn new(data_type: impl Into<String>) -> Self {
        Self {
            data_type: Some(data_type.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn in_context(mut self, context_type: impl Into<String>, value: impl Into<String>) -> Self {
        self.context_type = Some(context_type.into());
        self.context_value = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_codes(mut self, code_path: impl Into<String>, codes: Vec<Code>) -> Self {
        self.code_path = Some(code_path.into());
        self.codes = codes;
        self
    }

    #[must_use]
    pub fn with_value_set(mut self, code_path: impl Into<String>, value_set: impl Into<String>) -> Self {
        self.code_path = Some(code_path.into());
        self.value_set = Some(value_set.into());
        self
    }

    #[must_use]
    pub fn with_date_range(mut self, date_path: impl Into<String>, range: DateInterval) -> Self {
        self.date_path = Some(date_path.into());
        self.date_range = Some(range);
        self
    }
}

/// Validated and normalized retrieve criteria.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSet {
    pub data_type: String,
    /// Subject scoping: search parameter and patient reference.
    pub subject: Option<(String, String)>,
    pub code_param: Option<String>,
    /// Value set id with any legacy `urn:oid:` prefix removed.
    pub value_set: Option<String>,
    pub date_param: Option<String>,
}

/// Maps engine retrieves onto resource pool searches.
#[derive(Clone)]
pub struct RetrieveTranslator {
    pools: Arc<PoolRegistry>,
    terminology: Arc<dyn TerminologyProvider>,
    dates: Arc<dyn DateBoundaryResolver>,
    max_rows: u32,
    expand_value_sets: bool,
}

impl RetrieveTranslator {
    pub fn new(
        pools: Arc<PoolRegistry>,
        terminology: Arc<dyn TerminologyProvider>,
        dates: Arc<dyn DateBoundaryResolver>,
        config: &CqfConfig,
    ) -> Self {
        Self {
            pools,
            terminology,
            dates,
            max_rows: u32::try_from(config.max_retrieve_size).unwrap_or(u32::MAX),
            expand_value_sets: config.expand_value_sets,
        }
    }

    /// Same translator bound to another terminology source.
    #[must_use]
    pub fn with_terminology(&self, terminology: Arc<dyn TerminologyProvider>) -> Self {
        Self {
            terminology,
            ..self.clone()
        }
    }

    pub fn terminology(&self) -> &Arc<dyn TerminologyProvider> {
        &self.terminology
    }

    pub fn max_rows(&self) -> u32 {
        self.max_rows
    }

    pub fn build_filter_set(&self, request: &RetrieveRequest) -> CqfResult<FilterSet> {
        let data_type = request
            .data_type
            .as_deref()
            .filter(|dt| !dt.is_empty())
            .ok_or_else(|| {
                CqfError::InvalidArgument("A data type is required for a retrieve".into())
            })?;

        let code_path = non_blank(request.code_path.as_deref());
        let date_path = non_blank(request.date_path.as_deref());

        if code_path.is_none() {
            if request.value_set.is_some() {
                return Err(CqfError::InvalidArgument(
                    "A code path must be provided when filtering on a value set".into(),
                ));
            }
            if !request.codes.is_empty() {
                return Err(CqfError::InvalidArgument(
                    "A code path must be provided when filtering on codes".into(),
                ));
            }
        }
        if request.date_range.is_some() && date_path.is_none() {
            return Err(CqfError::InvalidArgument(
                "A date path must be provided when filtering on a date range".into(),
            ));
        }
        if let Some(template) = &request.template_id {
            tracing::trace!(template = %template, "Ignoring retrieve template id");
        }

        let subject = match (request.context_type.as_deref(), &request.context_value) {
            (Some("Patient"), Some(value)) => {
                let id = value.strip_prefix("Patient/").unwrap_or(value);
                Some((
                    compartment::subject_param(data_type).to_string(),
                    format!("Patient/{id}"),
                ))
            }
            _ => None,
        };

        Ok(FilterSet {
            data_type: data_type.to_string(),
            subject,
            code_param: code_path.map(path_to_search_param),
            value_set: request
                .value_set
                .as_deref()
                .map(|vs| vs.strip_prefix("urn:oid:").unwrap_or(vs).to_string()),
            date_param: date_path.map(path_to_search_param),
        })
    }

    /// Codes to push into the search, or `None` when no code filter applies.
    ///
    /// With expansion enabled a value set is replaced by its expansion. With
    /// expansion disabled membership is checked row by row after the search,
    /// so nothing is pushed down.
    pub async fn resolve_codes(
        &self,
        value_set: Option<&str>,
        codes: &[Code],
    ) -> CqfResult<Option<Vec<Code>>> {
        match value_set {
            Some(vs) if self.expand_value_sets => Ok(Some(self.terminology.expand(vs).await?)),
            Some(_) => Ok(None),
            None if codes.is_empty() => Ok(None),
            None => Ok(Some(codes.to_vec())),
        }
    }

    /// OR-combined `system|code` filter on `param`.
    pub fn code_filter(param: &str, codes: &[Code]) -> SearchFilter {
        SearchFilter {
            param: param.to_string(),
            value: FilterValue::AnyToken {
                tokens: codes.iter().map(Code::to_token).collect(),
            },
        }
    }

    pub fn date_filter(&self, interval: &DateInterval) -> CqfResult<DateBounds> {
        let low = |v: &str| self.dates.resolve(v, Boundary::Start);
        let high = |v: &str| self.dates.resolve(v, Boundary::End);
        Ok(match (interval.low.as_deref(), interval.high.as_deref()) {
            (Some(l), Some(h)) => DateBounds::between(low(l)?, high(h)?),
            (Some(l), None) => DateBounds::at_least(low(l)?),
            (None, Some(h)) => DateBounds::at_most(high(h)?),
            (None, None) => DateBounds::unbounded(),
        })
    }

    pub fn resolve_handler(&self, data_type: &str) -> CqfResult<DynPool> {
        self.pools.resolve(data_type).ok_or_else(|| {
            CqfError::NotFound(format!("Could not find resource pool for type: {data_type}"))
        })
    }

    pub async fn retrieve(&self, request: &RetrieveRequest) -> CqfResult<Vec<Value>> {
        let filters = self.build_filter_set(request)?;
        let pool = self.resolve_handler(&filters.data_type)?;

        let mut query = SearchQuery::new();
        if let Some((param, reference)) = &filters.subject {
            query = query.with_references(param.as_str(), vec![reference.clone()]);
        }

        let mut membership = None;
        if let Some(param) = &filters.code_param {
            match self
                .resolve_codes(filters.value_set.as_deref(), &request.codes)
                .await?
            {
                Some(codes) => query = query.with_filter(Self::code_filter(param, &codes)),
                None => membership = filters.value_set.as_deref(),
            }
        }

        if let (Some(param), Some(range)) = (&filters.date_param, &request.date_range) {
            let bounds = self.date_filter(range)?;
            if !bounds.is_unbounded() {
                query = query.with_date(param.as_str(), bounds);
            }
        }

        let query = query.with_count(self.max_rows);
        tracing::debug!(
            data_type = %filters.data_type,
            query = ?query.to_query_pairs(),
            "Retrieve"
        );

        let result = pool.search(&query).await?;
        if result.has_more {
            tracing::warn!(
                data_type = %filters.data_type,
                cap = self.max_rows,
                "Retrieve truncated at row cap"
            );
        }
        let rows = result.into_resources();

        let Some(value_set) = membership else {
            return Ok(rows);
        };
        let field = non_blank(request.code_path.as_deref())
            .and_then(|p| p.split('.').next())
            .unwrap_or("code");
        let mut kept = Vec::with_capacity(rows.len());
        for row in rows {
            if self.row_in_value_set(&row, field, value_set).await? {
                kept.push(row);
            }
        }
        Ok(kept)
    }

    async fn row_in_value_set(&self, row: &Value, field: &str, value_set: &str) -> CqfResult<bool> {
        let mut codes = Vec::new();
        for candidate in [field.to_string(), format!("{field}CodeableConcept")] {
            if let Some(value) = row.get(&candidate) {
                collect_codes(value, &mut codes);
            }
        }
        for code in &codes {
            if self.terminology.in_value_set(code, value_set).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

const PATH_ALIASES: &[(&str, &str)] = &[
    ("effective", "date"),
    ("effectiveDateTime", "date"),
    ("effectivePeriod", "date"),
    ("performed", "date"),
    ("performedDateTime", "date"),
    ("performedPeriod", "date"),
    ("period", "date"),
    ("onset", "onset-date"),
    ("onsetDateTime", "onset-date"),
    ("onsetPeriod", "onset-date"),
    ("abatement", "abatement-date"),
    ("abatementDateTime", "abatement-date"),
    ("authoredOn", "authoredon"),
    ("medication", "code"),
    ("medicationCodeableConcept", "code"),
];

/// Maps an element path (`clinicalStatus.coding`) to the search parameter
/// covering it (`clinical-status`).
pub fn path_to_search_param(path: &str) -> String {
    let head = path.split('.').next().unwrap_or(path);
    if let Some((_, param)) = PATH_ALIASES.iter().find(|(p, _)| *p == head) {
        return (*param).to_string();
    }
    let mut param = String::with_capacity(head.len() + 4);
    for ch in head.chars() {
        if ch.is_ascii_uppercase() {
            param.push('-');
            param.push(ch.to_ascii_lowercase());
        } else {
            param.push(ch);
        }
    }
    param
}

fn non_blank(path: Option<&str>) -> Option<&str> {
    path.map(str::trim).filter(|p| !p.is_empty())
}

fn collect_codes(value: &Value, out: &mut Vec<Code>) {
    match value {
        Value::Object(map) => {
            if let (Some(system), Some(code)) = (
                map.get("system").and_then(Value::as_str),
                map.get("code").and_then(Value::as_str),
            ) {
                out.push(Code::new(system, code));
            }
            map.values().for_each(|v| collect_codes(v, out));
        }
        Value::Array(items) => items.iter().for_each(|v| collect_codes(v, out)),
        _ => {}
    }
}
