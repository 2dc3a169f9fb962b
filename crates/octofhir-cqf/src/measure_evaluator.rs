//! Measure evaluation
//!
//! Loads a measure and its libraries, resolves the subject cohort for the
//! requested report type, evaluates population criteria per subject and
//! aggregates the counts into a [`MeasureReport`].

use std::sync::Arc;

use indexmap::IndexMap;
use octofhir_storage::{DynPool, PoolRegistry, SearchQuery};
use serde_json::Value;

use crate::config::{CqfConfig, FailurePolicy};
use crate::data_provider::RetrieveTranslator;
use crate::date::{Boundary, DateBoundaryResolver};
use crate::engine::{
    EvaluationContext, ExpressionEvaluator, ExpressionValue, Interval, MEASUREMENT_PERIOD,
    ParameterValue, resource_identity,
};
use crate::error::{CqfError, CqfResult};
use crate::library_cache::{CompiledLibrary, LibraryCache, VersionedLibraryId};
use crate::measure::{
    GroupReport, Measure, MeasureReport, PopulationReport, ReportType, SubjectError,
    resolve_primary_library,
};
use crate::remote_terminology::{RemoteTerminologyProvider, TerminologyEndpoint};
use crate::terminology_provider::{CachingTerminologyProvider, TerminologyProvider};

/// Parameters of one `$evaluate-measure` call.
#[derive(Debug, Clone, Default)]
pub struct EvaluateMeasureRequest {
    /// Measure id from the request path.
    pub measure_id: String,
    pub period_start: String,
    pub period_end: String,
    /// Explicit measure reference; takes precedence over `measure_id`.
    pub measure: Option<String>,
    /// `patient`, `patient-list` or `population`; defaults to `patient`.
    pub report_type: Option<String>,
    pub patient: Option<String>,
    pub practitioner: Option<String>,
    /// Evaluate against this terminology server instead of local terminology.
    pub terminology: Option<TerminologyEndpoint>,
}

impl EvaluateMeasureRequest {
    pub fn new(
        measure_id: impl Into<String>,
        period_start: impl Into<String>,
        period_end: impl Into<String>,
    ) -> Self {
        Self {
            measure_id: measure_id.into(),
            period_start: period_start.into(),
            period_end: period_end.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_report_type(mut self, report_type: impl Into<String>) -> Self {
        self.report_type = Some(report_type.into());
        self
    }

    #[must_use]
    pub fn for_patient(mut self, patient: impl Into<String>) -> Self {
        self.patient = Some(patient.into());
        self
    }

    #[must_use]
    pub fn for_practitioner(mut self, practitioner: impl Into<String>) -> Self {
        self.practitioner = Some(practitioner.into());
        self
    }

    #[must_use]
    pub fn with_measure(mut self, measure: impl Into<String>) -> Self {
        self.measure = Some(measure.into());
        self
    }

    #[must_use]
    pub fn with_terminology(mut self, endpoint: TerminologyEndpoint) -> Self {
        self.terminology = Some(endpoint);
        self
    }
}

/// Subjects a report is computed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cohort {
    pub report_type: ReportType,
    /// Patient ids in search order.
    pub patients: Vec<String>,
    /// Set for individual reports.
    pub patient_ref: Option<String>,
}

pub struct MeasureEvaluator {
    pools: Arc<PoolRegistry>,
    libraries: Arc<LibraryCache>,
    translator: RetrieveTranslator,
    dates: Arc<dyn DateBoundaryResolver>,
    engine: Arc<dyn ExpressionEvaluator>,
    failure_policy: FailurePolicy,
    terminology_cache_capacity: usize,
}

impl MeasureEvaluator {
    pub fn new(
        pools: Arc<PoolRegistry>,
        libraries: Arc<LibraryCache>,
        translator: RetrieveTranslator,
        dates: Arc<dyn DateBoundaryResolver>,
        engine: Arc<dyn ExpressionEvaluator>,
        config: &CqfConfig,
    ) -> Self {
        Self {
            pools,
            libraries,
            translator,
            dates,
            engine,
            failure_policy: config.failure_policy,
            terminology_cache_capacity: config.terminology_cache_capacity,
        }
    }

    pub async fn evaluate_measure(
        &self,
        request: &EvaluateMeasureRequest,
    ) -> CqfResult<MeasureReport> {
        let reference = request.measure.as_deref().unwrap_or(&request.measure_id);
        let measure_id = reference.strip_prefix("Measure/").unwrap_or(reference);
        if measure_id.is_empty() {
            return Err(CqfError::InvalidArgument("A measure id is required".into()));
        }

        tracing::info!(measure = measure_id, report_type = ?request.report_type, "Evaluating measure");

        let measure = self.load_measure(measure_id).await?;
        let period = self.measurement_period(&request.period_start, &request.period_end)?;
        let loaded = self.load_libraries(&measure).await?;
        let primary = self.primary_library(&measure, &loaded)?;

        let terminology: Arc<dyn TerminologyProvider> = match &request.terminology {
            Some(endpoint) => Arc::new(RemoteTerminologyProvider::new(endpoint)?),
            None => self.translator.terminology().clone(),
        };
        let terminology = Arc::new(CachingTerminologyProvider::new(
            terminology,
            self.terminology_cache_capacity,
        ));
        let mut context = EvaluationContext::new(
            primary,
            self.translator.with_terminology(terminology),
            self.libraries.clone(),
        );
        context.set_parameter(MEASUREMENT_PERIOD, ParameterValue::Interval(period));

        let cohort = self.resolve_cohort(request).await?;
        let report = self
            .evaluate_cohort(&measure, &mut context, cohort, period)
            .await?;

        tracing::info!(
            measure = measure_id,
            report = %report.id,
            errors = report.errors.len(),
            "Measure evaluation complete"
        );
        Ok(report)
    }

    async fn load_measure(&self, id: &str) -> CqfResult<Measure> {
        let stored = self
            .pool("Measure")?
            .read(id)
            .await?
            .ok_or_else(|| CqfError::NotFound(format!("Measure/{id}")))?;
        Measure::from_resource(id, &stored.resource)
    }

    fn measurement_period(&self, start: &str, end: &str) -> CqfResult<Interval> {
        let low = self.dates.resolve(start, Boundary::Start)?;
        let high = self.dates.resolve(end, Boundary::End)?;
        if low > high {
            return Err(CqfError::InvalidArgument(format!(
                "Measurement period start {start} is after end {end}"
            )));
        }
        Ok(Interval::closed(low, high))
    }

    /// Resolves every referenced library through the cache. Contained
    /// libraries are written to the Library pool first.
    async fn load_libraries(&self, measure: &Measure) -> CqfResult<Vec<Arc<CompiledLibrary>>> {
        if measure.library_refs.is_empty() {
            return Err(CqfError::InvalidArgument(format!(
                "Measure/{} does not reference a library",
                measure.id
            )));
        }

        let mut loaded = Vec::with_capacity(measure.library_refs.len());
        for reference in &measure.library_refs {
            let id = match reference.strip_prefix('#') {
                Some(local) => {
                    let contained = measure.contained_library(local).ok_or_else(|| {
                        CqfError::NotFound(format!(
                            "Contained library {reference} in Measure/{}",
                            measure.id
                        ))
                    })?;
                    self.pool("Library")?.update(contained).await?;
                    VersionedLibraryId::new(local)
                }
                None => VersionedLibraryId::from_reference(reference),
            };
            loaded.push(self.libraries.resolve(&id).await?);
        }
        Ok(loaded)
    }

    fn primary_library(
        &self,
        measure: &Measure,
        loaded: &[Arc<CompiledLibrary>],
    ) -> CqfResult<Arc<CompiledLibrary>> {
        let default_id = loaded
            .first()
            .map(|lib| lib.id.clone())
            .unwrap_or_default();
        let candidates: Vec<Arc<CompiledLibrary>> = self
            .libraries
            .libraries()
            .into_iter()
            .filter(|lib| loaded.iter().any(|l| l.id == lib.id))
            .collect();

        let primary_id =
            resolve_primary_library(&candidates, &default_id, &measure.criteria_expressions());
        loaded
            .iter()
            .find(|lib| lib.id == primary_id)
            .cloned()
            .ok_or_else(|| CqfError::NotFound(format!("Library/{primary_id}")))
    }

    pub async fn resolve_cohort(&self, request: &EvaluateMeasureRequest) -> CqfResult<Cohort> {
        match request.report_type.as_deref() {
            None | Some("patient") => match &request.patient {
                Some(patient) => {
                    let id = patient.strip_prefix("Patient/").unwrap_or(patient);
                    let found = self.pool("Patient")?.read(id).await?;
                    if found.is_none() {
                        tracing::warn!(patient = id, "Patient for individual report not found");
                    }
                    Ok(Cohort {
                        report_type: ReportType::Individual,
                        patients: found.map(|p| p.id).into_iter().collect(),
                        patient_ref: Some(format!("Patient/{id}")),
                    })
                }
                None => self.population_cohort().await,
            },
            Some("patient-list") => {
                let patients = match &request.practitioner {
                    Some(practitioner) => {
                        let id = practitioner
                            .strip_prefix("Practitioner/")
                            .unwrap_or(practitioner);
                        let query = SearchQuery::new().with_references(
                            "general-practitioner",
                            vec![format!("Practitioner/{id}")],
                        );
                        self.patient_ids(&query).await?
                    }
                    None => Vec::new(),
                };
                Ok(Cohort {
                    report_type: ReportType::PatientList,
                    patients,
                    patient_ref: None,
                })
            }
            Some("population") => self.population_cohort().await,
            Some(other) => Err(CqfError::InvalidArgument(format!(
                "Invalid report type: {other}"
            ))),
        }
    }

    async fn population_cohort(&self) -> CqfResult<Cohort> {
        Ok(Cohort {
            report_type: ReportType::Summary,
            patients: self.patient_ids(&SearchQuery::new()).await?,
            patient_ref: None,
        })
    }

    async fn patient_ids(&self, query: &SearchQuery) -> CqfResult<Vec<String>> {
        let result = self.pool("Patient")?.search(query).await?;
        Ok(result.entries.into_iter().map(|p| p.id).collect())
    }

    async fn evaluate_cohort(
        &self,
        measure: &Measure,
        context: &mut EvaluationContext,
        cohort: Cohort,
        period: Interval,
    ) -> CqfResult<MeasureReport> {
        let mut report = MeasureReport::new(&measure.id, cohort.report_type, period);
        report.patient = cohort.patient_ref;

        for group in &measure.groups {
            // Subjects in the initial population with their criteria result.
            let mut initial: IndexMap<String, ExpressionValue> = IndexMap::new();
            match group.populations.iter().find(|p| p.is_initial_population()) {
                Some(population) => {
                    for patient in &cohort.patients {
                        if initial.contains_key(patient) {
                            continue;
                        }
                        let value = self
                            .evaluate_for(context, patient, &population.criteria, &mut report)
                            .await?;
                        if let Some(value) = value.filter(ExpressionValue::is_truthy) {
                            initial.insert(patient.clone(), value);
                        }
                    }
                }
                None => {
                    for patient in &cohort.patients {
                        initial.insert(patient.clone(), ExpressionValue::Boolean(true));
                    }
                }
            }

            let mut populations = Vec::with_capacity(group.populations.len());
            for population in &group.populations {
                let mut count = 0;
                for (patient, initial_value) in &initial {
                    let value = if population.is_initial_population() {
                        Some(initial_value.clone())
                    } else {
                        self.evaluate_for(context, patient, &population.criteria, &mut report)
                            .await?
                    };
                    if let Some(value) = value {
                        count += tally(&value, &mut report.evaluated_resources);
                    }
                }
                populations.push(PopulationReport {
                    code: population.code.clone(),
                    identifier: population.identifier.clone(),
                    count,
                });
            }
            report.groups.push(GroupReport {
                identifier: group.identifier.clone(),
                populations,
            });
        }

        context.clear_subject();
        Ok(report)
    }

    /// Evaluates `expression` for one patient. `Ok(None)` for a null result
    /// or for a fault recorded under the continue policy.
    async fn evaluate_for(
        &self,
        context: &mut EvaluationContext,
        patient: &str,
        expression: &str,
        report: &mut MeasureReport,
    ) -> CqfResult<Option<ExpressionValue>> {
        context.set_subject(patient);
        match self.engine.evaluate(context, expression).await {
            Ok(ExpressionValue::Null) => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(e) => match self.failure_policy {
                FailurePolicy::Abort => Err(CqfError::InternalError(format!(
                    "Failed to evaluate '{expression}' for Patient/{patient}: {e:#}"
                ))),
                FailurePolicy::Continue => {
                    tracing::warn!(patient, expression, error = %e, "Skipping subject after evaluation failure");
                    report.errors.push(SubjectError {
                        subject: patient.to_string(),
                        expression: expression.to_string(),
                        message: format!("{e:#}"),
                    });
                    Ok(None)
                }
            },
        }
    }

    fn pool(&self, resource_type: &str) -> CqfResult<DynPool> {
        self.pools.resolve(resource_type).ok_or_else(|| {
            CqfError::NotFound(format!("Could not find resource pool for type: {resource_type}"))
        })
    }
}

/// Contribution of one subject's result to a population count. List results
/// count every element and record the resources they hold.
fn tally(value: &ExpressionValue, evaluated: &mut IndexMap<String, Value>) -> usize {
    match value {
        ExpressionValue::Boolean(b) => usize::from(*b),
        ExpressionValue::List(items) => {
            for item in items {
                if let ExpressionValue::Resource(resource) = item
                    && let Some(identity) = resource_identity(resource)
                {
                    evaluated
                        .entry(identity)
                        .or_insert_with(|| resource.clone());
                }
            }
            items.len()
        }
        _ => 0,
    }
}
