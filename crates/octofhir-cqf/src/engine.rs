//! Boundary to the expression engine.
//!
//! The engine itself lives outside this crate. It receives an
//! [`EvaluationContext`] carrying the primary library, parameter bindings, the
//! current subject and the data and terminology sources, and answers named
//! expressions with an [`ExpressionValue`].

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use time::OffsetDateTime;

use crate::data_provider::RetrieveTranslator;
use crate::library_cache::{CompiledLibrary, LibraryCache};
use crate::terminology_provider::TerminologyProvider;

/// Name of the parameter every measure library receives.
pub const MEASUREMENT_PERIOD: &str = "Measurement Period";

/// Result of evaluating one expression for one subject.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionValue {
    Null,
    Boolean(bool),
    List(Vec<ExpressionValue>),
    /// A clinical record.
    Resource(Value),
    /// Any other scalar or structured value.
    Other(Value),
}

impl ExpressionValue {
    /// `true` for boolean true and for non-empty lists.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Boolean(b) => *b,
            Self::List(items) => !items.is_empty(),
            _ => false,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// `Type/id` identity of a record, if it carries both.
pub fn resource_identity(resource: &Value) -> Option<String> {
    let resource_type = resource.get("resourceType").and_then(Value::as_str)?;
    let id = resource.get("id").and_then(Value::as_str)?;
    Some(format!("{resource_type}/{id}"))
}

/// A date-time interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub low: OffsetDateTime,
    pub high: OffsetDateTime,
    pub low_closed: bool,
    pub high_closed: bool,
}

impl Interval {
    pub fn closed(low: OffsetDateTime, high: OffsetDateTime) -> Self {
        Self {
            low,
            high,
            low_closed: true,
            high_closed: true,
        }
    }

    pub fn contains(&self, instant: OffsetDateTime) -> bool {
        let above = if self.low_closed { instant >= self.low } else { instant > self.low };
        let below = if self.high_closed { instant <= self.high } else { instant < self.high };
        above && below
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Interval(Interval),
    Value(Value),
}

/// Everything the engine needs to evaluate expressions of one run.
pub struct EvaluationContext {
    library: Arc<CompiledLibrary>,
    parameters: IndexMap<String, ParameterValue>,
    subject: Option<String>,
    data: RetrieveTranslator,
    terminology: Arc<dyn TerminologyProvider>,
    libraries: Arc<LibraryCache>,
}

impl EvaluationContext {
    pub fn new(
        library: Arc<CompiledLibrary>,
        data: RetrieveTranslator,
        libraries: Arc<LibraryCache>,
    ) -> Self {
        let terminology = data.terminology().clone();
        Self {
            library,
            parameters: IndexMap::new(),
            subject: None,
            data,
            terminology,
            libraries,
        }
    }

    pub fn set_parameter(&mut self, name: impl Into<String>, value: ParameterValue) {
        self.parameters.insert(name.into(), value);
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterValue> {
        self.parameters.get(name)
    }

    pub fn measurement_period(&self) -> Option<Interval> {
        match self.parameters.get(MEASUREMENT_PERIOD) {
            Some(ParameterValue::Interval(interval)) => Some(*interval),
            _ => None,
        }
    }

    /// Binds the patient context for subsequent evaluations.
    pub fn set_subject(&mut self, patient_id: impl Into<String>) {
        self.subject = Some(patient_id.into());
    }

    pub fn clear_subject(&mut self) {
        self.subject = None;
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn library(&self) -> &Arc<CompiledLibrary> {
        &self.library
    }

    /// Retrieve source, already bound to this run's terminology.
    pub fn data(&self) -> &RetrieveTranslator {
        &self.data
    }

    pub fn terminology(&self) -> &Arc<dyn TerminologyProvider> {
        &self.terminology
    }

    /// Resolves included libraries by alias.
    pub fn libraries(&self) -> &Arc<LibraryCache> {
        &self.libraries
    }
}

/// Evaluates named expressions of the context's library.
///
/// `expression` is either a statement name of the primary library or
/// `Alias.Statement` for a statement of an included library.
#[async_trait]
pub trait ExpressionEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        context: &EvaluationContext,
        expression: &str,
    ) -> anyhow::Result<ExpressionValue>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[test]
    fn test_truthiness() {
        assert!(ExpressionValue::Boolean(true).is_truthy());
        assert!(!ExpressionValue::Boolean(false).is_truthy());
        assert!(!ExpressionValue::Null.is_truthy());
        assert!(!ExpressionValue::List(vec![]).is_truthy());
        assert!(ExpressionValue::List(vec![ExpressionValue::Null]).is_truthy());
        assert!(!ExpressionValue::Other(json!(1)).is_truthy());
    }

    #[test]
    fn test_resource_identity() {
        assert_eq!(
            resource_identity(&json!({"resourceType": "Encounter", "id": "e1"})).as_deref(),
            Some("Encounter/e1")
        );
        assert!(resource_identity(&json!({"resourceType": "Encounter"})).is_none());
    }

    #[test]
    fn test_interval_bounds() {
        let closed = Interval::closed(
            datetime!(2024-01-01 00:00:00 UTC),
            datetime!(2024-12-31 23:59:59 UTC),
        );
        assert!(closed.contains(datetime!(2024-01-01 00:00:00 UTC)));
        let open = Interval {
            low_closed: false,
            ..closed
        };
        assert!(!open.contains(datetime!(2024-01-01 00:00:00 UTC)));
    }
}
