//! Backend-agnostic query descriptors.
//!
//! A [`SearchQuery`] is a conjunction of [`SearchFilter`]s. Each filter names a
//! search parameter and carries either an OR-list of tokens, an OR-list of
//! references, or an inclusive date window. Backends translate the descriptor
//! into whatever their engine understands; [`SearchQuery::to_query_pairs`]
//! renders the REST form for logging and HTTP-backed pools.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// A coded value used in token filters (`system|code`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token {
    pub system: Option<String>,
    pub code: String,
}

impl Token {
    pub fn new(system: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            code: code.into(),
        }
    }

    pub fn code_only(code: impl Into<String>) -> Self {
        Self {
            system: None,
            code: code.into(),
        }
    }

    /// Renders the token in REST search syntax.
    pub fn to_param_value(&self) -> String {
        match &self.system {
            Some(system) => format!("{}|{}", system, self.code),
            None => self.code.clone(),
        }
    }
}

/// An inclusive date window. Either side may be open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DateBounds {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub lower: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub upper: Option<OffsetDateTime>,
}

impl DateBounds {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn at_least(lower: OffsetDateTime) -> Self {
        Self {
            lower: Some(lower),
            upper: None,
        }
    }

    pub fn at_most(upper: OffsetDateTime) -> Self {
        Self {
            lower: None,
            upper: Some(upper),
        }
    }

    pub fn between(lower: OffsetDateTime, upper: OffsetDateTime) -> Self {
        Self {
            lower: Some(lower),
            upper: Some(upper),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }

    pub fn contains(&self, instant: OffsetDateTime) -> bool {
        if let Some(lower) = self.lower
            && instant < lower
        {
            return false;
        }
        if let Some(upper) = self.upper
            && instant > upper
        {
            return false;
        }
        true
    }

    fn to_param_values(self) -> Vec<String> {
        let mut values = Vec::new();
        if let Some(lower) = self.lower.and_then(|d| d.format(&Rfc3339).ok()) {
            values.push(format!("ge{lower}"));
        }
        if let Some(upper) = self.upper.and_then(|d| d.format(&Rfc3339).ok()) {
            values.push(format!("le{upper}"));
        }
        values
    }
}

/// The value side of a filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterValue {
    /// Matches when any token matches.
    AnyToken { tokens: Vec<Token> },
    /// Matches when the parameter references any of the given targets.
    AnyReference { references: Vec<String> },
    /// Matches when the parameter's date falls inside the window.
    Date { bounds: DateBounds },
}

/// A single named filter. Filters in a query are AND-combined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub param: String,
    pub value: FilterValue,
}

/// Query descriptor handed to [`crate::ResourcePool::search`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub filters: Vec<SearchFilter>,
    /// Window on the record's last-updated instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateBounds>,
    /// Maximum number of rows to return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

impl SearchQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_filter(mut self, filter: SearchFilter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn with_tokens(self, param: impl Into<String>, tokens: Vec<Token>) -> Self {
        self.with_filter(SearchFilter {
            param: param.into(),
            value: FilterValue::AnyToken { tokens },
        })
    }

    #[must_use]
    pub fn with_references(self, param: impl Into<String>, references: Vec<String>) -> Self {
        self.with_filter(SearchFilter {
            param: param.into(),
            value: FilterValue::AnyReference { references },
        })
    }

    #[must_use]
    pub fn with_date(self, param: impl Into<String>, bounds: DateBounds) -> Self {
        self.with_filter(SearchFilter {
            param: param.into(),
            value: FilterValue::Date { bounds },
        })
    }

    #[must_use]
    pub fn with_last_updated(mut self, bounds: DateBounds) -> Self {
        self.last_updated = Some(bounds);
        self
    }

    #[must_use]
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    /// First filter on the given parameter, if any.
    pub fn filter(&self, param: &str) -> Option<&SearchFilter> {
        self.filters.iter().find(|f| f.param == param)
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty() && self.last_updated.is_none()
    }

    /// Renders the descriptor as REST search pairs, e.g.
    /// `code=http://snomed.info/sct|44054006,http://loinc.org|1234-5`.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for filter in &self.filters {
            match &filter.value {
                FilterValue::AnyToken { tokens } => {
                    let joined = tokens
                        .iter()
                        .map(Token::to_param_value)
                        .collect::<Vec<_>>()
                        .join(",");
                    pairs.push((filter.param.clone(), joined));
                }
                FilterValue::AnyReference { references } => {
                    pairs.push((filter.param.clone(), references.join(",")));
                }
                FilterValue::Date { bounds } => {
                    for value in bounds.to_param_values() {
                        pairs.push((filter.param.clone(), value));
                    }
                }
            }
        }
        if let Some(bounds) = self.last_updated {
            for value in bounds.to_param_values() {
                pairs.push(("_lastUpdated".to_string(), value));
            }
        }
        if let Some(count) = self.count {
            pairs.push(("_count".to_string(), count.to_string()));
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_token_param_value() {
        assert_eq!(
            Token::new("http://snomed.info/sct", "44054006").to_param_value(),
            "http://snomed.info/sct|44054006"
        );
        assert_eq!(Token::code_only("final").to_param_value(), "final");
    }

    #[test]
    fn test_date_bounds_contains() {
        let bounds = DateBounds::between(
            datetime!(2024-01-01 00:00:00 UTC),
            datetime!(2024-12-31 23:59:59 UTC),
        );
        assert!(bounds.contains(datetime!(2024-06-01 12:00:00 UTC)));
        assert!(bounds.contains(datetime!(2024-01-01 00:00:00 UTC)));
        assert!(!bounds.contains(datetime!(2025-01-01 00:00:00 UTC)));

        let open = DateBounds::at_least(datetime!(2024-01-01 00:00:00 UTC));
        assert!(open.contains(datetime!(2099-01-01 00:00:00 UTC)));
        assert!(DateBounds::unbounded().is_unbounded());
    }

    #[test]
    fn test_query_pairs() {
        let query = SearchQuery::new()
            .with_references("subject", vec!["Patient/1".into(), "Patient/2".into()])
            .with_tokens(
                "code",
                vec![
                    Token::new("http://snomed.info/sct", "1"),
                    Token::new("http://snomed.info/sct", "2"),
                ],
            )
            .with_date("date", DateBounds::at_most(datetime!(2024-12-31 23:59:59 UTC)))
            .with_count(10);

        let pairs = query.to_query_pairs();
        assert_eq!(
            pairs,
            vec![
                ("subject".to_string(), "Patient/1,Patient/2".to_string()),
                (
                    "code".to_string(),
                    "http://snomed.info/sct|1,http://snomed.info/sct|2".to_string()
                ),
                ("date".to_string(), "le2024-12-31T23:59:59Z".to_string()),
                ("_count".to_string(), "10".to_string()),
            ]
        );
    }

    #[test]
    fn test_filter_lookup() {
        let query = SearchQuery::new().with_tokens("code", vec![Token::code_only("x")]);
        assert!(query.filter("code").is_some());
        assert!(query.filter("subject").is_none());
        assert!(!query.is_empty());
        assert!(SearchQuery::new().is_empty());
    }
}
