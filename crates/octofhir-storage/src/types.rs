//! Stored resource and search result types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// A clinical record as held by a resource pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResource {
    /// The resource ID.
    pub id: String,
    /// The version ID of this specific version.
    pub version_id: String,
    /// The resource type (e.g., "Patient", "Observation").
    pub resource_type: String,
    /// The full resource content as JSON.
    pub resource: Value,
    /// When this version was last updated.
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

impl StoredResource {
    /// Creates a new `StoredResource` stamped with the current time.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        version_id: impl Into<String>,
        resource_type: impl Into<String>,
        resource: Value,
    ) -> Self {
        Self {
            id: id.into(),
            version_id: version_id.into(),
            resource_type: resource_type.into(),
            resource,
            last_updated: OffsetDateTime::now_utc(),
        }
    }

    /// Overrides the last-updated instant.
    #[must_use]
    pub fn with_last_updated(mut self, last_updated: OffsetDateTime) -> Self {
        self.last_updated = last_updated;
        self
    }

    /// Relative reference (`Type/id`), used as the record identity.
    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}

/// Result of a search operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResult {
    /// The matching resources.
    pub entries: Vec<StoredResource>,
    /// Total count of matching resources before the row cap was applied.
    pub total: Option<u32>,
    /// Whether the row cap cut the result short.
    pub has_more: bool,
}

impl SearchResult {
    /// Creates a new empty `SearchResult`.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a new `SearchResult` with entries.
    #[must_use]
    pub fn with_entries(entries: Vec<StoredResource>) -> Self {
        Self {
            entries,
            total: None,
            has_more: false,
        }
    }

    /// Returns the number of entries in this result.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consumes the result and returns the raw resource bodies.
    #[must_use]
    pub fn into_resources(self) -> Vec<Value> {
        self.entries.into_iter().map(|entry| entry.resource).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_resource_reference() {
        let resource = StoredResource::new(
            "123",
            "1",
            "Patient",
            serde_json::json!({"resourceType": "Patient", "id": "123"}),
        );
        assert_eq!(resource.reference(), "Patient/123");
    }

    #[test]
    fn test_search_result_into_resources() {
        let result = SearchResult::with_entries(vec![StoredResource::new(
            "o1",
            "1",
            "Observation",
            serde_json::json!({"resourceType": "Observation", "id": "o1"}),
        )]);

        assert_eq!(result.len(), 1);
        let resources = result.into_resources();
        assert_eq!(resources[0]["id"], "o1");
        assert!(SearchResult::empty().is_empty());
    }
}
