//! Keyed vector collections for semantic retrieval.
//!
//! Collections are split by semantic class (manual, regulation, AMC, GM,
//! evidence). The store validates vector dimensions against each
//! collection's established dimension, supports metadata-filtered
//! similarity queries, and treats a missing collection as an empty result
//! rather than an error. Writes happen only in the embedding job; the
//! audit runner reads.

mod memory;
mod sqlite;

pub use memory::InMemoryVectorStore;
pub use sqlite::SqliteVectorStore;

use serde_json::Value;

use crate::error::Result;

/// Collection of manual chunks.
pub const MANUAL_COLLECTION: &str = "manual_chunks";
/// Collection of regulation chunks.
pub const REGULATION_COLLECTION: &str = "regulation_chunks";
/// Collection of Acceptable Means of Compliance chunks.
pub const AMC_COLLECTION: &str = "amc_chunks";
/// Collection of Guidance Material chunks.
pub const GM_COLLECTION: &str = "gm_chunks";
/// Collection of evidence and case material chunks.
pub const EVIDENCE_COLLECTION: &str = "evidence_chunks";

/// All known collection names.
pub const ALL_COLLECTIONS: [&str; 5] = [
    MANUAL_COLLECTION,
    REGULATION_COLLECTION,
    AMC_COLLECTION,
    GM_COLLECTION,
    EVIDENCE_COLLECTION,
];

/// One record in a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    /// Record id (the chunk's external id).
    pub id: String,
    /// Embedding vector.
    pub embedding: Vec<f32>,
    /// The embedded text.
    pub document_text: String,
    /// Metadata map; carries `chunk_id` and `document_id` back-references.
    pub metadata: Value,
}

/// One similarity match. Distance is Euclidean-like: smaller is better.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    /// Record id.
    pub id: String,
    /// The matched text.
    pub document_text: String,
    /// Metadata map.
    pub metadata: Value,
    /// Squared L2 distance to the query vector.
    pub distance: f32,
}

/// An AND of equality predicates on record metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    clauses: Vec<(String, Value)>,
}

impl MetadataFilter {
    /// Creates an empty filter (matches everything).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            clauses: Vec::new(),
        }
    }

    /// Filter to a single owning document.
    #[must_use]
    pub fn document(document_id: i64) -> Self {
        Self::new().equals("document_id", Value::from(document_id))
    }

    /// Adds an equality clause.
    #[must_use]
    pub fn equals(mut self, key: impl Into<String>, value: Value) -> Self {
        self.clauses.push((key.into(), value));
        self
    }

    /// Whether the metadata satisfies every clause.
    #[must_use]
    pub fn matches(&self, metadata: &Value) -> bool {
        self.clauses
            .iter()
            .all(|(key, expected)| metadata.get(key) == Some(expected))
    }

    /// Whether the filter has no clauses.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

/// Persistent keyed vector collections.
///
/// Implementations guard their own interior state; methods take `&self`
/// so one store can be shared across the runner and the scheduler.
pub trait VectorStore: Send + Sync {
    /// Inserts or replaces records. Every vector must match the
    /// collection's established dimension; a mismatch fails the whole
    /// batch with [`crate::error::EmbeddingError::DimensionMismatch`].
    fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<()>;

    /// Returns the `top_k` nearest records by squared L2 distance,
    /// smallest first, restricted by the metadata filter. A missing
    /// collection yields an empty result.
    fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<VectorMatch>>;

    /// Returns one record, used to discover the collection's established
    /// dimension. `None` when the collection is missing or empty.
    fn peek(&self, collection: &str) -> Result<Option<VectorRecord>>;

    /// The collection's established dimension, if any record exists.
    fn dimension(&self, collection: &str) -> Result<Option<usize>> {
        Ok(self.peek(collection)?.map(|record| record.embedding.len()))
    }
}

/// Squared Euclidean distance between two vectors of equal length.
#[must_use]
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_squared_l2() {
        let a = [0.0, 0.0];
        let b = [3.0, 4.0];
        assert!((squared_l2(&a, &b) - 25.0).abs() < f32::EPSILON);
        assert!(squared_l2(&a, &a).abs() < f32::EPSILON);
    }

    #[test]
    fn test_filter_empty_matches_everything() {
        let filter = MetadataFilter::new();
        assert!(filter.matches(&json!({"document_id": 1})));
        assert!(filter.matches(&json!({})));
    }

    #[test]
    fn test_filter_document() {
        let filter = MetadataFilter::document(7);
        assert!(filter.matches(&json!({"document_id": 7, "other": "x"})));
        assert!(!filter.matches(&json!({"document_id": 8})));
        assert!(!filter.matches(&json!({})));
    }

    #[test]
    fn test_filter_conjunction() {
        let filter = MetadataFilter::document(1).equals("source", json!("manual"));
        assert!(filter.matches(&json!({"document_id": 1, "source": "manual"})));
        assert!(!filter.matches(&json!({"document_id": 1, "source": "gm"})));
    }
}
