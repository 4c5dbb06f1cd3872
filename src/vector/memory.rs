//! Deterministic in-memory vector store.
//!
//! Used in tests and for ephemeral runs. Query results are fully
//! deterministic: ties on distance break by record id.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::{EmbeddingError, Result};
use crate::vector::{MetadataFilter, VectorMatch, VectorRecord, VectorStore, squared_l2};

/// In-memory vector store keyed by collection name.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<BTreeMap<String, BTreeMap<String, VectorRecord>>>,
}

impl InMemoryVectorStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a collection.
    #[must_use]
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .map(|guard| guard.get(collection).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    /// Whether a collection has no records.
    #[must_use]
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

impl VectorStore for InMemoryVectorStore {
    fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut guard = self
            .collections
            .write()
            .map_err(|e| EmbeddingError::Store(e.to_string()))?;
        let entries = guard.entry(collection.to_string()).or_default();

        let established = entries
            .values()
            .next()
            .map(|record| record.embedding.len());
        let expected = established.unwrap_or_else(|| {
            records
                .first()
                .map_or(0, |record| record.embedding.len())
        });

        // Validate the whole batch before touching the collection.
        for record in records {
            if record.embedding.len() != expected {
                return Err(EmbeddingError::DimensionMismatch {
                    collection: collection.to_string(),
                    expected,
                    actual: record.embedding.len(),
                }
                .into());
            }
        }

        for record in records {
            entries.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<VectorMatch>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let guard = self
            .collections
            .read()
            .map_err(|e| EmbeddingError::Store(e.to_string()))?;
        let Some(entries) = guard.get(collection) else {
            return Ok(Vec::new());
        };

        let mut matches: Vec<VectorMatch> = entries
            .values()
            .filter(|record| filter.is_none_or(|f| f.matches(&record.metadata)))
            .filter(|record| record.embedding.len() == embedding.len())
            .map(|record| VectorMatch {
                id: record.id.clone(),
                document_text: record.document_text.clone(),
                metadata: record.metadata.clone(),
                distance: squared_l2(&record.embedding, embedding),
            })
            .collect();

        matches.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    fn peek(&self, collection: &str) -> Result<Option<VectorRecord>> {
        let guard = self
            .collections
            .read()
            .map_err(|e| EmbeddingError::Store(e.to_string()))?;
        Ok(guard
            .get(collection)
            .and_then(|entries| entries.values().next().cloned()))
    }
}
