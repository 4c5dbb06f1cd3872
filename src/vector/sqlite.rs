//! SQLite-backed vector store.
//!
//! Embeddings are stored as little-endian f32 BLOBs in a single records
//! table keyed by `(collection, id)`, with per-collection dimensions
//! tracked in a `collections` table. Similarity queries scan the
//! collection and rank by squared L2 distance.

// SQLite stores all integers as i64. These casts are intentional and safe
// because we only store non-negative values that fit in usize.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{EmbeddingError, Result};
use crate::vector::{MetadataFilter, VectorMatch, VectorRecord, VectorStore, squared_l2};

const VECTOR_SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    dimensions INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS vector_records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    embedding BLOB NOT NULL,
    document_text TEXT NOT NULL,
    metadata TEXT NOT NULL,
    PRIMARY KEY (collection, id)
);

CREATE INDEX IF NOT EXISTS idx_vector_records_collection ON vector_records(collection);
";

/// SQLite-backed vector store.
pub struct SqliteVectorStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteVectorStore {
    /// Opens or creates the vector database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error when the database cannot be opened or the schema
    /// cannot be created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| EmbeddingError::Store(e.to_string()))?;
            }
        }
        let conn = Connection::open(&path).map_err(|e| EmbeddingError::Store(e.to_string()))?;
        Self::prepare(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    /// Creates an in-memory vector database.
    ///
    /// # Errors
    ///
    /// Returns an error when the database cannot be created.
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| EmbeddingError::Store(e.to_string()))?;
        Self::prepare(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Returns the database path (`None` for in-memory).
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn prepare(conn: &Connection) -> Result<()> {
        conn.execute_batch(VECTOR_SCHEMA_SQL)
            .map_err(|e| EmbeddingError::Store(e.to_string()))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| EmbeddingError::Store(e.to_string()).into())
    }
}

/// Encodes an embedding as little-endian f32 bytes.
fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decodes little-endian f32 bytes back into an embedding.
fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

impl VectorStore for SqliteVectorStore {
    fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;

        let established: Option<i64> = conn
            .query_row(
                "SELECT dimensions FROM collections WHERE name = ?",
                params![collection],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| EmbeddingError::Store(e.to_string()))?;

        let expected = established.map_or_else(
            || records.first().map_or(0, |record| record.embedding.len()),
            |dims| dims as usize,
        );

        // Validate the whole batch before writing anything.
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

        let tx = conn
            .transaction()
            .map_err(|e| EmbeddingError::Store(e.to_string()))?;
        tx.execute(
            "INSERT OR IGNORE INTO collections (name, dimensions) VALUES (?, ?)",
            params![collection, expected as i64],
        )
        .map_err(|e| EmbeddingError::Store(e.to_string()))?;
        for record in records {
            tx.execute(
                r"
                INSERT OR REPLACE INTO vector_records
                    (collection, id, embedding, document_text, metadata)
                VALUES (?, ?, ?, ?, ?)
                ",
                params![
                    collection,
                    record.id,
                    encode_embedding(&record.embedding),
                    record.document_text,
                    record.metadata.to_string(),
                ],
            )
            .map_err(|e| EmbeddingError::Store(e.to_string()))?;
        }
        tx.commit()
            .map_err(|e| EmbeddingError::Store(e.to_string()))?;
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
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, embedding, document_text, metadata FROM vector_records
                 WHERE collection = ? ORDER BY id",
            )
            .map_err(|e| EmbeddingError::Store(e.to_string()))?;

        let rows = stmt
            .query_map(params![collection], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|e| EmbeddingError::Store(e.to_string()))?;

        let mut matches: Vec<VectorMatch> = Vec::new();
        for row in rows {
            let (id, embedding_bytes, document_text, metadata_json) =
                row.map_err(|e| EmbeddingError::Store(e.to_string()))?;
            let record_embedding = decode_embedding(&embedding_bytes);
            if record_embedding.len() != embedding.len() {
                continue;
            }
            let metadata: serde_json::Value =
                serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null);
            if let Some(f) = filter {
                if !f.matches(&metadata) {
                    continue;
                }
            }
            matches.push(VectorMatch {
                id,
                document_text,
                metadata,
                distance: squared_l2(&record_embedding, embedding),
            });
        }

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
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT id, embedding, document_text, metadata FROM vector_records
                 WHERE collection = ? ORDER BY id LIMIT 1",
                params![collection],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| EmbeddingError::Store(e.to_string()))?;

        Ok(record.map(|(id, bytes, document_text, metadata_json)| VectorRecord {
            id,
            embedding: decode_embedding(&bytes),
            document_text,
            metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, embedding: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            embedding,
            document_text: format!("text {id}"),
            metadata: json!({"chunk_id": id, "document_id": 1}),
        }
    }

    #[test]
    fn test_embedding_codec_round_trip() {
        let embedding = vec![0.0, -1.5, 3.25, f32::MIN_POSITIVE];
        let decoded = decode_embedding(&encode_embedding(&embedding));
        assert_eq!(decoded, embedding);
    }

    #[test]
    fn test_upsert_and_query() {
        let store = SqliteVectorStore::in_memory().unwrap();
        store
            .upsert(
                "regulation_chunks",
                &[
                    record("r1", vec![0.0, 1.0]),
                    record("r2", vec![0.0, 5.0]),
                ],
            )
            .unwrap();

        let matches = store
            .query("regulation_chunks", &[0.0, 0.0], 1, None)
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "r1");
    }

    #[test]
    fn test_missing_collection_empty() {
        let store = SqliteVectorStore::in_memory().unwrap();
        assert!(store.query("gm_chunks", &[1.0], 5, None).unwrap().is_empty());
        assert!(store.peek("gm_chunks").unwrap().is_none());
    }

    #[test]
    fn test_dimension_established_on_first_upsert() {
        let store = SqliteVectorStore::in_memory().unwrap();
        store
            .upsert("manual_chunks", &[record("a", vec![0.0; 8])])
            .unwrap();
        assert_eq!(store.dimension("manual_chunks").unwrap(), Some(8));

        let result = store.upsert("manual_chunks", &[record("b", vec![0.0; 16])]);
        assert!(result.is_err());
    }

    #[test]
    fn test_filtered_query() {
        let store = SqliteVectorStore::in_memory().unwrap();
        let mut other = record("other", vec![0.0, 0.0]);
        other.metadata = json!({"chunk_id": "other", "document_id": 2});
        store
            .upsert(
                "manual_chunks",
                &[record("mine", vec![0.0, 0.0]), other],
            )
            .unwrap();

        let filter = MetadataFilter::document(1);
        let matches = store
            .query("manual_chunks", &[0.0, 0.0], 10, Some(&filter))
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "mine");
    }

    #[test]
    fn test_persistence_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.db");
        {
            let store = SqliteVectorStore::open(&path).unwrap();
            store
                .upsert("manual_chunks", &[record("a", vec![1.0, 2.0])])
                .unwrap();
        }
        let store = SqliteVectorStore::open(&path).unwrap();
        let peeked = store.peek("manual_chunks").unwrap().unwrap();
        assert_eq!(peeked.id, "a");
        assert_eq!(peeked.embedding, vec![1.0, 2.0]);
    }
}
