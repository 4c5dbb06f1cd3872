//! `SQLite` storage implementation.
//!
//! Provides persistent storage using `SQLite` with proper transaction
//! management and migration support.

// SQLite stores all integers as i64. These casts are intentional and safe
// because we only store non-negative values that fit in usize.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::{Path, PathBuf};

use crate::core::{
    Audit, AuditChunkResult, AuditStatus, AuditorQuestion, Citation, CitationKind, ChunkMetadata,
    ChunkPayload, ChunkRecord, ComplianceScore, Document, DocumentStatus, EmbeddingStatus, Flag,
    FlagClass, SourceClass,
};
use crate::core::chunk::render_section_path;
use crate::error::{Result, StorageError};
use crate::storage::schema::{
    CHECK_SCHEMA_SQL, CURRENT_SCHEMA_VERSION, GET_VERSION_SQL, SCHEMA_SQL, SET_VERSION_SQL,
};
use crate::storage::traits::Storage;

/// Cap applied to score history queries.
const SCORE_HISTORY_MAX_LIMIT: usize = 100;

/// SQLite-based storage implementation.
///
/// Provides persistent storage for engine state with full ACID guarantees.
pub struct SqliteStorage {
    /// `SQLite` connection.
    conn: Connection,
    /// Path to the database file (None for in-memory).
    path: Option<PathBuf>,
}

impl SqliteStorage {
    /// Opens or creates a `SQLite` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Database(e.to_string()))?;
            }
        }

        let conn = Connection::open(&path).map_err(StorageError::from)?;

        conn.execute("PRAGMA foreign_keys = ON;", [])
            .map_err(StorageError::from)?;

        // WAL mode for better concurrent access (returns result, use query_row)
        let _: String = conn
            .query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))
            .map_err(StorageError::from)?;

        Ok(Self {
            conn,
            path: Some(path),
        })
    }

    /// Creates an in-memory `SQLite` database.
    ///
    /// Useful for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(StorageError::from)?;
        conn.execute("PRAGMA foreign_keys = ON;", [])
            .map_err(StorageError::from)?;

        Ok(Self { conn, path: None })
    }

    /// Returns the database path (None for in-memory).
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn get_schema_version(&self) -> Result<Option<u32>> {
        let version: Option<String> = self
            .conn
            .query_row(GET_VERSION_SQL, [], |row| row.get(0))
            .optional()
            .map_err(StorageError::from)?;
        Ok(version.and_then(|v| v.parse().ok()))
    }

    fn set_schema_version(&self, version: u32) -> Result<()> {
        self.conn
            .execute(SET_VERSION_SQL, params![version.to_string()])
            .map_err(StorageError::from)?;
        Ok(())
    }

    fn now_text() -> String {
        Utc::now().to_rfc3339()
    }
}

fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_json_list(value: Option<String>) -> Vec<String> {
    value
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}

fn parse_id_list(value: Option<String>) -> Vec<i64> {
    value
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}

fn bad_enum(column: &str, value: &str) -> StorageError {
    StorageError::Serialization(format!("unknown {column} value: {value}"))
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<(Document, String, String)> {
    let source_raw: String = row.get(6)?;
    let status_raw: String = row.get(8)?;
    let document = Document {
        id: Some(row.get::<_, i64>(0)?),
        external_id: row.get(1)?,
        original_filename: row.get(2)?,
        storage_path: row.get(3)?,
        size_bytes: row.get(4)?,
        sha256: row.get(5)?,
        source_class: SourceClass::Manual, // patched by caller
        organization: row.get(7)?,
        status: DocumentStatus::Uploaded, // patched by caller
    };
    Ok((document, source_raw, status_raw))
}

fn finish_document(parts: (Document, String, String)) -> Result<Document> {
    let (mut document, source_raw, status_raw) = parts;
    document.source_class =
        SourceClass::parse(&source_raw).ok_or_else(|| bad_enum("source_type", &source_raw))?;
    document.status =
        DocumentStatus::parse(&status_raw).ok_or_else(|| bad_enum("status", &status_raw))?;
    Ok(document)
}

const DOCUMENT_COLUMNS: &str = "id, external_id, original_filename, storage_path, size_bytes, \
     sha256, source_type, organization, status";

const CHUNK_COLUMNS: &str = "id, document_id, chunk_id, chunk_index, section_path, \
     parent_heading, content, token_count, chunk_metadata, embedding_status";

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<(ChunkRecord, String)> {
    let metadata_raw: Option<String> = row.get(8)?;
    let status_raw: String = row.get(9)?;
    let metadata: ChunkMetadata = metadata_raw
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    let record = ChunkRecord {
        id: Some(row.get::<_, i64>(0)?),
        document_id: row.get(1)?,
        chunk_id: row.get(2)?,
        chunk_index: row.get(3)?,
        section_path: row.get(4)?,
        parent_heading: row.get(5)?,
        content: row.get(6)?,
        token_count: row.get(7)?,
        metadata,
        embedding_status: EmbeddingStatus::Pending, // patched by caller
    };
    Ok((record, status_raw))
}

fn finish_chunk(parts: (ChunkRecord, String)) -> Result<ChunkRecord> {
    let (mut record, status_raw) = parts;
    record.embedding_status = EmbeddingStatus::parse(&status_raw)
        .ok_or_else(|| bad_enum("embedding_status", &status_raw))?;
    Ok(record)
}

const AUDIT_COLUMNS: &str = "id, external_id, document_id, status, is_draft, chunk_total, \
     chunk_completed, last_chunk_id, started_at, completed_at, failed_at, failure_reason";

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<(Audit, String)> {
    let status_raw: String = row.get(3)?;
    let audit = Audit {
        id: Some(row.get::<_, i64>(0)?),
        external_id: row.get(1)?,
        document_id: row.get(2)?,
        status: AuditStatus::Queued, // patched by caller
        is_draft: row.get::<_, i64>(4)? != 0,
        chunk_total: row.get(5)?,
        chunk_completed: row.get(6)?,
        last_chunk_id: row.get(7)?,
        started_at: parse_timestamp(row.get(8)?),
        completed_at: parse_timestamp(row.get(9)?),
        failed_at: parse_timestamp(row.get(10)?),
        failure_reason: row.get(11)?,
    };
    Ok((audit, status_raw))
}

fn finish_audit(parts: (Audit, String)) -> Result<Audit> {
    let (mut audit, status_raw) = parts;
    audit.status =
        AuditStatus::parse(&status_raw).ok_or_else(|| bad_enum("status", &status_raw))?;
    Ok(audit)
}

const FLAG_COLUMNS: &str =
    "id, audit_id, chunk_id, flag_type, severity_score, findings, gaps, recommendations, \
     analysis_metadata, created_at";

fn flag_from_row(row: &Row<'_>) -> rusqlite::Result<(Flag, String)> {
    let class_raw: String = row.get(3)?;
    let analysis_metadata = row
        .get::<_, Option<String>>(8)?
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or(serde_json::Value::Null);
    let flag = Flag {
        id: Some(row.get::<_, i64>(0)?),
        audit_id: row.get(1)?,
        chunk_id: row.get(2)?,
        class: FlagClass::Green, // patched by caller
        severity_score: row.get(4)?,
        findings: row.get(5)?,
        gaps: parse_json_list(row.get(6)?),
        recommendations: parse_json_list(row.get(7)?),
        analysis_metadata,
        created_at: parse_timestamp(row.get(9)?).unwrap_or_else(Utc::now),
    };
    Ok((flag, class_raw))
}

fn finish_flag(parts: (Flag, String)) -> Result<Flag> {
    let (mut flag, class_raw) = parts;
    flag.class =
        FlagClass::parse(&class_raw).ok_or_else(|| bad_enum("flag_type", &class_raw))?;
    Ok(flag)
}

const SCORE_COLUMNS: &str = "id, audit_id, overall_score, red_count, yellow_count, green_count, \
     total_flags, created_at";

fn score_from_row(row: &Row<'_>) -> rusqlite::Result<ComplianceScore> {
    Ok(ComplianceScore {
        id: Some(row.get::<_, i64>(0)?),
        audit_id: row.get(1)?,
        overall_score: row.get(2)?,
        red_count: row.get(3)?,
        yellow_count: row.get(4)?,
        green_count: row.get(5)?,
        total_flags: row.get(6)?,
        created_at: parse_timestamp(row.get(7)?).unwrap_or_else(Utc::now),
    })
}

impl Storage for SqliteStorage {
    fn init(&mut self) -> Result<()> {
        let is_init: i64 = self
            .conn
            .query_row(CHECK_SCHEMA_SQL, [], |row| row.get(0))
            .map_err(StorageError::from)?;

        if is_init == 0 {
            // Fresh install - create schema
            self.conn
                .execute_batch(SCHEMA_SQL)
                .map_err(StorageError::from)?;
            self.set_schema_version(CURRENT_SCHEMA_VERSION)?;
        } else if let Some(current) = self.get_schema_version()? {
            if current < CURRENT_SCHEMA_VERSION {
                let migrations = crate::storage::schema::get_migrations_from(current);
                for migration in migrations {
                    self.conn
                        .execute_batch(migration.sql)
                        .map_err(|e| StorageError::Migration(e.to_string()))?;
                }
                self.set_schema_version(CURRENT_SCHEMA_VERSION)?;
            }
        }

        Ok(())
    }

    fn is_initialized(&self) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(CHECK_SCHEMA_SQL, [], |row| row.get(0))
            .map_err(StorageError::from)?;
        Ok(count > 0)
    }

    // ==================== Document operations ====================

    fn insert_document(&mut self, document: &Document) -> Result<i64> {
        let now = Self::now_text();
        self.conn
            .execute(
                r"
            INSERT INTO documents (
                external_id, original_filename, storage_path, size_bytes,
                sha256, source_type, organization, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
                params![
                    document.external_id,
                    document.original_filename,
                    document.storage_path,
                    document.size_bytes,
                    document.sha256,
                    document.source_class.as_str(),
                    document.organization,
                    document.status.as_str(),
                    now,
                    now,
                ],
            )
            .map_err(StorageError::from)?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get_document(&self, id: i64) -> Result<Option<Document>> {
        let parts = self
            .conn
            .query_row(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?"),
                params![id],
                document_from_row,
            )
            .optional()
            .map_err(StorageError::from)?;
        parts.map(finish_document).transpose()
    }

    fn get_document_by_external_id(&self, external_id: &str) -> Result<Option<Document>> {
        let parts = self
            .conn
            .query_row(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE external_id = ?"),
                params![external_id],
                document_from_row,
            )
            .optional()
            .map_err(StorageError::from)?;
        parts.map(finish_document).transpose()
    }

    fn set_document_status(&mut self, id: i64, status: DocumentStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE documents SET status = ?, updated_at = ? WHERE id = ?",
                params![status.as_str(), Self::now_text(), id],
            )
            .map_err(StorageError::from)?;
        Ok(())
    }

    // ==================== Chunk operations ====================

    fn insert_chunks(&mut self, document_id: i64, payloads: &[ChunkPayload]) -> Result<usize> {
        let now = Self::now_text();
        let tx = self
            .conn
            .transaction()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;
        for (index, payload) in payloads.iter().enumerate() {
            let metadata_json =
                serde_json::to_string(&payload.metadata).map_err(StorageError::from)?;
            tx.execute(
                r"
                INSERT INTO chunks (
                    document_id, chunk_id, chunk_index, section_path, parent_heading,
                    content, token_count, chunk_metadata, embedding_status, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)
            ",
                params![
                    document_id,
                    payload.chunk_id,
                    index as i64,
                    render_section_path(&payload.section_path),
                    payload.parent_heading,
                    payload.text,
                    payload.token_count as i64,
                    metadata_json,
                    now,
                ],
            )
            .map_err(StorageError::from)?;
        }
        tx.commit()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;
        Ok(payloads.len())
    }

    fn get_chunk(&self, chunk_id: &str) -> Result<Option<ChunkRecord>> {
        let parts = self
            .conn
            .query_row(
                &format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE chunk_id = ?"),
                params![chunk_id],
                chunk_from_row,
            )
            .optional()
            .map_err(StorageError::from)?;
        parts.map(finish_chunk).transpose()
    }

    fn chunks_in_range(
        &self,
        document_id: i64,
        lower: i64,
        upper: i64,
    ) -> Result<Vec<ChunkRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks
                 WHERE document_id = ? AND chunk_index >= ? AND chunk_index <= ?
                 ORDER BY chunk_index ASC"
            ))
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map(params![document_id, lower, upper], chunk_from_row)
            .map_err(StorageError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;
        rows.into_iter().map(finish_chunk).collect()
    }

    fn chunks_for_document(&self, document_id: i64) -> Result<Vec<ChunkRecord>> {
        self.chunks_in_range(document_id, 0, i64::MAX)
    }

    fn chunk_count(&self, document_id: i64) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM chunks WHERE document_id = ?",
                params![document_id],
                |row| row.get(0),
            )
            .map_err(StorageError::from)?;
        Ok(count as usize)
    }

    fn set_embedding_status(&mut self, chunk_id: &str, status: EmbeddingStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE chunks SET embedding_status = ? WHERE chunk_id = ?",
                params![status.as_str(), chunk_id],
            )
            .map_err(StorageError::from)?;
        Ok(())
    }

    // ==================== Audit operations ====================

    fn create_audit(&mut self, document_id: i64, is_draft: bool) -> Result<Audit> {
        let mut audit = Audit::new(document_id, is_draft);
        let now = Self::now_text();
        self.conn
            .execute(
                r"
            INSERT INTO audits (
                external_id, document_id, status, is_draft, chunk_total,
                chunk_completed, created_at, updated_at
            ) VALUES (?, ?, 'queued', ?, 0, 0, ?, ?)
        ",
                params![
                    audit.external_id,
                    document_id,
                    i64::from(is_draft),
                    now,
                    now
                ],
            )
            .map_err(StorageError::from)?;
        audit.id = Some(self.conn.last_insert_rowid());
        Ok(audit)
    }

    fn get_audit(&self, id: i64) -> Result<Option<Audit>> {
        let parts = self
            .conn
            .query_row(
                &format!("SELECT {AUDIT_COLUMNS} FROM audits WHERE id = ?"),
                params![id],
                audit_from_row,
            )
            .optional()
            .map_err(StorageError::from)?;
        parts.map(finish_audit).transpose()
    }

    fn get_audit_by_external_id(&self, external_id: &str) -> Result<Option<Audit>> {
        let parts = self
            .conn
            .query_row(
                &format!("SELECT {AUDIT_COLUMNS} FROM audits WHERE external_id = ?"),
                params![external_id],
                audit_from_row,
            )
            .optional()
            .map_err(StorageError::from)?;
        parts.map(finish_audit).transpose()
    }

    fn update_audit(&mut self, audit: &Audit) -> Result<()> {
        let id = audit.id.ok_or_else(|| {
            StorageError::Database("cannot update audit without an id".to_string())
        })?;
        self.conn
            .execute(
                r"
            UPDATE audits SET
                status = ?, chunk_total = ?, chunk_completed = ?, last_chunk_id = ?,
                started_at = ?, completed_at = ?, failed_at = ?, failure_reason = ?,
                updated_at = ?
            WHERE id = ?
        ",
                params![
                    audit.status.as_str(),
                    audit.chunk_total,
                    audit.chunk_completed,
                    audit.last_chunk_id,
                    audit.started_at.map(|dt| dt.to_rfc3339()),
                    audit.completed_at.map(|dt| dt.to_rfc3339()),
                    audit.failed_at.map(|dt| dt.to_rfc3339()),
                    audit.failure_reason,
                    Self::now_text(),
                    id,
                ],
            )
            .map_err(StorageError::from)?;
        Ok(())
    }

    fn list_audits(
        &self,
        status: Option<AuditStatus>,
        is_draft: Option<bool>,
        limit: usize,
    ) -> Result<Vec<Audit>> {
        let mut sql = format!("SELECT {AUDIT_COLUMNS} FROM audits WHERE 1=1");
        if let Some(status) = status {
            sql.push_str(&format!(" AND status = '{}'", status.as_str()));
        }
        if let Some(is_draft) = is_draft {
            sql.push_str(&format!(" AND is_draft = {}", i64::from(is_draft)));
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");

        let mut stmt = self.conn.prepare(&sql).map_err(StorageError::from)?;
        let rows = stmt
            .query_map(params![limit as i64], audit_from_row)
            .map_err(StorageError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;
        rows.into_iter().map(finish_audit).collect()
    }

    // ==================== Chunk result operations ====================

    fn insert_chunk_result(&mut self, result: &AuditChunkResult) -> Result<i64> {
        let analysis_json = serde_json::to_string(&result.analysis).map_err(StorageError::from)?;
        self.conn
            .execute(
                r"
            INSERT INTO audit_chunk_results (
                audit_id, chunk_id, chunk_index, status, analysis,
                context_token_count, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
        ",
                params![
                    result.audit_id,
                    result.chunk_id,
                    result.chunk_index,
                    result.status,
                    analysis_json,
                    result.context_token_count,
                    Self::now_text(),
                ],
            )
            .map_err(StorageError::from)?;
        Ok(self.conn.last_insert_rowid())
    }

    fn pending_chunks(&self, audit: &Audit, limit: Option<usize>) -> Result<Vec<ChunkRecord>> {
        let audit_id = audit.id.ok_or_else(|| {
            StorageError::Database("cannot query pending chunks without an audit id".to_string())
        })?;
        let mut sql = format!(
            "SELECT {} FROM chunks c
             LEFT JOIN audit_chunk_results r
                ON r.audit_id = ?1 AND r.chunk_id = c.chunk_id
             WHERE c.document_id = ?2 AND r.id IS NULL
             ORDER BY c.chunk_index ASC",
            CHUNK_COLUMNS
                .split(", ")
                .map(|col| format!("c.{col}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn.prepare(&sql).map_err(StorageError::from)?;
        let rows = stmt
            .query_map(params![audit_id, audit.document_id], chunk_from_row)
            .map_err(StorageError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;
        rows.into_iter().map(finish_chunk).collect()
    }

    fn pending_chunk_count(&self, audit: &Audit) -> Result<usize> {
        let audit_id = audit.id.ok_or_else(|| {
            StorageError::Database("cannot query pending chunks without an audit id".to_string())
        })?;
        let count: i64 = self
            .conn
            .query_row(
                r"
            SELECT COUNT(*) FROM chunks c
            LEFT JOIN audit_chunk_results r
                ON r.audit_id = ?1 AND r.chunk_id = c.chunk_id
            WHERE c.document_id = ?2 AND r.id IS NULL
        ",
                params![audit_id, audit.document_id],
                |row| row.get(0),
            )
            .map_err(StorageError::from)?;
        Ok(count as usize)
    }

    // ==================== Flag operations ====================

    fn upsert_flag(
        &mut self,
        flag: &Flag,
        citations: &[(CitationKind, String)],
    ) -> Result<Flag> {
        let gaps_json = serde_json::to_string(&flag.gaps).map_err(StorageError::from)?;
        let recommendations_json =
            serde_json::to_string(&flag.recommendations).map_err(StorageError::from)?;
        let metadata_json =
            serde_json::to_string(&flag.analysis_metadata).map_err(StorageError::from)?;

        let tx = self
            .conn
            .transaction()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        let existing_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM flags WHERE audit_id = ? AND chunk_id = ?",
                params![flag.audit_id, flag.chunk_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StorageError::from)?;

        let flag_id = if let Some(id) = existing_id {
            tx.execute(
                r"
                UPDATE flags SET
                    flag_type = ?, severity_score = ?, findings = ?, gaps = ?,
                    recommendations = ?, analysis_metadata = ?
                WHERE id = ?
            ",
                params![
                    flag.class.as_str(),
                    flag.severity_score,
                    flag.findings,
                    gaps_json,
                    recommendations_json,
                    metadata_json,
                    id,
                ],
            )
            .map_err(StorageError::from)?;
            id
        } else {
            tx.execute(
                r"
                INSERT INTO flags (
                    audit_id, chunk_id, flag_type, severity_score, findings,
                    gaps, recommendations, analysis_metadata, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
                params![
                    flag.audit_id,
                    flag.chunk_id,
                    flag.class.as_str(),
                    flag.severity_score,
                    flag.findings,
                    gaps_json,
                    recommendations_json,
                    metadata_json,
                    flag.created_at.to_rfc3339(),
                ],
            )
            .map_err(StorageError::from)?;
            tx.last_insert_rowid()
        };

        // Citations are replaced atomically: clear existing, then insert.
        tx.execute("DELETE FROM citations WHERE flag_id = ?", params![flag_id])
            .map_err(StorageError::from)?;
        for (kind, reference) in citations {
            tx.execute(
                "INSERT INTO citations (flag_id, citation_type, reference) VALUES (?, ?, ?)",
                params![flag_id, kind.as_str(), reference],
            )
            .map_err(StorageError::from)?;
        }

        tx.commit()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        let mut stored = flag.clone();
        stored.id = Some(flag_id);
        Ok(stored)
    }

    fn flags_for_audit(&self, audit_id: i64) -> Result<Vec<Flag>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {FLAG_COLUMNS} FROM flags WHERE audit_id = ?
                 ORDER BY created_at ASC, id ASC"
            ))
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map(params![audit_id], flag_from_row)
            .map_err(StorageError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;
        rows.into_iter().map(finish_flag).collect()
    }

    fn citations_for_flag(&self, flag_id: i64) -> Result<Vec<Citation>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, flag_id, citation_type, reference FROM citations
                 WHERE flag_id = ? ORDER BY id ASC",
            )
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map(params![flag_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(StorageError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;

        rows.into_iter()
            .map(|(id, flag_id, kind_raw, reference)| {
                let kind = CitationKind::parse(&kind_raw)
                    .ok_or_else(|| bad_enum("citation_type", &kind_raw))?;
                Ok(Citation {
                    id: Some(id),
                    flag_id,
                    kind,
                    reference,
                })
            })
            .collect()
    }

    // ==================== Reviewer question operations ====================

    fn questions_exist(&self, audit_id: i64, regulation_reference: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM auditor_questions
                 WHERE audit_id = ? AND regulation_reference = ?",
                params![audit_id, regulation_reference],
                |row| row.get(0),
            )
            .map_err(StorageError::from)?;
        Ok(count > 0)
    }

    fn insert_questions(&mut self, questions: &[AuditorQuestion]) -> Result<usize> {
        let now = Self::now_text();
        let tx = self
            .conn
            .transaction()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;
        for question in questions {
            let related_json =
                serde_json::to_string(&question.related_flag_ids).map_err(StorageError::from)?;
            tx.execute(
                r"
                INSERT INTO auditor_questions (
                    audit_id, regulation_reference, question_text, priority,
                    rationale, related_flag_ids, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
                params![
                    question.audit_id,
                    question.regulation_reference,
                    question.question_text,
                    question.priority,
                    question.rationale,
                    related_json,
                    now,
                ],
            )
            .map_err(StorageError::from)?;
        }
        tx.commit()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;
        Ok(questions.len())
    }

    fn questions_for_audit(&self, audit_id: i64) -> Result<Vec<AuditorQuestion>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, audit_id, regulation_reference, question_text, priority,
                        rationale, related_flag_ids
                 FROM auditor_questions WHERE audit_id = ?
                 ORDER BY priority ASC, id ASC",
            )
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map(params![audit_id], |row| {
                Ok(AuditorQuestion {
                    id: Some(row.get::<_, i64>(0)?),
                    audit_id: row.get(1)?,
                    regulation_reference: row.get(2)?,
                    question_text: row.get(3)?,
                    priority: row.get(4)?,
                    rationale: row.get(5)?,
                    related_flag_ids: parse_id_list(row.get(6)?),
                })
            })
            .map_err(StorageError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;
        Ok(rows)
    }

    // ==================== Score operations ====================

    fn upsert_score(&mut self, score: &ComplianceScore) -> Result<ComplianceScore> {
        self.conn
            .execute(
                r"
            INSERT INTO compliance_scores (
                audit_id, overall_score, red_count, yellow_count, green_count,
                total_flags, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(audit_id) DO UPDATE SET
                overall_score = ?2, red_count = ?3, yellow_count = ?4,
                green_count = ?5, total_flags = ?6, created_at = ?7
        ",
                params![
                    score.audit_id,
                    score.overall_score,
                    score.red_count,
                    score.yellow_count,
                    score.green_count,
                    score.total_flags,
                    score.created_at.to_rfc3339(),
                ],
            )
            .map_err(StorageError::from)?;

        let stored = self.score_for_audit(score.audit_id)?;
        stored.ok_or_else(|| {
            StorageError::Database("score row missing immediately after upsert".to_string()).into()
        })
    }

    fn score_history(
        &self,
        organization: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ComplianceScore>> {
        let limit = limit.min(SCORE_HISTORY_MAX_LIMIT);
        let sql = format!(
            "SELECT {} FROM compliance_scores s
             JOIN audits a ON a.id = s.audit_id
             JOIN documents d ON d.id = a.document_id
             WHERE (?1 IS NULL OR d.organization = ?1)
             ORDER BY s.created_at DESC, s.id DESC
             LIMIT ?2",
            SCORE_COLUMNS
                .split(", ")
                .map(|col| format!("s.{col}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut stmt = self.conn.prepare(&sql).map_err(StorageError::from)?;
        let rows = stmt
            .query_map(params![organization, limit as i64], score_from_row)
            .map_err(StorageError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;
        Ok(rows)
    }

    fn score_for_audit(&self, audit_id: i64) -> Result<Option<ComplianceScore>> {
        let score = self
            .conn
            .query_row(
                &format!("SELECT {SCORE_COLUMNS} FROM compliance_scores WHERE audit_id = ?"),
                params![audit_id],
                score_from_row,
            )
            .optional()
            .map_err(StorageError::from)?;
        Ok(score)
    }
}
