//! Storage trait definition.
//!
//! Defines the interface for the relational persistence backend. The trait
//! is object-safe so the runner, flag synthesizer, score tracker, and
//! question generator can share `&dyn Storage` / `&mut dyn Storage`
//! handles. No session state crosses a task boundary; each background task
//! opens its own storage handle.

use crate::core::{
    Audit, AuditChunkResult, AuditStatus, AuditorQuestion, Citation, CitationKind, ChunkPayload,
    ChunkRecord, ComplianceScore, Document, DocumentStatus, EmbeddingStatus, Flag,
};
use crate::error::Result;

/// Relational persistence operations used by the audit engine.
pub trait Storage: Send {
    /// Initializes the schema, applying pending migrations.
    fn init(&mut self) -> Result<()>;

    /// Whether the schema exists.
    fn is_initialized(&self) -> Result<bool>;

    // ==================== Document operations ====================

    /// Inserts a document and returns its surrogate id.
    fn insert_document(&mut self, document: &Document) -> Result<i64>;

    /// Fetches a document by surrogate id.
    fn get_document(&self, id: i64) -> Result<Option<Document>>;

    /// Fetches a document by external id.
    fn get_document_by_external_id(&self, external_id: &str) -> Result<Option<Document>>;

    /// Advances a document's lifecycle status.
    fn set_document_status(&mut self, id: i64, status: DocumentStatus) -> Result<()>;

    // ==================== Chunk operations ====================

    /// Inserts chunk payloads for a document in one transaction, assigning
    /// dense `chunk_index` values `0..N` in payload order with
    /// `embedding_status = pending`. Returns the number inserted.
    fn insert_chunks(&mut self, document_id: i64, payloads: &[ChunkPayload]) -> Result<usize>;

    /// Fetches a chunk by its external chunk id.
    fn get_chunk(&self, chunk_id: &str) -> Result<Option<ChunkRecord>>;

    /// Chunks of a document with `chunk_index` in `[lower, upper]`,
    /// ordered by index.
    fn chunks_in_range(&self, document_id: i64, lower: i64, upper: i64)
        -> Result<Vec<ChunkRecord>>;

    /// All chunks of a document ordered by index.
    fn chunks_for_document(&self, document_id: i64) -> Result<Vec<ChunkRecord>>;

    /// Number of chunks for a document.
    fn chunk_count(&self, document_id: i64) -> Result<usize>;

    /// Flips a chunk's embedding status.
    fn set_embedding_status(&mut self, chunk_id: &str, status: EmbeddingStatus) -> Result<()>;

    // ==================== Audit operations ====================

    /// Creates a queued audit for a document and returns it with ids set.
    fn create_audit(&mut self, document_id: i64, is_draft: bool) -> Result<Audit>;

    /// Fetches an audit by surrogate id.
    fn get_audit(&self, id: i64) -> Result<Option<Audit>>;

    /// Fetches an audit by external id.
    fn get_audit_by_external_id(&self, external_id: &str) -> Result<Option<Audit>>;

    /// Persists the mutable audit columns (status, counters, timestamps,
    /// failure reason).
    fn update_audit(&mut self, audit: &Audit) -> Result<()>;

    /// Lists audits, newest first, optionally filtered.
    fn list_audits(
        &self,
        status: Option<AuditStatus>,
        is_draft: Option<bool>,
        limit: usize,
    ) -> Result<Vec<Audit>>;

    // ==================== Chunk result operations ====================

    /// Inserts a per-chunk analysis result.
    fn insert_chunk_result(&mut self, result: &AuditChunkResult) -> Result<i64>;

    /// Document chunks with no result for the audit, ordered by
    /// `chunk_index`, optionally limited.
    fn pending_chunks(&self, audit: &Audit, limit: Option<usize>) -> Result<Vec<ChunkRecord>>;

    /// Count of document chunks with no result for the audit.
    fn pending_chunk_count(&self, audit: &Audit) -> Result<usize>;

    // ==================== Flag operations ====================

    /// Upserts a flag by `(audit_id, chunk_id)` and atomically rewrites its
    /// citations. Returns the stored flag with its id set.
    fn upsert_flag(
        &mut self,
        flag: &Flag,
        citations: &[(CitationKind, String)],
    ) -> Result<Flag>;

    /// All flags of an audit ordered by `(created_at, id)`.
    fn flags_for_audit(&self, audit_id: i64) -> Result<Vec<Flag>>;

    /// Citations of a flag in insertion order.
    fn citations_for_flag(&self, flag_id: i64) -> Result<Vec<Citation>>;

    // ==================== Reviewer question operations ====================

    /// Whether questions exist for `(audit_id, regulation_reference)`.
    fn questions_exist(&self, audit_id: i64, regulation_reference: &str) -> Result<bool>;

    /// Inserts reviewer questions. Returns the number inserted.
    fn insert_questions(&mut self, questions: &[AuditorQuestion]) -> Result<usize>;

    /// Questions of an audit ordered by priority.
    fn questions_for_audit(&self, audit_id: i64) -> Result<Vec<AuditorQuestion>>;

    // ==================== Score operations ====================

    /// Upserts the score snapshot keyed by audit.
    fn upsert_score(&mut self, score: &ComplianceScore) -> Result<ComplianceScore>;

    /// Latest snapshot per audit, newest first, optionally filtered by the
    /// audited document's organization. `limit` is capped at 100.
    fn score_history(
        &self,
        organization: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ComplianceScore>>;

    /// Score snapshot for one audit, if recorded.
    fn score_for_audit(&self, audit_id: i64) -> Result<Option<ComplianceScore>>;
}
