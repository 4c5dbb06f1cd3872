//! Database schema definitions.
//!
//! Contains SQL schema and migration logic for the engine's `SQLite`
//! database. Migrations form one linear history; each migration upgrades
//! exactly one version step.

/// Current schema version.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// SQL schema for initial database setup (full current schema).
pub const SCHEMA_SQL: &str = r"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_info (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Uploaded documents (manuals, regulations, guidance, evidence)
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT NOT NULL UNIQUE,
    original_filename TEXT NOT NULL,
    storage_path TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    sha256 TEXT NOT NULL,
    source_type TEXT NOT NULL DEFAULT 'manual'
        CHECK (source_type IN ('manual','regulation','amc','gm','evidence')),
    organization TEXT,
    status TEXT NOT NULL DEFAULT 'uploaded',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_organization ON documents(organization);

-- Chunks (units of analysis; immutable except embedding_status)
CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id INTEGER NOT NULL,
    chunk_id TEXT NOT NULL UNIQUE,
    chunk_index INTEGER NOT NULL,
    section_path TEXT,
    parent_heading TEXT,
    content TEXT NOT NULL,
    token_count INTEGER,
    chunk_metadata TEXT,
    embedding_status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id, chunk_index);
CREATE INDEX IF NOT EXISTS idx_chunks_doc_status ON chunks(document_id, embedding_status);

-- Audit executions
CREATE TABLE IF NOT EXISTS audits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT NOT NULL UNIQUE,
    document_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    is_draft INTEGER NOT NULL DEFAULT 0,
    chunk_total INTEGER NOT NULL DEFAULT 0,
    chunk_completed INTEGER NOT NULL DEFAULT 0,
    last_chunk_id TEXT,
    started_at TEXT,
    completed_at TEXT,
    failed_at TEXT,
    failure_reason TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_audits_status ON audits(status);

-- One analysis result per (audit, chunk)
CREATE TABLE IF NOT EXISTS audit_chunk_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    audit_id INTEGER NOT NULL,
    chunk_id TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'completed',
    analysis TEXT,
    context_token_count INTEGER,
    created_at TEXT NOT NULL,
    UNIQUE (audit_id, chunk_id),
    FOREIGN KEY (audit_id) REFERENCES audits(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_audit_chunk_results_audit ON audit_chunk_results(audit_id, status);

-- One flag per (audit, chunk)
CREATE TABLE IF NOT EXISTS flags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    audit_id INTEGER NOT NULL,
    chunk_id TEXT NOT NULL,
    flag_type TEXT NOT NULL,
    severity_score INTEGER NOT NULL,
    findings TEXT NOT NULL,
    gaps TEXT,
    recommendations TEXT,
    analysis_metadata TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (audit_id, chunk_id),
    FOREIGN KEY (audit_id) REFERENCES audits(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_flags_audit ON flags(audit_id, flag_type);

-- Citations, fully rewritten on flag upsert
CREATE TABLE IF NOT EXISTS citations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    flag_id INTEGER NOT NULL,
    citation_type TEXT NOT NULL,
    reference TEXT NOT NULL,
    FOREIGN KEY (flag_id) REFERENCES flags(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_citations_flag ON citations(flag_id);

-- Prioritized reviewer questions (v2)
CREATE TABLE IF NOT EXISTS auditor_questions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    audit_id INTEGER NOT NULL,
    regulation_reference TEXT NOT NULL,
    question_text TEXT NOT NULL,
    priority INTEGER NOT NULL,
    rationale TEXT,
    related_flag_ids TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (audit_id) REFERENCES audits(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_auditor_questions_audit ON auditor_questions(audit_id, priority);
CREATE INDEX IF NOT EXISTS idx_auditor_questions_regulation ON auditor_questions(regulation_reference);

-- Compliance score snapshots, one row per audit (v2)
CREATE TABLE IF NOT EXISTS compliance_scores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    audit_id INTEGER NOT NULL UNIQUE,
    overall_score REAL NOT NULL,
    red_count INTEGER NOT NULL DEFAULT 0,
    yellow_count INTEGER NOT NULL DEFAULT 0,
    green_count INTEGER NOT NULL DEFAULT 0,
    total_flags INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    FOREIGN KEY (audit_id) REFERENCES audits(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_compliance_scores_created ON compliance_scores(created_at);
";

/// SQL to check if schema is initialized.
pub const CHECK_SCHEMA_SQL: &str = r"
SELECT COUNT(*) FROM sqlite_master
WHERE type='table' AND name='schema_info';
";

/// SQL to get schema version.
pub const GET_VERSION_SQL: &str = r"
SELECT value FROM schema_info WHERE key = 'version';
";

/// SQL to set schema version.
pub const SET_VERSION_SQL: &str = r"
INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?);
";

/// Migrations from older schema versions.
pub struct Migration {
    /// Version this migration upgrades from.
    pub from_version: u32,
    /// Version this migration upgrades to.
    pub to_version: u32,
    /// SQL statements to execute.
    pub sql: &'static str,
}

/// SQL for v1 to v2 migration (adds reviewer questions + score snapshots).
const MIGRATION_V1_TO_V2: &str = r"
CREATE TABLE IF NOT EXISTS auditor_questions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    audit_id INTEGER NOT NULL,
    regulation_reference TEXT NOT NULL,
    question_text TEXT NOT NULL,
    priority INTEGER NOT NULL,
    rationale TEXT,
    related_flag_ids TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (audit_id) REFERENCES audits(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_auditor_questions_audit ON auditor_questions(audit_id, priority);
CREATE INDEX IF NOT EXISTS idx_auditor_questions_regulation ON auditor_questions(regulation_reference);

CREATE TABLE IF NOT EXISTS compliance_scores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    audit_id INTEGER NOT NULL UNIQUE,
    overall_score REAL NOT NULL,
    red_count INTEGER NOT NULL DEFAULT 0,
    yellow_count INTEGER NOT NULL DEFAULT 0,
    green_count INTEGER NOT NULL DEFAULT 0,
    total_flags INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    FOREIGN KEY (audit_id) REFERENCES audits(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_compliance_scores_created ON compliance_scores(created_at);
";

/// Available migrations, in order.
pub const MIGRATIONS: &[Migration] = &[Migration {
    from_version: 1,
    to_version: 2,
    sql: MIGRATION_V1_TO_V2,
}];

/// Gets migrations needed to upgrade from a version.
#[must_use]
pub fn get_migrations_from(current_version: u32) -> Vec<&'static Migration> {
    MIGRATIONS
        .iter()
        .filter(|m| m.from_version >= current_version && m.to_version <= CURRENT_SCHEMA_VERSION)
        .collect()
}
