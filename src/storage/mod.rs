//! Storage layer for the audit engine.
//!
//! Provides persistent relational storage for documents, chunks, audits,
//! per-chunk results, flags, citations, reviewer questions, and score
//! snapshots using `SQLite`, with versioned migrations and transaction
//! support. Vector data lives in the separate keyed store under
//! [`crate::vector`].

pub mod schema;
pub mod sqlite;
pub mod traits;

pub use schema::{CURRENT_SCHEMA_VERSION, SCHEMA_SQL};
pub use sqlite::SqliteStorage;
pub use traits::Storage;

/// Default database path.
pub const DEFAULT_DB_PATH: &str = "data/app.db";
