//! Command-line argument parsing.
//!
//! Defines the CLI structure using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Retrieval-Augmented Compliance Auditor.
///
/// Audits procedural manuals against a regulation corpus via chunking,
/// recursive retrieval context assembly, and structured LLM analysis.
#[derive(Parser, Debug)]
#[command(name = "raca-rs")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the SQLite database file.
    #[arg(short, long, env = "DATABASE_URL")]
    pub db_path: Option<PathBuf>,

    /// Output format (text, json).
    #[arg(long, default_value = "text", global = true)]
    pub format: String,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize the database and data-root layout.
    Init,

    /// Ingest a sectioned document (JSON) and chunk it.
    Ingest {
        /// Path to a JSON file with `[{index, title, content, ...}]`
        /// sections.
        file: PathBuf,

        /// Document source class (manual, regulation, amc, gm, evidence).
        #[arg(short, long, default_value = "manual")]
        source: String,

        /// Owning organization.
        #[arg(long)]
        organization: Option<String>,
    },

    /// Audit operations.
    #[command(subcommand)]
    Audit(AuditCommands),

    /// Show compliance score history.
    Scores {
        /// Filter by organization.
        #[arg(long)]
        organization: Option<String>,

        /// Maximum rows (capped at 100).
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
}

/// Audit subcommands.
#[derive(Subcommand, Debug)]
pub enum AuditCommands {
    /// Create a queued audit for a document.
    Create {
        /// Document id or external id.
        document: String,

        /// Draft mode: at most 5 chunks, no neighbors, no refinement.
        #[arg(long)]
        draft: bool,
    },

    /// Run an audit's pending chunks.
    Run {
        /// Audit id or external id.
        audit: String,

        /// Limit the number of chunks processed this run.
        #[arg(long)]
        max_chunks: Option<usize>,

        /// Force evidence retrieval on or off.
        #[arg(long)]
        evidence: Option<bool>,
    },

    /// Resume a failed or paused audit.
    Resume {
        /// Audit id or external id.
        audit: String,
    },

    /// Show audit status and progress.
    Status {
        /// Audit id or external id.
        audit: String,
    },

    /// List audits.
    List {
        /// Filter by status (queued, running, completed, failed).
        #[arg(long)]
        status: Option<String>,

        /// Maximum rows.
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Show an audit's flags.
    Flags {
        /// Audit id or external id.
        audit: String,

        /// Include generated reviewer questions.
        #[arg(long)]
        questions: bool,
    },

    /// Generate reviewer questions from the audit's flags.
    Questions {
        /// Audit id or external id.
        audit: String,
    },
}

impl Cli {
    /// Returns the database path, using the default if not specified.
    #[must_use]
    pub fn get_db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(crate::storage::DEFAULT_DB_PATH))
    }
}
