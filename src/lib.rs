//! # RACA-RS
//!
//! Retrieval-Augmented Compliance Auditor.
//!
//! Given a tenant-supplied procedural manual and a corpus of regulations
//! and guidance material, the engine produces a structured audit:
//! per-section compliance flags (RED/YELLOW/GREEN), citations, gap lists,
//! recommendations, prioritized reviewer questions, a numeric compliance
//! score, and durable per-chunk analysis records.
//!
//! ## Features
//!
//! - **Chunking**: section-aware and token-window splitting with stable
//!   ids and prev/next sequencing
//! - **Retrieval**: budgeted context assembly over categorized vector
//!   collections, with recursive reference following
//! - **Analysis**: structured-output LLM calls with validation, rate-limit
//!   backoff, and bounded agent-requested refinement
//! - **`SQLite` Storage**: resumable audit state with transaction support

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod analysis;
pub mod chunking;
pub mod cli;
pub mod config;
pub mod context;
pub mod core;
pub mod embedding;
pub mod error;
pub mod flagging;
pub mod logging;
pub mod questions;
pub mod runner;
pub mod score;
pub mod storage;
pub mod token;
pub mod vector;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

// Re-export core domain types
pub use core::{
    Audit, AuditChunkResult, AuditStatus, AuditorQuestion, Citation, CitationKind, ChunkMetadata,
    ChunkPayload, ChunkRecord, ComplianceScore, Document, DocumentStatus, EmbeddingStatus, Flag,
    FlagClass, NormalizedAnalysis, Section, SourceClass,
};

// Re-export configuration and run correlation
pub use config::AppConfig;
pub use logging::RunContext;

// Re-export storage types
pub use storage::{DEFAULT_DB_PATH, SqliteStorage, Storage};

// Re-export chunking types
pub use chunking::{ChunkerConfig, ChunkingMode, SectionChunker};

// Re-export context types
pub use context::{
    ContextBuilder, ContextBundle, ContextOptions, ContextSlice, RecursiveContextBuilder,
    ReferenceExtractor, TokenBudget,
};

// Re-export analysis types
pub use analysis::{AnalysisClient, ComplianceLlmClient, EchoAnalysisClient};

// Re-export runner types
pub use runner::{AuditRunner, AuditScheduler, MetricsCollector, RunOptions, RunnerResult};

// Re-export scoring and flagging
pub use flagging::FlagSynthesizer;
pub use score::{ScoreTracker, calculate_compliance_score};

// Re-export vector store types
pub use vector::{
    InMemoryVectorStore, MetadataFilter, SqliteVectorStore, VectorMatch, VectorRecord,
    VectorStore,
};

// Re-export embedding types
pub use embedding::{DEFAULT_DIMENSIONS, Embedder, FallbackEmbedder, HttpEmbedder, create_embedder};

// Re-export token estimation
pub use token::{HeuristicEstimator, TokenEstimator, create_estimator};

// Re-export CLI types
pub use cli::{Cli, Commands, OutputFormat};
