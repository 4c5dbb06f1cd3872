//! Core domain models for the audit engine.
//!
//! This module contains the fundamental data structures used throughout the
//! engine: documents, chunks, audits, flags, and the normalized analysis
//! payload. These are pure domain models with no I/O dependencies.

pub mod analysis;
pub mod audit;
pub mod chunk;
pub mod document;

pub use analysis::{CitationBlock, NormalizedAnalysis};
pub use audit::{
    Audit, AuditChunkResult, AuditStatus, AuditorQuestion, Citation, CitationKind,
    ComplianceScore, Flag, FlagClass,
};
pub use chunk::{ChunkMetadata, ChunkPayload, ChunkRecord, EmbeddingStatus, Section};
pub use document::{Document, DocumentStatus, SourceClass};
