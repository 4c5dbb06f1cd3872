//! Error types for audit engine operations.
//!
//! This module provides a comprehensive error hierarchy using `thiserror` for
//! all engine operations including storage, chunking, context assembly,
//! embedding, and LLM analysis.

use thiserror::Error;

/// Result type alias for audit engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error types for audit engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Storage-related errors (database operations).
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Chunking-related errors (section processing).
    #[error("chunking error: {0}")]
    Chunking(#[from] ChunkingError),

    /// Context assembly errors (retrieval, budgeting).
    #[error("context error: {0}")]
    Context(#[from] ContextError),

    /// Embedding errors (vector generation and storage).
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    /// LLM analysis errors.
    #[error("analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    /// Malformed caller input.
    #[error("validation error: {message}")]
    Validation {
        /// Description of the validation failure.
        message: String,
    },

    /// Referenced entity absent.
    #[error("{entity} not found: {identifier}")]
    NotFound {
        /// Entity kind (document, chunk, audit).
        entity: &'static str,
        /// Identifier that failed to resolve.
        identifier: String,
    },

    /// Configuration errors.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },
}

/// Storage-specific errors for database operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database connection or query error.
    #[error("database error: {0}")]
    Database(String),

    /// Storage not initialized (init command not run).
    #[error("database not initialized. Run: raca-rs init")]
    NotInitialized,

    /// Schema migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Transaction error.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Chunking-specific errors for section processing.
#[derive(Error, Debug)]
pub enum ChunkingError {
    /// Invalid chunker configuration.
    #[error("invalid chunking configuration: {reason}")]
    InvalidConfig {
        /// Reason the configuration is invalid.
        reason: String,
    },

    /// Overlap exceeds window size.
    #[error("overlap {overlap} must be less than window size {size}")]
    OverlapTooLarge {
        /// Overlap in tokens.
        overlap: usize,
        /// Window size in tokens.
        size: usize,
    },

    /// Two sections produced the same chunk id.
    #[error("duplicate chunk id: {id}")]
    DuplicateChunkId {
        /// The colliding chunk id.
        id: String,
    },
}

/// Context assembly errors.
#[derive(Error, Debug)]
pub enum ContextError {
    /// The focus chunk for a context build is missing.
    #[error("focus chunk not found: {chunk_id}")]
    FocusChunkMissing {
        /// Chunk id that failed to resolve.
        chunk_id: String,
    },

    /// A reference extraction pattern failed to compile.
    #[error("reference pattern error: {0}")]
    Pattern(String),
}

/// Embedding and vector store errors.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// Vector dimension does not match the collection's established dimension.
    /// Fatal for the enclosing batch or query.
    #[error(
        "dimension mismatch for collection '{collection}': expected {expected}, got {actual}"
    )]
    DimensionMismatch {
        /// Target collection name.
        collection: String,
        /// Dimension established by the collection.
        expected: usize,
        /// Dimension of the offending vector.
        actual: usize,
    },

    /// Embedding endpoint request failure.
    #[error("embedding request failed: {0}")]
    Http(String),

    /// Embedding endpoint returned no usable vectors.
    #[error("embedding response contained no vectors")]
    EmptyResponse,

    /// Vector store backend failure.
    #[error("vector store error: {0}")]
    Store(String),
}

/// LLM analysis errors surfaced to the audit runner.
#[derive(Error, Debug)]
pub enum AnalysisError {
    /// Rate limit (HTTP 429) persisted through the full retry budget.
    /// The runner turns this into a user-facing failure reason with
    /// progress counters and retry advice.
    #[error("rate limit exhausted after {attempts} attempts: {message}")]
    RateLimitExhausted {
        /// Attempts made before giving up.
        attempts: u32,
        /// Last error text from the endpoint.
        message: String,
    },

    /// HTTP 404 from the endpoint - the configured model does not exist
    /// or is not accessible. Not retryable.
    #[error("model '{model}' not found: {message}")]
    ModelNotFound {
        /// Configured model identifier.
        model: String,
        /// Error body from the endpoint.
        message: String,
    },

    /// HTTP or transport failure after the final retry.
    #[error("LLM request failed: {0}")]
    Http(String),

    /// The response did not match the analysis schema after the final retry.
    #[error("invalid analysis response: {0}")]
    InvalidResponse(String),

    /// The response carried no message content.
    #[error("LLM response missing message content")]
    MissingContent,
}

impl AnalysisError {
    /// Whether this error is a rate-limit exhaustion, which the runner
    /// reports with progress counters instead of a raw error string.
    #[must_use]
    pub const fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimitExhausted { .. })
    }
}

// Implement From traits for standard library and dependency errors

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(StorageError::Database(err.to_string()))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StorageError::Database(err.to_string()))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<regex::Error> for ContextError {
    fn from(err: regex::Error) -> Self {
        Self::Pattern(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Validation {
            message: "limit must be positive".to_string(),
        };
        assert_eq!(err.to_string(), "validation error: limit must be positive");
    }

    #[test]
    fn test_not_found_display() {
        let err = Error::NotFound {
            entity: "audit",
            identifier: "abc123".to_string(),
        };
        assert_eq!(err.to_string(), "audit not found: abc123");
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::NotInitialized;
        assert_eq!(
            err.to_string(),
            "database not initialized. Run: raca-rs init"
        );
    }

    #[test]
    fn test_chunking_error_display() {
        let err = ChunkingError::OverlapTooLarge {
            overlap: 100,
            size: 50,
        };
        assert_eq!(
            err.to_string(),
            "overlap 100 must be less than window size 50"
        );
    }

    #[test]
    fn test_dimension_mismatch_display() {
        let err = EmbeddingError::DimensionMismatch {
            collection: "regulation_chunks".to_string(),
            expected: 384,
            actual: 1536,
        };
        assert!(err.to_string().contains("regulation_chunks"));
        assert!(err.to_string().contains("384"));
        assert!(err.to_string().contains("1536"));
    }

    #[test]
    fn test_analysis_error_rate_limit_flag() {
        let err = AnalysisError::RateLimitExhausted {
            attempts: 2,
            message: "429 Too Many Requests".to_string(),
        };
        assert!(err.is_rate_limit());

        let err = AnalysisError::MissingContent;
        assert!(!err.is_rate_limit());
    }

    #[test]
    fn test_error_from_storage() {
        let storage_err = StorageError::NotInitialized;
        let err: Error = storage_err.into();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[test]
    fn test_error_from_chunking() {
        let chunk_err = ChunkingError::DuplicateChunkId {
            id: "doc_0_0".to_string(),
        };
        let err: Error = chunk_err.into();
        assert!(matches!(err, Error::Chunking(_)));
    }

    #[test]
    fn test_error_from_analysis() {
        let err: Error = AnalysisError::MissingContent.into();
        assert!(matches!(err, Error::Analysis(_)));
    }

    #[test]
    fn test_from_rusqlite_error() {
        let rusqlite_err = rusqlite::Error::InvalidQuery;
        let err: Error = rusqlite_err.into();
        assert!(matches!(err, Error::Storage(StorageError::Database(_))));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err: serde_json::Error = serde_json::from_str::<i32>("bad").unwrap_err();
        let err: StorageError = json_err.into();
        assert!(matches!(err, StorageError::Serialization(_)));
    }

    #[test]
    #[allow(clippy::invalid_regex)]
    fn test_from_regex_error() {
        let regex_err = regex::Regex::new("[open").unwrap_err();
        let err: ContextError = regex_err.into();
        assert!(matches!(err, ContextError::Pattern(_)));
    }
}
