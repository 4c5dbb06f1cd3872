//! Structured logging setup and run correlation.
//!
//! Log output is `tracing`-based: a level filter from configuration and
//! either a human-readable or JSON formatter. Request/audit/chunk
//! correlation travels as an explicit [`RunContext`] value recorded into
//! event fields; nothing is smuggled through task-local state.

use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::Error;

/// Initializes the global tracing subscriber from configuration.
///
/// # Errors
///
/// Returns [`Error::Config`] when the level filter is invalid or a
/// subscriber is already installed.
pub fn init(config: &AppConfig) -> Result<(), Error> {
    let filter = EnvFilter::try_new(&config.log_level).map_err(|e| Error::Config {
        message: format!("invalid log_level '{}': {e}", config.log_level),
    })?;

    let result = if config.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
    result.map_err(|e| Error::Config {
        message: format!("failed to install log subscriber: {e}"),
    })
}

/// Correlation identifiers for one unit of work.
///
/// The scheduler mints one per background task; the runner adopts it,
/// scopes it with the audit and then each chunk id, and records the
/// accessors into its tracing events so every log line of a run shares
/// one request id.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// Request id, generated when absent.
    pub request_id: Option<String>,
    /// External id of the audit being processed.
    pub audit_id: Option<String>,
    /// External id of the chunk being processed.
    pub chunk_id: Option<String>,
}

impl RunContext {
    /// Creates a context with a fresh request id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            request_id: Some(Uuid::new_v4().simple().to_string()),
            audit_id: None,
            chunk_id: None,
        }
    }

    /// Context scoped to an audit.
    #[must_use]
    pub fn with_audit(mut self, audit_id: impl Into<String>) -> Self {
        self.audit_id = Some(audit_id.into());
        self
    }

    /// Context scoped to a chunk within the audit.
    #[must_use]
    pub fn with_chunk(mut self, chunk_id: impl Into<String>) -> Self {
        self.chunk_id = Some(chunk_id.into());
        self
    }

    /// Request id or `"-"`.
    #[must_use]
    pub fn request_id(&self) -> &str {
        self.request_id.as_deref().unwrap_or("-")
    }

    /// Audit id or `"-"`.
    #[must_use]
    pub fn audit_id(&self) -> &str {
        self.audit_id.as_deref().unwrap_or("-")
    }

    /// Chunk id or `"-"`.
    #[must_use]
    pub fn chunk_id(&self) -> &str {
        self.chunk_id.as_deref().unwrap_or("-")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_context_generates_request_id() {
        let ctx = RunContext::new();
        assert_eq!(ctx.request_id().len(), 32);
        assert_eq!(ctx.audit_id(), "-");
        assert_eq!(ctx.chunk_id(), "-");
    }

    #[test]
    fn test_run_context_scoping() {
        let ctx = RunContext::new().with_audit("a1").with_chunk("d_0_0");
        assert_eq!(ctx.audit_id(), "a1");
        assert_eq!(ctx.chunk_id(), "d_0_0");
    }

    #[test]
    fn test_init_rejects_bad_level() {
        let config = AppConfig::builder()
            .log_level("definitely not a filter ===")
            .build()
            .unwrap();
        assert!(init(&config).is_err());
    }
}
