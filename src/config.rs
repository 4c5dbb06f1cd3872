//! Engine configuration with builder pattern and environment variable support.
//!
//! Configuration is resolved in order: explicit values → environment variables → defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;

/// Default chunk window size in tokens.
const DEFAULT_CHUNK_SIZE: usize = 800;
/// Default chunk window overlap in tokens.
const DEFAULT_CHUNK_OVERLAP: usize = 80;
/// Default cap on tokens taken from a single section before windowing.
const DEFAULT_MAX_SECTION_TOKENS: usize = 4000;
/// Default tokenizer name for chunking and budgeting.
const DEFAULT_TOKENIZER: &str = "cl100k_base";
/// Default sequential neighbor window around the focus chunk.
const DEFAULT_MANUAL_WINDOW: usize = 1;
/// Default per-bucket token budgets.
const DEFAULT_MANUAL_TOKEN_LIMIT: usize = 1200;
const DEFAULT_REGULATION_TOKEN_LIMIT: usize = 2000;
const DEFAULT_GUIDANCE_TOKEN_LIMIT: usize = 1500;
const DEFAULT_EVIDENCE_TOKEN_LIMIT: usize = 1000;
/// Default retrieval breadth per collection.
const DEFAULT_REGULATION_TOP_K: usize = 10;
const DEFAULT_GUIDANCE_TOP_K: usize = 5;
const DEFAULT_EVIDENCE_TOP_K: usize = 2;
/// Default global context budget in tokens.
const DEFAULT_TOTAL_TOKEN_LIMIT: usize = 6000;
/// Default refinement bounds.
const DEFAULT_REFINEMENT_MAX_ATTEMPTS: u32 = 1;
const DEFAULT_REFINEMENT_MANUAL_WINDOW: usize = 2;
const DEFAULT_REFINEMENT_TOKEN_MULTIPLIER: f64 = 1.5;
/// Default inter-chunk sleep in seconds.
const DEFAULT_CHUNK_PROCESSING_DELAY_SECS: f64 = 5.0;
/// Default rate-limit backoff base and cap in seconds.
const DEFAULT_RATE_LIMIT_BACKOFF_BASE_SECS: f64 = 10.0;
const DEFAULT_RATE_LIMIT_MAX_WAIT_SECS: f64 = 120.0;
/// Default LLM request timeout in seconds.
const DEFAULT_LLM_TIMEOUT_SECS: u64 = 60;
/// Default LLM retry budget.
const DEFAULT_LLM_MAX_RETRIES: u32 = 2;

/// Configuration for the audit engine.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite database path for relational state.
    pub database_url: String,
    /// Filesystem root for vector store, embedding cache, and logs.
    pub data_root: PathBuf,
    /// API key for the LLM endpoint. Empty selects the echo client.
    pub llm_api_key: String,
    /// Base URL of the OpenAI-compatible LLM endpoint.
    pub llm_api_base_url: String,
    /// Model used for compliance analysis.
    pub llm_model_compliance: String,
    /// Model used for query-side embedding generation.
    pub embedding_model: String,
    /// Base URL of the embeddings endpoint.
    pub embedding_api_base_url: String,
    /// Token-window size for the chunker.
    pub chunk_size: usize,
    /// Token-window overlap for the chunker.
    pub chunk_overlap: usize,
    /// Tokenizer name for the chunker.
    pub chunk_tokenizer: String,
    /// Cap on tokens taken from one section before windowing.
    pub chunk_max_section_tokens: usize,
    /// Sequential neighbor window for manual context.
    pub context_manual_window: usize,
    /// Per-bucket token budgets.
    pub context_manual_token_limit: usize,
    /// Regulation bucket budget.
    pub context_regulation_token_limit: usize,
    /// Guidance bucket budget.
    pub context_guidance_token_limit: usize,
    /// Evidence bucket budget.
    pub context_evidence_token_limit: usize,
    /// Regulation retrieval breadth.
    pub context_regulation_top_k: usize,
    /// Guidance retrieval breadth (applied to AMC and GM separately).
    pub context_guidance_top_k: usize,
    /// Evidence retrieval breadth.
    pub context_evidence_top_k: usize,
    /// Global context budget in tokens.
    pub context_total_token_limit: usize,
    /// Tokenizer used for budgeting and rendering.
    pub context_tokenizer: String,
    /// Maximum agent-requested refinement attempts per chunk.
    pub refinement_max_attempts: u32,
    /// Neighbor window used when rebuilding context for refinement.
    pub refinement_manual_window: usize,
    /// Budget multiplier used when rebuilding context for refinement.
    pub refinement_token_multiplier: f64,
    /// Whether refinement rebuilds include evidence context.
    pub refinement_include_evidence: bool,
    /// Inter-chunk sleep between analyses.
    pub chunk_processing_delay: Duration,
    /// Base wait for 429 exponential backoff.
    pub rate_limit_backoff_base: Duration,
    /// Cap on any single rate-limit wait.
    pub rate_limit_max_wait: Duration,
    /// Wall-clock timeout for one LLM request.
    pub llm_timeout: Duration,
    /// Retry budget for one analysis call.
    pub llm_max_retries: u32,
    /// Log level filter (e.g. "info", "raca_rs=debug").
    pub log_level: String,
    /// Emit JSON-formatted log lines.
    pub log_json: bool,
}

impl AppConfig {
    /// Creates a new builder for `AppConfig`.
    #[must_use]
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::default()
    }

    /// Creates configuration from environment variables with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a numeric variable fails to parse.
    pub fn from_env() -> Result<Self, Error> {
        Self::builder().from_env()?.build()
    }

    /// Path of the SQLite vector store under the data root.
    #[must_use]
    pub fn vector_store_path(&self) -> PathBuf {
        self.data_root.join("vectors.db")
    }

    /// Directory of the per-text query-embedding cache.
    #[must_use]
    pub fn embedding_cache_dir(&self) -> PathBuf {
        self.data_root.join("cache").join("embeddings")
    }

    /// Directory for log files.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.data_root.join("logs")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        // Builder defaults never fail without env overrides.
        AppConfigBuilder::default().build_unchecked()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, Error> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map(Some).map_err(|_| Error::Config {
            message: format!("invalid value for {name}: {raw}"),
        }),
        Err(_) => Ok(None),
    }
}

/// Builder for [`AppConfig`].
#[derive(Debug, Clone, Default)]
pub struct AppConfigBuilder {
    database_url: Option<String>,
    data_root: Option<PathBuf>,
    llm_api_key: Option<String>,
    llm_api_base_url: Option<String>,
    llm_model_compliance: Option<String>,
    embedding_model: Option<String>,
    embedding_api_base_url: Option<String>,
    chunk_size: Option<usize>,
    chunk_overlap: Option<usize>,
    chunk_tokenizer: Option<String>,
    chunk_max_section_tokens: Option<usize>,
    context_manual_window: Option<usize>,
    context_manual_token_limit: Option<usize>,
    context_regulation_token_limit: Option<usize>,
    context_guidance_token_limit: Option<usize>,
    context_evidence_token_limit: Option<usize>,
    context_regulation_top_k: Option<usize>,
    context_guidance_top_k: Option<usize>,
    context_evidence_top_k: Option<usize>,
    context_total_token_limit: Option<usize>,
    context_tokenizer: Option<String>,
    refinement_max_attempts: Option<u32>,
    refinement_manual_window: Option<usize>,
    refinement_token_multiplier: Option<f64>,
    refinement_include_evidence: Option<bool>,
    chunk_processing_delay: Option<Duration>,
    rate_limit_backoff_base: Option<Duration>,
    rate_limit_max_wait: Option<Duration>,
    llm_timeout: Option<Duration>,
    llm_max_retries: Option<u32>,
    log_level: Option<String>,
    log_json: Option<bool>,
}

impl AppConfigBuilder {
    /// Populates unset fields from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a numeric variable fails to parse.
    pub fn from_env(mut self) -> Result<Self, Error> {
        if self.database_url.is_none() {
            self.database_url = std::env::var("DATABASE_URL").ok();
        }
        if self.data_root.is_none() {
            self.data_root = std::env::var("DATA_ROOT").ok().map(PathBuf::from);
        }
        if self.llm_api_key.is_none() {
            self.llm_api_key = std::env::var("LLM_API_KEY").ok();
        }
        if self.llm_api_base_url.is_none() {
            self.llm_api_base_url = std::env::var("LLM_API_BASE_URL").ok();
        }
        if self.llm_model_compliance.is_none() {
            self.llm_model_compliance = std::env::var("LLM_MODEL_COMPLIANCE").ok();
        }
        if self.embedding_model.is_none() {
            self.embedding_model = std::env::var("EMBEDDING_MODEL").ok();
        }
        if self.embedding_api_base_url.is_none() {
            self.embedding_api_base_url = std::env::var("EMBEDDING_API_BASE_URL").ok();
        }
        if self.chunk_size.is_none() {
            self.chunk_size = env_parse("CHUNK_SIZE")?;
        }
        if self.chunk_overlap.is_none() {
            self.chunk_overlap = env_parse("CHUNK_OVERLAP")?;
        }
        if self.chunk_tokenizer.is_none() {
            self.chunk_tokenizer = std::env::var("CHUNK_TOKENIZER").ok();
        }
        if self.chunk_max_section_tokens.is_none() {
            self.chunk_max_section_tokens = env_parse("CHUNK_MAX_SECTION_TOKENS")?;
        }
        if self.context_manual_window.is_none() {
            self.context_manual_window = env_parse("CONTEXT_MANUAL_WINDOW")?;
        }
        if self.context_manual_token_limit.is_none() {
            self.context_manual_token_limit = env_parse("CONTEXT_MANUAL_TOKEN_LIMIT")?;
        }
        if self.context_regulation_token_limit.is_none() {
            self.context_regulation_token_limit = env_parse("CONTEXT_REGULATION_TOKEN_LIMIT")?;
        }
        if self.context_guidance_token_limit.is_none() {
            self.context_guidance_token_limit = env_parse("CONTEXT_GUIDANCE_TOKEN_LIMIT")?;
        }
        if self.context_evidence_token_limit.is_none() {
            self.context_evidence_token_limit = env_parse("CONTEXT_EVIDENCE_TOKEN_LIMIT")?;
        }
        if self.context_regulation_top_k.is_none() {
            self.context_regulation_top_k = env_parse("CONTEXT_REGULATION_TOP_K")?;
        }
        if self.context_guidance_top_k.is_none() {
            self.context_guidance_top_k = env_parse("CONTEXT_GUIDANCE_TOP_K")?;
        }
        if self.context_evidence_top_k.is_none() {
            self.context_evidence_top_k = env_parse("CONTEXT_EVIDENCE_TOP_K")?;
        }
        if self.context_total_token_limit.is_none() {
            self.context_total_token_limit = env_parse("CONTEXT_TOTAL_TOKEN_LIMIT")?;
        }
        if self.context_tokenizer.is_none() {
            self.context_tokenizer = std::env::var("CONTEXT_TOKENIZER").ok();
        }
        if self.refinement_max_attempts.is_none() {
            self.refinement_max_attempts = env_parse("REFINEMENT_MAX_ATTEMPTS")?;
        }
        if self.refinement_manual_window.is_none() {
            self.refinement_manual_window = env_parse("REFINEMENT_MANUAL_WINDOW")?;
        }
        if self.refinement_token_multiplier.is_none() {
            self.refinement_token_multiplier = env_parse("REFINEMENT_TOKEN_MULTIPLIER")?;
        }
        if self.refinement_include_evidence.is_none() {
            self.refinement_include_evidence = std::env::var("REFINEMENT_INCLUDE_EVIDENCE")
                .ok()
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"));
        }
        if self.chunk_processing_delay.is_none() {
            self.chunk_processing_delay =
                env_parse::<f64>("CHUNK_PROCESSING_DELAY")?.map(Duration::from_secs_f64);
        }
        if self.rate_limit_backoff_base.is_none() {
            self.rate_limit_backoff_base =
                env_parse::<f64>("RATE_LIMIT_BACKOFF_BASE")?.map(Duration::from_secs_f64);
        }
        if self.rate_limit_max_wait.is_none() {
            self.rate_limit_max_wait =
                env_parse::<f64>("RATE_LIMIT_MAX_WAIT")?.map(Duration::from_secs_f64);
        }
        if self.llm_timeout.is_none() {
            self.llm_timeout = env_parse::<u64>("LLM_TIMEOUT")?.map(Duration::from_secs);
        }
        if self.llm_max_retries.is_none() {
            self.llm_max_retries = env_parse("LLM_MAX_RETRIES")?;
        }
        if self.log_level.is_none() {
            self.log_level = std::env::var("LOG_LEVEL").ok();
        }
        if self.log_json.is_none() {
            self.log_json = std::env::var("LOG_JSON")
                .ok()
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"));
        }
        Ok(self)
    }

    /// Sets the SQLite database path.
    #[must_use]
    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Sets the data root directory.
    #[must_use]
    pub fn data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.data_root = Some(root.into());
        self
    }

    /// Sets the LLM API key.
    #[must_use]
    pub fn llm_api_key(mut self, key: impl Into<String>) -> Self {
        self.llm_api_key = Some(key.into());
        self
    }

    /// Sets the LLM endpoint base URL.
    #[must_use]
    pub fn llm_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.llm_api_base_url = Some(url.into());
        self
    }

    /// Sets the compliance analysis model.
    #[must_use]
    pub fn llm_model_compliance(mut self, model: impl Into<String>) -> Self {
        self.llm_model_compliance = Some(model.into());
        self
    }

    /// Sets the embedding model.
    #[must_use]
    pub fn embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = Some(model.into());
        self
    }

    /// Sets the chunk window size in tokens.
    #[must_use]
    pub const fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size);
        self
    }

    /// Sets the chunk window overlap in tokens.
    #[must_use]
    pub const fn chunk_overlap(mut self, overlap: usize) -> Self {
        self.chunk_overlap = Some(overlap);
        self
    }

    /// Sets the per-section token cap.
    #[must_use]
    pub const fn chunk_max_section_tokens(mut self, max: usize) -> Self {
        self.chunk_max_section_tokens = Some(max);
        self
    }

    /// Sets the sequential neighbor window.
    #[must_use]
    pub const fn context_manual_window(mut self, window: usize) -> Self {
        self.context_manual_window = Some(window);
        self
    }

    /// Sets the global context token budget.
    #[must_use]
    pub const fn context_total_token_limit(mut self, limit: usize) -> Self {
        self.context_total_token_limit = Some(limit);
        self
    }

    /// Sets the regulation bucket budget.
    #[must_use]
    pub const fn context_regulation_token_limit(mut self, limit: usize) -> Self {
        self.context_regulation_token_limit = Some(limit);
        self
    }

    /// Sets the refinement attempt bound.
    #[must_use]
    pub const fn refinement_max_attempts(mut self, attempts: u32) -> Self {
        self.refinement_max_attempts = Some(attempts);
        self
    }

    /// Sets the inter-chunk delay.
    #[must_use]
    pub const fn chunk_processing_delay(mut self, delay: Duration) -> Self {
        self.chunk_processing_delay = Some(delay);
        self
    }

    /// Sets the LLM retry budget.
    #[must_use]
    pub const fn llm_max_retries(mut self, retries: u32) -> Self {
        self.llm_max_retries = Some(retries);
        self
    }

    /// Sets the log level filter.
    #[must_use]
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    /// Enables or disables JSON log output.
    #[must_use]
    pub const fn log_json(mut self, enabled: bool) -> Self {
        self.log_json = Some(enabled);
        self
    }

    /// Builds the [`AppConfig`], validating cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the chunk overlap is not smaller
    /// than the chunk size.
    pub fn build(self) -> Result<AppConfig, Error> {
        let config = self.build_unchecked();
        if config.chunk_overlap >= config.chunk_size {
            return Err(Error::Config {
                message: format!(
                    "chunk_overlap ({}) must be less than chunk_size ({})",
                    config.chunk_overlap, config.chunk_size
                ),
            });
        }
        Ok(config)
    }

    fn build_unchecked(self) -> AppConfig {
        let chunk_tokenizer = self
            .chunk_tokenizer
            .unwrap_or_else(|| DEFAULT_TOKENIZER.to_string());
        AppConfig {
            database_url: self
                .database_url
                .unwrap_or_else(|| "data/app.db".to_string()),
            data_root: self.data_root.unwrap_or_else(|| PathBuf::from("./data")),
            llm_api_key: self.llm_api_key.unwrap_or_default(),
            llm_api_base_url: self
                .llm_api_base_url
                .unwrap_or_else(|| "https://openrouter.ai/api/v1".to_string()),
            llm_model_compliance: self
                .llm_model_compliance
                .unwrap_or_else(|| "openrouter/horizon-beta".to_string()),
            embedding_model: self
                .embedding_model
                .unwrap_or_else(|| "text-embedding-3-large".to_string()),
            embedding_api_base_url: self
                .embedding_api_base_url
                .unwrap_or_else(|| "https://openrouter.ai/api/v1".to_string()),
            chunk_size: self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            chunk_overlap: self.chunk_overlap.unwrap_or(DEFAULT_CHUNK_OVERLAP),
            chunk_tokenizer: chunk_tokenizer.clone(),
            chunk_max_section_tokens: self
                .chunk_max_section_tokens
                .unwrap_or(DEFAULT_MAX_SECTION_TOKENS),
            context_manual_window: self.context_manual_window.unwrap_or(DEFAULT_MANUAL_WINDOW),
            context_manual_token_limit: self
                .context_manual_token_limit
                .unwrap_or(DEFAULT_MANUAL_TOKEN_LIMIT),
            context_regulation_token_limit: self
                .context_regulation_token_limit
                .unwrap_or(DEFAULT_REGULATION_TOKEN_LIMIT),
            context_guidance_token_limit: self
                .context_guidance_token_limit
                .unwrap_or(DEFAULT_GUIDANCE_TOKEN_LIMIT),
            context_evidence_token_limit: self
                .context_evidence_token_limit
                .unwrap_or(DEFAULT_EVIDENCE_TOKEN_LIMIT),
            context_regulation_top_k: self
                .context_regulation_top_k
                .unwrap_or(DEFAULT_REGULATION_TOP_K),
            context_guidance_top_k: self
                .context_guidance_top_k
                .unwrap_or(DEFAULT_GUIDANCE_TOP_K),
            context_evidence_top_k: self
                .context_evidence_top_k
                .unwrap_or(DEFAULT_EVIDENCE_TOP_K),
            context_total_token_limit: self
                .context_total_token_limit
                .unwrap_or(DEFAULT_TOTAL_TOKEN_LIMIT),
            context_tokenizer: self.context_tokenizer.unwrap_or(chunk_tokenizer),
            refinement_max_attempts: self
                .refinement_max_attempts
                .unwrap_or(DEFAULT_REFINEMENT_MAX_ATTEMPTS),
            refinement_manual_window: self
                .refinement_manual_window
                .unwrap_or(DEFAULT_REFINEMENT_MANUAL_WINDOW),
            refinement_token_multiplier: self
                .refinement_token_multiplier
                .unwrap_or(DEFAULT_REFINEMENT_TOKEN_MULTIPLIER),
            refinement_include_evidence: self.refinement_include_evidence.unwrap_or(true),
            chunk_processing_delay: self
                .chunk_processing_delay
                .unwrap_or(Duration::from_secs_f64(DEFAULT_CHUNK_PROCESSING_DELAY_SECS)),
            rate_limit_backoff_base: self.rate_limit_backoff_base.unwrap_or(
                Duration::from_secs_f64(DEFAULT_RATE_LIMIT_BACKOFF_BASE_SECS),
            ),
            rate_limit_max_wait: self
                .rate_limit_max_wait
                .unwrap_or(Duration::from_secs_f64(DEFAULT_RATE_LIMIT_MAX_WAIT_SECS)),
            llm_timeout: self
                .llm_timeout
                .unwrap_or(Duration::from_secs(DEFAULT_LLM_TIMEOUT_SECS)),
            llm_max_retries: self.llm_max_retries.unwrap_or(DEFAULT_LLM_MAX_RETRIES),
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
            log_json: self.log_json.unwrap_or(false),
        }
    }
}
