//! Sequential audit runner.
//!
//! Drives context assembly, analysis, flag synthesis, and progress
//! bookkeeping for one audit at a time. Chunks are processed sequentially
//! in `chunk_index` order; each chunk's result and flag commit before the
//! progress counters advance, so observers only ever see pre-chunk or
//! post-chunk state. Completed chunks stay durable across failures and
//! are the basis for resume.

// Progress counters and token totals are non-negative and fit in i64.
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

pub mod metrics;
pub mod scheduler;

pub use metrics::MetricsCollector;
pub use scheduler::AuditScheduler;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::analysis::{AnalysisClient, create_analysis_client};
use crate::config::AppConfig;
use crate::context::builder::{ContextBuilder, ContextOptions};
use crate::context::recursive::{RecursiveContextBuilder, RecursiveOptions};
use crate::context::{ContextBundle, ContextSlice};
use crate::core::chunk::preview;
use crate::core::{Audit, AuditChunkResult, AuditStatus, ChunkRecord, NormalizedAnalysis};
use crate::embedding::Embedder;
use crate::error::{AnalysisError, Error, Result};
use crate::flagging::FlagSynthesizer;
use crate::logging::RunContext;
use crate::score::ScoreTracker;
use crate::storage::Storage;
use crate::vector::VectorStore;
use std::sync::Arc;

/// Draft audits process at most this many chunks by default.
const DRAFT_CHUNK_LIMIT: usize = 5;

/// Refinement attempt floor when recursive retrieval is active.
const RECURSIVE_REFINEMENT_FLOOR: u32 = 5;

/// After this many attempts, a repeated context query stops refinement.
const REFINEMENT_PROGRESS_CHECK_AFTER: u32 = 3;

/// Content previews in the persisted context summary are capped at this
/// many characters, and this many slices per bucket.
const SUMMARY_PREVIEW_CHARS: usize = 200;
const SUMMARY_SLICES_PER_BUCKET: usize = 20;

/// Per-run options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Caller-imposed chunk limit for this run.
    pub max_chunks: Option<usize>,
    /// Evidence retrieval override; defaults to non-draft audits only.
    pub include_evidence: Option<bool>,
}

/// Outcome of one runner invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerResult {
    /// Chunks processed by this invocation.
    pub processed: usize,
    /// Chunks still pending after this invocation.
    pub remaining: usize,
    /// Audit status after this invocation.
    pub status: AuditStatus,
}

/// Context retrieval strategy.
enum ContextRetriever {
    /// Recursive reference-following retrieval (the default).
    Recursive(RecursiveContextBuilder),
    /// Single-pass retrieval.
    Flat(ContextBuilder),
}

impl ContextRetriever {
    const fn is_recursive(&self) -> bool {
        matches!(self, Self::Recursive(_))
    }

    async fn build(
        &self,
        storage: &dyn Storage,
        chunk_id: &str,
        opts: ContextOptions,
        include_litigation: bool,
    ) -> Result<ContextBundle> {
        match self {
            Self::Recursive(builder) => {
                builder
                    .build_recursive_context(
                        storage,
                        chunk_id,
                        &RecursiveOptions {
                            base: opts,
                            include_litigation,
                        },
                    )
                    .await
            }
            Self::Flat(builder) => builder.build_context(storage, chunk_id, &opts).await,
        }
    }
}

/// Sequential runner responsible for executing queued audits
/// chunk-by-chunk.
///
/// One runner serves one audit task. The LLM call, vector retrieval, and
/// the inter-chunk delay are the task's suspension points; cancelling the
/// task between chunks leaves the audit `running` and resumable.
pub struct AuditRunner {
    config: AppConfig,
    retriever: ContextRetriever,
    analysis: Box<dyn AnalysisClient>,
    flag_synthesizer: FlagSynthesizer,
    score_tracker: ScoreTracker,
    metrics: MetricsCollector,
    ctx: RunContext,
}

impl AuditRunner {
    /// Creates a runner with recursive retrieval and the configured
    /// analysis client.
    ///
    /// # Errors
    ///
    /// Returns an error if the reference patterns fail to compile.
    pub fn from_config(
        config: &AppConfig,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let base = ContextBuilder::new(config, vectors, embedder);
        Ok(Self {
            config: config.clone(),
            retriever: ContextRetriever::Recursive(RecursiveContextBuilder::new(base)?),
            analysis: create_analysis_client(config),
            flag_synthesizer: FlagSynthesizer::new(),
            score_tracker: ScoreTracker::new(),
            metrics: MetricsCollector::new(),
            ctx: RunContext::new(),
        })
    }

    /// Replaces the analysis client (tests, alternative backends).
    #[must_use]
    pub fn with_analysis_client(mut self, client: Box<dyn AnalysisClient>) -> Self {
        self.analysis = client;
        self
    }

    /// Adopts the caller's correlation context (the scheduler hands its
    /// request id down so task logs correlate with the scheduling log).
    #[must_use]
    pub fn with_run_context(mut self, ctx: RunContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Switches to single-pass retrieval.
    #[must_use]
    pub fn with_flat_context(
        mut self,
        config: &AppConfig,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        self.retriever = ContextRetriever::Flat(ContextBuilder::new(config, vectors, embedder));
        self
    }

    /// Resolves an audit by numeric id or external id.
    fn resolve_audit(storage: &dyn Storage, audit_ref: &str) -> Result<Audit> {
        let audit = if let Ok(id) = audit_ref.parse::<i64>() {
            storage.get_audit(id)?
        } else {
            storage.get_audit_by_external_id(audit_ref)?
        };
        audit.ok_or_else(|| Error::NotFound {
            entity: "audit",
            identifier: audit_ref.to_string(),
        })
    }

    /// Resumes a non-completed audit: transitions `failed` back to
    /// `running` and processes the remaining chunks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when the audit is already completed
    /// and [`Error::NotFound`] when it does not exist.
    pub async fn resume(
        &mut self,
        storage: &mut dyn Storage,
        audit_ref: &str,
        opts: RunOptions,
    ) -> Result<RunnerResult> {
        let mut audit = Self::resolve_audit(&*storage, audit_ref)?;
        match audit.status {
            AuditStatus::Completed => {
                return Err(Error::Validation {
                    message: format!("audit '{audit_ref}' is already completed"),
                });
            }
            AuditStatus::Failed => {
                audit.status = AuditStatus::Running;
                storage.update_audit(&audit)?;
                let ctx = self.ctx.clone().with_audit(audit.external_id.clone());
                info!(
                    request_id = %ctx.request_id(),
                    audit_id = %ctx.audit_id(),
                    "resuming failed audit"
                );
            }
            AuditStatus::Queued | AuditStatus::Running => {}
        }
        self.run(storage, audit_ref, opts).await
    }

    /// Executes the audit's pending chunks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the audit does not exist. Chunk
    /// processing failures do not surface as errors: they transition the
    /// audit to `failed` and are reported through the result status.
    pub async fn run(
        &mut self,
        storage: &mut dyn Storage,
        audit_ref: &str,
        opts: RunOptions,
    ) -> Result<RunnerResult> {
        let mut audit = Self::resolve_audit(&*storage, audit_ref)?;
        // All events of this invocation carry the same correlation ids.
        let ctx = self.ctx.clone().with_audit(audit.external_id.clone());
        info!(
            request_id = %ctx.request_id(),
            audit_id = %ctx.audit_id(),
            is_draft = audit.is_draft,
            status = audit.status.as_str(),
            "starting compliance runner"
        );

        if !audit.status.is_runnable() {
            info!(
                audit_id = %ctx.audit_id(),
                status = audit.status.as_str(),
                "audit already in terminal status"
            );
            return Ok(RunnerResult {
                processed: 0,
                remaining: storage.pending_chunk_count(&audit)?,
                status: audit.status,
            });
        }

        audit.status = AuditStatus::Running;
        if audit.started_at.is_none() {
            audit.started_at = Some(Utc::now());
        }
        // Populate chunk_total and commit before processing, so observers
        // see progress bounds immediately.
        if audit.chunk_total == 0 {
            audit.chunk_total = storage.chunk_count(audit.document_id)? as i64;
        }
        storage.update_audit(&audit)?;

        let effective_limit = opts
            .max_chunks
            .or_else(|| audit.is_draft.then_some(DRAFT_CHUNK_LIMIT));
        let include_evidence = opts.include_evidence.unwrap_or(!audit.is_draft);

        let pending = storage.pending_chunks(&audit, effective_limit)?;
        info!(
            audit_id = %ctx.audit_id(),
            chunks_found = pending.len(),
            limit = ?effective_limit,
            chunk_total = audit.chunk_total,
            chunk_completed = audit.chunk_completed,
            "retrieved pending chunks"
        );
        if pending.is_empty() && audit.chunk_total > 0 && audit.chunk_completed == 0 {
            warn!(
                audit_id = %ctx.audit_id(),
                document_id = audit.document_id,
                "audit has chunks but none are pending"
            );
        }

        let mut processed = 0usize;
        let total_batch = pending.len();
        for (batch_index, chunk) in pending.iter().enumerate() {
            let chunk_ctx = ctx.clone().with_chunk(chunk.chunk_id.clone());
            info!(
                audit_id = %chunk_ctx.audit_id(),
                chunk_id = %chunk_ctx.chunk_id(),
                chunk_index = chunk.chunk_index,
                progress = format!("{}/{total_batch}", batch_index + 1),
                "processing chunk"
            );

            match self
                .process_chunk(storage, &mut audit, chunk, include_evidence, &chunk_ctx)
                .await
            {
                Ok(tokens) => {
                    processed += 1;
                    self.metrics.record_chunk_processed(tokens);
                }
                Err(Error::Analysis(e)) if e.is_rate_limit() => {
                    error!(
                        request_id = %chunk_ctx.request_id(),
                        audit_id = %chunk_ctx.audit_id(),
                        chunk_id = %chunk_ctx.chunk_id(),
                        error = %e,
                        "rate limit exhausted during audit processing"
                    );
                    audit.status = AuditStatus::Failed;
                    audit.failed_at = Some(Utc::now());
                    audit.set_failure_reason(&format!(
                        "Rate limit exceeded while processing chunk {} of {}. \
                         Please wait a few minutes and retry the audit. \
                         Progress: {}/{} chunks completed.",
                        processed + 1,
                        audit.chunk_total,
                        audit.chunk_completed,
                        audit.chunk_total,
                    ));
                    storage.update_audit(&audit)?;
                    self.metrics.emit();
                    return Ok(RunnerResult {
                        processed,
                        remaining: storage.pending_chunk_count(&audit)?,
                        status: AuditStatus::Failed,
                    });
                }
                Err(e) => {
                    error!(
                        request_id = %chunk_ctx.request_id(),
                        audit_id = %chunk_ctx.audit_id(),
                        chunk_id = %chunk_ctx.chunk_id(),
                        error = %e,
                        "audit failed"
                    );
                    audit.status = AuditStatus::Failed;
                    audit.failed_at = Some(Utc::now());
                    audit.set_failure_reason(&e.to_string());
                    storage.update_audit(&audit)?;
                    self.metrics.emit();
                    return Ok(RunnerResult {
                        processed,
                        remaining: storage.pending_chunk_count(&audit)?,
                        status: AuditStatus::Failed,
                    });
                }
            }

            // Pace requests to stay clear of rate limits; no delay after
            // the final chunk.
            if batch_index + 1 < total_batch && !self.config.chunk_processing_delay.is_zero() {
                debug!(
                    delay_secs = self.config.chunk_processing_delay.as_secs_f64(),
                    "inter-chunk delay"
                );
                tokio::time::sleep(self.config.chunk_processing_delay).await;
            }
        }

        let remaining = storage.pending_chunk_count(&audit)?;
        if remaining == 0 {
            audit.status = AuditStatus::Completed;
            audit.completed_at = Some(Utc::now());
            self.metrics.emit();
            if let Some(audit_id) = audit.id {
                if let Err(e) = self.score_tracker.record_score(storage, audit_id) {
                    warn!(audit_id = %ctx.audit_id(), error = %e, "failed to record compliance score");
                }
            }
            // The durable transition to completed lands strictly after the
            // last chunk's commit and the score snapshot attempt.
            storage.update_audit(&audit)?;
            info!(
                request_id = %ctx.request_id(),
                audit_id = %ctx.audit_id(),
                chunks_processed = processed,
                "audit completed successfully"
            );
        } else {
            storage.update_audit(&audit)?;
            info!(
                request_id = %ctx.request_id(),
                audit_id = %ctx.audit_id(),
                chunks_remaining = remaining,
                chunks_processed = processed,
                "audit paused with chunks remaining"
            );
        }

        Ok(RunnerResult {
            processed,
            remaining,
            status: audit.status,
        })
    }

    /// Processes one chunk: context, analysis with optional refinement,
    /// durable result, flag, and progress. Returns the context token count
    /// for metrics.
    async fn process_chunk(
        &self,
        storage: &mut dyn Storage,
        audit: &mut Audit,
        chunk: &ChunkRecord,
        include_evidence: bool,
        ctx: &RunContext,
    ) -> Result<u64> {
        let audit_id = audit.id.ok_or_else(|| Error::Validation {
            message: "audit has no id".to_string(),
        })?;

        let (analysis, bundle) = self
            .analyze_with_optional_refinement(storage, chunk, include_evidence, audit.is_draft, ctx)
            .await?;
        debug!(
            chunk_id = %ctx.chunk_id(),
            flag = analysis.flag.as_str(),
            needs_context = analysis.needs_additional_context,
            "analysis completed"
        );

        let mut analysis_value = analysis.to_value();
        if let Value::Object(map) = &mut analysis_value {
            map.insert("context_summary".to_string(), context_summary(&bundle));
        }

        storage.insert_chunk_result(&AuditChunkResult {
            id: None,
            audit_id,
            chunk_id: chunk.chunk_id.clone(),
            chunk_index: chunk.chunk_index,
            status: "completed".to_string(),
            analysis: analysis_value,
            context_token_count: Some(bundle.total_tokens as i64),
        })?;
        self.flag_synthesizer
            .upsert_flag(storage, audit_id, &chunk.chunk_id, &analysis)?;

        audit.chunk_completed += 1;
        audit.last_chunk_id = Some(chunk.chunk_id.clone());
        storage.update_audit(audit)?;

        Ok(bundle.total_tokens as u64)
    }

    /// Runs the analysis, then bounded agent-requested refinement passes.
    ///
    /// Refinement is disabled for draft audits. Each pass rebuilds the
    /// bundle with a wider neighbor window and a raised budget multiplier,
    /// seeding the agent's query into the concept search. After three
    /// passes a repeated query stops the loop.
    async fn analyze_with_optional_refinement(
        &self,
        storage: &dyn Storage,
        chunk: &ChunkRecord,
        include_evidence: bool,
        is_draft: bool,
        ctx: &RunContext,
    ) -> Result<(NormalizedAnalysis, ContextBundle)> {
        let neighbor_window = is_draft.then_some(0);
        let budget_multiplier = if is_draft { 0.5 } else { 1.0 };

        info!(
            audit_id = %ctx.audit_id(),
            chunk_id = %ctx.chunk_id(),
            draft = is_draft,
            evidence = include_evidence,
            recursive = self.retriever.is_recursive(),
            "building retrieval context"
        );
        let mut bundle = self
            .retriever
            .build(
                storage,
                &chunk.chunk_id,
                ContextOptions {
                    include_evidence,
                    neighbor_window,
                    budget_multiplier,
                    context_query: None,
                },
                true,
            )
            .await?;
        let mut analysis = self.analyze_bundle(chunk, &bundle).await?;

        let mut max_attempts = if is_draft {
            0
        } else {
            self.config.refinement_max_attempts
        };
        if !is_draft && self.retriever.is_recursive() {
            max_attempts = max_attempts.max(RECURSIVE_REFINEMENT_FLOOR);
        }

        let mut attempts: u32 = 0;
        while analysis.needs_additional_context && attempts < max_attempts {
            attempts += 1;
            let Some(context_query) = analysis.context_query.clone() else {
                warn!(
                    chunk_id = %ctx.chunk_id(),
                    attempt = attempts,
                    "refinement requested without a context query; stopping"
                );
                break;
            };
            info!(
                audit_id = %ctx.audit_id(),
                chunk_id = %ctx.chunk_id(),
                attempt = attempts,
                max_attempts,
                query = %preview(&context_query, 100),
                "refinement pass"
            );

            bundle = self
                .retriever
                .build(
                    storage,
                    &chunk.chunk_id,
                    ContextOptions {
                        include_evidence: self.config.refinement_include_evidence
                            || include_evidence,
                        neighbor_window: Some(self.config.refinement_manual_window),
                        budget_multiplier: self.config.refinement_token_multiplier.max(1.0),
                        context_query: Some(context_query.clone()),
                    },
                    true,
                )
                .await?;
            analysis = self.analyze_bundle(chunk, &bundle).await?;

            if analysis.needs_additional_context
                && attempts >= REFINEMENT_PROGRESS_CHECK_AFTER
                && analysis.context_query.as_deref() == Some(context_query.as_str())
            {
                info!(
                    chunk_id = %ctx.chunk_id(),
                    attempts,
                    "context query unchanged; stopping refinement"
                );
                break;
            }
        }

        if attempts > 0 {
            analysis.refined = Some(true);
            analysis.refinement_attempts = Some(attempts);
        }

        Ok((analysis, bundle))
    }

    async fn analyze_bundle(
        &self,
        chunk: &ChunkRecord,
        bundle: &ContextBundle,
    ) -> Result<NormalizedAnalysis> {
        self.analysis
            .analyze(chunk, bundle)
            .await
            .map_err(|e: AnalysisError| e.into())
    }
}

/// Builds the persisted context summary: totals, per-bucket counts, and
/// bounded content previews.
fn context_summary(bundle: &ContextBundle) -> Value {
    let preview_slices = |slices: &[ContextSlice]| -> Value {
        Value::Array(
            slices
                .iter()
                .take(SUMMARY_SLICES_PER_BUCKET)
                .map(|slice| {
                    let content_preview = if slice.content.len() > SUMMARY_PREVIEW_CHARS {
                        format!("{}...", preview(&slice.content, SUMMARY_PREVIEW_CHARS))
                    } else {
                        slice.content.clone()
                    };
                    json!({
                        "label": slice.label,
                        "content_preview": content_preview,
                        "tokens": slice.token_count,
                        "metadata": slice.metadata,
                        "score": slice.score,
                    })
                })
                .collect(),
        )
    };

    json!({
        "total_tokens": bundle.total_tokens,
        "truncated": bundle.truncated,
        "token_breakdown": bundle.token_breakdown,
        "manual_neighbors_count": bundle.manual_neighbors.len(),
        "regulation_slices_count": bundle.regulation_slices.len(),
        "guidance_slices_count": bundle.guidance_slices.len(),
        "evidence_slices_count": bundle.evidence_slices.len(),
        "manual_neighbors": preview_slices(&bundle.manual_neighbors),
        "regulation_slices": preview_slices(&bundle.regulation_slices),
        "guidance_slices": preview_slices(&bundle.guidance_slices),
        "evidence_slices": preview_slices(&bundle.evidence_slices),
    })
}
