//! Background audit execution.
//!
//! Audit runs and resumes happen off the request path: each scheduled
//! task opens a fresh storage handle, builds its own runner, and logs its
//! outcome. Task failures never propagate to the scheduler; the runner
//! has already moved the audit row to `failed`, and anything else is
//! logged and dropped.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::embedding::Embedder;
use crate::logging::RunContext;
use crate::runner::{AuditRunner, RunOptions};
use crate::storage::{SqliteStorage, Storage};
use crate::vector::VectorStore;

/// Schedules audit execution onto background tasks.
///
/// The scheduler holds no per-audit state; the shared vector store and
/// embedder are handed to each task's runner.
pub struct AuditScheduler {
    config: AppConfig,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
}

impl AuditScheduler {
    /// Creates a scheduler sharing the engine's vector store and embedder.
    #[must_use]
    pub fn new(
        config: AppConfig,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            config,
            vectors,
            embedder,
        }
    }

    /// Schedules an audit run on a background task and returns its
    /// handle. Dropping or aborting the handle between chunks leaves the
    /// audit resumable.
    #[must_use]
    pub fn schedule_run(&self, audit_ref: String, opts: RunOptions) -> JoinHandle<()> {
        self.spawn(audit_ref, opts, false)
    }

    /// Schedules a resume for a non-completed audit.
    #[must_use]
    pub fn schedule_resume(&self, audit_ref: String, opts: RunOptions) -> JoinHandle<()> {
        self.spawn(audit_ref, opts, true)
    }

    fn spawn(&self, audit_ref: String, opts: RunOptions, resume: bool) -> JoinHandle<()> {
        let config = self.config.clone();
        let vectors = Arc::clone(&self.vectors);
        let embedder = Arc::clone(&self.embedder);

        // One correlation context per scheduled task; the runner carries it
        // so every log of the run shares this request id.
        let ctx = RunContext::new();
        info!(
            request_id = %ctx.request_id(),
            audit_ref = %audit_ref,
            resume,
            "scheduling audit task"
        );
        tokio::spawn(async move {
            // Fresh session per task; no handle crosses the task boundary.
            let mut storage = match SqliteStorage::open(&config.database_url) {
                Ok(storage) => storage,
                Err(e) => {
                    error!(
                        request_id = %ctx.request_id(),
                        audit_ref = %audit_ref,
                        error = %e,
                        "audit task could not open storage"
                    );
                    return;
                }
            };
            if let Err(e) = storage.init() {
                error!(
                    request_id = %ctx.request_id(),
                    audit_ref = %audit_ref,
                    error = %e,
                    "audit task could not initialize storage"
                );
                return;
            }

            let mut runner = match AuditRunner::from_config(&config, vectors, embedder) {
                Ok(runner) => runner.with_run_context(ctx.clone()),
                Err(e) => {
                    error!(
                        request_id = %ctx.request_id(),
                        audit_ref = %audit_ref,
                        error = %e,
                        "audit task could not build runner"
                    );
                    return;
                }
            };

            let outcome = if resume {
                runner.resume(&mut storage, &audit_ref, opts).await
            } else {
                runner.run(&mut storage, &audit_ref, opts).await
            };
            match outcome {
                Ok(result) => info!(
                    request_id = %ctx.request_id(),
                    audit_ref = %audit_ref,
                    processed = result.processed,
                    remaining = result.remaining,
                    status = result.status.as_str(),
                    "audit task finished"
                ),
                // The runner has already recorded the failure on the audit
                // row where it could; the scheduler only logs.
                Err(e) => error!(
                    request_id = %ctx.request_id(),
                    audit_ref = %audit_ref,
                    error = %e,
                    "audit task failed"
                ),
            }
        })
    }
}
