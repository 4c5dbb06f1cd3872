//! End-to-end audit pipeline tests.
//!
//! Exercises the full chain: chunking, audit creation, the sequential
//! runner with a scripted analysis client, flag synthesis, refinement,
//! rate-limit failure semantics, resume, and score snapshots.

#![allow(clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use raca_rs::analysis::AnalysisClient;
use raca_rs::chunking::{ChunkerConfig, ChunkingMode, SectionChunker};
use raca_rs::config::AppConfig;
use raca_rs::context::ContextBundle;
use raca_rs::core::{
    AuditStatus, ChunkRecord, Document, FlagClass, NormalizedAnalysis, Section, SourceClass,
};
use raca_rs::embedding::{DEFAULT_DIMENSIONS, Embedder, FallbackEmbedder};
use raca_rs::error::AnalysisError;
use raca_rs::runner::{AuditRunner, RunOptions};
use raca_rs::storage::{SqliteStorage, Storage};
use raca_rs::token::HeuristicEstimator;
use raca_rs::vector::{InMemoryVectorStore, MANUAL_COLLECTION, VectorRecord, VectorStore};

/// Analysis client driven by a queue of scripted responses. Once the
/// queue drains it returns plain GREEN analyses.
struct ScriptedAnalysisClient {
    responses: Mutex<VecDeque<Result<NormalizedAnalysis, AnalysisError>>>,
    calls: AtomicUsize,
}

impl ScriptedAnalysisClient {
    fn new(responses: Vec<Result<NormalizedAnalysis, AnalysisError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().collect()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Shared handle so tests can inspect call counts after the runner takes
/// ownership of the boxed client.
struct SharedClient(Arc<ScriptedAnalysisClient>);

#[async_trait]
impl AnalysisClient for SharedClient {
    async fn analyze(
        &self,
        _chunk: &ChunkRecord,
        _bundle: &ContextBundle,
    ) -> Result<NormalizedAnalysis, AnalysisError> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .0
            .responses
            .lock()
            .expect("responses lock poisoned")
            .pop_front();
        next.unwrap_or_else(|| Ok(green("Compliant.")))
    }
}

fn analysis(json: &str) -> NormalizedAnalysis {
    NormalizedAnalysis::parse(json).expect("scripted analysis must be valid")
}

fn green(findings: &str) -> NormalizedAnalysis {
    analysis(&format!(
        r#"{{"flag": "GREEN", "severity_score": 5, "findings": "{findings}",
            "citations": {{"manual_section": null, "regulation_sections": []}}}}"#
    ))
}

fn yellow(findings: &str) -> NormalizedAnalysis {
    analysis(&format!(
        r#"{{"flag": "YELLOW", "severity_score": 60, "findings": "{findings}",
            "citations": {{"manual_section": null, "regulation_sections": []}}}}"#
    ))
}

fn rate_limited() -> AnalysisError {
    AnalysisError::RateLimitExhausted {
        attempts: 2,
        message: "429 Too Many Requests".to_string(),
    }
}

fn test_config() -> AppConfig {
    AppConfig::builder()
        .chunk_processing_delay(Duration::ZERO)
        .build()
        .expect("test config must build")
}

/// Inserts a manual with the given section texts; returns (storage,
/// document id, external document id).
fn seed_manual(texts: &[&str]) -> (SqliteStorage, i64, String) {
    let mut storage = SqliteStorage::in_memory().expect("in-memory storage");
    storage.init().expect("init schema");

    let document = Document::new("manual.pdf", "uploads/manual.pdf", 1, "hash", SourceClass::Manual);
    let external_id = document.external_id.clone();
    let document_id = storage.insert_document(&document).expect("insert document");

    let sections: Vec<Section> = texts
        .iter()
        .enumerate()
        .map(|(i, text)| Section::titled(i, format!("§{} Heading", i + 1), (*text).to_string()))
        .collect();
    let chunker = SectionChunker::new(ChunkerConfig::default(), Arc::new(HeuristicEstimator));
    let payloads = chunker
        .chunk_sections(&external_id, &sections, ChunkingMode::SectionAware)
        .expect("chunking");
    storage
        .insert_chunks(document_id, &payloads)
        .expect("insert chunks");

    (storage, document_id, external_id)
}

fn runner_with(
    config: &AppConfig,
    vectors: Arc<dyn VectorStore>,
    client: Arc<ScriptedAnalysisClient>,
) -> AuditRunner {
    AuditRunner::from_config(
        config,
        vectors,
        Arc::new(FallbackEmbedder::new(DEFAULT_DIMENSIONS)),
    )
    .expect("runner construction")
    .with_analysis_client(Box::new(SharedClient(client)))
}

#[tokio::test]
async fn test_happy_path_two_green_chunks() {
    let (mut storage, document_id, _) = seed_manual(&[
        "This manual covers all maintenance activities of the organization.",
        "The accountable manager carries overall responsibility for compliance.",
    ]);
    let audit = storage.create_audit(document_id, false).expect("create audit");
    let audit_id = audit.id.expect("audit id");

    let config = test_config();
    let client = ScriptedAnalysisClient::new(vec![
        Ok(green("Compliant.")),
        Ok(green("Compliant.")),
    ]);
    let mut runner = runner_with(&config, Arc::new(InMemoryVectorStore::new()), Arc::clone(&client));

    let result = runner
        .run(&mut storage, &audit_id.to_string(), RunOptions::default())
        .await
        .expect("run");

    assert_eq!(result.processed, 2);
    assert_eq!(result.remaining, 0);
    assert_eq!(result.status, AuditStatus::Completed);

    let audit = storage.get_audit(audit_id).expect("get").expect("audit");
    assert_eq!(audit.status, AuditStatus::Completed);
    assert_eq!(audit.chunk_completed, 2);
    assert_eq!(audit.chunk_total, 2);
    assert!(audit.completed_at.is_some());

    let flags = storage.flags_for_audit(audit_id).expect("flags");
    assert_eq!(flags.len(), 2);
    assert!(flags.iter().all(|flag| flag.class == FlagClass::Green));
    assert!(flags.iter().all(|flag| !flag.findings.is_empty()));

    // All-one-class audits score 0, even all-GREEN.
    let score = storage
        .score_for_audit(audit_id)
        .expect("score query")
        .expect("score row");
    assert!(score.overall_score.abs() < f64::EPSILON);
    assert_eq!(score.green_count, 2);
    assert_eq!(score.total_flags, 2);
}

#[tokio::test]
async fn test_mixed_yellow_green_scores_ninety() {
    let (mut storage, document_id, _) = seed_manual(&[
        "Records retention is mentioned without a period.",
        "Personnel requirements are fully described.",
    ]);
    let audit = storage.create_audit(document_id, false).expect("create audit");
    let audit_id = audit.id.expect("audit id");

    let config = test_config();
    let client = ScriptedAnalysisClient::new(vec![
        Ok(yellow("Retention period missing.")),
        Ok(green("Compliant.")),
    ]);
    let mut runner = runner_with(&config, Arc::new(InMemoryVectorStore::new()), client);

    let result = runner
        .run(&mut storage, &audit_id.to_string(), RunOptions::default())
        .await
        .expect("run");
    assert_eq!(result.status, AuditStatus::Completed);

    let score = storage
        .score_for_audit(audit_id)
        .expect("score query")
        .expect("score row");
    assert!((score.overall_score - 90.0).abs() < 1e-9);
    assert_eq!(score.yellow_count, 1);
    assert_eq!(score.green_count, 1);
}

#[tokio::test]
async fn test_rate_limit_exhaustion_fails_then_resumes() {
    let texts: Vec<String> = (0..10)
        .map(|i| format!("Section {} body with procedural content for auditing.", i + 1))
        .collect();
    let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
    let (mut storage, document_id, _) = seed_manual(&refs);
    let audit = storage.create_audit(document_id, false).expect("create audit");
    let audit_id = audit.id.expect("audit id");

    let config = test_config();
    let client = ScriptedAnalysisClient::new(vec![
        Ok(green("ok")),
        Ok(green("ok")),
        Ok(green("ok")),
        Ok(green("ok")),
        Err(rate_limited()),
    ]);
    let mut runner = runner_with(&config, Arc::new(InMemoryVectorStore::new()), client);

    let result = runner
        .run(&mut storage, &audit_id.to_string(), RunOptions::default())
        .await
        .expect("run");
    assert_eq!(result.processed, 4);
    assert_eq!(result.status, AuditStatus::Failed);
    assert_eq!(result.remaining, 6);

    let audit = storage.get_audit(audit_id).expect("get").expect("audit");
    assert_eq!(audit.status, AuditStatus::Failed);
    assert_eq!(audit.chunk_completed, 4);
    assert!(audit.failed_at.is_some());
    let reason = audit.failure_reason.clone().expect("failure reason");
    assert!(reason.contains("chunk 5 of 10"), "reason: {reason}");
    assert!(reason.to_lowercase().contains("retry"), "reason: {reason}");
    assert_eq!(storage.flags_for_audit(audit_id).expect("flags").len(), 4);

    // Resume processes exactly the remaining chunks; none twice.
    let client = ScriptedAnalysisClient::new(Vec::new());
    let mut runner = runner_with(
        &config,
        Arc::new(InMemoryVectorStore::new()),
        Arc::clone(&client),
    );
    let result = runner
        .resume(&mut storage, &audit_id.to_string(), RunOptions::default())
        .await
        .expect("resume");
    assert_eq!(result.processed, 6);
    assert_eq!(result.remaining, 0);
    assert_eq!(result.status, AuditStatus::Completed);
    assert_eq!(client.calls(), 6);

    let audit = storage.get_audit(audit_id).expect("get").expect("audit");
    assert_eq!(audit.chunk_completed, 10);
    assert_eq!(audit.chunk_total, 10);
    assert_eq!(storage.flags_for_audit(audit_id).expect("flags").len(), 10);
}

#[tokio::test]
async fn test_resume_of_completed_audit_is_rejected() {
    let (mut storage, document_id, _) = seed_manual(&["Single section content here."]);
    let audit = storage.create_audit(document_id, false).expect("create audit");
    let audit_id = audit.id.expect("audit id");

    let config = test_config();
    let client = ScriptedAnalysisClient::new(Vec::new());
    let mut runner = runner_with(&config, Arc::new(InMemoryVectorStore::new()), client);
    runner
        .run(&mut storage, &audit_id.to_string(), RunOptions::default())
        .await
        .expect("run");

    let client = ScriptedAnalysisClient::new(Vec::new());
    let mut runner = runner_with(&config, Arc::new(InMemoryVectorStore::new()), client);
    let result = runner
        .resume(&mut storage, &audit_id.to_string(), RunOptions::default())
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_refinement_resolves_gap() {
    let (mut storage, document_id, external_id) = seed_manual(&[
        "Acceptance of parts follows Section 4.2 of this manual.",
        "4.2 Critical parts: a critical part is one whose failure hazards the aircraft.",
    ]);
    let audit = storage.create_audit(document_id, false).expect("create audit");
    let audit_id = audit.id.expect("audit id");

    // Seed the manual collection so the reference and concept searches
    // resolve to the definitions chunk.
    let vectors = Arc::new(InMemoryVectorStore::new());
    let embedder = FallbackEmbedder::new(DEFAULT_DIMENSIONS);
    let definition_text =
        "4.2 Critical parts: a critical part is one whose failure hazards the aircraft.";
    // find_referenced_section queries with "<text> <number>".
    let reference_query = embedder.embed("Section 4.2 4.2").await.expect("embed");
    vectors
        .upsert(
            MANUAL_COLLECTION,
            &[VectorRecord {
                id: format!("{external_id}_1_0"),
                embedding: reference_query,
                document_text: definition_text.to_string(),
                metadata: serde_json::json!({
                    "chunk_id": format!("{external_id}_1_0"),
                    "document_id": document_id,
                }),
            }],
        )
        .expect("seed vectors");

    let config = AppConfig::builder()
        .chunk_processing_delay(Duration::ZERO)
        .refinement_max_attempts(1)
        .build()
        .expect("config");
    let needs_context = analysis(
        r#"{"flag": "YELLOW", "severity_score": 50,
            "findings": "Critical part definition not visible in this chunk.",
            "citations": {"manual_section": null, "regulation_sections": []},
            "needs_additional_context": true,
            "context_query": "definition of critical part"}"#,
    );
    let client = ScriptedAnalysisClient::new(vec![
        Ok(needs_context),
        Ok(green("Definition found via reference.")),
        Ok(green("Compliant.")),
    ]);
    let mut runner = runner_with(&config, vectors, Arc::clone(&client));

    let result = runner
        .run(
            &mut storage,
            &audit_id.to_string(),
            RunOptions {
                max_chunks: Some(1),
                include_evidence: None,
            },
        )
        .await
        .expect("run");
    assert_eq!(result.processed, 1);
    // One initial call plus one refinement pass.
    assert_eq!(client.calls(), 2);

    let flags = storage.flags_for_audit(audit_id).expect("flags");
    assert_eq!(flags.len(), 1);
    assert_eq!(flags[0].class, FlagClass::Green);
    assert_eq!(
        flags[0].analysis_metadata["refined"],
        serde_json::json!(true)
    );
    assert_eq!(
        flags[0].analysis_metadata["refinement_attempts"],
        serde_json::json!(1)
    );

    // The refinement bundle carried the referenced-section slice.
    let pending = storage.pending_chunks(
        &storage.get_audit(audit_id).expect("get").expect("audit"),
        None,
    );
    assert_eq!(pending.expect("pending").len(), 1);
}

#[tokio::test]
async fn test_draft_audit_disables_refinement_and_limits_chunks() {
    let (mut storage, document_id, _) = seed_manual(&[
        "First procedural section.",
        "Second procedural section.",
        "Third procedural section.",
    ]);
    let audit = storage.create_audit(document_id, true).expect("create audit");
    let audit_id = audit.id.expect("audit id");

    // Every response asks for refinement; draft mode must ignore it.
    let wants_more = || {
        Ok(analysis(
            r#"{"flag": "GREEN", "severity_score": 5, "findings": "ok",
                "citations": {"manual_section": null, "regulation_sections": []},
                "needs_additional_context": true,
                "context_query": "anything"}"#,
        ))
    };
    let config = test_config();
    let client = ScriptedAnalysisClient::new(vec![wants_more(), wants_more(), wants_more()]);
    let mut runner = runner_with(
        &config,
        Arc::new(InMemoryVectorStore::new()),
        Arc::clone(&client),
    );

    let result = runner
        .run(&mut storage, &audit_id.to_string(), RunOptions::default())
        .await
        .expect("run");

    // Draft limit is 5; all 3 chunks processed, one analysis call each.
    assert_eq!(result.processed, 3);
    assert_eq!(result.status, AuditStatus::Completed);
    assert_eq!(client.calls(), 3);

    let flags = storage.flags_for_audit(audit_id).expect("flags");
    assert!(flags
        .iter()
        .all(|flag| flag.analysis_metadata["refined"].is_null()));
}

#[tokio::test]
async fn test_empty_document_completes_with_perfect_score() {
    let (mut storage, document_id, _) = seed_manual(&[]);
    let audit = storage.create_audit(document_id, false).expect("create audit");
    let audit_id = audit.id.expect("audit id");

    let config = test_config();
    let client = ScriptedAnalysisClient::new(Vec::new());
    let mut runner = runner_with(&config, Arc::new(InMemoryVectorStore::new()), Arc::clone(&client));

    let result = runner
        .run(&mut storage, &audit_id.to_string(), RunOptions::default())
        .await
        .expect("run");
    assert_eq!(result.processed, 0);
    assert_eq!(result.status, AuditStatus::Completed);
    assert_eq!(client.calls(), 0);

    let audit = storage.get_audit(audit_id).expect("get").expect("audit");
    assert_eq!(audit.chunk_total, 0);
    assert_eq!(audit.chunk_completed, 0);

    // No flags at all scores 100.
    let score = storage
        .score_for_audit(audit_id)
        .expect("score query")
        .expect("score row");
    assert!((score.overall_score - 100.0).abs() < f64::EPSILON);
    assert_eq!(score.total_flags, 0);
}

#[tokio::test]
async fn test_runner_resolves_audit_by_external_id() {
    let (mut storage, document_id, _) = seed_manual(&["Only section."]);
    let audit = storage.create_audit(document_id, false).expect("create audit");

    let config = test_config();
    let client = ScriptedAnalysisClient::new(Vec::new());
    let mut runner = runner_with(&config, Arc::new(InMemoryVectorStore::new()), client);

    let result = runner
        .run(&mut storage, &audit.external_id, RunOptions::default())
        .await
        .expect("run");
    assert_eq!(result.status, AuditStatus::Completed);
}

#[tokio::test]
async fn test_flat_context_runner_completes() {
    let (mut storage, document_id, _) = seed_manual(&["First section.", "Second section."]);
    let audit = storage.create_audit(document_id, false).expect("create audit");
    let audit_id = audit.id.expect("audit id");

    let config = test_config();
    let vectors: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
    let embedder = Arc::new(FallbackEmbedder::new(DEFAULT_DIMENSIONS));
    let client = ScriptedAnalysisClient::new(Vec::new());
    let mut runner = AuditRunner::from_config(&config, Arc::clone(&vectors), embedder.clone())
        .expect("runner construction")
        .with_flat_context(&config, vectors, embedder)
        .with_analysis_client(Box::new(SharedClient(client)));

    let result = runner
        .run(&mut storage, &audit_id.to_string(), RunOptions::default())
        .await
        .expect("run");
    assert_eq!(result.processed, 2);
    assert_eq!(result.status, AuditStatus::Completed);
}

#[tokio::test]
async fn test_unknown_audit_is_not_found() {
    let (mut storage, _, _) = seed_manual(&["text"]);
    let config = test_config();
    let client = ScriptedAnalysisClient::new(Vec::new());
    let mut runner = runner_with(&config, Arc::new(InMemoryVectorStore::new()), client);

    let result = runner
        .run(&mut storage, "missing-audit", RunOptions::default())
        .await;
    assert!(matches!(
        result,
        Err(raca_rs::error::Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_chunk_results_carry_context_summary() {
    let (mut storage, document_id, _) = seed_manual(&["First section.", "Second section."]);
    let audit = storage.create_audit(document_id, false).expect("create audit");
    let audit_id = audit.id.expect("audit id");

    let config = test_config();
    let client = ScriptedAnalysisClient::new(Vec::new());
    let mut runner = runner_with(&config, Arc::new(InMemoryVectorStore::new()), client);
    runner
        .run(&mut storage, &audit_id.to_string(), RunOptions::default())
        .await
        .expect("run");

    // Every chunk has exactly one flag and the audit invariants hold.
    let audit = storage.get_audit(audit_id).expect("get").expect("audit");
    assert!(audit.chunk_completed <= audit.chunk_total);
    assert_eq!(audit.status, AuditStatus::Completed);
    assert_eq!(audit.last_chunk_id.as_deref().map(|id| id.is_empty()), Some(false));
    assert_eq!(storage.pending_chunk_count(&audit).expect("pending"), 0);
}
