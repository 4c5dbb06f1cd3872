//! CLI command implementations.
//!
//! Contains the business logic for each CLI command. Async work (audit
//! execution, embedding, question generation) runs on a runtime built
//! here; the CLI surface itself stays synchronous.

// Allow style choices for clarity
#![allow(clippy::format_push_string)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_wrap)]

use std::fmt::Write as FmtWrite;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::chunking::{ChunkerConfig, ChunkingMode, SectionChunker};
use crate::cli::output::{
    OutputFormat, format_audit_list, format_audit_status, format_flags, format_scores,
};
use crate::cli::parser::{AuditCommands, Cli, Commands};
use crate::config::AppConfig;
use crate::core::{
    Audit, AuditStatus, Document, DocumentStatus, EmbeddingStatus, Section, SourceClass,
};
use crate::embedding::{Embedder, create_embedder};
use crate::error::{Error, Result};
use crate::questions::QuestionGenerator;
use crate::runner::{AuditRunner, RunOptions};
use crate::score::ScoreTracker;
use crate::storage::{SqliteStorage, Storage};
use crate::token::create_estimator;
use crate::vector::{SqliteVectorStore, VectorRecord, VectorStore};

/// Executes the CLI command.
///
/// # Errors
///
/// Returns an error if the command fails to execute.
pub fn execute(cli: &Cli) -> Result<String> {
    let format = OutputFormat::parse(&cli.format);
    let mut config = AppConfig::from_env()?;
    config.database_url = cli.get_db_path().to_string_lossy().to_string();

    let runtime = tokio::runtime::Runtime::new().map_err(|e| Error::Config {
        message: format!("failed to start async runtime: {e}"),
    })?;

    match &cli.command {
        Commands::Init => cmd_init(&config),
        Commands::Ingest {
            file,
            source,
            organization,
        } => runtime.block_on(cmd_ingest(&config, file, source, organization.as_deref())),
        Commands::Audit(audit_command) => match audit_command {
            AuditCommands::Create { document, draft } => cmd_audit_create(&config, document, *draft),
            AuditCommands::Run {
                audit,
                max_chunks,
                evidence,
            } => runtime.block_on(cmd_audit_run(
                &config,
                audit,
                RunOptions {
                    max_chunks: *max_chunks,
                    include_evidence: *evidence,
                },
                false,
            )),
            AuditCommands::Resume { audit } => runtime.block_on(cmd_audit_run(
                &config,
                audit,
                RunOptions::default(),
                true,
            )),
            AuditCommands::Status { audit } => cmd_audit_status(&config, audit, format),
            AuditCommands::List { status, limit } => {
                cmd_audit_list(&config, status.as_deref(), *limit, format)
            }
            AuditCommands::Flags { audit, questions } => {
                cmd_audit_flags(&config, audit, *questions, format)
            }
            AuditCommands::Questions { audit } => {
                runtime.block_on(cmd_audit_questions(&config, audit))
            }
        },
        Commands::Scores {
            organization,
            limit,
        } => cmd_scores(&config, organization.as_deref(), *limit, format),
    }
}

fn open_storage(config: &AppConfig) -> Result<SqliteStorage> {
    let mut storage = SqliteStorage::open(&config.database_url)?;
    storage.init()?;
    Ok(storage)
}

fn resolve_document(storage: &SqliteStorage, document_ref: &str) -> Result<Document> {
    let document = if let Ok(id) = document_ref.parse::<i64>() {
        storage.get_document(id)?
    } else {
        storage.get_document_by_external_id(document_ref)?
    };
    document.ok_or_else(|| Error::NotFound {
        entity: "document",
        identifier: document_ref.to_string(),
    })
}

fn resolve_audit(storage: &SqliteStorage, audit_ref: &str) -> Result<Audit> {
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

fn cmd_init(config: &AppConfig) -> Result<String> {
    let storage = open_storage(config)?;
    for dir in [config.embedding_cache_dir(), config.log_dir()] {
        std::fs::create_dir_all(&dir)?;
    }
    // Touch the vector store so its schema exists too.
    let _vectors = SqliteVectorStore::open(config.vector_store_path())?;

    let mut output = String::new();
    let _ = writeln!(output, "Initialized database at {}", config.database_url);
    let _ = writeln!(
        output,
        "Data root prepared at {}",
        config.data_root.display()
    );
    drop(storage);
    Ok(output)
}

/// Ingests a sectioned document: persists the document row, chunks the
/// sections, embeds the chunks into the matching collection, and flips
/// the embedding statuses.
async fn cmd_ingest(
    config: &AppConfig,
    file: &Path,
    source: &str,
    organization: Option<&str>,
) -> Result<String> {
    let source_class = SourceClass::parse(source).ok_or_else(|| Error::Validation {
        message: format!(
            "invalid source '{source}': expected manual, regulation, amc, gm, or evidence"
        ),
    })?;

    let raw = std::fs::read_to_string(file)?;
    let sections: Vec<Section> =
        serde_json::from_str(&raw).map_err(|e| Error::Validation {
            message: format!("invalid sections file: {e}"),
        })?;

    let sha256 = format!("{:x}", Sha256::digest(raw.as_bytes()));
    let mut document = Document::new(
        file.file_name()
            .map_or_else(|| file.display().to_string(), |name| name.to_string_lossy().to_string()),
        file.display().to_string(),
        raw.len() as i64,
        sha256,
        source_class,
    );
    if let Some(organization) = organization {
        document = document.with_organization(organization);
    }

    let mut storage = open_storage(config)?;
    let document_id = storage.insert_document(&document)?;

    let estimator = create_estimator(&config.chunk_tokenizer);
    let chunker = SectionChunker::new(
        ChunkerConfig {
            size: config.chunk_size,
            overlap: config.chunk_overlap,
            max_section_tokens: config.chunk_max_section_tokens,
        },
        estimator,
    );
    let payloads = chunker.chunk_sections(
        &document.external_id,
        &sections,
        ChunkingMode::SectionAware,
    )?;
    let inserted = storage.insert_chunks(document_id, &payloads)?;

    // Populate the matching vector collection and confirm per chunk.
    let collection = match source_class {
        SourceClass::Manual => crate::vector::MANUAL_COLLECTION,
        SourceClass::Regulation => crate::vector::REGULATION_COLLECTION,
        SourceClass::Amc => crate::vector::AMC_COLLECTION,
        SourceClass::Gm => crate::vector::GM_COLLECTION,
        SourceClass::Evidence => crate::vector::EVIDENCE_COLLECTION,
    };
    let vectors = SqliteVectorStore::open(config.vector_store_path())?;
    let embedder: Arc<dyn Embedder> = create_embedder(config);

    let mut embedded = 0usize;
    for payload in &payloads {
        match embedder.embed(&payload.text).await {
            Ok(embedding) => {
                vectors.upsert(
                    collection,
                    &[VectorRecord {
                        id: payload.chunk_id.clone(),
                        embedding,
                        document_text: payload.text.clone(),
                        metadata: serde_json::json!({
                            "chunk_id": payload.chunk_id,
                            "document_id": document_id,
                            "parent_heading": payload.parent_heading,
                            "token_count": payload.token_count,
                        }),
                    }],
                )?;
                storage.set_embedding_status(&payload.chunk_id, EmbeddingStatus::Completed)?;
                embedded += 1;
            }
            Err(e) => {
                storage.set_embedding_status(&payload.chunk_id, EmbeddingStatus::Failed)?;
                storage.set_document_status(document_id, DocumentStatus::Failed)?;
                return Err(e);
            }
        }
    }
    storage.set_document_status(document_id, DocumentStatus::Processed)?;

    let mut output = String::new();
    let _ = writeln!(
        output,
        "Ingested {} as document {} ({})",
        file.display(),
        document.external_id,
        source_class.as_str()
    );
    let _ = writeln!(output, "  Chunks:   {inserted}");
    let _ = writeln!(output, "  Embedded: {embedded} into {collection}");
    Ok(output)
}

fn cmd_audit_create(config: &AppConfig, document_ref: &str, draft: bool) -> Result<String> {
    let mut storage = open_storage(config)?;
    let document = resolve_document(&storage, document_ref)?;
    let document_id = document.id.ok_or_else(|| Error::Validation {
        message: "document has no id".to_string(),
    })?;
    let audit = storage.create_audit(document_id, draft)?;
    Ok(format!(
        "Created {} audit {} for document {}\n",
        if draft { "draft" } else { "full" },
        audit.external_id,
        document.external_id
    ))
}

async fn cmd_audit_run(
    config: &AppConfig,
    audit_ref: &str,
    opts: RunOptions,
    resume: bool,
) -> Result<String> {
    let mut storage = open_storage(config)?;
    let vectors: Arc<dyn VectorStore> =
        Arc::new(SqliteVectorStore::open(config.vector_store_path())?);
    let embedder = create_embedder(config);
    let mut runner = AuditRunner::from_config(config, vectors, embedder)?;

    let result = if resume {
        runner.resume(&mut storage, audit_ref, opts).await?
    } else {
        runner.run(&mut storage, audit_ref, opts).await?
    };

    Ok(format!(
        "Audit {}: processed {}, remaining {}, status {}\n",
        audit_ref,
        result.processed,
        result.remaining,
        result.status.as_str()
    ))
}

fn cmd_audit_status(config: &AppConfig, audit_ref: &str, format: OutputFormat) -> Result<String> {
    let storage = open_storage(config)?;
    let audit = resolve_audit(&storage, audit_ref)?;
    Ok(format_audit_status(&audit, format))
}

fn cmd_audit_list(
    config: &AppConfig,
    status: Option<&str>,
    limit: usize,
    format: OutputFormat,
) -> Result<String> {
    let status = status
        .map(|raw| {
            AuditStatus::parse(raw).ok_or_else(|| Error::Validation {
                message: format!("invalid status filter '{raw}'"),
            })
        })
        .transpose()?;
    let storage = open_storage(config)?;
    let audits = storage.list_audits(status, None, limit)?;
    Ok(format_audit_list(&audits, format))
}

fn cmd_audit_flags(
    config: &AppConfig,
    audit_ref: &str,
    include_questions: bool,
    format: OutputFormat,
) -> Result<String> {
    let storage = open_storage(config)?;
    let audit = resolve_audit(&storage, audit_ref)?;
    let audit_id = audit.id.ok_or_else(|| Error::Validation {
        message: "audit has no id".to_string(),
    })?;
    let flags = storage.flags_for_audit(audit_id)?;
    let questions = if include_questions {
        Some(storage.questions_for_audit(audit_id)?)
    } else {
        None
    };
    Ok(format_flags(&flags, questions.as_deref(), format))
}

async fn cmd_audit_questions(config: &AppConfig, audit_ref: &str) -> Result<String> {
    let mut storage = open_storage(config)?;
    let audit = resolve_audit(&storage, audit_ref)?;
    let audit_id = audit.id.ok_or_else(|| Error::Validation {
        message: "audit has no id".to_string(),
    })?;
    let generator = QuestionGenerator::new(config);
    let created = generator.generate_for_audit(&mut storage, audit_id).await?;
    Ok(format!(
        "Generated {created} reviewer questions for audit {}\n",
        audit.external_id
    ))
}

fn cmd_scores(
    config: &AppConfig,
    organization: Option<&str>,
    limit: usize,
    format: OutputFormat,
) -> Result<String> {
    let storage = open_storage(config)?;
    let scores = ScoreTracker::new().get_score_history(&storage, organization, limit)?;
    Ok(format_scores(&scores, format))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> AppConfig {
        AppConfig::builder()
            .database_url(dir.join("app.db").to_string_lossy().to_string())
            .data_root(dir)
            .chunk_processing_delay(std::time::Duration::ZERO)
            .build()
            .unwrap()
    }

    fn write_sections(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("manual.json");
        let sections = serde_json::json!([
            {"index": 0, "title": "§1 Scope", "content": "This manual covers maintenance."},
            {"index": 1, "title": "§2 Records", "content": "Records shall be retained for two years."},
        ]);
        std::fs::write(&path, sections.to_string()).unwrap();
        path
    }

    #[test]
    fn test_init_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let output = cmd_init(&config).unwrap();
        assert!(output.contains("Initialized"));
        assert!(config.embedding_cache_dir().exists());
        assert!(config.vector_store_path().exists());
    }

    #[tokio::test]
    async fn test_ingest_and_create_audit() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let sections = write_sections(dir.path());

        let output = cmd_ingest(&config, &sections, "manual", Some("FI.145.0001"))
            .await
            .unwrap();
        assert!(output.contains("Chunks:   2"));
        assert!(output.contains("Embedded: 2"));

        // The ingested chunks are confirmed embedded.
        let storage = open_storage(&config).unwrap();
        let document = storage.list_audits(None, None, 1).unwrap();
        assert!(document.is_empty());

        let created = cmd_audit_create(&config, "1", true).unwrap();
        assert!(created.contains("draft audit"));
    }

    #[tokio::test]
    async fn test_ingest_rejects_bad_source() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let sections = write_sections(dir.path());
        let result = cmd_ingest(&config, &sections, "litigation", None).await;
        assert!(matches!(result, Err(Error::Validation { .. })));
    }

    #[test]
    fn test_audit_status_unknown_audit() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let _ = cmd_init(&config).unwrap();
        let result = cmd_audit_status(&config, "missing", OutputFormat::Text);
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_audit_list_rejects_bad_status() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let result = cmd_audit_list(&config, Some("paused"), 10, OutputFormat::Text);
        assert!(matches!(result, Err(Error::Validation { .. })));
    }
}
