//! Deterministic retrieval helper that assembles context bundles.
//!
//! For a focus chunk the builder gathers sequential manual neighbors,
//! semantic siblings from the same manual, regulation matches, AMC/GM
//! guidance matches, and optional evidence, admitting slices in retrieval
//! order under per-bucket and global token budgets. Low-quality matches
//! (distant, or carrying corrupted extraction output) are dropped before
//! budget accounting.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::context::{ContextBundle, ContextSlice, TokenBudget, as_object};
use crate::core::ChunkRecord;
use crate::embedding::Embedder;
use crate::error::{ContextError, Result};
use crate::storage::Storage;
use crate::token::{TokenEstimator, create_estimator};
use crate::vector::{
    AMC_COLLECTION, EVIDENCE_COLLECTION, GM_COLLECTION, MANUAL_COLLECTION, MetadataFilter,
    REGULATION_COLLECTION, VectorMatch, VectorStore,
};

/// Matches with a distance beyond this are dropped before budgeting.
const MAX_MATCH_DISTANCE: f32 = 1.5;

/// Semantic siblings retrieved from the focus chunk's own manual.
const MANUAL_SIBLING_TOP_K: usize = 5;

/// Bound on cached vector queries per builder lifetime.
const MAX_QUERY_CACHE_ENTRIES: usize = 256;

/// Known extraction-failure markers; matches containing one are dropped.
const EXTRACTION_FAILURE_SENTINELS: [&str; 2] = ["-1097280", "-448310"];

/// Retrieval budgets, copied out of [`AppConfig`].
#[derive(Debug, Clone)]
pub(crate) struct BuilderConfig {
    pub manual_neighbor_window: usize,
    pub manual_token_budget: usize,
    pub regulation_top_k: usize,
    pub regulation_token_budget: usize,
    pub guidance_top_k: usize,
    pub guidance_token_budget: usize,
    pub evidence_top_k: usize,
    pub evidence_token_budget: usize,
    pub total_token_budget: usize,
}

impl From<&AppConfig> for BuilderConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            manual_neighbor_window: config.context_manual_window,
            manual_token_budget: config.context_manual_token_limit,
            regulation_top_k: config.context_regulation_top_k,
            regulation_token_budget: config.context_regulation_token_limit,
            guidance_top_k: config.context_guidance_top_k,
            guidance_token_budget: config.context_guidance_token_limit,
            evidence_top_k: config.context_evidence_top_k,
            evidence_token_budget: config.context_evidence_token_limit,
            total_token_budget: config.context_total_token_limit,
        }
    }
}

/// Per-call retrieval options.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Whether to retrieve evidence context.
    pub include_evidence: bool,
    /// Override for the sequential neighbor window (0 disables neighbors).
    pub neighbor_window: Option<usize>,
    /// Scales both the global and per-bucket budgets.
    pub budget_multiplier: f64,
    /// Targeted search query (agent-requested refinement).
    pub context_query: Option<String>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            include_evidence: false,
            neighbor_window: None,
            budget_multiplier: 1.0,
            context_query: None,
        }
    }
}

type QueryCacheKey = (String, String, Option<i64>);

/// Assembles context bundles for focus chunks.
pub struct ContextBuilder {
    config: BuilderConfig,
    estimator: Arc<dyn TokenEstimator>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    query_cache: Mutex<HashMap<QueryCacheKey, Vec<VectorMatch>>>,
}

impl ContextBuilder {
    /// Creates a builder sharing the engine's vector store and embedder.
    #[must_use]
    pub fn new(
        config: &AppConfig,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            config: BuilderConfig::from(config),
            estimator: create_estimator(&config.context_tokenizer),
            vectors,
            embedder,
            query_cache: Mutex::new(HashMap::new()),
        }
    }

    /// The shared token estimator.
    #[must_use]
    pub fn estimator(&self) -> Arc<dyn TokenEstimator> {
        Arc::clone(&self.estimator)
    }

    /// Loads a chunk by external id.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn load_chunk(
        &self,
        storage: &dyn Storage,
        chunk_id: &str,
    ) -> Result<Option<ChunkRecord>> {
        storage.get_chunk(chunk_id)
    }

    /// Builds a context bundle for a focus chunk.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::FocusChunkMissing`] when the chunk does not
    /// exist; vector retrieval failures degrade to empty buckets.
    pub async fn build_context(
        &self,
        storage: &dyn Storage,
        chunk_id: &str,
        opts: &ContextOptions,
    ) -> Result<ContextBundle> {
        let chunk = storage
            .get_chunk(chunk_id)?
            .ok_or_else(|| ContextError::FocusChunkMissing {
                chunk_id: chunk_id.to_string(),
            })?;

        let focus = self.chunk_to_slice(&chunk, "Focus Chunk", "manual");
        let mut bundle = ContextBundle::new(focus);

        let mut budget = TokenBudget::new(scale(
            self.config.total_token_budget,
            opts.budget_multiplier,
        ));
        let manual_window = opts
            .neighbor_window
            .unwrap_or(self.config.manual_neighbor_window);
        let manual_limit = scale(self.config.manual_token_budget, opts.budget_multiplier);
        let regulation_limit = scale(self.config.regulation_token_budget, opts.budget_multiplier);
        let guidance_limit = scale(self.config.guidance_token_budget, opts.budget_multiplier);
        let evidence_limit = scale(self.config.evidence_token_budget, opts.budget_multiplier);

        // Sequential neighbors plus semantic siblings from the same manual,
        // de-duplicated by chunk id against the focus and each other.
        let mut manual_slices = self.collect_manual_neighbors(storage, &chunk, manual_window)?;
        let manual_query = opts.context_query.as_deref().unwrap_or(&chunk.content);
        let siblings = self
            .collect_vector_context(
                &chunk,
                MANUAL_COLLECTION,
                "Manual (similar)",
                "manual",
                MANUAL_SIBLING_TOP_K,
                manual_query,
                true,
            )
            .await?;
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(chunk.chunk_id.clone());
        for slice in &manual_slices {
            if let Some(id) = slice.chunk_id() {
                seen.insert(id.to_string());
            }
        }
        for slice in siblings {
            if let Some(id) = slice.chunk_id() {
                if seen.insert(id.to_string()) {
                    manual_slices.push(slice);
                }
            }
        }
        bundle.manual_neighbors =
            self.apply_budget(&mut budget, "manual", manual_limit, manual_slices);

        let regulation_query = opts.context_query.as_deref().unwrap_or(&chunk.content);
        let regulation_slices = self
            .collect_vector_context(
                &chunk,
                REGULATION_COLLECTION,
                "Regulation",
                "regulation",
                self.config.regulation_top_k,
                regulation_query,
                false,
            )
            .await?;
        bundle.regulation_slices =
            self.apply_budget(&mut budget, "regulation", regulation_limit, regulation_slices);

        let guidance_query = opts.context_query.as_deref().unwrap_or(&chunk.content);
        let mut guidance_slices = self
            .collect_vector_context(
                &chunk,
                AMC_COLLECTION,
                "AMC",
                "amc",
                self.config.guidance_top_k,
                guidance_query,
                false,
            )
            .await?;
        guidance_slices.extend(
            self.collect_vector_context(
                &chunk,
                GM_COLLECTION,
                "GM",
                "gm",
                self.config.guidance_top_k,
                guidance_query,
                false,
            )
            .await?,
        );
        bundle.guidance_slices =
            self.apply_budget(&mut budget, "guidance", guidance_limit, guidance_slices);

        if opts.include_evidence && self.config.evidence_top_k > 0 {
            let evidence_query = opts.context_query.as_deref().unwrap_or(&chunk.content);
            let evidence_slices = self
                .collect_vector_context(
                    &chunk,
                    EVIDENCE_COLLECTION,
                    "Evidence",
                    "evidence",
                    self.config.evidence_top_k,
                    evidence_query,
                    false,
                )
                .await?;
            bundle.evidence_slices =
                self.apply_budget(&mut budget, "evidence", evidence_limit, evidence_slices);
        }

        bundle.total_tokens = budget.total_used();
        bundle.truncated = budget.truncated();
        bundle.token_breakdown = budget.breakdown();

        info!(
            chunk_id = %chunk.chunk_id,
            manual = bundle.manual_neighbors.len(),
            regulations = bundle.regulation_slices.len(),
            guidance = bundle.guidance_slices.len(),
            evidence = bundle.evidence_slices.len(),
            total_tokens = bundle.total_tokens,
            truncated = bundle.truncated,
            "context built"
        );
        if bundle.regulation_slices.is_empty() {
            warn!(
                chunk_id = %chunk.chunk_id,
                "no regulation context retrieved; analysis will lack regulation references"
            );
        }

        Ok(bundle)
    }

    // ------------------------------------------------------------------ //
    // Manual neighbor retrieval
    // ------------------------------------------------------------------ //
    fn collect_manual_neighbors(
        &self,
        storage: &dyn Storage,
        chunk: &ChunkRecord,
        window: usize,
    ) -> Result<Vec<ContextSlice>> {
        if window == 0 {
            return Ok(Vec::new());
        }
        let window = window as i64;
        let lower = chunk.chunk_index - window;
        let upper = chunk.chunk_index + window;
        let neighbors = storage.chunks_in_range(chunk.document_id, lower, upper)?;

        let mut slices = Vec::new();
        for neighbor in neighbors {
            if neighbor.chunk_id == chunk.chunk_id {
                continue;
            }
            let offset = neighbor.chunk_index - chunk.chunk_index;
            let direction = if offset > 0 { "next" } else { "previous" };
            let label = format!("Manual neighbor ({direction} {})", offset.abs());
            slices.push(self.chunk_to_slice(&neighbor, &label, "manual"));
        }
        Ok(slices)
    }

    // ------------------------------------------------------------------ //
    // Vector retrieval helpers
    // ------------------------------------------------------------------ //
    #[allow(clippy::too_many_arguments)]
    async fn collect_vector_context(
        &self,
        chunk: &ChunkRecord,
        collection: &str,
        label_prefix: &str,
        source: &str,
        top_k: usize,
        query_text: &str,
        filter_by_document: bool,
    ) -> Result<Vec<ContextSlice>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let document_id = filter_by_document.then_some(chunk.document_id);
        let matches = self
            .vector_query(collection, query_text, &chunk.chunk_id, top_k, document_id)
            .await?;

        let mut slices = Vec::new();
        for (idx, m) in matches.into_iter().enumerate() {
            if !match_is_usable(&m) {
                continue;
            }
            let label = format!("{label_prefix} ref #{}", idx + 1);
            let mut metadata = as_object(m.metadata);
            metadata
                .entry("chunk_id".to_string())
                .or_insert_with(|| Value::from(m.id.clone()));
            metadata
                .entry("source".to_string())
                .or_insert_with(|| Value::from(source));
            if !metadata.contains_key("heading") {
                let heading = metadata.get("parent_heading").cloned().unwrap_or(Value::Null);
                metadata.insert("heading".to_string(), heading);
            }
            let tokens = metadata
                .get("token_count")
                .and_then(Value::as_u64)
                .map_or_else(|| self.estimator.count(&m.document_text), |t| t as usize);

            slices.push(ContextSlice {
                label,
                source: source.to_string(),
                content: m.document_text,
                token_count: tokens,
                metadata: Value::Object(metadata),
                score: Some(display_score(m.distance)),
            });
        }
        Ok(slices)
    }

    /// Runs a cached vector query: embed the text with the collection's
    /// model, validate dimensions, and rank by distance.
    ///
    /// A dimension mismatch or embedding failure logs an error and yields
    /// no results rather than failing the audit.
    ///
    /// # Errors
    ///
    /// Propagates vector store failures.
    pub async fn vector_query(
        &self,
        collection: &str,
        query_text: &str,
        cache_key: &str,
        top_k: usize,
        document_id: Option<i64>,
    ) -> Result<Vec<VectorMatch>> {
        if query_text.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let key: QueryCacheKey = (collection.to_string(), cache_key.to_string(), document_id);
        if let Ok(cache) = self.query_cache.lock() {
            if let Some(cached) = cache.get(&key) {
                return Ok(cached.clone());
            }
        }

        debug!(collection, top_k, ?document_id, "vector query");
        let query_embedding = match self.embedder.embed(query_text).await {
            Ok(embedding) => embedding,
            Err(e) => {
                error!(collection, error = %e, "query embedding failed; returning no matches");
                return Ok(Vec::new());
            }
        };

        if let Some(collection_dim) = self.vectors.dimension(collection)? {
            if collection_dim != query_embedding.len() {
                error!(
                    collection,
                    collection_dim,
                    query_dim = query_embedding.len(),
                    "query embedding dimension mismatch; check that the embedding model \
                     matches the model used to populate the collection"
                );
                return Ok(Vec::new());
            }
        }

        let filter = document_id.map(MetadataFilter::document);
        let matches = self
            .vectors
            .query(collection, &query_embedding, top_k, filter.as_ref())?;
        if matches.is_empty() {
            warn!(collection, "no matches (collection may be empty or missing)");
        }

        if let Ok(mut cache) = self.query_cache.lock() {
            if cache.len() < MAX_QUERY_CACHE_ENTRIES {
                cache.insert(key, matches.clone());
            }
        }
        Ok(matches)
    }

    // ------------------------------------------------------------------ //
    // Slice helpers
    // ------------------------------------------------------------------ //
    fn chunk_to_slice(&self, chunk: &ChunkRecord, label: &str, source: &str) -> ContextSlice {
        let mut metadata = serde_json::Map::new();
        metadata.insert("chunk_id".to_string(), Value::from(chunk.chunk_id.clone()));
        metadata.insert("chunk_index".to_string(), Value::from(chunk.chunk_index));
        metadata.insert(
            "section_path".to_string(),
            json!(chunk.section_path_parts()),
        );
        metadata.insert(
            "heading".to_string(),
            chunk
                .parent_heading
                .clone()
                .map_or(Value::Null, Value::from),
        );
        metadata.insert("document_id".to_string(), Value::from(chunk.document_id));
        if let Value::Object(extra) = chunk.metadata_value() {
            for (key, value) in extra {
                metadata.entry(key).or_insert(value);
            }
        }

        let token_count = chunk
            .token_count
            .map_or_else(|| self.estimator.count(&chunk.content), |t| t as usize);
        ContextSlice {
            label: label.to_string(),
            source: source.to_string(),
            content: chunk.content.clone(),
            token_count,
            metadata: Value::Object(metadata),
            score: None,
        }
    }

    fn apply_budget(
        &self,
        budget: &mut TokenBudget,
        bucket: &str,
        limit: usize,
        slices: Vec<ContextSlice>,
    ) -> Vec<ContextSlice> {
        let mut accepted = Vec::new();
        for slice in slices {
            let tokens = if slice.token_count > 0 {
                slice.token_count
            } else {
                self.estimator.count(&slice.content)
            };
            if budget.allow(bucket, limit, tokens) {
                accepted.push(slice);
            } else {
                break;
            }
        }
        accepted
    }
}

/// Applies the budget multiplier.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn scale(budget: usize, multiplier: f64) -> usize {
    ((budget as f64) * multiplier).max(0.0) as usize
}

/// Distance-to-similarity conversion for display: `1 / (1 + distance)`.
fn display_score(distance: f32) -> f64 {
    1.0 / (1.0 + f64::from(distance))
}

/// Drops distant matches and corrupted extraction output before any
/// budget accounting.
fn match_is_usable(m: &VectorMatch) -> bool {
    if m.distance > MAX_MATCH_DISTANCE {
        return false;
    }
    let trimmed = m.document_text.trim();
    if trimmed.len() < 10 {
        return false;
    }
    if trimmed
        .chars()
        .all(|c| c.is_ascii_digit() || c.is_whitespace() || c == '.' || c == '-')
    {
        return false;
    }
    if EXTRACTION_FAILURE_SENTINELS
        .iter()
        .any(|sentinel| m.document_text.contains(sentinel))
    {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::{ChunkerConfig, ChunkingMode, SectionChunker};
    use crate::core::{Document, Section, SourceClass};
    use crate::embedding::{DEFAULT_DIMENSIONS, FallbackEmbedder};
    use crate::storage::SqliteStorage;
    use crate::vector::{InMemoryVectorStore, VectorRecord};

    fn fixture() -> (SqliteStorage, Arc<InMemoryVectorStore>, Arc<FallbackEmbedder>, i64, Vec<String>) {
        let mut storage = SqliteStorage::in_memory().unwrap();
        storage.init().unwrap();
        let document = Document::new("m.pdf", "p", 1, "h", SourceClass::Manual);
        let doc_id = storage.insert_document(&document).unwrap();

        let chunker = SectionChunker::new(
            ChunkerConfig::default(),
            Arc::new(crate::token::HeuristicEstimator),
        );
        let sections = vec![
            Section::titled(0, "§1 Scope", "This manual covers all maintenance activities."),
            Section::titled(1, "§2 Records", "Maintenance records shall be retained for two years."),
            Section::titled(2, "§3 Personnel", "Certifying staff shall be qualified per Part-66."),
        ];
        let payloads = chunker
            .chunk_sections(&document.external_id, &sections, ChunkingMode::SectionAware)
            .unwrap();
        storage.insert_chunks(doc_id, &payloads).unwrap();
        let chunk_ids = payloads.iter().map(|p| p.chunk_id.clone()).collect();

        (
            storage,
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(FallbackEmbedder::new(DEFAULT_DIMENSIONS)),
            doc_id,
            chunk_ids,
        )
    }

    async fn seed_collection(
        vectors: &InMemoryVectorStore,
        embedder: &FallbackEmbedder,
        collection: &str,
        entries: &[(&str, &str, i64)],
    ) {
        let mut records = Vec::new();
        for (id, text, document_id) in entries {
            records.push(VectorRecord {
                id: (*id).to_string(),
                embedding: embedder.embed(text).await.unwrap(),
                document_text: (*text).to_string(),
                metadata: json!({"chunk_id": id, "document_id": document_id}),
            });
        }
        vectors.upsert(collection, &records).unwrap();
    }

    fn builder(
        vectors: Arc<InMemoryVectorStore>,
        embedder: Arc<FallbackEmbedder>,
    ) -> ContextBuilder {
        let config = AppConfig::default();
        ContextBuilder::new(&config, vectors, embedder)
    }

    #[tokio::test]
    async fn test_missing_focus_chunk_errors() {
        let (storage, vectors, embedder, _, _) = fixture();
        let builder = builder(vectors, embedder);
        let result = builder
            .build_context(&storage, "no-such-chunk", &ContextOptions::default())
            .await;
        assert!(matches!(
            result,
            Err(crate::error::Error::Context(
                ContextError::FocusChunkMissing { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn test_neighbors_within_window() {
        let (storage, vectors, embedder, _, chunk_ids) = fixture();
        let builder = builder(vectors, embedder);
        let bundle = builder
            .build_context(&storage, &chunk_ids[1], &ContextOptions::default())
            .await
            .unwrap();

        // Window of 1 around the middle chunk picks up both neighbors.
        let labels: Vec<&str> = bundle
            .manual_neighbors
            .iter()
            .map(|s| s.label.as_str())
            .collect();
        assert!(labels.contains(&"Manual neighbor (previous 1)"));
        assert!(labels.contains(&"Manual neighbor (next 1)"));
    }

    #[tokio::test]
    async fn test_zero_window_drops_neighbors() {
        let (storage, vectors, embedder, _, chunk_ids) = fixture();
        let builder = builder(vectors, embedder);
        let opts = ContextOptions {
            neighbor_window: Some(0),
            ..ContextOptions::default()
        };
        let bundle = builder
            .build_context(&storage, &chunk_ids[1], &opts)
            .await
            .unwrap();
        assert!(bundle.manual_neighbors.is_empty());
    }

    #[tokio::test]
    async fn test_missing_collections_yield_empty_buckets() {
        let (storage, vectors, embedder, _, chunk_ids) = fixture();
        let builder = builder(vectors, embedder);
        let bundle = builder
            .build_context(&storage, &chunk_ids[0], &ContextOptions::default())
            .await
            .unwrap();
        assert!(bundle.regulation_slices.is_empty());
        assert!(bundle.guidance_slices.is_empty());
        assert!(bundle.evidence_slices.is_empty());
    }

    /// Seeds records whose embedding matches `query_text` exactly, so the
    /// distance filter admits them regardless of the fallback embedder's
    /// lexical quirks.
    async fn seed_exact(
        vectors: &InMemoryVectorStore,
        embedder: &FallbackEmbedder,
        collection: &str,
        query_text: &str,
        entries: &[(&str, &str)],
    ) {
        let embedding = embedder.embed(query_text).await.unwrap();
        let records: Vec<VectorRecord> = entries
            .iter()
            .map(|(id, text)| VectorRecord {
                id: (*id).to_string(),
                embedding: embedding.clone(),
                document_text: (*text).to_string(),
                metadata: json!({"chunk_id": id, "document_id": 99}),
            })
            .collect();
        vectors.upsert(collection, &records).unwrap();
    }

    #[tokio::test]
    async fn test_regulation_retrieval_and_scores() {
        let (storage, vectors, embedder, _, chunk_ids) = fixture();
        let focus = storage.get_chunk(&chunk_ids[1]).unwrap().unwrap();
        seed_exact(
            &vectors,
            &embedder,
            REGULATION_COLLECTION,
            &focus.content,
            &[
                ("reg_0_0", "Maintenance records shall be retained per 145.A.55."),
                ("reg_1_0", "Certifying staff requirements are specified in 145.A.35."),
            ],
        )
        .await;

        let builder = builder(vectors, embedder);
        let bundle = builder
            .build_context(&storage, &chunk_ids[1], &ContextOptions::default())
            .await
            .unwrap();
        assert!(!bundle.regulation_slices.is_empty());
        for slice in &bundle.regulation_slices {
            let score = slice.score.unwrap();
            assert!(score > 0.0 && score <= 1.0);
        }
    }

    #[tokio::test]
    async fn test_corrupt_matches_filtered() {
        let (storage, vectors, embedder, _, chunk_ids) = fixture();
        seed_collection(
            &vectors,
            &embedder,
            REGULATION_COLLECTION,
            &[
                ("short", "tiny", 99),
                ("numeric", "123. 456. -789. 0.1", 99),
                ("sentinel", "coordinates -1097280 in corrupted output stream", 99),
                ("good", "Records shall be retained for at least two years.", 99),
            ],
        )
        .await;

        let builder = builder(vectors, embedder);
        let bundle = builder
            .build_context(&storage, &chunk_ids[1], &ContextOptions::default())
            .await
            .unwrap();
        let ids: Vec<Option<&str>> = bundle
            .regulation_slices
            .iter()
            .map(ContextSlice::chunk_id)
            .collect();
        assert!(!ids.contains(&Some("short")));
        assert!(!ids.contains(&Some("numeric")));
        assert!(!ids.contains(&Some("sentinel")));
    }

    #[tokio::test]
    async fn test_budget_truncation_marks_bundle() {
        let (storage, vectors, embedder, _, chunk_ids) = fixture();
        let focus = storage.get_chunk(&chunk_ids[0]).unwrap().unwrap();
        seed_exact(
            &vectors,
            &embedder,
            REGULATION_COLLECTION,
            &focus.content,
            &[
                ("reg_a", "Regulation text alpha with enough length here."),
                ("reg_b", "Regulation text beta with enough length here too."),
            ],
        )
        .await;

        let config = AppConfig::builder()
            .context_regulation_token_limit(8)
            .build()
            .unwrap();
        let builder = ContextBuilder::new(&config, vectors, embedder);
        let bundle = builder
            .build_context(&storage, &chunk_ids[0], &ContextOptions::default())
            .await
            .unwrap();

        // Two ~12-token candidates against an 8-token bucket: at most one
        // admitted, truncation flagged.
        assert!(bundle.truncated);
        assert!(bundle.regulation_slices.len() <= 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_returns_empty() {
        let (storage, vectors, embedder, _, chunk_ids) = fixture();
        // Collection populated with a different dimension than the embedder.
        vectors
            .upsert(
                REGULATION_COLLECTION,
                &[VectorRecord {
                    id: "reg".to_string(),
                    embedding: vec![0.0; 16],
                    document_text: "Some regulation text of reasonable length.".to_string(),
                    metadata: json!({"chunk_id": "reg"}),
                }],
            )
            .unwrap();

        let builder = builder(vectors, embedder);
        let bundle = builder
            .build_context(&storage, &chunk_ids[0], &ContextOptions::default())
            .await
            .unwrap();
        assert!(bundle.regulation_slices.is_empty());
    }

    #[tokio::test]
    async fn test_query_cache_reuse() {
        let (_, vectors, embedder, _, _) = fixture();
        seed_collection(
            &vectors,
            &embedder,
            MANUAL_COLLECTION,
            &[("m1", "Manual content about record retention policies.", 1)],
        )
        .await;
        let builder = builder(Arc::clone(&vectors), Arc::clone(&embedder));

        let first = builder
            .vector_query(MANUAL_COLLECTION, "records", "key", 5, Some(1))
            .await
            .unwrap();
        // Mutate the store; the cached result must be returned unchanged.
        seed_collection(
            &vectors,
            &embedder,
            MANUAL_COLLECTION,
            &[("m2", "Another manual chunk about something else entirely.", 1)],
        )
        .await;
        let second = builder
            .vector_query(MANUAL_COLLECTION, "records", "key", 5, Some(1))
            .await
            .unwrap();
        assert_eq!(first.len(), second.len());
    }

    #[test]
    fn test_display_score() {
        assert!((display_score(0.0) - 1.0).abs() < 1e-9);
        assert!((display_score(1.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_scale() {
        assert_eq!(scale(6000, 1.0), 6000);
        assert_eq!(scale(6000, 0.5), 3000);
        assert_eq!(scale(6000, 1.5), 9000);
    }
}
