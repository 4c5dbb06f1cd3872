//! Recursive retrieval following section references.
//!
//! Wraps the base context builder: extracts section references from chunk
//! text, follows them through the vector collections (bounded depth and
//! breadth, breadth-first), optionally seeds an extra concept search from
//! an agent-supplied query, pulls in related case material, and
//! de-duplicates the result.

use std::collections::{HashSet, VecDeque};

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

use crate::context::builder::{ContextBuilder, ContextOptions};
use crate::context::{ContextBundle, ContextSlice, as_object};
use crate::core::ChunkRecord;
use crate::error::Result;
use crate::storage::Storage;
use crate::vector::{EVIDENCE_COLLECTION, MANUAL_COLLECTION, REGULATION_COLLECTION, VectorMatch};

/// Maximum reference-following depth.
pub const DEFAULT_MAX_DEPTH: usize = 3;

/// Maximum references followed per chunk.
pub const DEFAULT_MAX_REFERENCES_PER_CHUNK: usize = 10;

/// Caps applied to the final slice lists.
const MAX_SLICES_PER_LIST: usize = 50;
const MAX_LITIGATION_SLICES: usize = 20;

/// Matches with a distance beyond this are dropped from reference searches.
const MAX_MATCH_DISTANCE: f32 = 1.5;

/// A section reference extracted from chunk text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// The matched text, e.g. `"Section 4.2"`.
    pub text: String,
    /// The bare section number, when the pattern captured one.
    pub section_number: Option<String>,
}

/// Extracts section and subsection references from text.
///
/// Patterns are ordered from specific to generic; a later match whose span
/// overlaps an earlier one is suppressed, so `"Section 4.2"` does not also
/// yield a bare `"4.2"`.
pub struct ReferenceExtractor {
    patterns: Vec<Regex>,
    excludes: Vec<Regex>,
    keyword_context: Regex,
    date_or_version: Regex,
}

impl ReferenceExtractor {
    /// Compiles the reference patterns.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ContextError::Pattern`] if a pattern fails
    /// to compile.
    pub fn new() -> Result<Self> {
        let patterns = [
            // "Section 4.2", "sect. 4.2"
            r"(?i)(?:section|sect\.?)\s+(\d+(?:\.\d+)*)",
            // "Chapter 3", "ch. 3"
            r"(?i)(?:chapter|ch\.?)\s+(\d+)",
            // "Part 145.A.30", "Part-145.A.30"
            r"(?i)part[-\s]?(\d+)\.?([A-Za-z])?\.?(\d+)",
            // "OSA 5", "OSA 5.2"
            r"(?i)osa\s+(\d+(?:\.\d+)?)",
            // "kohdassa 3.4" (Finnish)
            r"(?i)kohdassa\s+(\d+(?:\.\d+)?)",
            // Generic "4.2" / "4.2.1"; gated on nearby section keywords
            r"\b(\d+\.\d+(?:\.\d+)?)\b",
        ]
        .iter()
        .map(|pattern| Regex::new(pattern).map_err(crate::error::ContextError::from))
        .collect::<std::result::Result<Vec<_>, _>>()?;

        let excludes = [
            // Dates like 3.11.2025
            r"\d{1,2}\.\d{1,2}\.\d{4}",
            // Organization identifiers like FI.145.9999
            r"FI\.\d+\.\d+",
            // Bare 4-digit years
            r"^\d{4}$",
            // IP-like quads
            r"^\d+\.\d+\.\d+\.\d+$",
        ]
        .iter()
        .map(|pattern| Regex::new(pattern).map_err(crate::error::ContextError::from))
        .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            patterns,
            excludes,
            keyword_context: Regex::new(
                r"(?i)section|chapter|part|osa|kohdassa|kohta|appendix",
            )
            .map_err(crate::error::ContextError::from)?,
            date_or_version: Regex::new(r"\d{4}|v?\d+\.\d+\.\d+")
                .map_err(crate::error::ContextError::from)?,
        })
    }

    /// Extracts all section references from text, de-duplicated by
    /// lowercased match text.
    #[must_use]
    pub fn extract_references(&self, text: &str) -> Vec<Reference> {
        let generic_index = self.patterns.len() - 1;
        let mut references = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut spans: Vec<(usize, usize)> = Vec::new();

        for (pattern_index, pattern) in self.patterns.iter().enumerate() {
            for captures in pattern.captures_iter(text) {
                let Some(whole) = captures.get(0) else {
                    continue;
                };
                let ref_text = whole.as_str().trim();
                if ref_text.len() < 3 {
                    continue;
                }
                // A later, more generic pattern must not re-match inside an
                // earlier pattern's span.
                if spans
                    .iter()
                    .any(|&(start, end)| whole.start() < end && start < whole.end())
                {
                    continue;
                }
                if self.excludes.iter().any(|exclude| exclude.is_match(ref_text)) {
                    continue;
                }
                if pattern_index == generic_index
                    && !self.generic_match_in_context(text, whole.start(), whole.end(), ref_text)
                {
                    continue;
                }

                let key = ref_text.to_lowercase();
                if !seen.insert(key) {
                    continue;
                }
                spans.push((whole.start(), whole.end()));
                references.push(Reference {
                    text: ref_text.to_string(),
                    section_number: captures.get(1).map(|m| m.as_str().to_string()),
                });
            }
        }

        references
    }

    /// The generic number pattern only counts as a reference when a
    /// section keyword appears within 20 characters of context on either
    /// side, and the match itself is not date- or version-shaped.
    fn generic_match_in_context(
        &self,
        text: &str,
        start: usize,
        end: usize,
        ref_text: &str,
    ) -> bool {
        let before_start = floor_boundary(text, start.saturating_sub(20));
        let after_end = ceil_boundary(text, (end + 20).min(text.len()));
        let context_before = &text[before_start..start];
        let context_after = &text[end..after_end];

        if !self.keyword_context.is_match(context_before)
            && !self.keyword_context.is_match(context_after)
        {
            return false;
        }
        !self.date_or_version.is_match(ref_text)
    }
}

fn floor_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

/// Per-call options for recursive builds.
#[derive(Debug, Clone, Default)]
pub struct RecursiveOptions {
    /// Base retrieval options.
    pub base: ContextOptions,
    /// Whether to pull in related case material from the evidence
    /// collection.
    pub include_litigation: bool,
}

/// Builds context using recursive retrieval following references.
pub struct RecursiveContextBuilder {
    base: ContextBuilder,
    extractor: ReferenceExtractor,
    max_depth: usize,
    max_references_per_chunk: usize,
}

impl RecursiveContextBuilder {
    /// Wraps a base builder with the default bounds.
    ///
    /// # Errors
    ///
    /// Returns an error if the reference patterns fail to compile.
    pub fn new(base: ContextBuilder) -> Result<Self> {
        Ok(Self {
            base,
            extractor: ReferenceExtractor::new()?,
            max_depth: DEFAULT_MAX_DEPTH,
            max_references_per_chunk: DEFAULT_MAX_REFERENCES_PER_CHUNK,
        })
    }

    /// The wrapped base builder.
    #[must_use]
    pub const fn base(&self) -> &ContextBuilder {
        &self.base
    }

    /// Builds a comprehensive bundle for the focus chunk.
    ///
    /// Seeds the four lists from the base builder, then walks a
    /// breadth-first queue of `(chunk_id, depth)` pairs: every queued
    /// chunk has its references extracted and followed, concept searches
    /// run at depth 0 when a context query is supplied, and litigation
    /// lands in the evidence list. Every reference at depth `d` is
    /// processed before any at `d + 1`.
    ///
    /// # Errors
    ///
    /// Propagates focus resolution and storage failures; retrieval
    /// failures degrade to missing slices.
    pub async fn build_recursive_context(
        &self,
        storage: &dyn Storage,
        chunk_id: &str,
        opts: &RecursiveOptions,
    ) -> Result<ContextBundle> {
        info!(chunk_id, "building recursive context");
        let base_bundle = self
            .base
            .build_context(storage, chunk_id, &opts.base)
            .await?;

        let mut manual_slices = base_bundle.manual_neighbors.clone();
        let mut regulation_slices = base_bundle.regulation_slices.clone();
        let guidance_slices = base_bundle.guidance_slices.clone();
        let mut litigation_slices: Vec<ContextSlice> = Vec::new();

        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        queue.push_back((chunk_id.to_string(), 0));
        let mut processed_chunks: HashSet<String> = HashSet::new();
        let mut processed_references: HashSet<String> = HashSet::new();

        while let Some((current_id, depth)) = queue.pop_front() {
            if depth >= self.max_depth {
                debug!(chunk_id = %current_id, depth, "max depth reached");
                continue;
            }
            if !processed_chunks.insert(current_id.clone()) {
                continue;
            }
            let Some(chunk) = self.base.load_chunk(storage, &current_id)? else {
                continue;
            };

            let mut references = self.extractor.extract_references(&chunk.content);

            let context_query = opts.base.context_query.as_deref().filter(|q| !q.is_empty());
            if depth == 0 {
                if let Some(query) = context_query {
                    // The agent's query doubles as a synthetic reference and
                    // seeds a direct concept search.
                    references.push(Reference {
                        text: query.to_string(),
                        section_number: None,
                    });
                    let concept_slices = self
                        .search_for_concept(query, chunk.document_id, &current_id)
                        .await?;
                    for slice in concept_slices {
                        push_new_slice(&mut manual_slices, slice, &mut queue, depth, &processed_chunks);
                    }
                }
            }

            debug!(
                chunk_id = %current_id,
                depth,
                references = references.len(),
                "references extracted"
            );

            for reference in references.iter().take(self.max_references_per_chunk) {
                if !processed_references.insert(reference.text.to_lowercase()) {
                    continue;
                }

                let referenced = self
                    .find_referenced_section(reference, chunk.document_id, &current_id)
                    .await?;

                let reference_lower = reference.text.to_lowercase();
                let regulation_shaped = ["part", "amc", "gm", "regulation"]
                    .iter()
                    .any(|keyword| reference_lower.contains(keyword));
                if regulation_shaped || context_query.is_some() {
                    let regulation_hits =
                        self.find_in_regulations(reference, &current_id).await?;
                    for slice in regulation_hits {
                        if !contains_chunk(&regulation_slices, &slice) {
                            regulation_slices.push(slice);
                        }
                    }
                }

                for slice in referenced {
                    push_new_slice(&mut manual_slices, slice, &mut queue, depth, &processed_chunks);
                }
            }

            if opts.include_litigation {
                let litigation = self.find_litigation(&chunk).await?;
                for slice in litigation {
                    push_new_slice(
                        &mut litigation_slices,
                        slice,
                        &mut queue,
                        depth,
                        &processed_chunks,
                    );
                }
            }
        }

        let mut bundle = ContextBundle {
            focus: base_bundle.focus,
            ..ContextBundle::default()
        };
        bundle.manual_neighbors = dedup_slices(manual_slices, MAX_SLICES_PER_LIST);
        bundle.regulation_slices = dedup_slices(regulation_slices, MAX_SLICES_PER_LIST);
        bundle.guidance_slices = dedup_slices(guidance_slices, MAX_SLICES_PER_LIST);
        bundle.evidence_slices = base_bundle.evidence_slices;
        let litigation_count = litigation_slices.len();
        bundle
            .evidence_slices
            .extend(dedup_slices(litigation_slices, MAX_LITIGATION_SLICES));

        // Recompute totals over everything retained.
        let estimator = self.base.estimator();
        bundle.total_tokens = bundle
            .focus
            .as_ref()
            .map_or(0, |focus| estimator.count(&focus.content))
            + bundle
                .all_slices()
                .iter()
                .map(|slice| estimator.count(&slice.content))
                .sum::<usize>();
        bundle.truncated = base_bundle.truncated;
        bundle.token_breakdown = base_bundle.token_breakdown;

        info!(
            chunk_id,
            manual = bundle.manual_neighbors.len(),
            regulations = bundle.regulation_slices.len(),
            guidance = bundle.guidance_slices.len(),
            litigation = litigation_count,
            total_tokens = bundle.total_tokens,
            "recursive context built"
        );
        Ok(bundle)
    }

    /// Finds chunks matching a section reference in the focus document.
    async fn find_referenced_section(
        &self,
        reference: &Reference,
        document_id: i64,
        current_chunk_id: &str,
    ) -> Result<Vec<ContextSlice>> {
        let query_text = reference.section_number.as_ref().map_or_else(
            || reference.text.clone(),
            |number| format!("{} {number}", reference.text),
        );

        let matches = self
            .base
            .vector_query(
                MANUAL_COLLECTION,
                &query_text,
                &format!("{current_chunk_id}_ref_{}", reference.text),
                5,
                Some(document_id),
            )
            .await?;

        Ok(self.matches_to_slices(
            matches,
            "manual",
            |idx| format!("Referenced section: {} (match {})", reference.text, idx + 1),
            &reference.text,
            "section_reference",
            true,
        ))
    }

    /// Searches regulations for a reference.
    async fn find_in_regulations(
        &self,
        reference: &Reference,
        current_chunk_id: &str,
    ) -> Result<Vec<ContextSlice>> {
        let matches = self
            .base
            .vector_query(
                REGULATION_COLLECTION,
                &reference.text,
                &format!("{current_chunk_id}_reg_{}", reference.text),
                5,
                None,
            )
            .await?;

        Ok(self.matches_to_slices(
            matches,
            "regulation",
            |idx| format!("Regulation search: {} (match {})", reference.text, idx + 1),
            &reference.text,
            "regulation_search",
            true,
        ))
    }

    /// Searches the focus document and regulations for a concept, not a
    /// section reference.
    async fn search_for_concept(
        &self,
        concept_query: &str,
        document_id: i64,
        current_chunk_id: &str,
    ) -> Result<Vec<ContextSlice>> {
        let preview = crate::core::chunk::preview(concept_query, 50);
        let manual_matches = self
            .base
            .vector_query(
                MANUAL_COLLECTION,
                concept_query,
                &format!("{current_chunk_id}_concept_{preview}"),
                10,
                Some(document_id),
            )
            .await?;
        let mut slices = self.matches_to_slices(
            manual_matches,
            "manual",
            |idx| format!("Concept search: {preview}... (match {})", idx + 1),
            concept_query,
            "concept_search",
            false,
        );

        let regulation_matches = self
            .base
            .vector_query(
                REGULATION_COLLECTION,
                concept_query,
                &format!("{current_chunk_id}_concept_reg_{preview}"),
                5,
                None,
            )
            .await?;
        slices.extend(self.matches_to_slices(
            regulation_matches,
            "regulation",
            |idx| format!("Regulation concept: {preview}... (match {})", idx + 1),
            concept_query,
            "regulation_concept_search",
            false,
        ));

        Ok(slices)
    }

    /// Finds case material related to a chunk. Case material shares the
    /// evidence collection.
    async fn find_litigation(&self, chunk: &ChunkRecord) -> Result<Vec<ContextSlice>> {
        let matches = self
            .base
            .vector_query(
                EVIDENCE_COLLECTION,
                &chunk.content,
                &format!("{}_litigation", chunk.chunk_id),
                5,
                None,
            )
            .await?;

        let estimator = self.base.estimator();
        Ok(matches
            .into_iter()
            .enumerate()
            .map(|(idx, m)| {
                let mut metadata = as_object(m.metadata);
                metadata
                    .entry("chunk_id".to_string())
                    .or_insert_with(|| Value::from(m.id.clone()));
                metadata.insert(
                    "reference_type".to_string(),
                    Value::from("litigation"),
                );
                metadata.insert(
                    "source_chunk_id".to_string(),
                    Value::from(chunk.chunk_id.clone()),
                );
                ContextSlice {
                    label: format!("Litigation/Case Law (match {})", idx + 1),
                    source: "evidence".to_string(),
                    content: m.document_text.clone(),
                    token_count: estimator.count(&m.document_text),
                    metadata: Value::Object(metadata),
                    score: Some(1.0 / (1.0 + f64::from(m.distance))),
                }
            })
            .collect())
    }

    fn matches_to_slices(
        &self,
        matches: Vec<VectorMatch>,
        source: &str,
        label: impl Fn(usize) -> String,
        reference_source: &str,
        reference_type: &str,
        quality_filter: bool,
    ) -> Vec<ContextSlice> {
        let estimator = self.base.estimator();
        matches
            .into_iter()
            .filter(|m| !quality_filter || reference_match_is_usable(m))
            .enumerate()
            .map(|(idx, m)| {
                let mut metadata = as_object(m.metadata);
                metadata
                    .entry("chunk_id".to_string())
                    .or_insert_with(|| Value::from(m.id.clone()));
                metadata.insert(
                    "reference_source".to_string(),
                    Value::from(reference_source),
                );
                metadata.insert("reference_type".to_string(), Value::from(reference_type));
                ContextSlice {
                    label: label(idx),
                    source: source.to_string(),
                    content: m.document_text.clone(),
                    token_count: estimator.count(&m.document_text),
                    metadata: Value::Object(metadata),
                    score: Some(1.0 / (1.0 + f64::from(m.distance))),
                }
            })
            .collect()
    }
}

/// Quality gate shared with the base builder's retrieval path.
fn reference_match_is_usable(m: &VectorMatch) -> bool {
    if m.distance > MAX_MATCH_DISTANCE {
        return false;
    }
    let trimmed = m.document_text.trim();
    if trimmed.len() < 10 {
        return false;
    }
    !trimmed
        .chars()
        .all(|c| c.is_ascii_digit() || c.is_whitespace() || c == '.' || c == '-')
}

fn contains_chunk(slices: &[ContextSlice], candidate: &ContextSlice) -> bool {
    match candidate.chunk_id() {
        Some(id) => slices.iter().any(|slice| slice.chunk_id() == Some(id)),
        None => false,
    }
}

/// Appends a slice when its chunk id is new, queueing the chunk for the
/// next depth.
fn push_new_slice(
    slices: &mut Vec<ContextSlice>,
    slice: ContextSlice,
    queue: &mut VecDeque<(String, usize)>,
    depth: usize,
    processed: &HashSet<String>,
) {
    if contains_chunk(slices, &slice) {
        return;
    }
    if let Some(id) = slice.chunk_id() {
        if !processed.contains(id) {
            queue.push_back((id.to_string(), depth + 1));
        }
    }
    slices.push(slice);
}

/// First-occurrence de-duplication by chunk id, capped.
fn dedup_slices(slices: Vec<ContextSlice>, cap: usize) -> Vec<ContextSlice> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for slice in slices {
        let key = slice
            .chunk_id()
            .map_or_else(|| slice.label.clone(), ToString::to_string);
        if seen.insert(key) {
            out.push(slice);
            if out.len() >= cap {
                break;
            }
        }
    }
    out
}
