//! Section-aware chunking for the audit engine.
//!
//! Splits ordered document sections into ordered chunks with stable ids,
//! token counts, heading ancestry, and prev/next back-references. Two modes:
//!
//! - **Section-aware** (default): one chunk per non-empty section, split by
//!   token windows only when a section exceeds the per-section token cap
//! - **Token-window**: slide a fixed window of tokens with overlap across
//!   each section, with no overall truncation
//!
//! The chunker is deterministic: identical input produces identical chunk
//! ids, texts, metadata, and ordering.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::chunk::{ChunkMetadata, ChunkPayload, Section};
use crate::error::{ChunkingError, Result};
use crate::token::TokenEstimator;

/// Default token-window size.
pub const DEFAULT_WINDOW_SIZE: usize = 800;

/// Default token-window overlap.
pub const DEFAULT_WINDOW_OVERLAP: usize = 80;

/// Default cap on tokens taken from a single section in section-aware mode.
pub const DEFAULT_MAX_SECTION_TOKENS: usize = 4000;

/// How sections are turned into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingMode {
    /// One chunk per non-empty section, windowed only when oversized.
    SectionAware,
    /// Fixed token windows with overlap across each section.
    TokenWindow,
}

impl ChunkingMode {
    /// Metadata representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SectionAware => "section_aware",
            Self::TokenWindow => "token_window",
        }
    }
}

/// Chunker configuration.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Token-window size.
    pub size: usize,
    /// Token-window overlap.
    pub overlap: usize,
    /// Per-section token cap for section-aware mode.
    pub max_section_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_WINDOW_SIZE,
            overlap: DEFAULT_WINDOW_OVERLAP,
            max_section_tokens: DEFAULT_MAX_SECTION_TOKENS,
        }
    }
}

/// Section-aware chunker with token budgeting.
pub struct SectionChunker {
    config: ChunkerConfig,
    estimator: Arc<dyn TokenEstimator>,
}

impl SectionChunker {
    /// Creates a chunker sharing the engine's token estimator.
    #[must_use]
    pub fn new(config: ChunkerConfig, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self { config, estimator }
    }

    /// Chunks ordered sections into ordered payloads.
    ///
    /// Chunk ids are `"{doc_id}_{section_index}_{chunk_in_section}"`. After a
    /// chunk is emitted, the previously emitted chunk in the document gains
    /// `next_chunk_id` and the new chunk gains `prev_chunk_id`; linking
    /// crosses section boundaries.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkingError::InvalidConfig`] for a zero window size,
    /// [`ChunkingError::OverlapTooLarge`] when the overlap is not smaller
    /// than the window, and [`ChunkingError::DuplicateChunkId`] when two
    /// sections share an index.
    pub fn chunk_sections(
        &self,
        doc_id: &str,
        sections: &[Section],
        mode: ChunkingMode,
    ) -> Result<Vec<ChunkPayload>> {
        if self.config.size == 0 {
            return Err(ChunkingError::InvalidConfig {
                reason: "window size must be > 0".to_string(),
            }
            .into());
        }
        if self.config.overlap >= self.config.size {
            return Err(ChunkingError::OverlapTooLarge {
                overlap: self.config.overlap,
                size: self.config.size,
            }
            .into());
        }

        let mut payloads: Vec<ChunkPayload> = Vec::new();
        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut previous_chunk_id: Option<String> = None;

        for section in sections {
            let prepared = prepare_section_content(&section.content);
            if prepared.is_empty() {
                continue;
            }

            let section_path = resolve_section_path(section);
            let splits = match mode {
                ChunkingMode::SectionAware => {
                    let truncated = self
                        .estimator
                        .truncate(&prepared, self.config.max_section_tokens);
                    if self.estimator.count(&truncated) > self.config.max_section_tokens {
                        self.estimator
                            .split_windows(&truncated, self.config.size, self.config.overlap)
                    } else {
                        vec![truncated]
                    }
                }
                ChunkingMode::TokenWindow => {
                    self.estimator
                        .split_windows(&prepared, self.config.size, self.config.overlap)
                }
            };

            for (chunk_in_section, split) in splits.into_iter().enumerate() {
                let text = split.trim().to_string();
                if text.is_empty() {
                    continue;
                }

                let chunk_id = format!("{doc_id}_{}_{chunk_in_section}", section.index);
                if !seen_ids.insert(chunk_id.clone()) {
                    return Err(ChunkingError::DuplicateChunkId { id: chunk_id }.into());
                }

                let token_count = self.estimator.count(&text);
                let mut metadata = ChunkMetadata {
                    section_index: section.index,
                    chunk_in_section,
                    token_count,
                    chunking_mode: mode.as_str().to_string(),
                    section_metadata: section.metadata.clone(),
                    ..ChunkMetadata::default()
                };

                if let Some(prev_id) = previous_chunk_id.take() {
                    metadata.prev_chunk_id = Some(prev_id);
                    if let Some(prev) = payloads.last_mut() {
                        prev.metadata.next_chunk_id = Some(chunk_id.clone());
                    }
                }

                previous_chunk_id = Some(chunk_id.clone());
                payloads.push(ChunkPayload {
                    chunk_id,
                    doc_id: doc_id.to_string(),
                    text,
                    token_count,
                    section_path: section_path.clone(),
                    parent_heading: section.title.clone(),
                    metadata,
                });
            }
        }

        Ok(payloads)
    }
}

/// Normalizes section text: trailing whitespace stripped per line, then the
/// whole block trimmed.
fn prepare_section_content(content: &str) -> String {
    content
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Resolves the heading ancestry for a section, falling back through the
/// explicit path, path-bearing metadata, the title, and finally a
/// synthesized `section_NNNN` heading.
fn resolve_section_path(section: &Section) -> Vec<String> {
    let candidates: Option<Vec<String>> = section.section_path.clone().or_else(|| {
        for key in ["section_path", "heading_path"] {
            if let Some(serde_json::Value::Array(parts)) = section.metadata.get(key) {
                return Some(
                    parts
                        .iter()
                        .filter_map(|part| part.as_str().map(ToString::to_string))
                        .collect(),
                );
            }
        }
        None
    });

    let resolved: Vec<String> = candidates
        .unwrap_or_default()
        .into_iter()
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect();
    if !resolved.is_empty() {
        return resolved;
    }

    let fallback = section
        .title
        .as_deref()
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .map_or_else(|| format!("section_{:04}", section.index), ToString::to_string);
    vec![fallback]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::HeuristicEstimator;
    use proptest::prelude::*;

    fn chunker() -> SectionChunker {
        SectionChunker::new(ChunkerConfig::default(), Arc::new(HeuristicEstimator))
    }

    fn small_chunker(size: usize, overlap: usize, max_section: usize) -> SectionChunker {
        SectionChunker::new(
            ChunkerConfig {
                size,
                overlap,
                max_section_tokens: max_section,
            },
            Arc::new(HeuristicEstimator),
        )
    }

    #[test]
    fn test_one_chunk_per_section() {
        let sections = vec![
            Section::titled(0, "§1 Scope", "This manual covers maintenance."),
            Section::titled(1, "§2 Responsibilities", "The manager is accountable."),
        ];
        let chunks = chunker()
            .chunk_sections("D", &sections, ChunkingMode::SectionAware)
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_id, "D_0_0");
        assert_eq!(chunks[1].chunk_id, "D_1_0");
        assert_eq!(chunks[0].parent_heading.as_deref(), Some("§1 Scope"));
    }

    #[test]
    fn test_empty_sections_skipped() {
        let sections = vec![
            Section::new(0, "   \n  "),
            Section::new(1, "content"),
            Section::new(2, ""),
        ];
        let chunks = chunker()
            .chunk_sections("D", &sections, ChunkingMode::SectionAware)
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_id, "D_1_0");
    }

    #[test]
    fn test_prev_next_linking_crosses_sections() {
        let sections = vec![
            Section::new(0, "first"),
            Section::new(1, "second"),
            Section::new(2, "third"),
        ];
        let chunks = chunker()
            .chunk_sections("D", &sections, ChunkingMode::SectionAware)
            .unwrap();

        assert!(chunks[0].metadata.prev_chunk_id.is_none());
        assert_eq!(
            chunks[0].metadata.next_chunk_id.as_deref(),
            Some("D_1_0")
        );
        assert_eq!(
            chunks[1].metadata.prev_chunk_id.as_deref(),
            Some("D_0_0")
        );
        assert_eq!(
            chunks[1].metadata.next_chunk_id.as_deref(),
            Some("D_2_0")
        );
        assert_eq!(
            chunks[2].metadata.prev_chunk_id.as_deref(),
            Some("D_1_0")
        );
        assert!(chunks[2].metadata.next_chunk_id.is_none());
    }

    #[test]
    fn test_oversized_section_truncated() {
        // 40 tokens of content against a 10-token section cap.
        let chunker = small_chunker(8, 2, 10);
        let sections = vec![Section::new(0, "word ".repeat(32).trim().to_string())];
        let chunks = chunker
            .chunk_sections("D", &sections, ChunkingMode::SectionAware)
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].token_count <= 10);
    }

    #[test]
    fn test_token_window_mode_windows_whole_section() {
        let chunker = small_chunker(4, 1, 10);
        // 100 tokens; no truncation in token-window mode.
        let text = "x".repeat(400);
        let sections = vec![Section::new(0, text)];
        let chunks = chunker
            .chunk_sections("D", &sections, ChunkingMode::TokenWindow)
            .unwrap();
        assert!(chunks.len() > 5);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_id, format!("D_0_{i}"));
            assert_eq!(chunk.metadata.chunking_mode, "token_window");
        }
    }

    #[test]
    fn test_section_path_fallbacks() {
        let mut with_meta = Section::new(5, "body");
        with_meta.metadata.insert(
            "heading_path".to_string(),
            serde_json::json!(["Manual", "Part A"]),
        );
        let untitled = Section::new(7, "body");

        let chunks = chunker()
            .chunk_sections(
                "D",
                &[with_meta, untitled],
                ChunkingMode::SectionAware,
            )
            .unwrap();
        assert_eq!(chunks[0].section_path, vec!["Manual", "Part A"]);
        assert_eq!(chunks[1].section_path, vec!["section_0007"]);
    }

    #[test]
    fn test_explicit_section_path_wins() {
        let mut section = Section::titled(0, "Title", "body");
        section.section_path = Some(vec!["A".to_string(), " B ".to_string(), String::new()]);
        let chunks = chunker()
            .chunk_sections("D", &[section], ChunkingMode::SectionAware)
            .unwrap();
        assert_eq!(chunks[0].section_path, vec!["A", "B"]);
    }

    #[test]
    fn test_duplicate_section_index_rejected() {
        let sections = vec![Section::new(0, "a"), Section::new(0, "b")];
        let result = chunker().chunk_sections("D", &sections, ChunkingMode::SectionAware);
        assert!(matches!(
            result,
            Err(crate::error::Error::Chunking(
                ChunkingError::DuplicateChunkId { .. }
            ))
        ));
    }

    #[test]
    fn test_overlap_validation() {
        let chunker = small_chunker(10, 10, 100);
        let result = chunker.chunk_sections(
            "D",
            &[Section::new(0, "text")],
            ChunkingMode::TokenWindow,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_section_metadata_carried() {
        let mut section = Section::new(0, "body");
        section
            .metadata
            .insert("page".to_string(), serde_json::json!(12));
        let chunks = chunker()
            .chunk_sections("D", &[section], ChunkingMode::SectionAware)
            .unwrap();
        assert_eq!(
            chunks[0].metadata.section_metadata.get("page"),
            Some(&serde_json::json!(12))
        );
    }

    #[test]
    fn test_prepare_strips_trailing_whitespace() {
        assert_eq!(
            prepare_section_content("line one   \nline two\t\n"),
            "line one\nline two"
        );
    }

    #[test]
    fn test_round_trip_non_split_section() {
        // Concatenating the chunk texts of a non-split section equals the
        // prepared section text.
        let content = "Procedures shall be documented.\nRecords retained two years.";
        let chunks = chunker()
            .chunk_sections(
                "D",
                &[Section::new(0, content)],
                ChunkingMode::SectionAware,
            )
            .unwrap();
        let concatenated: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(concatenated, prepare_section_content(content));
    }

    proptest! {
        #[test]
        fn prop_chunker_deterministic(texts in proptest::collection::vec("[ a-zA-Z0-9.\n]{0,200}", 0..8)) {
            let sections: Vec<Section> = texts
                .iter()
                .enumerate()
                .map(|(i, t)| Section::new(i, t.clone()))
                .collect();
            let chunker = small_chunker(16, 4, 64);
            let first = chunker
                .chunk_sections("D", &sections, ChunkingMode::SectionAware)
                .unwrap();
            let second = chunker
                .chunk_sections("D", &sections, ChunkingMode::SectionAware)
                .unwrap();
            prop_assert_eq!(&first, &second);

            // Ordering is by section index then local index, and ids are unique.
            let mut ids = HashSet::new();
            let mut last_key = None;
            for chunk in &first {
                prop_assert!(ids.insert(chunk.chunk_id.clone()));
                let key = (chunk.metadata.section_index, chunk.metadata.chunk_in_section);
                if let Some(prev) = last_key {
                    prop_assert!(key > prev);
                }
                last_key = Some(key);
            }
        }
    }
}
