//! Chunk representation for the audit engine.
//!
//! Chunks are the unit of analysis: one bounded-token segment of a document
//! section, carrying a stable id, a sequential index, and sequencing
//! metadata used by the context builder.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A structured section handed to the chunker.
///
/// Sections arrive from the extraction pipeline in document order; the
/// chunker only relies on `index` being unique per document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Section {
    /// Position of the section within the document.
    pub index: usize,
    /// Section heading, if the extractor found one.
    pub title: Option<String>,
    /// Raw section text.
    pub content: String,
    /// Ordered heading ancestry, if known.
    pub section_path: Option<Vec<String>>,
    /// Extractor-supplied metadata carried through to the chunk.
    pub metadata: Map<String, Value>,
}

impl Section {
    /// Creates a section with just an index and content.
    #[must_use]
    pub fn new(index: usize, content: impl Into<String>) -> Self {
        Self {
            index,
            content: content.into(),
            ..Self::default()
        }
    }

    /// Creates a titled section.
    #[must_use]
    pub fn titled(index: usize, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            index,
            title: Some(title.into()),
            content: content.into(),
            ..Self::default()
        }
    }
}

/// Embedding lifecycle of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingStatus {
    /// Created, vector not yet generated.
    Pending,
    /// Picked up by the embedding job.
    InProgress,
    /// Vector insertion confirmed.
    Completed,
    /// Embedding failed.
    Failed,
}

impl EmbeddingStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses the database representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Typed chunk metadata with known keys plus an extension map.
///
/// The known keys are what the context builder and runner rely on; anything
/// else the extractor attached rides along in `extra` untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Index of the source section within the document.
    pub section_index: usize,
    /// Index of this chunk within its section.
    pub chunk_in_section: usize,
    /// Token count of the chunk text.
    pub token_count: usize,
    /// Chunking mode that produced this chunk.
    pub chunking_mode: String,
    /// Id of the previously emitted chunk in the document, if any.
    /// Linking crosses section boundaries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_chunk_id: Option<String>,
    /// Id of the next emitted chunk in the document, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_chunk_id: Option<String>,
    /// Caller-supplied section metadata, carried verbatim.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub section_metadata: Map<String, Value>,
    /// Unrecognized keys from older payloads.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Normalized payload emitted by the chunker, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPayload {
    /// Globally unique chunk id: `{doc_id}_{section_index}_{chunk_in_section}`.
    pub chunk_id: String,
    /// External id of the owning document.
    pub doc_id: String,
    /// Chunk text.
    pub text: String,
    /// Token count of the text.
    pub token_count: usize,
    /// Ordered heading ancestry.
    pub section_path: Vec<String>,
    /// Section heading, if any.
    pub parent_heading: Option<String>,
    /// Sequencing and provenance metadata.
    pub metadata: ChunkMetadata,
}

/// A persisted chunk row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Surrogate id (assigned by the storage layer).
    pub id: Option<i64>,
    /// Owning document surrogate id.
    pub document_id: i64,
    /// External chunk id, unique across the corpus.
    pub chunk_id: String,
    /// Monotonic position within the document, starting at 0.
    pub chunk_index: i64,
    /// Heading ancestry rendered as `"a > b > c"`.
    pub section_path: Option<String>,
    /// Section heading, if any.
    pub parent_heading: Option<String>,
    /// Chunk text. Immutable once created.
    pub content: String,
    /// Token count of the text.
    pub token_count: Option<i64>,
    /// Sequencing and provenance metadata.
    pub metadata: ChunkMetadata,
    /// Embedding lifecycle. The only mutable column.
    pub embedding_status: EmbeddingStatus,
}

impl ChunkRecord {
    /// Heading ancestry split back into its parts.
    #[must_use]
    pub fn section_path_parts(&self) -> Vec<String> {
        self.section_path
            .as_deref()
            .map(|path| {
                path.split('>')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns a preview of the chunk content (first `max_len` characters),
    /// respecting UTF-8 boundaries.
    #[must_use]
    pub fn preview(&self, max_len: usize) -> &str {
        preview(&self.content, max_len)
    }

    /// The chunk metadata as a JSON value, for slice metadata merging.
    #[must_use]
    pub fn metadata_value(&self) -> Value {
        serde_json::to_value(&self.metadata).unwrap_or(Value::Null)
    }
}

/// Renders a heading ancestry list as `"a > b > c"`.
#[must_use]
pub fn render_section_path(parts: &[String]) -> String {
    parts.join(" > ")
}

/// Truncates text to at most `max_len` bytes on a UTF-8 boundary.
#[must_use]
pub fn preview(text: &str, max_len: usize) -> &str {
    if text.len() <= max_len {
        return text;
    }
    let mut boundary = max_len;
    while boundary > 0 && !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    &text[..boundary]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_constructors() {
        let s = Section::new(3, "body");
        assert_eq!(s.index, 3);
        assert!(s.title.is_none());

        let s = Section::titled(0, "Scope", "body");
        assert_eq!(s.title.as_deref(), Some("Scope"));
    }

    #[test]
    fn test_embedding_status_round_trip() {
        for status in [
            EmbeddingStatus::Pending,
            EmbeddingStatus::InProgress,
            EmbeddingStatus::Completed,
            EmbeddingStatus::Failed,
        ] {
            assert_eq!(EmbeddingStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(EmbeddingStatus::parse("queued"), None);
    }

    #[test]
    fn test_section_path_parts() {
        let record = ChunkRecord {
            id: None,
            document_id: 1,
            chunk_id: "d_0_0".to_string(),
            chunk_index: 0,
            section_path: Some("Manual > 4 Procedures > 4.2 Records".to_string()),
            parent_heading: None,
            content: String::new(),
            token_count: None,
            metadata: ChunkMetadata::default(),
            embedding_status: EmbeddingStatus::Pending,
        };
        assert_eq!(
            record.section_path_parts(),
            vec!["Manual", "4 Procedures", "4.2 Records"]
        );
    }

    #[test]
    fn test_render_section_path() {
        let parts = vec!["a".to_string(), "b".to_string()];
        assert_eq!(render_section_path(&parts), "a > b");
        assert_eq!(render_section_path(&[]), "");
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        assert_eq!(preview("Hello", 10), "Hello");
        assert_eq!(preview("Hello", 3), "Hel");
        // Multi-byte: must not split the codepoint
        let text = "ä§1";
        let cut = preview(text, 1);
        assert!(text.starts_with(cut));
        assert!(cut.len() <= 1);
    }

    #[test]
    fn test_metadata_serde_round_trip() {
        let mut meta = ChunkMetadata {
            section_index: 2,
            chunk_in_section: 0,
            token_count: 42,
            chunking_mode: "section_aware".to_string(),
            prev_chunk_id: Some("d_1_0".to_string()),
            ..ChunkMetadata::default()
        };
        meta.section_metadata
            .insert("page".to_string(), Value::from(7));

        let json = serde_json::to_string(&meta).unwrap();
        let back: ChunkMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
        assert!(json.contains("prev_chunk_id"));
        // next_chunk_id unset stays absent from the payload
        assert!(!json.contains("next_chunk_id"));
    }

    #[test]
    fn test_metadata_preserves_unknown_keys() {
        let json = r#"{
            "section_index": 1,
            "chunk_in_section": 0,
            "token_count": 5,
            "chunking_mode": "section_aware",
            "reference_source": "Section 4.2"
        }"#;
        let meta: ChunkMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(
            meta.extra.get("reference_source"),
            Some(&Value::from("Section 4.2"))
        );
    }
}
