//! Context assembly for chunk analysis.
//!
//! A context bundle is the prompt-input package for one focus chunk:
//! sequential manual neighbors, semantic matches from the categorized
//! vector collections, and optional evidence, admitted under per-bucket
//! and global token budgets.

pub mod builder;
pub mod recursive;

pub use builder::{ContextBuilder, ContextOptions};
pub use recursive::{RecursiveContextBuilder, ReferenceExtractor};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized representation of a context snippet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSlice {
    /// Display label ("Manual neighbor (next 1)", "Regulation ref #2", ...).
    pub label: String,
    /// Source category: manual, regulation, amc, gm, evidence.
    pub source: String,
    /// Slice text.
    pub content: String,
    /// Token count of the text.
    pub token_count: usize,
    /// Provenance metadata (chunk id, heading, reference source, ...).
    pub metadata: Value,
    /// Display score `1 / (1 + distance)`, when retrieved semantically.
    pub score: Option<f64>,
}

impl ContextSlice {
    /// The slice's chunk id from its metadata, if present.
    #[must_use]
    pub fn chunk_id(&self) -> Option<&str> {
        self.metadata.get("chunk_id").and_then(Value::as_str)
    }
}

/// Full context package handed to the analysis client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextBundle {
    /// The chunk under analysis.
    pub focus: Option<ContextSlice>,
    /// Sequential and semantic slices from the same manual.
    pub manual_neighbors: Vec<ContextSlice>,
    /// Regulation slices.
    pub regulation_slices: Vec<ContextSlice>,
    /// AMC and GM slices.
    pub guidance_slices: Vec<ContextSlice>,
    /// Evidence and litigation slices.
    pub evidence_slices: Vec<ContextSlice>,
    /// Admitted tokens per bucket.
    pub token_breakdown: BTreeMap<String, usize>,
    /// Total admitted tokens.
    pub total_tokens: usize,
    /// Set when any candidate was dropped for budget reasons.
    pub truncated: bool,
}

impl ContextBundle {
    /// Creates a bundle around a focus slice.
    #[must_use]
    pub fn new(focus: ContextSlice) -> Self {
        Self {
            focus: Some(focus),
            ..Self::default()
        }
    }

    /// All non-focus slices in category order.
    #[must_use]
    pub fn all_slices(&self) -> Vec<&ContextSlice> {
        self.manual_neighbors
            .iter()
            .chain(self.regulation_slices.iter())
            .chain(self.guidance_slices.iter())
            .chain(self.evidence_slices.iter())
            .collect()
    }

    /// Renders the bundle as prompt-ready text grouped by category.
    /// Empty categories produce no heading.
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut sections: Vec<String> = Vec::new();
        for (prefix, collection) in [
            ("Manual Context", &self.manual_neighbors),
            ("Regulation Context", &self.regulation_slices),
            ("Guidance Context", &self.guidance_slices),
            ("Evidence Context", &self.evidence_slices),
        ] {
            if collection.is_empty() {
                continue;
            }
            let mut lines = vec![format!("### {prefix}")];
            for slice in collection {
                let heading = slice
                    .metadata
                    .get("heading")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if heading.is_empty() {
                    lines.push(format!("- {}:", slice.label));
                } else {
                    lines.push(format!("- {} [{heading}]:", slice.label));
                }
                lines.push(slice.content.clone());
            }
            sections.push(lines.join("\n"));
        }
        sections.join("\n\n")
    }
}

/// Coerces a metadata value into a JSON object map.
pub(crate) fn as_object(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

/// Tracks token consumption across context categories.
///
/// Admission is strict and order-preserving: the first candidate that
/// would breach either the bucket or the global budget is rejected and
/// marks the budget as truncated.
#[derive(Debug)]
pub struct TokenBudget {
    total_limit: usize,
    total_used: usize,
    bucket_used: BTreeMap<String, usize>,
    truncated: bool,
}

impl TokenBudget {
    /// Creates a budget with the given global limit.
    #[must_use]
    pub fn new(total_limit: usize) -> Self {
        Self {
            total_limit,
            total_used: 0,
            bucket_used: BTreeMap::new(),
            truncated: false,
        }
    }

    /// Admits `tokens` into `bucket` if both the bucket limit and the
    /// global limit allow it.
    pub fn allow(&mut self, bucket: &str, token_limit: usize, tokens: usize) -> bool {
        if token_limit == 0 || tokens == 0 {
            return false;
        }
        if self.total_used + tokens > self.total_limit {
            self.truncated = true;
            return false;
        }
        let used = self.bucket_used.get(bucket).copied().unwrap_or(0);
        if used + tokens > token_limit {
            self.truncated = true;
            return false;
        }
        self.total_used += tokens;
        self.bucket_used.insert(bucket.to_string(), used + tokens);
        true
    }

    /// Total admitted tokens.
    #[must_use]
    pub const fn total_used(&self) -> usize {
        self.total_used
    }

    /// Per-bucket admitted tokens.
    #[must_use]
    pub fn breakdown(&self) -> BTreeMap<String, usize> {
        self.bucket_used.clone()
    }

    /// Whether any candidate was rejected for budget reasons.
    #[must_use]
    pub const fn truncated(&self) -> bool {
        self.truncated
    }
}
