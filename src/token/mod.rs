//! Token estimation for chunking, budgeting, and context rendering.
//!
//! A concrete BPE tokenizer may be absent; the default is a character
//! heuristic (~4 characters per token). Chunking, budgeting, and rendering
//! must share one estimator instance so their counts cannot drift.
//!
//! # Feature Flags
//!
//! - `bpe-tokenizer`: enables exact counts via `tiktoken-rs`
//! - Without the feature: char/4 heuristic only

#[cfg(feature = "bpe-tokenizer")]
mod bpe;

#[cfg(feature = "bpe-tokenizer")]
pub use bpe::BpeEstimator;

use std::sync::Arc;

/// Trait for token counting and token-aligned text manipulation.
///
/// Implementations must be `Send + Sync`; one instance is shared across
/// the chunker, the context builder, and the recursive builder.
pub trait TokenEstimator: Send + Sync {
    /// Name of the underlying tokenizer ("heuristic" when absent).
    fn name(&self) -> &str;

    /// Counts tokens in `text`. Empty text counts as 0; non-empty text
    /// counts at least 1.
    fn count(&self, text: &str) -> usize;

    /// Truncates `text` to at most `max_tokens` tokens.
    ///
    /// The default maps the budget to `max_tokens * 4` bytes on a UTF-8
    /// boundary; BPE implementations cut on exact token boundaries.
    fn truncate(&self, text: &str, max_tokens: usize) -> String {
        if max_tokens == 0 {
            return String::new();
        }
        floor_char_boundary(text, max_tokens.saturating_mul(4)).to_string()
    }

    /// Splits `text` into windows of `size` tokens with `overlap` tokens
    /// of carry-over between consecutive windows.
    fn split_windows(&self, text: &str, size: usize, overlap: usize) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        let window_bytes = size.saturating_mul(4).max(1);
        let overlap_bytes = overlap.saturating_mul(4);

        let mut windows = Vec::new();
        let mut start = 0;
        let total = text.len();
        while start < total {
            let end_target = (start + window_bytes).min(total);
            let slice = floor_char_boundary(&text[start..], end_target - start);
            let end = start + slice.len().max(1);
            windows.push(text[start..end.min(total)].to_string());
            if end >= total {
                break;
            }
            let next = end.saturating_sub(overlap_bytes);
            // Carry-over must not stall the walk.
            start = if next > start { next } else { end };
            while start < total && !text.is_char_boundary(start) {
                start += 1;
            }
        }
        windows
    }
}

/// Character-heuristic estimator: `ceil(len / 4)`, floor 1 for non-empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

impl TokenEstimator for HeuristicEstimator {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            0
        } else {
            text.len().div_ceil(4).max(1)
        }
    }
}

/// Creates the estimator for a tokenizer name.
///
/// With `bpe-tokenizer` enabled, known encodings resolve to exact BPE
/// counting; anything unresolvable falls back to the heuristic.
#[cfg(feature = "bpe-tokenizer")]
#[must_use]
pub fn create_estimator(name: &str) -> Arc<dyn TokenEstimator> {
    BpeEstimator::resolve(name).map_or_else(
        || {
            tracing::warn!(tokenizer = name, "unable to resolve tokenizer, using character heuristic");
            Arc::new(HeuristicEstimator) as Arc<dyn TokenEstimator>
        },
        |bpe| Arc::new(bpe) as Arc<dyn TokenEstimator>,
    )
}

/// Creates the estimator for a tokenizer name.
///
/// Without the `bpe-tokenizer` feature every name resolves to the
/// character heuristic.
#[cfg(not(feature = "bpe-tokenizer"))]
#[must_use]
pub fn create_estimator(_name: &str) -> Arc<dyn TokenEstimator> {
    Arc::new(HeuristicEstimator)
}

/// Largest prefix of `text` at most `max_bytes` long ending on a UTF-8
/// boundary.
fn floor_char_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut boundary = max_bytes;
    while boundary > 0 && !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    &text[..boundary]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_counts_zero() {
        assert_eq!(HeuristicEstimator.count(""), 0);
    }

    #[test]
    fn test_non_empty_floor_one() {
        assert_eq!(HeuristicEstimator.count("a"), 1);
        assert_eq!(HeuristicEstimator.count("ab"), 1);
    }

    #[test]
    fn test_count_ceil_division() {
        assert_eq!(HeuristicEstimator.count("abcd"), 1);
        assert_eq!(HeuristicEstimator.count("abcde"), 2);
        assert_eq!(HeuristicEstimator.count(&"x".repeat(400)), 100);
    }

    #[test]
    fn test_truncate_zero_budget() {
        assert_eq!(HeuristicEstimator.truncate("hello", 0), "");
    }

    #[test]
    fn test_truncate_within_budget() {
        assert_eq!(HeuristicEstimator.truncate("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_cuts_on_char_boundary() {
        let text = "ääää";
        let cut = HeuristicEstimator.truncate(text, 1);
        assert!(text.starts_with(&cut));
        assert!(cut.len() <= 4);
        assert!(!cut.is_empty());
    }

    #[test]
    fn test_split_windows_empty() {
        assert!(HeuristicEstimator.split_windows("", 10, 2).is_empty());
    }

    #[test]
    fn test_split_windows_single() {
        let windows = HeuristicEstimator.split_windows("short", 10, 2);
        assert_eq!(windows, vec!["short".to_string()]);
    }

    #[test]
    fn test_split_windows_covers_text() {
        let text = "0123456789ABCDEFGHIJ";
        // 2-token windows (8 bytes), no overlap
        let windows = HeuristicEstimator.split_windows(text, 2, 0);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows.concat(), text);
    }

    #[test]
    fn test_split_windows_overlap_carries_over() {
        let text = "0123456789ABCDEF";
        // 2-token windows (8 bytes) with 1-token overlap (4 bytes)
        let windows = HeuristicEstimator.split_windows(text, 2, 1);
        assert!(windows.len() >= 2);
        // second window starts 4 bytes before the first one ended
        assert!(windows[1].starts_with("4567"));
    }

    #[test]
    fn test_split_windows_always_progresses() {
        // Overlap equal to size must still terminate.
        let text = "abcdefgh".repeat(8);
        let windows = HeuristicEstimator.split_windows(&text, 2, 2);
        assert!(!windows.is_empty());
        assert!(windows.len() < 1000);
    }

    #[test]
    fn test_create_estimator_falls_back() {
        let estimator = create_estimator("no-such-encoding");
        assert!(estimator.count("hello") >= 1);
    }
}
