//! Exact BPE token counting backed by `tiktoken-rs`.

use tiktoken_rs::CoreBPE;

use crate::token::TokenEstimator;

/// Estimator backed by a real BPE encoding.
pub struct BpeEstimator {
    name: String,
    bpe: CoreBPE,
}

impl BpeEstimator {
    /// Resolves a named encoding. Returns `None` when the name does not
    /// map to a bundled encoding.
    #[must_use]
    pub fn resolve(name: &str) -> Option<Self> {
        let bpe = match name {
            "cl100k_base" => tiktoken_rs::cl100k_base().ok()?,
            "o200k_base" => tiktoken_rs::o200k_base().ok()?,
            "p50k_base" => tiktoken_rs::p50k_base().ok()?,
            "r50k_base" => tiktoken_rs::r50k_base().ok()?,
            // Model names resolve through the model table.
            other => tiktoken_rs::get_bpe_from_model(other).ok()?,
        };
        Some(Self {
            name: name.to_string(),
            bpe,
        })
    }
}

impl std::fmt::Debug for BpeEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BpeEstimator")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl TokenEstimator for BpeEstimator {
    fn name(&self) -> &str {
        &self.name
    }

    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.bpe.encode_ordinary(text).len()
    }

    fn truncate(&self, text: &str, max_tokens: usize) -> String {
        if max_tokens == 0 {
            return String::new();
        }
        let tokens = self.bpe.encode_ordinary(text);
        if tokens.len() <= max_tokens {
            return text.to_string();
        }
        self.bpe
            .decode(tokens[..max_tokens].to_vec())
            .unwrap_or_else(|_| TokenEstimator::truncate(&super::HeuristicEstimator, text, max_tokens))
    }

    fn split_windows(&self, text: &str, size: usize, overlap: usize) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        let size = size.max(1);
        let tokens = self.bpe.encode_ordinary(text);
        let total = tokens.len();
        let mut windows = Vec::new();
        let mut start = 0;
        while start < total {
            let end = (start + size).min(total);
            match self.bpe.decode(tokens[start..end].to_vec()) {
                Ok(window) => windows.push(window),
                Err(_) => {
                    // Token slice landed mid-codepoint; fall back to the
                    // character walk for the whole text.
                    return TokenEstimator::split_windows(
                        &super::HeuristicEstimator,
                        text,
                        size,
                        overlap,
                    );
                }
            }
            if end >= total {
                break;
            }
            let next = end.saturating_sub(overlap);
            start = if next > start { next } else { end };
        }
        windows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_encoding() {
        let estimator = BpeEstimator::resolve("cl100k_base");
        assert!(estimator.is_some());
    }

    #[test]
    fn test_resolve_unknown_returns_none() {
        assert!(BpeEstimator::resolve("definitely-not-an-encoding").is_none());
    }

    #[test]
    fn test_count_empty() {
        let estimator = BpeEstimator::resolve("cl100k_base").unwrap();
        assert_eq!(estimator.count(""), 0);
    }

    #[test]
    fn test_truncate_round_trips_short_text() {
        let estimator = BpeEstimator::resolve("cl100k_base").unwrap();
        assert_eq!(estimator.truncate("hello world", 100), "hello world");
    }

    #[test]
    fn test_split_windows_respects_size() {
        let estimator = BpeEstimator::resolve("cl100k_base").unwrap();
        let text = "the quick brown fox jumps over the lazy dog ".repeat(20);
        let windows = estimator.split_windows(&text, 16, 4);
        assert!(windows.len() > 1);
        for window in &windows {
            assert!(estimator.count(window) <= 16);
        }
    }
}
