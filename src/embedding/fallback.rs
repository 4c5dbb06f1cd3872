//! Deterministic fallback embedder.
//!
//! Without an embedding endpoint the retrieval pipeline still needs
//! vectors it can rank, so this embedder derives features from the shape
//! of regulatory text: words, adjacent word pairs, and citation-shaped
//! tokens ("4.2", "145.A.30"). Citation tokens get a reserved band of the
//! vector and a fixed positive weight, so chunks citing the same section
//! land near each other even when their surrounding prose differs - which
//! is exactly what the reference-following retrieval queries for. This is
//! lexical overlap, not semantics.

use async_trait::async_trait;

use crate::embedding::Embedder;
use crate::error::Result;

/// FNV-1a 64-bit offset basis.
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
/// FNV-1a 64-bit prime.
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Feature-channel seeds, folded into the hash so the same token maps to
/// different slots per channel.
const WORD_SEED: u64 = 0x5741;
const PAIR_SEED: u64 = 0x5052;
const CITATION_SEED: u64 = 0x4354;

/// Share of dimensions reserved for citation-shaped tokens (one quarter).
const CITATION_BAND_DIVISOR: usize = 4;

/// Weight of a single word feature before the hash-derived jitter.
const WORD_WEIGHT: f32 = 1.0;
/// Weight of an adjacent word-pair feature.
const PAIR_WEIGHT: f32 = 0.75;
/// Weight of a citation feature. Always positive: shared citations must
/// reinforce, never cancel.
const CITATION_WEIGHT: f32 = 2.0;

/// Hash-based fallback embedder keyed to regulatory text structure.
///
/// Used when no API key is configured and in tests. Deterministic:
/// identical text always produces the identical vector.
#[derive(Debug, Clone, Copy)]
pub struct FallbackEmbedder {
    dimensions: usize,
}

impl FallbackEmbedder {
    /// Creates a new fallback embedder with the specified dimensions.
    #[must_use]
    pub const fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    /// Returns the embedding dimensions.
    #[must_use]
    pub const fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// FNV-1a over the token bytes, with a channel seed folded into the
    /// offset basis.
    fn fnv1a(seed: u64, token: &str) -> u64 {
        let mut hash = FNV_OFFSET ^ seed;
        for byte in token.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }

    /// Whether a token is shaped like a section or regulation reference:
    /// digits and letters joined by at least one interior dot ("4.2",
    /// "145.a.30" after lowercasing).
    fn is_citation_token(token: &str) -> bool {
        let mut has_digit = false;
        let mut has_interior_dot = false;
        let last = token.len().saturating_sub(1);
        for (i, c) in token.char_indices() {
            match c {
                '0'..='9' => has_digit = true,
                '.' if i > 0 && i < last => has_interior_dot = true,
                '.' | 'a'..='z' => {}
                _ => return false,
            }
        }
        has_digit && has_interior_dot
    }

    /// Lowercased tokens with surrounding punctuation stripped; interior
    /// dots survive so citation tokens stay whole.
    fn tokenize(text: &str) -> Vec<String> {
        text.split_whitespace()
            .map(|raw| {
                raw.chars()
                    .filter(|c| c.is_alphanumeric() || *c == '.')
                    .collect::<String>()
                    .trim_matches('.')
                    .to_lowercase()
            })
            .filter(|token| !token.is_empty())
            .collect()
    }

    /// Accumulates one feature: slot from the hash modulo the band, sign
    /// and jitter from independent hash bits.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn accumulate(
        embedding: &mut [f32],
        band_start: usize,
        band_len: usize,
        hash: u64,
        weight: f32,
        signed: bool,
    ) {
        let slot = band_start + (hash as usize) % band_len;
        let jitter = ((hash >> 23) & 0x1F) as f32 / 32.0;
        let sign = if signed && (hash >> 47) & 1 == 1 {
            -1.0
        } else {
            1.0
        };
        embedding[slot] += sign * weight * (1.0 + jitter);
    }

    /// Generates the embedding: word and word-pair features in the lower
    /// band, citation features in the reserved upper band, normalized to
    /// unit length.
    fn generate_embedding(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimensions];
        if self.dimensions == 0 {
            return embedding;
        }
        let citation_band = (self.dimensions / CITATION_BAND_DIVISOR).max(1);
        let word_band = self.dimensions.saturating_sub(citation_band).max(1);

        let tokens = Self::tokenize(text);
        for token in &tokens {
            if Self::is_citation_token(token) {
                Self::accumulate(
                    &mut embedding,
                    word_band.min(self.dimensions - citation_band),
                    citation_band,
                    Self::fnv1a(CITATION_SEED, token),
                    CITATION_WEIGHT,
                    false,
                );
            } else {
                Self::accumulate(
                    &mut embedding,
                    0,
                    word_band,
                    Self::fnv1a(WORD_SEED, token),
                    WORD_WEIGHT,
                    true,
                );
            }
        }
        for pair in tokens.windows(2) {
            let joined = format!("{} {}", pair[0], pair[1]);
            Self::accumulate(
                &mut embedding,
                0,
                word_band,
                Self::fnv1a(PAIR_SEED, &joined),
                PAIR_WEIGHT,
                true,
            );
        }

        let magnitude: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut embedding {
                *value /= magnitude;
            }
        }
        embedding
    }
}

#[async_trait]
impl Embedder for FallbackEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.generate_embedding(text))
    }
}
