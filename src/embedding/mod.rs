//! Query-side embedding generation.
//!
//! The context builder embeds query text with the same model that populated
//! the target collection; the HTTP embedder calls an OpenAI-compatible
//! `/embeddings` endpoint with a per-text SHA-256 file cache. A hash-based
//! fallback provides deterministic pseudo-embeddings when no API key is
//! configured and in tests.

mod fallback;
mod http;

pub use fallback::FallbackEmbedder;
pub use http::HttpEmbedder;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::AppConfig;
use crate::error::Result;

/// Default dimensions of the fallback embedder.
pub const DEFAULT_DIMENSIONS: usize = 384;

/// Trait for embedding generators.
///
/// Implementations must be thread-safe (`Send + Sync`); one embedder is
/// shared by the context builder and the background scheduler.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generates an embedding for the given text.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding generation fails.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generates embeddings for multiple texts.
    ///
    /// The default implementation calls `embed` for each text sequentially.
    /// Implementations may override this for batch endpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding generation fails for any text.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed(text).await?);
        }
        Ok(embeddings)
    }
}

/// Creates the embedder for a deployment: HTTP-backed when an API key is
/// configured, hash-based fallback otherwise.
#[must_use]
pub fn create_embedder(config: &AppConfig) -> Arc<dyn Embedder> {
    if config.llm_api_key.is_empty() {
        tracing::warn!("no API key configured; using hash-based fallback embeddings");
        Arc::new(FallbackEmbedder::new(DEFAULT_DIMENSIONS))
    } else {
        Arc::new(HttpEmbedder::from_config(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_embed_batch_default_impl() {
        let embedder = FallbackEmbedder::new(DEFAULT_DIMENSIONS);
        let texts = vec!["hello", "world"];
        let embeddings = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(embeddings.len(), 2);
        for embedding in &embeddings {
            assert_eq!(embedding.len(), DEFAULT_DIMENSIONS);
        }
    }

    #[test]
    fn test_create_embedder_without_key_uses_fallback() {
        let config = AppConfig::default();
        // Fallback embedder is deterministic; just confirm construction.
        let _embedder = create_embedder(&config);
    }
}
