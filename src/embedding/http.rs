//! HTTP embedding client for OpenAI-compatible `/embeddings` endpoints.
//!
//! Query embeddings must come from the same model that populated the
//! vector collections. Responses are cached per text under
//! `cache/embeddings/<sha256>.json` so repeated queries for the same
//! content never hit the endpoint twice.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::config::AppConfig;
use crate::embedding::Embedder;
use crate::error::{EmbeddingError, Result};

/// Timeout for one embeddings request.
const EMBED_TIMEOUT: Duration = Duration::from_secs(30);

/// Embedding client backed by an OpenAI-compatible endpoint.
pub struct HttpEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    cache_dir: Option<PathBuf>,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    /// Creates an embedder from deployment configuration, with the file
    /// cache rooted under the data root.
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(EMBED_TIMEOUT)
                .build()
                .unwrap_or_default(),
            api_key: config.llm_api_key.clone(),
            model: config.embedding_model.clone(),
            base_url: config.embedding_api_base_url.clone(),
            cache_dir: Some(config.embedding_cache_dir()),
        }
    }

    /// Creates an embedder without a file cache.
    #[must_use]
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(EMBED_TIMEOUT)
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into(),
            cache_dir: None,
        }
    }

    fn api_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/embeddings") {
            base.to_string()
        } else {
            format!("{base}/embeddings")
        }
    }

    fn cache_path(&self, text: &str) -> Option<PathBuf> {
        let dir = self.cache_dir.as_ref()?;
        let digest = Sha256::digest(text.as_bytes());
        Some(dir.join(format!("{digest:x}.json")))
    }

    fn cache_read(&self, text: &str) -> Option<Vec<f32>> {
        let path = self.cache_path(text)?;
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn cache_write(&self, text: &str, embedding: &[f32]) {
        let Some(path) = self.cache_path(text) else {
            return;
        };
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        if let Ok(raw) = serde_json::to_string(embedding) {
            // A failed cache write only costs a future request.
            let _ = std::fs::write(path, raw);
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self.cache_read(text) {
            return Ok(cached);
        }

        let response = self
            .client
            .post(self.api_url())
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "input": [text],
            }))
            .send()
            .await
            .map_err(|e| EmbeddingError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Http(format!("{status}: {body}")).into());
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Http(e.to_string()))?;
        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|datum| datum.embedding)
            .ok_or(EmbeddingError::EmptyResponse)?;
        if embedding.is_empty() {
            return Err(EmbeddingError::EmptyResponse.into());
        }

        self.cache_write(text, &embedding);
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url_appends_path() {
        let embedder = HttpEmbedder::new("k", "m", "https://api.example.com/v1");
        assert_eq!(embedder.api_url(), "https://api.example.com/v1/embeddings");
    }

    #[test]
    fn test_api_url_idempotent() {
        let embedder = HttpEmbedder::new("k", "m", "https://api.example.com/v1/embeddings/");
        assert_eq!(embedder.api_url(), "https://api.example.com/v1/embeddings");
    }

    #[test]
    fn test_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut embedder = HttpEmbedder::new("k", "m", "http://localhost");
        embedder.cache_dir = Some(dir.path().to_path_buf());

        assert!(embedder.cache_read("some text").is_none());
        embedder.cache_write("some text", &[0.25, -1.0]);
        assert_eq!(embedder.cache_read("some text"), Some(vec![0.25, -1.0]));
        // Distinct text maps to a distinct cache entry.
        assert!(embedder.cache_read("other text").is_none());
    }

    #[test]
    fn test_cache_key_is_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let mut embedder = HttpEmbedder::new("k", "m", "http://localhost");
        embedder.cache_dir = Some(dir.path().to_path_buf());

        let path = embedder.cache_path("hello").unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        // sha256 hex + .json
        assert_eq!(name.len(), 64 + 5);
        assert!(name.ends_with(".json"));
    }
}
