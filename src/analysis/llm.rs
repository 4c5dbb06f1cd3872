//! LLM-backed compliance analysis client.
//!
//! Calls an OpenAI-compatible chat-completions endpoint with a JSON-object
//! response-format constraint, validates the response against the analysis
//! schema, and retries with exponential backoff on rate limits and
//! transport errors. HTTP 404 is an unrecoverable model-configuration
//! error and is never retried.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, error, warn};

use crate::analysis::AnalysisClient;
use crate::analysis::prompt::{SYSTEM_PROMPT, build_user_prompt};
use crate::config::AppConfig;
use crate::context::ContextBundle;
use crate::core::{ChunkRecord, NormalizedAnalysis};
use crate::error::AnalysisError;

/// Analysis client that calls an OpenAI-compatible chat endpoint for
/// structured JSON responses.
pub struct ComplianceLlmClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    api_base_url: String,
    max_retries: u32,
    backoff_base: Duration,
    max_wait: Duration,
}

impl ComplianceLlmClient {
    /// Creates a client from deployment configuration.
    #[must_use]
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(config.llm_timeout)
                .build()
                .unwrap_or_default(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model_compliance.clone(),
            api_base_url: config.llm_api_base_url.clone(),
            max_retries: config.llm_max_retries.max(1),
            backoff_base: config.rate_limit_backoff_base,
            max_wait: config.rate_limit_max_wait,
        }
    }

    /// Full chat-completions URL.
    #[must_use]
    pub fn api_url(&self) -> String {
        let base = self.api_base_url.trim_end_matches('/');
        if base.contains("/chat/completions") {
            base.to_string()
        } else {
            format!("{base}/chat/completions")
        }
    }

    /// Exponential backoff for attempt `n` (1-based):
    /// `base * 2^(n-1)`, capped at the configured maximum wait.
    fn backoff_wait(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let wait = self.backoff_base.saturating_mul(1 << exp);
        wait.min(self.max_wait)
    }

    /// Wait derived from a `Retry-After` header, clamped to the maximum.
    fn retry_after_wait(&self, header: Option<&str>) -> Option<Duration> {
        let seconds: u64 = header?.trim().parse().ok()?;
        Some(Duration::from_secs(seconds).min(self.max_wait))
    }

    /// Pulls the first choice's message content out of the response
    /// payload and strips a fenced code block if the model wrapped the
    /// JSON anyway.
    fn extract_content(payload: &Value) -> Result<String, AnalysisError> {
        let content = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .ok_or(AnalysisError::MissingContent)?;

        Ok(strip_code_fences(content))
    }
}

/// Strips leading/trailing fenced code blocks (` ```json ... ``` `).
fn strip_code_fences(content: &str) -> String {
    let trimmed = content.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut lines: Vec<&str> = trimmed.lines().collect();
    if lines.first().is_some_and(|line| line.starts_with("```")) {
        lines.remove(0);
    }
    if lines.last().is_some_and(|line| line.trim() == "```") {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

#[async_trait]
impl AnalysisClient for ComplianceLlmClient {
    async fn analyze(
        &self,
        chunk: &ChunkRecord,
        bundle: &ContextBundle,
    ) -> Result<NormalizedAnalysis, AnalysisError> {
        let payload = json!({
            "model": self.model,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": build_user_prompt(bundle)},
            ],
        });

        let mut last_error = String::new();
        for attempt in 1..=self.max_retries {
            debug!(
                chunk_id = %chunk.chunk_id,
                model = %self.model,
                attempt,
                "calling compliance LLM"
            );
            let response = match self
                .client
                .post(self.api_url())
                .bearer_auth(&self.api_key)
                .json(&payload)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    last_error = e.to_string();
                    warn!(attempt, error = %last_error, "LLM transport error");
                    if attempt < self.max_retries {
                        tokio::time::sleep(self.backoff_wait(attempt)).await;
                        continue;
                    }
                    return Err(AnalysisError::Http(last_error));
                }
            };

            let status = response.status();
            if status.as_u16() == 429 {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|value| value.to_str().ok())
                    .map(ToString::to_string);
                let wait = self
                    .retry_after_wait(retry_after.as_deref())
                    .unwrap_or_else(|| self.backoff_wait(attempt));
                let body = response.text().await.unwrap_or_default();
                last_error = format!("429 Too Many Requests: {body}");
                warn!(
                    attempt,
                    max_retries = self.max_retries,
                    wait_secs = wait.as_secs(),
                    "rate limit hit, backing off"
                );
                if attempt < self.max_retries {
                    tokio::time::sleep(wait).await;
                    continue;
                }
                return Err(AnalysisError::RateLimitExhausted {
                    attempts: self.max_retries,
                    message: last_error,
                });
            }

            if status.as_u16() == 404 {
                let body = response.text().await.unwrap_or_default();
                error!(
                    model = %self.model,
                    "404 from LLM endpoint; the configured model likely does not exist \
                     or the API key lacks access"
                );
                return Err(AnalysisError::ModelNotFound {
                    model: self.model.clone(),
                    message: body,
                });
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                last_error = format!("{status}: {body}");
                warn!(attempt, error = %last_error, "LLM request failed");
                if attempt < self.max_retries {
                    tokio::time::sleep(self.backoff_wait(attempt)).await;
                    continue;
                }
                return Err(AnalysisError::Http(last_error));
            }

            let body: Value = match response.json().await {
                Ok(body) => body,
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < self.max_retries {
                        tokio::time::sleep(self.backoff_wait(attempt)).await;
                        continue;
                    }
                    return Err(AnalysisError::Http(last_error));
                }
            };

            let content = Self::extract_content(&body)?;
            match NormalizedAnalysis::parse(&content) {
                Ok(analysis) => return Ok(analysis),
                Err(e) => {
                    // Log the full content; this is the critical diagnostic
                    // when the model drifts off schema.
                    error!(
                        chunk_id = %chunk.chunk_id,
                        error = %e,
                        content = %content,
                        "analysis validation failed"
                    );
                    last_error = e.to_string();
                    if attempt < self.max_retries {
                        continue;
                    }
                    return Err(AnalysisError::InvalidResponse(last_error));
                }
            }
        }

        Err(AnalysisError::Http(last_error))
    }
}
