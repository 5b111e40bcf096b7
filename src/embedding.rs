//! Embedding provider abstraction and the HTTP client implementation.
//!
//! Defines the [`EmbeddingProvider`] trait and one concrete backend,
//! [`HttpEmbeddingClient`], which speaks the OpenAI-compatible
//! `POST /v1/embeddings` shape used by both OpenAI itself and the internal
//! embedding gateway. The two differ only in base URL, default model, and
//! the provider label the tuning layer keys off.
//!
//! # Provider Selection
//!
//! Use [`create_provider`] to instantiate a backend from connection
//! parameters. Provider names are matched case-insensitively.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::config::ConnectionParams;

/// One embedding with its dimensionality.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector {
    pub vector: Vec<f32>,
    pub dimension: usize,
}

/// Trait for embedding backends.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider label used for tuning lookup (e.g. `"openai"`, `"gateway"`).
    fn provider_name(&self) -> &str;

    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model(&self) -> &str;

    /// Vector dimensionality, once known. `0` until the first successful
    /// request reveals it.
    fn dimension(&self) -> usize;

    /// Token budget the backend accepts per input text.
    fn max_tokens(&self) -> usize {
        8192
    }

    /// Normalize a text before sending it: blank inputs become a single
    /// space (the APIs reject empty strings), and overlong inputs are
    /// truncated to roughly `max_tokens` worth of characters.
    fn preprocess(&self, text: &str) -> String {
        if text.trim().is_empty() {
            return " ".to_string();
        }
        let limit = self.max_tokens() * 4;
        if text.len() > limit {
            let mut end = limit;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text[..end].to_string()
        } else {
            text.to_string()
        }
    }

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<EmbeddingVector>;

    /// Embed one chunk of texts in a single request, preserving input order.
    async fn embed_chunk(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>>;
}

// ============ HTTP Client ============

/// Embedding backend for OpenAI-compatible `POST /v1/embeddings` endpoints.
pub struct HttpEmbeddingClient {
    provider: String,
    model: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    /// Learned from the first successful response.
    dimension: AtomicUsize,
    max_retries: u32,
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_RETRIES: u32 = 3;

impl HttpEmbeddingClient {
    /// Client for the OpenAI API proper.
    pub fn openai(model: Option<String>, api_key: String, base_url: Option<String>) -> Result<Self> {
        Self::build(
            "openai",
            model.unwrap_or_else(|| "text-embedding-3-small".to_string()),
            api_key,
            base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        )
    }

    /// Client for the OpenAI-compatible embedding gateway.
    pub fn gateway(model: Option<String>, api_key: String, base_url: String) -> Result<Self> {
        Self::build(
            "gateway",
            model.unwrap_or_else(|| "text-embedding-3-small".to_string()),
            api_key,
            base_url,
        )
    }

    fn build(provider: &str, model: String, api_key: String, base_url: String) -> Result<Self> {
        if api_key.is_empty() {
            bail!("{} provider requires an API key", provider);
        }
        let client = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            provider: provider.to_string(),
            model,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            dimension: AtomicUsize::new(0),
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    async fn request(&self, inputs: &[String]) -> Result<Vec<EmbeddingVector>> {
        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                warn!(
                    provider = %self.provider,
                    attempt,
                    delay_secs = delay.as_secs(),
                    "retrying embedding request"
                );
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let payload: EmbeddingsResponse = response.json().await?;
                        let vectors = parse_embeddings_response(payload, inputs.len())?;
                        if let Some(first) = vectors.first() {
                            self.dimension.store(first.dimension, Ordering::Relaxed);
                        }
                        return Ok(vectors);
                    }

                    // Rate limited or server error: retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "Embedding API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    // Client error (not 429): don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Embedding API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingClient {
    fn provider_name(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension.load(Ordering::Relaxed)
    }

    async fn embed(&self, text: &str) -> Result<EmbeddingVector> {
        let input = vec![self.preprocess(text)];
        let mut vectors = self.request(&input).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
    }

    async fn embed_chunk(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts).await
    }
}

// ============ Response Parsing ============

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    /// Position in the input batch; responses are re-sorted by it.
    #[serde(default)]
    index: usize,
    /// Absent when the backend silently dropped an input.
    embedding: Option<Vec<f32>>,
}

/// Validate and order the response: one vector per input, none missing.
fn parse_embeddings_response(
    payload: EmbeddingsResponse,
    expected: usize,
) -> Result<Vec<EmbeddingVector>> {
    if payload.data.len() != expected {
        bail!(
            "Embedding response has {} vectors for {} inputs",
            payload.data.len(),
            expected
        );
    }

    let mut items = payload.data;
    items.sort_by_key(|item| item.index);

    let mut vectors = Vec::with_capacity(items.len());
    for item in items {
        let vector = match item.embedding {
            Some(v) if !v.is_empty() => v,
            _ => bail!("Embedding response is missing a vector at index {}", item.index),
        };
        let dimension = vector.len();
        vectors.push(EmbeddingVector { vector, dimension });
    }
    Ok(vectors)
}

/// Create the appropriate [`EmbeddingProvider`] from connection parameters.
///
/// Matched case-insensitively:
///
/// | Name | Backend |
/// |------|---------|
/// | `"openai"` | [`HttpEmbeddingClient::openai`] |
/// | `"gateway"` | [`HttpEmbeddingClient::gateway`] |
///
/// The gateway requires an explicit base URL.
pub fn create_provider(params: &ConnectionParams) -> Result<Box<dyn EmbeddingProvider>> {
    let api_key = params
        .embedding_api_key
        .clone()
        .ok_or_else(|| anyhow::anyhow!("No embedding API key configured"))?;

    match params.embedding_provider.to_ascii_lowercase().as_str() {
        "openai" => Ok(Box::new(HttpEmbeddingClient::openai(
            params.embedding_model.clone(),
            api_key,
            params.embedding_base_url.clone(),
        )?)),
        "gateway" => {
            let base_url = params.embedding_base_url.clone().ok_or_else(|| {
                anyhow::anyhow!("gateway embedding provider requires a base URL")
            })?;
            Ok(Box::new(HttpEmbeddingClient::gateway(
                params.embedding_model.clone(),
                api_key,
                base_url,
            )?))
        }
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpEmbeddingClient {
        HttpEmbeddingClient::openai(None, "sk-test".to_string(), None).unwrap()
    }

    #[test]
    fn test_preprocess_blank_becomes_space() {
        let c = client();
        assert_eq!(c.preprocess(""), " ");
        assert_eq!(c.preprocess("   \n\t"), " ");
    }

    #[test]
    fn test_preprocess_truncates_long_input() {
        let c = client();
        let long = "x".repeat(c.max_tokens() * 4 + 100);
        let out = c.preprocess(&long);
        assert_eq!(out.len(), c.max_tokens() * 4);
    }

    #[test]
    fn test_preprocess_keeps_normal_input() {
        let c = client();
        assert_eq!(c.preprocess("fn main() {}"), "fn main() {}");
    }

    #[test]
    fn test_preprocess_respects_char_boundaries() {
        let c = client();
        let limit = c.max_tokens() * 4;
        // Multibyte character straddling the truncation point must not panic.
        let mut s = "a".repeat(limit - 1);
        s.push_str("日本語");
        let out = c.preprocess(&s);
        assert!(out.len() <= limit);
        assert!(out.is_char_boundary(out.len()));
    }

    #[test]
    fn test_parse_response_orders_by_index() {
        let payload = EmbeddingsResponse {
            data: vec![
                EmbeddingItem {
                    index: 1,
                    embedding: Some(vec![2.0]),
                },
                EmbeddingItem {
                    index: 0,
                    embedding: Some(vec![1.0]),
                },
            ],
        };
        let vectors = parse_embeddings_response(payload, 2).unwrap();
        assert_eq!(vectors[0].vector, vec![1.0]);
        assert_eq!(vectors[1].vector, vec![2.0]);
        assert_eq!(vectors[0].dimension, 1);
    }

    #[test]
    fn test_parse_response_rejects_missing_vector() {
        let payload = EmbeddingsResponse {
            data: vec![
                EmbeddingItem {
                    index: 0,
                    embedding: Some(vec![1.0]),
                },
                EmbeddingItem {
                    index: 1,
                    embedding: None,
                },
            ],
        };
        let err = parse_embeddings_response(payload, 2).unwrap_err();
        assert!(err.to_string().contains("missing a vector"));
    }

    #[test]
    fn test_parse_response_rejects_count_mismatch() {
        let payload = EmbeddingsResponse {
            data: vec![EmbeddingItem {
                index: 0,
                embedding: Some(vec![1.0]),
            }],
        };
        assert!(parse_embeddings_response(payload, 2).is_err());
    }

    #[test]
    fn test_empty_api_key_rejected() {
        assert!(HttpEmbeddingClient::openai(None, String::new(), None).is_err());
    }
}
