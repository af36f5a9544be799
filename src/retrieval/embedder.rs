//! Embedding providers
//!
//! `OpenAiEmbedder` calls an OpenAI-compatible `/embeddings` endpoint.
//! `HashingEmbedder` runs locally: feature-hashed bag of words, so identical
//! vocabulary yields similar vectors without any network access.

use crate::config::EmbeddingConfig;
use crate::error::ChatbotError;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Trait for text embedding
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Stable identifier persisted with the index
    fn model_id(&self) -> String;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ChatbotError::ProviderUnavailable("no embedding returned".into()))
    }
}

/// Pick the remote embedder when a key is configured, else the local one.
pub fn embedder_from_config(config: &EmbeddingConfig, timeout: Duration) -> Result<Arc<dyn Embedder>> {
    match &config.api_key {
        Some(api_key) => {
            info!(model = %config.model, "Using remote embedding provider");
            Ok(Arc::new(OpenAiEmbedder::new(
                api_key.clone(),
                &config.base_url,
                &config.model,
                timeout,
            )?))
        }
        None => {
            info!(dimensions = config.dimensions, "Using local hashing embedder");
            Ok(Arc::new(HashingEmbedder::new(config.dimensions)))
        }
    }
}

/// Compute cosine similarity between two vectors
///
/// Returns 0.0 for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Deterministic local embedder
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
        {
            let hash = fnv1a(token.as_bytes());
            let bucket = (hash % self.dimensions as u64) as usize;
            let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325u64, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_id(&self) -> String {
        format!("hashing-{}", self.dimensions)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vectorize(t)).collect())
    }
}

/// OpenAI-compatible embeddings client (connection-pooled)
pub struct OpenAiEmbedder {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_id(&self) -> String {
        self.model.clone()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| {
                error!("Embedding request failed: {}", e);
                ChatbotError::ProviderUnavailable(format!("embedding request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(if status.as_u16() == 401 || status.as_u16() == 403 {
                ChatbotError::ProviderAuth(format!("{}: {}", status, error_text))
            } else {
                ChatbotError::ProviderUnavailable(format!("{}: {}", status, error_text))
            });
        }

        let mut parsed: EmbeddingResponse = response.json().await.map_err(|e| {
            ChatbotError::ProviderUnavailable(format!("embedding parse error: {}", e))
        })?;

        if parsed.data.len() != texts.len() {
            return Err(ChatbotError::ProviderUnavailable(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn test_hashing_embedder_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed_one("Rust ownership rules").await.unwrap();
        let b = embedder.embed_one("rust OWNERSHIP rules").await.unwrap();

        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_hashing_embedder_ranks_shared_vocabulary_higher() {
        let embedder = HashingEmbedder::new(256);
        let query = embedder.embed_one("how does borrowing work").await.unwrap();
        let related = embedder
            .embed_one("borrowing lets code work with references")
            .await
            .unwrap();
        let unrelated = embedder.embed_one("tomato soup recipe").await.unwrap();

        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[tokio::test]
    async fn test_openai_embedder_orders_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    { "index": 1, "embedding": [0.0, 1.0] },
                    { "index": 0, "embedding": [1.0, 0.0] }
                ]
            })))
            .mount(&server)
            .await;

        let embedder = OpenAiEmbedder::new(
            "key".into(),
            &server.uri(),
            "text-embedding-3-small",
            Duration::from_secs(5),
        )
        .unwrap();

        let vectors = embedder
            .embed(&["first".to_string(), "second".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_openai_embedder_failure_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let embedder =
            OpenAiEmbedder::new("key".into(), &server.uri(), "m", Duration::from_secs(5)).unwrap();
        let err = embedder.embed_one("text").await.unwrap_err();
        assert!(err.is_provider_failure());
    }
}
