//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **`LocalEmbedder`**: runs models locally via fastembed; tries the
//!   preferred multilingual model first and falls back to a smaller model
//!   when initialization fails. No network calls after model download.
//! - **[`RemoteEmbedder`]**: calls the embedding service's `/embed`
//!   endpoint with retry and backoff.
//! - **[`HashingEmbedder`]**: deterministic bag-of-words vectors for
//!   offline development and tests. Not a semantic model.
//!
//! Every vector is tagged downstream with [`Embedder::model_name`] so that
//! vectors from different models are never compared against each other.
//!
//! # Retry Strategy
//!
//! The remote embedder uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
#[cfg(feature = "local-embeddings")]
use tracing::warn;

use crate::config::EmbeddingConfig;
use crate::error::{PipelineError, Result};

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier of the model that actually produces the vectors. When a
    /// fallback model was loaded, this names the fallback, not the
    /// preferred model.
    fn model_name(&self) -> &str;

    /// Vector dimensionality. Every vector this embedder returns has
    /// exactly this length.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single query text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| PipelineError::EncodingError("empty embedding response".to_string()))
    }
}

/// Instantiate the embedder named by the configuration.
pub async fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalEmbedder::load(config).await?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => Err(PipelineError::ModelUnavailable(
            "local embedding provider requires --features local-embeddings".to_string(),
        )),
        "remote" => Ok(Arc::new(RemoteEmbedder::new(config)?)),
        "hashing" => Ok(Arc::new(HashingEmbedder::new(config.dims))),
        other => Err(PipelineError::ModelUnavailable(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Local Provider (fastembed) ============

#[cfg(feature = "local-embeddings")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
}

#[cfg(feature = "local-embeddings")]
impl LocalEmbedder {
    /// Load the preferred model, falling back to the configured fallback
    /// when the preferred one cannot be initialized. The name of whichever
    /// model loaded becomes this embedder's identity.
    pub async fn load(config: &EmbeddingConfig) -> Result<Self> {
        let preferred = config.model.clone();
        let fallback = config.fallback_model.clone();
        let batch_size = config.batch_size;

        let (model_name, model) = tokio::task::spawn_blocking(move || {
            match Self::init_model(&preferred) {
                Ok(model) => Ok((preferred, model)),
                Err(e) => {
                    warn!(
                        model = %preferred,
                        fallback = %fallback,
                        error = %e,
                        "preferred embedding model unavailable, trying fallback"
                    );
                    let model = Self::init_model(&fallback)?;
                    Ok::<_, PipelineError>((fallback, model))
                }
            }
        })
        .await
        .map_err(|e| PipelineError::ModelUnavailable(e.to_string()))??;

        let dims = model_dims(&model_name);
        Ok(Self {
            model_name,
            dims,
            batch_size,
            model: Arc::new(std::sync::Mutex::new(model)),
        })
    }

    fn init_model(name: &str) -> Result<fastembed::TextEmbedding> {
        let model = fastembed_model_for(name)?;
        fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(model).with_show_download_progress(false),
        )
        .map_err(|e| {
            PipelineError::ModelUnavailable(format!(
                "failed to initialize embedding model {}: {}",
                name, e
            ))
        })
    }
}

#[cfg(feature = "local-embeddings")]
fn fastembed_model_for(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        other => Err(PipelineError::ModelUnavailable(format!(
            "unknown local embedding model: '{}'. Supported models: \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large, \
             all-minilm-l6-v2, bge-small-en-v1.5",
            other
        ))),
    }
}

/// Dimensionality of the known local models.
pub fn model_dims(name: &str) -> usize {
    match name {
        "multilingual-e5-base" => 768,
        "multilingual-e5-large" => 1024,
        _ => 384,
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = Arc::clone(&self.model);
        let batch_size = self.batch_size;
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| PipelineError::EncodingError("embedding model poisoned".to_string()))?;
            guard
                .embed(texts, Some(batch_size))
                .map_err(|e| PipelineError::EncodingError(format!("local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| PipelineError::EncodingError(e.to_string()))?
    }
}

// ============ Remote Provider (embedding service) ============

/// Client for the embedding HTTP service (`POST {url}/embed`).
pub struct RemoteEmbedder {
    url: String,
    model_name: String,
    dims: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl RemoteEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let url = config.url.clone().ok_or_else(|| {
            PipelineError::ModelUnavailable("embedding.url required for remote provider".to_string())
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::ModelUnavailable(e.to_string()))?;

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            model_name: config.model.clone(),
            dims: config.dims,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({ "texts": texts });
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/embed", self.url))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| PipelineError::EncodingError(e.to_string()))?;
                        return parse_embed_response(&json, self.dims);
                    }

                    // Rate limited or server error, retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(PipelineError::ModelUnavailable(format!(
                            "embedding service error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    // Client error (not 429), don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(PipelineError::EncodingError(format!(
                        "embedding service error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(PipelineError::ModelUnavailable(format!(
                        "embedding service unreachable at {}: {}",
                        self.url, e
                    )));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            PipelineError::ModelUnavailable("embedding failed after retries".to_string())
        }))
    }
}

fn parse_embed_response(json: &serde_json::Value, dims: usize) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            PipelineError::EncodingError("invalid response: missing embeddings array".to_string())
        })?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| {
                PipelineError::EncodingError("invalid response: embedding is not an array".to_string())
            })?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        if vec.len() != dims {
            return Err(PipelineError::EncodingError(format!(
                "embedding has {} dims, expected {}",
                vec.len(),
                dims
            )));
        }
        result.push(vec);
    }
    Ok(result)
}

// ============ Hashing Provider (offline dev/test) ============

/// Deterministic bag-of-words embedder. Each token hashes to a fixed
/// dimension and the resulting count vector is L2-normalized, so texts
/// sharing words score high under cosine similarity. Useful for tests and
/// offline development where no model is available.
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut counts: HashMap<usize, f32> = HashMap::new();
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.as_bytes());
            let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
            *counts.entry(n as usize % self.dims).or_insert(0.0) += 1.0;
        }

        let mut vec = vec![0.0f32; self.dims];
        for (i, c) in counts {
            vec[i] = c;
        }
        let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        "hashing-v1"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vectorstore::cosine_similarity;

    #[tokio::test]
    async fn hashing_embedder_is_deterministic() {
        let embedder = HashingEmbedder::new(384);
        let a = embedder.embed("tải game PokeMMO").await.unwrap();
        let b = embedder.embed("tải game PokeMMO").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);
    }

    #[tokio::test]
    async fn hashing_embedder_vectors_are_normalized() {
        let embedder = HashingEmbedder::new(64);
        let v = embedder.embed("hướng dẫn cài đặt").await.unwrap();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn shared_words_score_higher() {
        let embedder = HashingEmbedder::new(384);
        let query = embedder
            .embed("Làm thế nào để tải game PokeMMO?")
            .await
            .unwrap();
        let relevant = embedder
            .embed("Hướng dẫn tải game PokeMMO cho iOS")
            .await
            .unwrap();
        let unrelated = embedder.embed("Thời tiết hôm nay rất đẹp").await.unwrap();

        let sim_relevant = cosine_similarity(&query, &relevant);
        let sim_unrelated = cosine_similarity(&query, &unrelated);
        assert!(sim_relevant > sim_unrelated);
        assert!(sim_relevant > 0.4);
    }

    #[tokio::test]
    async fn empty_batch_returns_empty() {
        let embedder = HashingEmbedder::new(16);
        let out = embedder.embed_batch(&[]).await.unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn parse_embed_response_checks_dims() {
        let json = serde_json::json!({ "embeddings": [[0.1, 0.2, 0.3]] });
        assert!(parse_embed_response(&json, 3).is_ok());
        assert!(parse_embed_response(&json, 4).is_err());
    }

    #[test]
    fn known_model_dims() {
        assert_eq!(model_dims("multilingual-e5-small"), 384);
        assert_eq!(model_dims("multilingual-e5-base"), 768);
        assert_eq!(model_dims("all-minilm-l6-v2"), 384);
    }
}
