//! Vector store abstraction over Qdrant with an in-memory fallback.
//!
//! Upserts are idempotent on point ID and every point carries the name of
//! the model that produced its vector. Searches filter on that model name
//! so vectors from different models never mix in one result set.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::VectorConfig;
use crate::error::{PipelineError, Result};

/// Payload stored alongside each vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PointPayload {
    pub chunk_id: String,
    pub document_id: String,
    pub file_name: String,
    pub content: String,
    pub model: String,
    #[serde(default)]
    pub metadata_json: String,
}

/// A vector plus payload, keyed by the chunk's UUID.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

/// A search result: payload plus similarity score.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub payload: PointPayload,
    pub score: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the collection if missing. Safe to call on every startup.
    async fn ensure_collection(&self, dims: usize) -> Result<()>;

    /// Insert or replace points by ID. Re-upserting the same ID overwrites
    /// the previous vector and payload.
    async fn upsert(&self, points: &[VectorPoint]) -> Result<()>;

    /// Top-K cosine search among points produced by `model`, keeping only
    /// hits at or above `score_threshold`. Results come back ordered by
    /// descending score.
    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        score_threshold: f32,
        model: &str,
    ) -> Result<Vec<ScoredPoint>>;

    /// Remove every point belonging to a document.
    async fn delete_by_document(&self, document_id: &str) -> Result<()>;

    /// Number of points in the collection.
    async fn count(&self) -> Result<u64>;
}

/// Instantiate the vector store named by the configuration.
pub fn create_vector_store(config: &VectorConfig) -> Result<Box<dyn VectorStore>> {
    match config.backend.as_str() {
        "qdrant" => Ok(Box::new(QdrantStore::new(config)?)),
        "memory" => Ok(Box::new(MemoryStore::new())),
        other => Err(PipelineError::StoreUnavailable(format!(
            "unknown vector backend: {}",
            other
        ))),
    }
}

// ============ Qdrant (REST) ============

pub struct QdrantStore {
    url: String,
    collection: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl QdrantStore {
    pub fn new(config: &VectorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::StoreUnavailable(e.to_string()))?;

        Ok(Self {
            url: config.url.trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
            max_retries: config.max_retries,
            client,
        })
    }

    /// Send a request with retry/backoff and return the response JSON.
    /// Retries on 429, 5xx, and network errors, same backoff schedule as
    /// the embedding clients.
    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.url, path);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut req = self.client.request(method.clone(), &url);
            if let Some(b) = body {
                req = req.json(b);
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response
                            .json()
                            .await
                            .map_err(|e| PipelineError::StoreUnavailable(e.to_string()));
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(PipelineError::StoreUnavailable(format!(
                            "qdrant error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(PipelineError::StoreUnavailable(format!(
                        "qdrant error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(PipelineError::StoreUnavailable(format!(
                        "qdrant unreachable at {}: {}",
                        self.url, e
                    )));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            PipelineError::StoreUnavailable("qdrant request failed after retries".to_string())
        }))
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(&self, dims: usize) -> Result<()> {
        let exists = self
            .request(
                reqwest::Method::GET,
                &format!("/collections/{}/exists", self.collection),
                None,
            )
            .await?;
        if exists
            .pointer("/result/exists")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            return Ok(());
        }

        let body = serde_json::json!({
            "vectors": { "size": dims, "distance": "Cosine" }
        });
        self.request(
            reqwest::Method::PUT,
            &format!("/collections/{}", self.collection),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn upsert(&self, points: &[VectorPoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let body = serde_json::json!({
            "points": points
                .iter()
                .map(|p| serde_json::json!({
                    "id": p.id,
                    "vector": p.vector,
                    "payload": p.payload,
                }))
                .collect::<Vec<_>>()
        });
        self.request(
            reqwest::Method::PUT,
            &format!("/collections/{}/points?wait=true", self.collection),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        score_threshold: f32,
        model: &str,
    ) -> Result<Vec<ScoredPoint>> {
        let body = serde_json::json!({
            "vector": vector,
            "limit": top_k,
            "score_threshold": score_threshold,
            "with_payload": true,
            "filter": {
                "must": [{ "key": "model", "match": { "value": model } }]
            }
        });
        let json = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{}/points/search", self.collection),
                Some(&body),
            )
            .await?;

        let results = json
            .get("result")
            .and_then(|r| r.as_array())
            .ok_or_else(|| {
                PipelineError::StoreUnavailable("invalid qdrant search response".to_string())
            })?;

        let mut hits = Vec::with_capacity(results.len());
        for item in results {
            let score = item.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0) as f32;
            let payload: PointPayload = serde_json::from_value(
                item.get("payload").cloned().unwrap_or_default(),
            )
            .map_err(|e| {
                PipelineError::StoreUnavailable(format!("invalid qdrant payload: {}", e))
            })?;
            hits.push(ScoredPoint { payload, score });
        }
        Ok(hits)
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<()> {
        let body = serde_json::json!({
            "filter": {
                "must": [{ "key": "document_id", "match": { "value": document_id } }]
            }
        });
        self.request(
            reqwest::Method::POST,
            &format!("/collections/{}/points/delete?wait=true", self.collection),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        let json = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{}/points/count", self.collection),
                Some(&serde_json::json!({ "exact": true })),
            )
            .await?;
        Ok(json
            .pointer("/result/count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0))
    }
}

// ============ In-memory store ============

/// Exact-scan store for tests and offline development. Not persistent.
pub struct MemoryStore {
    points: RwLock<Vec<VectorPoint>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            points: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn ensure_collection(&self, _dims: usize) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, points: &[VectorPoint]) -> Result<()> {
        let mut guard = self.points.write().await;
        for point in points {
            match guard.iter_mut().find(|p| p.id == point.id) {
                Some(existing) => *existing = point.clone(),
                None => guard.push(point.clone()),
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        score_threshold: f32,
        model: &str,
    ) -> Result<Vec<ScoredPoint>> {
        let guard = self.points.read().await;
        let mut hits: Vec<ScoredPoint> = guard
            .iter()
            .filter(|p| p.payload.model == model)
            .map(|p| ScoredPoint {
                payload: p.payload.clone(),
                score: cosine_similarity(vector, &p.vector),
            })
            .filter(|h| h.score >= score_threshold)
            .collect();
        // Stable sort keeps insertion order for equal scores.
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<()> {
        let mut guard = self.points.write().await;
        guard.retain(|p| p.payload.document_id != document_id);
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.points.read().await.len() as u64)
    }
}

/// Cosine similarity between two vectors. Returns `0.0` for empty or
/// mismatched-length inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
