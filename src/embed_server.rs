//! Embedding HTTP service.
//!
//! Runs the embedding model behind a small API so the chat service (and
//! the data pipeline) can stay model-free:
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/embed` | Embed one text or a batch |
//! | `POST` | `/embed/process-chunks` | Embed chunks missing vectors and upsert them |
//! | `GET`  | `/health` | Health check with model identity |
//!
//! `/embed` accepts either `{"text": "...", "chunk_id": "..."}` or
//! `{"texts": ["...", ...]}` and answers in kind, so single-shot callers
//! and the batch client share one endpoint.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::PipelineError;
use crate::ingest;
use crate::models::{Chunk, ChunkMetadata};
use crate::vectorstore::VectorStore;

#[derive(Clone)]
pub struct EmbedState {
    config: Arc<Config>,
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
    vstore: Arc<dyn VectorStore>,
}

impl EmbedState {
    pub fn new(
        config: Arc<Config>,
        pool: SqlitePool,
        embedder: Arc<dyn Embedder>,
        vstore: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            config,
            pool,
            embedder,
            vstore,
        }
    }
}

pub fn embed_router(state: EmbedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/embed", post(handle_embed))
        .route("/embed/process-chunks", post(handle_process_chunks))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Start the embedding API on the configured bind address.
pub async fn run_embed_server(state: EmbedState) -> anyhow::Result<()> {
    let bind_addr = state.config.embed_server.bind.clone();
    let app = embed_router(state);

    info!(bind = %bind_addr, "embedding API listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

struct EmbedError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for EmbedError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": { "code": self.status.as_u16(), "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<PipelineError> for EmbedError {
    fn from(err: PipelineError) -> Self {
        match &err {
            PipelineError::InvalidInput(msg) => EmbedError {
                status: StatusCode::BAD_REQUEST,
                message: msg.clone(),
            },
            PipelineError::ModelUnavailable(_) | PipelineError::StoreUnavailable(_) => {
                error!(error = %err, "embedding backend unavailable");
                EmbedError {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    message: "service unavailable".to_string(),
                }
            }
            _ => {
                error!(error = %err, "embedding failed");
                EmbedError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "internal error".to_string(),
                }
            }
        }
    }
}

// ============ POST /embed ============

#[derive(Deserialize)]
pub struct EmbedRequest {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub texts: Option<Vec<String>>,
    #[serde(default)]
    pub chunk_id: Option<String>,
}

#[derive(Serialize)]
pub struct EmbedResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<Vec<Vec<f32>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    pub model_name: String,
    pub dims: usize,
}

async fn handle_embed(
    State(state): State<EmbedState>,
    Json(request): Json<EmbedRequest>,
) -> Result<Json<EmbedResponse>, EmbedError> {
    let model_name = state.embedder.model_name().to_string();
    let dims = state.embedder.dims();

    match (request.text, request.texts) {
        (Some(text), None) => {
            if text.trim().is_empty() {
                return Err(
                    PipelineError::InvalidInput("text must not be empty".to_string()).into(),
                );
            }
            let embedding = state.embedder.embed(&text).await?;
            Ok(Json(EmbedResponse {
                embedding: Some(embedding),
                embeddings: None,
                chunk_id: request.chunk_id,
                model_name,
                dims,
            }))
        }
        (None, Some(texts)) => {
            if texts.is_empty() {
                return Err(
                    PipelineError::InvalidInput("texts must not be empty".to_string()).into(),
                );
            }
            let embeddings = state.embedder.embed_batch(&texts).await?;
            Ok(Json(EmbedResponse {
                embedding: None,
                embeddings: Some(embeddings),
                chunk_id: None,
                model_name,
                dims,
            }))
        }
        _ => Err(PipelineError::InvalidInput(
            "provide exactly one of 'text' or 'texts'".to_string(),
        )
        .into()),
    }
}

// ============ POST /embed/process-chunks ============

#[derive(Serialize)]
pub struct ProcessChunksResponse {
    pub processed: usize,
    pub pending_before: usize,
    pub model_name: String,
}

/// Embed every chunk that has no vector for the active model and upsert
/// the results. Safe to call repeatedly; a second call finds nothing to do.
async fn handle_process_chunks(
    State(state): State<EmbedState>,
) -> Result<Json<ProcessChunksResponse>, EmbedError> {
    let pending = find_pending_chunks(&state.pool, state.embedder.model_name()).await?;
    let pending_before = pending.len();
    let mut processed = 0usize;

    for (file_name, chunks) in pending {
        processed += ingest::embed_and_upsert(
            &state.pool,
            state.vstore.as_ref(),
            state.embedder.as_ref(),
            &file_name,
            &chunks,
            &state.config,
        )
        .await?;
    }

    info!(processed, "process-chunks complete");
    Ok(Json(ProcessChunksResponse {
        processed,
        pending_before,
        model_name: state.embedder.model_name().to_string(),
    }))
}

/// Chunks with no embedding row for `model`, grouped by document so the
/// vector payload can carry the file name.
async fn find_pending_chunks(
    pool: &SqlitePool,
    model: &str,
) -> Result<Vec<(String, Vec<Chunk>)>, PipelineError> {
    let rows = sqlx::query(
        r#"
        SELECT c.id, c.document_id, c.chunk_index, c.content, c.char_offset,
               c.char_length, c.metadata_json, d.file_name
        FROM chunks c
        JOIN documents d ON d.id = c.document_id
        LEFT JOIN embeddings e ON e.chunk_id = c.id AND e.model = ?
        WHERE e.chunk_id IS NULL
        ORDER BY c.document_id, c.chunk_index
        "#,
    )
    .bind(model)
    .fetch_all(pool)
    .await?;

    let mut groups: Vec<(String, Vec<Chunk>)> = Vec::new();
    for row in rows {
        let metadata_str: String = row.get("metadata_json");
        let metadata: ChunkMetadata = serde_json::from_str(&metadata_str).unwrap_or_default();
        let chunk = Chunk {
            id: row.get("id"),
            document_id: row.get("document_id"),
            chunk_index: row.get("chunk_index"),
            content: row.get("content"),
            char_offset: row.get::<i64, _>("char_offset") as usize,
            char_length: row.get::<i64, _>("char_length") as usize,
            metadata,
        };
        let file_name: String = row.get("file_name");

        match groups.last_mut() {
            Some((name, chunks)) if *name == file_name && chunks[0].document_id == chunk.document_id => {
                chunks.push(chunk)
            }
            _ => groups.push((file_name, vec![chunk])),
        }
    }
    Ok(groups)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    model_name: String,
    dims: usize,
}

async fn handle_health(State(state): State<EmbedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model_name: state.embedder.model_name().to_string(),
        dims: state.embedder.dims(),
    })
}
