//! Chat HTTP API.
//!
//! # Endpoints
//!
//! | Method   | Path | Description |
//! |----------|------|-------------|
//! | `POST`   | `/chat` | Answer a question against the knowledge base |
//! | `POST`   | `/search` | Raw semantic search, no generation |
//! | `DELETE` | `/chat/history/{session_id}` | Clear a session's history |
//! | `GET`    | `/health` | Health check (returns version) |
//! | `GET`    | `/stats` | Knowledge base and session counters |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `unavailable` (503),
//! `internal` (500). 5xx responses carry a generic message; internal error
//! text stays in the logs.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the community web
//! client can call the API directly from the browser.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::answer::{self, Generator};
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::PipelineError;
use crate::models::{LinkRef, SourceRef};
use crate::search;
use crate::session;
use crate::stats;
use crate::vectorstore::VectorStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
    vstore: Arc<dyn VectorStore>,
    generator: Arc<dyn Generator>,
    /// One lock per session so concurrent turns in the same session commit
    /// their exchanges in arrival order. Sessions are short-lived enough
    /// that the map is never pruned.
    session_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        pool: SqlitePool,
        embedder: Arc<dyn Embedder>,
        vstore: Arc<dyn VectorStore>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            config,
            pool,
            embedder,
            vstore,
            generator,
            session_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Build the router. Extracted from [`run_chat_server`] so tests can drive
/// handlers without binding a socket.
pub fn chat_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/chat", post(handle_chat))
        .route("/search", post(handle_search))
        .route("/chat/history/{session_id}", delete(handle_clear_history))
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .layer(cors)
        .with_state(state)
}

/// Start the chat API on the configured bind address. Runs until the
/// process is terminated.
pub async fn run_chat_server(state: AppState) -> anyhow::Result<()> {
    let bind_addr = state.config.chat_server.bind.clone();
    let app = chat_router(state);

    info!(bind = %bind_addr, "chat API listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match &err {
            PipelineError::InvalidInput(msg) => AppError {
                status: StatusCode::BAD_REQUEST,
                code: "bad_request".to_string(),
                message: msg.clone(),
            },
            PipelineError::NotFound(msg) => AppError {
                status: StatusCode::NOT_FOUND,
                code: "not_found".to_string(),
                message: msg.clone(),
            },
            PipelineError::ModelUnavailable(_) | PipelineError::StoreUnavailable(_) => {
                error!(error = %err, "backend unavailable");
                AppError {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    code: "unavailable".to_string(),
                    message: "Hệ thống đang gặp sự cố. Vui lòng thử lại sau.".to_string(),
                }
            }
            _ => {
                error!(error = %err, "internal error");
                AppError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "internal".to_string(),
                    message: "Đã có lỗi xảy ra. Vui lòng thử lại sau.".to_string(),
                }
            }
        }
    }
}

// ============ POST /chat ============

#[derive(Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub session_id: String,
    pub sources: Vec<SourceRef>,
    pub images: Vec<String>,
    pub links: Vec<LinkRef>,
    pub timestamp: String,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    if request.message.trim().is_empty() {
        return Err(PipelineError::InvalidInput("message must not be empty".to_string()).into());
    }
    let session_id = request
        .session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let lock = state.session_lock(&session_id).await;
    let _guard = lock.lock().await;

    let hits = search::retrieve(
        state.embedder.as_ref(),
        state.vstore.as_ref(),
        &request.message,
        state.config.retrieval.top_k,
        state.config.retrieval.score_threshold,
    )
    .await?;

    let reply = answer::compose(
        &state.pool,
        state.generator.as_ref(),
        &state.config.generation,
        &session_id,
        &request.message,
        &hits,
    )
    .await?;

    Ok(Json(ChatResponse {
        response: reply.response,
        session_id,
        sources: reply.sources,
        images: reply.images,
        links: reply.links,
        timestamp: chrono::Utc::now().to_rfc3339(),
    }))
}

// ============ POST /search ============

#[derive(Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub query: String,
    pub total_found: usize,
}

#[derive(Serialize)]
pub struct SearchResult {
    pub content: String,
    pub file_name: String,
    pub score: f32,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    let limit = request.limit.unwrap_or(state.config.retrieval.top_k);
    let hits = search::retrieve(
        state.embedder.as_ref(),
        state.vstore.as_ref(),
        &request.query,
        limit,
        state.config.retrieval.score_threshold,
    )
    .await?;

    let total_found = hits.len();
    Ok(Json(SearchResponse {
        results: hits
            .into_iter()
            .map(|h| SearchResult {
                content: h.content,
                file_name: h.file_name,
                score: h.score,
            })
            .collect(),
        query: request.query,
        total_found,
    }))
}

// ============ DELETE /chat/history/{session_id} ============

#[derive(Serialize)]
pub struct ClearResponse {
    pub session_id: String,
    pub deleted: u64,
}

async fn handle_clear_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ClearResponse>, AppError> {
    let lock = state.session_lock(&session_id).await;
    let _guard = lock.lock().await;

    let deleted = session::clear(&state.pool, &session_id).await?;
    Ok(Json(ClearResponse {
        session_id,
        deleted,
    }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /stats ============

async fn handle_stats(
    State(state): State<AppState>,
) -> Result<Json<stats::StatsResponse>, AppError> {
    let stats = stats::collect(
        &state.pool,
        state.vstore.as_ref(),
        state.embedder.model_name(),
    )
    .await?;
    Ok(Json(stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::migrate;
    use crate::models::ChunkMetadata;
    use crate::vectorstore::MemoryStore;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct EchoGenerator;

    #[async_trait]
    impl Generator for EchoGenerator {
        fn model_name(&self) -> &str {
            "echo"
        }
        async fn generate(&self, _prompt: &str) -> crate::error::Result<String> {
            Ok("Câu trả lời [1].".to_string())
        }
    }

    async fn test_state() -> AppState {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let config: Config = toml::from_str(
            "[db]\npath = \":memory:\"\n[embedding]\nprovider = \"hashing\"\ndims = 64\n",
        )
        .unwrap();
        AppState::new(
            Arc::new(config),
            pool,
            Arc::new(HashingEmbedder::new(64)),
            Arc::new(MemoryStore::new()),
            Arc::new(EchoGenerator),
        )
    }

    async fn seed_chunk(state: &AppState, content: &str) {
        let vector = state.embedder.embed(content).await.unwrap();
        state
            .vstore
            .upsert(&[crate::vectorstore::VectorPoint {
                id: Uuid::new_v4().to_string(),
                vector,
                payload: crate::vectorstore::PointPayload {
                    chunk_id: Uuid::new_v4().to_string(),
                    document_id: "d1".to_string(),
                    file_name: "guide.docx".to_string(),
                    content: content.to_string(),
                    model: state.embedder.model_name().to_string(),
                    metadata_json: serde_json::to_string(&ChunkMetadata::default()).unwrap(),
                },
            }])
            .await
            .unwrap();
    }

    async fn send(
        app: Router,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(path);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let state = test_state().await;
        let (status, json) = send(chat_router(state), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn chat_rejects_empty_message() {
        let state = test_state().await;
        let (status, json) = send(
            chat_router(state),
            "POST",
            "/chat",
            Some(serde_json::json!({ "message": "  " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn chat_generates_session_id_when_missing() {
        let state = test_state().await;
        seed_chunk(&state, "Hướng dẫn tải game PokeMMO cho iOS").await;
        let (status, json) = send(
            chat_router(state),
            "POST",
            "/chat",
            Some(serde_json::json!({ "message": "Làm thế nào để tải game PokeMMO?" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!json["session_id"].as_str().unwrap().is_empty());
        assert!(!json["response"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn chat_returns_sources_for_relevant_query() {
        let state = test_state().await;
        seed_chunk(&state, "Hướng dẫn tải game PokeMMO cho iOS").await;
        let (status, json) = send(
            chat_router(state),
            "POST",
            "/chat",
            Some(serde_json::json!({
                "message": "Làm thế nào để tải game PokeMMO cho iOS?",
                "session_id": "s1",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let sources = json["sources"].as_array().unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0]["file_name"], "guide.docx");
    }

    #[tokio::test]
    async fn chat_with_empty_knowledge_base_still_replies() {
        let state = test_state().await;
        let (status, json) = send(
            chat_router(state),
            "POST",
            "/chat",
            Some(serde_json::json!({ "message": "Câu hỏi bất kỳ?" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["sources"].as_array().unwrap().is_empty());
        assert!(json["response"]
            .as_str()
            .unwrap()
            .contains("Không tìm thấy thông tin"));
    }

    #[tokio::test]
    async fn clear_history_404_for_unknown_session() {
        let state = test_state().await;
        let (status, json) =
            send(chat_router(state), "DELETE", "/chat/history/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn clear_history_deletes_messages() {
        let state = test_state().await;
        seed_chunk(&state, "Hướng dẫn tải game PokeMMO").await;
        let app = chat_router(state.clone());

        let (status, _) = send(
            app.clone(),
            "POST",
            "/chat",
            Some(serde_json::json!({ "message": "tải game PokeMMO?", "session_id": "s9" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, json) = send(app, "DELETE", "/chat/history/s9", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["deleted"], 2);
    }

    #[tokio::test]
    async fn search_returns_scored_results() {
        let state = test_state().await;
        seed_chunk(&state, "Hướng dẫn tải game PokeMMO cho iOS").await;
        let (status, json) = send(
            chat_router(state),
            "POST",
            "/search",
            Some(serde_json::json!({ "query": "tải game PokeMMO", "limit": 3 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total_found"], 1);
        assert!(json["results"][0]["score"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn stats_counts_vectors_and_sessions() {
        let state = test_state().await;
        seed_chunk(&state, "Nội dung kiến thức").await;
        let app = chat_router(state);
        let (status, json) = send(app, "GET", "/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["vector_points"], 1);
        assert_eq!(json["embedding_model"], "hashing-v1");
    }
}
