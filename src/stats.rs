//! Knowledge base and session counters, shared by `GET /stats` and the
//! `pika stats` command.

use serde::Serialize;
use sqlx::SqlitePool;

use crate::error::Result;
use crate::vectorstore::VectorStore;

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub documents: i64,
    pub documents_completed: i64,
    pub documents_failed: i64,
    pub chunks: i64,
    pub embeddings: i64,
    pub vector_points: u64,
    pub sessions: i64,
    pub messages: i64,
    pub embedding_model: String,
}

pub async fn collect(
    pool: &SqlitePool,
    vstore: &dyn VectorStore,
    embedding_model: &str,
) -> Result<StatsResponse> {
    let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await?;
    let documents_completed: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE status = 'completed'")
            .fetch_one(pool)
            .await?;
    let documents_failed: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE status = 'failed'")
            .fetch_one(pool)
            .await?;
    let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(pool)
        .await?;
    let embeddings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
        .fetch_one(pool)
        .await?;
    let sessions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chat_sessions")
        .fetch_one(pool)
        .await?;
    let messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chat_messages")
        .fetch_one(pool)
        .await?;
    let vector_points = vstore.count().await?;

    Ok(StatsResponse {
        documents,
        documents_completed,
        documents_failed,
        chunks,
        embeddings,
        vector_points,
        sessions,
        messages,
        embedding_model: embedding_model.to_string(),
    })
}

/// Print stats in the CLI format.
pub fn print(stats: &StatsResponse) {
    println!("knowledge base");
    println!(
        "  documents: {} ({} completed, {} failed)",
        stats.documents, stats.documents_completed, stats.documents_failed
    );
    println!("  chunks: {}", stats.chunks);
    println!(
        "  embeddings: {} ({} points in vector store)",
        stats.embeddings, stats.vector_points
    );
    println!("  embedding model: {}", stats.embedding_model);
    println!("sessions");
    println!("  sessions: {}", stats.sessions);
    println!("  messages: {}", stats.messages);
}
