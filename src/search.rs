//! Semantic retrieval: embed the query, search the vector store, map hits
//! back to domain chunks.

use tracing::debug;

use crate::embedding::Embedder;
use crate::error::{PipelineError, Result};
use crate::models::{ChunkMetadata, SearchHit};
use crate::vectorstore::VectorStore;

/// Retrieve the chunks most similar to `query`.
///
/// An empty result is a valid outcome, it means nothing in the knowledge
/// base cleared the score threshold. Infrastructure failures (embedding
/// model down, vector store unreachable) propagate as errors instead of
/// being flattened into an empty result.
pub async fn retrieve(
    embedder: &dyn Embedder,
    store: &dyn VectorStore,
    query: &str,
    top_k: usize,
    score_threshold: f32,
) -> Result<Vec<SearchHit>> {
    if query.trim().is_empty() {
        return Err(PipelineError::InvalidInput(
            "query must not be empty".to_string(),
        ));
    }

    let vector = embedder.embed(query).await?;
    let hits = store
        .search(&vector, top_k, score_threshold, embedder.model_name())
        .await?;

    debug!(
        query_len = query.chars().count(),
        hits = hits.len(),
        model = embedder.model_name(),
        "retrieval complete"
    );

    Ok(hits
        .into_iter()
        .map(|h| {
            let metadata: ChunkMetadata =
                serde_json::from_str(&h.payload.metadata_json).unwrap_or_default();
            SearchHit {
                chunk_id: h.payload.chunk_id,
                document_id: h.payload.document_id,
                file_name: h.payload.file_name,
                content: h.payload.content,
                score: h.score,
                metadata,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::vectorstore::{MemoryStore, PointPayload, VectorPoint};

    async fn seed(store: &MemoryStore, embedder: &HashingEmbedder, id: &str, content: &str) {
        let vector = embedder.embed(content).await.unwrap();
        store
            .upsert(&[VectorPoint {
                id: id.to_string(),
                vector,
                payload: PointPayload {
                    chunk_id: id.to_string(),
                    document_id: "doc1".to_string(),
                    file_name: "huong-dan.docx".to_string(),
                    content: content.to_string(),
                    model: embedder.model_name().to_string(),
                    metadata_json: "{}".to_string(),
                },
            }])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_query_is_invalid() {
        let embedder = HashingEmbedder::new(64);
        let store = MemoryStore::new();
        let err = retrieve(&embedder, &store, "  ", 5, 0.5).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn empty_store_yields_empty_result() {
        let embedder = HashingEmbedder::new(64);
        let store = MemoryStore::new();
        let hits = retrieve(&embedder, &store, "tải game", 5, 0.5)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn relevant_chunk_comes_back_first() {
        let embedder = HashingEmbedder::new(384);
        let store = MemoryStore::new();
        seed(&store, &embedder, "c1", "Hướng dẫn tải game PokeMMO cho iOS").await;
        seed(&store, &embedder, "c2", "Cách bắt Pokemon hiếm trong hang động").await;

        let hits = retrieve(
            &embedder,
            &store,
            "Làm thế nào để tải game PokeMMO?",
            5,
            0.1,
        )
        .await
        .unwrap();

        assert!(!hits.is_empty());
        assert_eq!(hits[0].chunk_id, "c1");
        assert!(hits[0].score >= hits.last().unwrap().score);
    }
}
