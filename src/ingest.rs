//! Ingestion pipeline orchestration.
//!
//! Coordinates the full flow: object storage → extraction → chunking →
//! embedding → vector store. One document failing never stops the batch;
//! it is marked `failed` and the sync moves on.

use anyhow::Result as AnyResult;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunk::chunk_text;
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::Result;
use crate::extract;
use crate::models::{Chunk, DocumentStatus};
use crate::objectstore::ObjectStore;
use crate::vectorstore::{PointPayload, VectorPoint, VectorStore};

/// What one document's indexing produced.
#[derive(Debug)]
pub struct IndexOutcome {
    pub document_id: String,
    pub chunks: usize,
    pub embedded: usize,
}

/// An embedded image resolved to its mirrored object URL, positioned in
/// the document text.
#[derive(Debug, Clone)]
pub struct ImagePlacement {
    pub url: String,
    pub char_offset: usize,
}

/// Index one extracted document end to end: upsert the document row,
/// replace its chunks, embed them, and upsert the vectors. Re-indexing the
/// same `file_path` replaces everything the previous run produced.
#[allow(clippy::too_many_arguments)]
pub async fn index_document(
    pool: &SqlitePool,
    vstore: &dyn VectorStore,
    embedder: &dyn Embedder,
    file_name: &str,
    file_path: &str,
    content_type: &str,
    text: &str,
    images: &[ImagePlacement],
    config: &Config,
) -> Result<IndexOutcome> {
    let doc_id = upsert_document(pool, file_name, file_path, content_type, images).await?;
    set_status(pool, &doc_id, DocumentStatus::Processing).await?;

    let mut chunks = chunk_text(
        &doc_id,
        text,
        config.chunking.max_size,
        config.chunking.overlap,
    )?;
    // Each image attaches to the chunks whose span covers its reference,
    // so a cited chunk surfaces exactly the images near it.
    let text_chars = text.chars().count();
    for chunk in &mut chunks {
        let end = chunk.char_offset + chunk.char_length;
        chunk.metadata.images = images
            .iter()
            .filter(|img| {
                let pos = img.char_offset.min(text_chars.saturating_sub(1));
                pos >= chunk.char_offset && pos < end
            })
            .map(|img| img.url.clone())
            .collect();
    }

    replace_chunks(pool, &doc_id, &chunks).await?;

    // Old vectors go first so a re-index with fewer chunks leaves no
    // orphans behind.
    vstore.delete_by_document(&doc_id).await?;
    let embedded = embed_and_upsert(pool, vstore, embedder, file_name, &chunks, config).await?;

    set_status(pool, &doc_id, DocumentStatus::Completed).await?;

    Ok(IndexOutcome {
        document_id: doc_id,
        chunks: chunks.len(),
        embedded,
    })
}

/// Embed chunks in batches and upsert the vectors, recording an audit row
/// per (chunk, model) in the `embeddings` table.
pub async fn embed_and_upsert(
    pool: &SqlitePool,
    vstore: &dyn VectorStore,
    embedder: &dyn Embedder,
    file_name: &str,
    chunks: &[Chunk],
    config: &Config,
) -> Result<usize> {
    let mut embedded = 0usize;
    for batch in chunks.chunks(config.embedding.batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
        let vectors = embedder.embed_batch(&texts).await?;

        let points: Vec<VectorPoint> = batch
            .iter()
            .zip(vectors.iter())
            .map(|(chunk, vector)| VectorPoint {
                id: chunk.id.clone(),
                vector: vector.clone(),
                payload: PointPayload {
                    chunk_id: chunk.id.clone(),
                    document_id: chunk.document_id.clone(),
                    file_name: file_name.to_string(),
                    content: chunk.content.clone(),
                    model: embedder.model_name().to_string(),
                    metadata_json: serde_json::to_string(&chunk.metadata).unwrap_or_default(),
                },
            })
            .collect();
        vstore.upsert(&points).await?;

        for chunk in batch {
            record_embedding(pool, chunk, embedder).await?;
        }
        embedded += batch.len();
    }
    Ok(embedded)
}

async fn record_embedding(pool: &SqlitePool, chunk: &Chunk, embedder: &dyn Embedder) -> Result<()> {
    let mut hasher = Sha256::new();
    hasher.update(chunk.content.as_bytes());
    let content_hash = format!("{:x}", hasher.finalize());

    sqlx::query(
        r#"
        INSERT INTO embeddings (chunk_id, model, dims, content_hash, created_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id, model) DO UPDATE SET
            dims = excluded.dims,
            content_hash = excluded.content_hash,
            created_at = excluded.created_at
        "#,
    )
    .bind(&chunk.id)
    .bind(embedder.model_name())
    .bind(embedder.dims() as i64)
    .bind(&content_hash)
    .bind(Utc::now().timestamp_millis())
    .execute(pool)
    .await?;
    Ok(())
}

async fn upsert_document(
    pool: &SqlitePool,
    file_name: &str,
    file_path: &str,
    content_type: &str,
    images: &[ImagePlacement],
) -> Result<String> {
    let existing_id: Option<String> =
        sqlx::query_scalar("SELECT id FROM documents WHERE file_path = ?")
            .bind(file_path)
            .fetch_optional(pool)
            .await?;
    let doc_id = existing_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    let urls: Vec<&str> = images.iter().map(|img| img.url.as_str()).collect();
    let metadata = serde_json::json!({ "images": urls });

    sqlx::query(
        r#"
        INSERT INTO documents (id, file_name, file_path, content_type, status, metadata_json, created_at, processed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, NULL)
        ON CONFLICT(file_path) DO UPDATE SET
            file_name = excluded.file_name,
            content_type = excluded.content_type,
            status = excluded.status,
            metadata_json = excluded.metadata_json,
            processed_at = NULL
        "#,
    )
    .bind(&doc_id)
    .bind(file_name)
    .bind(file_path)
    .bind(content_type)
    .bind(DocumentStatus::Pending.as_str())
    .bind(metadata.to_string())
    .bind(Utc::now().timestamp_millis())
    .execute(pool)
    .await?;

    Ok(doc_id)
}

pub async fn set_status(pool: &SqlitePool, document_id: &str, status: DocumentStatus) -> Result<()> {
    let processed_at = match status {
        DocumentStatus::Completed | DocumentStatus::Failed => {
            Some(Utc::now().timestamp_millis())
        }
        _ => None,
    };
    sqlx::query("UPDATE documents SET status = ?, processed_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(processed_at)
        .bind(document_id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn replace_chunks(pool: &SqlitePool, document_id: &str, chunks: &[Chunk]) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "DELETE FROM embeddings WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
    )
    .bind(document_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    for chunk in chunks {
        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, chunk_index, content, char_offset, char_length, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.content)
        .bind(chunk.char_offset as i64)
        .bind(chunk.char_length as i64)
        .bind(serde_json::to_string(&chunk.metadata).unwrap_or_default())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Report of one sync pass over the raw bucket.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub scanned: usize,
    pub processed: usize,
    pub failed: usize,
    pub chunks: usize,
    pub images_mirrored: usize,
}

/// Sync the raw document bucket into the knowledge base. Each object is
/// downloaded, extracted, chunked, embedded, and upserted; DOCX images are
/// mirrored to the image bucket.
pub async fn sync_objectstore(
    config: &Config,
    pool: &SqlitePool,
    vstore: &dyn VectorStore,
    embedder: &dyn Embedder,
    limit: Option<usize>,
) -> AnyResult<SyncReport> {
    let os_config = config
        .objectstore
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("[objectstore] section missing from config"))?;
    let store = ObjectStore::from_config(os_config)?;

    let mut objects = store.list(&os_config.raw_bucket, "").await?;
    if let Some(lim) = limit {
        objects.truncate(lim);
    }

    let mut report = SyncReport {
        scanned: objects.len(),
        ..Default::default()
    };

    for obj in &objects {
        let file_name = obj.key.rsplit('/').next().unwrap_or(&obj.key).to_string();
        let file_path = format!("s3://{}/{}", os_config.raw_bucket, obj.key);

        match sync_one(
            config, pool, vstore, embedder, &store, os_config, obj, &file_name, &file_path,
        )
        .await
        {
            Ok((chunk_count, image_count)) => {
                report.processed += 1;
                report.chunks += chunk_count;
                report.images_mirrored += image_count;
            }
            Err(e) => {
                warn!(key = %obj.key, error = %e, "document failed, continuing");
                report.failed += 1;
                if let Some(doc_id) = find_document_id(pool, &file_path).await {
                    let _ = set_status(pool, &doc_id, DocumentStatus::Failed).await;
                }
            }
        }
    }

    info!(
        scanned = report.scanned,
        processed = report.processed,
        failed = report.failed,
        chunks = report.chunks,
        "object store sync complete"
    );
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
async fn sync_one(
    config: &Config,
    pool: &SqlitePool,
    vstore: &dyn VectorStore,
    embedder: &dyn Embedder,
    store: &ObjectStore,
    os_config: &crate::config::ObjectStoreConfig,
    obj: &crate::objectstore::ObjectInfo,
    file_name: &str,
    file_path: &str,
) -> AnyResult<(usize, usize)> {
    let bytes = store.get(&os_config.raw_bucket, &obj.key).await?;
    let content_type = extract::content_type_for(file_name);
    let extracted = extract::extract(&bytes, content_type)?;

    // Mirror embedded images before indexing, then resolve each inline
    // reference to its mirrored URL so cited chunks link to real objects.
    let mut mirrored = 0usize;
    let mut placements = Vec::new();
    if content_type == extract::MIME_DOCX && !extracted.images.is_empty() {
        let stem = file_name.rsplit_once('.').map(|(s, _)| s).unwrap_or(file_name);
        let mut urls = std::collections::HashMap::new();
        for (name, data) in extract::docx_image_files(&bytes)? {
            let image_key = format!("{}/{}", stem, name);
            store
                .put(&os_config.images_bucket, &image_key, data, "application/octet-stream")
                .await?;
            urls.insert(
                name,
                format!(
                    "{}/{}/{}",
                    os_config.endpoint.trim_end_matches('/'),
                    os_config.images_bucket,
                    image_key
                ),
            );
            mirrored += 1;
        }
        for image in &extracted.images {
            if let Some(url) = urls.get(&image.name) {
                placements.push(ImagePlacement {
                    url: url.clone(),
                    char_offset: image.char_offset,
                });
            }
        }
    }

    let outcome = index_document(
        pool,
        vstore,
        embedder,
        file_name,
        file_path,
        content_type,
        &extracted.text,
        &placements,
        config,
    )
    .await?;

    Ok((outcome.chunks, mirrored))
}

async fn find_document_id(pool: &SqlitePool, file_path: &str) -> Option<String> {
    sqlx::query_scalar("SELECT id FROM documents WHERE file_path = ?")
        .bind(file_path)
        .fetch_optional(pool)
        .await
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::migrate;
    use crate::vectorstore::MemoryStore;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        pool
    }

    fn test_config() -> Config {
        // Small windows keep test documents multi-chunk.
        let toml = r#"
            [db]
            path = ":memory:"
            [chunking]
            max_size = 100
            overlap = 20
            [embedding]
            provider = "hashing"
            dims = 64
        "#;
        toml::from_str(toml).unwrap()
    }

    #[tokio::test]
    async fn index_document_writes_rows_and_vectors() {
        let pool = test_pool().await;
        let store = MemoryStore::new();
        let embedder = HashingEmbedder::new(64);
        let config = test_config();

        let text = "Hướng dẫn tải game PokeMMO. ".repeat(20);
        let outcome = index_document(
            &pool,
            &store,
            &embedder,
            "guide.docx",
            "s3://bronze-raw/guide.docx",
            extract::MIME_DOCX,
            &text,
            &[],
            &config,
        )
        .await
        .unwrap();

        assert!(outcome.chunks > 1);
        assert_eq!(outcome.embedded, outcome.chunks);
        assert_eq!(store.count().await.unwrap(), outcome.chunks as u64);

        let status: String = sqlx::query_scalar("SELECT status FROM documents WHERE id = ?")
            .bind(&outcome.document_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(status, "completed");

        let audit_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(audit_rows, outcome.chunks as i64);
    }

    #[tokio::test]
    async fn reindex_replaces_chunks_and_vectors() {
        let pool = test_pool().await;
        let store = MemoryStore::new();
        let embedder = HashingEmbedder::new(64);
        let config = test_config();

        let long_text = "Nội dung phiên bản đầu tiên của tài liệu. ".repeat(20);
        let first = index_document(
            &pool, &store, &embedder,
            "guide.docx", "s3://bronze-raw/guide.docx", extract::MIME_DOCX,
            &long_text, &[], &config,
        )
        .await
        .unwrap();

        let second = index_document(
            &pool, &store, &embedder,
            "guide.docx", "s3://bronze-raw/guide.docx", extract::MIME_DOCX,
            "Bản rút gọn.", &[], &config,
        )
        .await
        .unwrap();

        // Same document row, fewer chunks, no orphaned vectors.
        assert_eq!(first.document_id, second.document_id);
        assert_eq!(second.chunks, 1);
        assert_eq!(store.count().await.unwrap(), 1);

        let chunk_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(chunk_rows, 1);
    }

    #[tokio::test]
    async fn empty_text_fails_without_touching_vectors() {
        let pool = test_pool().await;
        let store = MemoryStore::new();
        let embedder = HashingEmbedder::new(64);
        let config = test_config();

        let result = index_document(
            &pool, &store, &embedder,
            "empty.txt", "s3://bronze-raw/empty.txt", extract::MIME_TEXT,
            "   ", &[], &config,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn chunk_metadata_carries_resolved_image_urls() {
        let pool = test_pool().await;
        let store = MemoryStore::new();
        let embedder = HashingEmbedder::new(64);
        let config = test_config();

        let images = vec![ImagePlacement {
            url: "http://minio:9000/images/guide/image1.png".to_string(),
            char_offset: 5,
        }];
        index_document(
            &pool, &store, &embedder,
            "guide.docx", "s3://bronze-raw/guide.docx", extract::MIME_DOCX,
            "Tài liệu có hình ảnh minh họa.", &images, &config,
        )
        .await
        .unwrap();

        let metadata_json: String = sqlx::query_scalar("SELECT metadata_json FROM chunks")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(metadata_json.contains("http://minio:9000/images/guide/image1.png"));
    }

    #[tokio::test]
    async fn image_attaches_only_to_the_chunk_covering_its_span() {
        let pool = test_pool().await;
        let store = MemoryStore::new();
        let embedder = HashingEmbedder::new(64);
        let config = test_config();

        // Long enough for several 100-char chunks; the image sits near
        // the end of the document.
        let text = "Một đoạn văn hướng dẫn cài đặt trò chơi. ".repeat(10);
        let offset = text.chars().count() - 5;
        let images = vec![ImagePlacement {
            url: "http://minio:9000/images/guide/cuoi.png".to_string(),
            char_offset: offset,
        }];
        let outcome = index_document(
            &pool, &store, &embedder,
            "guide.docx", "s3://bronze-raw/guide.docx", extract::MIME_DOCX,
            &text, &images, &config,
        )
        .await
        .unwrap();
        assert!(outcome.chunks > 2);

        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT chunk_index, metadata_json FROM chunks ORDER BY chunk_index",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let with_image: Vec<i64> = rows
            .iter()
            .filter(|(_, json)| json.contains("cuoi.png"))
            .map(|(idx, _)| *idx)
            .collect();
        assert_eq!(with_image, vec![rows.last().unwrap().0]);
    }
}
