//! Chat session persistence.
//!
//! Messages live in the `chat_messages` table keyed by session ID. The
//! owning `chat_sessions` row is created on first write and removed by
//! [`clear`], which cascades to the messages.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::models::{ChatMessage, MessageMetadata, Role};

/// Append one message to a session.
pub async fn append(
    pool: &SqlitePool,
    session_id: &str,
    role: Role,
    content: &str,
    metadata: &MessageMetadata,
) -> Result<ChatMessage> {
    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        role,
        content: content.to_string(),
        metadata: metadata.clone(),
        created_at: chrono::Utc::now().timestamp_millis(),
    };
    insert_message(pool, &message).await?;
    Ok(message)
}

/// Append a user question and the assistant's reply in one transaction.
/// Either both messages land or neither does, so history never shows a
/// question without its answer from a partially failed write.
pub async fn append_exchange(
    pool: &SqlitePool,
    session_id: &str,
    question: &str,
    answer: &str,
    answer_metadata: &MessageMetadata,
) -> Result<(ChatMessage, ChatMessage)> {
    let now = chrono::Utc::now().timestamp_millis();
    let user = ChatMessage {
        id: Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        role: Role::User,
        content: question.to_string(),
        metadata: MessageMetadata::default(),
        created_at: now,
    };
    let assistant = ChatMessage {
        id: Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        role: Role::Assistant,
        content: answer.to_string(),
        metadata: answer_metadata.clone(),
        // Strictly after the question even within one millisecond.
        created_at: now + 1,
    };

    let mut tx = pool.begin().await?;
    insert_message_tx(&mut tx, &user).await?;
    insert_message_tx(&mut tx, &assistant).await?;
    tx.commit().await?;

    Ok((user, assistant))
}

async fn insert_message(pool: &SqlitePool, message: &ChatMessage) -> Result<()> {
    let mut tx = pool.begin().await?;
    insert_message_tx(&mut tx, message).await?;
    tx.commit().await?;
    Ok(())
}

async fn insert_message_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    message: &ChatMessage,
) -> Result<()> {
    // Satisfies the chat_messages foreign key and tracks last activity.
    sqlx::query(
        r#"
        INSERT INTO chat_sessions (id, created_at, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at
        "#,
    )
    .bind(&message.session_id)
    .bind(message.created_at)
    .bind(message.created_at)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO chat_messages (id, session_id, role, content, metadata_json, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&message.id)
    .bind(&message.session_id)
    .bind(message.role.as_str())
    .bind(&message.content)
    .bind(metadata_json(&message.metadata)?)
    .bind(message.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn metadata_json(metadata: &MessageMetadata) -> Result<String> {
    serde_json::to_string(metadata)
        .map_err(|e| PipelineError::StoreUnavailable(format!("metadata serialization: {}", e)))
}

/// Fetch the most recent `limit` messages of a session in chronological
/// order. An unknown session yields an empty history.
pub async fn get_history(
    pool: &SqlitePool,
    session_id: &str,
    limit: usize,
) -> Result<Vec<ChatMessage>> {
    let rows = sqlx::query(
        r#"
        SELECT id, session_id, role, content, metadata_json, created_at
        FROM chat_messages
        WHERE session_id = ?
        ORDER BY created_at DESC, id DESC
        LIMIT ?
        "#,
    )
    .bind(session_id)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    let mut messages = Vec::with_capacity(rows.len());
    for row in rows {
        let role_str: String = row.get("role");
        let metadata_str: String = row.get("metadata_json");
        messages.push(ChatMessage {
            id: row.get("id"),
            session_id: row.get("session_id"),
            role: Role::parse(&role_str).ok_or_else(|| {
                PipelineError::StoreUnavailable(format!("unknown message role: {}", role_str))
            })?,
            content: row.get("content"),
            metadata: serde_json::from_str(&metadata_str).unwrap_or_default(),
            created_at: row.get("created_at"),
        });
    }
    // Newest-first from the query, oldest-first for callers.
    messages.reverse();
    Ok(messages)
}

/// Delete a session and every message in it, returning the number of
/// messages removed. Clearing an unknown session is an error so the
/// HTTP layer can answer 404.
pub async fn clear(pool: &SqlitePool, session_id: &str) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let messages = sqlx::query("DELETE FROM chat_messages WHERE session_id = ?")
        .bind(session_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    let sessions = sqlx::query("DELETE FROM chat_sessions WHERE id = ?")
        .bind(session_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    tx.commit().await?;

    if sessions == 0 {
        return Err(PipelineError::NotFound(format!(
            "session not found: {}",
            session_id
        )));
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn append_and_get_history_round_trip() {
        let pool = test_pool().await;
        append(&pool, "s1", Role::User, "Xin chào", &MessageMetadata::default())
            .await
            .unwrap();
        append(&pool, "s1", Role::Assistant, "Chào bạn!", &MessageMetadata::default())
            .await
            .unwrap();

        let history = get_history(&pool, "s1", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].content, "Chào bạn!");
    }

    #[tokio::test]
    async fn history_is_chronological_and_limited() {
        let pool = test_pool().await;
        for i in 0..6 {
            let (role, text) = if i % 2 == 0 {
                (Role::User, format!("câu hỏi {}", i))
            } else {
                (Role::Assistant, format!("trả lời {}", i))
            };
            let msg = ChatMessage {
                id: format!("m{}", i),
                session_id: "s1".to_string(),
                role,
                content: text,
                metadata: MessageMetadata::default(),
                created_at: 1000 + i,
            };
            insert_message(&pool, &msg).await.unwrap();
        }

        let history = get_history(&pool, "s1", 4).await.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].content, "câu hỏi 2");
        assert_eq!(history[3].content, "trả lời 5");
    }

    #[tokio::test]
    async fn equal_timestamps_keep_insertion_order() {
        let pool = test_pool().await;
        for i in 0..4 {
            let msg = ChatMessage {
                id: format!("m{}", i),
                session_id: "s1".to_string(),
                role: if i % 2 == 0 { Role::User } else { Role::Assistant },
                content: format!("tin {}", i),
                metadata: MessageMetadata::default(),
                created_at: 1000,
            };
            insert_message(&pool, &msg).await.unwrap();
        }

        let history = get_history(&pool, "s1", 10).await.unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["tin 0", "tin 1", "tin 2", "tin 3"]);
    }

    #[tokio::test]
    async fn clear_removes_the_session_row() {
        use sqlx::Row;

        let pool = test_pool().await;
        append(&pool, "s1", Role::User, "hi", &MessageMetadata::default())
            .await
            .unwrap();

        let before: i64 = sqlx::query("SELECT COUNT(*) AS n FROM chat_sessions")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get("n");
        assert_eq!(before, 1);

        clear(&pool, "s1").await.unwrap();
        let after: i64 = sqlx::query("SELECT COUNT(*) AS n FROM chat_sessions")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get("n");
        assert_eq!(after, 0);
    }

    #[tokio::test]
    async fn unknown_session_has_empty_history() {
        let pool = test_pool().await;
        let history = get_history(&pool, "nope", 10).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn exchange_is_ordered_user_then_assistant() {
        let pool = test_pool().await;
        append_exchange(
            &pool,
            "s1",
            "Tải game ở đâu?",
            "Tại pokemmo.com nhé.",
            &MessageMetadata::default(),
        )
        .await
        .unwrap();

        let history = get_history(&pool, "s1", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
        assert!(history[0].created_at < history[1].created_at);
    }

    #[tokio::test]
    async fn clear_removes_messages_and_reports_missing_session() {
        let pool = test_pool().await;
        append(&pool, "s1", Role::User, "hi", &MessageMetadata::default())
            .await
            .unwrap();

        let deleted = clear(&pool, "s1").await.unwrap();
        assert_eq!(deleted, 1);
        assert!(get_history(&pool, "s1", 10).await.unwrap().is_empty());

        let err = clear(&pool, "s1").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let pool = test_pool().await;
        append(&pool, "a", Role::User, "hỏi A", &MessageMetadata::default())
            .await
            .unwrap();
        append(&pool, "b", Role::User, "hỏi B", &MessageMetadata::default())
            .await
            .unwrap();

        clear(&pool, "a").await.unwrap();
        let history_b = get_history(&pool, "b", 10).await.unwrap();
        assert_eq!(history_b.len(), 1);
        assert_eq!(history_b[0].content, "hỏi B");
    }
}
