//! Core data models for the document QA pipeline.
//!
//! These types represent the documents, chunks, and chat messages that flow
//! through ingestion, retrieval, and answer composition.

use serde::{Deserialize, Serialize};

/// Processing state of an ingested document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DocumentStatus::Pending),
            "processing" => Some(DocumentStatus::Processing),
            "completed" => Some(DocumentStatus::Completed),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

/// Category assigned to a link found in document text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkCategory {
    Video,
    Download,
    Community,
    Official,
    External,
}

/// A hyperlink extracted from a chunk's span, with enough context to show
/// the user where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRef {
    pub url: String,
    /// Character position of the link within the full document text.
    pub position: usize,
    pub context: String,
    pub category: LinkCategory,
}

/// Typed per-chunk metadata. Serialized to the chunk's JSON metadata column
/// and into the vector store payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub links: Vec<LinkRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

impl ChunkMetadata {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.links.is_empty() && self.section.is_none()
    }
}

/// A contiguous slice of a document's text, the unit of embedding and
/// retrieval. Offsets and lengths are in characters, not bytes.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub char_offset: usize,
    pub char_length: usize,
    pub metadata: ChunkMetadata,
}

/// Role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// A citation attached to an assistant reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    /// 1-based index of the passage in the prompt context.
    pub source_id: usize,
    pub file_name: String,
    pub score: f32,
}

/// Metadata stored alongside an assistant message: the sources it cited and
/// any images/links carried over from the cited chunks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub links: Vec<LinkRef>,
}

/// An immutable chat message within a session, ordered by creation time.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub metadata: MessageMetadata,
    /// Unix epoch milliseconds.
    pub created_at: i64,
}

/// A retrieval result: a chunk resolved back to its text and source document.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub file_name: String,
    pub content: String,
    pub score: f32,
    pub metadata: ChunkMetadata,
}
