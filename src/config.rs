use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub objectstore: Option<ObjectStoreConfig>,
    #[serde(default)]
    pub chat_server: ServerConfig,
    #[serde(default)]
    pub embed_server: EmbedServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_max_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            score_threshold: default_score_threshold(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_score_threshold() -> f32 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `local` (fastembed), `remote` (embedding HTTP service), or `hashing`
    /// (deterministic bag-of-words, offline dev/test only).
    #[serde(default = "default_embed_provider")]
    pub provider: String,
    /// Preferred model for the local provider.
    #[serde(default = "default_embed_model")]
    pub model: String,
    /// Fallback model used when the preferred model cannot be initialized.
    #[serde(default = "default_fallback_model")]
    pub fallback_model: String,
    /// Vector dimensionality. Must agree with the model that produced the
    /// collection's vectors.
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Base URL of the embedding service (remote provider).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embed_provider(),
            model: default_embed_model(),
            fallback_model: default_fallback_model(),
            dims: default_dims(),
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embed_provider() -> String {
    "local".to_string()
}
fn default_embed_model() -> String {
    "multilingual-e5-small".to_string()
}
fn default_fallback_model() -> String {
    "all-minilm-l6-v2".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    /// `qdrant` or `memory` (tests/offline only; not persistent).
    #[serde(default = "default_vector_backend")]
    pub backend: String,
    #[serde(default = "default_qdrant_url")]
    pub url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            backend: default_vector_backend(),
            url: default_qdrant_url(),
            collection: default_collection(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_vector_backend() -> String {
    "qdrant".to_string()
}
fn default_qdrant_url() -> String {
    "http://localhost:6333".to_string()
}
fn default_collection() -> String {
    "pikahelper_chunks".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_gen_model")]
    pub model: String,
    /// Environment variable holding the API key. The key itself never lives
    /// in the config file.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_gen_base_url")]
    pub base_url: String,
    #[serde(default = "default_gen_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_gen_max_retries")]
    pub max_retries: u32,
    /// Number of prior exchanges (user + assistant pairs) included in the
    /// prompt.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Fixed reply returned when generation fails. Localized; internal error
    /// text never reaches the client.
    #[serde(default = "default_fallback_message")]
    pub fallback_message: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: default_gen_model(),
            api_key_env: default_api_key_env(),
            base_url: default_gen_base_url(),
            timeout_secs: default_gen_timeout_secs(),
            max_retries: default_gen_max_retries(),
            history_limit: default_history_limit(),
            fallback_message: default_fallback_message(),
        }
    }
}

fn default_gen_model() -> String {
    "gemini-2.0-flash".to_string()
}
fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}
fn default_gen_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_gen_timeout_secs() -> u64 {
    60
}
fn default_gen_max_retries() -> u32 {
    2
}
fn default_history_limit() -> usize {
    6
}
fn default_fallback_message() -> String {
    "Xin lỗi, đã có lỗi xảy ra. Vui lòng thử lại sau.".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ObjectStoreConfig {
    /// S3-compatible endpoint (MinIO in the deployed system).
    pub endpoint: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_raw_bucket")]
    pub raw_bucket: String,
    #[serde(default = "default_images_bucket")]
    pub images_bucket: String,
    /// Environment variables holding the access credentials.
    #[serde(default = "default_access_key_env")]
    pub access_key_env: String,
    #[serde(default = "default_secret_key_env")]
    pub secret_key_env: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_raw_bucket() -> String {
    "bronze-raw".to_string()
}
fn default_images_bucket() -> String {
    "images".to_string()
}
fn default_access_key_env() -> String {
    "MINIO_ACCESS_KEY".to_string()
}
fn default_secret_key_env() -> String {
    "MINIO_SECRET_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_chat_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_chat_bind(),
        }
    }
}

fn default_chat_bind() -> String {
    "0.0.0.0:8000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbedServerConfig {
    #[serde(default = "default_embed_bind")]
    pub bind: String,
}

impl Default for EmbedServerConfig {
    fn default() -> Self {
        Self {
            bind: default_embed_bind(),
        }
    }
}

fn default_embed_bind() -> String {
    "0.0.0.0:8001".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.max_size == 0 {
        anyhow::bail!("chunking.max_size must be > 0");
    }
    if config.chunking.max_size <= config.chunking.overlap {
        anyhow::bail!(
            "chunking.max_size ({}) must be greater than chunking.overlap ({})",
            config.chunking.max_size,
            config.chunking.overlap
        );
    }

    // Validate retrieval
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.score_threshold) {
        anyhow::bail!("retrieval.score_threshold must be in [0.0, 1.0]");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "local" | "hashing" => {}
        "remote" => {
            if config.embedding.url.is_none() {
                anyhow::bail!("embedding.url must be set when provider is 'remote'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be local, remote, or hashing.",
            other
        ),
    }
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }

    match config.vector.backend.as_str() {
        "qdrant" | "memory" => {}
        other => anyhow::bail!(
            "Unknown vector backend: '{}'. Must be qdrant or memory.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let f = write_config("[db]\npath = \"/tmp/pika.sqlite\"\n");
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.chunking.max_size, 1000);
        assert_eq!(cfg.chunking.overlap, 200);
        assert_eq!(cfg.retrieval.top_k, 5);
        assert_eq!(cfg.embedding.provider, "local");
        assert_eq!(cfg.vector.backend, "qdrant");
        assert!(cfg.generation.fallback_message.contains("Xin lỗi"));
    }

    #[test]
    fn overlap_must_be_smaller_than_max_size() {
        let f = write_config(
            "[db]\npath = \"/tmp/pika.sqlite\"\n[chunking]\nmax_size = 200\noverlap = 200\n",
        );
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn remote_provider_requires_url() {
        let f = write_config(
            "[db]\npath = \"/tmp/pika.sqlite\"\n[embedding]\nprovider = \"remote\"\n",
        );
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn unknown_vector_backend_rejected() {
        let f = write_config(
            "[db]\npath = \"/tmp/pika.sqlite\"\n[vector]\nbackend = \"faiss\"\n",
        );
        assert!(load_config(f.path()).is_err());
    }
}
