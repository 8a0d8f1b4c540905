//! # PikaHelper CLI (`pika`)
//!
//! The `pika` binary drives the full pipeline: database initialization,
//! document ingestion from the object store, one-shot questions, and the
//! two HTTP services.
//!
//! ## Usage
//!
//! ```bash
//! pika --config ./config/pika.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pika init` | Create the SQLite database and run schema migrations |
//! | `pika sync` | Ingest the raw document bucket into the knowledge base |
//! | `pika search "<query>"` | Retrieve the chunks most similar to a query |
//! | `pika chat "<question>"` | Ask one question and print the cited answer |
//! | `pika embed "<text>"` | Embed a text and print the vector |
//! | `pika clear-history <session>` | Delete a chat session and its messages |
//! | `pika stats` | Print knowledge base counters |
//! | `pika serve chat` | Start the chat HTTP API |
//! | `pika serve embed` | Start the embedding HTTP API |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use pikahelper::answer::{self, GeminiClient};
use pikahelper::config::{self, Config};
use pikahelper::embed_server::{run_embed_server, EmbedState};
use pikahelper::embedding::{create_embedder, Embedder};
use pikahelper::server::{run_chat_server, AppState};
use pikahelper::vectorstore::{create_vector_store, VectorStore};
use pikahelper::{db, ingest, migrate, search, session, stats};

/// PikaHelper CLI, a retrieval-augmented QA backend for a Vietnamese
/// PokeMMO player community.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/pika.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "pika",
    about = "PikaHelper: retrieval-augmented PokeMMO QA over guides from MinIO, Qdrant, and Gemini",
    version,
    long_about = "PikaHelper ingests game guides from an S3-compatible object store, chunks and \
    embeds them, indexes the vectors in Qdrant, and answers player questions in Vietnamese through \
    a Gemini model grounded in the retrieved passages."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/pika.toml`. All database, object store,
    /// embedding, vector store, and server settings are read from this file.
    #[arg(long, global = true, default_value = "./config/pika.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (documents, chunks, embeddings, chat_sessions, chat_messages).
    /// This command is idempotent; running it multiple times is safe.
    Init,

    /// Ingest the raw document bucket into the knowledge base.
    ///
    /// Lists the configured raw bucket, downloads each object, extracts
    /// its text, chunks and embeds it, and upserts the vectors. DOCX
    /// images are mirrored to the image bucket. Re-syncing an unchanged
    /// object replaces its chunks and vectors in place.
    Sync {
        /// Maximum number of objects to process.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Retrieve the chunks most similar to a query.
    ///
    /// Embeds the query and searches the vector store, printing ranked
    /// results with scores. No answer is generated.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Ask one question and print the cited answer.
    ///
    /// Runs the full retrieval and generation pipeline for a single turn.
    /// Requires the Gemini API key in the environment variable named by
    /// `[generation].api_key_env`.
    Chat {
        /// The question, in Vietnamese or English.
        question: String,

        /// Reuse a session so the model sees prior turns.
        #[arg(long)]
        session: Option<String>,
    },

    /// Embed a text and print the vector as JSON.
    ///
    /// Uses the configured embedding provider; useful for checking which
    /// model is active and what it produces.
    Embed {
        /// The text to embed.
        text: String,
    },

    /// Delete a chat session and all of its messages.
    ClearHistory {
        /// The session ID to clear.
        session: String,
    },

    /// Print knowledge base counters.
    ///
    /// Shows document, chunk, embedding, vector, and session counts plus
    /// the active embedding model.
    Stats,

    /// Start an HTTP service.
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },
}

/// Server subcommands.
#[derive(Subcommand)]
enum ServeService {
    /// Start the chat API.
    ///
    /// Binds to `[chat_server].bind` and serves `/chat`, `/search`,
    /// `/chat/history/{session_id}`, `/health`, and `/stats`.
    Chat,

    /// Start the embedding API.
    ///
    /// Binds to `[embed_server].bind` and serves `/embed`,
    /// `/embed/process-chunks`, and `/health`.
    Embed,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync { limit } => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            let (embedder, vstore) = build_index_components(&cfg).await?;

            let report =
                ingest::sync_objectstore(&cfg, &pool, vstore.as_ref(), embedder.as_ref(), limit)
                    .await?;
            println!(
                "Sync complete: {} scanned, {} processed, {} failed, {} chunks, {} images mirrored",
                report.scanned,
                report.processed,
                report.failed,
                report.chunks,
                report.images_mirrored
            );
        }
        Commands::Search { query, limit } => {
            let (embedder, vstore) = build_index_components(&cfg).await?;
            let hits = search::retrieve(
                embedder.as_ref(),
                vstore.as_ref(),
                &query,
                limit.unwrap_or(cfg.retrieval.top_k),
                cfg.retrieval.score_threshold,
            )
            .await?;

            if hits.is_empty() {
                println!("No results above the score threshold.");
            } else {
                for (i, hit) in hits.iter().enumerate() {
                    println!("[{}] {} (score: {:.3})", i + 1, hit.file_name, hit.score);
                    println!("    {}", snippet(&hit.content, 160));
                }
            }
        }
        Commands::Chat { question, session } => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            let (embedder, vstore) = build_index_components(&cfg).await?;
            let generator = GeminiClient::new(&cfg.generation)?;
            let session_id = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            let hits = search::retrieve(
                embedder.as_ref(),
                vstore.as_ref(),
                &question,
                cfg.retrieval.top_k,
                cfg.retrieval.score_threshold,
            )
            .await?;
            let reply = answer::compose(
                &pool,
                &generator,
                &cfg.generation,
                &session_id,
                &question,
                &hits,
            )
            .await?;

            println!("{}", reply.response);
            if !reply.sources.is_empty() {
                println!();
                println!("Nguồn:");
                for source in &reply.sources {
                    println!(
                        "  [{}] {} (score: {:.3})",
                        source.source_id, source.file_name, source.score
                    );
                }
            }
            println!();
            println!("session: {}", session_id);
        }
        Commands::Embed { text } => {
            let embedder = create_embedder(&cfg.embedding).await?;
            let vector = embedder.embed(&text).await?;
            println!(
                "{}",
                serde_json::json!({
                    "model_name": embedder.model_name(),
                    "dims": vector.len(),
                    "embedding": vector,
                })
            );
        }
        Commands::ClearHistory { session } => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            let deleted = session::clear(&pool, &session).await?;
            println!("Deleted {} messages from session {}.", deleted, session);
        }
        Commands::Stats => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            let (embedder, vstore) = build_index_components(&cfg).await?;
            let counters = stats::collect(&pool, vstore.as_ref(), embedder.model_name()).await?;
            stats::print(&counters);
        }
        Commands::Serve { service } => match service {
            ServeService::Chat => {
                let pool = db::connect(&cfg.db.path).await?;
                migrate::run_migrations(&pool).await?;
                let (embedder, vstore) = build_index_components(&cfg).await?;
                let generator = Arc::new(GeminiClient::new(&cfg.generation)?);

                let state =
                    AppState::new(Arc::new(cfg), pool, embedder, Arc::from(vstore), generator);
                run_chat_server(state).await?;
            }
            ServeService::Embed => {
                let pool = db::connect(&cfg.db.path).await?;
                migrate::run_migrations(&pool).await?;
                let (embedder, vstore) = build_index_components(&cfg).await?;

                let state = EmbedState::new(Arc::new(cfg), pool, embedder, Arc::from(vstore));
                run_embed_server(state).await?;
            }
        },
    }

    Ok(())
}

/// Build the embedder and vector store and make sure the collection exists
/// with the embedder's dimensionality.
async fn build_index_components(
    cfg: &Config,
) -> anyhow::Result<(Arc<dyn Embedder>, Box<dyn VectorStore>)> {
    let embedder = create_embedder(&cfg.embedding).await?;
    let vstore = create_vector_store(&cfg.vector)?;
    vstore.ensure_collection(embedder.dims()).await?;
    Ok((embedder, vstore))
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    let mut out: String = flat.chars().take(max_chars).collect();
    if flat.chars().count() > max_chars {
        out.push('…');
    }
    out
}
