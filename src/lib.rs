//! # PikaHelper
//!
//! A retrieval-augmented question answering backend for a Vietnamese
//! PokeMMO player community.
//!
//! PikaHelper ingests game guides from an S3-compatible object store
//! (DOCX, PDF, Q&A JSON), chunks and embeds them, indexes the vectors in
//! Qdrant, and answers player questions in Vietnamese through a Gemini
//! model grounded in the retrieved guide passages. Every answer cites the
//! guide chunks it drew from and is committed to per-session chat history.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌───────────┐
//! │  MinIO     │──▶│   Pipeline    │──▶│  Qdrant   │
//! │ raw bucket │   │ Extract+Chunk │   │  vectors  │
//! └────────────┘   │    +Embed     │   └─────┬─────┘
//!                  └──────┬───────┘         │
//!                         ▼                 ▼
//!                   ┌──────────┐      ┌──────────┐
//!                   │  SQLite  │      │ Chat API │──▶ Gemini
//!                   │ catalog  │      │ (axum)   │
//!                   └──────────┘      └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! pika init                     # create database
//! pika sync                     # ingest the raw document bucket
//! pika chat "Cách tải game?"    # one-shot question
//! pika serve chat               # start the chat API
//! pika serve embed              # start the embedding API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`objectstore`] | S3-compatible object store client (MinIO) |
//! | [`extract`] | DOCX, PDF, and Q&A JSON text extraction |
//! | [`chunk`] | Text chunking with natural breakpoints |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vectorstore`] | Vector store abstraction (Qdrant) |
//! | [`search`] | Similarity retrieval |
//! | [`answer`] | Prompt assembly, Gemini generation, citations |
//! | [`session`] | Chat history persistence |
//! | [`ingest`] | Object store sync and document indexing |
//! | [`server`] | Chat HTTP API |
//! | [`embed_server`] | Embedding HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod answer;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embed_server;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod objectstore;
pub mod search;
pub mod server;
pub mod session;
pub mod stats;
pub mod vectorstore;
