//! Error taxonomy shared by the ingestion and query pipeline.
//!
//! Components return [`PipelineError`] so callers can tell caller mistakes
//! apart from infrastructure failures. The HTTP layer maps each variant to a
//! status code; the CLI wraps them in `anyhow` at the boundary.

use thiserror::Error;

/// Errors produced by the chunking, embedding, retrieval, and chat pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Caller error: bad chunking parameters, empty text, malformed request.
    /// Rejected immediately, never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No embedding backend could be loaded or reached. Fatal at startup,
    /// a 503 at request time.
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),

    /// The input text could not be tokenized or embedded.
    #[error("text could not be embedded: {0}")]
    EncodingError(String),

    /// The vector database or relational store cannot be reached. Never
    /// converted into "no results".
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The external generation API failed, timed out, or rejected the call.
    /// `rate_limited` distinguishes quota/429 responses from transient
    /// network errors.
    #[error("generation failed: {message}")]
    GenerationFailure { message: String, rate_limited: bool },

    /// Unknown session, document, or chunk identifier.
    #[error("not found: {0}")]
    NotFound(String),
}

impl PipelineError {
    pub fn generation(message: impl Into<String>) -> Self {
        PipelineError::GenerationFailure {
            message: message.into(),
            rate_limited: false,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        PipelineError::GenerationFailure {
            message: message.into(),
            rate_limited: true,
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => PipelineError::NotFound("row not found".to_string()),
            other => PipelineError::StoreUnavailable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_flag_is_preserved() {
        let err = PipelineError::rate_limited("quota exceeded");
        match err {
            PipelineError::GenerationFailure { rate_limited, .. } => assert!(rate_limited),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn sqlx_row_not_found_maps_to_not_found() {
        let err: PipelineError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }
}
