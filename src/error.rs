//! Error types shared across the crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed input; fatal to the whole batch.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Failure of the external reasoning collaborator for one student. Always
/// recovered into a fallback annotation, never propagated past the batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnnotationError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("collaborator returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("collaborator reported error: {0}")]
    Reported(String),

    #[error("malformed annotation payload: {0}")]
    Malformed(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(&'static str),

    #[error("annotation cancelled before dispatch")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{sink} export failed: {message}")]
pub struct SinkError {
    pub sink: String,
    pub message: String,
}

impl SinkError {
    pub fn new(sink: impl Into<String>, message: impl ToString) -> Self {
        Self {
            sink: sink.into(),
            message: message.to_string(),
        }
    }
}
