use std::time::Duration;

use thiserror::Error;

/// All errors produced by tipstream-core.
#[derive(Debug, Error)]
pub enum TipstreamError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{what} timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },

    #[error("conversation could not be created: {0}")]
    ConversationInit(String),

    #[error("completion stream closed abnormally: {0}")]
    StreamClosed(String),

    #[error("stream ended without a decodable tip document ({chars} chars buffered)")]
    Decode { chars: usize },

    #[error("transcription error: {0}")]
    Transcription(String),

    #[error("retrieval error: {0}")]
    Retrieval(String),

    #[error("no transcriber configured for this session")]
    NoTranscriber,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TipstreamError {
    /// Network-shaped failures that the next poll may succeed on.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TipstreamError::Http(_)
                | TipstreamError::Status { .. }
                | TipstreamError::Timeout { .. }
                | TipstreamError::ConversationInit(_)
                | TipstreamError::StreamClosed(_)
                | TipstreamError::Retrieval(_)
                | TipstreamError::Transcription(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TipstreamError>;
