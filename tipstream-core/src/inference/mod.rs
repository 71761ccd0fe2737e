//! Remote collaborator abstractions.
//!
//! The worker only talks to these traits, so the Mistral-style conversation
//! client, the offline stub and test doubles are interchangeable. All calls
//! are async and may fail transiently; bounding them with timeouts is the
//! caller's job (see `engine::worker`).

pub mod conversation;
pub mod retrieval;
pub mod stub;
pub mod transcribe;

pub use conversation::{ConversationClient, ConversationClientConfig};
pub use retrieval::HttpRetrieval;
pub use stub::StubCompletion;
pub use transcribe::HttpTranscriber;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::error::Result;
use crate::ipc::events::TranscriptSegment;

/// Incremental completion output; end of stream means the reply is complete.
pub type TextStream = BoxStream<'static, Result<String>>;

/// Handle to the remote service's running context.
///
/// Cross-cycle memory lives server-side under `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationState {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
        }
    }
}

/// Contract for the generative text service.
#[async_trait]
pub trait Completion: Send + Sync + 'static {
    /// Open a new conversation (a network round trip).
    async fn create_conversation(&self) -> Result<ConversationState>;

    /// One complete reply for `prompt`.
    async fn complete(
        &self,
        state: &ConversationState,
        prompt: &str,
        schema: Option<&Value>,
    ) -> Result<String>;

    /// Stream the reply for `prompt` as text increments.
    async fn stream(
        &self,
        state: &ConversationState,
        prompt: &str,
        schema: Option<&Value>,
    ) -> Result<TextStream>;
}

/// Contract for the semantic document retrieval service.
#[async_trait]
pub trait Retrieval: Send + Sync + 'static {
    /// Up to `top_n` snippets, most relevant first. May be empty.
    async fn query(&self, corpus_id: &str, query: &str, top_n: usize) -> Result<Vec<String>>;
}

/// Contract for speech-to-text.
#[async_trait]
pub trait Transcriber: Send + Sync + 'static {
    /// Segments recognised in `audio`; empty when no speech was detected.
    async fn transcribe(&self, audio: Vec<u8>) -> Result<Vec<TranscriptSegment>>;
}

/// Join the text of a reply `content` value, which is either a plain string
/// or a list of typed chunks (`{"type": "text", "text": "..."}`).
pub(crate) fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(chunks) => chunks.iter().map(content_text).collect(),
        Value::Object(chunk) => chunk
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn content_text_accepts_strings_and_chunks() {
        assert_eq!(content_text(&json!("plain")), "plain");
        assert_eq!(
            content_text(&json!([
                {"type": "text", "text": "{\"a\":"},
                {"type": "tool_reference", "title": "ignored"},
                {"type": "text", "text": "1}"}
            ])),
            "{\"a\":1}"
        );
        assert_eq!(content_text(&json!(null)), "");
    }
}
