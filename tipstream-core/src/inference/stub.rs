//! `StubCompletion`: offline stand-in for the completion service.
//!
//! Used when no API key is configured so the ingress, worker, decoder and
//! broadcast path can be exercised end-to-end. Replies are deterministic and
//! streamed in small slices like a real token stream.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::inference::{Completion, ConversationState, TextStream};
use crate::ipc::events::TipDocument;

const DEFAULT_CHUNK_CHARS: usize = 16;

#[derive(Debug)]
pub struct StubCompletion {
    conversations: AtomicU64,
    chunk_chars: usize,
}

impl StubCompletion {
    pub fn new() -> Self {
        Self::with_chunk_chars(DEFAULT_CHUNK_CHARS)
    }

    pub fn with_chunk_chars(chunk_chars: usize) -> Self {
        Self {
            conversations: AtomicU64::new(0),
            chunk_chars: chunk_chars.max(1),
        }
    }

    /// The document the stub streams for `prompt`.
    pub fn tip_for(prompt: &str) -> TipDocument {
        let said = last_line(prompt);
        TipDocument {
            read_this_text_to_your_players: format!("[stub] The table hears: {said}"),
            related_game_rule: "[stub] No rulebook consulted".into(),
            what_could_happen_next: "[stub] Something stirs nearby.".into(),
            summary_of_what_was_said: said.to_string(),
        }
    }
}

impl Default for StubCompletion {
    fn default() -> Self {
        Self::new()
    }
}

fn last_line(prompt: &str) -> &str {
    prompt
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
}

#[async_trait]
impl Completion for StubCompletion {
    async fn create_conversation(&self) -> Result<ConversationState> {
        let n = self.conversations.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(n, "StubCompletion::create_conversation");
        Ok(ConversationState::new(format!("stub-conversation-{n}")))
    }

    async fn complete(
        &self,
        _state: &ConversationState,
        prompt: &str,
        _schema: Option<&Value>,
    ) -> Result<String> {
        Ok(last_line(prompt).to_string())
    }

    async fn stream(
        &self,
        _state: &ConversationState,
        prompt: &str,
        _schema: Option<&Value>,
    ) -> Result<TextStream> {
        let json = serde_json::to_string(&Self::tip_for(prompt))?;
        let chars: Vec<char> = json.chars().collect();
        let chunks: Vec<Result<String>> = chars
            .chunks(self.chunk_chars)
            .map(|c| Ok(c.iter().collect()))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }
}
