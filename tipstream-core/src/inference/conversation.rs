//! Mistral-style conversations API client.
//!
//! ```text
//! create   POST {base}/v1/conversations            (stream: false) → conversation_id
//! complete POST {base}/v1/conversations/{id}       (stream: false) → outputs[].content
//! stream   POST {base}/v1/conversations/{id}       (stream: true)  → SSE
//!              message.output.delta        → yield content
//!              conversation.response.done  → end of stream
//!              conversation.response.error → StreamClosed
//! ```

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use crate::error::{Result, TipstreamError};
use crate::inference::{content_text, Completion, ConversationState, TextStream};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_BASE_URL: &str = "https://api.mistral.ai";
pub const DEFAULT_MODEL: &str = "mistral-small-2503";
pub const DEFAULT_INSTRUCTIONS: &str =
    "Give Tips to the Dungeon Master of this Dungeons and Dragons game";

#[derive(Debug, Clone)]
pub struct ConversationClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// Use a pre-created agent instead of `model` + `instructions`.
    pub agent_id: Option<String>,
    /// Opening input sent when the conversation is created.
    pub instructions: String,
}

impl ConversationClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.into(),
            agent_id: None,
            instructions: DEFAULT_INSTRUCTIONS.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationClient {
    http: reqwest::Client,
    config: ConversationClientConfig,
}

impl ConversationClient {
    pub fn new(config: ConversationClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await?;
        ensure_success(response).await
    }

    fn append_body(prompt: &str, schema: Option<&Value>, stream: bool) -> Value {
        let mut body = json!({
            "inputs": prompt,
            "stream": stream,
            "store": true,
        });
        if let Some(schema) = schema {
            body["completion_args"] = json!({
                "response_format": { "type": "json_schema", "json_schema": schema }
            });
        }
        body
    }
}

pub(crate) async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TipstreamError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Concatenated assistant text from a non-streaming conversation response.
fn outputs_text(payload: &Value) -> String {
    payload
        .get("outputs")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter(|e| e.get("type").and_then(Value::as_str) == Some("message.output"))
                .filter_map(|e| e.get("content"))
                .map(content_text)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, PartialEq)]
enum StreamEvent {
    Delta(String),
    Done,
    Error(String),
    Ignored,
}

fn parse_stream_event(event: &str, data: &str) -> StreamEvent {
    if data.trim() == "[DONE]" {
        return StreamEvent::Done;
    }
    let payload: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return StreamEvent::Error(format!("unparseable SSE data: {e}")),
    };
    let kind = payload
        .get("type")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .unwrap_or(event);
    match kind {
        "message.output.delta" => {
            let text = payload.get("content").map(content_text).unwrap_or_default();
            if text.is_empty() {
                StreamEvent::Ignored
            } else {
                StreamEvent::Delta(text)
            }
        }
        "conversation.response.done" => StreamEvent::Done,
        "conversation.response.error" => StreamEvent::Error(
            payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("conversation response error")
                .to_string(),
        ),
        _ => StreamEvent::Ignored,
    }
}

#[async_trait]
impl Completion for ConversationClient {
    async fn create_conversation(&self) -> Result<ConversationState> {
        let mut body = json!({
            "inputs": self.config.instructions,
            "stream": false,
            "store": true,
        });
        match &self.config.agent_id {
            Some(agent_id) => body["agent_id"] = json!(agent_id),
            None => {
                body["model"] = json!(self.config.model);
                body["instructions"] = json!(self.config.instructions);
            }
        }

        let payload: Value = self.post("/v1/conversations", &body).await?.json().await?;
        let id = payload
            .get("conversation_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                TipstreamError::ConversationInit("response carried no conversation_id".into())
            })?;
        debug!(conversation_id = id, "conversation created");
        Ok(ConversationState::new(id))
    }

    async fn complete(
        &self,
        state: &ConversationState,
        prompt: &str,
        schema: Option<&Value>,
    ) -> Result<String> {
        let body = Self::append_body(prompt, schema, false);
        let path = format!("/v1/conversations/{}", state.id);
        let payload: Value = self.post(&path, &body).await?.json().await?;
        Ok(outputs_text(&payload))
    }

    async fn stream(
        &self,
        state: &ConversationState,
        prompt: &str,
        schema: Option<&Value>,
    ) -> Result<TextStream> {
        let body = Self::append_body(prompt, schema, true);
        let path = format!("/v1/conversations/{}", state.id);
        let response = self.post(&path, &body).await?;
        let events = Box::pin(response.bytes_stream().eventsource());

        let deltas = stream::unfold(Some(events), |state| async move {
            let mut events = state?;
            loop {
                let sse = match events.next().await {
                    None => return None,
                    Some(Ok(sse)) => sse,
                    Some(Err(e)) => {
                        warn!(error = %e, "completion SSE stream error");
                        return Some((Err(TipstreamError::StreamClosed(e.to_string())), None));
                    }
                };
                trace!(event = %sse.event, data = %sse.data, "completion SSE");
                match parse_stream_event(&sse.event, &sse.data) {
                    StreamEvent::Delta(text) => return Some((Ok(text), Some(events))),
                    StreamEvent::Done => return None,
                    StreamEvent::Error(msg) => {
                        return Some((Err(TipstreamError::StreamClosed(msg)), None))
                    }
                    StreamEvent::Ignored => continue,
                }
            }
        });
        Ok(deltas.boxed())
    }
}
