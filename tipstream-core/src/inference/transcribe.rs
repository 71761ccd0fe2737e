//! HTTP client for the speech-to-text backend.
//!
//! The raw audio chunk is posted as `application/octet-stream`; the backend
//! answers `{"segments": [{"text", "words": [{"word", "start", "end"}]}]}`.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, TipstreamError};
use crate::inference::conversation::ensure_success;
use crate::inference::Transcriber;
use crate::ipc::events::TranscriptSegment;

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    segments: Vec<TranscriptSegment>,
}

#[derive(Debug, Clone)]
pub struct HttpTranscriber {
    http: reqwest::Client,
    url: String,
}

impl HttpTranscriber {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, audio: Vec<u8>) -> Result<Vec<TranscriptSegment>> {
        let bytes = audio.len();
        let response = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(audio)
            .send()
            .await
            .map_err(|e| TipstreamError::Transcription(e.to_string()))?;
        let response = ensure_success(response).await?;
        let payload: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| TipstreamError::Transcription(format!("malformed response: {e}")))?;

        let segments: Vec<TranscriptSegment> = payload
            .segments
            .into_iter()
            .filter_map(|mut seg| {
                seg.text = seg.text.trim().to_string();
                (!seg.text.is_empty()).then_some(seg)
            })
            .collect();
        if segments.is_empty() {
            debug!(bytes, "no speech detected in audio chunk");
        }
        Ok(segments)
    }
}
