//! HTTP client for the rulebook retrieval service.
//!
//! `POST {base}/query` with `{"corpus", "query", "topN"}` answers
//! `{"snippets": [...]}`, most relevant first.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TipstreamError};
use crate::inference::conversation::ensure_success;
use crate::inference::Retrieval;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    corpus: &'a str,
    query: &'a str,
    top_n: usize,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    snippets: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct HttpRetrieval {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRetrieval {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Retrieval for HttpRetrieval {
    async fn query(&self, corpus_id: &str, query: &str, top_n: usize) -> Result<Vec<String>> {
        let url = format!("{}/query", self.base_url.trim_end_matches('/'));
        let request = QueryRequest {
            corpus: corpus_id,
            query,
            top_n,
        };
        let response = self.http.post(url).json(&request).send().await?;
        let response = ensure_success(response).await?;
        let mut payload: QueryResponse = response
            .json()
            .await
            .map_err(|e| TipstreamError::Retrieval(format!("malformed query response: {e}")))?;
        payload.snippets.retain(|s| !s.trim().is_empty());
        payload.snippets.truncate(top_n);
        debug!(corpus = corpus_id, hits = payload.snippets.len(), "retrieval query answered");
        Ok(payload.snippets)
    }
}
