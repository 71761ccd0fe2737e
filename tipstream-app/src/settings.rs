//! Persistent application settings (JSON file in the data directory).
//!
//! Resolution order: defaults, then the settings file, then environment
//! overrides, then `normalize()`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tipstream_core::inference::conversation::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use tipstream_core::{RetrievalConfig, SessionConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub bind_addr: String,
    pub completion_base_url: String,
    pub completion_model: String,
    pub completion_agent_id: Option<String>,
    pub api_key: Option<String>,
    pub retrieval_base_url: Option<String>,
    pub retrieval_corpus: Option<String>,
    pub retrieval_top_n: usize,
    pub transcriber_url: Option<String>,
    pub poll_interval_ms: u64,
    pub remote_timeout_secs: u64,
    /// Bound on one whole completion stream. Never shorter than the gap timeout.
    pub stream_deadline_secs: u64,
    pub lenient_partials: bool,
    pub subscriber_buffer: usize,
    /// Start the worker at boot instead of on the first notification.
    pub autostart: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".into(),
            completion_base_url: DEFAULT_BASE_URL.into(),
            completion_model: DEFAULT_MODEL.into(),
            completion_agent_id: None,
            api_key: None,
            retrieval_base_url: None,
            retrieval_corpus: None,
            retrieval_top_n: 3,
            transcriber_url: None,
            poll_interval_ms: 100,
            remote_timeout_secs: 60,
            stream_deadline_secs: 300,
            lenient_partials: false,
            subscriber_buffer: 64,
            autostart: true,
        }
    }
}

/// Settings view safe to log or expose: secrets reduced to presence flags.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSettings {
    pub bind_addr: String,
    pub completion_base_url: String,
    pub completion_model: String,
    pub has_api_key: bool,
    pub retrieval_enabled: bool,
    pub transcriber_enabled: bool,
    pub poll_interval_ms: u64,
    pub remote_timeout_secs: u64,
    pub stream_deadline_secs: u64,
    pub lenient_partials: bool,
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.bind_addr = non_empty(&self.bind_addr).unwrap_or_else(|| "0.0.0.0:8000".into());
        self.completion_base_url = non_empty(&self.completion_base_url)
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.into());
        self.completion_model =
            non_empty(&self.completion_model).unwrap_or_else(|| DEFAULT_MODEL.into());
        self.completion_agent_id = self.completion_agent_id.as_deref().and_then(non_empty);
        self.api_key = self.api_key.as_deref().and_then(non_empty);
        self.retrieval_base_url = self.retrieval_base_url.as_deref().and_then(non_empty);
        self.retrieval_corpus = self.retrieval_corpus.as_deref().and_then(non_empty);
        self.retrieval_top_n = self.retrieval_top_n.clamp(1, 20);
        self.transcriber_url = self.transcriber_url.as_deref().and_then(non_empty);
        self.poll_interval_ms = self.poll_interval_ms.clamp(10, 10_000);
        self.remote_timeout_secs = self.remote_timeout_secs.clamp(1, 600);
        self.stream_deadline_secs = self
            .stream_deadline_secs
            .clamp(self.remote_timeout_secs, 3600);
        self.subscriber_buffer = self.subscriber_buffer.clamp(1, 4096);
    }

    /// Overlay `TIPSTREAM_*` (and `MISTRAL_API_KEY`) environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("TIPSTREAM_BIND") {
            self.bind_addr = v;
        }
        if let Some(v) = lookup("TIPSTREAM_COMPLETION_URL") {
            self.completion_base_url = v;
        }
        if let Some(v) = lookup("TIPSTREAM_MODEL") {
            self.completion_model = v;
        }
        if let Some(v) = lookup("TIPSTREAM_AGENT_ID") {
            self.completion_agent_id = Some(v);
        }
        if let Some(v) = lookup("TIPSTREAM_API_KEY").or_else(|| lookup("MISTRAL_API_KEY")) {
            self.api_key = Some(v);
        }
        if let Some(v) = lookup("TIPSTREAM_RETRIEVAL_URL") {
            self.retrieval_base_url = Some(v);
        }
        if let Some(v) = lookup("TIPSTREAM_RETRIEVAL_CORPUS") {
            self.retrieval_corpus = Some(v);
        }
        if let Some(v) = lookup("TIPSTREAM_TRANSCRIBER_URL") {
            self.transcriber_url = Some(v);
        }
    }

    /// Retrieval is on only when both the service and a corpus are known.
    pub fn retrieval(&self) -> Option<(String, RetrievalConfig)> {
        let base = self.retrieval_base_url.clone()?;
        let corpus = self.retrieval_corpus.as_deref()?;
        let mut config = RetrievalConfig::new(corpus);
        config.top_n = self.retrieval_top_n;
        Some((base, config))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            remote_timeout: Duration::from_secs(self.remote_timeout_secs),
            stream_deadline: Duration::from_secs(self.stream_deadline_secs),
            retrieval: self.retrieval().map(|(_, config)| config),
            lenient_partials: self.lenient_partials,
            subscriber_buffer: self.subscriber_buffer,
        }
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            bind_addr: self.bind_addr.clone(),
            completion_base_url: self.completion_base_url.clone(),
            completion_model: self.completion_model.clone(),
            has_api_key: self.api_key.is_some(),
            retrieval_enabled: self.retrieval().is_some(),
            transcriber_enabled: self.transcriber_url.is_some(),
            poll_interval_ms: self.poll_interval_ms,
            remote_timeout_secs: self.remote_timeout_secs,
            stream_deadline_secs: self.stream_deadline_secs,
            lenient_partials: self.lenient_partials,
        }
    }
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub fn default_settings_path() -> PathBuf {
    if let Some(path) = std::env::var_os("TIPSTREAM_SETTINGS_PATH") {
        return PathBuf::from(path);
    }
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("tipstream")
        .join("settings.json")
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.apply_env_overrides();
    settings.normalize();
    settings
}
