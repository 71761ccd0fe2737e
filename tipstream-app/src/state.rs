//! Shared HTTP application state.
//!
//! `AppState` is cloned into every axum handler through the `State`
//! extractor; everything inside is behind `Arc`.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use serde::Serialize;
use tipstream_core::{DiagnosticsSnapshot, Session};

use crate::settings::RuntimeSettings;

#[derive(Clone)]
pub struct AppState {
    /// The live-assistant session all ingress feeds into.
    pub session: Arc<Session>,
    /// Settings the process booted with (secrets redacted).
    pub settings: Arc<RuntimeSettings>,
    /// Count of text notifications accepted.
    pub notifications: Arc<AtomicUsize>,
    /// Count of audio chunks received over HTTP or `/listen`.
    pub audio_chunks: Arc<AtomicUsize>,
    /// Count of audio chunks whose transcription failed.
    pub audio_failures: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(session: Arc<Session>, settings: RuntimeSettings) -> Self {
        Self {
            session,
            settings: Arc::new(settings),
            notifications: Arc::new(AtomicUsize::new(0)),
            audio_chunks: Arc::new(AtomicUsize::new(0)),
            audio_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn diagnostics_snapshot(&self) -> AppDiagnostics {
        AppDiagnostics {
            notifications: self.notifications.load(Ordering::Relaxed),
            audio_chunks: self.audio_chunks.load(Ordering::Relaxed),
            audio_failures: self.audio_failures.load(Ordering::Relaxed),
            pending_chars: self.session.pending_len(),
            subscribers: self.session.subscriber_count(),
            worker: self.session.diagnostics(),
            settings: (*self.settings).clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDiagnostics {
    pub notifications: usize,
    pub audio_chunks: usize,
    pub audio_failures: usize,
    pub pending_chars: usize,
    pub subscribers: usize,
    pub worker: DiagnosticsSnapshot,
    pub settings: RuntimeSettings,
}
