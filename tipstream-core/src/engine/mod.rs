//! `Session`: one live-assistant instance.
//!
//! ## Lifecycle
//!
//! ```text
//! Session::new(config, completion)
//!     └─► with_retrieval / with_transcriber (optional)
//!         └─► Arc::new(..).start()   → worker task spawned once, status = Idle
//!             └─► stop()             → loop exits after its current cycle
//! ```
//!
//! ## Ownership
//!
//! Everything the worker and the ingress handlers share lives here: the
//! pending-text accumulator, the subscriber registry, the lazily created
//! conversation handle and the start-once flag. Ingress only appends and
//! returns; the generation call happens on the worker task alone.

pub mod worker;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, OnceCell};
use tracing::{debug, info};

use crate::{
    broadcast::{BroadcastRegistry, SubscriberId, Subscription, DEFAULT_SUBSCRIBER_BUFFER},
    buffering::PendingText,
    error::{Result, TipstreamError},
    inference::{Completion, ConversationState, Retrieval, Transcriber},
    ipc::events::{SessionStatus, SessionStatusEvent, TranscriptSegment},
};

pub use worker::{DiagnosticsSnapshot, WorkerDiagnostics};

/// Status channel capacity: 64 transitions buffered for slow observers.
const STATUS_CAP: usize = 64;

/// Which corpus to consult before generating, and how many snippets to use.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub corpus_id: String,
    pub top_n: usize,
}

impl RetrievalConfig {
    pub fn new(corpus_id: impl Into<String>) -> Self {
        Self {
            corpus_id: corpus_id.into(),
            top_n: 3,
        }
    }
}

/// Configuration for `Session`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How often the worker checks the accumulator. Default: 100 ms.
    pub poll_interval: Duration,
    /// Bound on every remote call and on each gap between stream
    /// increments. Default: 60 s.
    pub remote_timeout: Duration,
    /// Bound on one whole completion stream, however steadily it trickles.
    /// Default: 5 min.
    pub stream_deadline: Duration,
    /// Retrieval round-trip before generation; `None` skips it.
    pub retrieval: Option<RetrievalConfig>,
    /// Repair open prefixes to publish progressive partial updates.
    /// Default: false (only syntactically complete buffers decode).
    pub lenient_partials: bool,
    /// Per-subscriber queue depth. Default: 64.
    pub subscriber_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            remote_timeout: Duration::from_secs(60),
            stream_deadline: Duration::from_secs(300),
            retrieval: None,
            lenient_partials: false,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

/// The per-session state shared by ingress handlers and the worker.
///
/// `Session` is `Send + Sync`; wrap it in `Arc` and clone the `Arc` into
/// request handlers.
pub struct Session {
    config: SessionConfig,
    completion: Arc<dyn Completion>,
    retrieval: Option<Arc<dyn Retrieval>>,
    transcriber: Option<Arc<dyn Transcriber>>,
    pending: PendingText,
    registry: BroadcastRegistry,
    /// Created on first use; a failed creation leaves it empty for retry.
    conversation: OnceCell<ConversationState>,
    /// `true` from a successful `start()` until the worker loop exits.
    running: AtomicBool,
    stop_requested: AtomicBool,
    status: Mutex<SessionStatus>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    /// Tip event sequence counter.
    seq: AtomicU64,
    /// Generation cycle counter.
    cycles: AtomicU64,
    diagnostics: WorkerDiagnostics,
}

impl Session {
    pub fn new(config: SessionConfig, completion: Arc<dyn Completion>) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CAP);
        let registry = BroadcastRegistry::new(config.subscriber_buffer);
        Self {
            config,
            completion,
            retrieval: None,
            transcriber: None,
            pending: PendingText::new(),
            registry,
            conversation: OnceCell::new(),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            status: Mutex::new(SessionStatus::Idle),
            status_tx,
            seq: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
            diagnostics: WorkerDiagnostics::default(),
        }
    }

    /// Attach the retrieval collaborator. Only consulted when
    /// `SessionConfig::retrieval` is set.
    pub fn with_retrieval(mut self, retrieval: Arc<dyn Retrieval>) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Spawn the worker loop on the current Tokio runtime.
    ///
    /// Returns `false` without side effects when a loop is already live; the
    /// existing loop picks up newly queued text on its next poll.
    pub fn start(self: &Arc<Self>) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("worker already running, start ignored");
            return false;
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        tokio::spawn(worker::run(Arc::clone(self)));
        info!("session worker started");
        true
    }

    /// Ask the worker loop to exit after its current cycle.
    pub fn stop(&self) {
        if self.running.load(Ordering::SeqCst) {
            self.stop_requested.store(true, Ordering::SeqCst);
            info!("session worker stop requested");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Queue text for the next cycle. Never waits on the worker.
    pub fn submit_text(&self, text: &str) {
        self.pending.append(text);
        debug!(
            chars = text.len(),
            pending = self.pending.len(),
            "text queued"
        );
    }

    /// Transcribe an audio chunk and queue every recognised segment.
    ///
    /// Failures are per-chunk; nothing is queued when transcription fails.
    pub async fn submit_audio(&self, audio: Vec<u8>) -> Result<Vec<TranscriptSegment>> {
        let transcriber = self
            .transcriber
            .as_ref()
            .ok_or(TipstreamError::NoTranscriber)?;
        let segments = worker::bounded(
            self.config.remote_timeout,
            "transcription",
            transcriber.transcribe(audio),
        )
        .await?;
        for segment in &segments {
            self.pending.append(&segment.text);
        }
        debug!(segments = segments.len(), "audio chunk transcribed");
        Ok(segments)
    }

    pub fn has_transcriber(&self) -> bool {
        self.transcriber.is_some()
    }

    /// Register a subscriber for tip events.
    pub fn subscribe(&self) -> Subscription {
        self.registry.subscribe()
    }

    /// Remove a subscriber; unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.registry.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Whether the remote conversation has been created at least once.
    pub fn is_ready(&self) -> bool {
        self.conversation.initialized()
    }

    /// Characters waiting for the next drain.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Current worker state (snapshot).
    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    /// Subscribe to worker state transitions.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Snapshot of worker counters for observability.
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    /// The conversation handle, creating it on first use.
    ///
    /// Concurrent first uses share a single creation call.
    async fn conversation(&self) -> Result<&ConversationState> {
        self.conversation
            .get_or_try_init(|| async {
                let state = worker::bounded(
                    self.config.remote_timeout,
                    "conversation creation",
                    self.completion.create_conversation(),
                )
                .await
                .map_err(|e| match e {
                    TipstreamError::ConversationInit(_) | TipstreamError::Timeout { .. } => e,
                    other => TipstreamError::ConversationInit(other.to_string()),
                })?;
                self.diagnostics
                    .conversations_created
                    .fetch_add(1, Ordering::Relaxed);
                info!(conversation_id = %state.id, "conversation ready");
                Ok(state)
            })
            .await
    }

    fn set_status(&self, status: SessionStatus, cycle: u64, detail: Option<String>) {
        *self.status.lock() = status;
        let _ = self.status_tx.send(SessionStatusEvent {
            status,
            cycle,
            detail,
        });
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("ready", &self.is_ready())
            .field("subscribers", &self.registry.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::inference::{StubCompletion, TextStream};

    struct CountingCompletion {
        creations: AtomicUsize,
        fail_first: AtomicBool,
    }

    #[async_trait]
    impl Completion for CountingCompletion {
        async fn create_conversation(&self) -> Result<ConversationState> {
            self.creations.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail_first.swap(false, Ordering::SeqCst) {
                return Err(TipstreamError::Status {
                    status: 502,
                    body: "bad gateway".into(),
                });
            }
            Ok(ConversationState::new("conv-1"))
        }

        async fn complete(
            &self,
            _state: &ConversationState,
            _prompt: &str,
            _schema: Option<&Value>,
        ) -> Result<String> {
            Ok(String::new())
        }

        async fn stream(
            &self,
            _state: &ConversationState,
            _prompt: &str,
            _schema: Option<&Value>,
        ) -> Result<TextStream> {
            Err(TipstreamError::StreamClosed("unused".into()))
        }
    }

    fn counting(fail_first: bool) -> Arc<CountingCompletion> {
        Arc::new(CountingCompletion {
            creations: AtomicUsize::new(0),
            fail_first: AtomicBool::new(fail_first),
        })
    }

    #[tokio::test]
    async fn concurrent_first_use_creates_one_conversation() {
        let completion = counting(false);
        let session = Arc::new(Session::new(SessionConfig::default(), completion.clone()));

        let calls: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.conversation().await.map(|c| c.id.clone()) })
            })
            .collect();
        for call in calls {
            let id = call.await.expect("task").expect("conversation");
            assert_eq!(id, "conv-1");
        }
        assert_eq!(completion.creations.load(Ordering::SeqCst), 1);
        assert!(session.is_ready());
        assert_eq!(session.diagnostics().conversations_created, 1);
    }

    #[tokio::test]
    async fn failed_creation_leaves_handle_unset_for_retry() {
        let completion = counting(true);
        let session = Session::new(SessionConfig::default(), completion.clone());

        let err = session.conversation().await.expect_err("first creation fails");
        assert!(matches!(err, TipstreamError::ConversationInit(_)));
        assert!(!session.is_ready());

        let state = session.conversation().await.expect("retry succeeds");
        assert_eq!(state.id, "conv-1");
        assert_eq!(completion.creations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_starts_spawn_exactly_one_worker() {
        let session = Arc::new(Session::new(
            SessionConfig::default(),
            Arc::new(StubCompletion::new()),
        ));
        let starts: Vec<_> = (0..16)
            .map(|_| {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.start() })
            })
            .collect();
        let mut started = 0;
        for s in starts {
            if s.await.expect("task") {
                started += 1;
            }
        }
        assert_eq!(started, 1);
        assert!(session.is_running());
        session.stop();
    }

    #[tokio::test]
    async fn audio_without_transcriber_is_rejected() {
        let session = Session::new(SessionConfig::default(), Arc::new(StubCompletion::new()));
        let err = session.submit_audio(vec![0u8; 32]).await.expect_err("no transcriber");
        assert!(matches!(err, TipstreamError::NoTranscriber));
        assert_eq!(session.pending_len(), 0);
    }
}
