//! The coalescing worker loop.
//!
//! One task per session. Each cycle drains everything queued since the last
//! drain and makes exactly one generation call for it, so text that arrives
//! while a call is in flight is folded into the following cycle.
//!
//! ```text
//! Idle ──(pending non-empty)──► Draining ──► [Retrieving] ──► Generating ──► Publishing ──► Idle
//!   ▲                                                              │
//!   └──────────────────────(failure: log, drop cycle)──────────────┘
//! ```

use std::future::Future;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::{
    decode::{decode, decode_lenient, TipMerger},
    engine::{RetrievalConfig, Session},
    error::{Result, TipstreamError},
    inference::{ConversationState, Retrieval},
    ipc::events::{SessionStatus, TipDocument, TipEvent, TipKind},
};

/// Lead-in for the drained conversation text in the generation prompt.
pub const TALK_PREFIX: &str = "Some people in the group say: ";

/// First-stage prompt asking the model for a rulebook search query.
pub const QUERY_PREFIX: &str = "Write one short search query for the game rules relevant to \
what these people say. Reply with the query only.\n\n";

pub struct WorkerDiagnostics {
    pub cycles_started: AtomicUsize,
    pub cycles_completed: AtomicUsize,
    pub cycles_failed: AtomicUsize,
    pub decode_failures: AtomicUsize,
    pub blank_replies: AtomicUsize,
    pub chars_drained: AtomicUsize,
    pub partials_published: AtomicUsize,
    pub finals_published: AtomicUsize,
    pub conversations_created: AtomicUsize,
}

impl Default for WorkerDiagnostics {
    fn default() -> Self {
        Self {
            cycles_started: AtomicUsize::new(0),
            cycles_completed: AtomicUsize::new(0),
            cycles_failed: AtomicUsize::new(0),
            decode_failures: AtomicUsize::new(0),
            blank_replies: AtomicUsize::new(0),
            chars_drained: AtomicUsize::new(0),
            partials_published: AtomicUsize::new(0),
            finals_published: AtomicUsize::new(0),
            conversations_created: AtomicUsize::new(0),
        }
    }
}

impl WorkerDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            cycles_started: self.cycles_started.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            blank_replies: self.blank_replies.load(Ordering::Relaxed),
            chars_drained: self.chars_drained.load(Ordering::Relaxed),
            partials_published: self.partials_published.load(Ordering::Relaxed),
            finals_published: self.finals_published.load(Ordering::Relaxed),
            conversations_created: self.conversations_created.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub cycles_started: usize,
    pub cycles_completed: usize,
    pub cycles_failed: usize,
    pub decode_failures: usize,
    pub blank_replies: usize,
    pub chars_drained: usize,
    pub partials_published: usize,
    pub finals_published: usize,
    pub conversations_created: usize,
}

/// What a successful cycle produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CycleOutcome {
    partials: usize,
    delivered: usize,
}

/// Await `fut`, failing with `Timeout` after `after`.
pub(crate) async fn bounded<T>(
    after: Duration,
    what: &'static str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| TipstreamError::Timeout { what, after })?
}

/// Generation prompt: numbered rule snippets (if any), then the talk.
pub fn build_prompt(text: &str, snippets: &[String]) -> String {
    let mut prompt = String::new();
    if !snippets.is_empty() {
        prompt.push_str("Relevant game rules:\n");
        for (i, snippet) in snippets.iter().enumerate() {
            prompt.push_str(&format!("[{}] {}\n", i + 1, snippet.trim()));
        }
        prompt.push('\n');
    }
    prompt.push_str(TALK_PREFIX);
    prompt.push_str(text);
    prompt
}

/// Worker entry point. Runs until `Session::stop` is observed.
pub(crate) async fn run(session: Arc<Session>) {
    let mut ticker = tokio::time::interval(session.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    session.set_status(SessionStatus::Idle, 0, None);

    loop {
        ticker.tick().await;
        if session.stop_requested.load(Ordering::SeqCst) {
            break;
        }
        if session.pending.is_empty() {
            continue;
        }
        let cycle = session.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        session.set_status(SessionStatus::Draining, cycle, None);
        let Some(text) = session.pending.drain_all() else {
            session.set_status(SessionStatus::Idle, cycle, None);
            continue;
        };
        run_cycle(&session, cycle, text).await;
    }

    session.stop_requested.store(false, Ordering::SeqCst);
    session.running.store(false, Ordering::SeqCst);
    info!("session worker stopped");
}

/// One drain-to-publish pass. Failures are logged and end the cycle; the
/// session always returns to `Idle`.
async fn run_cycle(session: &Session, cycle: u64, text: String) {
    let diag = &session.diagnostics;
    diag.cycles_started.fetch_add(1, Ordering::Relaxed);
    diag.chars_drained.fetch_add(text.len(), Ordering::Relaxed);

    let span = info_span!("cycle", cycle, chars = text.len());
    async {
        let started = Instant::now();
        let detail = match generate(session, cycle, &text).await {
            Ok(outcome) => {
                diag.cycles_completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    partials = outcome.partials,
                    delivered = outcome.delivered,
                    "cycle complete"
                );
                None
            }
            Err(e @ TipstreamError::Decode { .. }) => {
                diag.decode_failures.fetch_add(1, Ordering::Relaxed);
                diag.cycles_failed.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "reply never decoded, cycle dropped");
                Some(e.to_string())
            }
            Err(e) if e.is_transient() => {
                diag.cycles_failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "cycle abandoned");
                Some(e.to_string())
            }
            Err(e) => {
                diag.cycles_failed.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "cycle failed");
                Some(e.to_string())
            }
        };
        session.set_status(SessionStatus::Idle, cycle, detail);
    }
    .instrument(span)
    .await
}

async fn generate(session: &Session, cycle: u64, text: &str) -> Result<CycleOutcome> {
    let timeout = session.config.remote_timeout;
    let conversation = session.conversation().await?;

    let prompt = match (&session.config.retrieval, &session.retrieval) {
        (Some(config), Some(retrieval)) => {
            session.set_status(SessionStatus::Retrieving, cycle, None);
            let snippets = retrieve(session, conversation, config, retrieval.as_ref(), text).await?;
            build_prompt(text, &snippets)
        }
        _ => build_prompt(text, &[]),
    };

    session.set_status(SessionStatus::Generating, cycle, None);
    let schema = TipDocument::output_schema();
    let mut stream = bounded(
        timeout,
        "completion request",
        session
            .completion
            .stream(conversation, &prompt, Some(&schema)),
    )
    .await?;

    let deadline = Instant::now() + session.config.stream_deadline;
    let mut buffer = String::new();
    let mut merger = TipMerger::new();
    let mut partials = 0;
    loop {
        let gap_deadline = (Instant::now() + timeout).min(deadline);
        let next = tokio::time::timeout_at(gap_deadline.into(), stream.next())
            .await
            .map_err(|_| {
                if Instant::now() >= deadline {
                    TipstreamError::Timeout {
                        what: "completion stream deadline",
                        after: session.config.stream_deadline,
                    }
                } else {
                    TipstreamError::Timeout {
                        what: "completion stream",
                        after: timeout,
                    }
                }
            })?;
        let chunk = match next {
            None => break,
            Some(chunk) => chunk?,
        };
        buffer.push_str(&chunk);
        trace!(buffered = buffer.len(), "increment received");

        // A buffer that already decodes strictly is the terminal document;
        // it goes out once, as the final.
        if !session.config.lenient_partials || decode(&buffer).is_some() {
            continue;
        }
        if let Some(update) = decode_lenient(&buffer) {
            if merger.merge(update) {
                partials += 1;
                publish(session, cycle, TipKind::Partial, merger.current());
            }
        }
    }

    let Some(complete) = decode(&buffer) else {
        return Err(TipstreamError::Decode {
            chars: buffer.len(),
        });
    };
    merger.merge(complete);
    if merger.current().is_blank() {
        session
            .diagnostics
            .blank_replies
            .fetch_add(1, Ordering::Relaxed);
        warn!(partials, "reply decoded to an empty tip, nothing published");
        return Ok(CycleOutcome {
            partials,
            delivered: 0,
        });
    }

    session.set_status(SessionStatus::Publishing, cycle, None);
    let delivered = publish(session, cycle, TipKind::Final, merger.current());
    Ok(CycleOutcome {
        partials,
        delivered,
    })
}

/// First-stage call for a search query, then the snippet lookup.
async fn retrieve(
    session: &Session,
    conversation: &ConversationState,
    config: &RetrievalConfig,
    retrieval: &dyn Retrieval,
    text: &str,
) -> Result<Vec<String>> {
    let timeout = session.config.remote_timeout;
    let query_prompt = format!("{QUERY_PREFIX}{text}");
    let derived = bounded(
        timeout,
        "query derivation",
        session.completion.complete(conversation, &query_prompt, None),
    )
    .await?;
    let query = match derived.trim() {
        "" => text.trim(),
        q => q,
    };
    debug!(query, corpus = %config.corpus_id, "retrieving rule snippets");

    let snippets = bounded(
        timeout,
        "retrieval query",
        retrieval.query(&config.corpus_id, query, config.top_n),
    )
    .await
    .map_err(|e| match e {
        TipstreamError::Timeout { .. } | TipstreamError::Retrieval(_) => e,
        other => TipstreamError::Retrieval(other.to_string()),
    })?;
    debug!(snippets = snippets.len(), "rule snippets retrieved");
    Ok(snippets)
}

/// Serialize and fan out one tip event. Returns the number of subscribers
/// that accepted it.
fn publish(session: &Session, cycle: u64, kind: TipKind, tip: &TipDocument) -> usize {
    let event = TipEvent {
        seq: session.seq.fetch_add(1, Ordering::Relaxed),
        cycle,
        kind,
        tip: tip.clone(),
    };
    let message = match serde_json::to_string(&event) {
        Ok(message) => message,
        Err(e) => {
            error!(error = %e, "tip event serialization failed");
            return 0;
        }
    };
    let delivered = session.registry.publish(&message);
    let counter = match kind {
        TipKind::Partial => &session.diagnostics.partials_published,
        TipKind::Final => &session.diagnostics.finals_published,
    };
    counter.fetch_add(1, Ordering::Relaxed);
    debug!(?kind, seq = event.seq, delivered, "tip published");
    delivered
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use futures_util::stream;
    use parking_lot::Mutex;
    use serde_json::Value;

    use super::*;
    use crate::engine::SessionConfig;
    use crate::inference::{Completion, TextStream};

    /// Replies with one scripted chunk list per `stream` call.
    struct ScriptedCompletion {
        replies: Mutex<VecDeque<Result<Vec<&'static str>>>>,
        prompts: Mutex<Vec<String>>,
        query: &'static str,
    }

    impl ScriptedCompletion {
        fn new(replies: Vec<Result<Vec<&'static str>>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
                query: "",
            })
        }
    }

    #[async_trait]
    impl Completion for ScriptedCompletion {
        async fn create_conversation(&self) -> Result<ConversationState> {
            Ok(ConversationState::new("scripted"))
        }

        async fn complete(
            &self,
            _state: &ConversationState,
            prompt: &str,
            _schema: Option<&Value>,
        ) -> Result<String> {
            self.prompts.lock().push(prompt.to_string());
            Ok(self.query.to_string())
        }

        async fn stream(
            &self,
            _state: &ConversationState,
            prompt: &str,
            _schema: Option<&Value>,
        ) -> Result<TextStream> {
            self.prompts.lock().push(prompt.to_string());
            let reply = self
                .replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))?;
            Ok(stream::iter(reply.into_iter().map(|c| Ok(c.to_string()))).boxed())
        }
    }

    struct FixedRetrieval(Vec<String>);

    #[async_trait]
    impl Retrieval for FixedRetrieval {
        async fn query(&self, _corpus: &str, _query: &str, top_n: usize) -> Result<Vec<String>> {
            Ok(self.0.iter().take(top_n).cloned().collect())
        }
    }

    fn events(sub: &mut crate::broadcast::Subscription) -> Vec<TipEvent> {
        let mut out = Vec::new();
        while let Ok(msg) = sub.receiver.try_recv() {
            out.push(serde_json::from_str(&msg).expect("tip event json"));
        }
        out
    }

    #[test]
    fn prompt_numbers_snippets_in_order() {
        let prompt = build_prompt(
            "we sneak past the guard",
            &["Stealth uses Dexterity".into(), " Passive Perception ".into()],
        );
        assert_eq!(
            prompt,
            "Relevant game rules:\n[1] Stealth uses Dexterity\n[2] Passive Perception\n\n\
             Some people in the group say: we sneak past the guard"
        );
        assert_eq!(
            build_prompt("hello", &[]),
            "Some people in the group say: hello"
        );
    }

    #[tokio::test]
    async fn bounded_reports_what_timed_out() {
        let err = bounded(Duration::from_millis(10), "slow thing", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .expect_err("times out");
        match err {
            TipstreamError::Timeout { what, .. } => assert_eq!(what, "slow thing"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn strict_cycle_publishes_one_final() {
        let completion = ScriptedCompletion::new(vec![Ok(vec![
            r#"{"readThisTextToYourPlayers": "A co"#,
            r#"ld draft blows out the torches", "relatedGameRule": "Darkness", "#,
            r#""whatCouldHappenNext": "Something moves", "summaryOfWhatWasSaid": ""}"#,
        ])]);
        let session = Session::new(SessionConfig::default(), completion);
        let mut sub = session.subscribe();

        run_cycle(&session, 1, "we light a torch".into()).await;

        let received = events(&mut sub);
        assert_eq!(received.len(), 1, "strict mode sends the final only");
        assert_eq!(received[0].kind, TipKind::Final);
        let tip = &received[0].tip;
        assert_eq!(
            tip.read_this_text_to_your_players,
            "A cold draft blows out the torches"
        );
        assert_eq!(tip.related_game_rule, "Darkness");
        assert_eq!(tip.what_could_happen_next, "Something moves");
        assert_eq!(session.status(), SessionStatus::Idle);
        let diag = session.diagnostics();
        assert_eq!(diag.cycles_completed, 1);
        assert_eq!(diag.partials_published, 0);
        assert_eq!(diag.finals_published, 1);
    }

    #[tokio::test]
    async fn lenient_cycle_never_regresses_a_field() {
        let completion = ScriptedCompletion::new(vec![Ok(vec![
            r#"{"readThisTextToYourPlayers": "A co"#,
            r#"ld draft", "relatedGameRule": ""#,
            r#"Darkness", "whatCouldHappenNext": "", "summaryOfWhatWasSaid": "torch"}"#,
        ])]);
        let config = SessionConfig {
            lenient_partials: true,
            ..SessionConfig::default()
        };
        let session = Session::new(config, completion);
        let mut sub = session.subscribe();

        run_cycle(&session, 1, "we light a torch".into()).await;

        let received = events(&mut sub);
        assert!(received.len() >= 3, "expected partials before the final");
        assert_eq!(received[0].kind, TipKind::Partial);
        assert_eq!(received[0].tip.read_this_text_to_your_players, "A co");
        let mut seen_read = false;
        for event in &received {
            let read = &event.tip.read_this_text_to_your_players;
            assert!(!(seen_read && read.is_empty()), "field regressed to empty");
            seen_read |= !read.is_empty();
        }
        assert!(received.windows(2).all(|w| w[0].seq < w[1].seq));
        let finals = received.iter().filter(|e| e.kind == TipKind::Final).count();
        assert_eq!(finals, 1);
        let last = received.last().expect("final");
        assert_eq!(last.kind, TipKind::Final);
        assert_eq!(last.tip.read_this_text_to_your_players, "A cold draft");
        assert_eq!(last.tip.summary_of_what_was_said, "torch");
    }

    #[tokio::test]
    async fn undecodable_reply_counts_a_decode_failure() {
        let completion = ScriptedCompletion::new(vec![Ok(vec![r#"{"readThis"#, "oops"])]);
        let session = Session::new(SessionConfig::default(), completion);
        let mut sub = session.subscribe();

        run_cycle(&session, 1, "hello".into()).await;

        assert!(events(&mut sub).is_empty());
        let diag = session.diagnostics();
        assert_eq!(diag.decode_failures, 1);
        assert_eq!(diag.cycles_failed, 1);
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn empty_tip_is_not_published() {
        let completion = ScriptedCompletion::new(vec![Ok(vec!["{", "}"])]);
        let session = Session::new(SessionConfig::default(), completion);
        let mut sub = session.subscribe();

        run_cycle(&session, 1, "hmm".into()).await;

        assert!(events(&mut sub).is_empty());
        let diag = session.diagnostics();
        assert_eq!(diag.blank_replies, 1);
        assert_eq!(diag.finals_published, 0);
        assert_eq!(diag.cycles_completed, 1);
        assert_eq!(diag.cycles_failed, 0);
    }

    /// Sends a whitespace increment every `every`, never finishing.
    struct DrippingCompletion {
        every: Duration,
    }

    #[async_trait]
    impl Completion for DrippingCompletion {
        async fn create_conversation(&self) -> Result<ConversationState> {
            Ok(ConversationState::new("dripping"))
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
            let every = self.every;
            Ok(stream::unfold((), move |()| async move {
                tokio::time::sleep(every).await;
                Some((Ok(" ".to_string()), ()))
            })
            .boxed())
        }
    }

    #[tokio::test]
    async fn steady_trickle_still_hits_the_stream_deadline() {
        let completion = Arc::new(DrippingCompletion {
            every: Duration::from_millis(20),
        });
        let config = SessionConfig {
            remote_timeout: Duration::from_millis(200),
            stream_deadline: Duration::from_millis(300),
            ..SessionConfig::default()
        };
        let session = Session::new(config, completion);
        let mut status = session.subscribe_status();

        let started = Instant::now();
        tokio::time::timeout(Duration::from_secs(5), run_cycle(&session, 3, "hello".into()))
            .await
            .expect("cycle ends at the deadline");
        assert!(started.elapsed() >= Duration::from_millis(300));

        let mut last = None;
        while let Ok(event) = status.try_recv() {
            last = Some(event);
        }
        let last = last.expect("status event");
        assert_eq!(last.status, SessionStatus::Idle);
        assert!(last
            .detail
            .expect("failure detail")
            .contains("completion stream deadline"));
        assert_eq!(session.diagnostics().cycles_failed, 1);
    }

    #[tokio::test]
    async fn failed_stream_returns_to_idle() {
        let completion = ScriptedCompletion::new(vec![Err(TipstreamError::Status {
            status: 503,
            body: "overloaded".into(),
        })]);
        let session = Session::new(SessionConfig::default(), completion);
        let mut status = session.subscribe_status();

        run_cycle(&session, 7, "hello".into()).await;

        let mut last = None;
        while let Ok(event) = status.try_recv() {
            last = Some(event);
        }
        let last = last.expect("status event");
        assert_eq!(last.status, SessionStatus::Idle);
        assert_eq!(last.cycle, 7);
        assert!(last.detail.expect("failure detail").contains("503"));
        assert_eq!(session.diagnostics().cycles_failed, 1);
    }

    #[tokio::test]
    async fn retrieval_snippets_reach_the_generation_prompt() {
        let completion = Arc::new(ScriptedCompletion {
            replies: Mutex::new(
                vec![Ok(vec![r#"{"readThisTextToYourPlayers": "Roll stealth"}"#])].into(),
            ),
            prompts: Mutex::new(Vec::new()),
            query: "stealth rules",
        });
        let config = SessionConfig {
            retrieval: Some(RetrievalConfig::new("phb")),
            ..SessionConfig::default()
        };
        let session = Session::new(config, completion.clone()).with_retrieval(Arc::new(
            FixedRetrieval(vec!["Hide action".into(), "Stealth check".into()]),
        ));

        run_cycle(&session, 1, "we sneak".into()).await;

        let prompts = completion.prompts.lock().clone();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].starts_with(QUERY_PREFIX));
        assert!(prompts[0].ends_with("we sneak"));
        assert!(prompts[1].contains("[1] Hide action\n[2] Stealth check"));
        assert!(prompts[1].ends_with("Some people in the group say: we sneak"));
        assert_eq!(session.diagnostics().cycles_completed, 1);
    }
}
