//! tipstream: HTTP/WebSocket host for the live-assistant session.

mod routes;
mod settings;
mod state;

use std::sync::Arc;

use anyhow::Context;
use tipstream_core::{
    Completion, ConversationClient, ConversationClientConfig, HttpRetrieval, HttpTranscriber,
    Session, StubCompletion,
};
use tracing::{info, warn};

use crate::settings::{default_settings_path, load_settings, AppSettings};
use crate::state::AppState;

const DEFAULT_LOG_FILTER: &str = "tipstream=info,tipstream_core=info,tower_http=info";

fn build_session(settings: &AppSettings) -> anyhow::Result<Session> {
    let completion: Arc<dyn Completion> = match &settings.api_key {
        Some(key) => {
            let mut config = ConversationClientConfig::new(key.clone());
            config.base_url = settings.completion_base_url.clone();
            config.model = settings.completion_model.clone();
            config.agent_id = settings.completion_agent_id.clone();
            Arc::new(ConversationClient::new(config).context("building completion client")?)
        }
        None => {
            warn!("no API key configured, using StubCompletion");
            Arc::new(StubCompletion::new())
        }
    };

    let mut session = Session::new(settings.session_config(), completion);
    if let Some((base_url, retrieval)) = settings.retrieval() {
        info!(
            base_url = %base_url,
            corpus = %retrieval.corpus_id,
            top_n = retrieval.top_n,
            "rule retrieval enabled"
        );
        session = session.with_retrieval(Arc::new(HttpRetrieval::new(base_url)));
    }
    if let Some(url) = &settings.transcriber_url {
        info!(url = %url, "audio transcription enabled");
        session = session.with_transcriber(Arc::new(HttpTranscriber::new(url.clone())));
    }
    Ok(session)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    info!("tipstream starting");
    let settings_path = default_settings_path();
    let settings = load_settings(&settings_path);
    let runtime = settings.runtime_settings();
    info!(
        settings_path = ?settings_path,
        bind_addr = %runtime.bind_addr,
        model = %runtime.completion_model,
        has_api_key = runtime.has_api_key,
        retrieval = runtime.retrieval_enabled,
        transcriber = runtime.transcriber_enabled,
        lenient_partials = runtime.lenient_partials,
        "runtime settings loaded"
    );

    // ── Session ───────────────────────────────────────────────────────────
    let session = Arc::new(build_session(&settings)?);
    if settings.autostart {
        session.start();
    }

    // ── HTTP ──────────────────────────────────────────────────────────────
    let app = routes::router(AppState::new(Arc::clone(&session), runtime));
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("binding {}", settings.bind_addr))?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    session.stop();
    info!("tipstream stopped");
    Ok(())
}
