//! HTTP and WebSocket ingress.
//!
//! | Route | Behaviour |
//! |-------|-----------|
//! | `POST /`, `POST /talk` | queue `words_spoken`, reply 202 at once |
//! | `POST /audio` | transcribe a raw audio body, queue the text |
//! | `GET /listen` | WebSocket: binary audio in, transcriptions out |
//! | `GET /ws` | WebSocket: tip event subscription |
//! | `GET /`, `GET /health` | liveness and session summary |
//! | `GET /ready` | 200 once the remote conversation exists |
//! | `GET /diagnostics` | counters |

use std::sync::atomic::Ordering;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tipstream_core::{SessionStatus, Subscription, TipstreamError, TranscriptSegment};
use tower_http::{
    cors::{self, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::state::AppState;

pub const ACCEPTED_MESSAGE: &str = "Notification sent in the background";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health).post(notify))
        .route("/talk", post(notify))
        .route("/audio", post(audio))
        .route("/listen", get(listen))
        .route("/ws", get(subscribe))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/diagnostics", get(diagnostics))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods(cors::Any)
                .allow_headers(cors::Any),
        )
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize)]
pub struct Notification {
    pub words_spoken: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: &'static str,
    conversation_ready: bool,
    subscribers: usize,
    worker_running: bool,
    worker_status: SessionStatus,
}

#[derive(Debug, Serialize)]
struct Segments {
    segments: Vec<TranscriptSegment>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ListenReply {
    Transcription { segments: Vec<TranscriptSegment> },
    Error { message: String },
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn notify(State(state): State<AppState>, Json(body): Json<Notification>) -> Response {
    state.session.submit_text(&body.words_spoken);
    state.notifications.fetch_add(1, Ordering::Relaxed);
    state.session.start();
    (
        StatusCode::ACCEPTED,
        Json(json!({ "message": ACCEPTED_MESSAGE })),
    )
        .into_response()
}

async fn audio(State(state): State<AppState>, body: Bytes) -> Response {
    state.audio_chunks.fetch_add(1, Ordering::Relaxed);
    match state.session.submit_audio(body.to_vec()).await {
        Ok(segments) => {
            state.session.start();
            Json(Segments { segments }).into_response()
        }
        Err(TipstreamError::NoTranscriber) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            TipstreamError::NoTranscriber.to_string(),
        ),
        Err(e) => {
            state.audio_failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, bytes = body.len(), "audio chunk transcription failed");
            error_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    let session = &state.session;
    Json(Health {
        status: "ok",
        conversation_ready: session.is_ready(),
        subscribers: session.subscriber_count(),
        worker_running: session.is_running(),
        worker_status: session.status(),
    })
}

async fn ready(State(state): State<AppState>) -> Response {
    let ready = state.session.is_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "ready": ready }))).into_response()
}

async fn diagnostics(State(state): State<AppState>) -> Response {
    Json(state.diagnostics_snapshot()).into_response()
}

async fn listen(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if !state.session.has_transcriber() {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            TipstreamError::NoTranscriber.to_string(),
        );
    }
    ws.on_upgrade(move |socket| handle_listen(socket, state))
}

async fn send_json<T: Serialize>(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    value: &T,
) -> bool {
    let Ok(payload) = serde_json::to_string(value) else {
        return false;
    };
    sender.send(Message::Text(payload.into())).await.is_ok()
}

async fn handle_listen(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    info!("listen socket opened");

    while let Some(frame) = receiver.next().await {
        let data = match frame {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        if data.is_empty() {
            continue;
        }
        state.audio_chunks.fetch_add(1, Ordering::Relaxed);
        let reply = match state.session.submit_audio(data.to_vec()).await {
            Ok(segments) => {
                state.session.start();
                ListenReply::Transcription { segments }
            }
            Err(e) => {
                state.audio_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "listen chunk transcription failed");
                ListenReply::Error {
                    message: e.to_string(),
                }
            }
        };
        if !send_json(&mut sender, &reply).await {
            break;
        }
    }
    info!("listen socket closed");
}

async fn subscribe(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_subscriber(socket, state))
}

async fn handle_subscriber(socket: WebSocket, state: AppState) {
    let Subscription { id, mut receiver } = state.session.subscribe();
    let (mut sender, mut incoming) = socket.split();
    debug!(subscriber = %id, "subscription socket opened");

    loop {
        tokio::select! {
            message = receiver.recv() => {
                // None: the registry dropped this subscriber.
                let Some(message) = message else { break };
                if sender.send(Message::Text(message.to_string().into())).await.is_err() {
                    break;
                }
            }
            frame = incoming.next() => match frame {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.session.unsubscribe(id);
    debug!(subscriber = %id, "subscription socket closed");
}
