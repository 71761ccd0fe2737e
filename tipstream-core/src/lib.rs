//! # tipstream-core
//!
//! Live-assistant pipeline: conversation text in, structured tips out.
//!
//! ## Architecture
//!
//! ```text
//! ingress (text / audio) ──append──► PendingText
//!                                        │ drain_all (one per cycle)
//!                                        ▼
//!                                 worker task (single flight)
//!                                        │ Completion::stream
//!                                        ▼
//!                        decode / decode_lenient → TipMerger
//!                                        │ TipEvent JSON
//!                                        ▼
//!                               BroadcastRegistry ──► subscribers
//! ```
//!
//! Ingress never waits on generation. Text that arrives while a call is in
//! flight is coalesced into the next cycle.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod broadcast;
pub mod buffering;
pub mod decode;
pub mod engine;
pub mod error;
pub mod inference;
pub mod ipc;

// Convenience re-exports for downstream crates
pub use broadcast::{BroadcastRegistry, SubscriberId, Subscription};
pub use buffering::PendingText;
pub use decode::{decode, decode_lenient, TipMerger};
pub use engine::{DiagnosticsSnapshot, RetrievalConfig, Session, SessionConfig};
pub use error::{Result, TipstreamError};
pub use inference::{
    Completion, ConversationClient, ConversationClientConfig, ConversationState, HttpRetrieval,
    HttpTranscriber, Retrieval, StubCompletion, TextStream, Transcriber,
};
pub use ipc::events::{
    SessionStatus, SessionStatusEvent, TipDocument, TipEvent, TipKind, TranscriptSegment,
    WordTiming,
};
