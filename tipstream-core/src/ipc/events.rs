//! Event types pushed to subscribers and status observers.
//!
//! ## Channels
//!
//! | Event | Delivered through |
//! |-------|-------------------|
//! | `TipEvent` | `BroadcastRegistry` (one JSON text message per update) |
//! | `SessionStatusEvent` | `Session::subscribe_status` |
//!
//! `TipEvent` flattens the tip fields to the top level so observers can read
//! `readThisTextToYourPlayers` etc. directly off the message.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Tip documents
// ---------------------------------------------------------------------------

/// Structured reply produced by the completion service.
///
/// Every field defaults to empty so a partially populated object still decodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TipDocument {
    /// Narration to read aloud to the table.
    pub read_this_text_to_your_players: String,
    /// Rule citation relevant to what was said.
    pub related_game_rule: String,
    /// Suggested continuation of the scene.
    pub what_could_happen_next: String,
    /// Short recap of the drained conversation.
    pub summary_of_what_was_said: String,
}

/// Wire names of the tip fields, in declaration order.
pub const TIP_FIELDS: [&str; 4] = [
    "readThisTextToYourPlayers",
    "relatedGameRule",
    "whatCouldHappenNext",
    "summaryOfWhatWasSaid",
];

impl TipDocument {
    /// Fields in declaration order, paired with their wire names.
    pub fn fields(&self) -> [(&'static str, &str); 4] {
        [
            (TIP_FIELDS[0], self.read_this_text_to_your_players.as_str()),
            (TIP_FIELDS[1], self.related_game_rule.as_str()),
            (TIP_FIELDS[2], self.what_could_happen_next.as_str()),
            (TIP_FIELDS[3], self.summary_of_what_was_said.as_str()),
        ]
    }

    pub(crate) fn fields_mut(&mut self) -> [&mut String; 4] {
        [
            &mut self.read_this_text_to_your_players,
            &mut self.related_game_rule,
            &mut self.what_could_happen_next,
            &mut self.summary_of_what_was_said,
        ]
    }

    /// True when no field carries text.
    pub fn is_blank(&self) -> bool {
        self.fields().iter().all(|(_, v)| v.trim().is_empty())
    }

    /// JSON schema handed to the completion service as the output format.
    pub fn output_schema() -> Value {
        let properties: serde_json::Map<String, Value> = TIP_FIELDS
            .iter()
            .map(|name| ((*name).to_string(), json!({ "type": "string" })))
            .collect();
        json!({
            "name": "DmTip",
            "strict": true,
            "schema": {
                "title": "DmTip",
                "type": "object",
                "properties": properties,
                "required": TIP_FIELDS,
                "additionalProperties": false,
            }
        })
    }
}

/// Distinguishes progressive updates from the committed end-of-cycle tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TipKind {
    /// Mid-stream update. Fields may still be refined by a later event.
    Partial,
    /// The cycle's decoded document; no further events for this cycle.
    Final,
}

/// Message broadcast to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TipEvent {
    /// Monotonically increasing event sequence number (per session).
    pub seq: u64,
    /// Generation cycle this update belongs to.
    pub cycle: u64,
    pub kind: TipKind,
    #[serde(flatten)]
    pub tip: TipDocument,
}

// ---------------------------------------------------------------------------
// Transcription
// ---------------------------------------------------------------------------

/// One recognised speech segment returned by the transcriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub text: String,
    #[serde(default)]
    pub words: Vec<WordTiming>,
}

/// Word-level timing inside a segment, in seconds from chunk start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

// ---------------------------------------------------------------------------
// Session status events
// ---------------------------------------------------------------------------

/// Worker state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Polling an empty accumulator.
    Idle,
    /// Taking the pending text.
    Draining,
    /// Deriving a query and fetching rule snippets.
    Retrieving,
    /// Awaiting the completion stream.
    Generating,
    /// Pushing the decoded tip to subscribers.
    Publishing,
}

/// Emitted on every worker state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub status: SessionStatus,
    pub cycle: u64,
    /// Optional human-readable detail (e.g. failure reason).
    pub detail: Option<String>,
}
