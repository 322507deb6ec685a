//! Event types broadcast to the embedding host.
//!
//! A host subscribes through `LiveSession::subscribe_state`,
//! `subscribe_transcript`, and `subscribe_activity`. All types serialize with
//! camelCase fields so a frontend can forward them over whatever IPC it uses
//! without renaming.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Session state events
// ---------------------------------------------------------------------------

/// Emitted whenever the session lifecycle advances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStateEvent {
    pub phase: SessionPhase,
    /// Human-readable detail; set when `phase` is `Error`.
    pub detail: Option<String>,
}

/// Coarse lifecycle phase of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// Session constructed, `start()` not yet called.
    Idle,
    /// Devices and transport are being acquired; setup not yet acknowledged.
    Connecting,
    /// Duplex streaming is live.
    Active,
    /// Terminal failure — construct a new session to retry.
    Error,
    /// Terminal clean shutdown.
    Closed,
}

// ---------------------------------------------------------------------------
// Transcript events
// ---------------------------------------------------------------------------

/// Snapshot of the running conversation text, emitted on every change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// What the person is currently saying. Each transcription event from the
    /// agent replaces this wholesale.
    pub user_utterance: String,
    /// What the agent has said so far this turn; deltas append.
    pub agent_utterance: String,
    /// Web sources the agent consulted mid-turn, in arrival order.
    pub citations: Vec<GroundingCitation>,
    /// True while the agent is running its retrieval tool.
    pub searching: bool,
}

/// A web source reference surfaced by the agent's retrieval tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundingCitation {
    pub uri: String,
    pub title: Option<String>,
}

// ---------------------------------------------------------------------------
// Microphone activity events
// ---------------------------------------------------------------------------

/// Emitted once per encoded capture frame so a host can render a level meter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioActivityEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Root-mean-square level of the frame in [0.0, 1.0].
    pub rms: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_event_serializes_with_lowercase_phase() {
        let event = SessionStateEvent {
            phase: SessionPhase::Connecting,
            detail: None,
        };

        let json = serde_json::to_value(&event).expect("serialize state event");
        assert_eq!(json["phase"], "connecting");
        assert_eq!(json["detail"], serde_json::Value::Null);

        let round_trip: SessionStateEvent =
            serde_json::from_value(json).expect("deserialize state event");
        assert_eq!(round_trip.phase, SessionPhase::Connecting);
    }

    #[test]
    fn transcript_event_serializes_with_camel_case_fields() {
        let event = TranscriptEvent {
            seq: 4,
            user_utterance: "what's the weather".into(),
            agent_utterance: "Checking".into(),
            citations: vec![GroundingCitation {
                uri: "https://example.com/forecast".into(),
                title: Some("Forecast".into()),
            }],
            searching: true,
        };

        let json = serde_json::to_value(&event).expect("serialize transcript event");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["userUtterance"], "what's the weather");
        assert_eq!(json["agentUtterance"], "Checking");
        assert_eq!(json["citations"][0]["uri"], "https://example.com/forecast");
        assert_eq!(json["searching"], true);
    }

    #[test]
    fn citation_title_may_be_absent() {
        let json = serde_json::json!({ "uri": "https://example.com" });
        let citation: GroundingCitation = serde_json::from_value(json).expect("deserialize");
        assert_eq!(citation.uri, "https://example.com");
        assert!(citation.title.is_none());
    }
}
