//! Wire protocol spoken with the remote conversational agent.
//!
//! ## Frames
//!
//! Client frames (sent over the duplex channel):
//! - `setup` — model, audio response modality, voice, system instruction,
//!   retrieval tool, transcription toggles. Sent once, first.
//! - `realtimeInput` — one or more base64 PCM16 microphone chunks.
//!
//! Server frames (received):
//! - `setupComplete` — the session is live; uplink may start sending.
//! - `serverContent` — any combination of synthesized audio parts, grounding
//!   metadata, input/output transcription deltas, `turnComplete`,
//!   `interrupted`.
//! - `toolCall` — the agent invoked a tool (retrieval) mid-turn.
//! - `error` — terminal protocol error with a code and message.
//!
//! Inbound JSON is validated here, at the boundary, into the closed
//! [`ServerEvent`] enum. A frame that matches none of the known shapes is
//! logged and dropped; unknown fields inside known shapes are ignored.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::EncodedChunk;
use crate::events::GroundingCitation;

// ---------------------------------------------------------------------------
// Client → agent
// ---------------------------------------------------------------------------

/// Outbound frame. Externally tagged: `{"setup": …}` / `{"realtimeInput": …}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupPayload),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    /// Wrap one microphone chunk for sending.
    pub fn audio(chunk: EncodedChunk) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![chunk],
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    /// Empty object opts in to live transcription of the person's speech.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<EmptyConfig>,
    /// Empty object opts in to live transcription of the agent's speech.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<EmptyConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub parts: Vec<TextPart>,
}

impl Content {
    pub fn from_text(text: &str) -> Self {
        Self {
            parts: vec![TextPart { text: text.into() }],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Tool declaration. Only the built-in web retrieval tool is used.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub google_search: Option<EmptyConfig>,
}

impl Tool {
    pub fn web_search() -> Self {
        Self {
            google_search: Some(EmptyConfig {}),
        }
    }
}

/// Serializes as `{}` — presence-is-the-signal configuration objects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyConfig {}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<EncodedChunk>,
}

// ---------------------------------------------------------------------------
// Agent → client: validated event vocabulary
// ---------------------------------------------------------------------------

/// Every inbound protocol event the engine reacts to. Closed set — anything
/// the wire carries that does not map here is dropped at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Setup acknowledged; the uplink may start sending audio.
    SetupComplete,
    /// One chunk of synthesized agent speech.
    Audio(EncodedChunk),
    /// Transcription of the person's speech. Replace-semantics.
    InputTranscription(String),
    /// Transcription delta of the agent's speech. Append-semantics.
    OutputTranscription(String),
    /// The agent finished its turn.
    TurnComplete,
    /// The person started speaking over the agent — stop all playback.
    Interrupted,
    /// The agent started a tool invocation (retrieval).
    ToolInvocation { name: String },
    /// Web sources the agent consulted, in arrival order.
    GroundingCitations(Vec<GroundingCitation>),
    /// Terminal protocol error.
    ServerError { code: Option<i64>, message: String },
}

// Wire mirrors. Unknown fields are ignored; absent fields are None.

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerFrame {
    setup_complete: Option<EmptyConfig>,
    server_content: Option<ServerContent>,
    tool_call: Option<ToolCall>,
    error: Option<WireError>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
    turn_complete: Option<bool>,
    interrupted: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<WirePart>,
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    inline_data: Option<EncodedChunk>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GroundingChunk {
    web: Option<WebSource>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WebSource {
    uri: Option<String>,
    title: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ToolCall {
    #[serde(default)]
    function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FunctionCall {
    name: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WireError {
    code: Option<i64>,
    message: Option<String>,
}

/// Parse one inbound frame into zero or more [`ServerEvent`]s.
///
/// A single `serverContent` frame may carry audio, transcription deltas, and
/// turn markers together; events are emitted in that order. Malformed JSON or
/// a frame matching no known shape yields an empty vec and a debug log.
pub fn parse_server_frame(raw: &str) -> Vec<ServerEvent> {
    let frame: ServerFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("dropping unparseable server frame: {e}");
            return Vec::new();
        }
    };

    let mut events = Vec::new();

    if frame.setup_complete.is_some() {
        events.push(ServerEvent::SetupComplete);
    }

    if let Some(content) = frame.server_content {
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(chunk) = part.inline_data {
                    events.push(ServerEvent::Audio(chunk));
                }
            }

            if let Some(meta) = turn.grounding_metadata {
                let citations: Vec<GroundingCitation> = meta
                    .grounding_chunks
                    .into_iter()
                    .filter_map(|c| c.web)
                    .filter_map(|w| {
                        w.uri.map(|uri| GroundingCitation {
                            uri,
                            title: w.title,
                        })
                    })
                    .collect();
                if !citations.is_empty() {
                    events.push(ServerEvent::GroundingCitations(citations));
                }
            }
        }

        if let Some(t) = content.input_transcription {
            events.push(ServerEvent::InputTranscription(t.text));
        }
        if let Some(t) = content.output_transcription {
            events.push(ServerEvent::OutputTranscription(t.text));
        }
        if content.turn_complete == Some(true) {
            events.push(ServerEvent::TurnComplete);
        }
        if content.interrupted == Some(true) {
            events.push(ServerEvent::Interrupted);
        }
    }

    if let Some(call) = frame.tool_call {
        for function in call.function_calls {
            events.push(ServerEvent::ToolInvocation {
                name: function.name,
            });
        }
    }

    if let Some(err) = frame.error {
        events.push(ServerEvent::ServerError {
            code: err.code,
            message: err.message.unwrap_or_else(|| "unspecified".into()),
        });
    }

    if events.is_empty() {
        debug!("server frame matched no known event shape");
    }
    events
}

#[derive(Debug, Deserialize)]
struct Transcription {
    text: String,
}
