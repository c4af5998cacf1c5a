//! Realtime wire protocol
//!
//! JSON text frames in both directions, dispatched solely on the `type` tag.
//! Inbound events are a closed tagged union with an explicit [`ServerEvent::Unknown`]
//! variant; payload fields are optional-with-default so an unrecognized shape
//! inside a known type never fails deserialization.

use serde::{Deserialize, Serialize};

use crate::config::{Config, TurnDetectionConfig};

/// Events received from the realtime service
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Service acknowledged the session and assigned an identifier
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: SessionInfo,
    },

    /// Service applied the session configuration
    #[serde(rename = "session.updated")]
    SessionUpdated,

    /// Server VAD detected the start of user speech
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    /// Server VAD detected the end of user speech
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,

    /// Incremental assistant transcript text
    #[serde(rename = "response.audio_transcript.delta")]
    ResponseTextDelta {
        #[serde(default)]
        delta: String,
    },

    /// Final assistant transcript for the turn
    #[serde(rename = "response.audio_transcript.done")]
    ResponseTextDone {
        #[serde(default)]
        transcript: String,
    },

    /// Base64 PCM chunk of assistant audio
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta {
        #[serde(default)]
        delta: String,
    },

    /// Assistant audio stream for the turn is complete
    #[serde(rename = "response.audio.done")]
    ResponseAudioDone,

    /// The whole response (text and audio) is complete
    #[serde(rename = "response.done")]
    ResponseDone,

    /// Final transcription of the user's utterance
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },

    /// Service-reported error payload
    #[serde(rename = "error")]
    ErrorEvent {
        #[serde(default)]
        error: ErrorDetail,
    },

    /// Any type tag this client does not understand
    #[serde(other)]
    Unknown,
}

/// Session details reported by the service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub id: Option<String>,
}

/// Nested error payload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub message: Option<String>,
}

/// Parse an inbound text frame.
///
/// Malformed JSON is logged and dropped (`None`); unknown type tags parse to
/// [`ServerEvent::Unknown`] and are logged at debug level.
#[must_use]
pub fn parse_server_event(text: &str) -> Option<ServerEvent> {
    match serde_json::from_str::<ServerEvent>(text) {
        Ok(ServerEvent::Unknown) => {
            let kind = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(String::from))
                .unwrap_or_default();
            tracing::debug!(kind, "ignoring unrecognized server event");
            Some(ServerEvent::Unknown)
        }
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed server frame");
            None
        }
    }
}

/// Control messages sent to the realtime service
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Configure the session (persona, voice, formats, turn detection)
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Add a conversation item (used to inject delegated answers)
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    /// Ask the service to generate a response
    #[serde(rename = "response.create")]
    ResponseCreate,

    /// Cancel the in-progress response (barge-in)
    #[serde(rename = "response.cancel")]
    ResponseCancel,

    /// Append base64 PCM to the input buffer
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    /// Commit the input buffer as a user turn
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    /// Discard the uncommitted input buffer
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,
}

impl ClientEvent {
    /// Serialize to a wire frame. These shapes cannot fail to serialize.
    #[must_use]
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Session configuration payload
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: TranscriptionConfig,
    pub turn_detection: TurnDetection,
}

impl SessionConfig {
    /// Build the configuration message from client config plus instructions.
    #[must_use]
    pub fn build(config: &Config, instructions: String) -> Self {
        Self {
            modalities: vec!["audio".to_string(), "text".to_string()],
            instructions,
            voice: config.voice.clone(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: TranscriptionConfig {
                model: config.transcription_model.clone(),
            },
            turn_detection: TurnDetection::server_vad(&config.turn_detection),
        }
    }
}

/// Input transcription settings
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionConfig {
    pub model: String,
}

/// Server VAD turn-detection settings
#[derive(Debug, Clone, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl TurnDetection {
    fn server_vad(config: &TurnDetectionConfig) -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: config.threshold,
            prefix_padding_ms: config.prefix_padding_ms,
            silence_duration_ms: config.silence_duration_ms,
        }
    }
}

/// One conversation item in a `conversation.item.create` message
#[derive(Debug, Clone, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

impl ConversationItem {
    /// Build a user-role text message item.
    #[must_use]
    pub fn user_text(text: &str) -> Self {
        Self {
            kind: "message".to_string(),
            role: "user".to_string(),
            content: vec![ContentPart {
                kind: "input_text".to_string(),
                text: text.to_string(),
            }],
        }
    }
}

/// One content part of a conversation item
#[derive(Debug, Clone, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}
