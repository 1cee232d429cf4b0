//! JSON-lines wire protocol spoken with the voice gateway.
//!
//! Message shapes follow the live voice API: one `setup` message opens the
//! session, `realtimeInput` carries microphone audio upstream and
//! `serverContent` carries model audio and turn signals downstream.

use crate::audio::codec;
use crate::defaults;
use crate::transport::TransportEvent;
use serde::{Deserialize, Serialize};

/// Session parameters sent in the opening `setup` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSetup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
}

impl SessionSetup {
    /// Audio-only session with a prebuilt voice.
    pub fn new(model: impl Into<String>, voice: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice.into(),
                        },
                    },
                },
            },
            system_instruction: None,
        }
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        let instruction = instruction.into();
        self.system_instruction = (!instruction.is_empty()).then_some(instruction);
        self
    }

    pub fn voice_name(&self) -> &str {
        &self
            .generation_config
            .speech_config
            .voice_config
            .prebuilt_voice_config
            .voice_name
    }
}

impl Default for SessionSetup {
    fn default() -> Self {
        Self::new(defaults::DEFAULT_MODEL, defaults::DEFAULT_VOICE)
            .with_system_instruction(defaults::DEFAULT_SYSTEM_INSTRUCTION)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// Base64 audio with its mime type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

/// Messages sent by the client to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SessionSetup),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    /// Wrap little-endian PCM bytes as a realtime input message.
    pub fn audio(pcm: &[u8], mime_type: &str) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: mime_type.to_string(),
                data: codec::to_transport_text(pcm),
            }],
        })
    }

    /// Serialize message to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize message from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

/// Messages sent by the gateway. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_content: Option<ServerContent>,
}

impl ServerMessage {
    pub fn setup_complete() -> Self {
        Self {
            setup_complete: Some(serde_json::json!({})),
            ..Self::default()
        }
    }

    /// One model-turn part carrying base64 audio.
    pub fn audio(data: impl Into<String>, mime_type: Option<&str>) -> Self {
        Self {
            server_content: Some(ServerContent {
                model_turn: Some(ModelTurn {
                    parts: vec![Part {
                        inline_data: Some(InlineData {
                            mime_type: mime_type.map(str::to_string),
                            data: data.into(),
                        }),
                    }],
                }),
                ..ServerContent::default()
            }),
            ..Self::default()
        }
    }

    pub fn interrupted() -> Self {
        Self {
            server_content: Some(ServerContent {
                interrupted: true,
                ..ServerContent::default()
            }),
            ..Self::default()
        }
    }

    pub fn turn_complete() -> Self {
        Self {
            server_content: Some(ServerContent {
                turn_complete: true,
                ..ServerContent::default()
            }),
            ..Self::default()
        }
    }

    /// Flatten into transport events.
    ///
    /// Audio parts come first, then `Interrupted`, then `TurnComplete`, so a
    /// message that carries both audio and an interrupt ends silent.
    pub fn into_events(self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        let Some(content) = self.server_content else {
            return events;
        };

        if let Some(turn) = content.model_turn {
            for inline in turn.parts.into_iter().filter_map(|p| p.inline_data) {
                events.push(TransportEvent::Audio {
                    data: inline.data,
                    mime_type: inline.mime_type,
                });
            }
        }
        if content.interrupted {
            events.push(TransportEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(TransportEvent::TurnComplete);
        }
        events
    }

    /// Serialize message to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize message from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Extract the sample rate from a mime type such as `audio/pcm;rate=24000`.
pub fn sample_rate_from_mime(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .filter(|&rate| rate > 0)
}
