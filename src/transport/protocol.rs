//! JSON frames exchanged with the realtime endpoint.
//!
//! Client frames are externally tagged (`{"setup": {...}}`). Server frames
//! are parsed leniently: every known key is optional and unknown keys are
//! reported back so the caller can log them.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audio::{AudioFrame, InboundAudio};
use crate::config::{ConnectionConfig, Modality};
use crate::error::{VoiceError, VoiceResult};

// ---------------------------------------------------------------------------
// Shared content types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

/// Base64 payload with its MIME type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

impl Blob {
    pub fn decode(&self) -> VoiceResult<InboundAudio> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| VoiceError::Decode(format!("invalid base64 audio payload: {e}")))?;
        Ok(InboundAudio::new(self.mime_type.clone(), bytes))
    }
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupMessage),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
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
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

impl ClientMessage {
    pub fn to_json(&self) -> VoiceResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Setup frame announcing model, modalities, voice and instruction.
pub fn setup_frame(config: &ConnectionConfig) -> ClientMessage {
    let system_instruction = (!config.system_instruction.is_empty()).then(|| Content {
        role: None,
        parts: vec![Part {
            text: Some(config.system_instruction.clone()),
            inline_data: None,
        }],
    });
    let speech_config = config.voice_name.as_ref().map(|voice| SpeechConfig {
        voice_config: VoiceConfig {
            prebuilt_voice_config: PrebuiltVoiceConfig {
                voice_name: voice.clone(),
            },
        },
    });
    ClientMessage::Setup(SetupMessage {
        model: config.model.clone(),
        generation_config: GenerationConfig {
            response_modalities: config.response_modalities.clone(),
            speech_config,
        },
        system_instruction,
    })
}

/// One captured microphone frame as base64 PCM.
pub fn realtime_input_frame(frame: &AudioFrame) -> ClientMessage {
    ClientMessage::RealtimeInput(RealtimeInput {
        media_chunks: vec![Blob {
            mime_type: frame.mime_type(),
            data: base64::engine::general_purpose::STANDARD.encode(frame.to_le_bytes()),
        }],
    })
}

/// A typed user turn, marked complete.
pub fn client_content_frame(text: &str) -> ClientMessage {
    ClientMessage::ClientContent(ClientContent {
        turns: vec![Content {
            role: Some("user".into()),
            parts: vec![Part {
                text: Some(text.to_string()),
                inline_data: None,
            }],
        }],
        turn_complete: true,
    })
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<ToolCall>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

const KNOWN_SERVER_KEYS: [&str; 3] = ["setupComplete", "serverContent", "toolCall"];

/// A parsed server frame plus any top-level keys we do not handle.
#[derive(Debug, Clone, Default)]
pub struct ParsedServerMessage {
    pub message: ServerMessage,
    pub unknown_keys: Vec<String>,
}

impl ParsedServerMessage {
    /// Nothing in the frame is actionable.
    pub fn is_unrecognized(&self) -> bool {
        self.message.setup_complete.is_none()
            && self.message.server_content.is_none()
            && self.message.tool_call.is_none()
    }
}

/// Parse one text frame. Non-JSON or non-object input is a protocol error.
pub fn parse_server_message(text: &str) -> VoiceResult<ParsedServerMessage> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| VoiceError::Protocol(format!("frame is not JSON: {e}")))?;
    let Some(object) = value.as_object() else {
        return Err(VoiceError::Protocol("frame is not a JSON object".into()));
    };
    let unknown_keys = object
        .keys()
        .filter(|k| !KNOWN_SERVER_KEYS.contains(&k.as_str()))
        .cloned()
        .collect();
    let message = ServerMessage::deserialize(&value)
        .map_err(|e| VoiceError::Protocol(format!("malformed server frame: {e}")))?;
    Ok(ParsedServerMessage {
        message,
        unknown_keys,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_setup_frame_shape() {
        let config = ConnectionConfig::new("key")
            .with_system_instruction("Be brief.")
            .with_voice(Some("Kore".into()));
        let json: Value = serde_json::from_str(&setup_frame(&config).to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            json!({
                "setup": {
                    "model": config.model,
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "speechConfig": {
                            "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": "Kore" } }
                        }
                    },
                    "systemInstruction": { "parts": [{ "text": "Be brief." }] }
                }
            })
        );
    }

    #[test]
    fn test_realtime_input_encodes_little_endian_base64() {
        let frame = AudioFrame::new(vec![1, -2]);
        let json: Value =
            serde_json::from_str(&realtime_input_frame(&frame).to_json().unwrap()).unwrap();
        let chunk = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        // [0x01, 0x00, 0xFE, 0xFF]
        assert_eq!(chunk["data"], "AQD+/w==");
    }

    #[test]
    fn test_client_content_is_complete_user_turn() {
        let json: Value =
            serde_json::from_str(&client_content_frame("hi").to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            json!({
                "clientContent": {
                    "turns": [{ "role": "user", "parts": [{ "text": "hi" }] }],
                    "turnComplete": true
                }
            })
        );
    }

    #[test]
    fn test_parse_server_content_with_audio() {
        let text = json!({
            "serverContent": {
                "modelTurn": { "parts": [
                    { "text": "Hello" },
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AQD+/w==" } }
                ]},
                "turnComplete": true
            }
        })
        .to_string();
        let parsed = parse_server_message(&text).unwrap();
        let content = parsed.message.server_content.unwrap();
        assert!(content.turn_complete);
        assert!(!content.interrupted);
        let parts = content.model_turn.unwrap().parts;
        assert_eq!(parts[0].text.as_deref(), Some("Hello"));
        let audio = parts[1].inline_data.as_ref().unwrap().decode().unwrap();
        assert_eq!(audio.data, vec![0x01, 0x00, 0xFE, 0xFF]);
    }

    #[test]
    fn test_unknown_frames_are_flagged_not_rejected() {
        let parsed = parse_server_message(r#"{"usageMetadata":{"totalTokenCount":5}}"#).unwrap();
        assert!(parsed.is_unrecognized());
        assert_eq!(parsed.unknown_keys, vec!["usageMetadata".to_string()]);

        let ack = parse_server_message(r#"{"setupComplete":{}}"#).unwrap();
        assert!(!ack.is_unrecognized());
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        assert!(matches!(
            parse_server_message("not json"),
            Err(VoiceError::Protocol(_))
        ));
        assert!(matches!(
            parse_server_message("[1,2]"),
            Err(VoiceError::Protocol(_))
        ));
    }

    #[test]
    fn test_bad_base64_is_decode_error() {
        let blob = Blob {
            mime_type: "audio/pcm".into(),
            data: "***".into(),
        };
        assert!(matches!(blob.decode(), Err(VoiceError::Decode(_))));
    }

    #[test]
    fn test_tool_call_parses() {
        let parsed = parse_server_message(
            r#"{"toolCall":{"functionCalls":[{"id":"1","name":"lookup","args":{"q":"x"}}]}}"#,
        )
        .unwrap();
        let call = &parsed.message.tool_call.unwrap().function_calls[0];
        assert_eq!(call.name, "lookup");
        assert_eq!(call.args, json!({"q": "x"}));
    }
}
