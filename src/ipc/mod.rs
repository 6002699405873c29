//! IPC protocol types for the desktop host.
//!
//! Events use `{"event": "<name>", "data": {...}}` format (core -> host).
//! Commands use `{"command": "<name>", ...}` format (host -> core).

pub mod bridge;

use serde::{Deserialize, Serialize};

use crate::config::Persona;
use crate::error::ErrorKind;
use crate::session::TranscriptEntry;
use crate::state::{Phase, StatePatch};
use crate::transport::protocol::ToolCall;

// ---------------------------------------------------------------------------
// Events: core -> host (stdout)
// ---------------------------------------------------------------------------

/// All events emitted to the host via stdout as JSON lines.
///
/// Serialized as `{"event": "<variant>", "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum VoiceEvent {
    Starting {},
    Ready {},
    StateChange {
        #[serde(flatten)]
        patch: StatePatch,
        phase: Phase,
    },
    Text {
        text: String,
    },
    Transcript {
        entry: TranscriptEntry,
    },
    ToolCall {
        call: ToolCall,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<ErrorKind>,
        message: String,
    },
    AudioDevices {
        input: Vec<AudioDeviceInfo>,
        output: Vec<AudioDeviceInfo>,
    },
    Personas {
        personas: Vec<PersonaInfo>,
        #[serde(rename = "defaultPersona", skip_serializing_if = "Option::is_none")]
        default_persona: Option<String>,
    },
    Pong {},
    Stopping {},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    pub id: i32,
    pub name: String,
}

impl AudioDeviceInfo {
    pub fn from_names(names: Vec<String>) -> Vec<Self> {
        names
            .into_iter()
            .enumerate()
            .map(|(i, name)| Self { id: i as i32, name })
            .collect()
    }
}

/// Persona summary for pickers. The system prompt stays in the core.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaInfo {
    pub id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_name: Option<String>,
}

impl PersonaInfo {
    pub fn new(persona: &Persona, voice_name: Option<&str>) -> Self {
        Self {
            id: persona.id.clone(),
            display_name: persona.display_name.clone(),
            voice_name: voice_name.map(str::to_string),
        }
    }
}

// ---------------------------------------------------------------------------
// Commands: host -> core (stdin)
// ---------------------------------------------------------------------------

/// All commands received from the host via stdin as JSON lines.
///
/// Deserialized from `{"command": "<variant>", ...}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command")]
#[serde(rename_all = "snake_case")]
pub enum VoiceCommand {
    Connect {
        #[serde(default)]
        persona: Option<String>,
    },
    Disconnect {},
    StartListening {},
    StopListening {},
    SendText {
        text: String,
    },
    Interrupt {},
    SetVolume {
        volume: f32,
    },
    ListAudioDevices {},
    ListPersonas {},
    Ping {},
    Stop {},
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConnectionStatus;
    use serde_json::json;

    #[test]
    fn test_commands_deserialize() {
        let cmd: VoiceCommand =
            serde_json::from_str(r#"{"command":"connect","persona":"cfo"}"#).unwrap();
        assert_eq!(
            cmd,
            VoiceCommand::Connect {
                persona: Some("cfo".into())
            }
        );

        let cmd: VoiceCommand = serde_json::from_str(r#"{"command":"connect"}"#).unwrap();
        assert_eq!(cmd, VoiceCommand::Connect { persona: None });

        let cmd: VoiceCommand =
            serde_json::from_str(r#"{"command":"send_text","text":"hi"}"#).unwrap();
        assert_eq!(cmd, VoiceCommand::SendText { text: "hi".into() });

        let cmd: VoiceCommand =
            serde_json::from_str(r#"{"command":"set_volume","volume":0.5}"#).unwrap();
        assert_eq!(cmd, VoiceCommand::SetVolume { volume: 0.5 });

        assert!(serde_json::from_str::<VoiceCommand>(r#"{"command":"send_text"}"#).is_err());
        assert!(serde_json::from_str::<VoiceCommand>(r#"{"command":"fly"}"#).is_err());
    }

    #[test]
    fn test_state_change_flattens_patch() {
        let event = VoiceEvent::StateChange {
            patch: StatePatch::status(ConnectionStatus::Connected),
            phase: Phase::Connected,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "event": "state_change",
                "data": { "status": "connected", "phase": "connected" }
            })
        );
    }

    #[test]
    fn test_unit_events_have_empty_data() {
        assert_eq!(
            serde_json::to_value(VoiceEvent::Pong {}).unwrap(),
            json!({ "event": "pong", "data": {} })
        );
    }
}
