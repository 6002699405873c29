//! Configuration: the on-disk settings file, credentials and the immutable
//! per-session [`ConnectionConfig`].

pub mod paths;
pub mod profiles;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{VoiceError, VoiceResult};
use paths::get_data_dir;
pub use profiles::{Persona, PersonaDirectory, VoiceProfile, VoiceProfiles};

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";
pub const DEFAULT_VOICE: &str = "Puck";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variables checked, in order, for the endpoint credential.
const CREDENTIAL_VARS: [&str; 2] = ["GEMINI_API_KEY", "GOOGLE_API_KEY"];

/// Output modality requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
    Text,
}

/// voice_config.json shape. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub response_modalities: Option<Vec<Modality>>,
    #[serde(default)]
    pub default_voice: Option<String>,
    #[serde(default)]
    pub handshake_timeout_ms: Option<u64>,
    #[serde(default)]
    pub output_volume: Option<f32>,
    #[serde(default)]
    pub input_device: Option<String>,
    #[serde(default)]
    pub output_device: Option<String>,
    #[serde(default)]
    pub default_persona: Option<String>,
    #[serde(default)]
    pub personas: Vec<Persona>,
    #[serde(default)]
    pub voice_profiles: Vec<VoiceProfile>,
}

impl VoiceConfig {
    /// Built-in personas and profiles extended by the file's entries.
    pub fn directories(&self) -> (PersonaDirectory, VoiceProfiles) {
        let mut personas = PersonaDirectory::builtin();
        personas.extend(self.personas.iter().cloned());
        let mut profiles = VoiceProfiles::builtin();
        profiles.extend(self.voice_profiles.iter().cloned());
        (personas, profiles)
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT)
    }

    pub fn output_volume(&self) -> f32 {
        self.output_volume.unwrap_or(1.0).clamp(0.0, 2.0)
    }
}

/// Everything needed to open one session. Immutable once built; changing a
/// field means tearing the session down and building a new config.
#[derive(Clone, PartialEq)]
pub struct ConnectionConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub system_instruction: String,
    pub response_modalities: Vec<Modality>,
    pub voice_name: Option<String>,
    pub handshake_timeout: Duration,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("system_instruction_len", &self.system_instruction.len())
            .field("response_modalities", &self.response_modalities)
            .field("voice_name", &self.voice_name)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl ConnectionConfig {
    /// Minimal config with defaults for everything but the credential.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            system_instruction: String::new(),
            response_modalities: vec![Modality::Audio],
            voice_name: Some(DEFAULT_VOICE.to_string()),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_system_instruction(mut self, text: impl Into<String>) -> Self {
        self.system_instruction = text.into();
        self
    }

    pub fn with_voice(mut self, voice: Option<String>) -> Self {
        self.voice_name = voice;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Build the config for `persona` from file settings and a credential.
    ///
    /// Voice resolution: persona's profile, then the file's default voice,
    /// then [`DEFAULT_VOICE`].
    pub fn for_persona(
        persona: &Persona,
        profiles: &VoiceProfiles,
        file: &VoiceConfig,
        api_key: Option<String>,
    ) -> VoiceResult<Self> {
        let api_key = api_key
            .or_else(|| file.api_key.clone())
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                VoiceError::Config(format!(
                    "no API key: set {} or apiKey in voice_config.json",
                    CREDENTIAL_VARS[0]
                ))
            })?;

        let voice = profiles
            .voice_for(persona)
            .map(str::to_string)
            .or_else(|| file.default_voice.clone())
            .unwrap_or_else(|| DEFAULT_VOICE.to_string());

        let modalities = file
            .response_modalities
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| vec![Modality::Audio]);

        Ok(Self {
            endpoint: file
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            api_key,
            model: file.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            system_instruction: persona.system_prompt.clone(),
            response_modalities: modalities,
            voice_name: Some(voice),
            handshake_timeout: file.handshake_timeout(),
        })
    }
}

/// Credential from the environment, if any.
pub fn credential_from_env() -> Option<String> {
    CREDENTIAL_VARS
        .iter()
        .find_map(|var| std::env::var(var).ok())
        .filter(|v| !v.trim().is_empty())
}

/// Read voice_config.json from the data directory.
pub fn read_voice_config() -> VoiceConfig {
    let path = get_config_path();
    read_json_file(&path).unwrap_or_default()
}

/// Path to voice_config.json.
pub fn get_config_path() -> PathBuf {
    get_data_dir().join("voice_config.json")
}

/// Generic helper: read a JSON file and deserialize it.
fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(val) => Some(val),
            Err(e) => {
                warn!("Failed to parse {}: {}", path.display(), e);
                None
            }
        },
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read {}: {}", path.display(), e);
            }
            None
        }
    }
}
