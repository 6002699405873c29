//! Personas and their voice profiles.
//!
//! Both tables are read-only after startup. Built-in entries can be
//! overridden or extended from `voice_config.json`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Remote voice selection plus advisory style hints. `pitch` and `rate`
/// are metadata for the UI; nothing on the audio path enforces them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceProfile {
    pub id: String,
    pub voice_name: String,
    #[serde(default)]
    pub pitch: Option<f32>,
    #[serde(default)]
    pub rate: Option<f32>,
}

/// An advisory persona as supplied by the host application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    pub id: String,
    pub display_name: String,
    pub system_prompt: String,
    #[serde(default)]
    pub voice_profile_id: Option<String>,
}

fn profile(id: &str, voice_name: &str, pitch: f32, rate: f32) -> VoiceProfile {
    VoiceProfile {
        id: id.to_string(),
        voice_name: voice_name.to_string(),
        pitch: Some(pitch),
        rate: Some(rate),
    }
}

/// Lookup from profile id to [`VoiceProfile`].
#[derive(Debug, Clone)]
pub struct VoiceProfiles {
    by_id: HashMap<String, VoiceProfile>,
}

impl VoiceProfiles {
    /// Built-in profiles for the stock prebuilt voices.
    pub fn builtin() -> Self {
        Self::from_profiles([
            profile("warm", "Aoede", 1.0, 1.0),
            profile("steady", "Charon", 0.9, 0.95),
            profile("bright", "Puck", 1.1, 1.05),
            profile("calm", "Kore", 1.0, 0.9),
            profile("direct", "Fenrir", 0.95, 1.1),
        ])
    }

    pub fn from_profiles(profiles: impl IntoIterator<Item = VoiceProfile>) -> Self {
        Self {
            by_id: profiles.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    /// Add or replace entries.
    pub fn extend(&mut self, profiles: impl IntoIterator<Item = VoiceProfile>) {
        for p in profiles {
            self.by_id.insert(p.id.clone(), p);
        }
    }

    pub fn get(&self, id: &str) -> Option<&VoiceProfile> {
        self.by_id.get(id)
    }

    /// Voice name for `persona`, if its profile is known.
    pub fn voice_for(&self, persona: &Persona) -> Option<&str> {
        persona
            .voice_profile_id
            .as_deref()
            .and_then(|id| self.get(id))
            .map(|p| p.voice_name.as_str())
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl Default for VoiceProfiles {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Lookup from persona id to [`Persona`], keeping insertion order for
/// listing.
#[derive(Debug, Clone, Default)]
pub struct PersonaDirectory {
    personas: Vec<Persona>,
}

impl PersonaDirectory {
    /// A single general-purpose advisor used when nothing is configured.
    pub fn builtin() -> Self {
        Self {
            personas: vec![Persona {
                id: "advisor".into(),
                display_name: "Advisor".into(),
                system_prompt: "You are a concise, friendly business advisor. \
                                Answer in short spoken sentences."
                    .into(),
                voice_profile_id: Some("warm".into()),
            }],
        }
    }

    /// Add or replace personas by id.
    pub fn extend(&mut self, personas: impl IntoIterator<Item = Persona>) {
        for p in personas {
            match self.personas.iter_mut().find(|existing| existing.id == p.id) {
                Some(existing) => *existing = p,
                None => self.personas.push(p),
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Persona> {
        self.personas.iter().find(|p| p.id == id)
    }

    /// First persona, used when no id is requested.
    pub fn first(&self) -> Option<&Persona> {
        self.personas.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Persona> {
        self.personas.iter()
    }
}
