//! Session state published to the UI layer.

use serde::Serialize;

use crate::error::ErrorInfo;

/// Transport connection status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Full state of one voice session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub status: ConnectionStatus,
    pub listening: bool,
    pub speaking: bool,
    pub processing: bool,
    pub error: Option<ErrorInfo>,
}

/// Coarse phase of the session, derived from [`SessionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Connecting,
    Connected,
    Listening,
    Speaking,
    Error,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Listening => "listening",
            Self::Speaking => "speaking",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl SessionState {
    pub fn phase(&self) -> Phase {
        if self.error.is_some() {
            return Phase::Error;
        }
        match self.status {
            ConnectionStatus::Disconnected => Phase::Idle,
            ConnectionStatus::Connecting => Phase::Connecting,
            ConnectionStatus::Connected if self.listening => Phase::Listening,
            ConnectionStatus::Connected if self.speaking => Phase::Speaking,
            ConnectionStatus::Connected => Phase::Connected,
        }
    }

    /// Apply `patch` and return only the fields that actually changed, or
    /// `None` when nothing did.
    pub fn apply(&mut self, patch: StatePatch) -> Option<StatePatch> {
        let mut changed = StatePatch::default();
        if let Some(status) = patch.status {
            if self.status != status {
                self.status = status;
                changed.status = Some(status);
            }
        }
        if let Some(listening) = patch.listening {
            if self.listening != listening {
                self.listening = listening;
                changed.listening = Some(listening);
            }
        }
        if let Some(speaking) = patch.speaking {
            if self.speaking != speaking {
                self.speaking = speaking;
                changed.speaking = Some(speaking);
            }
        }
        if let Some(processing) = patch.processing {
            if self.processing != processing {
                self.processing = processing;
                changed.processing = Some(processing);
            }
        }
        if let Some(error) = patch.error {
            if self.error != error {
                self.error = error.clone();
                changed.error = Some(error);
            }
        }
        if changed.is_empty() {
            None
        } else {
            Some(changed)
        }
    }
}

/// Partial state update. `None` fields are unchanged; `error: Some(None)`
/// clears the error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ConnectionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listening: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaking: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Option<ErrorInfo>>,
}

impl StatePatch {
    pub fn status(status: ConnectionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn listening(listening: bool) -> Self {
        Self {
            listening: Some(listening),
            ..Default::default()
        }
    }

    pub fn speaking(speaking: bool) -> Self {
        Self {
            speaking: Some(speaking),
            ..Default::default()
        }
    }

    pub fn processing(processing: bool) -> Self {
        Self {
            processing: Some(processing),
            ..Default::default()
        }
    }

    pub fn error(error: Option<ErrorInfo>) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    /// Everything back to a fresh, disconnected session.
    pub fn reset() -> Self {
        Self {
            status: Some(ConnectionStatus::Disconnected),
            listening: Some(false),
            speaking: Some(false),
            processing: Some(false),
            error: Some(None),
        }
    }

    pub fn with_error(mut self, error: Option<ErrorInfo>) -> Self {
        self.error = Some(error);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.listening.is_none()
            && self.speaking.is_none()
            && self.processing.is_none()
            && self.error.is_none()
    }
}
