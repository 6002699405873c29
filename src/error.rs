//! Error types for the voice pipeline.

use serde::Serialize;
use thiserror::Error;

/// Result alias used across the crate.
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Everything that can go wrong between the microphone, the socket and the
/// speaker.
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("audio context initialization failed: {0}")]
    AudioInit(String),

    #[error("microphone access denied")]
    Permission,

    #[error("microphone access failed: {0}")]
    MicrophoneAccess(String),

    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("session is already connecting or connected")]
    AlreadyConnected,

    #[error("session is not connected")]
    NotConnected,

    #[error("audio decode error: {0}")]
    Decode(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("audio playback error: {0}")]
    Playback(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Coarse classification surfaced to the UI layer.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AudioInit(_) => ErrorKind::AudioInit,
            Self::Permission | Self::MicrophoneAccess(_) => ErrorKind::Permission,
            Self::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            Self::HandshakeTimeout(_) => ErrorKind::HandshakeTimeout,
            Self::Connection(_) | Self::AlreadyConnected | Self::NotConnected => {
                ErrorKind::Connection
            }
            Self::Decode(_) => ErrorKind::Decode,
            Self::Protocol(_) | Self::Json(_) => ErrorKind::Protocol,
            Self::Playback(_) => ErrorKind::Playback,
            Self::Config(_) | Self::Io(_) => ErrorKind::Config,
        }
    }
}

/// Serializable error category, paired with a message in [`ErrorInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AudioInit,
    Permission,
    DeviceUnavailable,
    HandshakeTimeout,
    Connection,
    Decode,
    Protocol,
    Playback,
    Config,
}

/// Cloneable snapshot of an error for state publishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&VoiceError> for ErrorInfo {
    fn from(err: &VoiceError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                VoiceError::DeviceUnavailable(err.to_string())
            }
            other => VoiceError::MicrophoneAccess(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::MicrophoneAccess(err.to_string())
    }
}
