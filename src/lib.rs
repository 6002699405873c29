//! Realtime voice conversation pipeline.
//!
//! Microphone frames stream to a remote realtime model over a persistent
//! WebSocket; the model's audio replies are queued and played back in
//! order. [`session::SessionController`] is the entry point.

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod ipc;
pub mod session;
pub mod state;
pub mod transport;

#[cfg(test)]
mod testing;

pub use error::{VoiceError, VoiceResult};
pub use session::SessionController;
