//! Audio capture, decoding, and playback.

pub mod capture;
pub mod decode;
pub mod pcm;
pub mod playback;
pub mod ring_buffer;

pub use capture::{
    list_input_devices, list_output_devices, CaptureConstraints, CpalMicrophone, FrameCallback,
    MicrophoneBackend, MicrophoneCapture,
};
pub use decode::{decode_inbound, DecodedAudio};
pub use pcm::{AudioFrame, InboundAudio, CAPTURE_SAMPLE_RATE, FRAME_SAMPLES, PLAYBACK_SAMPLE_RATE};
pub use playback::{AudioOutput, Drained, Playback, RodioOutput};
