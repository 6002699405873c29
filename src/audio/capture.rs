//! Microphone capture.
//!
//! The platform side (cpal) pushes mono 16 kHz f32 samples into a lock-free
//! ring. A framing task drains the ring on a short tick, cuts fixed-size
//! frames, quantizes them to i16 and hands each one to the caller's
//! callback. The producer is free-running: frames go out whenever enough
//! samples have accumulated.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SampleFormat, SizedSample, StreamConfig};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::pcm::{resample_linear, to_mono, AudioFrame, FrameAccumulator, CAPTURE_SAMPLE_RATE, FRAME_SAMPLES};
use super::ring_buffer::{sample_ring, SampleConsumer, SampleProducer, DEFAULT_CAPACITY};
use crate::error::{VoiceError, VoiceResult};

/// How often the framing task drains the ring.
const PUMP_INTERVAL: Duration = Duration::from_millis(20);

/// Receives each captured frame, in production order.
pub type FrameCallback = Box<dyn FnMut(AudioFrame) + Send>;

/// Input processing requested from the platform. These are hints; a
/// backend that cannot honour one logs it and carries on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Platform entry point for microphone access.
pub trait MicrophoneBackend: Send + Sync {
    /// Acquire an audio processing context running at [`CAPTURE_SAMPLE_RATE`].
    fn create_context(&self) -> VoiceResult<Box<dyn CaptureContext>>;
}

/// An acquired audio context. Dropping it releases the context.
pub trait CaptureContext: Send {
    /// Open the microphone and start pushing mono samples at
    /// [`CAPTURE_SAMPLE_RATE`] into `producer`.
    fn open_input(
        &mut self,
        constraints: &CaptureConstraints,
        producer: SampleProducer,
    ) -> VoiceResult<Box<dyn InputStream>>;
}

/// A live input stream. Dropping it stops capture and releases the device.
pub trait InputStream: Send {
    fn device_name(&self) -> &str;
}

struct Recording {
    stream: Box<dyn InputStream>,
    /// `true` while frames may be delivered. The framing task holds this
    /// lock for the duration of each callback.
    gate: Arc<Mutex<bool>>,
    pump: JoinHandle<()>,
}

/// Microphone Capture Unit.
pub struct MicrophoneCapture {
    backend: Arc<dyn MicrophoneBackend>,
    constraints: CaptureConstraints,
    frame_samples: usize,
    context: Option<Box<dyn CaptureContext>>,
    recording: Option<Recording>,
}

impl MicrophoneCapture {
    pub fn new(backend: Arc<dyn MicrophoneBackend>) -> Self {
        Self {
            backend,
            constraints: CaptureConstraints::default(),
            frame_samples: FRAME_SAMPLES,
            context: None,
            recording: None,
        }
    }

    /// Override the frame size. Only takes effect for recordings started
    /// afterwards.
    pub fn with_frame_samples(mut self, frame_samples: usize) -> Self {
        self.frame_samples = frame_samples.max(1);
        self
    }

    /// Acquire the audio context. No-op when already initialized.
    pub fn initialize(&mut self) -> VoiceResult<()> {
        if self.context.is_some() {
            return Ok(());
        }
        let context = self.backend.create_context().map_err(|e| match e {
            VoiceError::AudioInit(_) => e,
            other => VoiceError::AudioInit(other.to_string()),
        })?;
        self.context = Some(context);
        debug!(rate = CAPTURE_SAMPLE_RATE, "Capture context initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.context.is_some()
    }

    /// Open the microphone and start emitting frames to `on_chunk`.
    ///
    /// Must be called from within a tokio runtime. Initializes the context
    /// first if needed. Calling it while already recording restarts the
    /// recording with the new callback.
    ///
    /// `on_chunk` must not call back into this unit.
    pub fn start_recording(&mut self, on_chunk: FrameCallback) -> VoiceResult<()> {
        self.stop_recording();
        self.initialize()?;

        let context = self
            .context
            .as_mut()
            .ok_or_else(|| VoiceError::AudioInit("capture context missing".into()))?;

        let (producer, consumer) = sample_ring(DEFAULT_CAPACITY);
        let stream = context.open_input(&self.constraints, producer)?;

        let gate = Arc::new(Mutex::new(true));
        let pump = tokio::spawn(pump_frames(
            consumer,
            on_chunk,
            Arc::clone(&gate),
            self.frame_samples,
        ));

        info!(
            device = %stream.device_name(),
            frame_samples = self.frame_samples,
            "Microphone capture started"
        );

        self.recording = Some(Recording { stream, gate, pump });
        Ok(())
    }

    /// Stop capture and release the input device, keeping the context.
    /// After this returns no further frames are delivered.
    pub fn stop_recording(&mut self) {
        let Some(recording) = self.recording.take() else {
            return;
        };
        {
            let mut open = recording
                .gate
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *open = false;
        }
        recording.pump.abort();
        let device = recording.stream.device_name().to_string();
        drop(recording.stream);
        info!(device = %device, "Microphone capture stopped");
    }

    /// Stop recording and release the audio context.
    pub fn dispose(&mut self) {
        self.stop_recording();
        if self.context.take().is_some() {
            debug!("Capture context released");
        }
    }

    pub fn is_active(&self) -> bool {
        self.recording.is_some()
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Drain the ring on a fixed tick and deliver whole frames.
async fn pump_frames(
    mut consumer: SampleConsumer,
    mut on_chunk: FrameCallback,
    gate: Arc<Mutex<bool>>,
    frame_samples: usize,
) {
    let mut acc = FrameAccumulator::new(frame_samples);
    let mut tick = tokio::time::interval(PUMP_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tick.tick().await;
        let samples = consumer.drain_all();
        if samples.is_empty() {
            continue;
        }
        for frame in acc.push(&samples) {
            let open = gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if !*open {
                return;
            }
            on_chunk(frame);
        }
    }
}

// ---------------------------------------------------------------------------
// cpal backend
// ---------------------------------------------------------------------------

/// List available input device names.
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    if let Ok(devices) = host.input_devices() {
        for dev in devices {
            if let Ok(name) = dev.name() {
                names.push(name);
            }
        }
    }
    names
}

/// List available output device names.
pub fn list_output_devices() -> Vec<String> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    if let Ok(devices) = host.output_devices() {
        for dev in devices {
            if let Ok(name) = dev.name() {
                names.push(name);
            }
        }
    }
    names
}

/// Microphone access through the default cpal host.
#[derive(Debug, Clone, Default)]
pub struct CpalMicrophone {
    /// Named input device, or the system default when `None`.
    pub device_name: Option<String>,
}

impl CpalMicrophone {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

impl MicrophoneBackend for CpalMicrophone {
    fn create_context(&self) -> VoiceResult<Box<dyn CaptureContext>> {
        let host = cpal::default_host();
        // Enumeration fails when the host audio system is unreachable.
        host.input_devices()
            .map_err(|e| VoiceError::AudioInit(format!("audio host unavailable: {e}")))?;
        info!(host = ?host.id(), "Audio host ready");
        Ok(Box::new(CpalContext {
            host,
            device_name: self.device_name.clone(),
        }))
    }
}

struct CpalContext {
    host: cpal::Host,
    device_name: Option<String>,
}

// Safety: the host handle is only used from whichever thread currently owns
// the context; cpal hosts are plain handles to the platform API.
unsafe impl Send for CpalContext {}

impl CpalContext {
    fn resolve_device(&self) -> VoiceResult<cpal::Device> {
        match &self.device_name {
            Some(name) => self
                .host
                .input_devices()?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or_else(|| VoiceError::DeviceUnavailable(format!("input device not found: {name}"))),
            None => self
                .host
                .default_input_device()
                .ok_or_else(|| VoiceError::DeviceUnavailable("no default input device".into())),
        }
    }
}

impl CaptureContext for CpalContext {
    fn open_input(
        &mut self,
        constraints: &CaptureConstraints,
        producer: SampleProducer,
    ) -> VoiceResult<Box<dyn InputStream>> {
        let device = self.resolve_device()?;
        let dev_name = device.name().unwrap_or_else(|_| "unknown".into());

        // cpal exposes raw device input only.
        if constraints.echo_cancellation || constraints.noise_suppression || constraints.auto_gain_control {
            debug!(?constraints, "Input processing hints not supported by cpal, capturing raw input");
        }

        let default_config = device.default_input_config()?;
        let native_rate = default_config.sample_rate().0;
        let channels = default_config.channels();
        let stream_config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(native_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        info!(
            device = %dev_name,
            native_rate,
            channels,
            format = ?default_config.sample_format(),
            "Input device config (resampling to {}Hz mono)",
            CAPTURE_SAMPLE_RATE,
        );

        let stream = match default_config.sample_format() {
            SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, producer)?,
            SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, producer)?,
            SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, producer)?,
            other => {
                return Err(VoiceError::DeviceUnavailable(format!(
                    "unsupported input sample format: {other:?}"
                )))
            }
        };
        stream.play()?;

        Ok(Box::new(CpalInput {
            _stream: SendStream(stream),
            name: dev_name,
        }))
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: SampleProducer,
) -> VoiceResult<cpal::Stream>
where
    T: SizedSample,
    f32: cpal::FromSample<T>,
{
    let native_rate = config.sample_rate.0;
    let channels = config.channels;
    let mut overflowed = false;

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _info: &cpal::InputCallbackInfo| {
            let floats: Vec<f32> = data.iter().map(|s| s.to_sample::<f32>()).collect();
            let mono = to_mono(&floats, channels);
            let resampled = resample_linear(&mono, native_rate, CAPTURE_SAMPLE_RATE);
            let written = producer.push_slice(&resampled);
            if written < resampled.len() && !overflowed {
                // Framer fell behind; newest samples are dropped.
                overflowed = true;
                warn!("Capture ring full, dropping samples");
            } else if written == resampled.len() {
                overflowed = false;
            }
        },
        move |err| {
            error!("Audio input stream error: {}", err);
        },
        None,
    )?;
    Ok(stream)
}

/// `cpal::Stream` is `!Send` on some platforms. We only keep it alive and
/// drop it; the audio callback runs on cpal's own thread.
struct SendStream(#[allow(dead_code)] cpal::Stream);

// SAFETY: the wrapped stream is never accessed after construction, only
// dropped.
unsafe impl Send for SendStream {}

struct CpalInput {
    _stream: SendStream,
    name: String,
}

impl InputStream for CpalInput {
    fn device_name(&self) -> &str {
        &self.name
    }
}
