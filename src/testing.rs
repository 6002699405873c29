//! In-memory stand-ins for the microphone, the speaker and the realtime
//! server, shared by the unit tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::audio::capture::{CaptureConstraints, CaptureContext, InputStream, MicrophoneBackend};
use crate::audio::ring_buffer::SampleProducer;
use crate::audio::{AudioOutput, DecodedAudio, InboundAudio};
use crate::config::ConnectionConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::session::AudioBackend;
use crate::transport::socket::{Connector, ShutdownHandle, SocketChannel, SocketEvent};

/// Poll `cond` every 5 ms for up to two seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Raw 24 kHz PCM frame whose every sample equals `id`, so [`FakeSpeaker`]
/// can tell frames apart after decoding.
pub fn pcm_frame(id: u8, len: usize) -> InboundAudio {
    let mut data = Vec::with_capacity(len * 2);
    for _ in 0..len {
        data.extend_from_slice(&(id as i16).to_le_bytes());
    }
    InboundAudio::new("audio/pcm;rate=24000", data)
}

// ---------------------------------------------------------------------------
// Microphone
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MicState {
    no_device: bool,
    context_fails: bool,
    producer: Mutex<Option<SampleProducer>>,
    contexts_created: AtomicUsize,
    contexts_alive: AtomicUsize,
    open_streams: AtomicUsize,
}

/// Microphone whose samples are pushed by the test through [`feed`].
///
/// [`feed`]: FakeMicrophone::feed
#[derive(Clone, Default)]
pub struct FakeMicrophone {
    state: Arc<MicState>,
}

impl FakeMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context creation works but there is no input device.
    pub fn without_device() -> Self {
        Self {
            state: Arc::new(MicState {
                no_device: true,
                ..Default::default()
            }),
        }
    }

    /// The platform refuses to create an audio context.
    pub fn failing_context() -> Self {
        Self {
            state: Arc::new(MicState {
                context_fails: true,
                ..Default::default()
            }),
        }
    }

    pub fn backend(&self) -> Arc<dyn MicrophoneBackend> {
        Arc::new(self.clone())
    }

    /// Push samples as if the device produced them. Ignored when no stream
    /// is open.
    pub fn feed(&self, samples: &[f32]) {
        if let Some(producer) = self.state.producer.lock().unwrap().as_mut() {
            producer.push_slice(samples);
        }
    }

    pub fn contexts_created(&self) -> usize {
        self.state.contexts_created.load(Ordering::SeqCst)
    }

    pub fn contexts_alive(&self) -> usize {
        self.state.contexts_alive.load(Ordering::SeqCst)
    }

    pub fn open_streams(&self) -> usize {
        self.state.open_streams.load(Ordering::SeqCst)
    }
}

impl MicrophoneBackend for FakeMicrophone {
    fn create_context(&self) -> VoiceResult<Box<dyn CaptureContext>> {
        if self.state.context_fails {
            return Err(VoiceError::AudioInit("context refused".into()));
        }
        self.state.contexts_created.fetch_add(1, Ordering::SeqCst);
        self.state.contexts_alive.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeContext {
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeContext {
    state: Arc<MicState>,
}

impl CaptureContext for FakeContext {
    fn open_input(
        &mut self,
        _constraints: &CaptureConstraints,
        producer: SampleProducer,
    ) -> VoiceResult<Box<dyn InputStream>> {
        if self.state.no_device {
            return Err(VoiceError::DeviceUnavailable("no input device".into()));
        }
        *self.state.producer.lock().unwrap() = Some(producer);
        self.state.open_streams.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeInput {
            state: Arc::clone(&self.state),
        }))
    }
}

impl Drop for FakeContext {
    fn drop(&mut self) {
        self.state.contexts_alive.fetch_sub(1, Ordering::SeqCst);
    }
}

struct FakeInput {
    state: Arc<MicState>,
}

impl InputStream for FakeInput {
    fn device_name(&self) -> &str {
        "fake-mic"
    }
}

impl Drop for FakeInput {
    fn drop(&mut self) {
        self.state.producer.lock().unwrap().take();
        self.state.open_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Speaker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SpeakerState {
    held: Mutex<bool>,
    volume: Mutex<Option<f32>>,
    play_time: Mutex<Option<Duration>>,
    started: Mutex<Vec<u8>>,
    finished: Mutex<Vec<u8>>,
    cancelled: Mutex<Vec<u8>>,
    playing: AtomicUsize,
    max_concurrent: AtomicUsize,
    stops: AtomicUsize,
    outputs_opened: AtomicUsize,
    outputs_alive: AtomicUsize,
}

/// Speaker that records which frames started, finished or were cut off.
#[derive(Clone, Default)]
pub struct FakeSpeaker {
    state: Arc<SpeakerState>,
}

impl FakeSpeaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new output handle on this speaker.
    pub fn output(&self) -> Arc<dyn AudioOutput> {
        self.state.outputs_opened.fetch_add(1, Ordering::SeqCst);
        self.state.outputs_alive.fetch_add(1, Ordering::SeqCst);
        Arc::new(FakeOutput {
            state: Arc::clone(&self.state),
        })
    }

    /// Block every `play` call at its start until [`release`].
    ///
    /// [`release`]: FakeSpeaker::release
    pub fn hold(&self) {
        *self.state.held.lock().unwrap() = true;
    }

    pub fn release(&self) {
        *self.state.held.lock().unwrap() = false;
    }

    /// Fixed duration for every frame instead of one scaled by length.
    pub fn set_play_time(&self, duration: Duration) {
        *self.state.play_time.lock().unwrap() = Some(duration);
    }

    /// Last volume set on any output of this speaker.
    pub fn volume(&self) -> Option<f32> {
        *self.state.volume.lock().unwrap()
    }

    pub fn started(&self) -> Vec<u8> {
        self.state.started.lock().unwrap().clone()
    }

    pub fn finished(&self) -> Vec<u8> {
        self.state.finished.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<u8> {
        self.state.cancelled.lock().unwrap().clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.state.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.state.stops.load(Ordering::SeqCst)
    }

    pub fn outputs_opened(&self) -> usize {
        self.state.outputs_opened.load(Ordering::SeqCst)
    }

    pub fn outputs_alive(&self) -> usize {
        self.state.outputs_alive.load(Ordering::SeqCst)
    }
}

struct FakeOutput {
    state: Arc<SpeakerState>,
}

impl AudioOutput for FakeOutput {
    fn play(&self, audio: &DecodedAudio, cancel: &AtomicBool) -> VoiceResult<()> {
        while *self.state.held.lock().unwrap() {
            std::thread::sleep(Duration::from_millis(1));
        }
        if cancel.load(Ordering::Acquire) {
            return Ok(());
        }

        let id = audio
            .samples
            .first()
            .map(|s| (s * 32768.0).round() as u8)
            .unwrap_or_default();
        self.state.started.lock().unwrap().push(id);
        let now = self.state.playing.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_concurrent.fetch_max(now, Ordering::SeqCst);

        let duration = self
            .state
            .play_time
            .lock()
            .unwrap()
            .unwrap_or_else(|| Duration::from_millis(2) + Duration::from_micros(10) * audio.samples.len() as u32);
        let begin = Instant::now();
        let mut interrupted = false;
        while begin.elapsed() < duration {
            if cancel.load(Ordering::Acquire) {
                interrupted = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        self.state.playing.fetch_sub(1, Ordering::SeqCst);
        if interrupted {
            self.state.cancelled.lock().unwrap().push(id);
        } else {
            self.state.finished.lock().unwrap().push(id);
        }
        Ok(())
    }

    fn stop(&self) {
        self.state.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn set_volume(&self, volume: f32) {
        *self.state.volume.lock().unwrap() = Some(volume);
    }
}

impl Drop for FakeOutput {
    fn drop(&mut self) {
        self.state.outputs_alive.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Audio backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BackendState {
    deny_permission: AtomicBool,
    permission_delay: Mutex<Option<Duration>>,
    fail_output: AtomicBool,
    permission_requests: AtomicUsize,
}

/// [`AudioBackend`] over a [`FakeMicrophone`] and a [`FakeSpeaker`].
#[derive(Clone)]
pub struct FakeAudioBackend {
    mic: FakeMicrophone,
    speaker: FakeSpeaker,
    state: Arc<BackendState>,
}

impl FakeAudioBackend {
    pub fn new(mic: &FakeMicrophone, speaker: &FakeSpeaker) -> Self {
        Self {
            mic: mic.clone(),
            speaker: speaker.clone(),
            state: Arc::default(),
        }
    }

    pub fn backend(&self) -> Arc<dyn AudioBackend> {
        Arc::new(self.clone())
    }

    pub fn deny_permission(&self) {
        self.state.deny_permission.store(true, Ordering::SeqCst);
    }

    /// Answer permission requests only after `delay`.
    pub fn delay_permission(&self, delay: Duration) {
        *self.state.permission_delay.lock().unwrap() = Some(delay);
    }

    /// Make `open_output` report a missing device.
    pub fn fail_output(&self) {
        self.state.fail_output.store(true, Ordering::SeqCst);
    }

    pub fn permission_requests(&self) -> usize {
        self.state.permission_requests.load(Ordering::SeqCst)
    }
}

impl AudioBackend for FakeAudioBackend {
    fn microphone(&self) -> Arc<dyn MicrophoneBackend> {
        self.mic.backend()
    }

    fn open_output(&self) -> VoiceResult<Arc<dyn AudioOutput>> {
        if self.state.fail_output.load(Ordering::SeqCst) {
            return Err(VoiceError::DeviceUnavailable("no output device".into()));
        }
        Ok(self.speaker.output())
    }

    fn request_microphone_permission(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            self.state.permission_requests.fetch_add(1, Ordering::SeqCst);
            let delay = *self.state.permission_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            !self.state.deny_permission.load(Ordering::SeqCst)
        })
    }
}

// ---------------------------------------------------------------------------
// Realtime server
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ServerState {
    silent: bool,
    hang: bool,
    refuse: Option<String>,
    to_client: Mutex<Option<mpsc::UnboundedSender<SocketEvent>>>,
    sent: Mutex<Vec<Value>>,
    connects: AtomicUsize,
    client_closed: AtomicBool,
}

/// In-memory realtime server. Records every client frame as JSON and, unless
/// silent, answers `setup` with `setupComplete`.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<ServerState>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never acknowledges setup.
    pub fn silent() -> Self {
        Self {
            state: Arc::new(ServerState {
                silent: true,
                ..Default::default()
            }),
        }
    }

    /// Connection attempts never complete, like a stalled TCP or TLS open.
    pub fn hanging() -> Self {
        Self {
            state: Arc::new(ServerState {
                hang: true,
                ..Default::default()
            }),
        }
    }

    /// Every connection attempt fails with `reason`.
    pub fn refusing(reason: &str) -> Self {
        Self {
            state: Arc::new(ServerState {
                refuse: Some(reason.to_string()),
                ..Default::default()
            }),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    /// Deliver a server frame on the current connection.
    pub fn push(&self, frame: Value) {
        self.push_raw(&frame.to_string());
    }

    pub fn push_raw(&self, text: &str) {
        if let Some(tx) = self.state.to_client.lock().unwrap().as_ref() {
            let _ = tx.send(SocketEvent::Message(text.to_string()));
        }
    }

    /// Close the current connection from the server side.
    pub fn close(&self, reason: &str) {
        if let Some(tx) = self.state.to_client.lock().unwrap().take() {
            let _ = tx.send(SocketEvent::Closed {
                reason: reason.to_string(),
            });
        }
    }

    /// Every frame the client sent, across all connections.
    pub fn sent(&self) -> Vec<Value> {
        self.state.sent.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// The client dropped its side of the latest connection.
    pub fn client_closed(&self) -> bool {
        self.state.client_closed.load(Ordering::SeqCst)
    }
}

impl Connector for FakeConnector {
    fn connect<'a>(
        &'a self,
        _config: &'a ConnectionConfig,
    ) -> Pin<Box<dyn Future<Output = VoiceResult<SocketChannel>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(reason) = &self.state.refuse {
                return Err(VoiceError::Connection(reason.clone()));
            }
            self.state.connects.fetch_add(1, Ordering::SeqCst);
            if self.state.hang {
                return std::future::pending().await;
            }
            self.state.client_closed.store(false, Ordering::SeqCst);

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            *self.state.to_client.lock().unwrap() = Some(in_tx.clone());

            let state = Arc::clone(&self.state);
            let server = tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    let frame: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
                    let is_setup = frame.get("setup").is_some();
                    state.sent.lock().unwrap().push(frame);
                    if is_setup && !state.silent {
                        let _ = in_tx.send(SocketEvent::Message(r#"{"setupComplete":{}}"#.into()));
                    }
                }
                state.client_closed.store(true, Ordering::SeqCst);
            });

            Ok(SocketChannel {
                outgoing: out_tx,
                incoming: in_rx,
                shutdown: Some(ShutdownHandle::new(vec![server])),
            })
        })
    }
}
