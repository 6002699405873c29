//! Session Controller: the single entry point for the UI layer.
//!
//! Owns the [`SessionState`] and the transcript, wires the transport's
//! event streams into the playback unit and the capture unit's frames into
//! the transport, and republishes every state change as a [`StatePatch`].
//!
//! The audio output is claimed on `connect` and the input on the first
//! `start_listening`; both are released on `disconnect` or when the
//! transport fails, so a later `connect` never races a stale device.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::{
    AudioOutput, CpalMicrophone, Drained, InboundAudio, MicrophoneBackend, MicrophoneCapture, Playback,
    RodioOutput,
};
use crate::config::ConnectionConfig;
use crate::error::{ErrorInfo, VoiceError, VoiceResult};
use crate::events::{Subscribers, Subscription};
use crate::state::{ConnectionStatus, Phase, SessionState, StatePatch};
use crate::transport::protocol::ToolCall;
use crate::transport::{Connector, InterruptSource, TransportSession, WsConnector};

/// Platform audio access used by the controller.
pub trait AudioBackend: Send + Sync {
    /// Microphone backend for new capture units.
    fn microphone(&self) -> Arc<dyn MicrophoneBackend>;

    /// Claim the audio output device. The device is released when the
    /// returned value is dropped.
    fn open_output(&self) -> VoiceResult<Arc<dyn AudioOutput>>;

    /// Ask the platform for microphone permission. Resolves `false` when
    /// denied.
    fn request_microphone_permission(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;
}

/// cpal input plus rodio output on the named (or default) devices.
#[derive(Debug, Clone)]
pub struct DeviceBackend {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub output_volume: f32,
}

impl DeviceBackend {
    pub fn new(input_device: Option<String>, output_device: Option<String>, output_volume: f32) -> Self {
        Self {
            input_device,
            output_device,
            output_volume,
        }
    }
}

impl Default for DeviceBackend {
    fn default() -> Self {
        Self::new(None, None, 1.0)
    }
}

impl AudioBackend for DeviceBackend {
    fn microphone(&self) -> Arc<dyn MicrophoneBackend> {
        Arc::new(CpalMicrophone::new(self.input_device.clone()))
    }

    fn open_output(&self) -> VoiceResult<Arc<dyn AudioOutput>> {
        let output = RodioOutput::open(self.output_device.as_deref(), self.output_volume)?;
        Ok(Arc::new(output))
    }

    fn request_microphone_permission(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        // Desktop hosts grant access at the OS level; a denied device shows
        // up as an error when the stream is opened.
        Box::pin(async { true })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
}

/// One message bubble. Model entries grow as text parts stream in and are
/// sealed (`complete`) at the end of the turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub id: String,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub complete: bool,
}

impl TranscriptEntry {
    fn new(role: Role, text: impl Into<String>, complete: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            text: text.into(),
            timestamp: Utc::now(),
            complete,
        }
    }
}

#[derive(Default)]
struct Devices {
    playback: Option<Arc<Playback>>,
    playback_subscriptions: Vec<Subscription>,
    capture: Option<MicrophoneCapture>,
}

struct ControllerInner {
    transport: Arc<TransportSession>,
    audio: Arc<dyn AudioBackend>,
    state: Mutex<SessionState>,
    transcript: Mutex<Vec<TranscriptEntry>>,
    devices: Mutex<Devices>,
    /// Sequence of the newest frame handed to playback. Held while
    /// `speaking` is raised or lowered for playback.
    speech: Mutex<Option<u64>>,
    updates: Subscribers<StatePatch>,
    transcript_events: Subscribers<TranscriptEntry>,
    text_events: Subscribers<String>,
    tool_calls: Subscribers<ToolCall>,
    lifecycle: tokio::sync::Mutex<()>,
    _transport_subscriptions: Vec<Subscription>,
}

/// Session Controller.
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    pub fn new(connector: Arc<dyn Connector>, audio: Arc<dyn AudioBackend>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ControllerInner>| {
            let transport = Arc::new(TransportSession::new(connector));
            let subscriptions = wire_transport(&transport, weak);
            ControllerInner {
                transport,
                audio,
                state: Mutex::new(SessionState::default()),
                transcript: Mutex::new(Vec::new()),
                devices: Mutex::new(Devices::default()),
                speech: Mutex::new(None),
                updates: Subscribers::new(),
                transcript_events: Subscribers::new(),
                text_events: Subscribers::new(),
                tool_calls: Subscribers::new(),
                lifecycle: tokio::sync::Mutex::new(()),
                _transport_subscriptions: subscriptions,
            }
        });
        Self { inner }
    }

    /// Controller on the real WebSocket transport and system audio devices.
    pub fn with_devices(devices: DeviceBackend) -> Self {
        Self::new(Arc::new(WsConnector), Arc::new(devices))
    }

    /// Claim the speaker and open a session with `config`.
    pub async fn connect(&self, config: ConnectionConfig) -> VoiceResult<()> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;
        if inner.transport.status() != ConnectionStatus::Disconnected {
            return Err(VoiceError::AlreadyConnected);
        }
        inner.update(StatePatch::error(None));

        // Any leftover device claim goes before a new one is made.
        inner.release_devices();
        let output = match inner.audio.open_output() {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "Failed to open audio output");
                inner.update(StatePatch::error(Some((&e).into())));
                return Err(e);
            }
        };
        inner.install_playback(output);

        match inner.transport.connect(&config).await {
            Ok(()) => {
                info!(model = %config.model, voice = ?config.voice_name, "Voice session connected");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Voice session failed to connect");
                inner.release_devices();
                inner.update(StatePatch::reset().with_error(Some((&e).into())));
                Err(e)
            }
        }
    }

    /// End the session and release both audio devices. Idempotent.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;
        inner.release_capture();
        inner.transport.disconnect().await;
        inner.release_devices();
        inner.seal_model_entry();
        inner.update(StatePatch::reset());
    }

    /// Start streaming microphone audio. Permission is checked before any
    /// capture resources are created.
    pub async fn start_listening(&self) -> VoiceResult<()> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;
        if !inner.transport.is_connected() {
            warn!("start_listening called without a connected session");
            return Err(VoiceError::NotConnected);
        }
        if inner.lock_state().listening {
            return Ok(());
        }

        if !inner.audio.request_microphone_permission().await {
            let err = VoiceError::Permission;
            warn!("Microphone permission denied");
            inner.update(StatePatch::error(Some((&err).into())));
            return Err(err);
        }
        // The link may have dropped while the permission prompt was open.
        if !inner.transport.is_connected() {
            warn!("Session ended while waiting for microphone permission");
            return Err(VoiceError::NotConnected);
        }

        let transport = Arc::downgrade(&inner.transport);
        let started = {
            let mut devices = inner.lock_devices();
            let backend = inner.audio.microphone();
            let capture = devices
                .capture
                .get_or_insert_with(|| MicrophoneCapture::new(backend));
            capture.start_recording(Box::new(move |frame| {
                if let Some(transport) = transport.upgrade() {
                    transport.send_audio(&frame);
                }
            }))
        };
        if let Err(e) = started {
            warn!(error = %e, "Failed to start microphone capture");
            inner.update(StatePatch::error(Some((&e).into())));
            return Err(e);
        }

        inner.transport.set_listening(true);
        if !inner.update_while_connected(StatePatch::listening(true).with_error(None)) {
            warn!("Session ended while the microphone was starting");
            inner.release_capture();
            return Err(VoiceError::NotConnected);
        }
        Ok(())
    }

    /// Stop streaming microphone audio. The capture context stays warm for
    /// the next `start_listening`. Idempotent.
    pub fn stop_listening(&self) {
        let inner = &self.inner;
        if let Some(capture) = inner.lock_devices().capture.as_mut() {
            capture.stop_recording();
        }
        inner.transport.set_listening(false);
        inner.update(StatePatch::listening(false).with_error(None));
    }

    /// Send a typed user turn. Ignored when blank or not connected.
    pub fn send_text(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let inner = &self.inner;
        if !inner.transport.is_connected() {
            warn!("send_text called without a connected session");
            return;
        }
        inner.seal_model_entry();
        inner.push_entry(TranscriptEntry::new(Role::User, text, true));
        inner.transport.send_text(text);
        inner.update(StatePatch::processing(true).with_error(None));
    }

    /// Output volume, 1.0 being unchanged. Ignored until connected.
    pub fn set_volume(&self, volume: f32) {
        match self.inner.playback() {
            Some(playback) => playback.set_volume(volume),
            None => debug!(volume, "No playback unit, volume not applied"),
        }
    }

    /// Cut off the model: drop queued audio and stop the frame in flight.
    pub fn interrupt(&self) {
        self.inner.transport.interrupt();
        self.inner.update(StatePatch::error(None));
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock_state().clone()
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock_state().phase()
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.inner.lock_transcript().clone()
    }

    /// Text of the latest model response.
    pub fn response_text(&self) -> String {
        self.inner
            .lock_transcript()
            .iter()
            .rev()
            .find(|e| e.role == Role::Model)
            .map(|e| e.text.clone())
            .unwrap_or_default()
    }

    /// Changed fields of every state transition.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StatePatch) + Send + Sync + 'static,
    {
        self.inner.updates.subscribe(callback)
    }

    /// Each new or updated transcript entry.
    pub fn on_transcript<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&TranscriptEntry) + Send + Sync + 'static,
    {
        self.inner.transcript_events.subscribe(callback)
    }

    /// Model text as it streams in, one delta per part.
    pub fn on_text<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&String) + Send + Sync + 'static,
    {
        self.inner.text_events.subscribe(callback)
    }

    pub fn on_tool_call<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ToolCall) + Send + Sync + 'static,
    {
        self.inner.tool_calls.subscribe(callback)
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.inner.release_capture();
        self.inner.release_devices();
    }
}

/// Subscribe the controller to the transport's event streams.
fn wire_transport(transport: &TransportSession, weak: &Weak<ControllerInner>) -> Vec<Subscription> {
    let mut subs = Vec::new();

    let w = weak.clone();
    subs.push(transport.on_state_change(move |patch| {
        if let (Some(inner), Some(status)) = (w.upgrade(), patch.status) {
            inner.update(StatePatch::status(status));
        }
    }));

    let w = weak.clone();
    subs.push(transport.on_audio(move |audio| {
        if let Some(inner) = w.upgrade() {
            inner.on_model_audio(audio);
        }
    }));

    let w = weak.clone();
    subs.push(transport.on_text(move |text| {
        if let Some(inner) = w.upgrade() {
            inner.on_model_text(text);
        }
    }));

    let w = weak.clone();
    subs.push(transport.on_turn_complete(move |_| {
        if let Some(inner) = w.upgrade() {
            inner.seal_model_entry();
            inner.update(StatePatch::processing(false));
        }
    }));

    let w = weak.clone();
    subs.push(transport.on_interrupted(move |source| {
        if let Some(inner) = w.upgrade() {
            inner.on_interrupted(*source);
        }
    }));

    let w = weak.clone();
    subs.push(transport.on_tool_call(move |call| {
        if let Some(inner) = w.upgrade() {
            inner.tool_calls.publish(call);
        }
    }));

    let w = weak.clone();
    subs.push(transport.on_error(move |err| {
        if let Some(inner) = w.upgrade() {
            inner.on_transport_error(err);
        }
    }));

    subs
}

impl ControllerInner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_transcript(&self) -> MutexGuard<'_, Vec<TranscriptEntry>> {
        self.transcript
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_speech(&self) -> MutexGuard<'_, Option<u64>> {
        self.speech
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_devices(&self) -> MutexGuard<'_, Devices> {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `patch` and publish whatever actually changed.
    fn update(&self, patch: StatePatch) {
        let (changed, phase) = {
            let mut state = self.lock_state();
            let changed = state.apply(patch);
            (changed, state.phase())
        };
        if let Some(changed) = changed {
            debug!(%phase, ?changed, "Session state changed");
            self.updates.publish(&changed);
        }
    }

    /// Like [`update`](Self::update), but only while the session is still
    /// connected. Returns `false` (and applies nothing) otherwise.
    fn update_while_connected(&self, patch: StatePatch) -> bool {
        let (changed, phase) = {
            let mut state = self.lock_state();
            if state.status != ConnectionStatus::Connected {
                return false;
            }
            let changed = state.apply(patch);
            (changed, state.phase())
        };
        if let Some(changed) = changed {
            debug!(%phase, ?changed, "Session state changed");
            self.updates.publish(&changed);
        }
        true
    }

    fn playback(&self) -> Option<Arc<Playback>> {
        self.lock_devices().playback.clone()
    }

    fn install_playback(self: &Arc<Self>, output: Arc<dyn AudioOutput>) {
        let playback = Arc::new(Playback::new(output));
        let weak = Arc::downgrade(self);
        let drained = playback.on_drained(move |drained| {
            if let Some(inner) = weak.upgrade() {
                inner.on_playback_drained(drained);
            }
        });
        *self.lock_speech() = None;
        let mut devices = self.lock_devices();
        devices.playback = Some(playback);
        devices.playback_subscriptions.push(drained);
    }

    /// Dispose the playback unit and the capture unit.
    fn release_devices(&self) {
        let (playback, subscriptions, capture) = {
            let mut devices = self.lock_devices();
            (
                devices.playback.take(),
                std::mem::take(&mut devices.playback_subscriptions),
                devices.capture.take(),
            )
        };
        for sub in subscriptions {
            sub.unsubscribe();
        }
        if let Some(playback) = playback {
            playback.dispose();
        }
        if let Some(mut capture) = capture {
            capture.dispose();
        }
    }

    fn release_capture(&self) {
        let capture = self.lock_devices().capture.take();
        if let Some(mut capture) = capture {
            capture.dispose();
        }
    }

    fn on_model_audio(&self, audio: &InboundAudio) {
        let Some(playback) = self.playback() else {
            warn!("Model audio arrived with no playback unit, dropping");
            return;
        };
        let mut speech = self.lock_speech();
        self.update(StatePatch {
            speaking: Some(true),
            processing: Some(false),
            ..Default::default()
        });
        if let Some(sequence) = playback.enqueue(audio.clone()) {
            *speech = Some(sequence);
        }
    }

    /// Lower `speaking` unless a frame newer than the drained ones is
    /// already queued.
    fn on_playback_drained(&self, drained: &Drained) {
        let speech = self.lock_speech();
        if *speech == drained.last_sequence {
            self.update(StatePatch::speaking(false));
        } else {
            debug!(?drained, newest = ?*speech, "Stale drain ignored");
        }
    }

    fn on_model_text(&self, text: &str) {
        let entry = {
            let mut transcript = self.lock_transcript();
            match transcript.last_mut() {
                Some(last) if last.role == Role::Model && !last.complete => {
                    last.text.push_str(text);
                    last.clone()
                }
                _ => {
                    let entry = TranscriptEntry::new(Role::Model, text, false);
                    transcript.push(entry.clone());
                    entry
                }
            }
        };
        self.text_events.publish(&text.to_string());
        self.transcript_events.publish(&entry);
        self.update(StatePatch::processing(false));
    }

    fn on_interrupted(&self, source: InterruptSource) {
        debug!(?source, "Discarding queued model audio");
        if let Some(playback) = self.playback() {
            playback.interrupt();
        }
        self.seal_model_entry();
        self.update(StatePatch::speaking(false));
    }

    fn on_transport_error(&self, err: &VoiceError) {
        warn!(error = %err, "Voice session ended by transport error");
        self.release_capture();
        self.release_devices();
        self.seal_model_entry();
        let info: ErrorInfo = err.into();
        self.update(StatePatch::reset().with_error(Some(info)));
    }

    fn push_entry(&self, entry: TranscriptEntry) {
        self.lock_transcript().push(entry.clone());
        self.transcript_events.publish(&entry);
    }

    fn seal_model_entry(&self) {
        let sealed = {
            let mut transcript = self.lock_transcript();
            match transcript.last_mut() {
                Some(last) if last.role == Role::Model && !last.complete => {
                    last.complete = true;
                    Some(last.clone())
                }
                _ => None,
            }
        };
        if let Some(entry) = sealed {
            self.transcript_events.publish(&entry);
        }
    }
}
