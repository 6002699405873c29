//! Transport Session: one persistent duplex connection to the realtime
//! endpoint.
//!
//! `connect` opens the socket, sends the setup frame and resolves on the
//! server's `setupComplete`. Incoming frames are demultiplexed into typed
//! subscriber lists (audio, text, turn boundaries, interruptions, tool
//! calls). Transport failures end the session and are reported once on the
//! error channel; nothing here reconnects on its own.

pub mod protocol;
pub mod socket;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::audio::{AudioFrame, InboundAudio};
use crate::config::ConnectionConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::events::{Subscribers, Subscription};
use crate::state::{ConnectionStatus, StatePatch};
use protocol::{
    client_content_frame, parse_server_message, realtime_input_frame, setup_frame, ServerContent,
    ToolCall,
};
pub use socket::{Connector, SocketChannel, SocketEvent, WsConnector};
use socket::ShutdownHandle;

/// How long `disconnect` waits for the socket tasks to wind down.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Why queued model audio should be discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    /// The local user cut the model off.
    Local,
    /// The server reported the turn as interrupted.
    Remote,
    /// The session ended.
    Disconnect,
}

#[derive(Default)]
struct Link {
    status: ConnectionStatus,
    listening: bool,
    speaking: bool,
    /// Bumped on every connect and teardown. Reader tasks carry the value
    /// they were started with and go quiet once it is stale.
    generation: u64,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    reader: Option<JoinHandle<()>>,
    shutdown: Option<ShutdownHandle>,
    handshake: Option<oneshot::Sender<VoiceResult<()>>>,
    dropped_sends: u64,
}

struct TransportShared {
    link: Mutex<Link>,
    audio: Subscribers<InboundAudio>,
    text: Subscribers<String>,
    state: Subscribers<StatePatch>,
    interrupted: Subscribers<InterruptSource>,
    turn_complete: Subscribers<()>,
    tool_call: Subscribers<ToolCall>,
    errors: Subscribers<VoiceError>,
}

/// Transport Session.
pub struct TransportSession {
    connector: Arc<dyn Connector>,
    shared: Arc<TransportShared>,
    /// Serializes connect and disconnect so a new socket is never opened
    /// while the previous one is still closing.
    lifecycle: tokio::sync::Mutex<()>,
}

impl TransportSession {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            shared: Arc::new(TransportShared {
                link: Mutex::new(Link::default()),
                audio: Subscribers::new(),
                text: Subscribers::new(),
                state: Subscribers::new(),
                interrupted: Subscribers::new(),
                turn_complete: Subscribers::new(),
                tool_call: Subscribers::new(),
                errors: Subscribers::new(),
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Open the connection and complete the setup handshake.
    ///
    /// Rejects with [`VoiceError::AlreadyConnected`] unless disconnected.
    /// Opening the socket and waiting for `setupComplete` share one
    /// deadline of `config.handshake_timeout`; past it the attempt fails
    /// with [`VoiceError::HandshakeTimeout`]. Any failure leaves the
    /// session disconnected with the socket released.
    pub async fn connect(&self, config: &ConnectionConfig) -> VoiceResult<()> {
        let deadline = Instant::now() + config.handshake_timeout;
        if self.status() != ConnectionStatus::Disconnected {
            return Err(VoiceError::AlreadyConnected);
        }

        let ack = {
            let _guard = self.lifecycle.lock().await;

            let generation = {
                let mut link = self.shared.lock_link();
                if link.status != ConnectionStatus::Disconnected {
                    return Err(VoiceError::AlreadyConnected);
                }
                link.status = ConnectionStatus::Connecting;
                link.generation += 1;
                link.dropped_sends = 0;
                link.generation
            };
            self.shared
                .state
                .publish(&StatePatch::status(ConnectionStatus::Connecting));

            let channel = match timeout_at(deadline, self.connector.connect(config)).await {
                Ok(Ok(channel)) => channel,
                Ok(Err(e)) => {
                    warn!(error = %e, "Failed to open realtime connection");
                    self.shared.abandon(generation);
                    return Err(e);
                }
                Err(_) => {
                    warn!(timeout = ?config.handshake_timeout, "Timed out opening realtime connection");
                    self.shared.abandon(generation);
                    return Err(VoiceError::HandshakeTimeout(config.handshake_timeout));
                }
            };

            let setup = match setup_frame(config).to_json() {
                Ok(json) => json,
                Err(e) => {
                    self.shared.abandon(generation);
                    return Err(e);
                }
            };
            if channel.outgoing.send(setup).is_err() {
                self.shared.abandon(generation);
                return Err(VoiceError::Connection(
                    "connection closed before setup was sent".into(),
                ));
            }
            debug!(model = %config.model, "Setup frame sent");

            let (ack_tx, ack_rx) = oneshot::channel();
            let mut link = self.shared.lock_link();
            if link.generation != generation {
                return Err(VoiceError::Connection("connect cancelled".into()));
            }
            link.outgoing = Some(channel.outgoing);
            link.shutdown = channel.shutdown;
            link.handshake = Some(ack_tx);
            link.reader = Some(tokio::spawn(read_loop(
                Arc::clone(&self.shared),
                channel.incoming,
                generation,
            )));
            ack_rx
        };

        let result = match timeout_at(deadline, ack).await {
            Ok(Ok(Ok(()))) => {
                info!("Realtime session established");
                return Ok(());
            }
            Ok(Ok(Err(e))) => e,
            Ok(Err(_)) => VoiceError::Connection("handshake abandoned".into()),
            Err(_) => {
                warn!(timeout = ?config.handshake_timeout, "Handshake timed out");
                VoiceError::HandshakeTimeout(config.handshake_timeout)
            }
        };
        self.disconnect().await;
        Err(result)
    }

    /// Close the connection. Queued model audio is discarded through the
    /// interrupt channel. Idempotent.
    pub async fn disconnect(&self) {
        let _guard = self.lifecycle.lock().await;

        let (previous, handshake, reader, shutdown, outgoing) = {
            let mut link = self.shared.lock_link();
            if link.status == ConnectionStatus::Disconnected
                && link.outgoing.is_none()
                && link.shutdown.is_none()
            {
                return;
            }
            link.generation += 1;
            let previous = (link.status, link.listening, link.speaking);
            link.status = ConnectionStatus::Disconnected;
            link.listening = false;
            link.speaking = false;
            (
                previous,
                link.handshake.take(),
                link.reader.take(),
                link.shutdown.take(),
                link.outgoing.take(),
            )
        };

        // Dropping the last sender makes the writer send a close frame.
        drop(outgoing);
        if let Some(tx) = handshake {
            let _ = tx.send(Err(VoiceError::Connection(
                "disconnected during handshake".into(),
            )));
        }
        if let Some(reader) = reader {
            reader.abort();
        }
        self.shared.interrupted.publish(&InterruptSource::Disconnect);
        if let Some(shutdown) = shutdown {
            shutdown.wait(CLOSE_TIMEOUT).await;
        }

        let patch = teardown_patch(previous);
        if !patch.is_empty() {
            self.shared.state.publish(&patch);
        }
        info!("Realtime session closed");
    }

    /// Send one captured frame. Dropped with a warning unless connected.
    pub fn send_audio(&self, frame: &AudioFrame) {
        let Some(tx) = self.shared.sender("audio") else {
            return;
        };
        match realtime_input_frame(frame).to_json() {
            Ok(json) => {
                if tx.send(json).is_err() {
                    debug!("Socket writer gone, audio frame dropped");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode audio frame"),
        }
    }

    /// Send a typed user turn. Dropped with a warning unless connected.
    pub fn send_text(&self, text: &str) {
        let Some(tx) = self.shared.sender("text") else {
            return;
        };
        match client_content_frame(text).to_json() {
            Ok(json) => {
                if tx.send(json).is_err() {
                    debug!("Socket writer gone, text dropped");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode text turn"),
        }
    }

    /// Record whether microphone audio is being streamed. Ignored unless
    /// connected.
    pub fn set_listening(&self, listening: bool) {
        let changed = {
            let mut link = self.shared.lock_link();
            if link.status != ConnectionStatus::Connected || link.listening == listening {
                false
            } else {
                link.listening = listening;
                true
            }
        };
        if changed {
            self.shared.state.publish(&StatePatch::listening(listening));
        }
    }

    /// Local barge-in: discard queued model audio and mark the model as
    /// no longer speaking. Nothing is sent to the server.
    pub fn interrupt(&self) {
        self.shared.interrupted.publish(&InterruptSource::Local);
        self.shared.set_speaking(false);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.lock_link().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn is_listening(&self) -> bool {
        self.shared.lock_link().listening
    }

    pub fn is_speaking(&self) -> bool {
        self.shared.lock_link().speaking
    }

    pub fn on_audio<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&InboundAudio) + Send + Sync + 'static,
    {
        self.shared.audio.subscribe(callback)
    }

    pub fn on_text<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&String) + Send + Sync + 'static,
    {
        self.shared.text.subscribe(callback)
    }

    pub fn on_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StatePatch) + Send + Sync + 'static,
    {
        self.shared.state.subscribe(callback)
    }

    pub fn on_interrupted<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&InterruptSource) + Send + Sync + 'static,
    {
        self.shared.interrupted.subscribe(callback)
    }

    pub fn on_turn_complete<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&()) + Send + Sync + 'static,
    {
        self.shared.turn_complete.subscribe(callback)
    }

    /// Tool calls are surfaced as-is; nothing in the session acts on them.
    pub fn on_tool_call<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ToolCall) + Send + Sync + 'static,
    {
        self.shared.tool_call.subscribe(callback)
    }

    /// Transport failures after the handshake. Each ends the session.
    pub fn on_error<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&VoiceError) + Send + Sync + 'static,
    {
        self.shared.errors.subscribe(callback)
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        let mut link = self.shared.lock_link();
        link.generation += 1;
        link.outgoing = None;
        link.handshake = None;
        link.shutdown = None;
        if let Some(reader) = link.reader.take() {
            reader.abort();
        }
    }
}

fn teardown_patch(previous: (ConnectionStatus, bool, bool)) -> StatePatch {
    let (status, listening, speaking) = previous;
    StatePatch {
        status: (status != ConnectionStatus::Disconnected).then_some(ConnectionStatus::Disconnected),
        listening: listening.then_some(false),
        speaking: speaking.then_some(false),
        ..Default::default()
    }
}

impl TransportShared {
    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Outgoing sender, if connected. Logs the first dropped send per
    /// session at warn level and the rest at debug.
    fn sender(&self, what: &str) -> Option<mpsc::UnboundedSender<String>> {
        let mut link = self.lock_link();
        if link.status == ConnectionStatus::Connected {
            if let Some(tx) = &link.outgoing {
                return Some(tx.clone());
            }
        }
        link.dropped_sends += 1;
        if link.dropped_sends == 1 {
            warn!(status = %link.status, "Not connected, dropping outgoing {}", what);
        } else {
            debug!(status = %link.status, "Not connected, dropping outgoing {}", what);
        }
        None
    }

    /// Roll back a connect attempt that never got its reader running.
    fn abandon(&self, generation: u64) {
        let changed = {
            let mut link = self.lock_link();
            if link.generation != generation {
                return;
            }
            link.generation += 1;
            let changed = link.status != ConnectionStatus::Disconnected;
            link.status = ConnectionStatus::Disconnected;
            changed
        };
        if changed {
            self.state
                .publish(&StatePatch::status(ConnectionStatus::Disconnected));
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock_link().generation == generation
    }

    fn set_speaking(&self, speaking: bool) {
        let changed = {
            let mut link = self.lock_link();
            if link.status != ConnectionStatus::Connected || link.speaking == speaking {
                false
            } else {
                link.speaking = speaking;
                true
            }
        };
        if changed {
            self.state.publish(&StatePatch::speaking(speaking));
        }
    }

    fn handle_frame(&self, text: &str, generation: u64) {
        let parsed = match parse_server_message(text) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Ignoring unparseable server frame");
                return;
            }
        };
        if parsed.is_unrecognized() {
            warn!(keys = ?parsed.unknown_keys, "Ignoring unrecognized server frame");
            return;
        }
        if !parsed.unknown_keys.is_empty() {
            debug!(keys = ?parsed.unknown_keys, "Server frame has unhandled fields");
        }

        let message = parsed.message;
        if message.setup_complete.is_some() {
            self.complete_handshake(generation);
        }
        if let Some(content) = message.server_content {
            if self.is_current(generation) {
                self.handle_content(content);
            }
        }
        if let Some(call) = message.tool_call {
            if self.is_current(generation) {
                let names: Vec<&str> = call.function_calls.iter().map(|c| c.name.as_str()).collect();
                info!(functions = ?names, "Tool call received");
                self.tool_call.publish(&call);
            }
        }
    }

    fn complete_handshake(&self, generation: u64) {
        let ack = {
            let mut link = self.lock_link();
            if link.generation != generation {
                return;
            }
            if link.status != ConnectionStatus::Connecting {
                debug!("Duplicate setupComplete ignored");
                return;
            }
            link.status = ConnectionStatus::Connected;
            link.handshake.take()
        };
        self.state
            .publish(&StatePatch::status(ConnectionStatus::Connected));
        if let Some(tx) = ack {
            let _ = tx.send(Ok(()));
        }
    }

    fn handle_content(&self, content: ServerContent) {
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                    self.text.publish(&text);
                }
                if let Some(blob) = part.inline_data {
                    match blob.decode() {
                        Ok(audio) => {
                            self.set_speaking(true);
                            self.audio.publish(&audio);
                        }
                        Err(e) => warn!(error = %e, "Skipping undecodable audio part"),
                    }
                }
            }
        }
        if content.interrupted {
            info!("Model turn interrupted by server");
            self.interrupted.publish(&InterruptSource::Remote);
            self.set_speaking(false);
        }
        if content.turn_complete {
            debug!("Model turn complete");
            self.set_speaking(false);
            self.turn_complete.publish(&());
        }
    }

    /// The socket closed or failed underneath us. During the handshake the
    /// error goes to the pending `connect`; afterwards it is published.
    fn link_lost(&self, generation: u64, error: VoiceError) {
        let (previous, handshake) = {
            let mut link = self.lock_link();
            if link.generation != generation || link.status == ConnectionStatus::Disconnected {
                return;
            }
            link.generation += 1;
            let previous = (link.status, link.listening, link.speaking);
            link.status = ConnectionStatus::Disconnected;
            link.listening = false;
            link.speaking = false;
            link.outgoing = None;
            link.shutdown = None;
            link.reader = None;
            (previous, link.handshake.take())
        };

        warn!(error = %error, "Realtime connection lost");
        self.interrupted.publish(&InterruptSource::Disconnect);
        self.state.publish(&teardown_patch(previous));
        match handshake {
            Some(tx) => {
                let _ = tx.send(Err(error));
            }
            None => self.errors.publish(&error),
        }
    }
}

async fn read_loop(
    shared: Arc<TransportShared>,
    mut incoming: mpsc::UnboundedReceiver<SocketEvent>,
    generation: u64,
) {
    while let Some(event) = incoming.recv().await {
        match event {
            SocketEvent::Message(text) => shared.handle_frame(&text, generation),
            SocketEvent::Closed { reason } => {
                shared.link_lost(
                    generation,
                    VoiceError::Connection(format!("connection closed: {reason}")),
                );
                return;
            }
            SocketEvent::Error(e) => {
                shared.link_lost(generation, VoiceError::Connection(e));
                return;
            }
        }
    }
    shared.link_lost(
        generation,
        VoiceError::Connection("connection dropped".into()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_until, FakeConnector};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> ConnectionConfig {
        ConnectionConfig::new("test-key").with_handshake_timeout(Duration::from_millis(200))
    }

    fn record<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |v: &T| sink.lock().unwrap().push(v.clone()))
    }

    #[tokio::test]
    async fn test_connect_sends_setup_and_waits_for_ack() {
        let server = FakeConnector::new();
        let transport = TransportSession::new(server.connector());
        let (states, cb) = record::<StatePatch>();
        let _sub = transport.on_state_change(cb);

        transport.connect(&config()).await.unwrap();

        assert!(transport.is_connected());
        let sent = server.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["setup"]["model"], config().model);
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                StatePatch::status(ConnectionStatus::Connecting),
                StatePatch::status(ConnectionStatus::Connected),
            ]
        );
    }

    #[tokio::test]
    async fn test_handshake_timeout_releases_socket() {
        let server = FakeConnector::silent();
        let transport = TransportSession::new(server.connector());

        let err = transport
            .connect(&config().with_handshake_timeout(Duration::from_millis(50)))
            .await
            .unwrap_err();

        assert!(matches!(err, VoiceError::HandshakeTimeout(_)));
        assert_eq!(transport.status(), ConnectionStatus::Disconnected);
        assert!(wait_until(|| server.client_closed()).await);
    }

    #[tokio::test]
    async fn test_second_connect_is_rejected() {
        let server = FakeConnector::new();
        let transport = TransportSession::new(server.connector());
        transport.connect(&config()).await.unwrap();

        let err = transport.connect(&config()).await.unwrap_err();
        assert!(matches!(err, VoiceError::AlreadyConnected));
        assert_eq!(server.connects(), 1);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_connect_while_connecting_is_rejected() {
        let server = FakeConnector::silent();
        let transport = Arc::new(TransportSession::new(server.connector()));

        let t = Arc::clone(&transport);
        let pending = tokio::spawn(async move { t.connect(&config()).await });
        assert!(wait_until(|| server.sent().len() == 1).await);
        assert_eq!(transport.status(), ConnectionStatus::Connecting);

        let err = transport.connect(&config()).await.unwrap_err();
        assert!(matches!(err, VoiceError::AlreadyConnected));
        assert_eq!(server.connects(), 1);

        let first = pending.await.unwrap().unwrap_err();
        assert!(matches!(first, VoiceError::HandshakeTimeout(_)));
    }

    #[tokio::test]
    async fn test_stalled_socket_open_is_bounded() {
        let server = FakeConnector::hanging();
        let transport = Arc::new(TransportSession::new(server.connector()));
        let (states, on_state) = record::<StatePatch>();
        let _sub = transport.on_state_change(on_state);

        let t = Arc::clone(&transport);
        let pending = tokio::spawn(async move {
            t.connect(&config().with_handshake_timeout(Duration::from_millis(50)))
                .await
        });
        assert!(wait_until(|| server.connects() == 1).await);

        // A second caller is turned away while the socket is still opening.
        let err = transport.connect(&config()).await.unwrap_err();
        assert!(matches!(err, VoiceError::AlreadyConnected));

        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("connect must give up at its deadline")
            .unwrap();
        assert!(matches!(result, Err(VoiceError::HandshakeTimeout(_))));
        assert_eq!(transport.status(), ConnectionStatus::Disconnected);
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                StatePatch::status(ConnectionStatus::Connecting),
                StatePatch::status(ConnectionStatus::Disconnected),
            ]
        );

        tokio::time::timeout(Duration::from_secs(1), transport.disconnect())
            .await
            .expect("disconnect must not wait on the abandoned attempt");
    }

    #[tokio::test]
    async fn test_refused_connection_is_connection_error() {
        let server = FakeConnector::refusing("connection refused");
        let transport = TransportSession::new(server.connector());
        let err = transport.connect(&config()).await.unwrap_err();
        assert!(matches!(err, VoiceError::Connection(_)));
        assert_eq!(transport.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_sends_before_handshake_are_dropped() {
        let server = FakeConnector::silent();
        let transport = Arc::new(TransportSession::new(server.connector()));

        // Before connect: nothing to send on.
        transport.send_text("early");
        transport.send_audio(&AudioFrame::new(vec![0; 16]));

        let t = Arc::clone(&transport);
        let pending = tokio::spawn(async move { t.connect(&config()).await });
        assert!(wait_until(|| server.sent().len() == 1).await);
        assert_eq!(transport.status(), ConnectionStatus::Connecting);

        // Socket open, setupComplete not yet received.
        transport.send_text("still early");
        transport.send_audio(&AudioFrame::new(vec![0; 16]));

        server.push(json!({ "setupComplete": {} }));
        pending.await.unwrap().unwrap();

        transport.send_text("now");
        assert!(wait_until(|| server.sent().len() == 2).await);
        let sent = server.sent();
        assert!(sent[0].get("setup").is_some());
        assert_eq!(sent[1]["clientContent"]["turns"][0]["parts"][0]["text"], "now");
    }

    #[tokio::test]
    async fn test_demultiplexes_text_audio_and_turn_complete() {
        let server = FakeConnector::new();
        let transport = TransportSession::new(server.connector());
        let (texts, on_text) = record::<String>();
        let (audio, on_audio) = record::<InboundAudio>();
        let (states, on_state) = record::<StatePatch>();
        let turns = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&turns);
        let _s1 = transport.on_text(on_text);
        let _s2 = transport.on_audio(on_audio);
        let _s4 = transport.on_turn_complete(move |_| {
            t.fetch_add(1, Ordering::SeqCst);
        });
        transport.connect(&config()).await.unwrap();
        let _s3 = transport.on_state_change(on_state);

        server.push(json!({ "serverContent": { "modelTurn": { "parts": [{ "text": "Hello" }] } } }));
        server.push(json!({ "serverContent": { "modelTurn": { "parts": [
            { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AQD+/w==" } }
        ] } } }));
        server.push(json!({ "serverContent": { "turnComplete": true } }));

        assert!(wait_until(|| turns.load(Ordering::SeqCst) == 1).await);
        assert_eq!(*texts.lock().unwrap(), vec!["Hello".to_string()]);
        let audio = audio.lock().unwrap();
        assert_eq!(audio.len(), 1);
        assert_eq!(audio[0].mime_type, "audio/pcm;rate=24000");
        assert_eq!(audio[0].data, vec![0x01, 0x00, 0xFE, 0xFF]);
        assert_eq!(
            *states.lock().unwrap(),
            vec![StatePatch::speaking(true), StatePatch::speaking(false)]
        );
        assert!(!transport.is_speaking());
    }

    #[tokio::test]
    async fn test_unrecognized_frames_do_not_end_session() {
        let server = FakeConnector::new();
        let transport = TransportSession::new(server.connector());
        let (texts, on_text) = record::<String>();
        let _sub = transport.on_text(on_text);
        transport.connect(&config()).await.unwrap();

        server.push_raw("not json at all");
        server.push(json!({ "usageMetadata": { "totalTokenCount": 12 } }));
        server.push(json!({ "serverContent": { "modelTurn": { "parts": [{ "text": "still here" }] } } }));

        assert!(wait_until(|| texts.lock().unwrap().len() == 1).await);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_remote_interruption_is_published() {
        let server = FakeConnector::new();
        let transport = TransportSession::new(server.connector());
        let (sources, on_interrupt) = record::<InterruptSource>();
        let _sub = transport.on_interrupted(on_interrupt);
        transport.connect(&config()).await.unwrap();

        server.push(json!({ "serverContent": { "modelTurn": { "parts": [
            { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAA=" } }
        ] } } }));
        assert!(wait_until(|| transport.is_speaking()).await);

        server.push(json!({ "serverContent": { "interrupted": true } }));
        assert!(wait_until(|| !sources.lock().unwrap().is_empty()).await);
        assert_eq!(*sources.lock().unwrap(), vec![InterruptSource::Remote]);
        assert!(!transport.is_speaking());
    }

    #[tokio::test]
    async fn test_local_interrupt_sends_nothing() {
        let server = FakeConnector::new();
        let transport = TransportSession::new(server.connector());
        let (sources, on_interrupt) = record::<InterruptSource>();
        let _sub = transport.on_interrupted(on_interrupt);
        transport.connect(&config()).await.unwrap();

        transport.interrupt();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*sources.lock().unwrap(), vec![InterruptSource::Local]);
        assert_eq!(server.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_remote_close_ends_session_with_error() {
        let server = FakeConnector::new();
        let transport = TransportSession::new(server.connector());
        let (errors, on_error) = {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            (seen, move |e: &VoiceError| sink.lock().unwrap().push(e.to_string()))
        };
        let _sub = transport.on_error(on_error);
        transport.connect(&config()).await.unwrap();
        transport.set_listening(true);

        server.close("going away");

        assert!(wait_until(|| transport.status() == ConnectionStatus::Disconnected).await);
        assert!(!transport.is_listening());
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("going away"));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let server = FakeConnector::new();
        let transport = TransportSession::new(server.connector());
        transport.connect(&config()).await.unwrap();
        let (states, on_state) = record::<StatePatch>();
        let _sub = transport.on_state_change(on_state);

        transport.disconnect().await;
        transport.disconnect().await;

        assert_eq!(
            *states.lock().unwrap(),
            vec![StatePatch::status(ConnectionStatus::Disconnected)]
        );
        assert!(server.client_closed());
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let server = FakeConnector::new();
        let transport = TransportSession::new(server.connector());
        transport.connect(&config()).await.unwrap();
        transport.disconnect().await;
        transport.connect(&config()).await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(server.connects(), 2);
    }
}
