//! Duplex text-frame channel to the realtime endpoint.
//!
//! [`Connector`] is the seam between the session state machine and the
//! network. [`WsConnector`] opens a real WebSocket; tests substitute an
//! in-memory server. Either way the session sees two unbounded channels:
//! outgoing JSON strings and incoming [`SocketEvent`]s.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{VoiceError, VoiceResult};

/// Something that happened on the read side of the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A complete text frame.
    Message(String),
    /// The remote closed the connection.
    Closed { reason: String },
    /// The connection failed.
    Error(String),
}

/// Background tasks owned by an open channel.
pub struct ShutdownHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl ShutdownHandle {
    pub fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self { tasks }
    }

    /// Wait up to `timeout` for the tasks to finish, then abort stragglers.
    pub async fn wait(self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        for mut task in self.tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                debug!("Socket task did not finish in time, aborting");
                task.abort();
            }
        }
    }
}

/// An open connection.
pub struct SocketChannel {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<SocketEvent>,
    pub shutdown: Option<ShutdownHandle>,
}

/// Opens connections to the endpoint.
pub trait Connector: Send + Sync {
    fn connect<'a>(
        &'a self,
        config: &'a ConnectionConfig,
    ) -> Pin<Box<dyn Future<Output = VoiceResult<SocketChannel>> + Send + 'a>>;
}

/// WebSocket connector over tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect<'a>(
        &'a self,
        config: &'a ConnectionConfig,
    ) -> Pin<Box<dyn Future<Output = VoiceResult<SocketChannel>> + Send + 'a>> {
        Box::pin(async move {
            let mut request = config
                .endpoint
                .as_str()
                .into_client_request()
                .map_err(|e| VoiceError::Connection(format!("invalid endpoint: {e}")))?;
            let key = http::HeaderValue::from_str(&config.api_key)
                .map_err(|_| VoiceError::Config("API key is not a valid header value".into()))?;
            request.headers_mut().insert("x-goog-api-key", key);

            info!(endpoint = %config.endpoint, "Connecting to realtime endpoint");
            let (ws_stream, _) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| VoiceError::Connection(e.to_string()))?;
            let (mut writer, mut reader) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel();

            // Writer: forward until every sender is dropped, then close.
            let write_task = tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if let Err(e) = writer.send(Message::Text(text.into())).await {
                        warn!(error = %e, "WebSocket write failed");
                        return;
                    }
                }
                let _ = writer.send(Message::Close(None)).await;
                let _ = writer.close().await;
            });

            let read_task = tokio::spawn(async move {
                while let Some(msg_result) = reader.next().await {
                    let msg = match msg_result {
                        Ok(msg) => msg,
                        Err(e) => {
                            let _ = in_tx.send(SocketEvent::Error(e.to_string()));
                            return;
                        }
                    };
                    let text = match msg {
                        Message::Text(t) => t.to_string(),
                        Message::Binary(b) => match String::from_utf8(b.to_vec()) {
                            Ok(s) => s,
                            Err(_) => {
                                warn!(len = b.len(), "Dropping non-UTF-8 binary frame");
                                continue;
                            }
                        },
                        Message::Close(frame) => {
                            let reason = frame
                                .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                                .unwrap_or_else(|| "closed by remote".into());
                            let _ = in_tx.send(SocketEvent::Closed { reason });
                            return;
                        }
                        _ => continue,
                    };
                    if in_tx.send(SocketEvent::Message(text)).is_err() {
                        return;
                    }
                }
                let _ = in_tx.send(SocketEvent::Closed {
                    reason: "stream ended".into(),
                });
            });

            Ok(SocketChannel {
                outgoing: out_tx,
                incoming: in_rx,
                shutdown: Some(ShutdownHandle::new(vec![write_task, read_task])),
            })
        })
    }
}
