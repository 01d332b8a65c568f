//! WebSocket Transport
//!
//! [`Transport`] over tokio-tungstenite. Each protocol message travels as
//! one binary frame. A per-connection task owns the socket: it forwards
//! inbound binary frames, answers pings, and writes outbound frames queued
//! by [`send`](Transport::send).

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{Transport, TransportError, TransportEvent};

/// Frames buffered in each direction.
const DEFAULT_BUFFER: usize = 1024;

/// How long `disconnect` waits for the close handshake.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

struct Connection {
    outbound: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// WebSocket client transport.
pub struct WebSocketTransport {
    url: String,
    buffer: usize,
    connection: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl WebSocketTransport {
    /// Create a transport for a `ws://` or `wss://` URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            buffer: DEFAULT_BUFFER,
            connection: Mutex::new(None),
        }
    }

    /// Server URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Check whether a connection task is running.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|c| !c.task.is_finished())
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        self.disconnect().await;

        tracing::info!(url = %self.url, "Connecting to stream");
        let (ws_stream, _response) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| TransportError::Connect {
                message: e.to_string(),
            })?;

        let (events_tx, events_rx) = mpsc::channel(self.buffer);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.buffer);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_connection(
            ws_stream,
            outbound_rx,
            events_tx,
            cancel.clone(),
        ));

        *self.connection.lock() = Some(Connection {
            outbound: outbound_tx,
            cancel,
            task,
        });

        tracing::info!(url = %self.url, "Stream connected");
        Ok(events_rx)
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let outbound = self
            .connection
            .lock()
            .as_ref()
            .map(|c| c.outbound.clone())
            .ok_or(TransportError::NotConnected)?;

        outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    async fn disconnect(&self) {
        let Some(connection) = self.connection.lock().take() else {
            return;
        };

        if !stop_connection(&connection.cancel, connection.task, CLOSE_TIMEOUT).await {
            tracing::warn!("Close handshake timed out, connection task aborted");
        }
        tracing::debug!(url = %self.url, "Stream disconnected");
    }
}

/// Cancel the connection task and wait up to `limit` for it to finish.
/// A task still running after `limit` is aborted; returns `false` then.
async fn stop_connection(
    cancel: &CancellationToken,
    mut task: JoinHandle<()>,
    limit: Duration,
) -> bool {
    cancel.cancel();
    if tokio::time::timeout(limit, &mut task).await.is_ok() {
        return true;
    }
    task.abort();
    false
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn run_connection(
    ws_stream: WsStream,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    let (mut write, mut read) = ws_stream.split();

    let reason = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                if let Err(e) = write.send(Message::Close(None)).await {
                    tracing::debug!(error = %e, "Close frame not sent");
                }
                return;
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    return;
                };
                if let Err(e) = write.send(Message::Binary(frame.into())).await {
                    break format!("write failed: {e}");
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if events.send(TransportEvent::Frame(data.to_vec())).await.is_err() {
                            tracing::debug!("Event receiver dropped");
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            break format!("pong failed: {e}");
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!("Server sent close frame");
                        break frame.map_or_else(
                            || "closed by server".to_string(),
                            |f| {
                                format!(
                                    "closed by server ({}): {}",
                                    u16::from(f.code),
                                    f.reason.as_str()
                                )
                            },
                        );
                    }
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!(len = text.len(), "Ignoring text frame");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            }
        }
    };

    tracing::warn!(reason = %reason, "Stream connection lost");
    let _ = events.send(TransportEvent::Closed { reason }).await;
}
