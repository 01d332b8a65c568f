//! In-Memory Transport
//!
//! Loopback [`Transport`] with a peer handle standing in for the server.
//! The peer reads what the client sent, pushes inbound frames, drops the
//! connection and refuses reconnects. Used by tests and for replaying
//! captured frames.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::application::ports::{Transport, TransportError, TransportEvent};

const EVENT_BUFFER: usize = 1024;

/// Client end of the loopback.
#[derive(Debug)]
pub struct InMemoryTransport {
    inbound: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    sent: mpsc::UnboundedSender<Vec<u8>>,
    connects: AtomicUsize,
    refuse_next: AtomicUsize,
}

/// Server end of the loopback.
#[derive(Debug)]
pub struct InMemoryPeer {
    transport: Arc<InMemoryTransport>,
    sent: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl InMemoryTransport {
    /// Create a connected pair.
    #[must_use]
    pub fn new() -> (Arc<Self>, InMemoryPeer) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            inbound: Mutex::new(None),
            sent: sent_tx,
            connects: AtomicUsize::new(0),
            refuse_next: AtomicUsize::new(0),
        });

        let peer = InMemoryPeer {
            transport: Arc::clone(&transport),
            sent: sent_rx,
        };
        (transport, peer)
    }

    fn sender(&self) -> Option<mpsc::Sender<TransportEvent>> {
        self.inbound
            .lock()
            .as_ref()
            .filter(|tx| !tx.is_closed())
            .cloned()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect {
                message: "connection refused".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        *self.inbound.lock() = Some(tx);
        Ok(rx)
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.sender().is_none() {
            return Err(TransportError::NotConnected);
        }
        self.sent.send(frame).map_err(|_| TransportError::Send {
            message: "peer dropped".to_string(),
        })
    }

    async fn disconnect(&self) {
        self.inbound.lock().take();
    }
}

impl InMemoryPeer {
    /// Next frame the client sent, in order.
    pub async fn next_frame(&mut self) -> Option<Vec<u8>> {
        self.sent.recv().await
    }

    /// Frame already sent by the client, without waiting.
    pub fn try_next_frame(&mut self) -> Option<Vec<u8>> {
        self.sent.try_recv().ok()
    }

    /// Deliver an inbound frame to the client.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` when the client has no open connection.
    pub async fn push(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let sender = self.transport.sender().ok_or(TransportError::NotConnected)?;
        sender
            .send(TransportEvent::Frame(frame))
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    /// Deliver captured frames in order.
    ///
    /// # Errors
    ///
    /// Stops at the first frame that cannot be delivered.
    pub async fn replay<I>(&self, frames: I) -> Result<usize, TransportError>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let mut delivered = 0;
        for frame in frames {
            self.push(frame).await?;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Drop the connection as if the network failed.
    pub async fn drop_connection(&self, reason: &str) {
        let sender = self.transport.inbound.lock().take();
        if let Some(sender) = sender {
            let _ = sender
                .send(TransportEvent::Closed {
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_connects(&self, count: usize) {
        self.transport.refuse_next.store(count, Ordering::SeqCst);
    }

    /// Connection attempts so far, refused ones included.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.transport.connects.load(Ordering::SeqCst)
    }

    /// Check whether the client holds an open connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.sender().is_some()
    }
}
