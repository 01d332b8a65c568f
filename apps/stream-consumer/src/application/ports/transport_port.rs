//! Transport Port (Driven Port)
//!
//! Interface for the framed connection carrying protocol messages.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Something that happened on an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A complete inbound frame.
    Frame(Vec<u8>),
    /// The connection ended. No further events follow.
    Closed {
        /// Why the connection ended.
        reason: String,
    },
}

/// Transport error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("transport connect failed: {message}")]
    Connect {
        /// Error details.
        message: String,
    },

    /// Frame could not be written.
    #[error("transport send failed: {message}")]
    Send {
        /// Error details.
        message: String,
    },

    /// No connection is open.
    #[error("transport not connected")]
    NotConnected,
}

/// Port for the streaming connection.
///
/// A transport carries one connection at a time. `connect` replaces any
/// previous connection; frames arrive on the returned receiver in order.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection.
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    /// Write one frame.
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Close the connection. Safe to call when not connected.
    async fn disconnect(&self);
}
