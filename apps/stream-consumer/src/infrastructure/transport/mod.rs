//! Transport Adapters
//!
//! Implementations of the [`Transport`](crate::application::ports::Transport)
//! port.

mod memory;
mod websocket;

pub use memory::{InMemoryPeer, InMemoryTransport};
pub use websocket::WebSocketTransport;
