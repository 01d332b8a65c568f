//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Transport`: Framed, bidirectional connection to the streaming server
//! - `TokenEndpoint`: OAuth2 client-credentials exchange

mod token_endpoint_port;
mod transport_port;

pub use token_endpoint_port::{AuthError, TokenEndpoint};
pub use transport_port::{Transport, TransportError, TransportEvent};
