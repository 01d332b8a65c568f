//! Application Layer - Port definitions.
//!
//! This layer contains the port interfaces that define how the session
//! interacts with external systems (the streaming transport and the OAuth2
//! token endpoint).

/// Port interfaces for external systems (transport, token endpoint).
pub mod ports;
