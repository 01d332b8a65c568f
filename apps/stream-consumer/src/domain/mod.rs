//! Domain Layer - Core session types and business rules.
//!
//! This layer contains the value types of a streaming session: credentials
//! and tokens, decoded messages and field values, the subscription registry,
//! and the connection state machine. Nothing here performs I/O.

/// Credentials and bearer tokens.
pub mod auth;

/// Field list values and the field dictionary.
pub mod field;

/// Decoded messages and stream/data state.
pub mod message;

/// Connection state machine.
pub mod session;

/// Subscription tracking and management.
pub mod subscription;
