//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Configuration loading.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OAuth2 token endpoint client.
pub mod oauth;

/// Streaming protocol: codec, decoder, dispatcher, session.
pub mod omm;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// WebSocket and in-memory transports.
pub mod transport;
