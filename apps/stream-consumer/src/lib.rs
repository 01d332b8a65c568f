#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Stream Consumer - Market Data Subscription Session
//!
//! A client for a streaming market-data service. It authenticates with OAuth2
//! client credentials, keeps one long-lived session alive across token
//! expiry and transport loss, and routes typed messages to per-kind handlers
//! with their field lists decoded.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Protocol-independent types
//!   - `auth`: Credentials and tokens
//!   - `field`: Field values, entries and the field dictionary
//!   - `message`: Message kinds, domains, stream and data states
//!   - `session`: Connection state machine
//!   - `subscription`: Handles and the subscription registry
//!
//! - **Application**: Port definitions
//!   - `ports`: Transport and token endpoint interfaces
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `omm`: Wire codec, field list decoder, dispatcher, token manager, session
//!   - `transport`: WebSocket and in-memory transports
//!   - `oauth`: HTTP token endpoint
//!   - `config`, `telemetry`, `metrics`: ambient services
//!
//! # Data Flow
//!
//! ```text
//!                 ┌──────────────┐   token   ┌──────────────┐
//!                 │ TokenManager │◄─────────►│ OAuth2 (HTTP)│
//!                 └──────┬───────┘           └──────────────┘
//!                        │ login / reissue
//!                 ┌──────▼───────┐  frames   ┌──────────────┐
//!  subscribe ───► │   Session    │◄─────────►│  WebSocket   │
//!                 └──────┬───────┘           └──────────────┘
//!                        │ inbound
//!                 ┌──────▼───────┐  lookup   ┌──────────────┐
//!                 │  Dispatcher  │──────────►│   Registry   │
//!                 └──────┬───────┘           └──────────────┘
//!                        │ decoded message
//!                        ▼
//!                    handlers
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no I/O.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::auth::{Credentials, Token, TokenGrant};
pub use domain::field::{FieldDictionary, FieldEntry, FieldValue, TypeTag};
pub use domain::message::{DomainKind, Message, MessageKind, State};
pub use domain::session::ConnectionState;
pub use domain::subscription::{
    Handle, RegistryError, Subscription, SubscriptionRegistry, SubscriptionRequest,
    SubscriptionStats, SubscriptionStatus,
};

// Ports
pub use application::ports::{AuthError, TokenEndpoint, Transport, TransportError, TransportEvent};

// Configuration
pub use infrastructure::config::{ConfigError, ConsumerConfig};

// Session
pub use infrastructure::omm::{
    DispatchOutcome, FieldListDecoder, MessageHandlers, Session, SessionConfig, SessionError,
    SessionEvent, StreamDispatcher, TokenManager,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
