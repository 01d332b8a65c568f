//! Prometheus Metrics Module
//!
//! Session instrumentation through the `metrics` facade. Recording is a
//! no-op until the binary installs the Prometheus exporter.
//!
//! # Metrics Categories
//!
//! - **Messages**: dispatched and dropped inbound messages
//! - **Fields**: entries that failed to decode
//! - **Session**: connection state, reconnects, token renewals
//! - **Subscriptions**: registry size per status
//! - **Latency**: dispatch time per message
//!
//! # Integration
//!
//! The exporter serves `/metrics` on `CONSUMER_METRICS_PORT`.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::domain::message::MessageKind;
use crate::domain::session::ConnectionState;
use crate::domain::subscription::SubscriptionStats;

// =============================================================================
// Exporter
// =============================================================================

/// Install the Prometheus recorder and its HTTP listener.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns an error if a global recorder is already installed or the
/// listener cannot bind.
pub fn init_metrics(port: u16) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
        .install()?;

    register_metrics();
    Ok(())
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "stream_consumer_messages_dispatched_total",
        "Inbound messages delivered to a handler"
    );
    describe_counter!(
        "stream_consumer_messages_dropped_total",
        "Inbound messages dropped by the dispatcher"
    );
    describe_counter!(
        "stream_consumer_field_decode_errors_total",
        "Field entries that could not be decoded"
    );

    describe_gauge!(
        "stream_consumer_connection_state",
        "Connection state (0 disconnected, 1 connecting, 2 logged in, 3 logging out, 4 closed)"
    );
    describe_counter!(
        "stream_consumer_reconnects_total",
        "Transport reconnection attempts"
    );
    describe_counter!(
        "stream_consumer_token_renewals_total",
        "Token renewal attempts by outcome"
    );

    describe_gauge!(
        "stream_consumer_subscriptions",
        "Registered subscriptions by status"
    );

    describe_histogram!(
        "stream_consumer_dispatch_seconds",
        "Time to decode and deliver one inbound message"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Why an inbound message was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// The frame was not a valid envelope.
    Unparseable,
    /// The `type` field named no known message kind.
    UnknownKind,
    /// No subscription exists for the stream id.
    UnknownHandle,
    /// The field list container was malformed.
    InvalidFieldList,
    /// No handler is installed for the kind.
    NoHandler,
}

impl DropReason {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unparseable => "unparseable",
            Self::UnknownKind => "unknown_kind",
            Self::UnknownHandle => "unknown_handle",
            Self::InvalidFieldList => "invalid_field_list",
            Self::NoHandler => "no_handler",
        }
    }
}

/// Outcome of a token renewal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// New token obtained.
    Success,
    /// Attempt failed; may be retried.
    Failure,
    /// Retries exhausted.
    Exhausted,
}

impl RenewalOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Exhausted => "exhausted",
        }
    }
}

/// Record a message delivered to a handler.
pub fn record_message_dispatched(kind: MessageKind) {
    counter!(
        "stream_consumer_messages_dispatched_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a dropped message.
pub fn record_message_dropped(reason: DropReason) {
    counter!(
        "stream_consumer_messages_dropped_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record field entries that failed to decode.
pub fn record_field_decode_errors(count: u64) {
    if count > 0 {
        counter!("stream_consumer_field_decode_errors_total").increment(count);
    }
}

/// Publish the connection state.
pub fn set_connection_state(state: ConnectionState) {
    gauge!("stream_consumer_connection_state").set(state.gauge_value());
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("stream_consumer_reconnects_total").increment(1);
}

/// Record a token renewal attempt.
pub fn record_token_renewal(outcome: RenewalOutcome) {
    counter!(
        "stream_consumer_token_renewals_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Publish subscription counts.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscriptions(stats: SubscriptionStats) {
    for (status, count) in [
        ("pending", stats.pending),
        ("open", stats.open),
        ("closed", stats.closed),
        ("errored", stats.errored),
    ] {
        gauge!("stream_consumer_subscriptions", "status" => status).set(count as f64);
    }
}

/// Record dispatch duration.
pub fn record_dispatch_duration(kind: MessageKind, duration: Duration) {
    histogram!(
        "stream_consumer_dispatch_seconds",
        "kind" => kind.as_str()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
