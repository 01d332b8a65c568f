//! Stream Dispatcher
//!
//! Routes inbound frames to the caller's handlers and owns the connection
//! state machine.
//!
//! For every frame the dispatcher:
//!
//! 1. parses the envelope (kind, stream id, domain)
//! 2. sends login-domain messages through the login state machine
//! 3. resolves item messages against the subscription registry
//! 4. applies refresh/status stream states to the subscription
//! 5. decodes the field list and invokes exactly one handler
//!
//! Frames that cannot be routed are logged, counted, and dropped. Nothing
//! here is fatal to the session.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;

use crate::domain::field::FieldEntry;
use crate::domain::message::{Message, MessageKind, State};
use crate::domain::session::ConnectionState;
use crate::domain::subscription::{Handle, SubscriptionRegistry};
use crate::infrastructure::metrics::{self, DropReason};
use crate::infrastructure::omm::codec::OmmCodec;
use crate::infrastructure::omm::field_list::FieldListDecoder;
use crate::infrastructure::omm::messages::{InboundEnvelope, StateMessage};

// =============================================================================
// Handlers
// =============================================================================

/// Callback invoked with a decoded message.
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Handler table: one slot per message kind plus one for the login stream.
#[derive(Clone, Default)]
pub struct MessageHandlers {
    slots: [Option<Handler>; MessageKind::COUNT],
    login: Option<Handler>,
}

impl std::fmt::Debug for MessageHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let installed: Vec<_> = MessageKind::all()
            .iter()
            .filter(|k| self.slots[k.index()].is_some())
            .map(|k| k.as_str())
            .collect();
        f.debug_struct("MessageHandlers")
            .field("kinds", &installed)
            .field("login", &self.login.is_some())
            .finish()
    }
}

impl MessageHandlers {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the handler for one message kind.
    #[must_use]
    pub fn on<F>(mut self, kind: MessageKind, handler: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.slots[kind.index()] = Some(Arc::new(handler));
        self
    }

    /// Install the same handler for every item message kind.
    #[must_use]
    pub fn on_all<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let shared: Handler = Arc::new(handler);
        for kind in MessageKind::all() {
            self.slots[kind.index()] = Some(Arc::clone(&shared));
        }
        self
    }

    /// Install the refresh handler.
    #[must_use]
    pub fn on_refresh<F>(self, handler: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.on(MessageKind::Refresh, handler)
    }

    /// Install the update handler.
    #[must_use]
    pub fn on_update<F>(self, handler: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.on(MessageKind::Update, handler)
    }

    /// Install the status handler.
    #[must_use]
    pub fn on_status<F>(self, handler: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.on(MessageKind::Status, handler)
    }

    /// Install the ack handler.
    #[must_use]
    pub fn on_ack<F>(self, handler: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.on(MessageKind::Ack, handler)
    }

    /// Install the generic message handler.
    #[must_use]
    pub fn on_generic<F>(self, handler: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.on(MessageKind::Generic, handler)
    }

    /// Install the login stream handler.
    #[must_use]
    pub fn on_login<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.login = Some(Arc::new(handler));
        self
    }

    /// Handler for a kind, if installed.
    #[must_use]
    pub fn get(&self, kind: MessageKind) -> Option<&Handler> {
        self.slots[kind.index()].as_ref()
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// What the login stream reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginEvent {
    /// Login (or token reissue) accepted.
    Accepted(State),
    /// Login refused while connecting.
    Rejected(State),
    /// Login stream closed after it was accepted.
    Lost(State),
    /// Informational login message; no state change.
    Status(Option<State>),
}

/// Result of dispatching one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler received the message.
    Delivered {
        /// Subscription handle.
        handle: Handle,
        /// Message kind.
        kind: MessageKind,
    },
    /// A login-domain message was processed.
    Login(LoginEvent),
    /// The frame was discarded.
    Dropped(DropReason),
}

// =============================================================================
// Stream Dispatcher
// =============================================================================

/// Demultiplexes inbound frames and tracks the connection state.
pub struct StreamDispatcher {
    registry: Arc<SubscriptionRegistry>,
    decoder: FieldListDecoder,
    codec: OmmCodec,
    handlers: MessageHandlers,
    state: watch::Sender<ConnectionState>,
}

impl std::fmt::Debug for StreamDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDispatcher")
            .field("state", &*self.state.borrow())
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

impl StreamDispatcher {
    /// Create a dispatcher in the `Disconnected` state.
    #[must_use]
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        decoder: FieldListDecoder,
        handlers: MessageHandlers,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            registry,
            decoder,
            codec: OmmCodec::new(),
            handlers,
            state,
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Move to `next` if the state machine allows it.
    ///
    /// Invalid transitions are logged and ignored; returns whether the state
    /// changed.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut outcome = Ok(next);
        let changed = self.state.send_if_modified(|current| {
            outcome = current.transition(next);
            match outcome {
                Ok(state) => {
                    *current = state;
                    true
                }
                Err(_) => false,
            }
        });

        match outcome {
            Ok(state) => {
                tracing::info!(state = %state, "Connection state changed");
                metrics::set_connection_state(state);
            }
            Err(invalid) => {
                tracing::warn!(
                    from = %invalid.from,
                    to = %invalid.to,
                    "Ignoring invalid state transition"
                );
            }
        }
        changed
    }

    /// Transport dropped: leave `LoggedIn` or `Connecting` for `Disconnected`.
    ///
    /// Returns whether the session had been logged in.
    pub fn on_transport_lost(&self) -> bool {
        match self.state() {
            ConnectionState::LoggedIn => self.transition(ConnectionState::Disconnected),
            ConnectionState::Connecting => {
                self.transition(ConnectionState::Disconnected);
                false
            }
            _ => false,
        }
    }

    /// Route one inbound frame.
    pub fn dispatch(&self, frame: &[u8]) -> DispatchOutcome {
        let started = Instant::now();

        let envelope = match self.codec.decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, len = frame.len(), "Dropping unparseable frame");
                return drop_frame(DropReason::Unparseable);
            }
        };

        let Some(kind) = MessageKind::from_wire(&envelope.msg_type) else {
            tracing::warn!(
                kind = %envelope.msg_type,
                id = envelope.id,
                "Dropping unknown message kind"
            );
            return drop_frame(DropReason::UnknownKind);
        };

        if envelope.handle().is_login() || envelope.domain_kind().is_login() {
            return self.dispatch_login(kind, envelope);
        }

        let outcome = self.dispatch_item(kind, envelope);
        if matches!(outcome, DispatchOutcome::Delivered { .. }) {
            metrics::record_dispatch_duration(kind, started.elapsed());
        }
        outcome
    }

    fn dispatch_item(&self, kind: MessageKind, envelope: InboundEnvelope) -> DispatchOutcome {
        let handle = envelope.handle();

        let subscription = match self.registry.lookup(handle) {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::warn!(%handle, kind = %kind, error = %e, "Dropping message");
                return drop_frame(DropReason::UnknownHandle);
            }
        };

        let Some(fields) = self.decode_fields(handle, &envelope) else {
            return drop_frame(DropReason::InvalidFieldList);
        };

        let state = envelope.state.as_ref().map(StateMessage::to_state);
        if matches!(kind, MessageKind::Refresh | MessageKind::Status)
            && let Some(state) = &state
        {
            match self.registry.apply_state(handle, state) {
                Ok(Some(status)) => {
                    tracing::debug!(
                        %handle,
                        status = status.as_str(),
                        "Subscription status updated"
                    );
                    metrics::set_subscriptions(self.registry.stats());
                }
                Ok(None) => {}
                Err(e) => {
                    // unsubscribed between lookup and now
                    tracing::debug!(%handle, error = %e, "Subscription vanished during dispatch");
                    return drop_frame(DropReason::UnknownHandle);
                }
            }
        }

        let message = Message {
            kind,
            handle,
            domain: envelope.domain_kind(),
            name: envelope.name.or(Some(subscription.item_name)),
            service_name: envelope.service.or(Some(subscription.service_name)),
            state,
            complete: envelope.complete.unwrap_or(true),
            ack_id: envelope.ack_id,
            fields,
        };

        let Some(handler) = self.handlers.get(kind) else {
            tracing::debug!(%handle, kind = %kind, "No handler installed");
            return drop_frame(DropReason::NoHandler);
        };

        handler(&message);
        metrics::record_message_dispatched(kind);
        DispatchOutcome::Delivered { handle, kind }
    }

    fn dispatch_login(&self, kind: MessageKind, envelope: InboundEnvelope) -> DispatchOutcome {
        let fields = self
            .decode_fields(Handle::LOGIN, &envelope)
            .unwrap_or_default();
        let state = envelope.state.as_ref().map(StateMessage::to_state);

        let refresh = kind == MessageKind::Refresh;
        let event = match (&state, self.state()) {
            (Some(state), ConnectionState::Connecting) if refresh && state.is_open_ok() => {
                self.transition(ConnectionState::LoggedIn);
                LoginEvent::Accepted(state.clone())
            }
            // Only a refresh completes the login.
            (Some(state), ConnectionState::Connecting) if state.is_open_ok() => {
                LoginEvent::Status(Some(state.clone()))
            }
            (Some(state), ConnectionState::LoggedIn) if state.is_open_ok() => {
                LoginEvent::Accepted(state.clone())
            }
            (Some(state), ConnectionState::Connecting) => {
                self.transition(ConnectionState::Disconnected);
                LoginEvent::Rejected(state.clone())
            }
            (Some(state), ConnectionState::LoggedIn) if state.is_closed() => {
                self.transition(ConnectionState::Disconnected);
                LoginEvent::Lost(state.clone())
            }
            (state, _) => LoginEvent::Status(state.clone()),
        };

        tracing::info!(kind = %kind, event = ?event, "Login stream message");

        if let Some(handler) = &self.handlers.login {
            let message = Message {
                kind,
                handle: Handle::LOGIN,
                domain: envelope.domain_kind(),
                name: envelope.name,
                service_name: envelope.service,
                state,
                complete: envelope.complete.unwrap_or(true),
                ack_id: envelope.ack_id,
                fields,
            };
            handler(&message);
        }

        DispatchOutcome::Login(event)
    }

    fn decode_fields(&self, handle: Handle, envelope: &InboundEnvelope) -> Option<Vec<FieldEntry>> {
        let Some(payload) = &envelope.fields else {
            return Some(Vec::new());
        };

        match self.decoder.decode_value(payload) {
            Ok(fields) => {
                let failures = fields.iter().filter(|f| f.value.is_decode_failure()).count();
                if failures > 0 {
                    tracing::debug!(%handle, failures, "Field entries failed to decode");
                    metrics::record_field_decode_errors(failures as u64);
                }
                Some(fields)
            }
            Err(e) => {
                tracing::warn!(%handle, error = %e, "Dropping message with malformed field list");
                None
            }
        }
    }
}

fn drop_frame(reason: DropReason) -> DispatchOutcome {
    metrics::record_message_dropped(reason);
    DispatchOutcome::Dropped(reason)
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use rmpv::Value;

    use super::*;
    use crate::domain::field::TypeTag;
    use crate::domain::message::{DataState, DomainKind, StreamState};
    use crate::domain::subscription::{SubscriptionRequest, SubscriptionStatus};

    type Log = Arc<Mutex<Vec<Message>>>;

    fn recording() -> (MessageHandlers, Log, Log) {
        let items: Log = Arc::default();
        let logins: Log = Arc::default();
        let items_sink = Arc::clone(&items);
        let login_sink = Arc::clone(&logins);

        let handlers = MessageHandlers::new()
            .on_all(move |m| items_sink.lock().push(m.clone()))
            .on_login(move |m| login_sink.lock().push(m.clone()));
        (handlers, items, logins)
    }

    fn dispatcher() -> (StreamDispatcher, Arc<SubscriptionRegistry>, Log, Log) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (handlers, items, logins) = recording();
        let dispatcher =
            StreamDispatcher::new(Arc::clone(&registry), FieldListDecoder::default(), handlers);
        (dispatcher, registry, items, logins)
    }

    fn frame(envelope: &InboundEnvelope) -> Vec<u8> {
        OmmCodec::new().encode(envelope).unwrap()
    }

    fn state(stream: StreamState, data: DataState) -> StateMessage {
        StateMessage {
            stream: stream.code(),
            data: data.code(),
            code: 0,
            text: String::new(),
        }
    }

    fn login_refresh(stream: StreamState, data: DataState) -> Vec<u8> {
        let mut envelope = InboundEnvelope::new("refresh", Handle::LOGIN, DomainKind::Login);
        envelope.state = Some(state(stream, data));
        frame(&envelope)
    }

    fn logged_in() -> (StreamDispatcher, Arc<SubscriptionRegistry>, Log, Log) {
        let parts = dispatcher();
        parts.0.transition(ConnectionState::Connecting);
        parts.0.dispatch(&login_refresh(StreamState::Open, DataState::Ok));
        assert_eq!(parts.0.state(), ConnectionState::LoggedIn);
        parts
    }

    #[test]
    fn login_refresh_logs_in() {
        let (dispatcher, _, items, logins) = dispatcher();
        let mut watch = dispatcher.watch_state();

        assert!(dispatcher.transition(ConnectionState::Connecting));
        let outcome = dispatcher.dispatch(&login_refresh(StreamState::Open, DataState::Ok));

        assert!(matches!(outcome, DispatchOutcome::Login(LoginEvent::Accepted(_))));
        assert_eq!(dispatcher.state(), ConnectionState::LoggedIn);
        assert!(watch.has_changed().unwrap());
        assert_eq!(*watch.borrow_and_update(), ConnectionState::LoggedIn);
        assert_eq!(logins.lock().len(), 1);
        assert!(items.lock().is_empty());
    }

    #[test]
    fn open_login_status_does_not_log_in() {
        let (dispatcher, _, _, logins) = dispatcher();
        dispatcher.transition(ConnectionState::Connecting);

        let mut envelope = InboundEnvelope::new("status", Handle::LOGIN, DomainKind::Login);
        envelope.state = Some(state(StreamState::Open, DataState::Ok));
        let outcome = dispatcher.dispatch(&frame(&envelope));

        assert!(matches!(outcome, DispatchOutcome::Login(LoginEvent::Status(Some(_)))));
        assert_eq!(dispatcher.state(), ConnectionState::Connecting);
        assert_eq!(logins.lock().len(), 1);

        let outcome = dispatcher.dispatch(&login_refresh(StreamState::Open, DataState::Ok));
        assert!(matches!(outcome, DispatchOutcome::Login(LoginEvent::Accepted(_))));
        assert_eq!(dispatcher.state(), ConnectionState::LoggedIn);
    }

    #[test]
    fn login_rejection_disconnects() {
        let (dispatcher, _, _, _) = dispatcher();
        dispatcher.transition(ConnectionState::Connecting);

        let outcome = dispatcher.dispatch(&login_refresh(StreamState::Closed, DataState::Suspect));

        assert!(matches!(outcome, DispatchOutcome::Login(LoginEvent::Rejected(_))));
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn login_closed_after_accept_is_lost() {
        let (dispatcher, _, _, _) = logged_in();

        let mut envelope = InboundEnvelope::new("status", Handle::LOGIN, DomainKind::Login);
        envelope.state = Some(state(StreamState::Closed, DataState::Suspect));

        assert!(matches!(
            dispatcher.dispatch(&frame(&envelope)),
            DispatchOutcome::Login(LoginEvent::Lost(_))
        ));
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn reissue_refresh_keeps_logged_in() {
        let (dispatcher, _, _, _) = logged_in();

        let outcome = dispatcher.dispatch(&login_refresh(StreamState::Open, DataState::Ok));

        assert!(matches!(outcome, DispatchOutcome::Login(LoginEvent::Accepted(_))));
        assert_eq!(dispatcher.state(), ConnectionState::LoggedIn);
    }

    #[test]
    fn refresh_opens_subscription_before_handler() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let handle = registry.subscribe(SubscriptionRequest::market_price("ELEKTRON_DD", "EUR="));

        let seen = Arc::new(Mutex::new(None));
        let (handler_registry, sink) = (Arc::clone(&registry), Arc::clone(&seen));
        let handlers = MessageHandlers::new().on_refresh(move |m| {
            *sink.lock() = handler_registry.lookup(m.handle).ok().map(|s| s.status);
        });
        let dispatcher = StreamDispatcher::new(registry, FieldListDecoder::default(), handlers);

        let mut envelope = InboundEnvelope::new("refresh", handle, DomainKind::MarketPrice);
        envelope.state = Some(state(StreamState::Open, DataState::Ok));
        envelope.fields = Some(Value::Array(vec![Value::Array(vec![
            Value::from(22),
            Value::from(8),
            Value::Binary(vec![10, 0x2A, 0x49]),
        ])]));

        assert_eq!(
            dispatcher.dispatch(&frame(&envelope)),
            DispatchOutcome::Delivered {
                handle,
                kind: MessageKind::Refresh
            }
        );
        assert_eq!(*seen.lock(), Some(SubscriptionStatus::Open));
    }

    #[test]
    fn update_carries_decoded_fields() {
        let (dispatcher, registry, items, _) = logged_in();
        let handle = registry.subscribe(SubscriptionRequest::market_price("ELEKTRON_DD", "EUR="));

        let mut envelope = InboundEnvelope::new("update", handle, DomainKind::MarketPrice);
        envelope.fields = Some(Value::Array(vec![
            Value::Array(vec![Value::from(25), Value::from(8), Value::Nil]),
            Value::Array(vec![Value::from(15), Value::from(14), Value::Binary(vec![0x03, 0xD2])]),
        ]));
        dispatcher.dispatch(&frame(&envelope));

        let items = items.lock();
        assert_eq!(items.len(), 1);
        let message = &items[0];
        assert_eq!(message.kind, MessageKind::Update);
        assert_eq!(message.name.as_deref(), Some("EUR="));
        assert_eq!(message.service_name.as_deref(), Some("ELEKTRON_DD"));
        assert_eq!(message.field(25).unwrap().type_tag(), TypeTag::Blank);
        assert_eq!(message.field(15).unwrap().value.to_string(), "EUR");
        assert_eq!(
            registry.lookup(handle).unwrap().status,
            SubscriptionStatus::Pending
        );
    }

    #[test]
    fn unknown_handle_is_dropped() {
        let (dispatcher, registry, items, _) = logged_in();
        registry.subscribe(SubscriptionRequest::market_price("ELEKTRON_DD", "EUR="));
        let before = registry.all();

        let envelope = InboundEnvelope::new("update", Handle::new(999), DomainKind::MarketPrice);

        assert_eq!(
            dispatcher.dispatch(&frame(&envelope)),
            DispatchOutcome::Dropped(DropReason::UnknownHandle)
        );
        assert!(items.lock().is_empty());
        assert_eq!(registry.all(), before);
        assert_eq!(dispatcher.state(), ConnectionState::LoggedIn);
    }

    #[test]
    fn garbage_and_unknown_kinds_are_dropped() {
        let (dispatcher, registry, items, _) = logged_in();
        let handle = registry.subscribe(SubscriptionRequest::market_price("ELEKTRON_DD", "EUR="));

        assert_eq!(
            dispatcher.dispatch(&[0xC1, 0x00]),
            DispatchOutcome::Dropped(DropReason::Unparseable)
        );
        assert_eq!(
            dispatcher.dispatch(&frame(&InboundEnvelope::new(
                "post",
                handle,
                DomainKind::MarketPrice
            ))),
            DispatchOutcome::Dropped(DropReason::UnknownKind)
        );

        let mut bad_fields = InboundEnvelope::new("update", handle, DomainKind::MarketPrice);
        bad_fields.fields = Some(Value::from("not a list"));
        assert_eq!(
            dispatcher.dispatch(&frame(&bad_fields)),
            DispatchOutcome::Dropped(DropReason::InvalidFieldList)
        );

        assert!(items.lock().is_empty());
    }

    #[test]
    fn closed_status_marks_errored_and_delivers() {
        let (dispatcher, registry, items, _) = logged_in();
        let handle = registry.subscribe(SubscriptionRequest::market_price("ELEKTRON_DD", "BAD="));

        let mut envelope = InboundEnvelope::new("status", handle, DomainKind::MarketPrice);
        envelope.state = Some(state(StreamState::Closed, DataState::Suspect));
        dispatcher.dispatch(&frame(&envelope));

        assert_eq!(
            registry.lookup(handle).unwrap().status,
            SubscriptionStatus::Errored
        );
        assert_eq!(items.lock().len(), 1);
    }

    #[test]
    fn missing_handler_is_reported() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let handle = registry.subscribe(SubscriptionRequest::market_price("ELEKTRON_DD", "EUR="));
        let dispatcher = StreamDispatcher::new(
            registry,
            FieldListDecoder::default(),
            MessageHandlers::new().on_refresh(|_| {}),
        );

        let envelope = InboundEnvelope::new("ack", handle, DomainKind::MarketPrice);
        assert_eq!(
            dispatcher.dispatch(&frame(&envelope)),
            DispatchOutcome::Dropped(DropReason::NoHandler)
        );
    }

    #[test]
    fn invalid_transitions_are_ignored() {
        let (dispatcher, _, _, _) = dispatcher();

        assert!(!dispatcher.transition(ConnectionState::LoggedIn));
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);

        dispatcher.transition(ConnectionState::LoggingOut);
        dispatcher.transition(ConnectionState::Closed);
        assert!(!dispatcher.transition(ConnectionState::Connecting));
        assert_eq!(dispatcher.state(), ConnectionState::Closed);
    }

    #[test]
    fn transport_loss() {
        let (dispatcher, _, _, _) = logged_in();

        assert!(dispatcher.on_transport_lost());
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);
        assert!(!dispatcher.on_transport_lost());
    }
}
