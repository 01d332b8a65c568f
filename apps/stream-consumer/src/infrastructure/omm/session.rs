//! Subscription Session
//!
//! Owns one logical streaming session: authentication, the transport, the
//! login stream, the subscription registry and the background tasks that keep
//! them alive.
//!
//! # Lifecycle
//!
//! ```text
//! open() ──► authenticate ──► connect ──► login ──► LoggedIn
//!                                                     │
//!            ┌──── renewal timer ──► renew ──► reissue┤
//!            │                                        │
//!            └──── transport lost ──► reconnect loop ─┘ (replays subscriptions)
//!
//! close() ──► logout ──► release everything ──► Closed
//! ```
//!
//! A single [`CancellationToken`] is shared by `open()`, the inbound task,
//! the renewal timer and the reconnect loop. `close()` or dropping the
//! session cancels it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    AuthError, TokenEndpoint, Transport, TransportError, TransportEvent,
};
use crate::domain::auth::{Credentials, Token};
use crate::domain::message::{DomainKind, State};
use crate::domain::session::ConnectionState;
use crate::domain::subscription::{
    Handle, RegistryError, Subscription, SubscriptionRegistry, SubscriptionRequest,
};
use crate::infrastructure::config::{ConsumerConfig, LoginSettings};
use crate::infrastructure::metrics::{self, RenewalOutcome};
use crate::infrastructure::omm::codec::{CodecError, OmmCodec};
use crate::infrastructure::omm::dispatcher::{
    DispatchOutcome, LoginEvent, MessageHandlers, StreamDispatcher,
};
use crate::infrastructure::omm::field_list::FieldListDecoder;
use crate::infrastructure::omm::messages::{CloseRequest, ItemRequest, LoginRequest};
use crate::infrastructure::omm::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::infrastructure::omm::token::{RenewalHandle, RenewalSchedule, TokenManager};

/// Capacity of the session event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

// =============================================================================
// Errors and Events
// =============================================================================

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Token could not be obtained.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Transport could not be established.
    #[error("connect failed: {0}")]
    Connect(#[source] TransportError),

    /// Operation requires an accepted login.
    #[error("session is not logged in")]
    NotLoggedIn,

    /// `open()` called on a session that is already open or opening.
    #[error("session already open")]
    AlreadyOpen,

    /// The server refused the login.
    #[error("login rejected: {state}")]
    LoginRejected {
        /// Login stream state sent by the server.
        state: State,
    },

    /// No login response arrived in time.
    #[error("login not accepted within {0:?}")]
    LoginTimeout(Duration),

    /// `close()` was called while the operation was in flight.
    #[error("operation cancelled by close")]
    Cancelled,

    /// Reconnect attempts were exhausted.
    #[error("session lost: reconnect attempts exhausted")]
    SessionLost,

    /// The session has been closed.
    #[error("session closed")]
    Closed,

    /// Frame could not be written.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Outbound message could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Notifications about the session's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connection state changed.
    StateChanged(ConnectionState),
    /// The login stream reported a state.
    LoginStatus(State),
    /// A new token was obtained and pushed to the server.
    TokenRenewed {
        /// Expiry of the new token.
        expires_at: DateTime<Utc>,
    },
    /// A renewal attempt failed.
    TokenRenewalFailed {
        /// Attempt number, starting at 1.
        attempt: u32,
        /// Failure reason.
        error: AuthError,
    },
    /// Renewal gave up; the current token will expire.
    Unauthenticated,
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// Attempt number, starting at 1.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// The session is logged in again and subscriptions were replayed.
    Reconnected {
        /// Attempts it took.
        attempts: u32,
    },
    /// Reconnect attempts were exhausted; the session is closed.
    SessionLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Closed,
    Lost,
}

// =============================================================================
// Configuration
// =============================================================================

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Login identity and timeout.
    pub login: LoginSettings,
    /// Backoff for transport reconnects.
    pub reconnect: ReconnectConfig,
    /// When renewal fires.
    pub renewal: RenewalSchedule,
    /// Backoff for failed renewals.
    pub renewal_retry: ReconnectConfig,
    /// Capacity of the event channel.
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            login: LoginSettings::default(),
            reconnect: ReconnectConfig::default(),
            renewal: RenewalSchedule::default(),
            renewal_retry: ReconnectConfig::renewal(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl SessionConfig {
    /// Derive session tuning from the consumer configuration.
    #[must_use]
    pub fn from_consumer(config: &ConsumerConfig) -> Self {
        Self {
            login: config.login.clone(),
            reconnect: ReconnectConfig::from_settings(&config.reconnect),
            renewal: RenewalSchedule {
                ratio: config.renewal.renewal_ratio,
                min_margin: config.renewal.min_margin,
            },
            renewal_retry: ReconnectConfig::from_settings(&config.renewal.retry),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// A streaming session.
///
/// Dropping the session cancels its background tasks and releases the
/// transport; call [`close`](Self::close) to log out cleanly first.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("subscriptions", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

struct SessionInner {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    tokens: TokenManager,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: StreamDispatcher,
    codec: OmmCodec,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
    closing: AtomicBool,
    reconnecting: AtomicBool,
    login_rejection: Mutex<Option<State>>,
    renewal: Mutex<Option<RenewalHandle>>,
    inbound: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    end: watch::Sender<Option<SessionEnd>>,
}

impl Session {
    /// Create a disconnected session.
    ///
    /// Returns the session and the receiving end of its event channel.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoint: Arc<dyn TokenEndpoint>,
        handlers: MessageHandlers,
        config: SessionConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        Self::with_decoder(transport, endpoint, handlers, FieldListDecoder::default(), config)
    }

    /// Create a disconnected session with a custom field dictionary.
    #[must_use]
    pub fn with_decoder(
        transport: Arc<dyn Transport>,
        endpoint: Arc<dyn TokenEndpoint>,
        handlers: MessageHandlers,
        decoder: FieldListDecoder,
        config: SessionConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let registry = Arc::new(SubscriptionRegistry::new());
        let (end, _) = watch::channel(None);

        let inner = SessionInner {
            tokens: TokenManager::with_schedule(endpoint, config.renewal),
            dispatcher: StreamDispatcher::new(Arc::clone(&registry), decoder, handlers),
            config,
            transport,
            registry,
            codec: OmmCodec::new(),
            events,
            cancel: CancellationToken::new(),
            closing: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            login_rejection: Mutex::new(None),
            renewal: Mutex::new(None),
            inbound: Mutex::new(None),
            reconnect_task: Mutex::new(None),
            end,
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    /// Authenticate, connect and log in.
    ///
    /// # Errors
    ///
    /// - `Auth` if no token could be obtained
    /// - `Connect` if the transport could not be opened
    /// - `LoginRejected` / `LoginTimeout` if the login was not accepted
    /// - `Cancelled` if [`close`](Self::close) ran meanwhile
    /// - `AlreadyOpen` / `Closed` on misuse
    pub async fn open(&self, credentials: Credentials) -> Result<(), SessionError> {
        let inner = &self.inner;

        if inner.closing.load(Ordering::SeqCst) || inner.dispatcher.state().is_closed() {
            return Err(SessionError::Closed);
        }
        if !inner.set_state(ConnectionState::Connecting) {
            return Err(SessionError::AlreadyOpen);
        }

        let result = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => Err(SessionError::Cancelled),
            r = inner.establish(Some(credentials)) => r,
        };

        match result {
            Ok(()) => {
                tracing::info!("Session open");
                Ok(())
            }
            Err(_) if inner.cancel.is_cancelled() => Err(SessionError::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, "Session open failed");
                inner.release_connection().await;
                if inner.dispatcher.state() == ConnectionState::Connecting {
                    inner.set_state(ConnectionState::Disconnected);
                }
                Err(e)
            }
        }
    }

    /// Request a streaming item.
    ///
    /// # Errors
    ///
    /// Returns `NotLoggedIn` before login, or the transport error if the
    /// request could not be sent (the subscription is then discarded).
    pub async fn subscribe(
        &self,
        service_name: impl Into<String>,
        item_name: impl Into<String>,
        domain: DomainKind,
        view: Option<Vec<i16>>,
    ) -> Result<Handle, SessionError> {
        self.subscribe_request(SubscriptionRequest {
            service_name: service_name.into(),
            item_name: item_name.into(),
            domain,
            view,
        })
        .await
    }

    /// Request a streaming item described by a [`SubscriptionRequest`].
    ///
    /// # Errors
    ///
    /// See [`subscribe`](Self::subscribe).
    pub async fn subscribe_request(
        &self,
        request: SubscriptionRequest,
    ) -> Result<Handle, SessionError> {
        let inner = &self.inner;
        inner.ensure_logged_in()?;

        let handle = inner.registry.subscribe(request.clone());
        let message = ItemRequest::new(
            handle,
            request.domain,
            request.service_name,
            request.item_name,
            request.view,
        );

        if let Err(e) = inner.send(&message).await {
            inner.registry.unsubscribe(handle);
            tracing::warn!(%handle, error = %e, "Item request not sent");
            return Err(e);
        }

        tracing::info!(%handle, service = %message.service, item = %message.name, "Subscribed");
        metrics::set_subscriptions(inner.registry.stats());
        Ok(handle)
    }

    /// Drop a subscription. Unknown handles are a no-op.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the close request could not be sent;
    /// the subscription is removed regardless.
    pub async fn unsubscribe(&self, handle: Handle) -> Result<(), SessionError> {
        let inner = &self.inner;
        let Ok(previous) = inner.registry.lookup(handle) else {
            return Ok(());
        };
        let Some(subscription) = inner.registry.unsubscribe(handle) else {
            return Ok(());
        };
        metrics::set_subscriptions(inner.registry.stats());

        let live = previous.status.is_replayable()
            && inner.dispatcher.state() == ConnectionState::LoggedIn;

        if live {
            inner
                .send(&CloseRequest::new(handle, subscription.domain))
                .await?;
        }

        tracing::info!(%handle, item = %subscription.item_name, "Unsubscribed");
        Ok(())
    }

    /// Log out and release every resource. Safe to call more than once.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// Wait until the session ends.
    ///
    /// # Errors
    ///
    /// Returns `SessionLost` when the session ended because reconnects were
    /// exhausted.
    pub async fn wait_closed(&self) -> Result<(), SessionError> {
        let mut end = self.inner.end.subscribe();
        let reason = *end
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SessionError::Closed)?;

        match reason {
            Some(SessionEnd::Lost) => Err(SessionError::SessionLost),
            _ => Ok(()),
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.dispatcher.state()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.dispatcher.watch_state()
    }

    /// Snapshot of a subscription.
    ///
    /// # Errors
    ///
    /// Returns `UnknownHandle` for unknown or removed handles.
    pub fn subscription(&self, handle: Handle) -> Result<Subscription, RegistryError> {
        self.inner.registry.lookup(handle)
    }

    /// Snapshot of every subscription.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.registry.all()
    }

    /// The active token.
    #[must_use]
    pub fn current_token(&self) -> Option<Arc<Token>> {
        self.inner.tokens.current()
    }

    /// Replace the credentials used by the next renewal or reconnect.
    pub fn rotate_credentials(&self, credentials: Credentials) {
        self.inner.tokens.rotate_credentials(credentials);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let inner = &self.inner;
        if inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        inner.cancel.cancel();
        inner.stop_tasks();

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let transport = Arc::clone(&inner.transport);
            runtime.spawn(async move { transport.disconnect().await });
        }
        inner.finish(SessionEnd::Closed);
    }
}

// =============================================================================
// Internals
// =============================================================================

impl SessionInner {
    fn set_state(&self, next: ConnectionState) -> bool {
        let changed = self.dispatcher.transition(next);
        if changed {
            self.emit(SessionEvent::StateChanged(next));
        }
        changed
    }

    fn emit(&self, event: SessionEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(event = ?event, "Session event channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!("Session event receiver dropped");
            }
        }
    }

    fn finish(&self, end: SessionEnd) {
        self.end.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(end);
                true
            } else {
                false
            }
        });
    }

    fn ensure_logged_in(&self) -> Result<(), SessionError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        match self.dispatcher.state() {
            ConnectionState::LoggedIn => Ok(()),
            ConnectionState::Closed | ConnectionState::LoggingOut => Err(SessionError::Closed),
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                Err(SessionError::NotLoggedIn)
            }
        }
    }

    async fn send<T: Serialize>(&self, message: &T) -> Result<(), SessionError> {
        let frame = self.codec.encode(message)?;
        self.transport.send(frame).await?;
        Ok(())
    }

    /// Obtain a token, connect, log in and arm the renewal timer.
    ///
    /// Expects the state to be `Connecting`.
    async fn establish(
        self: &Arc<Self>,
        credentials: Option<Credentials>,
    ) -> Result<(), SessionError> {
        let token = match credentials {
            Some(credentials) => self.tokens.authenticate(credentials).await?,
            None => self.tokens.renew().await?,
        };

        let events = self
            .transport
            .connect()
            .await
            .map_err(SessionError::Connect)?;

        let mut state = self.dispatcher.watch_state();
        self.login_rejection.lock().take();
        self.spawn_inbound(events);

        let login = &self.config.login;
        self.send(&LoginRequest::new(
            &login.username,
            token.access_token(),
            &login.application_id,
        ))
        .await?;
        tracing::debug!(username = %login.username, "Login requested");

        let reached = tokio::time::timeout(
            login.login_timeout,
            state.wait_for(|s| *s != ConnectionState::Connecting),
        )
        .await
        .map_err(|_| SessionError::LoginTimeout(login.login_timeout))?
        .map(|s| *s)
        .map_err(|_| SessionError::Closed)?;

        if reached == ConnectionState::LoggedIn {
            self.schedule_renewal(&token);
            return Ok(());
        }

        match self.login_rejection.lock().take() {
            Some(state) => Err(SessionError::LoginRejected { state }),
            None => Err(SessionError::Connect(TransportError::Connect {
                message: format!("connection ended during login ({reached})"),
            })),
        }
    }

    fn spawn_inbound(self: &Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        let inner = Arc::clone(self);
        let cancel = self.cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    event = events.recv() => event,
                };

                match event {
                    Some(TransportEvent::Frame(frame)) => inner.on_frame(&frame),
                    Some(TransportEvent::Closed { reason }) => {
                        inner.on_transport_closed(&reason);
                        break;
                    }
                    None => {
                        inner.on_transport_closed("event channel closed");
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.inbound.lock().replace(task) {
            previous.abort();
        }
    }

    fn on_frame(self: &Arc<Self>, frame: &[u8]) {
        let before = self.dispatcher.state();
        let outcome = self.dispatcher.dispatch(frame);
        let after = self.dispatcher.state();
        if before != after {
            self.emit(SessionEvent::StateChanged(after));
        }

        let DispatchOutcome::Login(event) = outcome else {
            return;
        };

        match event {
            LoginEvent::Accepted(state) | LoginEvent::Status(Some(state)) => {
                self.emit(SessionEvent::LoginStatus(state));
            }
            LoginEvent::Rejected(state) => {
                tracing::warn!(state = %state, "Login rejected");
                *self.login_rejection.lock() = Some(state.clone());
                self.emit(SessionEvent::LoginStatus(state));
            }
            LoginEvent::Lost(state) => {
                tracing::warn!(state = %state, "Login stream closed by server");
                self.emit(SessionEvent::LoginStatus(state));
                self.begin_reconnect();
            }
            LoginEvent::Status(None) => {}
        }
    }

    fn on_transport_closed(self: &Arc<Self>, reason: &str) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }

        tracing::warn!(reason, "Transport closed");
        let before = self.dispatcher.state();
        let was_logged_in = self.dispatcher.on_transport_lost();
        let after = self.dispatcher.state();
        if before != after {
            self.emit(SessionEvent::StateChanged(after));
        }

        if was_logged_in {
            self.begin_reconnect();
        }
    }

    fn schedule_renewal(self: &Arc<Self>, token: &Token) {
        let weak = Arc::downgrade(self);
        let handle = self.tokens.schedule_renewal(token, move || {
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(async move { inner.renew_token().await });
            }
        });
        *self.renewal.lock() = Some(handle);
    }

    async fn renew_token(self: Arc<Self>) {
        let mut policy = ReconnectPolicy::new(self.config.renewal_retry.clone());
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                r = self.tokens.renew() => r,
            };

            let error = match result {
                Ok(token) => {
                    metrics::record_token_renewal(RenewalOutcome::Success);
                    self.push_token(&token).await;
                    self.emit(SessionEvent::TokenRenewed {
                        expires_at: token.expires_at_utc(),
                    });
                    self.schedule_renewal(&token);
                    return;
                }
                Err(e) => e,
            };

            tracing::warn!(attempt, error = %error, "Token renewal failed");
            metrics::record_token_renewal(RenewalOutcome::Failure);
            self.emit(SessionEvent::TokenRenewalFailed {
                attempt,
                error: error.clone(),
            });

            let delay = if error.is_retryable() {
                policy.next_delay()
            } else {
                None
            };
            let Some(delay) = delay else {
                break;
            };

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }

        tracing::error!(attempts = attempt, "Token renewal exhausted");
        metrics::record_token_renewal(RenewalOutcome::Exhausted);
        self.emit(SessionEvent::Unauthenticated);
    }

    /// Send the renewed token on the open login stream.
    async fn push_token(&self, token: &Token) {
        if self.dispatcher.state() != ConnectionState::LoggedIn {
            tracing::debug!("Not logged in; renewed token will be used on reconnect");
            return;
        }

        let login = &self.config.login;
        let reissue =
            LoginRequest::reissue(&login.username, token.access_token(), &login.application_id);
        match self.send(&reissue).await {
            Ok(()) => tracing::info!("Login reissued with renewed token"),
            Err(e) => tracing::warn!(error = %e, "Login reissue not sent"),
        }
    }

    fn begin_reconnect(self: &Arc<Self>) {
        if self.closing.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        self.renewal.lock().take();
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            inner.reconnect_loop().await;
            inner.reconnecting.store(false, Ordering::SeqCst);
        });
        *self.reconnect_task.lock() = Some(task);
    }

    async fn reconnect_loop(self: &Arc<Self>) {
        self.release_connection().await;
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            let Some(delay) = policy.next_delay() else {
                self.lose_session(policy.attempt_count()).await;
                return;
            };
            let attempt = policy.attempt_count();

            tracing::info!(
                attempt,
                max_attempts = policy.max_attempts(),
                delay_ms = delay.as_millis(),
                "Reconnecting"
            );
            metrics::record_reconnect();
            self.emit(SessionEvent::Reconnecting { attempt, delay });

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }

            if !self.set_state(ConnectionState::Connecting) {
                return;
            }

            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                r = self.establish(None) => r,
            };

            match result {
                Ok(()) => {
                    self.replay_subscriptions().await;
                    tracing::info!(attempts = attempt, "Reconnected");
                    self.emit(SessionEvent::Reconnected { attempts: attempt });
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Reconnect attempt failed");
                    self.release_connection().await;
                    if self.dispatcher.state() == ConnectionState::Connecting {
                        self.set_state(ConnectionState::Disconnected);
                    }
                }
            }
        }
    }

    /// Re-request every pending or open subscription under its handle.
    async fn replay_subscriptions(&self) {
        self.registry.reset_pending();
        let replay = self.registry.replayable();

        for subscription in &replay {
            let request = ItemRequest::new(
                subscription.handle,
                subscription.domain,
                subscription.service_name.clone(),
                subscription.item_name.clone(),
                subscription.view.clone(),
            );
            if let Err(e) = self.send(&request).await {
                tracing::warn!(
                    handle = %subscription.handle,
                    error = %e,
                    "Replay request not sent"
                );
            }
        }

        tracing::info!(count = replay.len(), "Subscriptions replayed");
        metrics::set_subscriptions(self.registry.stats());
    }

    async fn lose_session(&self, attempts: u32) {
        tracing::error!(attempts, "Reconnect attempts exhausted, session lost");

        // runs on the reconnect task itself, which must not abort itself
        self.cancel.cancel();
        self.reconnect_task.lock().take();
        self.release_connection().await;
        self.registry.clear();
        self.tokens.clear();

        self.set_state(ConnectionState::Closed);
        self.emit(SessionEvent::SessionLost);
        self.finish(SessionEnd::Lost);
    }

    async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        let was_logged_in = self.dispatcher.state() == ConnectionState::LoggedIn;
        self.cancel.cancel();

        if self.dispatcher.state().is_closed() {
            self.finish(SessionEnd::Closed);
            return;
        }

        self.set_state(ConnectionState::LoggingOut);
        if was_logged_in {
            match self.send(&CloseRequest::logout()).await {
                Ok(()) => tracing::debug!("Logout sent"),
                Err(e) => tracing::warn!(error = %e, "Logout not sent"),
            }
        }

        self.stop_tasks();
        self.transport.disconnect().await;
        self.registry.clear();
        self.tokens.clear();
        metrics::set_subscriptions(self.registry.stats());

        self.set_state(ConnectionState::Closed);
        self.finish(SessionEnd::Closed);
        tracing::info!("Session closed");
    }

    /// Tear down the current connection without touching the registry.
    async fn release_connection(&self) {
        self.renewal.lock().take();
        if let Some(task) = self.inbound.lock().take() {
            task.abort();
        }
        self.transport.disconnect().await;
    }

    fn stop_tasks(&self) {
        self.renewal.lock().take();
        if let Some(task) = self.inbound.lock().take() {
            task.abort();
        }
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::domain::auth::TokenGrant;
    use crate::infrastructure::transport::InMemoryTransport;

    struct StaticEndpoint;

    #[async_trait]
    impl TokenEndpoint for StaticEndpoint {
        async fn request_token(&self, _: &Credentials) -> Result<TokenGrant, AuthError> {
            Ok(TokenGrant {
                access_token: "token".to_string(),
                expires_in: Duration::from_secs(300),
            })
        }
    }

    fn session() -> (Session, mpsc::Receiver<SessionEvent>) {
        let (transport, _peer) = InMemoryTransport::new();
        Session::new(
            transport,
            Arc::new(StaticEndpoint),
            MessageHandlers::new(),
            SessionConfig::default(),
        )
    }

    #[tokio::test]
    async fn subscribe_before_login_fails() {
        let (session, _events) = session();

        let result = session
            .subscribe("ELEKTRON_DD", "EUR=", DomainKind::MarketPrice, None)
            .await;

        assert!(matches!(result, Err(SessionError::NotLoggedIn)));
        assert!(session.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (session, mut events) = session();

        session.close().await;
        session.close().await;

        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(session.wait_closed().await.is_ok());
        assert_eq!(
            events.recv().await,
            Some(SessionEvent::StateChanged(ConnectionState::LoggingOut))
        );
        assert_eq!(
            events.recv().await,
            Some(SessionEvent::StateChanged(ConnectionState::Closed))
        );
    }

    #[tokio::test]
    async fn open_after_close_fails() {
        let (session, _events) = session();
        session.close().await;

        let result = session
            .open(Credentials::new("id", "secret", "https://auth.example/token"))
            .await;

        assert!(matches!(result, Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn unsubscribe_unknown_handle_is_noop() {
        let (session, _events) = session();
        assert!(session.unsubscribe(Handle::new(42)).await.is_ok());
    }

    #[test]
    fn config_from_consumer_settings() {
        let consumer = ConsumerConfig::from_lookup(|key| match key {
            "CLIENT_ID" => Some("id".to_string()),
            "CLIENT_SECRET" => Some("secret".to_string()),
            "CONSUMER_MAX_RECONNECT_ATTEMPTS" => Some("7".to_string()),
            "CONSUMER_TOKEN_RENEWAL_RATIO" => Some("0.5".to_string()),
            _ => None,
        })
        .unwrap();

        let config = SessionConfig::from_consumer(&consumer);

        assert_eq!(config.reconnect.max_attempts, 7);
        assert!((config.renewal.ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.login, consumer.login);
    }
}
