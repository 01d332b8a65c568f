//! Session Integration Tests
//!
//! Drives a full session over the in-memory transport, with the test playing
//! the server: it reads the client's requests and answers with encoded
//! frames.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rmpv::Value;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::timeout;

use stream_consumer::domain::message::{DataState, StreamState};
use stream_consumer::infrastructure::config::LoginSettings;
use stream_consumer::infrastructure::omm::messages::StateMessage;
use stream_consumer::infrastructure::omm::{
    InboundEnvelope, OmmCodec, OutboundMessage, ReconnectConfig,
};
use stream_consumer::infrastructure::transport::{InMemoryPeer, InMemoryTransport};
use stream_consumer::{
    AuthError, ConnectionState, Credentials, DomainKind, FieldValue, Handle, Message,
    MessageHandlers, RegistryError, Session, SessionConfig, SessionError, SessionEvent,
    SubscriptionStatus, TokenEndpoint, TokenGrant,
};

const WAIT: Duration = Duration::from_secs(30);

// =============================================================================
// Fixtures
// =============================================================================

struct FakeEndpoint {
    calls: AtomicUsize,
    lifetime: Duration,
    fail: AtomicBool,
}

impl FakeEndpoint {
    fn new(lifetime: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            lifetime,
            fail: AtomicBool::new(false),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenEndpoint for FakeEndpoint {
    async fn request_token(&self, _: &Credentials) -> Result<TokenGrant, AuthError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail.load(Ordering::SeqCst) {
            return Err(AuthError::Rejected {
                status: 401,
                message: "invalid_client".to_string(),
            });
        }
        Ok(TokenGrant {
            access_token: format!("token-{n}"),
            expires_in: self.lifetime,
        })
    }
}

struct Harness {
    session: Session,
    events: mpsc::Receiver<SessionEvent>,
    peer: InMemoryPeer,
    endpoint: Arc<FakeEndpoint>,
    messages: mpsc::UnboundedReceiver<Message>,
}

fn config() -> SessionConfig {
    SessionConfig {
        login: LoginSettings {
            login_timeout: Duration::from_secs(5),
            ..LoginSettings::default()
        },
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_attempts: 3,
            ..ReconnectConfig::default()
        }
        .without_jitter(),
        ..SessionConfig::default()
    }
}

fn harness_with(config: SessionConfig, lifetime: Duration) -> Harness {
    let (transport, peer) = InMemoryTransport::new();
    let endpoint = FakeEndpoint::new(lifetime);
    let (tx, messages) = mpsc::unbounded_channel();

    let handlers = MessageHandlers::new().on_all(move |m| {
        let _ = tx.send(m.clone());
    });
    let (session, events) = Session::new(transport, endpoint.clone(), handlers, config);

    Harness {
        session,
        events,
        peer,
        endpoint,
        messages,
    }
}

fn harness() -> Harness {
    harness_with(config(), Duration::from_secs(300))
}

fn credentials() -> Credentials {
    Credentials::new("client", "secret", "https://auth.example/token")
}

fn encode(envelope: &InboundEnvelope) -> Vec<u8> {
    OmmCodec::new().encode(envelope).unwrap()
}

fn state(stream: StreamState, data: DataState, text: &str) -> StateMessage {
    StateMessage {
        stream: stream.code(),
        data: data.code(),
        code: 0,
        text: text.to_string(),
    }
}

fn login_response(stream: StreamState, data: DataState) -> Vec<u8> {
    let mut envelope = InboundEnvelope::new("refresh", Handle::LOGIN, DomainKind::Login);
    envelope.name = Some("user".to_string());
    envelope.state = Some(state(stream, data, "Login accepted"));
    encode(&envelope)
}

fn field(fid: i64, type_code: u64, data: Vec<u8>) -> Value {
    Value::Array(vec![Value::from(fid), Value::from(type_code), Value::Binary(data)])
}

/// Refresh for EUR= with BID 1.0825, ASK 1.0827 and CURRENCY EUR.
fn eur_refresh(handle: Handle) -> Vec<u8> {
    let mut envelope = InboundEnvelope::new("refresh", handle, DomainKind::MarketPrice);
    envelope.name = Some("EUR=".to_string());
    envelope.service = Some("ELEKTRON_DD".to_string());
    envelope.state = Some(state(StreamState::Open, DataState::Ok, "All is well"));
    envelope.complete = Some(true);
    envelope.fields = Some(Value::Array(vec![
        field(22, 8, vec![10, 0x2A, 0x49]),
        field(25, 8, vec![10, 0x2A, 0x4B]),
        field(15, 14, vec![0x03, 0xD2]),
    ]));
    encode(&envelope)
}

fn update(handle: Handle) -> Vec<u8> {
    let mut envelope = InboundEnvelope::new("update", handle, DomainKind::MarketPrice);
    envelope.fields = Some(Value::Array(vec![field(22, 8, vec![10, 0x2A, 0x4A])]));
    encode(&envelope)
}

async fn next_outbound(peer: &mut InMemoryPeer) -> OutboundMessage {
    let frame = timeout(WAIT, peer.next_frame())
        .await
        .expect("client sent nothing")
        .expect("transport dropped");
    OmmCodec::new().decode_outbound(&frame).unwrap()
}

async fn next_message(messages: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    timeout(WAIT, messages.recv())
        .await
        .expect("no message delivered")
        .expect("handler dropped")
}

async fn wait_for_event<F>(
    events: &mut mpsc::Receiver<SessionEvent>,
    mut matches: F,
) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not observed")
}

/// Play the server side of a successful login.
async fn accept_login(peer: &mut InMemoryPeer) {
    match next_outbound(peer).await {
        OutboundMessage::Login(login) => assert!(login.refresh),
        other => panic!("expected login, got {other:?}"),
    }
    peer.push(login_response(StreamState::Open, DataState::Ok))
        .await
        .unwrap();
}

async fn open(h: &mut Harness) {
    let (result, ()) = tokio::join!(h.session.open(credentials()), accept_login(&mut h.peer));
    result.unwrap();
    assert_eq!(h.session.state(), ConnectionState::LoggedIn);
}

async fn subscribe_eur(h: &mut Harness) -> Handle {
    let handle = h
        .session
        .subscribe(
            "ELEKTRON_DD",
            "EUR=",
            DomainKind::MarketPrice,
            Some(vec![22, 25, 15]),
        )
        .await
        .unwrap();

    match next_outbound(&mut h.peer).await {
        OutboundMessage::Item(item) => {
            assert_eq!(item.id, handle.value());
            assert_eq!(item.service, "ELEKTRON_DD");
            assert_eq!(item.name, "EUR=");
            assert!(item.streaming);
        }
        other => panic!("expected item request, got {other:?}"),
    }
    handle
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn eur_refresh_end_to_end() {
    let mut h = harness();
    open(&mut h).await;

    let handle = h
        .session
        .subscribe(
            "ELEKTRON_DD",
            "EUR=",
            DomainKind::MarketPrice,
            Some(vec![22, 25, 15]),
        )
        .await
        .unwrap();

    let OutboundMessage::Item(request) = next_outbound(&mut h.peer).await else {
        panic!("expected item request");
    };
    assert_eq!(request.id, handle.value());
    assert_eq!(request.view, Some(vec![22, 25, 15]));
    assert_eq!(
        h.session.subscription(handle).unwrap().status,
        SubscriptionStatus::Pending
    );

    h.peer.push(eur_refresh(handle)).await.unwrap();
    let message = next_message(&mut h.messages).await;

    assert_eq!(message.handle, handle);
    assert_eq!(message.name.as_deref(), Some("EUR="));
    assert!(message.complete);
    assert!(message.state.as_ref().unwrap().is_open_ok());

    let FieldValue::Real(bid) = &message.field(22).unwrap().value else {
        panic!("BID is not a real");
    };
    assert_eq!(bid.to_decimal(), Some(Decimal::new(10825, 4)));
    assert_eq!(message.field(22).unwrap().name.as_deref(), Some("BID"));
    assert_eq!(message.field(15).unwrap().value.to_string(), "EUR");

    assert_eq!(
        h.session.subscription(handle).unwrap().status,
        SubscriptionStatus::Open
    );
}

#[tokio::test]
async fn login_rejection_fails_open() {
    let mut h = harness();
    let peer = &mut h.peer;

    let reject = async {
        let _ = next_outbound(peer).await;
        peer.push(login_response(StreamState::Closed, DataState::Suspect))
            .await
            .unwrap();
    };
    let (result, ()) = tokio::join!(h.session.open(credentials()), reject);

    assert!(matches!(result, Err(SessionError::LoginRejected { .. })));
    assert_eq!(h.session.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn login_timeout_fails_open() {
    let mut h = harness();

    let result = h.session.open(credentials()).await;

    assert!(matches!(result, Err(SessionError::LoginTimeout(_))));
    assert_eq!(h.session.state(), ConnectionState::Disconnected);
    assert!(matches!(
        h.peer.try_next_frame().map(|f| OmmCodec::new().decode_outbound(&f)),
        Some(Ok(OutboundMessage::Login(_)))
    ));
}

#[tokio::test]
async fn auth_failure_fails_open() {
    let h = harness();
    h.endpoint.fail.store(true, Ordering::SeqCst);

    let result = h.session.open(credentials()).await;

    assert!(matches!(result, Err(SessionError::Auth(AuthError::Rejected { status: 401, .. }))));
    assert_eq!(h.session.state(), ConnectionState::Disconnected);
    assert_eq!(h.peer.connect_count(), 0);
}

#[tokio::test]
async fn close_cancels_pending_open() {
    let mut h = harness();
    let session = &h.session;
    let peer = &mut h.peer;

    let close_after_login_request = async {
        let _ = next_outbound(peer).await;
        session.close().await;
    };
    let (result, ()) = tokio::join!(session.open(credentials()), close_after_login_request);

    assert!(matches!(result, Err(SessionError::Cancelled)));
    assert_eq!(h.session.state(), ConnectionState::Closed);
    assert!(!h.peer.is_connected());
}

#[tokio::test]
async fn unknown_handle_is_dropped() {
    let mut h = harness();
    open(&mut h).await;
    let handle = subscribe_eur(&mut h).await;
    let before = h.session.subscriptions();

    h.peer.push(update(Handle::new(999))).await.unwrap();
    h.peer.push(update(handle)).await.unwrap();

    let message = next_message(&mut h.messages).await;
    assert_eq!(message.handle, handle);
    assert_eq!(h.session.subscriptions(), before);
    assert_eq!(h.session.state(), ConnectionState::LoggedIn);
}

#[tokio::test(start_paused = true)]
async fn renewal_reissues_login_without_status_change() {
    let mut h = harness_with(config(), Duration::from_secs(10));
    open(&mut h).await;
    let handle = subscribe_eur(&mut h).await;
    h.peer.push(eur_refresh(handle)).await.unwrap();
    next_message(&mut h.messages).await;

    // renewal is due 5s into the 10s lifetime
    let OutboundMessage::Login(reissue) = next_outbound(&mut h.peer).await else {
        panic!("expected login reissue");
    };

    assert!(!reissue.refresh);
    assert_eq!(reissue.token, "token-2");
    assert_eq!(h.endpoint.calls(), 2);

    wait_for_event(&mut h.events, |e| matches!(e, SessionEvent::TokenRenewed { .. })).await;
    assert_eq!(h.session.current_token().unwrap().access_token(), "token-2");
    assert_eq!(
        h.session.subscription(handle).unwrap().status,
        SubscriptionStatus::Open
    );
    assert_eq!(h.session.state(), ConnectionState::LoggedIn);
    assert_eq!(h.peer.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn renewal_failure_is_reported() {
    let mut h = harness_with(config(), Duration::from_secs(10));
    open(&mut h).await;
    h.endpoint.fail.store(true, Ordering::SeqCst);

    let failed = wait_for_event(&mut h.events, |e| {
        matches!(e, SessionEvent::TokenRenewalFailed { .. })
    })
    .await;
    assert!(matches!(
        failed,
        SessionEvent::TokenRenewalFailed { attempt: 1, .. }
    ));

    // 401 is not retryable
    wait_for_event(&mut h.events, |e| matches!(e, SessionEvent::Unauthenticated)).await;
    assert_eq!(h.session.current_token().unwrap().access_token(), "token-1");
    assert_eq!(h.session.state(), ConnectionState::LoggedIn);
}

#[tokio::test(start_paused = true)]
async fn reconnect_replays_same_handles() {
    let mut h = harness();
    open(&mut h).await;

    let eur = subscribe_eur(&mut h).await;
    let gbp = h
        .session
        .subscribe("ELEKTRON_DD", "GBP=", DomainKind::MarketPrice, None)
        .await
        .unwrap();
    let _ = next_outbound(&mut h.peer).await;
    h.peer.push(eur_refresh(eur)).await.unwrap();
    next_message(&mut h.messages).await;

    h.peer.drop_connection("network down").await;

    wait_for_event(&mut h.events, |e| {
        matches!(e, SessionEvent::Reconnecting { attempt: 1, .. })
    })
    .await;
    accept_login(&mut h.peer).await;

    let mut replayed = Vec::new();
    for _ in 0..2 {
        match next_outbound(&mut h.peer).await {
            OutboundMessage::Item(item) => replayed.push(Handle::new(item.id)),
            other => panic!("expected replayed item, got {other:?}"),
        }
    }
    replayed.sort();
    assert_eq!(replayed, vec![eur, gbp]);

    wait_for_event(&mut h.events, |e| {
        matches!(e, SessionEvent::Reconnected { attempts: 1 })
    })
    .await;
    assert_eq!(h.session.state(), ConnectionState::LoggedIn);
    assert_eq!(h.peer.connect_count(), 2);
    assert_eq!(h.endpoint.calls(), 2);
    assert_eq!(
        h.session.subscription(eur).unwrap().status,
        SubscriptionStatus::Pending
    );

    h.peer.push(update(eur)).await.unwrap();
    assert_eq!(next_message(&mut h.messages).await.handle, eur);
}

#[tokio::test(start_paused = true)]
async fn only_pending_and_open_subscriptions_are_replayed() {
    let mut h = harness();
    open(&mut h).await;

    let open_handle = subscribe_eur(&mut h).await;
    h.peer.push(eur_refresh(open_handle)).await.unwrap();
    next_message(&mut h.messages).await;

    let pending = h
        .session
        .subscribe("ELEKTRON_DD", "GBP=", DomainKind::MarketPrice, None)
        .await
        .unwrap();
    let _ = next_outbound(&mut h.peer).await;

    let errored = h
        .session
        .subscribe("ELEKTRON_DD", "JPY=", DomainKind::MarketPrice, None)
        .await
        .unwrap();
    let _ = next_outbound(&mut h.peer).await;
    let mut status = InboundEnvelope::new("status", errored, DomainKind::MarketPrice);
    status.state = Some(state(StreamState::Closed, DataState::Suspect, "Not entitled"));
    h.peer.push(encode(&status)).await.unwrap();
    next_message(&mut h.messages).await;

    let snapshot = h
        .session
        .subscribe("ELEKTRON_DD", "CHF=", DomainKind::MarketPrice, None)
        .await
        .unwrap();
    let _ = next_outbound(&mut h.peer).await;
    let mut refresh = InboundEnvelope::new("refresh", snapshot, DomainKind::MarketPrice);
    refresh.state = Some(state(StreamState::NonStreaming, DataState::Ok, "Snapshot"));
    h.peer.push(encode(&refresh)).await.unwrap();
    next_message(&mut h.messages).await;

    let status_of = |handle| h.session.subscription(handle).unwrap().status;
    assert_eq!(status_of(open_handle), SubscriptionStatus::Open);
    assert_eq!(status_of(pending), SubscriptionStatus::Pending);
    assert_eq!(status_of(errored), SubscriptionStatus::Errored);
    assert_eq!(status_of(snapshot), SubscriptionStatus::Closed);

    h.peer.drop_connection("network down").await;
    accept_login(&mut h.peer).await;

    let mut replayed = Vec::new();
    for _ in 0..2 {
        match next_outbound(&mut h.peer).await {
            OutboundMessage::Item(item) => replayed.push(Handle::new(item.id)),
            other => panic!("expected replayed item, got {other:?}"),
        }
    }
    replayed.sort();
    assert_eq!(replayed, vec![open_handle, pending]);

    wait_for_event(&mut h.events, |e| matches!(e, SessionEvent::Reconnected { .. })).await;
    assert!(h.peer.try_next_frame().is_none());
    assert_eq!(
        h.session.subscription(errored).unwrap().status,
        SubscriptionStatus::Errored
    );
    assert_eq!(
        h.session.subscription(snapshot).unwrap().status,
        SubscriptionStatus::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnects_lose_session() {
    let mut h = harness();
    open(&mut h).await;
    subscribe_eur(&mut h).await;

    h.peer.refuse_connects(10);
    h.peer.drop_connection("network down").await;

    let result = timeout(WAIT, h.session.wait_closed()).await.unwrap();

    assert!(matches!(result, Err(SessionError::SessionLost)));
    assert_eq!(h.session.state(), ConnectionState::Closed);
    assert!(h.session.subscriptions().is_empty());
    assert_eq!(h.peer.connect_count(), 1 + 3);
    wait_for_event(&mut h.events, |e| matches!(e, SessionEvent::SessionLost)).await;
}

#[tokio::test]
async fn unsubscribe_sends_close_once() {
    let mut h = harness();
    open(&mut h).await;
    let handle = subscribe_eur(&mut h).await;

    h.session.unsubscribe(handle).await.unwrap();

    match next_outbound(&mut h.peer).await {
        OutboundMessage::Close(close) => assert_eq!(close.id, handle.value()),
        other => panic!("expected close, got {other:?}"),
    }
    assert_eq!(
        h.session.subscription(handle),
        Err(RegistryError::UnknownHandle(handle))
    );

    h.session.unsubscribe(handle).await.unwrap();
    assert!(h.peer.try_next_frame().is_none());

    h.peer.push(update(handle)).await.unwrap();
    h.session.close().await;
    assert!(h.messages.try_recv().is_err());
}

#[tokio::test]
async fn close_logs_out_and_releases() {
    let mut h = harness();
    open(&mut h).await;
    subscribe_eur(&mut h).await;

    h.session.close().await;
    h.session.close().await;

    match next_outbound(&mut h.peer).await {
        OutboundMessage::Close(close) => assert_eq!(Handle::new(close.id), Handle::LOGIN),
        other => panic!("expected logout, got {other:?}"),
    }
    assert!(h.peer.try_next_frame().is_none());
    assert_eq!(h.session.state(), ConnectionState::Closed);
    assert!(h.session.subscriptions().is_empty());
    assert!(h.session.current_token().is_none());
    assert!(!h.peer.is_connected());
    assert!(h.session.wait_closed().await.is_ok());

    let result = h
        .session
        .subscribe("ELEKTRON_DD", "EUR=", DomainKind::MarketPrice, None)
        .await;
    assert!(matches!(result, Err(SessionError::Closed)));
}
