//! Streaming Protocol Message Types
//!
//! Wire format types for the MessagePack envelope exchanged with the
//! streaming server. Every frame is a single MessagePack map with string
//! keys.
//!
//! # Inbound
//!
//! ```text
//! { type: "refresh" | "update" | "status" | "ack" | "generic",
//!   id, domain, name?, service?,
//!   state?: { stream, data, code, text },
//!   complete?, ack_id?,
//!   fields?: [[fid, type, bin | nil], ...] }
//! ```
//!
//! # Outbound
//!
//! - `LoginRequest`: opens (or reissues) the login stream on id 1
//! - `ItemRequest`: opens an item stream, optionally with a field view
//! - `CloseRequest`: closes a stream (id 1 closes the session)

use serde::{Deserialize, Serialize};

use crate::domain::message::{DataState, DomainKind, State, StreamState};
use crate::domain::subscription::Handle;

/// Wire `type` of requests.
pub const REQUEST_TYPE: &str = "request";

/// Wire `type` of close requests.
pub const CLOSE_TYPE: &str = "close";

// =============================================================================
// Inbound
// =============================================================================

/// State block of refresh and status messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMessage {
    /// Stream state code.
    pub stream: u8,
    /// Data state code.
    pub data: u8,
    /// Provider status code.
    #[serde(default)]
    pub code: u16,
    /// Provider status text.
    #[serde(default)]
    pub text: String,
}

impl StateMessage {
    /// Convert to the domain state.
    #[must_use]
    pub fn to_state(&self) -> State {
        State {
            stream: StreamState::from_code(self.stream),
            data: DataState::from_code(self.data),
            code: self.code,
            text: self.text.clone(),
        }
    }
}

impl From<&State> for StateMessage {
    fn from(state: &State) -> Self {
        Self {
            stream: state.stream.code(),
            data: state.data.code(),
            code: state.code,
            text: state.text.clone(),
        }
    }
}

/// Envelope of every inbound frame.
///
/// `fields` is kept as a raw MessagePack value; the field list decoder
/// validates and decodes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    /// Message kind (`refresh`, `update`, ...).
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Stream id.
    pub id: u64,
    /// Domain code.
    pub domain: u8,
    /// Item name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Service name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Stream state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateMessage>,
    /// Final part of a refresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete: Option<bool>,
    /// Acknowledged post id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<u64>,
    /// Field list payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<rmpv::Value>,
}

impl InboundEnvelope {
    /// Create an envelope with only the routing header set.
    #[must_use]
    pub fn new(msg_type: impl Into<String>, handle: Handle, domain: DomainKind) -> Self {
        Self {
            msg_type: msg_type.into(),
            id: handle.value(),
            domain: domain.code(),
            name: None,
            service: None,
            state: None,
            complete: None,
            ack_id: None,
            fields: None,
        }
    }

    /// Stream handle.
    #[must_use]
    pub const fn handle(&self) -> Handle {
        Handle::new(self.id)
    }

    /// Domain of the stream.
    #[must_use]
    pub const fn domain_kind(&self) -> DomainKind {
        DomainKind::from_code(self.domain)
    }
}

// =============================================================================
// Outbound
// =============================================================================

/// Login position advertised to the server.
pub const DEFAULT_POSITION: &str = "127.0.0.1/net";

/// Request opening or refreshing the login stream.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Always `request`.
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Always the login stream id.
    pub id: u64,
    /// Always the login domain.
    pub domain: u8,
    /// User name.
    pub name: String,
    /// Bearer token.
    pub token: String,
    /// Application id.
    pub application_id: String,
    /// Client position.
    pub position: String,
    /// `false` for an in-band token reissue.
    pub refresh: bool,
}

impl LoginRequest {
    /// Initial login.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        token: impl Into<String>,
        application_id: impl Into<String>,
    ) -> Self {
        Self {
            msg_type: REQUEST_TYPE.to_string(),
            id: Handle::LOGIN.value(),
            domain: DomainKind::Login.code(),
            name: name.into(),
            token: token.into(),
            application_id: application_id.into(),
            position: DEFAULT_POSITION.to_string(),
            refresh: true,
        }
    }

    /// Token reissue on an established login stream.
    #[must_use]
    pub fn reissue(
        name: impl Into<String>,
        token: impl Into<String>,
        application_id: impl Into<String>,
    ) -> Self {
        Self {
            refresh: false,
            ..Self::new(name, token, application_id)
        }
    }
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("name", &self.name)
            .field("token", &"[REDACTED]")
            .field("application_id", &self.application_id)
            .field("position", &self.position)
            .field("refresh", &self.refresh)
            .finish_non_exhaustive()
    }
}

/// Request opening an item stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRequest {
    /// Always `request`.
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Stream id (subscription handle).
    pub id: u64,
    /// Domain code.
    pub domain: u8,
    /// Service name.
    pub service: String,
    /// Item name.
    pub name: String,
    /// `false` for a snapshot.
    pub streaming: bool,
    /// Field ids to deliver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view: Option<Vec<i16>>,
}

impl ItemRequest {
    /// Streaming request for an item.
    #[must_use]
    pub fn new(
        handle: Handle,
        domain: DomainKind,
        service: impl Into<String>,
        name: impl Into<String>,
        view: Option<Vec<i16>>,
    ) -> Self {
        Self {
            msg_type: REQUEST_TYPE.to_string(),
            id: handle.value(),
            domain: domain.code(),
            service: service.into(),
            name: name.into(),
            streaming: true,
            view,
        }
    }
}

/// Request closing a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseRequest {
    /// Always `close`.
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Stream id.
    pub id: u64,
    /// Domain code.
    pub domain: u8,
}

impl CloseRequest {
    /// Close an item stream.
    #[must_use]
    pub fn new(handle: Handle, domain: DomainKind) -> Self {
        Self {
            msg_type: CLOSE_TYPE.to_string(),
            id: handle.value(),
            domain: domain.code(),
        }
    }

    /// Close the login stream (logout).
    #[must_use]
    pub fn logout() -> Self {
        Self::new(Handle::LOGIN, DomainKind::Login)
    }
}

/// Any outbound message, as seen by a server or a test peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// Login or token reissue.
    Login(LoginRequest),
    /// Item request.
    Item(ItemRequest),
    /// Stream close.
    Close(CloseRequest),
}

impl OutboundMessage {
    /// Stream id the message addresses.
    #[must_use]
    pub const fn handle(&self) -> Handle {
        match self {
            Self::Login(m) => Handle::new(m.id),
            Self::Item(m) => Handle::new(m.id),
            Self::Close(m) => Handle::new(m.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reissue_keeps_identity_and_clears_refresh() {
        let login = LoginRequest::new("user", "t1", "256");
        let reissue = LoginRequest::reissue("user", "t2", "256");

        assert!(login.refresh);
        assert!(!reissue.refresh);
        assert_eq!(reissue.id, 1);
        assert_eq!(reissue.domain, 1);
        assert_eq!(reissue.token, "t2");
    }

    #[test]
    fn login_debug_redacts_token() {
        let login = LoginRequest::new("user", "bearer-value", "256");
        assert!(!format!("{login:?}").contains("bearer-value"));
    }

    #[test]
    fn logout_targets_login_stream() {
        let logout = CloseRequest::logout();
        assert_eq!(logout.msg_type, "close");
        assert_eq!(logout.id, 1);
        assert_eq!(logout.domain, 1);
    }

    #[test]
    fn state_message_conversion() {
        let wire = StateMessage {
            stream: 1,
            data: 1,
            code: 0,
            text: "All is well".to_string(),
        };
        let state = wire.to_state();
        assert!(state.is_open_ok());
        assert_eq!(StateMessage::from(&state), wire);
    }
}
