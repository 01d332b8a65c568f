//! Decoded Message Types
//!
//! The typed messages delivered to handlers, and the classification enums
//! (message kind, domain, stream/data state) used to route them.

use std::fmt;

use crate::domain::field::FieldEntry;
use crate::domain::subscription::Handle;

// =============================================================================
// Message Kind
// =============================================================================

/// Kind of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Full image of an item.
    Refresh,
    /// Incremental change.
    Update,
    /// Stream or data state change.
    Status,
    /// Acknowledgment of a posted message.
    Ack,
    /// Bidirectional generic message.
    Generic,
}

impl MessageKind {
    /// Number of message kinds (size of a handler table).
    pub const COUNT: usize = 5;

    /// All message kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Refresh,
            Self::Update,
            Self::Status,
            Self::Ack,
            Self::Generic,
        ]
    }

    /// Parse a wire kind name.
    #[must_use]
    pub fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "refresh" => Some(Self::Refresh),
            "update" => Some(Self::Update),
            "status" => Some(Self::Status),
            "ack" => Some(Self::Ack),
            "generic" => Some(Self::Generic),
            _ => None,
        }
    }

    /// Wire kind name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Refresh => "refresh",
            Self::Update => "update",
            Self::Status => "status",
            Self::Ack => "ack",
            Self::Generic => "generic",
        }
    }

    /// Slot index in a handler table.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Refresh => 0,
            Self::Update => 1,
            Self::Status => 2,
            Self::Ack => 3,
            Self::Generic => 4,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Domain Kind
// =============================================================================

/// Semantic category of a message stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DomainKind {
    /// Session login stream.
    Login,
    /// Service directory.
    Source,
    /// Field dictionary download.
    Dictionary,
    /// Level 1 market price.
    #[default]
    MarketPrice,
    /// Order book by order.
    MarketByOrder,
    /// Order book by price.
    MarketByPrice,
    /// Market maker quotes.
    MarketMaker,
    /// Symbol list.
    SymbolList,
    /// Any other domain code.
    Other(u8),
}

impl DomainKind {
    /// Map a wire domain code.
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Login,
            4 => Self::Source,
            5 => Self::Dictionary,
            6 => Self::MarketPrice,
            7 => Self::MarketByOrder,
            8 => Self::MarketByPrice,
            9 => Self::MarketMaker,
            10 => Self::SymbolList,
            other => Self::Other(other),
        }
    }

    /// Wire domain code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Login => 1,
            Self::Source => 4,
            Self::Dictionary => 5,
            Self::MarketPrice => 6,
            Self::MarketByOrder => 7,
            Self::MarketByPrice => 8,
            Self::MarketMaker => 9,
            Self::SymbolList => 10,
            Self::Other(code) => code,
        }
    }

    /// Check for the login domain.
    #[must_use]
    pub const fn is_login(self) -> bool {
        matches!(self, Self::Login)
    }
}

// =============================================================================
// State
// =============================================================================

/// State of the stream carrying an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Streaming; updates will follow.
    Open,
    /// Snapshot only; no updates will follow.
    NonStreaming,
    /// Closed by the provider; retrying elsewhere may help.
    ClosedRecover,
    /// Closed by the provider.
    Closed,
    /// Item moved; re-request under a new name.
    Redirected,
    /// Unrecognized code.
    Unspecified,
}

impl StreamState {
    /// Map a wire stream-state code.
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Open,
            2 => Self::NonStreaming,
            3 => Self::ClosedRecover,
            4 => Self::Closed,
            5 => Self::Redirected,
            _ => Self::Unspecified,
        }
    }

    /// Wire code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Unspecified => 0,
            Self::Open => 1,
            Self::NonStreaming => 2,
            Self::ClosedRecover => 3,
            Self::Closed => 4,
            Self::Redirected => 5,
        }
    }

    /// Display name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::NonStreaming => "NonStreaming",
            Self::ClosedRecover => "ClosedRecover",
            Self::Closed => "Closed",
            Self::Redirected => "Redirected",
            Self::Unspecified => "Unspecified",
        }
    }
}

/// Health of the data on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataState {
    /// Data is good.
    Ok,
    /// Data may be stale.
    Suspect,
    /// No data state given.
    NoChange,
}

impl DataState {
    /// Map a wire data-state code.
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Ok,
            2 => Self::Suspect,
            _ => Self::NoChange,
        }
    }

    /// Wire code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::NoChange => 0,
            Self::Ok => 1,
            Self::Suspect => 2,
        }
    }

    /// Display name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "Ok",
            Self::Suspect => "Suspect",
            Self::NoChange => "NoChange",
        }
    }
}

/// Stream and data state carried by refresh and status messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    /// Stream state.
    pub stream: StreamState,
    /// Data state.
    pub data: DataState,
    /// Provider status code.
    pub code: u16,
    /// Provider status text.
    pub text: String,
}

impl State {
    /// An open, healthy stream.
    #[must_use]
    pub fn open_ok(text: impl Into<String>) -> Self {
        Self {
            stream: StreamState::Open,
            data: DataState::Ok,
            code: 0,
            text: text.into(),
        }
    }

    /// Check for an open stream with good data.
    #[must_use]
    pub const fn is_open_ok(&self) -> bool {
        matches!(self.stream, StreamState::Open) && matches!(self.data, DataState::Ok)
    }

    /// Check whether the provider closed the stream.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(
            self.stream,
            StreamState::Closed | StreamState::ClosedRecover | StreamState::Redirected
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Open State: {} / {} / {} / '{}'",
            self.stream.as_str(),
            self.data.as_str(),
            self.code,
            self.text
        )
    }
}

// =============================================================================
// Message
// =============================================================================

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message kind.
    pub kind: MessageKind,
    /// Stream handle the message belongs to.
    pub handle: Handle,
    /// Domain of the stream.
    pub domain: DomainKind,
    /// Item name, when present.
    pub name: Option<String>,
    /// Service name, when present.
    pub service_name: Option<String>,
    /// Stream state (refresh and status only).
    pub state: Option<State>,
    /// Whether this is the final part of a multi-part refresh.
    pub complete: bool,
    /// Acknowledged post id (ack only).
    pub ack_id: Option<u64>,
    /// Decoded payload.
    pub fields: Vec<FieldEntry>,
}

impl Message {
    /// Find a field by id.
    #[must_use]
    pub fn field(&self, field_id: i16) -> Option<&FieldEntry> {
        self.fields.iter().find(|f| f.field_id == field_id)
    }
}
