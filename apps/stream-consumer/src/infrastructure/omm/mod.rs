//! Streaming Protocol Adapters
//!
//! Client side of the streaming market-data protocol: wire messages and
//! codec, field list decoding, token management, inbound dispatch and the
//! session that ties them to a [`Transport`](crate::application::ports::Transport).

pub mod codec;
pub mod dispatcher;
pub mod field_list;
pub mod messages;
pub mod reconnect;
pub mod session;
pub mod token;

pub use codec::{CodecError, OmmCodec};
pub use dispatcher::{DispatchOutcome, Handler, LoginEvent, MessageHandlers, StreamDispatcher};
pub use field_list::FieldListDecoder;
pub use messages::{CloseRequest, InboundEnvelope, ItemRequest, LoginRequest, OutboundMessage};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use session::{Session, SessionConfig, SessionError, SessionEvent};
pub use token::{RenewalHandle, RenewalSchedule, TokenManager};
