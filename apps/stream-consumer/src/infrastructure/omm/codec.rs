//! Stream Codec Module
//!
//! Encoding and decoding of protocol envelopes. All frames are binary
//! `MessagePack` maps with named fields, e.g.
//!
//! ```json
//! {"type":"refresh","id":2,"domain":6,"name":"EUR=","service":"ELEKTRON_DD",
//!  "state":{"stream":1,"data":1,"code":0,"text":"All is well"},
//!  "fields":[[22,8,"<bin>"],[25,8,"<bin>"]]}
//! ```

use serde::Deserialize;

use crate::domain::subscription::Handle;
use crate::infrastructure::omm::messages::{
    CLOSE_TYPE, CloseRequest, InboundEnvelope, ItemRequest, LoginRequest, OutboundMessage,
    REQUEST_TYPE,
};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// `MessagePack` encoding failed.
    #[error("`MessagePack` encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// `MessagePack` decoding failed.
    #[error("`MessagePack` decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Raw value could not be read.
    #[error("`MessagePack` value error: {0}")]
    ValueRead(#[from] rmpv::decode::Error),

    /// Unknown message type.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// Just enough of an outbound frame to pick its concrete type.
#[derive(Deserialize)]
struct OutboundHeader {
    #[serde(rename = "type")]
    msg_type: String,
    id: u64,
}

/// `MessagePack` codec for the streaming protocol.
#[derive(Debug, Default, Clone)]
pub struct OmmCodec;

impl OmmCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode an inbound frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a map with the routing header
    /// (`type`, `id`, `domain`).
    pub fn decode(&self, data: &[u8]) -> Result<InboundEnvelope, CodecError> {
        if data.is_empty() {
            return Err(CodecError::InvalidFormat("empty frame".to_string()));
        }
        Ok(rmp_serde::from_slice(data)?)
    }

    /// Decode a frame produced by this client.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be parsed or its type is not a
    /// request or close.
    pub fn decode_outbound(&self, data: &[u8]) -> Result<OutboundMessage, CodecError> {
        let header: OutboundHeader = rmp_serde::from_slice(data)?;

        match header.msg_type.as_str() {
            REQUEST_TYPE if Handle::new(header.id).is_login() => {
                Ok(OutboundMessage::Login(rmp_serde::from_slice(data)?))
            }
            REQUEST_TYPE => Ok(OutboundMessage::Item(rmp_serde::from_slice::<ItemRequest>(
                data,
            )?)),
            CLOSE_TYPE => Ok(OutboundMessage::Close(rmp_serde::from_slice::<CloseRequest>(
                data,
            )?)),
            other => Err(CodecError::UnknownMessageType(other.to_string())),
        }
    }

    /// Encode a value as a `MessagePack` map with named fields.
    ///
    /// # Errors
    ///
    /// Returns an error if `MessagePack` serialization fails.
    pub fn encode<T: serde::Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(value)?)
    }
}
