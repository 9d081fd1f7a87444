use rkyv::{rancor, util::AlignedVec, Archive, Deserialize, Serialize};

use crate::constants::DKG_MAGIC;

/// Error produced by the envelope codec.
pub type CodecError = rancor::Error;

/// Enum representing the type of a protocol message.
///
/// Requests use `ProtocolInit` / `ProtocolRequest`, responses use
/// `Ack` / `Nack` / `Busy`. Kept as a plain `u32` on the wire so that
/// unknown values from newer peers survive decoding and can be rejected
/// explicitly.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
#[repr(C)]
pub enum MessageType {
    /// First handshake phase.
    ProtocolInit = 1,
    /// Second handshake phase carrying the full payload.
    ProtocolRequest = 2,
    /// Positive acknowledgement.
    Ack = 3,
    /// Explicit rejection.
    Nack = 4,
    /// Transient overload; the sender should retry later.
    Busy = 5,
}
impl MessageType {
    /// Converts a `u32` value to a `MessageType` if possible.
    const fn from_u32(value: u32) -> Option<Self> {
        match value {
            _ if value == Self::ProtocolInit as u32 => Some(Self::ProtocolInit),
            _ if value == Self::ProtocolRequest as u32 => Some(Self::ProtocolRequest),
            _ if value == Self::Ack as u32 => Some(Self::Ack),
            _ if value == Self::Nack as u32 => Some(Self::Nack),
            _ if value == Self::Busy as u32 => Some(Self::Busy),
            _ => None,
        }
    }

    /// Whether this type is sent by an initiator rather than a responder.
    #[must_use]
    pub const fn is_request(self) -> bool {
        matches!(self, Self::ProtocolInit | Self::ProtocolRequest)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProtocolInit => "PROTOCOL_INIT",
            Self::ProtocolRequest => "PROTOCOL_REQUEST",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Busy => "BUSY",
        }
    }
}
impl From<MessageType> for u32 {
    #[inline(always)]
    fn from(val: MessageType) -> Self {
        val as Self
    }
}
impl TryFrom<u32> for MessageType {
    type Error = ();

    /// Attempts to convert a `u32` to a `MessageType`.
    ///
    /// Returns `Err(())` for values outside the closed set.
    #[inline(always)]
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::from_u32(value).ok_or(())
    }
}
impl core::fmt::Display for MessageType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope header shared by every message.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct Header {
    /// Operation this exchange belongs to.
    pub operation_id: String,
    /// Deterministic session id, stable across retries of the same exchange.
    pub session_id: String,
    /// Message type as a `u32` (see [`MessageType`]).
    pub message_type: u32,
    /// Network protocol the message is addressed to, e.g. `/store/1.0.0`.
    pub protocol: String,
    /// Peer id of the sender.
    pub sender: String,
}

/// Structure representing one protocol message.
///
/// `data` is the kind-specific payload; the node crate encodes it as JSON.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
#[non_exhaustive]
pub struct Message {
    /// Magic number for message validation.
    pub magic: u32,
    pub header: Header,
    pub data: Vec<u8>,
}
impl Message {
    /// Constructs a new `Message`.
    ///
    /// # Arguments
    ///
    /// * `operation_id` - The operation this message belongs to.
    /// * `session_id` - The deterministic session identifier.
    /// * `message_type` - Request or response type.
    /// * `protocol` - Target network protocol.
    /// * `sender` - Sender peer id.
    /// * `data` - Encoded payload.
    #[must_use]
    pub fn new(
        operation_id: impl Into<String>,
        session_id: impl Into<String>,
        message_type: MessageType,
        protocol: impl Into<String>,
        sender: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            magic: DKG_MAGIC,
            header: Header {
                operation_id: operation_id.into(),
                session_id: session_id.into(),
                message_type: message_type.into(),
                protocol: protocol.into(),
                sender: sender.into(),
            },
            data,
        }
    }

    /// Builds the response to this message, swapping in the responder as sender.
    #[must_use]
    pub fn reply(
        &self,
        message_type: MessageType,
        sender: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self::new(
            self.header.operation_id.clone(),
            self.header.session_id.clone(),
            message_type,
            self.header.protocol.clone(),
            sender,
            data,
        )
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.magic == DKG_MAGIC
    }

    /// Declared message type, or `Err(())` if it is outside the closed set.
    pub fn message_type(&self) -> Result<MessageType, ()> {
        MessageType::try_from(self.header.message_type)
    }

    /// Serialises the envelope into a datagram.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(rkyv::to_bytes::<CodecError>(self)?.to_vec())
    }

    /// Deserialises a datagram. The bytes are copied into an aligned buffer first,
    /// since socket buffers carry no alignment guarantee.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, CodecError>(&aligned)
    }
}
