use thiserror::Error;

/// Errors produced by the wire layer.
///
/// Kept `Clone + Eq` so they can sit in per-component error-history rings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("invalid header")]
    InvalidHeader,
    #[error("bad packet: {0}")]
    BadPacket(&'static str),
    #[error("read past end of stream")]
    ReadPastEnd,
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
    #[error("invalid address")]
    InvalidAddress,
    #[error("unknown message type {0:#06x}")]
    UnknownMessageType(u16),
    #[error("message too large")]
    MessageTooLarge,
}
