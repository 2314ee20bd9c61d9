use crate::header::{AckNack, Header};
use crate::Address;

/// A body-less acknowledge/negative-acknowledge, reconstructed from a bare
/// header when `data_size == 0` and the ack/nack bits are set. Never
/// serialized through the codec; the header is the whole message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckNackMessage {
    pub command_code: u16,
    pub source: Address,
    pub destination: Address,
    pub ack_nack: AckNack,
}

impl AckNackMessage {
    pub fn from_header(header: &Header) -> Self {
        Self {
            command_code: header.command_code,
            source: header.source,
            destination: header.destination,
            ack_nack: header.ack_nack,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.ack_nack == AckNack::Ack
    }

    pub fn is_nack(&self) -> bool {
        self.ack_nack == AckNack::Nack
    }
}
