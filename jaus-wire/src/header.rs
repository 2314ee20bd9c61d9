use crate::address::Address;
use crate::error::WireError;
use crate::HEADER_SIZE;

/// Current wire protocol version carried in the properties word.
pub const VERSION: u8 = 2;

/// Default message priority. Range is 0..=15; service connections and
/// safety-critical traffic use values above this.
pub const DEFAULT_PRIORITY: u8 = 6;
pub const MAX_PRIORITY: u8 = 15;

/// Acknowledgement request/response state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum AckNack {
    #[default]
    None = 0,
    Request = 1,
    Ack = 2,
    Nack = 3,
}

impl AckNack {
    fn from_bits(bits: u16) -> Self {
        match bits & 0x3 {
            1 => AckNack::Request,
            2 => AckNack::Ack,
            3 => AckNack::Nack,
            _ => AckNack::None,
        }
    }
}

/// Position of a packet within a (possibly fragmented) message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DataControl {
    #[default]
    Single = 0,
    First = 1,
    Middle = 2,
    Last = 3,
    Retransmit = 4,
}

impl DataControl {
    fn from_bits(bits: u16) -> Result<Self, WireError> {
        match bits & 0x7 {
            0 => Ok(DataControl::Single),
            1 => Ok(DataControl::First),
            2 => Ok(DataControl::Middle),
            3 => Ok(DataControl::Last),
            4 => Ok(DataControl::Retransmit),
            _ => Err(WireError::InvalidHeader),
        }
    }
}

/// The 16-byte message header.
///
/// Wire layout, all little-endian:
///
/// | bytes  | field |
/// |--------|-------|
/// | 0..2   | properties word |
/// | 2..4   | command code |
/// | 4..8   | source address |
/// | 8..12  | destination address |
/// | 12..14 | body size in bytes |
/// | 14..16 | sequence number |
///
/// Properties word: bits 0-3 priority, 4-5 ack/nack, 6 service-connection
/// flag, 7-9 data control, 10-15 version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub priority: u8,
    pub ack_nack: AckNack,
    pub service_connection: bool,
    pub data_control: DataControl,
    pub version: u8,
    pub command_code: u16,
    pub source: Address,
    pub destination: Address,
    pub data_size: u16,
    pub sequence_number: u16,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            ack_nack: AckNack::None,
            service_connection: false,
            data_control: DataControl::Single,
            version: VERSION,
            command_code: 0,
            source: Address::default(),
            destination: Address::default(),
            data_size: 0,
            sequence_number: 0,
        }
    }
}

impl Header {
    pub fn new(command_code: u16, source: Address, destination: Address) -> Self {
        Self { command_code, source, destination, ..Self::default() }
    }

    fn properties(&self) -> u16 {
        (self.priority as u16 & 0xF)
            | ((self.ack_nack as u16) << 4)
            | ((self.service_connection as u16) << 6)
            | ((self.data_control as u16) << 7)
            | ((self.version as u16 & 0x3F) << 10)
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&self.properties().to_le_bytes());
        out[2..4].copy_from_slice(&self.command_code.to_le_bytes());
        out[4..8].copy_from_slice(&self.source.to_u32().to_le_bytes());
        out[8..12].copy_from_slice(&self.destination.to_u32().to_le_bytes());
        out[12..14].copy_from_slice(&self.data_size.to_le_bytes());
        out[14..16].copy_from_slice(&self.sequence_number.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_SIZE {
            return Err(WireError::InvalidHeader);
        }
        let word = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        let dword =
            |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);

        let properties = word(0);
        Ok(Self {
            priority: (properties & 0xF) as u8,
            ack_nack: AckNack::from_bits(properties >> 4),
            service_connection: properties & (1 << 6) != 0,
            data_control: DataControl::from_bits(properties >> 7)?,
            version: ((properties >> 10) & 0x3F) as u8,
            command_code: word(2),
            source: Address::from_u32(dword(4)),
            destination: Address::from_u32(dword(8)),
            data_size: word(12),
            sequence_number: word(14),
        })
    }

    /// Copy of this header marked as a retransmission; everything else is
    /// preserved.
    pub fn as_retransmit(&self) -> Header {
        Header { data_control: DataControl::Retransmit, ..*self }
    }

    /// Swap source and destination, used when synthesizing replies and
    /// NACKs.
    pub fn swap_source_destination(&mut self) {
        std::mem::swap(&mut self.source, &mut self.destination);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_sixteen_bytes_and_round_trips() {
        let h = Header {
            priority: 11,
            ack_nack: AckNack::Request,
            service_connection: true,
            data_control: DataControl::Middle,
            version: VERSION,
            command_code: 0x4202,
            source: Address::new(1, 2, 3, 4),
            destination: Address::new(5, 6, 7, 8),
            data_size: 512,
            sequence_number: 41,
        };
        let bytes = h.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(Header::decode(&bytes).unwrap(), h);
    }

    #[test]
    fn rejects_short_and_malformed_input() {
        assert_eq!(Header::decode(&[0u8; 15]), Err(WireError::InvalidHeader));
        // Data-control value 5 is not a defined flag.
        let mut bytes = Header::default().encode();
        let properties = u16::from_le_bytes([bytes[0], bytes[1]]) | (5 << 7);
        bytes[0..2].copy_from_slice(&properties.to_le_bytes());
        assert_eq!(Header::decode(&bytes), Err(WireError::InvalidHeader));
    }

    #[test]
    fn retransmit_preserves_all_but_data_control() {
        let h = Header::new(0x2202, Address::new(1, 1, 2, 1), Address::new(1, 1, 1, 1));
        let r = h.as_retransmit();
        assert_eq!(r.data_control, DataControl::Retransmit);
        assert_eq!(r.command_code, h.command_code);
        assert_eq!(r.sequence_number, h.sequence_number);
    }
}
