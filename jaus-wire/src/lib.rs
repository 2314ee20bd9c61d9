//! # JAUS wire layer
//!
//! The byte-level foundation of the messaging fabric: four-part addresses,
//! the 16-byte little-endian message header, the growable [`Stream`] buffer
//! that every transport carries, the message codec for the core catalog, and
//! large-data-set segmentation/reassembly for payloads exceeding the wire
//! MTU.
//!
//! Everything here is pure data manipulation; no sockets, no threads.

pub mod address;
pub mod codec;
pub mod error;
pub mod header;
pub mod large_data;
pub mod messages;
pub mod stream;
pub mod time;

pub use address::Address;
pub use codec::{KnownMessage, MessageBody, MessageCategory};
pub use error::WireError;
pub use header::{AckNack, DataControl, Header};
pub use large_data::{LargeDataSet, LargeDataSetKey, LargeDataSetMap};
pub use stream::Stream;
pub use time::{ManualTimeProvider, SystemTimeProvider, TimeProvider};

/// Size of the message header on the wire, in bytes.
pub const HEADER_SIZE: usize = 16;

/// Maximum size of a single packet on any link, header included.
///
/// Messages longer than this are carried as large data sets. Both sides of
/// every link must agree on this constant.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Largest message body that fits in one packet.
pub const MAX_BODY_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// Default total timeout for a blocking send awaiting a response (ms).
pub const RESPONSE_TIMEOUT_MS: u64 = 750;

/// Maximum number of transmissions for one blocking send.
pub const MAX_SEND_COUNT: u8 = 3;

/// An incomplete large data set older than this is discarded.
pub const REASSEMBLY_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(1000);
