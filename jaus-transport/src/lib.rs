//! # JAUS transports
//!
//! Every way bytes enter or leave a node: named shared-memory inboxes for
//! same-host component traffic, UDP unicast/multicast/broadcast and TCP for
//! inter-node links, and serial for fixed-peer wiring.
//!
//! All transports carry the same wire format: the 16-byte header followed by
//! the body. Receivers hand `(stream, header, transport kind)` to a
//! [`StreamHandler`]; senders take a serialized [`Stream`].

pub mod error;
pub mod serial;
pub mod shm;
pub mod tcp;
pub mod udp;

pub use error::TransportError;
pub use shm::{MessageBox, Registry, COMPONENT_INBOX_SIZE, NODE_INBOX_SIZE};

use jaus_wire::{Header, Stream};
use std::sync::Arc;

/// Standard UDP/TCP port for inter-node traffic.
pub const WIRE_PORT: u16 = 3794;

/// Which transport a message arrived over. Routing uses this for loopback
/// suppression and to prefer the arrival transport when opening a
/// connection back to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    SharedMemory,
    Udp,
    Tcp,
    Serial,
    Communicator,
}

/// Receiver side of every transport: invoked from the transport's reader
/// thread for each well-framed message. The header is pre-parsed when the
/// transport had to parse it anyway for framing.
pub trait StreamHandler: Send + Sync {
    fn on_stream(&self, stream: Stream, header: Option<Header>, kind: TransportKind);
}

/// Shared handle to a stream handler.
pub type SharedStreamHandler = Arc<dyn StreamHandler>;
