//! # JAUS component runtime
//!
//! The endpoint side of the fabric. A component owns a shared-memory inbox
//! it drains and an outbox pointing at its node manager; everything it sends
//! is routed by the node. On top of that sit the two-queue priority
//! [`MessageHandler`] and the receipt machinery behind blocking sends.

pub mod component;
pub mod error;
pub mod message_handler;
pub mod receipt;

pub use component::Component;
pub use error::{ComponentError, ErrorHistory};
pub use message_handler::{MessageHandler, MessageProcessor};
pub use receipt::{send_and_wait, Receipt, ReceiptRegistry, ReceiptStatus, SendOptions};

use jaus_wire::Stream;

/// Anything that can put a serialized message on the wire. Implemented by
/// the component (outbox enqueue) and by the node's routing core.
pub trait StreamSender: Send + Sync {
    fn send_stream(&self, stream: &Stream) -> Result<(), ComponentError>;
}
