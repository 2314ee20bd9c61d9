//! # JAUS node manager
//!
//! The per-host daemon that routes every message between local components
//! and the rest of the system. The [`routing::NodeRouter`] is the pivot:
//! each byte entering or leaving the node passes through its dispatch.
//! Around it sit dynamic discovery, the service-connection manager, the
//! event manager, and the communicator for cross-subsystem egress; the
//! [`manager::NodeManager`] assembles them all.

pub mod communicator;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod manager;
pub mod routing;
pub mod sc;
pub mod sc_manager;
pub mod traffic_log;

pub use communicator::{Communicator, DataLink, DefaultDataLink, LinkState};
pub use config::NodeSettings;
pub use error::NodeError;
pub use events::EventManager;
pub use manager::NodeManager;
pub use routing::{ComponentLink, ConnectionEvent, NodeLink, NodeRouter};
pub use sc_manager::{ScManager, ScRouter};

/// How long a dynamically discovered node may stay silent before its
/// connection is retired.
pub const NODE_STALE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// How long a subsystem stays listed after its last cross-subsystem
/// heartbeat.
pub const SUBSYSTEM_STALE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);

/// Default window during which initialization watches for our own address
/// arriving from elsewhere (an address conflict).
pub const CONFLICT_WINDOW_MS: u64 = 1750;
