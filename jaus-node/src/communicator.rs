//! Cross-subsystem egress: the communicator and its pluggable data links.
//!
//! A communicator owns a registry of data links keyed by a one-byte id,
//! with exactly one selected at a time. The default link speaks UDP
//! multicast plus per-subsystem unicast learned from observed heartbeats;
//! applications may register links with arbitrary transports or framing.

use crate::error::NodeError;
use jaus_transport::udp::{BroadcastClient, MulticastClient, UdpClient};
use jaus_transport::WIRE_PORT;
use jaus_wire::Stream;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Id the default link registers under.
pub const DEFAULT_DATA_LINK_ID: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Link is down; transmit fails.
    Off,
    /// Link carries traffic.
    On,
    /// Link is maintained but must not transmit; transmit reports success
    /// without sending.
    Standby,
}

/// A transport plugin carrying wrapped messages to other subsystems.
pub trait DataLink: Send + Sync {
    fn id(&self) -> u8;
    fn state(&self) -> LinkState;
    /// Transition to `state`; returning false preserves the old state.
    fn set_state(&self, state: LinkState) -> bool;
    /// Frame and send one serialized message per the state contract.
    fn transmit(&self, stream: &Stream) -> bool;
}

/// Receive-side hand-off from a link back into the node. Provided at
/// construction so the communicator never holds a reference cycle onto
/// routing.
pub type DeliverFn = Box<dyn Fn(Stream) + Send + Sync>;

/// The cross-subsystem egress component.
pub struct Communicator {
    subsystem: u8,
    links: RwLock<BTreeMap<u8, Arc<dyn DataLink>>>,
    selected: RwLock<Option<u8>>,
    deliver: DeliverFn,
}

impl Communicator {
    pub fn new(subsystem: u8, deliver: DeliverFn) -> Self {
        Self {
            subsystem,
            links: RwLock::new(BTreeMap::new()),
            selected: RwLock::new(None),
            deliver,
        }
    }

    pub fn subsystem(&self) -> u8 {
        self.subsystem
    }

    /// Register a link. The first registered link becomes selected.
    pub fn add_data_link(&self, link: Arc<dyn DataLink>) -> Result<(), NodeError> {
        let id = link.id();
        let mut links = self.links.write();
        if links.contains_key(&id) {
            return Err(NodeError::InvalidValue("duplicate data link id"));
        }
        links.insert(id, link);
        let mut selected = self.selected.write();
        if selected.is_none() {
            *selected = Some(id);
        }
        Ok(())
    }

    /// Select `id` as the active link, turning it on and putting the
    /// previously selected link into standby.
    pub fn select_data_link(&self, id: u8) -> bool {
        let links = self.links.read();
        let Some(link) = links.get(&id) else {
            return false;
        };
        if !link.set_state(LinkState::On) {
            return false;
        }
        let mut selected = self.selected.write();
        if let Some(previous) = *selected {
            if previous != id {
                if let Some(previous_link) = links.get(&previous) {
                    if !previous_link.set_state(LinkState::Standby) {
                        warn!("data link {previous} refused standby");
                    }
                }
            }
        }
        *selected = Some(id);
        true
    }

    pub fn selected_data_link(&self) -> Option<u8> {
        *self.selected.read()
    }

    pub fn is_default_data_link_selected(&self) -> bool {
        self.selected_data_link() == Some(DEFAULT_DATA_LINK_ID)
    }

    /// Send through the selected link.
    pub fn transmit(&self, stream: &Stream) -> bool {
        let selected = *self.selected.read();
        let Some(id) = selected else {
            return false;
        };
        let link = self.links.read().get(&id).cloned();
        match link {
            Some(link) => link.transmit(stream),
            None => false,
        }
    }

    /// Called by links when a message arrives from another subsystem.
    pub fn deliver_from_link(&self, stream: Stream) {
        (self.deliver)(stream);
    }

    pub fn data_link_ids(&self) -> Vec<u8> {
        self.links.read().keys().copied().collect()
    }
}

/// The default data link: UDP multicast for discovery reach, plus unicast
/// to each subsystem whose host we have observed.
pub struct DefaultDataLink {
    state: RwLock<LinkState>,
    use_broadcast: AtomicBool,
    multicast: MulticastClient,
    broadcast: BroadcastClient,
    unicast: RwLock<HashMap<u8, UdpClient>>,
}

impl DefaultDataLink {
    pub fn open(group: Ipv4Addr, ttl: u32) -> Result<Self, NodeError> {
        Ok(Self {
            state: RwLock::new(LinkState::On),
            use_broadcast: AtomicBool::new(false),
            multicast: MulticastClient::open(group, WIRE_PORT, ttl)?,
            broadcast: BroadcastClient::open(WIRE_PORT)?,
            unicast: RwLock::new(HashMap::new()),
        })
    }

    /// Prefer UDP broadcast over multicast for dissemination.
    pub fn toggle_broadcast(&self, on: bool) {
        self.use_broadcast.store(on, Ordering::Release);
    }

    /// Record the host carrying `subsystem` so future traffic can go
    /// unicast instead of relying on multicast reach.
    pub fn add_subsystem(&self, subsystem: u8, host: IpAddr) -> Result<(), NodeError> {
        let client = UdpClient::connect(host, WIRE_PORT)?;
        self.unicast.write().insert(subsystem, client);
        Ok(())
    }

    pub fn known_subsystems(&self) -> Vec<u8> {
        self.unicast.read().keys().copied().collect()
    }
}

impl DataLink for DefaultDataLink {
    fn id(&self) -> u8 {
        DEFAULT_DATA_LINK_ID
    }

    fn state(&self) -> LinkState {
        *self.state.read()
    }

    fn set_state(&self, state: LinkState) -> bool {
        *self.state.write() = state;
        true
    }

    fn transmit(&self, stream: &Stream) -> bool {
        match self.state() {
            LinkState::Off => false,
            LinkState::Standby => true,
            LinkState::On => {
                let dissemination = if self.use_broadcast.load(Ordering::Acquire) {
                    self.broadcast.send_stream(stream)
                } else {
                    self.multicast.send_stream(stream)
                };
                if let Err(e) = &dissemination {
                    debug!("default link dissemination failed: {e}");
                }
                for client in self.unicast.read().values() {
                    let _ = client.send_stream(stream);
                }
                dissemination.is_ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FakeLink {
        id: u8,
        state: Mutex<LinkState>,
        sent: Mutex<Vec<Stream>>,
        refuse_state_changes: bool,
    }

    impl FakeLink {
        fn new(id: u8) -> Self {
            Self {
                id,
                state: Mutex::new(LinkState::On),
                sent: Mutex::new(Vec::new()),
                refuse_state_changes: false,
            }
        }
    }

    impl DataLink for FakeLink {
        fn id(&self) -> u8 {
            self.id
        }

        fn state(&self) -> LinkState {
            *self.state.lock()
        }

        fn set_state(&self, state: LinkState) -> bool {
            if self.refuse_state_changes {
                return false;
            }
            *self.state.lock() = state;
            true
        }

        fn transmit(&self, stream: &Stream) -> bool {
            match self.state() {
                LinkState::Off => false,
                LinkState::Standby => true,
                LinkState::On => {
                    self.sent.lock().push(stream.clone());
                    true
                }
            }
        }
    }

    #[test]
    fn selection_moves_previous_link_to_standby() {
        let communicator = Communicator::new(1, Box::new(|_| {}));
        let first = Arc::new(FakeLink::new(1));
        let second = Arc::new(FakeLink::new(2));
        communicator.add_data_link(first.clone()).unwrap();
        communicator.add_data_link(second.clone()).unwrap();
        assert_eq!(communicator.selected_data_link(), Some(1));

        assert!(communicator.select_data_link(2));
        assert_eq!(communicator.selected_data_link(), Some(2));
        assert_eq!(first.state(), LinkState::Standby);

        let stream = Stream::from_bytes(vec![0u8; 16]);
        assert!(communicator.transmit(&stream));
        assert_eq!(second.sent.lock().len(), 1);
        assert!(first.sent.lock().is_empty());
    }

    #[test]
    fn standby_swallows_and_off_refuses() {
        let link = FakeLink::new(9);
        let stream = Stream::from_bytes(vec![0u8; 16]);

        link.set_state(LinkState::Standby);
        assert!(link.transmit(&stream));
        assert!(link.sent.lock().is_empty());

        link.set_state(LinkState::Off);
        assert!(!link.transmit(&stream));
    }

    #[test]
    fn duplicate_link_ids_are_rejected(){
        let communicator = Communicator::new(1, Box::new(|_| {}));
        communicator.add_data_link(Arc::new(FakeLink::new(3))).unwrap();
        assert!(communicator.add_data_link(Arc::new(FakeLink::new(3))).is_err());
    }
}
