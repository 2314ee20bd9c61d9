//! The routing core: every byte entering or leaving the node passes
//! through here.
//!
//! Outgoing dispatch resolves a message's destination to local inboxes,
//! peer-node links, or the communicator, fragmenting oversized payloads.
//! Incoming dispatch suppresses loopback, reassembles fragments, peels off
//! service-connection traffic, and opportunistically opens connections to
//! nodes heard via heartbeat.

use crate::communicator::Communicator;
use crate::error::NodeError;
use crate::sc_manager::ScManager;
use crate::traffic_log::{DropReason, TrafficLog};
use jaus_component::{
    send_and_wait, ComponentError, ErrorHistory, MessageHandler, ReceiptRegistry, SendOptions,
    StreamSender,
};
use jaus_transport::serial::SerialConnection;
use jaus_transport::tcp::TcpClient;
use jaus_transport::udp::{UdpClient, UdpServer};
use jaus_transport::{MessageBox, StreamHandler, TransportError, TransportKind, WIRE_PORT};
use jaus_wire::codec::{codes, is_service_connection_code};
use jaus_wire::{
    large_data, AckNack, Address, DataControl, Header, LargeDataSetMap, Stream, TimeProvider,
    MAX_PACKET_SIZE,
};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Transitions reported through the connection-event callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    ComponentConnect,
    ComponentDisconnect,
    NodeConnect,
    NodeDisconnect,
}

/// Delivery handle for a local component: something that accepts whole
/// messages and can be probed for liveness.
pub trait ComponentLink: Send + Sync {
    fn deliver(&self, stream: &Stream) -> Result<(), TransportError>;
    fn is_active(&self, window: Duration) -> bool;
}

impl ComponentLink for MessageBox {
    fn deliver(&self, stream: &Stream) -> Result<(), TransportError> {
        self.enqueue_stream(stream)
    }

    fn is_active(&self, window: Duration) -> bool {
        MessageBox::is_active(self, window)
    }
}

/// Send handle for a peer node over whichever transport the connection
/// uses.
pub trait NodeLink: Send + Sync {
    fn send_stream(&self, stream: &Stream) -> Result<(), TransportError>;
    fn kind(&self) -> TransportKind;
}

impl NodeLink for UdpClient {
    fn send_stream(&self, stream: &Stream) -> Result<(), TransportError> {
        UdpClient::send_stream(self, stream)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }
}

impl NodeLink for TcpClient {
    fn send_stream(&self, stream: &Stream) -> Result<(), TransportError> {
        TcpClient::send_stream(self, stream)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }
}

impl NodeLink for SerialConnection {
    fn send_stream(&self, stream: &Stream) -> Result<(), TransportError> {
        SerialConnection::send_stream(self, stream)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }
}

impl NodeLink for MessageBox {
    fn send_stream(&self, stream: &Stream) -> Result<(), TransportError> {
        self.enqueue_stream(stream)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::SharedMemory
    }
}

pub(crate) struct NodeConnection {
    pub link: Box<dyn NodeLink>,
    pub last_recv: Instant,
    /// Dynamically discovered connections are evicted after going silent;
    /// statically configured ones are not.
    pub discovered: bool,
}

type ComponentMap = HashMap<Address, Box<dyn ComponentLink>>;
type NodeMap = BTreeMap<Address, NodeConnection>;

/// The node connection handler.
pub struct NodeRouter {
    pub(crate) id: Address,
    // Lock order is nodes before components, always.
    pub(crate) nodes: Mutex<NodeMap>,
    pub(crate) components: Mutex<ComponentMap>,
    pub(crate) reassembly: Mutex<LargeDataSetMap>,
    pub(crate) receipts: Arc<ReceiptRegistry>,
    pub(crate) handler: Arc<MessageHandler>,
    pub(crate) sc: RwLock<Option<Arc<ScManager>>>,
    pub(crate) communicator: RwLock<Option<Arc<Communicator>>>,
    pub(crate) udp_server: RwLock<Option<UdpServer>>,
    pub(crate) initializing: AtomicBool,
    pub(crate) address_conflict: AtomicBool,
    pub(crate) use_tcp: bool,
    pub(crate) time: Arc<dyn TimeProvider>,
    pub(crate) errors: ErrorHistory,
    pub(crate) bad_packets: AtomicU64,
    pub(crate) pending_events: Mutex<Vec<(ConnectionEvent, Address)>>,
    pub(crate) event_callback: Mutex<Option<Box<dyn Fn(ConnectionEvent, Address) + Send>>>,
    pub(crate) traffic_log: RwLock<Option<TrafficLog>>,
}

impl NodeRouter {
    pub fn new(
        id: Address,
        handler: Arc<MessageHandler>,
        time: Arc<dyn TimeProvider>,
        use_tcp: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            nodes: Mutex::new(BTreeMap::new()),
            components: Mutex::new(HashMap::new()),
            reassembly: Mutex::new(LargeDataSetMap::new()),
            receipts: Arc::new(ReceiptRegistry::new()),
            handler,
            sc: RwLock::new(None),
            communicator: RwLock::new(None),
            udp_server: RwLock::new(None),
            initializing: AtomicBool::new(false),
            address_conflict: AtomicBool::new(false),
            use_tcp,
            time,
            errors: ErrorHistory::new(),
            bad_packets: AtomicU64::new(0),
            pending_events: Mutex::new(Vec::new()),
            event_callback: Mutex::new(None),
            traffic_log: RwLock::new(None),
        })
    }

    pub fn id(&self) -> Address {
        self.id
    }

    pub fn receipts(&self) -> &Arc<ReceiptRegistry> {
        &self.receipts
    }

    pub fn message_handler(&self) -> &Arc<MessageHandler> {
        &self.handler
    }

    pub fn error_history(&self) -> &ErrorHistory {
        &self.errors
    }

    pub fn set_sc_manager(&self, sc: Arc<ScManager>) {
        *self.sc.write() = Some(sc);
    }

    /// Break the router <-> SC manager reference cycle at shutdown.
    pub fn clear_sc_manager(&self) {
        *self.sc.write() = None;
    }

    pub fn set_traffic_log(&self, log: TrafficLog) {
        *self.traffic_log.write() = Some(log);
    }

    pub fn set_communicator(&self, communicator: Arc<Communicator>) {
        *self.communicator.write() = Some(communicator);
    }

    pub fn set_udp_server(&self, server: UdpServer) {
        *self.udp_server.write() = Some(server);
    }

    pub fn set_connection_event_callback<F>(&self, callback: F)
    where
        F: Fn(ConnectionEvent, Address) + Send + 'static,
    {
        *self.event_callback.lock() = Some(Box::new(callback));
    }

    /// Gate incoming traffic while initialization watches for a competing
    /// node using our address.
    pub fn set_initializing(&self, initializing: bool) {
        self.initializing.store(initializing, Ordering::Release);
    }

    pub fn address_conflict_detected(&self) -> bool {
        self.address_conflict.load(Ordering::Acquire)
    }

    // -- connection table management --------------------------------------

    pub fn add_component_link(&self, id: Address, link: Box<dyn ComponentLink>) {
        self.components.lock().insert(id, link);
        self.push_event(ConnectionEvent::ComponentConnect, id);
    }

    pub fn add_node_link(&self, id: Address, link: Box<dyn NodeLink>, discovered: bool) {
        self.nodes.lock().insert(
            id,
            NodeConnection { link, last_recv: self.time.now_instant(), discovered },
        );
        self.push_event(ConnectionEvent::NodeConnect, id);
    }

    pub fn have_node_connection(&self, id: Address) -> bool {
        self.nodes.lock().contains_key(&id)
    }

    pub fn have_component_connection(&self, id: Address) -> bool {
        self.components.lock().contains_key(&id)
    }

    pub fn node_connections(&self) -> Vec<Address> {
        self.nodes.lock().keys().copied().collect()
    }

    pub fn component_connections(&self) -> Vec<Address> {
        self.components.lock().keys().copied().collect()
    }

    pub fn close_component(&self, id: Address) {
        if self.components.lock().remove(&id).is_some() {
            self.push_event(ConnectionEvent::ComponentDisconnect, id);
        }
    }

    pub fn close_node(&self, id: Address) {
        if self.nodes.lock().remove(&id).is_some() {
            self.push_event(ConnectionEvent::NodeDisconnect, id);
        }
    }

    /// Open a connection to a peer node manager, preferring the transport
    /// it was heard on: a known UDP host first, shared memory for
    /// same-host peers otherwise.
    pub fn open_node_connection(
        &self,
        id: Address,
        discovered: bool,
        host: Option<std::net::IpAddr>,
    ) -> Result<(), NodeError> {
        if self.have_node_connection(id) {
            return Ok(());
        }
        let host = host.or_else(|| {
            self.udp_server
                .read()
                .as_ref()
                .and_then(|server| server.lookup_host(id))
        });
        let link: Box<dyn NodeLink> = match host {
            Some(host) if self.use_tcp => Box::new(TcpClient::connect(host, WIRE_PORT)?),
            Some(host) => Box::new(UdpClient::connect(host, WIRE_PORT)?),
            None => Box::new(MessageBox::open_inbox(id)?),
        };
        info!("opened connection to node {id}");
        self.add_node_link(id, link, discovered);
        Ok(())
    }

    pub(crate) fn push_event(&self, event: ConnectionEvent, id: Address) {
        self.pending_events.lock().push((event, id));
    }

    pub(crate) fn stamp_node_recv(&self, id: Address) {
        if let Some(connection) = self.nodes.lock().get_mut(&id) {
            connection.last_recv = self.time.now_instant();
        }
    }

    // -- outgoing dispatch -------------------------------------------------

    /// Route a serialized message to its destination(s).
    pub fn send(&self, stream: &Stream) -> Result<(), NodeError> {
        let header = stream.peek_header().map_err(|e| {
            self.bad_packets.fetch_add(1, Ordering::Relaxed);
            NodeError::from(e)
        })?;

        let result = if stream.len() > MAX_PACKET_SIZE {
            self.send_oversized(stream, &header)
        } else {
            let mut nodes = self.nodes.lock();
            let mut components = self.components.lock();
            self.dispatch_locked(&mut nodes, &mut components, stream, &header, true)
        };
        if let Some(log) = &*self.traffic_log.read() {
            log.sent(&header, result.is_ok());
        }
        result
    }

    /// Fragment an oversized message. Local destinations get the whole
    /// blob enqueued directly when possible; shared-memory inboxes accept
    /// full messages.
    fn send_oversized(&self, stream: &Stream, header: &Header) -> Result<(), NodeError> {
        let destination = header.destination;
        if !destination.is_broadcast() && destination.same_node(&self.id) {
            let mut components = self.components.lock();
            if self.deliver_local(&mut components, destination, stream).is_ok() {
                return Ok(());
            }
        }

        let fragments = large_data::split(stream)?;
        let per_fragment_ack =
            header.ack_nack == AckNack::Request && !destination.is_broadcast();
        for fragment in &fragments {
            if per_fragment_ack {
                let receipt = send_and_wait(
                    self,
                    &self.receipts,
                    fragment,
                    SendOptions {
                        response_code: Some(header.command_code),
                        ..SendOptions::default()
                    },
                )
                .map_err(NodeError::from)?;
                if receipt.status != jaus_component::ReceiptStatus::Success {
                    return Err(NodeError::SendFailed);
                }
            } else if self.send(fragment).is_err() {
                // A same-node inbox may simply be briefly full; give the
                // reader a moment and try once more.
                if destination.same_node(&self.id) {
                    std::thread::sleep(Duration::from_millis(50));
                    self.send(fragment)?;
                } else {
                    return Err(NodeError::SendFailed);
                }
            }
        }
        Ok(())
    }

    /// Deliver to a local component, opening the inbox on the fly when the
    /// discovery sweep has not caught up with it yet.
    fn deliver_local(
        &self,
        components: &mut MutexGuard<'_, ComponentMap>,
        destination: Address,
        stream: &Stream,
    ) -> Result<(), NodeError> {
        if let Some(link) = components.get(&destination) {
            return link.deliver(stream).map_err(NodeError::from);
        }
        match MessageBox::open_inbox(destination) {
            Ok(inbox) => {
                debug!("opened inbox to undiscovered component {destination}");
                self.push_event(ConnectionEvent::ComponentConnect, destination);
                let result = inbox.enqueue_stream(stream).map_err(NodeError::from);
                components.insert(destination, Box::new(inbox));
                result
            }
            Err(_) => Err(NodeError::UnknownDestination),
        }
    }

    fn dispatch_locked(
        &self,
        nodes: &mut MutexGuard<'_, NodeMap>,
        components: &mut MutexGuard<'_, ComponentMap>,
        stream: &Stream,
        header: &Header,
        allow_nack: bool,
    ) -> Result<(), NodeError> {
        let destination = header.destination;
        let mut result: Result<(), NodeError> = Err(NodeError::UnknownDestination);

        if destination.is_broadcast() {
            // Forwarding lanes apply only to traffic that did not
            // originate here; local broadcast reaches peers through the
            // discovery channels instead, which keeps broadcast storms
            // from echoing.
            if !header.source.same_node(&self.id) {
                if destination.subsystem == jaus_wire::address::BROADCAST {
                    if let Some(communicator) = &*self.communicator.read() {
                        communicator.transmit(stream);
                    }
                }
                for (peer, connection) in nodes.iter() {
                    let subsystem_match = destination.subsystem
                        == jaus_wire::address::BROADCAST
                        || destination.subsystem == peer.subsystem;
                    let node_match = destination.node == jaus_wire::address::BROADCAST
                        || destination.node == peer.node;
                    if subsystem_match && node_match && !peer.same_node(&header.source) {
                        if let Err(e) = connection.link.send_stream(stream) {
                            debug!("broadcast forward to {peer} failed: {e}");
                        }
                    }
                }
            }

            for (component, link) in components.iter() {
                if destination.destination_match(component) && *component != header.source {
                    if let Err(e) = link.deliver(stream) {
                        debug!("broadcast delivery to {component} failed: {e}");
                    }
                }
            }
            // Broadcasts are best-effort; nobody listening is not an
            // error and never NACKs.
            return Ok(());
        }

        if destination == self.id {
            self.handler.add_to_queue(stream.clone(), *header);
            return Ok(());
        }

        if !destination.same_node(&self.id) {
            // Direct connection first, even cross-subsystem.
            if let Some(connection) = nodes.get(&destination.node_manager()) {
                result = connection.link.send_stream(stream).map_err(NodeError::from);
            } else if destination.subsystem != self.id.subsystem {
                let transmitted = self
                    .communicator
                    .read()
                    .as_ref()
                    .is_some_and(|communicator| communicator.transmit(stream));
                if transmitted {
                    result = Ok(());
                }
            }
        } else {
            result = self.deliver_local(components, destination, stream);
        }

        if result.is_err()
            && allow_nack
            && header.source.same_node(&self.id)
            && header.ack_nack == AckNack::Request
        {
            let mut nack = *header;
            nack.swap_source_destination();
            nack.ack_nack = AckNack::Nack;
            nack.data_control = DataControl::Single;
            nack.data_size = 0;
            let mut packet = Stream::new();
            if packet.write_header(&nack).is_ok() {
                trace!("synthesizing NACK to {} for {destination}", nack.destination);
                let _ = self.dispatch_locked(nodes, components, &packet, &nack, false);
            }
        }

        if let Err(e) = &result {
            self.errors.record(&ComponentError::ConnectionFailure(e.to_string()));
        }
        result
    }

    // -- incoming dispatch -------------------------------------------------

    /// Entry point for every message received over any transport.
    pub fn process_stream(&self, stream: Stream, info: Option<Header>, kind: TransportKind) {
        let header = match info.map_or_else(|| stream.peek_header(), Ok) {
            Ok(header) => header,
            Err(_) => {
                self.bad_packets.fetch_add(1, Ordering::Relaxed);
                debug!("dropping packet with undecodable header");
                if let Some(log) = &*self.traffic_log.read() {
                    log.dropped(None, kind, DropReason::InvalidHeader);
                }
                return;
            }
        };

        // During the startup window the only thing we look for is our own
        // address speaking somewhere else.
        if self.initializing.load(Ordering::Acquire) {
            if header.source == self.id {
                warn!("address conflict: {} heard from another process", self.id);
                self.address_conflict.store(true, Ordering::Release);
                if let Some(log) = &*self.traffic_log.read() {
                    log.dropped(Some(&header), kind, DropReason::AddressConflict);
                }
            }
            return;
        }

        // Loopback suppression: multicast and communicator links echo our
        // own traffic back at us.
        if matches!(kind, TransportKind::Udp | TransportKind::Communicator)
            && header.source.same_node(&self.id)
        {
            trace!("loopback drop of {:#06x}", header.command_code);
            if let Some(log) = &*self.traffic_log.read() {
                log.dropped(Some(&header), kind, DropReason::Loopback);
            }
            return;
        }

        if let Some(log) = &*self.traffic_log.read() {
            log.received(&header, kind);
        }

        if header.destination == self.id || header.destination.destination_match(&self.id) {
            let accepts = {
                let reassembly = self.reassembly.lock();
                reassembly.accepts(&stream, &header)
            };
            if accepts {
                let now = self.time.now_instant();
                let merged = self.reassembly.lock().process(&stream, &header, now);
                match merged {
                    Ok(Some(merged)) => match merged.peek_header() {
                        Ok(merged_header) => {
                            if !self.receipts.check(&merged, &merged_header) {
                                self.handler.add_to_queue(merged, merged_header);
                            }
                        }
                        Err(_) => {
                            self.bad_packets.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    Ok(None) => {}
                    Err(e) => {
                        self.errors
                            .record(&ComponentError::Wire(e));
                    }
                }
            } else if !self.receipts.check(&stream, &header) {
                self.handler.add_to_queue(stream.clone(), header);
            }

            if !header.destination.is_broadcast() {
                return;
            }
        }

        // Service-connection traffic takes the managed path; everything
        // else re-enters routing to move toward its destination.
        let is_sc = header.service_connection || is_service_connection_code(header.command_code);
        if is_sc {
            let sc = self.sc.read().clone();
            match sc {
                Some(sc) => sc.route(stream.clone(), header),
                None => {
                    let _ = self.send(&stream);
                }
            }
        } else {
            let _ = self.send(&stream);
        }

        // A heartbeat from a node we have no connection to is an
        // invitation to open one.
        if header.command_code == codes::REPORT_HEARTBEAT_PULSE
            && matches!(kind, TransportKind::Udp | TransportKind::Communicator)
            && !header.source.same_node(&self.id)
        {
            let peer = header.source.node_manager();
            if !self.have_node_connection(peer) {
                if let Err(e) = self.open_node_connection(peer, true, None) {
                    debug!("could not connect back to {peer}: {e}");
                }
            }
            self.stamp_node_recv(peer);
        }
    }

    pub fn bad_packet_count(&self) -> u64 {
        self.bad_packets.load(Ordering::Relaxed)
    }
}

impl StreamSender for NodeRouter {
    fn send_stream(&self, stream: &Stream) -> Result<(), ComponentError> {
        self.send(stream)
            .map_err(|_| ComponentError::SendFailed)
    }
}

impl StreamHandler for NodeRouter {
    fn on_stream(&self, stream: Stream, header: Option<Header>, kind: TransportKind) {
        self.process_stream(stream, header, kind);
    }
}
