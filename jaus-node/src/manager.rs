//! The node manager: top-level assembly of routing, discovery, service
//! connections, events, and the communicator, plus the node-scoped query
//! surface.

use crate::communicator::{Communicator, DefaultDataLink};
use crate::config::{NodeSettings, TransportFlavor};
use crate::discovery::{DiscoveryConfig, DiscoveryWorker};
use crate::error::NodeError;
use crate::events::EventManager;
use crate::routing::{ConnectionEvent, NodeRouter};
use crate::sc_manager::ScManager;
use crate::SUBSYSTEM_STALE_TIMEOUT;
use jaus_component::{MessageHandler, MessageProcessor, StreamSender};
use jaus_transport::serial::SerialConnection;
use jaus_transport::shm::{component_registry_name, node_registry_name};
use jaus_transport::tcp::{TcpClient, TcpServer};
use jaus_transport::udp::{resolve_host, BroadcastClient, MulticastClient, UdpClient, UdpServer};
use jaus_transport::{MessageBox, Registry, TransportKind, WIRE_PORT};
use jaus_wire::codec::{build_message, codes, KnownMessage};
use jaus_wire::messages::{
    Configuration, ConfigurationQueryField, CreateEvent, EventType, Identification,
    IdentificationQueryType, QueryConfiguration, ReportComponentAuthority, ReportComponentStatus,
    ReportConfiguration, ReportEvents, ReportHeartbeatPulse, ReportIdentification,
    ReportServices, ReportSubsystemList, ReportTime, Service,
};
use jaus_wire::{Address, Header, MessageBody, Stream, SystemTimeProvider, TimeProvider};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long a node that rejected an event request is left alone.
const EVENT_REJECT_BACKOFF: Duration = Duration::from_secs(5);
/// Identification the node manager reports for itself.
const NODE_IDENT_TYPE: u16 = 40001;

/// Subsystems recently heard via cross-subsystem heartbeat, with the node
/// that spoke for each.
type SubsystemHeartbeats = HashMap<u8, (Address, Instant)>;

struct NodeState {
    id: Address,
    settings: NodeSettings,
    configuration: Mutex<Configuration>,
    subsystem_heartbeats: Mutex<SubsystemHeartbeats>,
    /// Nodes that rejected event creation; not re-asked until the entry
    /// expires.
    event_rejects: Mutex<HashMap<Address, Instant>>,
    events: EventManager,
    time: Arc<dyn TimeProvider>,
    router: Weak<NodeRouter>,
}

impl NodeState {
    fn send(&self, stream: &Stream) {
        if let Some(router) = self.router.upgrade() {
            let _ = router.send(stream);
        }
    }

    fn reply<T: MessageBody>(&self, to: Address, body: &T) {
        self.send(&build_message(self.id, to, body));
    }

    fn subsystem_list(&self) -> Vec<Address> {
        let mut list: Vec<Address> = self
            .subsystem_heartbeats
            .lock()
            .values()
            .map(|(node, _)| *node)
            .collect();
        if self.settings.subsystem_discovery {
            list.push(self.id);
        }
        list.sort();
        list.dedup();
        list
    }

    fn body_bytes<T: MessageBody>(body: &T) -> Vec<u8> {
        let mut stream = Stream::new();
        body.write_body(&mut stream);
        stream.into_bytes()
    }

    /// Fire node-configuration events at subscribers.
    fn emit_configuration_event(&self) {
        if let Some(router) = self.router.upgrade() {
            let report = ReportConfiguration {
                configuration: self
                    .configuration
                    .lock()
                    .node_view(self.id.subsystem, self.id.node),
            };
            self.events.generate(
                codes::REPORT_CONFIGURATION,
                &Self::body_bytes(&report),
                router.as_ref(),
            );
        }
    }

    fn emit_subsystem_list_event(&self) {
        if let Some(router) = self.router.upgrade() {
            let report = ReportSubsystemList { subsystems: self.subsystem_list() };
            self.events.generate(
                codes::REPORT_SUBSYSTEM_LIST,
                &Self::body_bytes(&report),
                router.as_ref(),
            );
        }
    }

    /// Drop subsystems whose cross-subsystem heartbeat went stale.
    fn sweep_subsystem_list(&self) {
        let now = self.time.now_instant();
        let removed = {
            let mut heartbeats = self.subsystem_heartbeats.lock();
            let before = heartbeats.len();
            heartbeats
                .retain(|_, (_, heard)| now.duration_since(*heard) <= SUBSYSTEM_STALE_TIMEOUT);
            before - heartbeats.len()
        };
        if removed > 0 {
            debug!("{removed} subsystems went stale");
            self.emit_subsystem_list_event();
        }
        self.event_rejects
            .lock()
            .retain(|_, rejected| now.duration_since(*rejected) <= EVENT_REJECT_BACKOFF);
    }

    /// Ask a newly connected peer node for its configuration and subscribe
    /// to changes, unless it recently told us it does not support events.
    fn solicit_peer_configuration(&self, peer: Address) {
        if self.event_rejects.lock().contains_key(&peer) {
            return;
        }
        self.reply(peer, &QueryConfiguration { field: ConfigurationQueryField::Node });
        self.reply(
            peer,
            &CreateEvent {
                event_type: EventType::EveryChange,
                message_code: codes::REPORT_CONFIGURATION,
                requested_rate: 0,
                query: None,
            },
        );
    }
}

struct NodeProcessor {
    state: Arc<NodeState>,
}

impl MessageProcessor for NodeProcessor {
    fn process_query(&self, message: &KnownMessage, header: &Header) {
        let state = &self.state;
        match message {
            KnownMessage::QueryHeartbeatPulse(_) => {
                state.reply(header.source, &ReportHeartbeatPulse);
            }
            KnownMessage::QueryComponentAuthority(_) => {
                state.reply(header.source, &ReportComponentAuthority { authority: 0 });
            }
            KnownMessage::QueryComponentStatus(_) => {
                state.reply(header.source, &ReportComponentStatus::default());
            }
            KnownMessage::QueryTime(_) => {
                state.reply(
                    header.source,
                    &ReportTime { timestamp_ms: state.time.now_system_ms().max(0) as u64 },
                );
            }
            KnownMessage::QueryServices(_) => {
                state.reply(header.source, &ReportServices { services: node_services() });
            }
            KnownMessage::QuerySubsystemList(_) => {
                state.reply(
                    header.source,
                    &ReportSubsystemList { subsystems: state.subsystem_list() },
                );
            }
            KnownMessage::QueryConfiguration(query) => {
                let configuration = {
                    let tree = state.configuration.lock();
                    match query.field {
                        ConfigurationQueryField::Subsystem => {
                            tree.subsystem_view(state.id.subsystem)
                        }
                        ConfigurationQueryField::Node => {
                            tree.node_view(state.id.subsystem, state.id.node)
                        }
                    }
                };
                state.reply(header.source, &ReportConfiguration { configuration });
            }
            KnownMessage::QueryEvents(query) => {
                state.reply(
                    header.source,
                    &ReportEvents { events: state.events.summaries(query.message_code_filter) },
                );
            }
            KnownMessage::QueryIdentification(query) => match query.query_type {
                IdentificationQueryType::Node => {
                    state.reply(
                        header.source,
                        &ReportIdentification {
                            query_type: IdentificationQueryType::Node,
                            identification: Identification {
                                authority: 0,
                                type_code: NODE_IDENT_TYPE,
                                name: "Node Manager".into(),
                            },
                        },
                    );
                }
                IdentificationQueryType::Subsystem => {
                    // Only answer when an identity was configured.
                    if let Some(ident) = &state.settings.subsystem_identification {
                        state.reply(
                            header.source,
                            &ReportIdentification {
                                query_type: IdentificationQueryType::Subsystem,
                                identification: ident.into(),
                            },
                        );
                    }
                }
            },
            _ => {}
        }
    }

    fn process_inform(&self, message: &KnownMessage, header: &Header) {
        let state = &self.state;
        match message {
            KnownMessage::ReportHeartbeatPulse(_) => {
                // Cross-subsystem pulses feed the subsystem list.
                if header.destination == Address::new(255, 255, 1, 1)
                    && header.source.subsystem != state.id.subsystem
                {
                    let now = state.time.now_instant();
                    let is_new = state
                        .subsystem_heartbeats
                        .lock()
                        .insert(header.source.subsystem, (header.source, now))
                        .is_none();
                    if is_new {
                        info!("subsystem {} appeared", header.source.subsystem);
                        state.emit_subsystem_list_event();
                    }
                }
            }
            KnownMessage::ReportConfiguration(report) => {
                state.configuration.lock().merge(&report.configuration);
                state.emit_configuration_event();
            }
            _ => {}
        }
    }

    fn process_command(&self, message: &KnownMessage, header: &Header) {
        let state = &self.state;
        match message {
            KnownMessage::CreateEvent(request) => {
                match state.events.create(request, header.source) {
                    Ok(confirm) => {
                        state.reply(header.source, &confirm);
                        // New subscribers get one event immediately.
                        match request.message_code {
                            codes::REPORT_CONFIGURATION => state.emit_configuration_event(),
                            codes::REPORT_SUBSYSTEM_LIST => state.emit_subsystem_list_event(),
                            _ => {}
                        }
                    }
                    Err(reject) => state.reply(header.source, &reject),
                }
            }
            KnownMessage::CancelEvent(request) => {
                if !state.events.cancel(request, header.source) {
                    debug!("cancel for unknown event {} from {}", request.event_id, header.source);
                }
            }
            KnownMessage::RejectEventRequest(_) => {
                // The peer does not support events; stop asking for a while.
                state
                    .event_rejects
                    .lock()
                    .insert(header.source, state.time.now_instant());
            }
            _ => {}
        }
    }
}

fn node_services() -> Vec<Service> {
    vec![Service {
        service_type: 1,
        inputs: vec![
            codes::QUERY_HEARTBEAT_PULSE,
            codes::QUERY_COMPONENT_AUTHORITY,
            codes::QUERY_COMPONENT_STATUS,
            codes::QUERY_TIME,
            codes::QUERY_CONFIGURATION,
            codes::QUERY_IDENTIFICATION,
            codes::QUERY_SUBSYSTEM_LIST,
            codes::QUERY_SERVICES,
            codes::CREATE_EVENT,
            codes::CANCEL_EVENT,
            codes::QUERY_EVENTS,
        ],
        outputs: vec![
            codes::REPORT_HEARTBEAT_PULSE,
            codes::REPORT_COMPONENT_AUTHORITY,
            codes::REPORT_COMPONENT_STATUS,
            codes::REPORT_TIME,
            codes::REPORT_CONFIGURATION,
            codes::REPORT_IDENTIFICATION,
            codes::REPORT_SUBSYSTEM_LIST,
            codes::REPORT_SERVICES,
            codes::CONFIRM_EVENT_REQUEST,
            codes::REJECT_EVENT_REQUEST,
            codes::REPORT_EVENTS,
            codes::EVENT_NOTIFICATION,
        ],
    }]
}

/// A running node manager daemon.
pub struct NodeManager {
    state: Arc<NodeState>,
    router: Arc<NodeRouter>,
    handler: Arc<MessageHandler>,
    sc: Arc<ScManager>,
    communicator: Arc<Communicator>,
    node_registry: Registry,
    discovery: Option<DiscoveryWorker>,
    _tcp_server: Option<TcpServer>,
    quit: Arc<AtomicBool>,
    drain: Option<JoinHandle<()>>,
    maintenance: Option<JoinHandle<()>>,
}

impl NodeManager {
    pub fn initialize(settings: NodeSettings) -> Result<Self, NodeError> {
        settings.validate()?;
        let id = Address::new(settings.subsystem_id, settings.node_id, 1, 1);
        let time: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
        info!("initializing node manager {id}");

        let handler = Arc::new(MessageHandler::new("node"));
        let router = NodeRouter::new(
            id,
            handler.clone(),
            time.clone(),
            settings.transport == TransportFlavor::Tcp,
        );

        // Inbox first: if another process is already draining our inbox,
        // this address is taken.
        let inbox = Arc::new(MessageBox::create_inbox(id, settings.mbsize)?);
        if inbox.is_active(Duration::from_millis(250)) {
            return Err(NodeError::AddressConflict);
        }

        let node_registry = Registry::open(&node_registry_name(id.subsystem))?;
        node_registry.register(id, true)?;
        let component_registry = Registry::open(&component_registry_name(
            id.subsystem,
            id.node,
        ))?;

        // Wire transports; the router is the receive handler for all of
        // them.
        let group = settings.multicast_group()?;
        let interface = settings
            .net_interface
            .as_deref()
            .map(|nic| {
                nic.parse()
                    .map_err(|_| NodeError::InvalidValue("unparseable net_interface"))
            })
            .transpose()?;
        let udp_server = match UdpServer::bind(WIRE_PORT, Some((group, interface)), router.clone())
        {
            Ok(server) => server,
            Err(_) => {
                // Another node on this host owns the port; we can still
                // send, and same-host traffic rides shared memory.
                warn!("wire port {WIRE_PORT} taken; receiving on an ephemeral port");
                UdpServer::bind_ephemeral(router.clone())?
            }
        };
        router.set_udp_server(udp_server);

        let tcp_server = if settings.transport == TransportFlavor::Tcp {
            Some(TcpServer::bind(WIRE_PORT, router.clone())?)
        } else {
            None
        };

        let communicator = {
            let weak = Arc::downgrade(&router);
            Arc::new(Communicator::new(
                id.subsystem,
                Box::new(move |stream| {
                    if let Some(router) = weak.upgrade() {
                        router.process_stream(stream, None, TransportKind::Communicator);
                    }
                }),
            ))
        };
        communicator.add_data_link(Arc::new(DefaultDataLink::open(group, settings.ttl)?))?;
        router.set_communicator(communicator.clone());

        let sc = ScManager::new(id, router.clone());
        router.set_sc_manager(sc.clone());

        if settings.logdata {
            let path = format!("node_{:03}.{:03}.log", id.subsystem, id.node);
            match crate::traffic_log::TrafficLog::create(Path::new(&path)) {
                Ok(log) => router.set_traffic_log(log),
                Err(e) => warn!("could not open traffic log {path}: {e}"),
            }
        }

        // Static peers are never evicted by the discovery sweeper.
        for peer in &settings.node_connections {
            let peer_id = Address::new(peer.subsystem, peer.node, 1, 1);
            let result = if let Some(serial) = &peer.serial {
                SerialConnection::open(&serial.into(), router.clone())
                    .map(|connection| router.add_node_link(peer_id, Box::new(connection), false))
            } else if let Some(host) = &peer.host {
                let (host, port) = resolve_host(host)?;
                if settings.transport == TransportFlavor::Tcp {
                    TcpClient::connect(host, port)
                        .map(|client| router.add_node_link(peer_id, Box::new(client), false))
                } else {
                    UdpClient::connect(host, port)
                        .map(|client| router.add_node_link(peer_id, Box::new(client), false))
                }
            } else {
                MessageBox::open_inbox(peer_id)
                    .map(|inbox| router.add_node_link(peer_id, Box::new(inbox), false))
            };
            if let Err(e) = result {
                return Err(NodeError::ConnectionFailure(format!(
                    "static connection to {peer_id}: {e}"
                )));
            }
        }

        let state = Arc::new(NodeState {
            id,
            settings: settings.clone(),
            configuration: Mutex::new(Configuration::default()),
            subsystem_heartbeats: Mutex::new(HashMap::new()),
            event_rejects: Mutex::new(HashMap::new()),
            events: EventManager::new(id),
            time: time.clone(),
            router: Arc::downgrade(&router),
        });
        state.configuration.lock().add_component(id);
        if let Some(ident) = &settings.subsystem_identification {
            state
                .configuration
                .lock()
                .identifications
                .insert(id.subsystem, ident.into());
        }
        handler.set_processor(Arc::new(NodeProcessor { state: state.clone() }));

        // Drain the shared-memory inbox into the routing core.
        let quit = Arc::new(AtomicBool::new(false));
        let drain = {
            let inbox = inbox.clone();
            let router = router.clone();
            let quit = quit.clone();
            std::thread::Builder::new()
                .name("jaus-node-inbox".into())
                .spawn(move || {
                    while !quit.load(Ordering::Acquire) {
                        match inbox.dequeue() {
                            Ok(Some(stream)) => {
                                router.process_stream(stream, None, TransportKind::SharedMemory)
                            }
                            _ => std::thread::sleep(Duration::from_micros(500)),
                        }
                    }
                })?
        };

        // Watch for our own address speaking elsewhere before going live.
        router.set_initializing(true);
        std::thread::sleep(Duration::from_millis(settings.conflict_window_ms));
        if router.address_conflict_detected() {
            quit.store(true, Ordering::Release);
            let _ = drain.join();
            sc.shutdown();
            router.clear_sc_manager();
            node_registry.unregister(id);
            return Err(NodeError::AddressConflict);
        }
        router.set_initializing(false);

        // Connection events keep configuration, events, and subscriptions
        // in step with the tables.
        {
            let state = state.clone();
            router.set_connection_event_callback(move |event, peer| {
                match event {
                    ConnectionEvent::ComponentConnect => {
                        state.configuration.lock().add_component(peer);
                        state.emit_configuration_event();
                    }
                    ConnectionEvent::ComponentDisconnect => {
                        state.configuration.lock().remove_component(peer);
                        state.events.cancel_all_for(peer);
                        state.emit_configuration_event();
                    }
                    ConnectionEvent::NodeConnect => {
                        state.configuration.lock().add_component(peer);
                        state.emit_configuration_event();
                        state.solicit_peer_configuration(peer);
                    }
                    ConnectionEvent::NodeDisconnect => {
                        state
                            .configuration
                            .lock()
                            .remove_node(peer.subsystem, peer.node);
                        state.events.cancel_all_for(peer);
                        state.emit_configuration_event();
                    }
                }
            });
        }

        let discovery = DiscoveryWorker::spawn(
            router.clone(),
            DiscoveryConfig {
                subsystem_discovery: settings.subsystem_discovery,
                use_broadcast: false,
                multicast: Some(MulticastClient::open(group, WIRE_PORT, settings.ttl)?),
                broadcast: Some(BroadcastClient::open(WIRE_PORT)?),
                component_registry: Some(component_registry),
                node_registry: Some(Registry::open(&node_registry_name(id.subsystem))?),
                communicator: Some(communicator.clone()),
                sc: Some(sc.clone()),
            },
        );

        // Periodic housekeeping: subsystem-list staleness and the event
        // reject cache.
        let maintenance = {
            let state = state.clone();
            let quit = quit.clone();
            std::thread::Builder::new()
                .name("jaus-node-maintenance".into())
                .spawn(move || {
                    while !quit.load(Ordering::Acquire) {
                        state.sweep_subsystem_list();
                        std::thread::sleep(Duration::from_millis(500));
                    }
                })?
        };

        info!("node manager {id} initialized");
        Ok(Self {
            state,
            router,
            handler,
            sc,
            communicator,
            node_registry,
            discovery: Some(discovery),
            _tcp_server: tcp_server,
            quit,
            drain: Some(drain),
            maintenance: Some(maintenance),
        })
    }

    pub fn id(&self) -> Address {
        self.state.id
    }

    pub fn router(&self) -> &Arc<NodeRouter> {
        &self.router
    }

    pub fn communicator(&self) -> &Arc<Communicator> {
        &self.communicator
    }

    /// Distinct subsystems heard within the staleness window (self
    /// included when subsystem discovery is on).
    pub fn subsystem_list(&self) -> Vec<Address> {
        self.state.subsystem_list()
    }

    pub fn configuration(&self) -> Configuration {
        self.state.configuration.lock().clone()
    }

    /// Route a message originated by the manager itself.
    pub fn send(&self, stream: &Stream) -> Result<(), NodeError> {
        self.router.send(stream)
    }

    pub fn shutdown(&mut self) {
        info!("shutting down node manager {}", self.state.id);
        if let Some(mut discovery) = self.discovery.take() {
            discovery.stop();
        }
        self.quit.store(true, Ordering::Release);
        if let Some(drain) = self.drain.take() {
            let _ = drain.join();
        }
        if let Some(maintenance) = self.maintenance.take() {
            let _ = maintenance.join();
        }
        self.sc.shutdown();
        self.router.clear_sc_manager();
        self.handler.shutdown();
        self.node_registry.unregister(self.state.id);
    }
}

impl Drop for NodeManager {
    fn drop(&mut self) {
        if self.drain.is_some() {
            self.shutdown();
        }
    }
}

impl StreamSender for NodeManager {
    fn send_stream(&self, stream: &Stream) -> Result<(), jaus_component::ComponentError> {
        self.router.send_stream(stream)
    }
}
