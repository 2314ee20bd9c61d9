//! The discovery worker: heartbeat emission, connection table sweeps, and
//! connection-event delivery.

use crate::communicator::Communicator;
use crate::routing::{ConnectionEvent, NodeRouter};
use crate::sc_manager::ScManager;
use crate::NODE_STALE_TIMEOUT;
use jaus_transport::udp::{BroadcastClient, MulticastClient};
use jaus_transport::{MessageBox, Registry};
use jaus_wire::codec::build_message_with;
use jaus_wire::messages::ReportHeartbeatPulse;
use jaus_wire::{Address, Header, REASSEMBLY_TIMEOUT};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Tick granularity of the worker loop.
const TICK: Duration = Duration::from_millis(10);
/// Heartbeat pulse period.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
/// Connection table sweep period.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);
/// Window used when probing a component inbox for liveness.
const ACTIVITY_WINDOW: Duration = Duration::from_millis(5);

/// Everything the worker needs besides the router itself.
pub struct DiscoveryConfig {
    /// Heartbeat to `255.255.1.1` instead of `S.255.1.1`.
    pub subsystem_discovery: bool,
    /// Disseminate heartbeats by UDP broadcast instead of multicast.
    pub use_broadcast: bool,
    pub multicast: Option<MulticastClient>,
    pub broadcast: Option<BroadcastClient>,
    /// Registry of local components to watch for arrivals/departures.
    pub component_registry: Option<Registry>,
    /// Registry of other node managers on this host.
    pub node_registry: Option<Registry>,
    pub communicator: Option<Arc<Communicator>>,
    pub sc: Option<Arc<ScManager>>,
}

pub struct DiscoveryWorker {
    quit: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl DiscoveryWorker {
    pub fn spawn(router: Arc<NodeRouter>, config: DiscoveryConfig) -> Self {
        let quit = Arc::new(AtomicBool::new(false));
        let join = {
            let quit = quit.clone();
            std::thread::Builder::new()
                .name("jaus-discovery".into())
                .spawn(move || discovery_loop(router, config, quit))
                .expect("spawning the discovery worker")
        };
        Self { quit, join: Some(join) }
    }

    pub fn stop(&mut self) {
        self.quit.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for DiscoveryWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn discovery_loop(router: Arc<NodeRouter>, config: DiscoveryConfig, quit: Arc<AtomicBool>) {
    // Give the rest of the node a moment to finish wiring up, and stagger
    // our pulse phase so co-started nodes do not beat in lockstep.
    let settle =
        Duration::from_millis(500 + rand::thread_rng().gen_range(0..250));
    std::thread::sleep(settle);

    let mut sequence: u16 = 0;
    let mut last_heartbeat = Instant::now() - HEARTBEAT_INTERVAL;
    let mut last_sweep = Instant::now();
    let mut last_prune = Instant::now();

    info!("discovery worker running for {}", router.id());

    while !quit.load(Ordering::Acquire) {
        let now = Instant::now();

        if now.duration_since(last_heartbeat) >= HEARTBEAT_INTERVAL {
            emit_heartbeat(&router, &config, &mut sequence);
            last_heartbeat = now;
        }

        if now.duration_since(last_sweep) >= SWEEP_INTERVAL {
            sweep_components(&router, &config);
            sweep_nodes(&router, &config);
            last_sweep = now;
        }

        if now.duration_since(last_prune) >= REASSEMBLY_TIMEOUT {
            let dropped = router
                .reassembly
                .lock()
                .prune(router.time.now_instant(), REASSEMBLY_TIMEOUT);
            if dropped > 0 {
                debug!("discarded {dropped} stale fragment sets");
            }
            last_prune = now;
        }

        deliver_events(&router, &config);
        std::thread::sleep(TICK);
    }
}

fn emit_heartbeat(router: &Arc<NodeRouter>, config: &DiscoveryConfig, sequence: &mut u16) {
    let destination = if config.subsystem_discovery {
        Address::new(255, 255, 1, 1)
    } else {
        Address::new(router.id().subsystem, 255, 1, 1)
    };
    let mut header = Header::new(0, router.id(), destination);
    header.sequence_number = *sequence;
    *sequence = sequence.wrapping_add(1);
    let pulse = build_message_with(header, &ReportHeartbeatPulse);

    if config.subsystem_discovery {
        if let Some(communicator) = &config.communicator {
            communicator.transmit(&pulse);
        }
    }
    // The local-segment channels carry the pulse too, unless the
    // communicator's default link is already multicasting it.
    let default_link_covers = config.subsystem_discovery
        && config
            .communicator
            .as_ref()
            .is_some_and(|communicator| communicator.is_default_data_link_selected());
    if !default_link_covers {
        if config.use_broadcast {
            if let Some(broadcast) = &config.broadcast {
                let _ = broadcast.send_stream(&pulse);
            }
        } else if let Some(multicast) = &config.multicast {
            let _ = multicast.send_stream(&pulse);
        }
    }
}

/// Open links to registry components we have not seen, drop links whose
/// inbox went inactive.
fn sweep_components(router: &Arc<NodeRouter>, config: &DiscoveryConfig) {
    let Some(registry) = &config.component_registry else {
        return;
    };

    let registered = registry.list();
    for id in &registered {
        if *id == router.id() || router.have_component_connection(*id) {
            continue;
        }
        match MessageBox::open_inbox(*id) {
            Ok(inbox) => {
                info!("discovered component {id}");
                router.add_component_link(*id, Box::new(inbox));
            }
            Err(_) => {
                // Nobody home: a stale entry from an unclean shutdown.
                registry.unregister(*id);
            }
        }
    }

    for id in router.component_connections() {
        let inactive = {
            let components = router.components.lock();
            match components.get(&id) {
                Some(link) => !link.is_active(ACTIVITY_WINDOW),
                None => false,
            }
        };
        if inactive {
            info!("component {id} went silent");
            router.close_component(id);
            registry.unregister(id);
        }
    }
}

/// Open links to same-host node managers from the node registry; retire
/// dynamically discovered nodes that have gone quiet.
fn sweep_nodes(router: &Arc<NodeRouter>, config: &DiscoveryConfig) {
    if let Some(registry) = &config.node_registry {
        for id in registry.list() {
            if id == router.id() || router.have_node_connection(id) {
                continue;
            }
            if router.open_node_connection(id, true, None).is_err() {
                registry.unregister(id);
            }
        }
    }

    let now = router.time.now_instant();
    let stale: Vec<Address> = {
        let nodes = router.nodes.lock();
        nodes
            .iter()
            .filter(|(_, connection)| {
                connection.discovered
                    && now.duration_since(connection.last_recv) > NODE_STALE_TIMEOUT
            })
            .map(|(id, _)| *id)
            .collect()
    };
    for id in stale {
        info!("node {id} went silent");
        router.close_node(id);
    }
}

/// Fire the connection-event callback exactly once per transition and let
/// the SC manager clean up after departures.
fn deliver_events(router: &Arc<NodeRouter>, config: &DiscoveryConfig) {
    let events: Vec<(ConnectionEvent, Address)> =
        std::mem::take(&mut *router.pending_events.lock());
    if events.is_empty() {
        return;
    }
    let callback = router.event_callback.lock();
    for (event, id) in events {
        if let Some(callback) = callback.as_ref() {
            callback(event, id);
        }
        if let Some(sc) = &config.sc {
            sc.process_connection_event(id, event);
        }
    }
}
