//! Service-connection management: the arbitration layer between providers
//! and their subscribers or commanders.
//!
//! Every SC-related message routing peels off lands in this manager's
//! pipeline; a dedicated worker serializes all state changes. Inform SCs
//! fan provider output out to active subscribers; command SCs admit only
//! the lead commander's messages to the provider.

use crate::routing::{ConnectionEvent, NodeRouter};
use crate::sc::{CommandSc, Commander, InformSc, ScKey};
use jaus_component::{send_and_wait, ReceiptStatus, SendOptions};
use jaus_wire::codec::{
    build_message, codes, is_inform_code, read_presence_vector, KnownMessage,
};
use jaus_wire::messages::{
    ActivateServiceConnection, ConfirmServiceConnection, CreateServiceConnection,
    QueryComponentAuthority, ReportComponentAuthority, ScResponseCode, SuspendServiceConnection,
    TerminateServiceConnection,
};
use jaus_wire::{Address, Header, Stream};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the SC manager needs from routing: forwarding and blocking
/// authority queries. Split out so the state machines are testable without
/// a live node.
pub trait ScRouter: Send + Sync {
    /// Send a serialized message through routing. Returns false when no
    /// route accepted it.
    fn forward(&self, stream: &Stream) -> bool;
    /// Ask a component for its authority code, blocking briefly.
    fn query_authority(&self, of: Address) -> Option<u8>;
}

impl ScRouter for NodeRouter {
    fn forward(&self, stream: &Stream) -> bool {
        self.send(stream).is_ok()
    }

    fn query_authority(&self, of: Address) -> Option<u8> {
        let query = build_message(self.id(), of, &QueryComponentAuthority);
        let receipt = send_and_wait(
            self,
            self.receipts(),
            &query,
            SendOptions {
                response_code: Some(codes::REPORT_COMPONENT_AUTHORITY),
                ..SendOptions::default()
            },
        )
        .ok()?;
        if receipt.status != ReceiptStatus::Success {
            return None;
        }
        let response = receipt.response?;
        let header = response.peek_header().ok()?;
        match KnownMessage::decode(&header, &response).ok()? {
            Some(KnownMessage::ReportComponentAuthority(ReportComponentAuthority {
                authority,
            })) => Some(authority),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Tables {
    inform: BTreeMap<ScKey, InformSc>,
    command: BTreeMap<ScKey, CommandSc>,
}

struct ScShared {
    node_id: Address,
    router: Arc<dyn ScRouter>,
    tables: Mutex<Tables>,
    pipeline: Mutex<VecDeque<(Stream, Header)>>,
    quit: AtomicBool,
}

/// The service-connection manager and its worker thread.
pub struct ScManager {
    shared: Arc<ScShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ScManager {
    pub fn new(node_id: Address, router: Arc<dyn ScRouter>) -> Arc<Self> {
        let shared = Arc::new(ScShared {
            node_id,
            router,
            tables: Mutex::new(Tables::default()),
            pipeline: Mutex::new(VecDeque::new()),
            quit: AtomicBool::new(false),
        });
        let worker = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("jaus-sc".into())
                .spawn(move || worker_loop(shared))
                .expect("spawning the SC worker")
        };
        Arc::new(Self { shared, worker: Mutex::new(Some(worker)) })
    }

    /// Queue an SC message for the worker.
    pub fn route(&self, stream: Stream, header: Header) {
        self.shared.pipeline.lock().push_back((stream, header));
    }

    /// Process one SC message synchronously. The worker uses this; tests
    /// drive it directly for determinism.
    pub fn process_message(&self, stream: &Stream, header: &Header) {
        process(&self.shared, stream, header);
    }

    /// Number of inform/command SCs currently tracked.
    pub fn connection_counts(&self) -> (usize, usize) {
        let tables = self.shared.tables.lock();
        (tables.inform.len(), tables.command.len())
    }

    /// React to a component or node going away: tear down SCs it provided
    /// and drop it from every subscriber/commander set.
    pub fn process_connection_event(&self, id: Address, event: ConnectionEvent) {
        if !matches!(
            event,
            ConnectionEvent::ComponentDisconnect | ConnectionEvent::NodeDisconnect
        ) {
            return;
        }
        let node_scope = event == ConnectionEvent::NodeDisconnect;
        let gone = |candidate: &Address| {
            if node_scope {
                candidate.same_node(&id)
            } else {
                *candidate == id
            }
        };

        let shared = &self.shared;
        let mut tables = shared.tables.lock();

        tables.inform.retain(|key, sc| {
            if gone(&key.provider) {
                for subscriber in sc.active.iter().chain(&sc.suspended).chain(&sc.pending) {
                    send_terminate(shared, *subscriber, key.message_code, sc.instance_id);
                }
                return false;
            }
            let before = sc.subscriber_count() + sc.pending.len();
            sc.active.retain(|s| !gone(s));
            sc.suspended.retain(|s| !gone(s));
            sc.pending.retain(|s| !gone(s));
            if before > 0 && sc.is_empty() {
                send_terminate(shared, key.provider, key.message_code, sc.instance_id);
                return false;
            }
            true
        });

        tables.command.retain(|key, sc| {
            if gone(&key.provider) {
                for commander in sc
                    .active
                    .keys()
                    .chain(sc.suspended.keys())
                    .chain(sc.pending.keys())
                {
                    send_terminate(shared, *commander, key.message_code, sc.instance_id);
                }
                return false;
            }
            let previous = sc.lead;
            sc.active.retain(|c, _| !gone(c));
            sc.suspended.retain(|c, _| !gone(c));
            sc.pending.retain(|c, _| !gone(c));
            sc.lead = sc.elect_lead();
            announce_lead_change(shared, key, sc, previous);
            if sc.commander_count() == 0 {
                send_terminate(shared, key.provider, key.message_code, sc.instance_id);
                return false;
            }
            true
        });
    }

    /// Terminate every managed SC and stop the worker.
    pub fn shutdown(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }

        let shared = &self.shared;
        let mut tables = shared.tables.lock();
        for (key, sc) in tables.inform.iter() {
            send_terminate(shared, key.provider, key.message_code, sc.instance_id);
            for subscriber in sc.active.iter().chain(&sc.suspended).chain(&sc.pending) {
                send_terminate(shared, *subscriber, key.message_code, sc.instance_id);
            }
        }
        for (key, sc) in tables.command.iter() {
            send_terminate(shared, key.provider, key.message_code, sc.instance_id);
            for commander in sc
                .active
                .keys()
                .chain(sc.suspended.keys())
                .chain(sc.pending.keys())
            {
                send_terminate(shared, *commander, key.message_code, sc.instance_id);
            }
        }
        tables.inform.clear();
        tables.command.clear();
        info!("service connection manager stopped");
    }
}

impl Drop for ScManager {
    fn drop(&mut self) {
        if self.worker.lock().is_some() {
            self.shutdown();
        }
    }
}

fn worker_loop(shared: Arc<ScShared>) {
    while !shared.quit.load(Ordering::Acquire) {
        let next = shared.pipeline.lock().pop_front();
        match next {
            Some((stream, header)) => process(&shared, &stream, &header),
            None => std::thread::sleep(Duration::from_micros(500)),
        }
    }
}

fn decode_body<T: jaus_wire::MessageBody>(stream: &Stream) -> Option<T> {
    let mut body = stream.clone();
    body.seek_body();
    T::read_body(&mut body).ok()
}

fn process(shared: &Arc<ScShared>, stream: &Stream, header: &Header) {
    match header.command_code {
        codes::CREATE_SERVICE_CONNECTION => {
            if header.destination.same_node(&shared.node_id) {
                if let Some(command) = decode_body::<CreateServiceConnection>(stream) {
                    if is_inform_code(command.message_code) {
                        create_inform(shared, stream, header, &command);
                    } else {
                        create_command(shared, stream, header, &command);
                    }
                }
            } else {
                shared.router.forward(stream);
            }
        }
        codes::CONFIRM_SERVICE_CONNECTION => {
            if header.source.same_node(&shared.node_id) {
                if let Some(command) = decode_body::<ConfirmServiceConnection>(stream) {
                    if is_inform_code(command.message_code) {
                        confirm_inform(shared, stream, header, &command);
                    } else {
                        confirm_command(shared, stream, header, &command);
                    }
                }
            } else {
                shared.router.forward(stream);
            }
        }
        codes::TERMINATE_SERVICE_CONNECTION => {
            if header.destination.same_node(&shared.node_id) {
                if let Some(command) = decode_body::<TerminateServiceConnection>(stream) {
                    if is_inform_code(command.message_code) {
                        terminate_inform(shared, header, &command);
                    } else {
                        terminate_command(shared, header, &command);
                    }
                }
            } else {
                shared.router.forward(stream);
            }
        }
        codes::SUSPEND_SERVICE_CONNECTION => {
            if header.destination.same_node(&shared.node_id) {
                if let Some(command) = decode_body::<SuspendServiceConnection>(stream) {
                    if is_inform_code(command.message_code) {
                        suspend_inform(shared, header, &command);
                    } else {
                        suspend_command(shared, header, &command);
                    }
                }
            } else {
                shared.router.forward(stream);
            }
        }
        codes::ACTIVATE_SERVICE_CONNECTION => {
            if header.destination.same_node(&shared.node_id) {
                if let Some(command) = decode_body::<ActivateServiceConnection>(stream) {
                    if is_inform_code(command.message_code) {
                        activate_inform(shared, header, &command);
                    } else {
                        activate_command(shared, header, &command);
                    }
                }
            } else {
                shared.router.forward(stream);
            }
        }
        // SC-flagged data traffic.
        code if is_inform_code(code) => route_inform_data(shared, stream, header),
        _ => route_command_data(shared, stream, header),
    }
}

fn send_terminate(shared: &ScShared, to: Address, message_code: u16, instance_id: u8) {
    let terminate = build_message(
        shared.node_id,
        to,
        &TerminateServiceConnection { message_code, instance_id },
    );
    shared.router.forward(&terminate);
}

fn send_confirm(
    shared: &ScShared,
    provider: Address,
    to: Address,
    message_code: u16,
    instance_id: u8,
    rate: u16,
    response: ScResponseCode,
) {
    let confirm = build_message(
        provider,
        to,
        &ConfirmServiceConnection { message_code, instance_id, confirmed_rate: rate, response },
    );
    shared.router.forward(&confirm);
}

/// After any change to a command SC's active set, re-elect the lead and
/// tell the affected commanders.
fn announce_lead_change(
    shared: &ScShared,
    key: &ScKey,
    sc: &mut CommandSc,
    previous: Option<Commander>,
) {
    sc.lead = sc.elect_lead();
    if sc.lead.map(|c| c.id) == previous.map(|c| c.id) {
        return;
    }
    if let Some(previous) = previous {
        if sc.active.contains_key(&previous.id) || sc.suspended.contains_key(&previous.id) {
            let suspend = build_message(
                shared.node_id,
                previous.id,
                &SuspendServiceConnection {
                    message_code: key.message_code,
                    instance_id: sc.instance_id,
                },
            );
            shared.router.forward(&suspend);
        }
    }
    if let Some(lead) = sc.lead {
        let activate = build_message(
            shared.node_id,
            lead.id,
            &ActivateServiceConnection {
                message_code: key.message_code,
                instance_id: sc.instance_id,
            },
        );
        shared.router.forward(&activate);
        debug!("lead commander for {:#06x} is now {}", key.message_code, lead.id);
    }
}

fn create_inform(
    shared: &Arc<ScShared>,
    stream: &Stream,
    header: &Header,
    command: &CreateServiceConnection,
) {
    let key = ScKey {
        provider: header.destination,
        message_code: command.message_code,
        presence_vector: command.presence_vector,
    };
    let mut tables = shared.tables.lock();
    match tables.inform.get_mut(&key) {
        None => {
            shared.router.forward(stream);
            let mut sc = InformSc::default();
            sc.add_pending(header.source);
            tables.inform.insert(key, sc);
        }
        Some(sc) => {
            sc.add_pending(header.source);
            if command.periodic_rate > sc.rate {
                // A faster rate than confirmed needs the provider's say.
                shared.router.forward(stream);
            } else {
                let (instance_id, rate) = (sc.instance_id, sc.rate);
                sc.activate(header.source);
                send_confirm(
                    shared,
                    header.destination,
                    header.source,
                    command.message_code,
                    instance_id,
                    rate,
                    ScResponseCode::CreatedSuccessfully,
                );
            }
        }
    }
}

fn create_command(
    shared: &Arc<ScShared>,
    stream: &Stream,
    header: &Header,
    command: &CreateServiceConnection,
) {
    let key = ScKey {
        provider: header.destination,
        message_code: command.message_code,
        presence_vector: command.presence_vector,
    };
    // Both authorities are needed before a commander may be admitted.
    let Some(commander_authority) = shared.router.query_authority(header.source) else {
        warn!("authority query to {} failed; dropping create", header.source);
        return;
    };
    let Some(provider_authority) = shared.router.query_authority(header.destination) else {
        warn!("authority query to {} failed; dropping create", header.destination);
        return;
    };

    if commander_authority < provider_authority {
        send_confirm(
            shared,
            header.destination,
            header.source,
            command.message_code,
            0,
            0,
            ScResponseCode::Refused,
        );
        return;
    }

    let mut tables = shared.tables.lock();
    match tables.command.get_mut(&key) {
        None => {
            let mut sc = CommandSc { provider_authority, ..CommandSc::default() };
            sc.add_pending(Commander { id: header.source, authority: commander_authority });
            tables.command.insert(key, sc);
            shared.router.forward(stream);
        }
        Some(sc) => {
            sc.provider_authority = provider_authority;
            sc.add_pending(Commander { id: header.source, authority: commander_authority });
            if command.periodic_rate > sc.rate {
                shared.router.forward(stream);
            } else {
                let (instance_id, rate) = (sc.instance_id, sc.rate);
                let previous = sc.lead;
                sc.activate(header.source);
                send_confirm(
                    shared,
                    header.destination,
                    header.source,
                    command.message_code,
                    instance_id,
                    rate,
                    ScResponseCode::CreatedSuccessfully,
                );
                announce_lead_change(shared, &key, sc, previous);
            }
        }
    }
}

fn confirm_inform(
    shared: &Arc<ScShared>,
    stream: &Stream,
    header: &Header,
    command: &ConfirmServiceConnection,
) {
    // The subscriber needs the provider's confirmation regardless of our
    // bookkeeping.
    shared.router.forward(stream);

    let mut tables = shared.tables.lock();
    let mut drop_key = None;
    for (key, sc) in tables.inform.iter_mut() {
        if key.provider != header.source
            || key.message_code != command.message_code
            || !sc.is_pending(header.destination)
        {
            continue;
        }
        if command.response == ScResponseCode::CreatedSuccessfully {
            sc.instance_id = command.instance_id;
            if command.confirmed_rate > sc.rate {
                sc.rate = command.confirmed_rate;
            }
            let was_suspended = sc.is_service_suspended();
            sc.activate(header.destination);
            if was_suspended && !sc.is_service_suspended() {
                let activate = build_message(
                    shared.node_id,
                    key.provider,
                    &ActivateServiceConnection {
                        message_code: key.message_code,
                        instance_id: sc.instance_id,
                    },
                );
                shared.router.forward(&activate);
            }
        } else {
            sc.remove(header.destination);
            if sc.is_empty() {
                drop_key = Some(*key);
            }
        }
        break;
    }
    if let Some(key) = drop_key {
        tables.inform.remove(&key);
    }
}

fn confirm_command(
    shared: &Arc<ScShared>,
    stream: &Stream,
    header: &Header,
    command: &ConfirmServiceConnection,
) {
    shared.router.forward(stream);

    let mut tables = shared.tables.lock();
    let mut drop_key = None;
    for (key, sc) in tables.command.iter_mut() {
        if key.provider != header.source
            || key.message_code != command.message_code
            || !sc.is_pending(header.destination)
        {
            continue;
        }
        if command.response == ScResponseCode::CreatedSuccessfully {
            sc.instance_id = command.instance_id;
            if command.confirmed_rate > sc.rate {
                sc.rate = command.confirmed_rate;
            }
            let previous = sc.lead;
            sc.activate(header.destination);
            announce_lead_change(shared, key, sc, previous);
        } else {
            sc.remove(header.destination);
            if sc.commander_count() == 0 {
                drop_key = Some(*key);
            }
        }
        break;
    }
    if let Some(key) = drop_key {
        tables.command.remove(&key);
    }
}

fn terminate_inform(
    shared: &Arc<ScShared>,
    header: &Header,
    command: &TerminateServiceConnection,
) {
    let mut tables = shared.tables.lock();
    let mut drop_key = None;
    for (key, sc) in tables.inform.iter_mut() {
        if key.provider != header.destination
            || key.message_code != command.message_code
            || sc.instance_id != command.instance_id
            || !(sc.is_subscriber(header.source) || sc.is_pending(header.source))
        {
            continue;
        }
        sc.remove(header.source);
        if sc.is_empty() {
            send_terminate(shared, key.provider, key.message_code, sc.instance_id);
            drop_key = Some(*key);
        }
        break;
    }
    if let Some(key) = drop_key {
        tables.inform.remove(&key);
    }
}

fn terminate_command(
    shared: &Arc<ScShared>,
    header: &Header,
    command: &TerminateServiceConnection,
) {
    let mut tables = shared.tables.lock();
    let mut drop_key = None;
    for (key, sc) in tables.command.iter_mut() {
        if key.provider != header.destination
            || key.message_code != command.message_code
            || sc.instance_id != command.instance_id
            || !(sc.is_commander(header.source) || sc.is_pending(header.source))
        {
            continue;
        }
        let previous = sc.lead;
        sc.remove(header.source);
        announce_lead_change(shared, key, sc, previous);
        if sc.commander_count() == 0 {
            send_terminate(shared, key.provider, key.message_code, sc.instance_id);
            drop_key = Some(*key);
        }
        break;
    }
    if let Some(key) = drop_key {
        tables.command.remove(&key);
    }
}

fn suspend_inform(shared: &Arc<ScShared>, header: &Header, command: &SuspendServiceConnection) {
    let mut tables = shared.tables.lock();
    for (key, sc) in tables.inform.iter_mut() {
        if key.provider != header.destination
            || key.message_code != command.message_code
            || sc.instance_id != command.instance_id
            || !sc.is_subscriber(header.source)
        {
            continue;
        }
        sc.suspend(header.source);
        if sc.is_service_suspended() {
            let suspend = build_message(
                shared.node_id,
                key.provider,
                &SuspendServiceConnection {
                    message_code: key.message_code,
                    instance_id: sc.instance_id,
                },
            );
            shared.router.forward(&suspend);
        }
        break;
    }
}

fn suspend_command(shared: &Arc<ScShared>, header: &Header, command: &SuspendServiceConnection) {
    let mut tables = shared.tables.lock();
    for (key, sc) in tables.command.iter_mut() {
        if key.provider != header.destination
            || key.message_code != command.message_code
            || sc.instance_id != command.instance_id
            || !sc.is_commander(header.source)
        {
            continue;
        }
        let previous = sc.lead;
        sc.suspend(header.source);
        announce_lead_change(shared, key, sc, previous);
        if sc.lead.is_none() {
            let suspend = build_message(
                shared.node_id,
                key.provider,
                &SuspendServiceConnection {
                    message_code: key.message_code,
                    instance_id: sc.instance_id,
                },
            );
            shared.router.forward(&suspend);
        }
        break;
    }
}

fn activate_inform(shared: &Arc<ScShared>, header: &Header, command: &ActivateServiceConnection) {
    let mut tables = shared.tables.lock();
    for (key, sc) in tables.inform.iter_mut() {
        if key.provider != header.destination
            || key.message_code != command.message_code
            || sc.instance_id != command.instance_id
            || !sc.is_subscriber(header.source)
        {
            continue;
        }
        let was_suspended = sc.is_service_suspended();
        sc.activate(header.source);
        if was_suspended && !sc.is_service_suspended() {
            let activate = build_message(
                shared.node_id,
                key.provider,
                &ActivateServiceConnection {
                    message_code: key.message_code,
                    instance_id: sc.instance_id,
                },
            );
            shared.router.forward(&activate);
        }
        break;
    }
}

fn activate_command(
    shared: &Arc<ScShared>,
    header: &Header,
    command: &ActivateServiceConnection,
) {
    let mut tables = shared.tables.lock();
    for (key, sc) in tables.command.iter_mut() {
        if key.provider != header.destination
            || key.message_code != command.message_code
            || sc.instance_id != command.instance_id
            || !sc.is_commander(header.source)
        {
            continue;
        }
        let previous = sc.lead;
        sc.activate(header.source);
        announce_lead_change(shared, key, sc, previous);
        if previous.is_none() {
            // The SC was fully suspended; let the provider know it is
            // live again.
            let activate = build_message(
                shared.node_id,
                key.provider,
                &ActivateServiceConnection {
                    message_code: key.message_code,
                    instance_id: sc.instance_id,
                },
            );
            shared.router.forward(&activate);
        }
        break;
    }
}

/// Provider-generated SC data: fan out to every active subscriber,
/// dropping subscribers whose delivery fails.
fn route_inform_data(shared: &Arc<ScShared>, stream: &Stream, header: &Header) {
    let key = ScKey {
        provider: header.source,
        message_code: header.command_code,
        presence_vector: read_presence_vector(stream),
    };
    let mut tables = shared.tables.lock();
    let Some(sc) = tables.inform.get_mut(&key) else {
        // No managed SC: block the message.
        return;
    };

    let mut failed = Vec::new();
    for subscriber in sc.active.iter() {
        let mut copy = stream.clone();
        let mut rewritten = *header;
        rewritten.destination = *subscriber;
        if copy.write_header(&rewritten).is_err() || !shared.router.forward(&copy) {
            failed.push(*subscriber);
        }
    }
    for subscriber in failed {
        sc.remove(subscriber);
    }

    if sc.subscriber_count() == 0 && sc.pending.is_empty() {
        send_terminate(shared, key.provider, key.message_code, sc.instance_id);
        tables.inform.remove(&key);
    }
}

/// Commander-generated SC data: only the lead commander's traffic reaches
/// the provider; everything else is dropped silently.
fn route_command_data(shared: &Arc<ScShared>, stream: &Stream, header: &Header) {
    let key = ScKey {
        provider: header.destination,
        message_code: header.command_code,
        presence_vector: read_presence_vector(stream),
    };
    let tables = shared.tables.lock();
    if let Some(sc) = tables.command.get(&key) {
        if sc.lead.map(|lead| lead.id) == Some(header.source) {
            shared.router.forward(stream);
        }
    }
}
