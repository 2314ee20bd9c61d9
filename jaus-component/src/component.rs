//! The component runtime: a process endpoint with a full address.
//!
//! A component reads its own shared-memory inbox and writes everything it
//! sends into the local node manager's inbox; it never talks to another
//! component directly. Initialization detects address conflicts by probing
//! whether anyone else is already draining the inbox.

use crate::error::{ComponentError, ErrorHistory};
use crate::message_handler::MessageHandler;
use crate::receipt::{send_and_wait, Receipt, ReceiptRegistry, SendOptions};
use crate::StreamSender;
use jaus_transport::shm::component_registry_name;
use jaus_transport::{MessageBox, Registry, COMPONENT_INBOX_SIZE};
use jaus_wire::codec::{build_message, codes};
use jaus_wire::messages::{
    ComponentStatus, ReportComponentAuthority, ReportComponentStatus, ReportHeartbeatPulse,
};
use jaus_wire::{
    AckNack, Address, DataControl, LargeDataSetMap, MessageBody, Stream, REASSEMBLY_TIMEOUT,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long initialization watches the inbox for a competing reader.
const CONFLICT_PROBE: Duration = Duration::from_millis(250);
/// Sleep between inbox polls; each poll also advances the activity counter
/// liveness probes watch.
const DRAIN_POLL: Duration = Duration::from_millis(1);

/// Outbox into the node manager, reopenable when the node restarts.
struct Outbox {
    node: Address,
    slot: Mutex<Option<MessageBox>>,
}

impl Outbox {
    fn open(node: Address) -> Result<Self, ComponentError> {
        let inbox = MessageBox::open_inbox(node)
            .map_err(|_| ComponentError::ConnectionFailure(format!("no node manager at {node}")))?;
        Ok(Self { node, slot: Mutex::new(Some(inbox)) })
    }
}

impl StreamSender for Outbox {
    fn send_stream(&self, stream: &Stream) -> Result<(), ComponentError> {
        let mut slot = self.slot.lock();
        if let Some(outbox) = slot.as_ref() {
            if outbox.enqueue_stream(stream).is_ok() {
                return Ok(());
            }
        }
        // The node may have restarted under us; reopen once and retry.
        debug!("reopening outbox to {}", self.node);
        match MessageBox::open_inbox(self.node) {
            Ok(outbox) => {
                let result = outbox.enqueue_stream(stream);
                *slot = Some(outbox);
                result.map_err(ComponentError::from)
            }
            Err(_) => {
                *slot = None;
                Err(ComponentError::SendFailed)
            }
        }
    }
}

/// A live component endpoint.
pub struct Component {
    id: Address,
    authority: u8,
    outbox: Arc<Outbox>,
    registry: Registry,
    receipts: Arc<ReceiptRegistry>,
    handler: Arc<MessageHandler>,
    errors: Arc<ErrorHistory>,
    block_ack_nack: Arc<AtomicBool>,
    quit: Arc<AtomicBool>,
    drain: Option<JoinHandle<()>>,
}

impl Component {
    /// Bring a component up at `id` with the default inbox size.
    pub fn initialize(id: Address, authority: u8) -> Result<Self, ComponentError> {
        Self::initialize_with_inbox(id, authority, COMPONENT_INBOX_SIZE)
    }

    pub fn initialize_with_inbox(
        id: Address,
        authority: u8,
        inbox_size: usize,
    ) -> Result<Self, ComponentError> {
        if !id.is_valid() || id.is_broadcast() {
            return Err(ComponentError::InvalidAddress);
        }

        let inbox = Arc::new(MessageBox::create_inbox(id, inbox_size)?);
        // If another process is draining this inbox, its activity counter
        // moves during the probe window and we must not take the address.
        if inbox.is_active(CONFLICT_PROBE) {
            return Err(ComponentError::AddressConflict);
        }

        let registry = Registry::open(&component_registry_name(id.subsystem, id.node))?;
        // The probe above proved any previous owner dead, so a leftover
        // registry entry is stale and may be reclaimed.
        registry.register(id, true)?;

        let outbox = Arc::new(Outbox::open(id.node_manager())?);
        let receipts = Arc::new(ReceiptRegistry::new());
        let handler = Arc::new(MessageHandler::new(&id.to_string()));
        let errors = Arc::new(ErrorHistory::new());
        let block_ack_nack = Arc::new(AtomicBool::new(false));
        let quit = Arc::new(AtomicBool::new(false));

        let drain = {
            let inbox = inbox.clone();
            let outbox = outbox.clone();
            let receipts = receipts.clone();
            let handler = handler.clone();
            let errors = errors.clone();
            let block_ack_nack = block_ack_nack.clone();
            let quit = quit.clone();
            std::thread::Builder::new()
                .name(format!("jaus-inbox-{id}"))
                .spawn(move || {
                    drain_loop(
                        id,
                        authority,
                        inbox,
                        outbox,
                        receipts,
                        handler,
                        errors,
                        block_ack_nack,
                        quit,
                    )
                })
                .map_err(|e| ComponentError::ConnectionFailure(e.to_string()))?
        };

        info!("component {id} initialized");
        Ok(Self {
            id,
            authority,
            outbox,
            registry,
            receipts,
            handler,
            errors,
            block_ack_nack,
            quit,
            drain: Some(drain),
        })
    }

    pub fn id(&self) -> Address {
        self.id
    }

    pub fn authority(&self) -> u8 {
        self.authority
    }

    pub fn message_handler(&self) -> &MessageHandler {
        &self.handler
    }

    pub fn error_history(&self) -> &ErrorHistory {
        &self.errors
    }

    /// Suppress automatic Ack replies to messages requesting them.
    pub fn block_ack_nack(&self, block: bool) {
        self.block_ack_nack.store(block, Ordering::Release);
    }

    /// Enqueue a serialized message to the node manager for routing.
    pub fn send_stream(&self, stream: &Stream) -> Result<(), ComponentError> {
        let result = self.outbox.send_stream(stream);
        if let Err(e) = &result {
            self.errors.record(e);
        }
        result
    }

    /// Serialize and send a catalog message.
    pub fn send<T: MessageBody>(&self, destination: Address, body: &T) -> Result<(), ComponentError> {
        self.send_stream(&build_message(self.id, destination, body))
    }

    /// Blocking send: transmit and wait for the matching response or
    /// acknowledgement, retransmitting per `options`.
    pub fn send_and_wait(
        &self,
        stream: &Stream,
        options: SendOptions,
    ) -> Result<Receipt, ComponentError> {
        let result = send_and_wait(self.outbox.as_ref(), &self.receipts, stream, options);
        if let Err(e) = &result {
            self.errors.record(e);
        }
        result
    }

    /// Blocking send of a catalog message with default options.
    pub fn query<T: MessageBody>(
        &self,
        destination: Address,
        body: &T,
    ) -> Result<Receipt, ComponentError> {
        self.send_and_wait(&build_message(self.id, destination, body), SendOptions::default())
    }

    pub fn shutdown(&mut self) {
        self.quit.store(true, Ordering::Release);
        if let Some(drain) = self.drain.take() {
            let _ = drain.join();
        }
        self.receipts.cancel_all();
        self.handler.shutdown();
        self.registry.unregister(self.id);
        info!("component {} shut down", self.id);
    }
}

impl Drop for Component {
    fn drop(&mut self) {
        if self.drain.is_some() {
            self.shutdown();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn drain_loop(
    id: Address,
    authority: u8,
    inbox: Arc<MessageBox>,
    outbox: Arc<Outbox>,
    receipts: Arc<ReceiptRegistry>,
    handler: Arc<MessageHandler>,
    errors: Arc<ErrorHistory>,
    block_ack_nack: Arc<AtomicBool>,
    quit: Arc<AtomicBool>,
) {
    let mut reassembly = LargeDataSetMap::new();
    let mut last_prune = std::time::Instant::now();

    while !quit.load(Ordering::Acquire) {
        let now = std::time::Instant::now();
        if now.duration_since(last_prune) >= REASSEMBLY_TIMEOUT {
            reassembly.prune(now, REASSEMBLY_TIMEOUT);
            last_prune = now;
        }

        let stream = match inbox.dequeue() {
            Ok(Some(stream)) => stream,
            Ok(None) => {
                std::thread::sleep(DRAIN_POLL);
                continue;
            }
            Err(e) => {
                errors.record(&e.into());
                std::thread::sleep(DRAIN_POLL);
                continue;
            }
        };
        let mut stream = stream;
        let mut header = match stream.peek_header() {
            Ok(header) => header,
            Err(e) => {
                errors.record(&e.into());
                continue;
            }
        };

        // Fragments are collected until their set completes; the merged
        // message then flows on like any single-packet arrival.
        if reassembly.accepts(&stream, &header) {
            match reassembly.process(&stream, &header, now) {
                Ok(Some(merged)) => {
                    header = match merged.peek_header() {
                        Ok(header) => header,
                        Err(e) => {
                            errors.record(&e.into());
                            continue;
                        }
                    };
                    stream = merged;
                }
                Ok(None) => continue,
                Err(e) => {
                    errors.record(&e.into());
                    continue;
                }
            }
        }

        // Receipts get first look at every arrival.
        if receipts.check(&stream, &header) {
            continue;
        }

        // Acknowledge on request before any further processing.
        if header.ack_nack == AckNack::Request && !block_ack_nack.load(Ordering::Acquire) {
            let mut ack = header;
            ack.swap_source_destination();
            ack.ack_nack = AckNack::Ack;
            ack.data_control = DataControl::Single;
            ack.data_size = 0;
            let mut packet = Stream::new();
            if packet.write_header(&ack).is_ok() {
                let _ = outbox.send_stream(&packet);
            }
        }

        // Core queries every endpoint must answer without user code.
        match header.command_code {
            codes::QUERY_HEARTBEAT_PULSE => {
                let reply = build_message(id, header.source, &ReportHeartbeatPulse);
                if let Err(e) = outbox.send_stream(&reply) {
                    warn!("heartbeat reply failed: {e}");
                }
                continue;
            }
            codes::QUERY_COMPONENT_AUTHORITY => {
                let reply =
                    build_message(id, header.source, &ReportComponentAuthority { authority });
                let _ = outbox.send_stream(&reply);
                continue;
            }
            codes::QUERY_COMPONENT_STATUS => {
                let reply = build_message(
                    id,
                    header.source,
                    &ReportComponentStatus { primary: ComponentStatus::Ready, secondary: 0 },
                );
                let _ = outbox.send_stream(&reply);
                continue;
            }
            _ => {}
        }

        handler.add_to_queue(stream, header);
    }
}
