//! The two-queue priority message pipeline.
//!
//! Every component and every node owns one of these. Arrivals land in
//! either the default or the priority queue; a dedicated worker dispatches
//! them to the registered callbacks, weighting priority traffic ahead of
//! default traffic without starving it.

use jaus_wire::messages::AckNackMessage;
use jaus_wire::{
    header::DEFAULT_PRIORITY, AckNack, Header, KnownMessage, MessageCategory, Stream,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Sleep between polls when both queues are empty.
const IDLE_POLL: Duration = Duration::from_micros(500);
/// Consecutive priority dispatches before default traffic is forced in.
const PRIORITY_BURST: u32 = 2;

/// Callback for a decoded catalog message.
pub type MessageCallback = Arc<dyn Fn(&KnownMessage, &Header) + Send + Sync>;
/// Callback for a raw stream (unknown codes included).
pub type StreamCallback = Arc<dyn Fn(&Stream, &Header) + Send + Sync>;

/// Fallback hooks dispatched by command-code category when no callback
/// claimed a message. Implementations override what they handle.
pub trait MessageProcessor: Send + Sync {
    fn process_command(&self, _message: &KnownMessage, _header: &Header) {}
    fn process_query(&self, _message: &KnownMessage, _header: &Header) {}
    fn process_inform(&self, _message: &KnownMessage, _header: &Header) {}
    fn process_experimental(&self, _stream: &Stream, _header: &Header) {}
    fn process_ack_nack(&self, _message: &AckNackMessage) {}
}

#[derive(Default)]
struct Pipelines {
    default: VecDeque<(Stream, Header)>,
    priority: VecDeque<(Stream, Header)>,
}

#[derive(Default)]
struct Callbacks {
    by_code: HashMap<u16, MessageCallback>,
    message_default: Option<MessageCallback>,
    stream_default: Option<StreamCallback>,
    processor: Option<Arc<dyn MessageProcessor>>,
}

struct HandlerShared {
    // Queues and callback tables take separate locks so callbacks may
    // register while the worker is mid-dispatch.
    queues: Mutex<Pipelines>,
    callbacks: Mutex<Callbacks>,
    quit: AtomicBool,
}

/// Owns the dispatch worker and both queues.
pub struct MessageHandler {
    shared: Arc<HandlerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MessageHandler {
    pub fn new(name: &str) -> Self {
        let shared = Arc::new(HandlerShared {
            queues: Mutex::new(Pipelines::default()),
            callbacks: Mutex::new(Callbacks::default()),
            quit: AtomicBool::new(false),
        });
        let worker = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(format!("jaus-msg-{name}"))
                .spawn(move || worker_loop(shared))
                .expect("spawning the message worker")
        };
        Self { shared, worker: Mutex::new(Some(worker)) }
    }

    /// Queue an arrival. Service-connection traffic and anything above the
    /// default priority goes to the priority queue, ordered so higher
    /// priorities sit ahead of lower ones already waiting.
    pub fn add_to_queue(&self, stream: Stream, header: Header) {
        let mut queues = self.shared.queues.lock();
        let is_priority = header.priority > DEFAULT_PRIORITY
            || header.service_connection
            || matches!(header.ack_nack, AckNack::Ack | AckNack::Nack);
        if !is_priority {
            queues.default.push_back((stream, header));
            return;
        }
        let at = queues
            .priority
            .iter()
            .position(|(_, queued)| queued.priority < header.priority)
            .unwrap_or(queues.priority.len());
        queues.priority.insert(at, (stream, header));
    }

    pub fn register_callback<F>(&self, code: u16, callback: F)
    where
        F: Fn(&KnownMessage, &Header) + Send + Sync + 'static,
    {
        self.shared
            .callbacks
            .lock()
            .by_code
            .insert(code, Arc::new(callback));
    }

    pub fn clear_callback(&self, code: u16) {
        self.shared.callbacks.lock().by_code.remove(&code);
    }

    pub fn set_message_callback<F>(&self, callback: F)
    where
        F: Fn(&KnownMessage, &Header) + Send + Sync + 'static,
    {
        self.shared.callbacks.lock().message_default = Some(Arc::new(callback));
    }

    pub fn set_stream_callback<F>(&self, callback: F)
    where
        F: Fn(&Stream, &Header) + Send + Sync + 'static,
    {
        self.shared.callbacks.lock().stream_default = Some(Arc::new(callback));
    }

    pub fn set_processor(&self, processor: Arc<dyn MessageProcessor>) {
        self.shared.callbacks.lock().processor = Some(processor);
    }

    pub fn queued(&self) -> usize {
        let queues = self.shared.queues.lock();
        queues.default.len() + queues.priority.len()
    }

    /// Stop the worker and release everything still queued.
    pub fn shutdown(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
        let mut queues = self.shared.queues.lock();
        queues.default.clear();
        queues.priority.clear();
    }
}

impl Drop for MessageHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<HandlerShared>) {
    let mut priority_streak = 0u32;
    while !shared.quit.load(Ordering::Acquire) {
        let next = {
            let mut queues = shared.queues.lock();
            if priority_streak >= PRIORITY_BURST && !queues.default.is_empty() {
                priority_streak = 0;
                queues.default.pop_front()
            } else if let Some(entry) = queues.priority.pop_front() {
                priority_streak += 1;
                Some(entry)
            } else {
                priority_streak = 0;
                queues.default.pop_front()
            }
        };

        match next {
            Some((stream, header)) => dispatch(&shared, &stream, &header),
            None => std::thread::sleep(IDLE_POLL),
        }
    }
}

fn dispatch(shared: &Arc<HandlerShared>, stream: &Stream, header: &Header) {
    // Bare acknowledgements carry no body; reconstruct them from the
    // header rather than consulting the codec.
    let decoded = if header.data_size == 0
        && matches!(header.ack_nack, AckNack::Ack | AckNack::Nack)
    {
        Some(KnownMessage::AckNack(AckNackMessage::from_header(header)))
    } else {
        match KnownMessage::decode(header, stream) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(code = header.command_code, "undecodable body: {e}");
                None
            }
        }
    };

    // Snapshot the relevant callbacks, then invoke outside the table lock.
    let (per_code, message_default, stream_default, processor) = {
        let callbacks = shared.callbacks.lock();
        (
            callbacks.by_code.get(&header.command_code).cloned(),
            callbacks.message_default.clone(),
            callbacks.stream_default.clone(),
            callbacks.processor.clone(),
        )
    };

    if let (Some(callback), Some(message)) = (&per_code, &decoded) {
        callback(message, header);
        return;
    }
    if let (Some(callback), Some(message)) = (&message_default, &decoded) {
        callback(message, header);
        return;
    }
    if let Some(callback) = &stream_default {
        callback(stream, header);
        return;
    }
    let Some(processor) = processor else { return };

    if let Some(KnownMessage::AckNack(ack)) = &decoded {
        processor.process_ack_nack(ack);
        return;
    }
    match MessageCategory::of(header.command_code) {
        Ok(MessageCategory::Command) => {
            if let Some(message) = &decoded {
                processor.process_command(message, header);
            }
        }
        Ok(MessageCategory::Query) => {
            if let Some(message) = &decoded {
                processor.process_query(message, header);
            }
        }
        Ok(MessageCategory::Inform) => {
            if let Some(message) = &decoded {
                processor.process_inform(message, header);
            }
        }
        Ok(MessageCategory::Experimental) => processor.process_experimental(stream, header),
        Err(_) => warn!(code = header.command_code, "unclassifiable command code"),
    }
}

impl std::fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHandler")
            .field("queued", &self.queued())
            .finish()
    }
}
