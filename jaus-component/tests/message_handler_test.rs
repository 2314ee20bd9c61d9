use jaus_component::{MessageHandler, MessageProcessor};
use jaus_wire::codec::{build_message, codes};
use jaus_wire::messages::ReportComponentAuthority;
use jaus_wire::{Address, Header, KnownMessage, Stream};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

const GATE_CODE: u16 = 0xD0FE;
const FILLER_CODE: u16 = 0xD001;

fn raw_message(code: u16, priority: u8) -> (Stream, Header) {
    let mut header = Header::new(code, Address::new(1, 1, 2, 1), Address::new(1, 1, 1, 1));
    header.priority = priority;
    let mut stream = Stream::new();
    stream.write_header(&header).unwrap();
    (stream, header)
}

fn wait_until_drained(handler: &MessageHandler) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while handler.queued() > 0 {
        assert!(Instant::now() < deadline, "handler did not drain");
        std::thread::sleep(Duration::from_millis(1));
    }
    // Let the in-flight dispatch finish.
    std::thread::sleep(Duration::from_millis(20));
}

/// Preload both queues while the worker is parked on a gate message, so
/// the scheduling pattern is observable without racing the feeder.
fn run_preloaded(priority_count: usize, default_count: usize) -> Vec<bool> {
    let handler = MessageHandler::new("test");
    let order: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    let (gate_tx, gate_rx) = crossbeam::channel::bounded::<()>(1);

    {
        let order = order.clone();
        handler.set_stream_callback(move |_, header| {
            if header.command_code == GATE_CODE {
                let _ = gate_rx.recv();
                return;
            }
            order.lock().push(header.priority > 6);
        });
    }

    let (gate_stream, gate_header) = raw_message(GATE_CODE, 10);
    handler.add_to_queue(gate_stream, gate_header);
    std::thread::sleep(Duration::from_millis(50));

    for _ in 0..priority_count {
        let (stream, header) = raw_message(FILLER_CODE, 10);
        handler.add_to_queue(stream, header);
    }
    for _ in 0..default_count {
        let (stream, header) = raw_message(FILLER_CODE, 6);
        handler.add_to_queue(stream, header);
    }

    gate_tx.send(()).unwrap();
    wait_until_drained(&handler);
    drop(handler);
    Arc::try_unwrap(order).unwrap().into_inner()
}

#[test]
fn default_traffic_is_never_starved() {
    let order = run_preloaded(30, 10);
    assert_eq!(order.len(), 40);

    // While priority traffic is continuous, at least one default message
    // must be dispatched per three messages handled.
    let mut since_default = 0;
    let mut defaults_seen = 0;
    for is_priority in &order[..15] {
        if *is_priority {
            since_default += 1;
            assert!(since_default <= 3, "priority run exceeded the starvation bound");
        } else {
            defaults_seen += 1;
            since_default = 0;
        }
    }
    assert!(defaults_seen >= 4);
}

#[test]
fn priority_queue_orders_by_priority_value() {
    let handler = MessageHandler::new("ordering");
    let order: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let (gate_tx, gate_rx) = crossbeam::channel::bounded::<()>(1);

    {
        let order = order.clone();
        handler.set_stream_callback(move |_, header| {
            if header.command_code == GATE_CODE {
                let _ = gate_rx.recv();
                return;
            }
            order.lock().push(header.priority);
        });
    }

    let (gate_stream, gate_header) = raw_message(GATE_CODE, 10);
    handler.add_to_queue(gate_stream, gate_header);
    std::thread::sleep(Duration::from_millis(50));

    let (low, low_header) = raw_message(FILLER_CODE, 8);
    handler.add_to_queue(low, low_header);
    let (high, high_header) = raw_message(FILLER_CODE, 12);
    handler.add_to_queue(high, high_header);

    gate_tx.send(()).unwrap();
    wait_until_drained(&handler);
    assert_eq!(*order.lock(), vec![12, 8]);
}

#[test]
fn per_code_callback_wins_over_defaults() {
    let handler = MessageHandler::new("callbacks");
    let hits: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let hits = hits.clone();
        handler.register_callback(codes::REPORT_COMPONENT_AUTHORITY, move |message, _| {
            if let KnownMessage::ReportComponentAuthority(report) = message {
                assert_eq!(report.authority, 4);
            }
            hits.lock().push("per-code");
        });
    }
    {
        let hits = hits.clone();
        handler.set_message_callback(move |_, _| hits.lock().push("message-default"));
    }

    let stream = build_message(
        Address::new(1, 1, 2, 1),
        Address::new(1, 1, 1, 1),
        &ReportComponentAuthority { authority: 4 },
    );
    let header = stream.peek_header().unwrap();
    handler.add_to_queue(stream, header);
    wait_until_drained(&handler);

    assert_eq!(*hits.lock(), vec!["per-code"]);
}

#[test]
fn processor_hooks_classify_by_code_range() {
    struct Recorder {
        hits: Arc<Mutex<Vec<&'static str>>>,
    }

    impl MessageProcessor for Recorder {
        fn process_query(&self, _message: &KnownMessage, _header: &Header) {
            self.hits.lock().push("query");
        }
        fn process_experimental(&self, _stream: &Stream, _header: &Header) {
            self.hits.lock().push("experimental");
        }
    }

    let handler = MessageHandler::new("processor");
    let hits: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    handler.set_processor(Arc::new(Recorder { hits: hits.clone() }));

    let query = build_message(
        Address::new(1, 1, 2, 1),
        Address::new(1, 1, 1, 1),
        &jaus_wire::messages::QueryHeartbeatPulse,
    );
    let query_header = query.peek_header().unwrap();
    handler.add_to_queue(query, query_header);

    let (experimental, experimental_header) = raw_message(0xD200, 6);
    handler.add_to_queue(experimental, experimental_header);

    wait_until_drained(&handler);
    let hits = hits.lock();
    assert!(hits.contains(&"query"));
    assert!(hits.contains(&"experimental"));
}
