use jaus_node::{ScManager, ScRouter};
use jaus_wire::codec::{build_message, build_message_with, codes};
use jaus_wire::messages::{
    ConfirmServiceConnection, CreateServiceConnection, ScResponseCode, SuspendServiceConnection,
    TerminateServiceConnection,
};
use jaus_wire::{Address, Header, KnownMessage, Stream};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

const NODE: Address = Address::new(1, 1, 1, 1);
const PROVIDER: Address = Address::new(1, 1, 9, 1);
const INFORM_CODE: u16 = 0x4500;
const COMMAND_CODE: u16 = 0x0500;

struct FakeRouter {
    forwarded: Mutex<Vec<Stream>>,
    authorities: Mutex<HashMap<Address, u8>>,
}

impl FakeRouter {
    fn new() -> Arc<Self> {
        Arc::new(Self { forwarded: Mutex::new(Vec::new()), authorities: Mutex::new(HashMap::new()) })
    }

    fn with_authorities(entries: &[(Address, u8)]) -> Arc<Self> {
        let router = Self::new();
        *router.authorities.lock() = entries.iter().copied().collect();
        router
    }

    fn drain(&self) -> Vec<(Header, Stream)> {
        self.forwarded
            .lock()
            .drain(..)
            .map(|stream| (stream.peek_header().unwrap(), stream))
            .collect()
    }
}

impl ScRouter for FakeRouter {
    fn forward(&self, stream: &Stream) -> bool {
        self.forwarded.lock().push(stream.clone());
        true
    }

    fn query_authority(&self, of: Address) -> Option<u8> {
        self.authorities.lock().get(&of).copied()
    }
}

fn process<T: jaus_wire::MessageBody>(manager: &ScManager, source: Address, destination: Address, body: &T) {
    let stream = build_message(source, destination, body);
    let header = stream.peek_header().unwrap();
    manager.process_message(&stream, &header);
}

fn sc_data(manager: &ScManager, code: u16, source: Address, destination: Address) {
    let mut header = Header::new(code, source, destination);
    header.service_connection = true;
    let mut stream = Stream::new();
    stream.write_header(&header).unwrap();
    manager.process_message(&stream, &header);
}

fn confirm(manager: &ScManager, code: u16, to: Address, instance_id: u8, rate: u16) {
    process(
        manager,
        PROVIDER,
        to,
        &ConfirmServiceConnection {
            message_code: code,
            instance_id,
            confirmed_rate: rate,
            response: ScResponseCode::CreatedSuccessfully,
        },
    );
}

#[test]
fn inform_fan_out_tracks_subscribers_and_rates() {
    let router = FakeRouter::new();
    let manager = ScManager::new(NODE, router.clone());
    let s1 = Address::new(1, 2, 5, 1);
    let s2 = Address::new(1, 3, 5, 1);

    // First subscriber: the create goes through to the provider.
    process(
        &manager,
        s1,
        PROVIDER,
        &CreateServiceConnection { message_code: INFORM_CODE, periodic_rate: 100, presence_vector: 0 },
    );
    let forwarded = router.drain();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].0.command_code, codes::CREATE_SERVICE_CONNECTION);
    confirm(&manager, INFORM_CODE, s1, 7, 100);
    router.drain();

    // Second subscriber asks for a faster rate; the provider must decide.
    process(
        &manager,
        s2,
        PROVIDER,
        &CreateServiceConnection { message_code: INFORM_CODE, periodic_rate: 200, presence_vector: 0 },
    );
    assert_eq!(router.drain().len(), 1);
    confirm(&manager, INFORM_CODE, s2, 7, 200);
    router.drain();

    // Provider output reaches both subscribers, in subscriber order.
    sc_data(&manager, INFORM_CODE, PROVIDER, NODE);
    let deliveries = router.drain();
    let destinations: Vec<Address> = deliveries.iter().map(|(h, _)| h.destination).collect();
    assert_eq!(destinations, vec![s1, s2]);

    // A third subscriber at a slower rate is auto-confirmed at the
    // established (higher) rate without bothering the provider.
    let s3 = Address::new(1, 4, 5, 1);
    process(
        &manager,
        s3,
        PROVIDER,
        &CreateServiceConnection { message_code: INFORM_CODE, periodic_rate: 150, presence_vector: 0 },
    );
    let replies = router.drain();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].0.command_code, codes::CONFIRM_SERVICE_CONNECTION);
    assert_eq!(replies[0].0.destination, s3);
    match KnownMessage::decode(&replies[0].0, &replies[0].1).unwrap() {
        Some(KnownMessage::ConfirmServiceConnection(c)) => {
            assert_eq!(c.confirmed_rate, 200);
            assert_eq!(c.instance_id, 7);
            assert_eq!(c.response, ScResponseCode::CreatedSuccessfully);
        }
        other => panic!("expected a confirm, got {other:?}"),
    }

    // Departures: remaining subscribers keep receiving; the provider gets
    // exactly one terminate when the last one leaves.
    process(&manager, s1, PROVIDER, &TerminateServiceConnection { message_code: INFORM_CODE, instance_id: 7 });
    process(&manager, s3, PROVIDER, &TerminateServiceConnection { message_code: INFORM_CODE, instance_id: 7 });
    router.drain();
    sc_data(&manager, INFORM_CODE, PROVIDER, NODE);
    let deliveries = router.drain();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].0.destination, s2);

    process(&manager, s2, PROVIDER, &TerminateServiceConnection { message_code: INFORM_CODE, instance_id: 7 });
    let terminates: Vec<_> = router
        .drain()
        .into_iter()
        .filter(|(h, _)| {
            h.command_code == codes::TERMINATE_SERVICE_CONNECTION && h.destination == PROVIDER
        })
        .collect();
    assert_eq!(terminates.len(), 1);
    assert_eq!(manager.connection_counts().0, 0);
}

#[test]
fn command_lead_election_admits_only_the_lead() {
    let c1 = Address::new(1, 2, 5, 1);
    let c2 = Address::new(1, 3, 5, 1);
    let c3 = Address::new(1, 4, 5, 1);
    let router = FakeRouter::with_authorities(&[(PROVIDER, 2), (c1, 3), (c2, 5), (c3, 4)]);
    let manager = ScManager::new(NODE, router.clone());

    let create = CreateServiceConnection {
        message_code: COMMAND_CODE,
        periodic_rate: 0,
        presence_vector: 0,
    };

    process(&manager, c1, PROVIDER, &create);
    confirm(&manager, COMMAND_CODE, c1, 9, 0);
    process(&manager, c2, PROVIDER, &create);
    process(&manager, c3, PROVIDER, &create);
    router.drain();

    // Only the highest-authority active commander reaches the provider.
    sc_data(&manager, COMMAND_CODE, c1, PROVIDER);
    sc_data(&manager, COMMAND_CODE, c3, PROVIDER);
    assert!(router.drain().is_empty());
    sc_data(&manager, COMMAND_CODE, c2, PROVIDER);
    let through = router.drain();
    assert_eq!(through.len(), 1);
    assert_eq!(through[0].0.source, c2);

    // When the lead terminates, authority 4 takes over.
    process(
        &manager,
        c2,
        PROVIDER,
        &TerminateServiceConnection { message_code: COMMAND_CODE, instance_id: 9 },
    );
    let activations: Vec<_> = router
        .drain()
        .into_iter()
        .filter(|(h, _)| h.command_code == codes::ACTIVATE_SERVICE_CONNECTION)
        .collect();
    assert_eq!(activations.len(), 1);
    assert_eq!(activations[0].0.destination, c3);

    sc_data(&manager, COMMAND_CODE, c2, PROVIDER);
    sc_data(&manager, COMMAND_CODE, c1, PROVIDER);
    assert!(router.drain().is_empty());
    sc_data(&manager, COMMAND_CODE, c3, PROVIDER);
    let through = router.drain();
    assert_eq!(through.len(), 1);
    assert_eq!(through[0].0.source, c3);
}

#[test]
fn low_authority_commander_is_refused_before_the_provider_sees_it() {
    let weak = Address::new(1, 2, 5, 1);
    let router = FakeRouter::with_authorities(&[(PROVIDER, 5), (weak, 3)]);
    let manager = ScManager::new(NODE, router.clone());

    process(
        &manager,
        weak,
        PROVIDER,
        &CreateServiceConnection { message_code: COMMAND_CODE, periodic_rate: 0, presence_vector: 0 },
    );

    let replies = router.drain();
    assert_eq!(replies.len(), 1);
    let (header, stream) = &replies[0];
    assert_eq!(header.destination, weak);
    match KnownMessage::decode(header, stream).unwrap() {
        Some(KnownMessage::ConfirmServiceConnection(c)) => {
            assert_eq!(c.response, ScResponseCode::Refused);
        }
        other => panic!("expected a refusal, got {other:?}"),
    }
    assert_eq!(manager.connection_counts().1, 0);
}

#[test]
fn suspending_the_last_active_subscriber_suspends_the_provider() {
    let router = FakeRouter::new();
    let manager = ScManager::new(NODE, router.clone());
    let subscriber = Address::new(1, 2, 5, 1);

    process(
        &manager,
        subscriber,
        PROVIDER,
        &CreateServiceConnection { message_code: INFORM_CODE, periodic_rate: 50, presence_vector: 0 },
    );
    confirm(&manager, INFORM_CODE, subscriber, 3, 50);
    router.drain();

    process(
        &manager,
        subscriber,
        PROVIDER,
        &SuspendServiceConnection { message_code: INFORM_CODE, instance_id: 3 },
    );
    let forwarded = router.drain();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].0.command_code, codes::SUSPEND_SERVICE_CONNECTION);
    assert_eq!(forwarded[0].0.destination, PROVIDER);

    // Suspended subscribers receive nothing.
    sc_data(&manager, INFORM_CODE, PROVIDER, NODE);
    assert!(router.drain().is_empty());
}

#[test]
fn unmanaged_sc_data_is_blocked() {
    let router = FakeRouter::new();
    let manager = ScManager::new(NODE, router.clone());
    sc_data(&manager, INFORM_CODE, PROVIDER, NODE);
    assert!(router.drain().is_empty());
}

fn build_remote_create() -> (Stream, Header) {
    let stream = build_message_with(
        Header::new(
            codes::CREATE_SERVICE_CONNECTION,
            Address::new(1, 2, 5, 1),
            Address::new(1, 7, 9, 1),
        ),
        &CreateServiceConnection { message_code: INFORM_CODE, periodic_rate: 10, presence_vector: 0 },
    );
    let header = stream.peek_header().unwrap();
    (stream, header)
}

#[test]
fn sc_messages_for_other_nodes_pass_through_untouched() {
    let router = FakeRouter::new();
    let manager = ScManager::new(NODE, router.clone());

    let (stream, header) = build_remote_create();
    manager.process_message(&stream, &header);

    let forwarded = router.drain();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].1, stream);
    assert_eq!(manager.connection_counts(), (0, 0));
}
