use jaus_wire::{
    large_data, Address, DataControl, Header, LargeDataSetMap, Stream, HEADER_SIZE,
    MAX_PACKET_SIZE, REASSEMBLY_TIMEOUT,
};
use std::time::{Duration, Instant};

fn oversized_message(len: usize) -> Stream {
    let mut header = Header::new(0x4500, Address::new(1, 1, 2, 1), Address::new(1, 1, 3, 1));
    header.data_size = 0;
    let body: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    let mut stream = Stream::with_capacity(HEADER_SIZE + len);
    stream.write_header(&header).unwrap();
    stream.write_bytes(&body);
    stream
}

#[test]
fn split_then_merge_in_order() {
    let original = oversized_message(12_000);
    let fragments = large_data::split(&original).unwrap();
    assert!(fragments.len() > 1);
    assert!(fragments.iter().all(|f| f.len() <= MAX_PACKET_SIZE));
    assert_eq!(fragments[0].peek_header().unwrap().data_control, DataControl::First);
    assert_eq!(
        fragments.last().unwrap().peek_header().unwrap().data_control,
        DataControl::Last
    );

    let mut table = LargeDataSetMap::new();
    let now = Instant::now();
    let mut merged = None;
    for fragment in &fragments {
        let header = fragment.peek_header().unwrap();
        if let Some(stream) = table.process(fragment, &header, now).unwrap() {
            merged = Some(stream);
        }
    }
    let merged = merged.expect("all fragments delivered");
    assert_eq!(merged.body(), original.body());

    let header = merged.peek_header().unwrap();
    assert_eq!(header.data_control, DataControl::Single);
    assert_eq!(header.data_size as usize, original.body().len());
}

#[test]
fn out_of_order_arrival_produces_the_same_stream() {
    let original = oversized_message(20_000);
    let mut fragments = large_data::split(&original).unwrap();
    fragments.reverse();
    fragments.swap(0, 2);

    let mut table = LargeDataSetMap::new();
    let now = Instant::now();
    let mut merged = None;
    for fragment in &fragments {
        let header = fragment.peek_header().unwrap();
        if let Some(stream) = table.process(fragment, &header, now).unwrap() {
            merged = Some(stream);
        }
    }
    assert_eq!(merged.expect("complete").body(), original.body());
}

#[test]
fn duplicate_fragments_are_rejected_but_retransmits_replace() {
    let original = oversized_message(10_000);
    let fragments = large_data::split(&original).unwrap();
    let now = Instant::now();

    let header = fragments[1].peek_header().unwrap();
    let mut set = large_data::LargeDataSet::start(&fragments[1], &header, now).unwrap();
    assert!(!set.add(&fragments[1], &header, now));

    let mut retransmit = Stream::from_bytes(fragments[1].as_slice().to_vec());
    retransmit.write_header(&header.as_retransmit()).unwrap();
    let later = now + Duration::from_millis(10);
    assert!(set.add(&retransmit, &retransmit.peek_header().unwrap(), later));
    assert_eq!(set.updated_at(), later);
}

#[test]
fn stale_sets_are_pruned_and_a_new_first_restarts() {
    let original = oversized_message(18_000);
    let fragments = large_data::split(&original).unwrap();
    assert!(fragments.len() >= 5);

    let mut table = LargeDataSetMap::new();
    let start = Instant::now();
    for fragment in &fragments[..2] {
        let header = fragment.peek_header().unwrap();
        assert!(table.process(fragment, &header, start).unwrap().is_none());
    }
    assert_eq!(table.len(), 1);

    // Past the reassembly timeout the sweep discards the set.
    let later = start + REASSEMBLY_TIMEOUT + Duration::from_millis(1);
    assert_eq!(table.prune(later, REASSEMBLY_TIMEOUT), 1);
    assert!(table.is_empty());

    // A late middle fragment starts a fresh, incomplete set.
    let header = fragments[2].peek_header().unwrap();
    assert!(table.process(&fragments[2], &header, later).unwrap().is_none());
    assert_eq!(table.len(), 1);

    // Re-running the full sequence from its First fragment completes.
    let mut merged = None;
    for fragment in &fragments {
        let header = fragment.peek_header().unwrap();
        if let Some(stream) = table.process(fragment, &header, later).unwrap() {
            merged = Some(stream);
        }
    }
    assert_eq!(merged.expect("fresh set completes").body(), original.body());
}
