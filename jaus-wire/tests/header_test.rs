use jaus_wire::{AckNack, Address, DataControl, Header, HEADER_SIZE};
use proptest::prelude::*;

fn arb_ack_nack() -> impl Strategy<Value = AckNack> {
    prop_oneof![
        Just(AckNack::None),
        Just(AckNack::Request),
        Just(AckNack::Ack),
        Just(AckNack::Nack),
    ]
}

fn arb_data_control() -> impl Strategy<Value = DataControl> {
    prop_oneof![
        Just(DataControl::Single),
        Just(DataControl::First),
        Just(DataControl::Middle),
        Just(DataControl::Last),
        Just(DataControl::Retransmit),
    ]
}

fn arb_header() -> impl Strategy<Value = Header> {
    (
        0u8..=15,
        arb_ack_nack(),
        any::<bool>(),
        arb_data_control(),
        0u8..=63,
        any::<u16>(),
        any::<u32>(),
        any::<u32>(),
        any::<u16>(),
        any::<u16>(),
    )
        .prop_map(
            |(priority, ack_nack, sc, data_control, version, code, src, dst, size, seq)| Header {
                priority,
                ack_nack,
                service_connection: sc,
                data_control,
                version,
                command_code: code,
                source: Address::from_u32(src),
                destination: Address::from_u32(dst),
                data_size: size,
                sequence_number: seq,
            },
        )
}

proptest! {
    #[test]
    fn every_header_round_trips(h in arb_header()) {
        let bytes = h.encode();
        prop_assert_eq!(bytes.len(), HEADER_SIZE);
        prop_assert_eq!(Header::decode(&bytes).unwrap(), h);
    }

    #[test]
    fn decode_never_panics_on_arbitrary_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
        let _ = Header::decode(&bytes);
    }
}

#[test]
fn layout_is_little_endian() {
    let h = Header {
        command_code: 0x4202,
        data_size: 0x0102,
        sequence_number: 0x0A0B,
        source: Address::new(1, 2, 3, 4),
        destination: Address::new(9, 8, 7, 6),
        ..Header::default()
    };
    let bytes = h.encode();
    assert_eq!(&bytes[2..4], &[0x02, 0x42]);
    assert_eq!(&bytes[12..14], &[0x02, 0x01]);
    assert_eq!(&bytes[14..16], &[0x0B, 0x0A]);
    // Addresses pack subsystem into the most significant byte.
    assert_eq!(&bytes[4..8], &[4, 3, 2, 1]);
    assert_eq!(&bytes[8..12], &[6, 7, 8, 9]);
}
