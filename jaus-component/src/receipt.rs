//! Receipts: the state behind a blocking send-and-await-response.
//!
//! The sender parks a receipt in the shared registry before transmitting;
//! the incoming path gives every arrival to [`ReceiptRegistry::check`]
//! before normal dispatch. Matching populates the receipt and signals the
//! sender, which otherwise wakes on its resend interval to retransmit.

use crate::error::ComponentError;
use crate::StreamSender;
use jaus_wire::codec::response_codes;
use jaus_wire::{AckNack, Header, Stream, MAX_SEND_COUNT, RESPONSE_TIMEOUT_MS};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Terminal state of a blocking send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Pending,
    Success,
    Timeout,
}

/// What the caller gets back from a blocking send.
#[derive(Debug)]
pub struct Receipt {
    pub status: ReceiptStatus,
    /// How many times the message went out, retransmissions included.
    pub send_count: u8,
    /// Ack/nack recorded for the sent message, if one arrived.
    pub ack_nack: Option<AckNack>,
    /// The matched response, if the receipt was waiting on one.
    pub response: Option<Stream>,
}

struct ReceiptState {
    status: ReceiptStatus,
    destination: jaus_wire::Address,
    sent_code: u16,
    sent_ack_nack: AckNack,
    response_codes: SmallVec<[u16; 2]>,
    send_count: u8,
    ack_nack: Option<AckNack>,
    response: Option<Stream>,
    updated_at: Instant,
}

struct PendingReceipt {
    state: Mutex<ReceiptState>,
    signal: Condvar,
}

/// The set of receipts currently awaiting responses.
#[derive(Default)]
pub struct ReceiptRegistry {
    pending: Mutex<Vec<Arc<PendingReceipt>>>,
}

impl ReceiptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer an arrival to the pending receipts. Returns true when a
    /// receipt consumed it, in which case normal dispatch is skipped.
    pub fn check(&self, stream: &Stream, header: &Header) -> bool {
        let pending = self.pending.lock();
        for receipt in pending.iter() {
            let mut state = receipt.state.lock();
            if state.status != ReceiptStatus::Pending {
                continue;
            }
            if state.destination != header.source {
                continue;
            }

            // A real response to the outstanding request.
            if state.response_codes.contains(&header.command_code) {
                state.response = Some(stream.clone());
                state.status = ReceiptStatus::Success;
                state.updated_at = Instant::now();
                receipt.signal.notify_all();
                return true;
            }

            // A bare ack/nack for the code we sent.
            if header.data_size == 0
                && header.command_code == state.sent_code
                && matches!(header.ack_nack, AckNack::Ack | AckNack::Nack)
            {
                state.ack_nack = Some(header.ack_nack);
                state.updated_at = Instant::now();
                if state.response_codes.is_empty()
                    || (header.ack_nack == AckNack::Nack
                        && state.sent_ack_nack == AckNack::Request)
                {
                    // Waiting only on the acknowledgement, or the peer
                    // definitively refused; either way the wait is over.
                    state.status = ReceiptStatus::Success;
                    receipt.signal.notify_all();
                }
                return true;
            }
        }
        false
    }

    /// Flip every pending receipt to Timeout and wake its sender. Used on
    /// shutdown.
    pub fn cancel_all(&self) {
        let pending = self.pending.lock();
        for receipt in pending.iter() {
            let mut state = receipt.state.lock();
            if state.status == ReceiptStatus::Pending {
                state.status = ReceiptStatus::Timeout;
                receipt.signal.notify_all();
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn insert(&self, receipt: Arc<PendingReceipt>) {
        self.pending.lock().push(receipt);
    }

    fn remove(&self, receipt: &Arc<PendingReceipt>) {
        self.pending
            .lock()
            .retain(|candidate| !Arc::ptr_eq(candidate, receipt));
    }
}

/// Tuning for a blocking send.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    /// Expected response code; `None` consults the catalog table.
    pub response_code: Option<u16>,
    /// Total timeout across all attempts, milliseconds.
    pub timeout_ms: u64,
    /// Number of transmissions, at most [`MAX_SEND_COUNT`].
    pub tries: u8,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self { response_code: None, timeout_ms: RESPONSE_TIMEOUT_MS, tries: MAX_SEND_COUNT }
    }
}

/// Send `stream` and block until a matching response, an acknowledgement,
/// or timeout. Attempts after the first go out flagged `Retransmit`.
///
/// Broadcast destinations are rejected: the number of responses would be
/// unbounded.
pub fn send_and_wait(
    sender: &dyn StreamSender,
    registry: &ReceiptRegistry,
    stream: &Stream,
    options: SendOptions,
) -> Result<Receipt, ComponentError> {
    if options.tries == 0 || options.tries > MAX_SEND_COUNT {
        return Err(ComponentError::InvalidValue("tries out of range"));
    }
    if options.timeout_ms == 0 {
        return Err(ComponentError::InvalidValue("zero timeout"));
    }
    let header = stream.peek_header()?;
    if header.destination.is_broadcast() || !header.destination.is_valid() {
        return Err(ComponentError::InvalidAddress);
    }

    let codes: SmallVec<[u16; 2]> = match options.response_code {
        Some(code) => SmallVec::from_slice(&[code]),
        None => SmallVec::from_slice(response_codes(header.command_code)),
    };
    if codes.is_empty() && header.ack_nack != AckNack::Request {
        return Err(ComponentError::UnknownMessageType(header.command_code));
    }

    let receipt = Arc::new(PendingReceipt {
        state: Mutex::new(ReceiptState {
            status: ReceiptStatus::Pending,
            destination: header.destination,
            sent_code: header.command_code,
            sent_ack_nack: header.ack_nack,
            response_codes: codes,
            send_count: 0,
            ack_nack: None,
            response: None,
            updated_at: Instant::now(),
        }),
        signal: Condvar::new(),
    });
    registry.insert(receipt.clone());

    if let Err(e) = sender.send_stream(stream) {
        registry.remove(&receipt);
        return Err(e);
    }
    {
        let mut state = receipt.state.lock();
        state.send_count = 1;
        state.updated_at = Instant::now();
    }

    let resend_interval = Duration::from_millis(options.timeout_ms / options.tries as u64);
    let mut retransmit: Option<Stream> = None;

    let result = loop {
        let mut state = receipt.state.lock();
        match state.status {
            ReceiptStatus::Success | ReceiptStatus::Timeout => {
                break Receipt {
                    status: state.status,
                    send_count: state.send_count,
                    ack_nack: state.ack_nack,
                    response: state.response.take(),
                };
            }
            ReceiptStatus::Pending => {}
        }

        let elapsed = state.updated_at.elapsed();
        if elapsed >= resend_interval {
            if state.send_count < options.tries {
                let packet = retransmit.get_or_insert_with(|| {
                    let mut copy = stream.clone();
                    copy.write_header(&header.as_retransmit())
                        .expect("existing header always rewritable");
                    copy
                });
                debug!(
                    code = header.command_code,
                    attempt = state.send_count + 1,
                    "retransmitting for pending receipt"
                );
                state.send_count += 1;
                state.updated_at = Instant::now();
                let packet = packet.clone();
                drop(state);
                // Send outside the state lock; the matcher takes it.
                let _ = sender.send_stream(&packet);
                continue;
            }
            state.status = ReceiptStatus::Timeout;
            break Receipt {
                status: ReceiptStatus::Timeout,
                send_count: state.send_count,
                ack_nack: state.ack_nack,
                response: state.response.take(),
            };
        }

        let _ = receipt
            .signal
            .wait_for(&mut state, resend_interval - elapsed);
    };

    registry.remove(&receipt);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jaus_wire::Address;
    use parking_lot::Mutex as PlMutex;

    /// Sender that swallows everything, recording attempts.
    struct SilentPeer {
        sent: PlMutex<Vec<Stream>>,
    }

    impl StreamSender for SilentPeer {
        fn send_stream(&self, stream: &Stream) -> Result<(), ComponentError> {
            self.sent.lock().push(stream.clone());
            Ok(())
        }
    }

    fn query_stream() -> Stream {
        let mut header = Header::new(
            jaus_wire::codec::codes::QUERY_HEARTBEAT_PULSE,
            Address::new(1, 1, 2, 1),
            Address::new(1, 1, 1, 1),
        );
        header.data_size = 0;
        let mut stream = Stream::new();
        stream.write_header(&header).unwrap();
        stream
    }

    #[test]
    fn silent_peer_times_out_after_exactly_three_tries() {
        let peer = SilentPeer { sent: PlMutex::new(Vec::new()) };
        let registry = ReceiptRegistry::new();
        let receipt = send_and_wait(
            &peer,
            &registry,
            &query_stream(),
            SendOptions { response_code: None, timeout_ms: 300, tries: 3 },
        )
        .unwrap();

        assert_eq!(receipt.status, ReceiptStatus::Timeout);
        assert_eq!(receipt.send_count, 3);

        let sent = peer.sent.lock();
        assert_eq!(sent.len(), 3);
        let flags: Vec<_> = sent
            .iter()
            .map(|s| s.peek_header().unwrap().data_control)
            .collect();
        assert_eq!(
            flags,
            vec![
                jaus_wire::DataControl::Single,
                jaus_wire::DataControl::Retransmit,
                jaus_wire::DataControl::Retransmit,
            ]
        );
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn broadcast_and_bad_arguments_are_rejected() {
        let peer = SilentPeer { sent: PlMutex::new(Vec::new()) };
        let registry = ReceiptRegistry::new();

        let mut stream = Stream::new();
        stream
            .write_header(&Header::new(
                0x2202,
                Address::new(1, 1, 2, 1),
                Address::new(1, 255, 1, 1),
            ))
            .unwrap();
        assert!(matches!(
            send_and_wait(&peer, &registry, &stream, SendOptions::default()),
            Err(ComponentError::InvalidAddress)
        ));

        assert!(matches!(
            send_and_wait(
                &peer,
                &registry,
                &query_stream(),
                SendOptions { tries: 4, ..SendOptions::default() }
            ),
            Err(ComponentError::InvalidValue(_))
        ));
        assert!(matches!(
            send_and_wait(
                &peer,
                &registry,
                &query_stream(),
                SendOptions { timeout_ms: 0, ..SendOptions::default() }
            ),
            Err(ComponentError::InvalidValue(_))
        ));
    }

    #[test]
    fn matching_response_resolves_the_receipt() {
        let peer = SilentPeer { sent: PlMutex::new(Vec::new()) };
        let registry = Arc::new(ReceiptRegistry::new());

        let responder = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                // Give the sender time to park its receipt.
                std::thread::sleep(Duration::from_millis(50));
                let mut header = Header::new(
                    jaus_wire::codec::codes::REPORT_HEARTBEAT_PULSE,
                    Address::new(1, 1, 1, 1),
                    Address::new(1, 1, 2, 1),
                );
                header.data_size = 0;
                let mut response = Stream::new();
                response.write_header(&header).unwrap();
                registry.check(&response, &header)
            })
        };

        let receipt =
            send_and_wait(&peer, &registry, &query_stream(), SendOptions::default()).unwrap();
        assert!(responder.join().unwrap());
        assert_eq!(receipt.status, ReceiptStatus::Success);
        assert_eq!(receipt.send_count, 1);
        let response = receipt.response.expect("response stream");
        assert_eq!(
            response.peek_header().unwrap().command_code,
            jaus_wire::codec::codes::REPORT_HEARTBEAT_PULSE
        );
    }

    #[test]
    fn nack_resolves_a_send_awaiting_acknowledgement() {
        let peer = SilentPeer { sent: PlMutex::new(Vec::new()) };
        let registry = Arc::new(ReceiptRegistry::new());

        let mut header =
            Header::new(0xD400, Address::new(1, 1, 2, 1), Address::new(9, 9, 9, 9));
        header.ack_nack = AckNack::Request;
        let mut stream = Stream::new();
        stream.write_header(&header).unwrap();

        let responder = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                let mut nack = header;
                nack.swap_source_destination();
                nack.ack_nack = AckNack::Nack;
                nack.data_size = 0;
                let mut response = Stream::new();
                response.write_header(&nack).unwrap();
                registry.check(&response, &nack)
            })
        };

        let receipt = send_and_wait(&peer, &registry, &stream, SendOptions::default()).unwrap();
        assert!(responder.join().unwrap());
        assert_eq!(receipt.status, ReceiptStatus::Success);
        assert_eq!(receipt.ack_nack, Some(AckNack::Nack));
    }
}
