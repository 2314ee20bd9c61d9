//! Event notifications: subscribe/generate/cancel over routing.

use jaus_component::StreamSender;
use jaus_wire::address::AddressSet;
use jaus_wire::codec::build_message;
use jaus_wire::messages::{
    reject_reason, CancelEvent, ConfirmEventRequest, CreateEvent, EventNotification, EventSummary,
    EventType, RejectEventRequest,
};
use jaus_wire::{Address, Stream};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::debug;

/// One registered event and its subscribers.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub event_id: u8,
    pub event_type: EventType,
    pub message_code: u16,
    /// Hundredths of a hertz, for the periodic types.
    pub rate: u16,
    pub query: Option<Vec<u8>>,
    pub subscribers: AddressSet,
    pub sequence: u16,
    pub last_send: Option<Instant>,
}

/// Per-provider event table. `generate` snapshots its recipients under the
/// lock and sends after releasing it, so a slow transport cannot stall
/// registration.
pub struct EventManager {
    provider: Address,
    events: Mutex<BTreeMap<u8, EventRecord>>,
}

impl EventManager {
    pub fn new(provider: Address) -> Self {
        Self { provider, events: Mutex::new(BTreeMap::new()) }
    }

    /// Handle a creation request from `subscriber`.
    pub fn create(
        &self,
        request: &CreateEvent,
        subscriber: Address,
    ) -> Result<ConfirmEventRequest, RejectEventRequest> {
        let mut events = self.events.lock();

        // An equivalent existing event just gains a subscriber.
        for record in events.values_mut() {
            if record.message_code == request.message_code
                && record.event_type == request.event_type
                && record.query == request.query
            {
                record.subscribers.insert(subscriber);
                if request.requested_rate > record.rate {
                    record.rate = request.requested_rate;
                }
                return Ok(ConfirmEventRequest {
                    event_id: record.event_id,
                    message_code: record.message_code,
                    confirmed_rate: record.rate,
                });
            }
        }

        let Some(event_id) = (0..=u8::MAX).find(|id| !events.contains_key(id)) else {
            return Err(RejectEventRequest {
                message_code: request.message_code,
                reason: reject_reason::CONNECTION_REFUSED,
            });
        };
        let mut subscribers = AddressSet::new();
        subscribers.insert(subscriber);
        events.insert(
            event_id,
            EventRecord {
                event_id,
                event_type: request.event_type,
                message_code: request.message_code,
                rate: request.requested_rate,
                query: request.query.clone(),
                subscribers,
                sequence: 0,
                last_send: None,
            },
        );
        debug!("event {event_id} created for {:#06x} by {subscriber}", request.message_code);
        Ok(ConfirmEventRequest {
            event_id,
            message_code: request.message_code,
            confirmed_rate: request.requested_rate,
        })
    }

    /// Handle a cancellation; frees the event once nobody subscribes.
    pub fn cancel(&self, request: &CancelEvent, subscriber: Address) -> bool {
        let mut events = self.events.lock();
        let Some(record) = events.get_mut(&request.event_id) else {
            return false;
        };
        if record.message_code != request.message_code {
            return false;
        }
        record.subscribers.remove(&subscriber);
        if record.subscribers.is_empty() {
            events.remove(&request.event_id);
        }
        true
    }

    /// Drop `address` from every subscriber set; used on disconnect.
    pub fn cancel_all_for(&self, address: Address) {
        let mut events = self.events.lock();
        events.retain(|_, record| {
            record.subscribers.remove(&address);
            !record.subscribers.is_empty()
        });
    }

    /// Emit `payload` to every subscriber of every event carrying `code`.
    /// One-time events are consumed by the send.
    pub fn generate(&self, code: u16, payload: &[u8], sender: &dyn StreamSender) {
        let batch = {
            let mut events = self.events.lock();
            let mut batch: Vec<Stream> = Vec::new();
            let mut finished = Vec::new();
            for record in events.values_mut() {
                if record.message_code != code {
                    continue;
                }
                for subscriber in record.subscribers.iter() {
                    let notification = EventNotification {
                        event_id: record.event_id,
                        message_code: code,
                        event_sequence: record.sequence,
                        payload: payload.to_vec(),
                    };
                    batch.push(build_message(self.provider, *subscriber, &notification));
                    record.sequence = record.sequence.wrapping_add(1);
                }
                record.last_send = Some(Instant::now());
                if record.event_type == EventType::OneTime {
                    finished.push(record.event_id);
                }
            }
            for event_id in finished {
                events.remove(&event_id);
            }
            batch
        };
        // Sends happen after the table lock is gone.
        for stream in batch {
            let _ = sender.send_stream(&stream);
        }
    }

    /// Event ids of periodic events whose declared rate says they are due.
    pub fn periodic_due(&self, now: Instant) -> Vec<(u8, u16)> {
        let events = self.events.lock();
        events
            .values()
            .filter(|record| {
                matches!(
                    record.event_type,
                    EventType::Periodic | EventType::PeriodicWithoutReplacement
                )
            })
            .filter(|record| {
                if record.rate == 0 {
                    return false;
                }
                let period_ms = 100_000u64 / record.rate as u64;
                match record.last_send {
                    None => true,
                    Some(last) => now.duration_since(last).as_millis() as u64 >= period_ms,
                }
            })
            .map(|record| (record.event_id, record.message_code))
            .collect()
    }

    /// Summaries for a `QueryEvents` reply, optionally filtered by carried
    /// message code.
    pub fn summaries(&self, message_code_filter: u16) -> Vec<EventSummary> {
        self.events
            .lock()
            .values()
            .filter(|record| {
                message_code_filter == 0 || record.message_code == message_code_filter
            })
            .map(|record| EventSummary {
                event_id: record.event_id,
                event_type: record.event_type,
                message_code: record.message_code,
                rate: record.rate,
            })
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn subscriber_count(&self, code: u16) -> usize {
        self.events
            .lock()
            .values()
            .filter(|record| record.message_code == code)
            .map(|record| record.subscribers.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jaus_component::ComponentError;
    use parking_lot::Mutex as PlMutex;

    struct Capture {
        sent: PlMutex<Vec<Stream>>,
    }

    impl StreamSender for Capture {
        fn send_stream(&self, stream: &Stream) -> Result<(), ComponentError> {
            self.sent.lock().push(stream.clone());
            Ok(())
        }
    }

    fn request(event_type: EventType, code: u16) -> CreateEvent {
        CreateEvent { event_type, message_code: code, requested_rate: 0, query: None }
    }

    #[test]
    fn create_generate_cancel_round_trip() {
        let manager = EventManager::new(Address::new(1, 1, 1, 1));
        let s1 = Address::new(1, 1, 5, 1);
        let s2 = Address::new(1, 1, 6, 1);

        let confirm = manager.create(&request(EventType::EveryChange, 0x4B00), s1).unwrap();
        manager.create(&request(EventType::EveryChange, 0x4B00), s2).unwrap();
        assert_eq!(manager.subscriber_count(0x4B00), 2);

        let capture = Capture { sent: PlMutex::new(Vec::new()) };
        manager.generate(0x4B00, b"payload", &capture);
        assert_eq!(capture.sent.lock().len(), 2);

        assert!(manager.cancel(
            &CancelEvent { event_id: confirm.event_id, message_code: 0x4B00 },
            s1
        ));
        assert_eq!(manager.subscriber_count(0x4B00), 1);
        manager.cancel_all_for(s2);
        assert_eq!(manager.event_count(), 0);
    }

    #[test]
    fn one_time_events_fire_once_and_vanish() {
        let manager = EventManager::new(Address::new(1, 1, 1, 1));
        manager
            .create(&request(EventType::OneTime, 0x4202), Address::new(1, 1, 5, 1))
            .unwrap();

        let capture = Capture { sent: PlMutex::new(Vec::new()) };
        manager.generate(0x4202, &[], &capture);
        assert_eq!(capture.sent.lock().len(), 1);
        assert_eq!(manager.event_count(), 0);

        manager.generate(0x4202, &[], &capture);
        assert_eq!(capture.sent.lock().len(), 1);
    }

    #[test]
    fn sequence_numbers_advance_per_send() {
        let manager = EventManager::new(Address::new(1, 1, 1, 1));
        let subscriber = Address::new(1, 1, 5, 1);
        manager.create(&request(EventType::EveryChange, 0x4B02), subscriber).unwrap();

        let capture = Capture { sent: PlMutex::new(Vec::new()) };
        manager.generate(0x4B02, &[1], &capture);
        manager.generate(0x4B02, &[2], &capture);

        let sent = capture.sent.lock();
        let decode = |stream: &Stream| {
            let mut body = stream.clone();
            body.seek_body();
            use jaus_wire::MessageBody;
            EventNotification::read_body(&mut body).unwrap()
        };
        assert_eq!(decode(&sent[0]).event_sequence, 0);
        assert_eq!(decode(&sent[1]).event_sequence, 1);
    }
}
