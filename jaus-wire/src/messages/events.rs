use crate::codec::{codes, MessageBody};
use crate::error::WireError;
use crate::stream::Stream;

/// How an event fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EventType {
    /// Fire once, then the subscription is deleted.
    OneTime = 0,
    /// Fire whenever the provider signals a state change.
    #[default]
    EveryChange = 1,
    /// Fire at the declared rate; a newer value replaces a pending one.
    Periodic = 2,
    /// Fire at the declared rate; values queue rather than replace.
    PeriodicWithoutReplacement = 3,
}

impl EventType {
    fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(EventType::OneTime),
            1 => Ok(EventType::EveryChange),
            2 => Ok(EventType::Periodic),
            3 => Ok(EventType::PeriodicWithoutReplacement),
            _ => Err(WireError::BadPacket("event type out of range")),
        }
    }
}

/// Subscribes to notifications for `message_code` from the destination.
/// The optional query narrows what the provider should report.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreateEvent {
    pub event_type: EventType,
    pub message_code: u16,
    /// Requested rate in hundredths of a hertz; meaningful for the periodic
    /// types only.
    pub requested_rate: u16,
    pub query: Option<Vec<u8>>,
}

impl MessageBody for CreateEvent {
    const CODE: u16 = codes::CREATE_EVENT;

    fn write_body(&self, stream: &mut Stream) {
        stream.write_u8(self.event_type as u8);
        stream.write_u16(self.message_code);
        stream.write_u16(self.requested_rate);
        match &self.query {
            Some(query) => {
                stream.write_u8(1);
                stream.write_u16(query.len() as u16);
                stream.write_bytes(query);
            }
            None => stream.write_u8(0),
        }
    }

    fn read_body(stream: &mut Stream) -> Result<Self, WireError> {
        let event_type = EventType::from_u8(stream.read_u8()?)?;
        let message_code = stream.read_u16()?;
        let requested_rate = stream.read_u16()?;
        let query = match stream.read_u8()? {
            0 => None,
            _ => {
                let len = stream.read_u16()? as usize;
                Some(stream.read_bytes(len)?)
            }
        };
        Ok(Self { event_type, message_code, requested_rate, query })
    }
}

/// Drops a subscription, identified by event id and carried message code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CancelEvent {
    pub event_id: u8,
    pub message_code: u16,
}

impl MessageBody for CancelEvent {
    const CODE: u16 = codes::CANCEL_EVENT;

    fn write_body(&self, stream: &mut Stream) {
        stream.write_u8(self.event_id);
        stream.write_u16(self.message_code);
    }

    fn read_body(stream: &mut Stream) -> Result<Self, WireError> {
        Ok(Self { event_id: stream.read_u8()?, message_code: stream.read_u16()? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfirmEventRequest {
    pub event_id: u8,
    pub message_code: u16,
    pub confirmed_rate: u16,
}

impl MessageBody for ConfirmEventRequest {
    const CODE: u16 = codes::CONFIRM_EVENT_REQUEST;

    fn write_body(&self, stream: &mut Stream) {
        stream.write_u8(self.event_id);
        stream.write_u16(self.message_code);
        stream.write_u16(self.confirmed_rate);
    }

    fn read_body(stream: &mut Stream) -> Result<Self, WireError> {
        Ok(Self {
            event_id: stream.read_u8()?,
            message_code: stream.read_u16()?,
            confirmed_rate: stream.read_u16()?,
        })
    }
}

/// Reasons a provider may refuse an event request.
pub mod reject_reason {
    pub const PERIODIC_UNSUPPORTED: u8 = 1;
    pub const CHANGE_UNSUPPORTED: u8 = 2;
    pub const CONNECTION_REFUSED: u8 = 5;
    pub const INVALID_RATE: u8 = 6;
    pub const MESSAGE_UNSUPPORTED: u8 = 7;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RejectEventRequest {
    pub message_code: u16,
    pub reason: u8,
}

impl MessageBody for RejectEventRequest {
    const CODE: u16 = codes::REJECT_EVENT_REQUEST;

    fn write_body(&self, stream: &mut Stream) {
        stream.write_u16(self.message_code);
        stream.write_u8(self.reason);
    }

    fn read_body(stream: &mut Stream) -> Result<Self, WireError> {
        Ok(Self { message_code: stream.read_u16()?, reason: stream.read_u8()? })
    }
}

/// Asks a provider which events it currently maintains. An empty filter
/// means all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryEvents {
    pub message_code_filter: u16,
}

impl MessageBody for QueryEvents {
    const CODE: u16 = codes::QUERY_EVENTS;

    fn write_body(&self, stream: &mut Stream) {
        stream.write_u16(self.message_code_filter);
    }

    fn read_body(stream: &mut Stream) -> Result<Self, WireError> {
        Ok(Self { message_code_filter: stream.read_u16()? })
    }
}

/// One maintained event, as listed in [`ReportEvents`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSummary {
    pub event_id: u8,
    pub event_type: EventType,
    pub message_code: u16,
    pub rate: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReportEvents {
    pub events: Vec<EventSummary>,
}

impl MessageBody for ReportEvents {
    const CODE: u16 = codes::REPORT_EVENTS;

    fn write_body(&self, stream: &mut Stream) {
        stream.write_u8(self.events.len() as u8);
        for event in &self.events {
            stream.write_u8(event.event_id);
            stream.write_u8(event.event_type as u8);
            stream.write_u16(event.message_code);
            stream.write_u16(event.rate);
        }
    }

    fn read_body(stream: &mut Stream) -> Result<Self, WireError> {
        let count = stream.read_u8()?;
        let mut events = Vec::with_capacity(count as usize);
        for _ in 0..count {
            events.push(EventSummary {
                event_id: stream.read_u8()?,
                event_type: EventType::from_u8(stream.read_u8()?)?,
                message_code: stream.read_u16()?,
                rate: stream.read_u16()?,
            });
        }
        Ok(Self { events })
    }
}

/// Wrapper delivered to subscribers. `event_sequence` advances by one on
/// every send of this event, independent of the header sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventNotification {
    pub event_id: u8,
    pub message_code: u16,
    pub event_sequence: u16,
    pub payload: Vec<u8>,
}

impl MessageBody for EventNotification {
    const CODE: u16 = codes::EVENT_NOTIFICATION;

    fn write_body(&self, stream: &mut Stream) {
        stream.write_u8(self.event_id);
        stream.write_u16(self.message_code);
        stream.write_u16(self.event_sequence);
        stream.write_u16(self.payload.len() as u16);
        stream.write_bytes(&self.payload);
    }

    fn read_body(stream: &mut Stream) -> Result<Self, WireError> {
        let event_id = stream.read_u8()?;
        let message_code = stream.read_u16()?;
        let event_sequence = stream.read_u16()?;
        let len = stream.read_u16()? as usize;
        let payload = stream.read_bytes(len)?;
        Ok(Self { event_id, message_code, event_sequence, payload })
    }
}
