use crate::error::WireError;
use crate::header::Header;
use crate::messages::*;
use crate::stream::Stream;
use crate::HEADER_SIZE;

/// Command codes for the core message catalog. Codes outside this set are
/// routed as opaque raw streams.
pub mod codes {
    // Commands (0x0001..=0x1FFF)
    pub const CREATE_SERVICE_CONNECTION: u16 = 0x0008;
    pub const CONFIRM_SERVICE_CONNECTION: u16 = 0x0009;
    pub const ACTIVATE_SERVICE_CONNECTION: u16 = 0x000A;
    pub const SUSPEND_SERVICE_CONNECTION: u16 = 0x000B;
    pub const TERMINATE_SERVICE_CONNECTION: u16 = 0x000C;
    pub const CREATE_EVENT: u16 = 0x01F0;
    pub const CANCEL_EVENT: u16 = 0x01F2;
    pub const CONFIRM_EVENT_REQUEST: u16 = 0x01F3;
    pub const REJECT_EVENT_REQUEST: u16 = 0x01F4;
    pub const QUERY_EVENTS: u16 = 0x21F0;
    pub const REPORT_EVENTS: u16 = 0x41F0;

    // Queries (0x2000..=0x3FFF)
    pub const QUERY_COMPONENT_AUTHORITY: u16 = 0x2001;
    pub const QUERY_COMPONENT_STATUS: u16 = 0x2002;
    pub const QUERY_TIME: u16 = 0x2011;
    pub const QUERY_HEARTBEAT_PULSE: u16 = 0x2202;
    pub const QUERY_CONFIGURATION: u16 = 0x2B00;
    pub const QUERY_IDENTIFICATION: u16 = 0x2B01;
    pub const QUERY_SUBSYSTEM_LIST: u16 = 0x2B02;
    pub const QUERY_SERVICES: u16 = 0x2B03;

    // Inform (0x4000..=0x5FFF)
    pub const REPORT_COMPONENT_AUTHORITY: u16 = 0x4001;
    pub const REPORT_COMPONENT_STATUS: u16 = 0x4002;
    pub const REPORT_TIME: u16 = 0x4011;
    pub const EVENT_NOTIFICATION: u16 = 0x41F1;
    pub const REPORT_HEARTBEAT_PULSE: u16 = 0x4202;
    pub const REPORT_CONFIGURATION: u16 = 0x4B00;
    pub const REPORT_IDENTIFICATION: u16 = 0x4B01;
    pub const REPORT_SUBSYSTEM_LIST: u16 = 0x4B02;
    pub const REPORT_SERVICES: u16 = 0x4B03;
}

/// Broad class of a command code, derived from its range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCategory {
    Command,
    Query,
    Inform,
    Experimental,
}

impl MessageCategory {
    pub fn of(code: u16) -> Result<MessageCategory, WireError> {
        match code {
            0x0001..=0x1FFF => Ok(MessageCategory::Command),
            0x2000..=0x3FFF => Ok(MessageCategory::Query),
            0x4000..=0x5FFF => Ok(MessageCategory::Inform),
            0xD000..=0xFFFF => Ok(MessageCategory::Experimental),
            _ => Err(WireError::UnknownMessageType(code)),
        }
    }
}

/// True for the five service-connection management codes.
pub fn is_service_connection_code(code: u16) -> bool {
    matches!(
        code,
        codes::CREATE_SERVICE_CONNECTION
            | codes::CONFIRM_SERVICE_CONNECTION
            | codes::ACTIVATE_SERVICE_CONNECTION
            | codes::SUSPEND_SERVICE_CONNECTION
            | codes::TERMINATE_SERVICE_CONNECTION
    )
}

/// True when SCs carrying this code are inform (multi-subscriber) rather
/// than command (authority-arbitrated) connections.
pub fn is_inform_code(code: u16) -> bool {
    matches!(MessageCategory::of(code), Ok(MessageCategory::Inform) | Ok(MessageCategory::Query))
}

/// Expected response codes for a blocking send, looked up when the caller
/// does not name one. Empty for codes with no defined response.
pub fn response_codes(code: u16) -> &'static [u16] {
    match code {
        codes::QUERY_COMPONENT_AUTHORITY => &[codes::REPORT_COMPONENT_AUTHORITY],
        codes::QUERY_COMPONENT_STATUS => &[codes::REPORT_COMPONENT_STATUS],
        codes::QUERY_TIME => &[codes::REPORT_TIME],
        codes::QUERY_HEARTBEAT_PULSE => &[codes::REPORT_HEARTBEAT_PULSE],
        codes::QUERY_CONFIGURATION => &[codes::REPORT_CONFIGURATION],
        codes::QUERY_IDENTIFICATION => &[codes::REPORT_IDENTIFICATION],
        codes::QUERY_SUBSYSTEM_LIST => &[codes::REPORT_SUBSYSTEM_LIST],
        codes::QUERY_SERVICES => &[codes::REPORT_SERVICES],
        codes::QUERY_EVENTS => &[codes::REPORT_EVENTS],
        codes::CREATE_SERVICE_CONNECTION => &[codes::CONFIRM_SERVICE_CONNECTION],
        codes::CREATE_EVENT => &[codes::CONFIRM_EVENT_REQUEST, codes::REJECT_EVENT_REQUEST],
        codes::CANCEL_EVENT => &[codes::CONFIRM_EVENT_REQUEST, codes::REJECT_EVENT_REQUEST],
        _ => &[],
    }
}

/// Presence vector of a serialized message, used as part of large-data-set
/// and service-connection keys. By catalog convention the vector is the
/// first four body bytes; shorter bodies have no vector.
pub fn read_presence_vector(stream: &Stream) -> u32 {
    let body = stream.body();
    if body.len() >= 4 {
        u32::from_le_bytes([body[0], body[1], body[2], body[3]])
    } else {
        0
    }
}

/// A message body that can be carried behind a header.
pub trait MessageBody: Sized {
    const CODE: u16;
    fn write_body(&self, stream: &mut Stream);
    fn read_body(stream: &mut Stream) -> Result<Self, WireError>;
}

/// Serialize `body` under a header built from `template`. The command code
/// and data size are overwritten from the body; everything else (priority,
/// ack/nack, SC flag, sequence number) is taken from the template.
pub fn build_message_with<T: MessageBody>(mut template: Header, body: &T) -> Stream {
    let mut stream = Stream::with_capacity(HEADER_SIZE + 32);
    template.command_code = T::CODE;
    template.data_size = 0;
    stream
        .write_header(&template)
        .expect("fresh stream always accepts a header");
    body.write_body(&mut stream);
    template.data_size = (stream.len() - HEADER_SIZE) as u16;
    stream
        .write_header(&template)
        .expect("rewriting an existing header cannot fail");
    stream
}

/// Serialize `body` addressed `source` -> `destination` with default header
/// properties.
pub fn build_message<T: MessageBody>(
    source: crate::Address,
    destination: crate::Address,
    body: &T,
) -> Stream {
    build_message_with(Header::new(T::CODE, source, destination), body)
}

/// A decoded message from the core catalog.
///
/// Arrivals with codes outside the catalog stay as raw streams; they are
/// still routable, just not interpretable here.
#[derive(Debug, Clone, PartialEq)]
pub enum KnownMessage {
    QueryHeartbeatPulse(QueryHeartbeatPulse),
    ReportHeartbeatPulse(ReportHeartbeatPulse),
    QueryComponentAuthority(QueryComponentAuthority),
    ReportComponentAuthority(ReportComponentAuthority),
    QueryComponentStatus(QueryComponentStatus),
    ReportComponentStatus(ReportComponentStatus),
    QueryTime(QueryTime),
    ReportTime(ReportTime),
    QueryConfiguration(QueryConfiguration),
    ReportConfiguration(ReportConfiguration),
    QueryIdentification(QueryIdentification),
    ReportIdentification(ReportIdentification),
    QuerySubsystemList(QuerySubsystemList),
    ReportSubsystemList(ReportSubsystemList),
    QueryServices(QueryServices),
    ReportServices(ReportServices),
    CreateServiceConnection(CreateServiceConnection),
    ConfirmServiceConnection(ConfirmServiceConnection),
    ActivateServiceConnection(ActivateServiceConnection),
    SuspendServiceConnection(SuspendServiceConnection),
    TerminateServiceConnection(TerminateServiceConnection),
    CreateEvent(CreateEvent),
    CancelEvent(CancelEvent),
    ConfirmEventRequest(ConfirmEventRequest),
    RejectEventRequest(RejectEventRequest),
    QueryEvents(QueryEvents),
    ReportEvents(ReportEvents),
    EventNotification(EventNotification),
    /// Zero-body acknowledgement, synthesized from the header alone.
    AckNack(AckNackMessage),
}

impl KnownMessage {
    /// Decode the body of `stream` according to `header.command_code`.
    /// Returns `Ok(None)` for codes outside the catalog.
    pub fn decode(header: &Header, stream: &Stream) -> Result<Option<KnownMessage>, WireError> {
        use codes::*;
        let mut body = stream.clone();
        body.seek_body();
        let decoded = match header.command_code {
            QUERY_HEARTBEAT_PULSE => {
                KnownMessage::QueryHeartbeatPulse(QueryHeartbeatPulse::read_body(&mut body)?)
            }
            REPORT_HEARTBEAT_PULSE => {
                KnownMessage::ReportHeartbeatPulse(ReportHeartbeatPulse::read_body(&mut body)?)
            }
            QUERY_COMPONENT_AUTHORITY => KnownMessage::QueryComponentAuthority(
                QueryComponentAuthority::read_body(&mut body)?,
            ),
            REPORT_COMPONENT_AUTHORITY => KnownMessage::ReportComponentAuthority(
                ReportComponentAuthority::read_body(&mut body)?,
            ),
            QUERY_COMPONENT_STATUS => {
                KnownMessage::QueryComponentStatus(QueryComponentStatus::read_body(&mut body)?)
            }
            REPORT_COMPONENT_STATUS => {
                KnownMessage::ReportComponentStatus(ReportComponentStatus::read_body(&mut body)?)
            }
            QUERY_TIME => KnownMessage::QueryTime(QueryTime::read_body(&mut body)?),
            REPORT_TIME => KnownMessage::ReportTime(ReportTime::read_body(&mut body)?),
            QUERY_CONFIGURATION => {
                KnownMessage::QueryConfiguration(QueryConfiguration::read_body(&mut body)?)
            }
            REPORT_CONFIGURATION => {
                KnownMessage::ReportConfiguration(ReportConfiguration::read_body(&mut body)?)
            }
            QUERY_IDENTIFICATION => {
                KnownMessage::QueryIdentification(QueryIdentification::read_body(&mut body)?)
            }
            REPORT_IDENTIFICATION => {
                KnownMessage::ReportIdentification(ReportIdentification::read_body(&mut body)?)
            }
            QUERY_SUBSYSTEM_LIST => {
                KnownMessage::QuerySubsystemList(QuerySubsystemList::read_body(&mut body)?)
            }
            REPORT_SUBSYSTEM_LIST => {
                KnownMessage::ReportSubsystemList(ReportSubsystemList::read_body(&mut body)?)
            }
            QUERY_SERVICES => KnownMessage::QueryServices(QueryServices::read_body(&mut body)?),
            REPORT_SERVICES => KnownMessage::ReportServices(ReportServices::read_body(&mut body)?),
            CREATE_SERVICE_CONNECTION => KnownMessage::CreateServiceConnection(
                CreateServiceConnection::read_body(&mut body)?,
            ),
            CONFIRM_SERVICE_CONNECTION => KnownMessage::ConfirmServiceConnection(
                ConfirmServiceConnection::read_body(&mut body)?,
            ),
            ACTIVATE_SERVICE_CONNECTION => KnownMessage::ActivateServiceConnection(
                ActivateServiceConnection::read_body(&mut body)?,
            ),
            SUSPEND_SERVICE_CONNECTION => KnownMessage::SuspendServiceConnection(
                SuspendServiceConnection::read_body(&mut body)?,
            ),
            TERMINATE_SERVICE_CONNECTION => KnownMessage::TerminateServiceConnection(
                TerminateServiceConnection::read_body(&mut body)?,
            ),
            CREATE_EVENT => KnownMessage::CreateEvent(CreateEvent::read_body(&mut body)?),
            CANCEL_EVENT => KnownMessage::CancelEvent(CancelEvent::read_body(&mut body)?),
            CONFIRM_EVENT_REQUEST => {
                KnownMessage::ConfirmEventRequest(ConfirmEventRequest::read_body(&mut body)?)
            }
            REJECT_EVENT_REQUEST => {
                KnownMessage::RejectEventRequest(RejectEventRequest::read_body(&mut body)?)
            }
            QUERY_EVENTS => KnownMessage::QueryEvents(QueryEvents::read_body(&mut body)?),
            REPORT_EVENTS => KnownMessage::ReportEvents(ReportEvents::read_body(&mut body)?),
            EVENT_NOTIFICATION => {
                KnownMessage::EventNotification(EventNotification::read_body(&mut body)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(decoded))
    }

    pub fn code(&self) -> u16 {
        use codes::*;
        match self {
            KnownMessage::QueryHeartbeatPulse(_) => QUERY_HEARTBEAT_PULSE,
            KnownMessage::ReportHeartbeatPulse(_) => REPORT_HEARTBEAT_PULSE,
            KnownMessage::QueryComponentAuthority(_) => QUERY_COMPONENT_AUTHORITY,
            KnownMessage::ReportComponentAuthority(_) => REPORT_COMPONENT_AUTHORITY,
            KnownMessage::QueryComponentStatus(_) => QUERY_COMPONENT_STATUS,
            KnownMessage::ReportComponentStatus(_) => REPORT_COMPONENT_STATUS,
            KnownMessage::QueryTime(_) => QUERY_TIME,
            KnownMessage::ReportTime(_) => REPORT_TIME,
            KnownMessage::QueryConfiguration(_) => QUERY_CONFIGURATION,
            KnownMessage::ReportConfiguration(_) => REPORT_CONFIGURATION,
            KnownMessage::QueryIdentification(_) => QUERY_IDENTIFICATION,
            KnownMessage::ReportIdentification(_) => REPORT_IDENTIFICATION,
            KnownMessage::QuerySubsystemList(_) => QUERY_SUBSYSTEM_LIST,
            KnownMessage::ReportSubsystemList(_) => REPORT_SUBSYSTEM_LIST,
            KnownMessage::QueryServices(_) => QUERY_SERVICES,
            KnownMessage::ReportServices(_) => REPORT_SERVICES,
            KnownMessage::CreateServiceConnection(_) => CREATE_SERVICE_CONNECTION,
            KnownMessage::ConfirmServiceConnection(_) => CONFIRM_SERVICE_CONNECTION,
            KnownMessage::ActivateServiceConnection(_) => ACTIVATE_SERVICE_CONNECTION,
            KnownMessage::SuspendServiceConnection(_) => SUSPEND_SERVICE_CONNECTION,
            KnownMessage::TerminateServiceConnection(_) => TERMINATE_SERVICE_CONNECTION,
            KnownMessage::CreateEvent(_) => CREATE_EVENT,
            KnownMessage::CancelEvent(_) => CANCEL_EVENT,
            KnownMessage::ConfirmEventRequest(_) => CONFIRM_EVENT_REQUEST,
            KnownMessage::RejectEventRequest(_) => REJECT_EVENT_REQUEST,
            KnownMessage::QueryEvents(_) => QUERY_EVENTS,
            KnownMessage::ReportEvents(_) => REPORT_EVENTS,
            KnownMessage::EventNotification(_) => EVENT_NOTIFICATION,
            KnownMessage::AckNack(m) => m.command_code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Address;

    #[test]
    fn categories_follow_code_ranges() {
        assert_eq!(MessageCategory::of(0x0008).unwrap(), MessageCategory::Command);
        assert_eq!(MessageCategory::of(0x2202).unwrap(), MessageCategory::Query);
        assert_eq!(MessageCategory::of(0x4202).unwrap(), MessageCategory::Inform);
        assert_eq!(MessageCategory::of(0xD001).unwrap(), MessageCategory::Experimental);
        assert!(MessageCategory::of(0x7000).is_err());
        assert!(MessageCategory::of(0).is_err());
    }

    #[test]
    fn build_then_decode_known_message() {
        let src = Address::new(1, 1, 2, 1);
        let dst = Address::new(1, 1, 1, 1);
        let stream = build_message(src, dst, &ReportComponentAuthority { authority: 9 });
        let header = stream.peek_header().unwrap();
        assert_eq!(header.command_code, codes::REPORT_COMPONENT_AUTHORITY);
        assert_eq!(header.data_size as usize, stream.len() - HEADER_SIZE);
        match KnownMessage::decode(&header, &stream).unwrap() {
            Some(KnownMessage::ReportComponentAuthority(m)) => assert_eq!(m.authority, 9),
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn unknown_codes_stay_raw() {
        let mut stream = Stream::new();
        stream
            .write_header(&Header::new(0xD123, Address::new(1, 1, 2, 1), Address::new(1, 1, 3, 1)))
            .unwrap();
        let header = stream.peek_header().unwrap();
        assert_eq!(KnownMessage::decode(&header, &stream).unwrap(), None);
    }
}
