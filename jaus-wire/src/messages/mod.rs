//! The core message catalog: bodies for discovery, status, service
//! connections, events, and configuration reporting.

mod acknack;
mod config;
mod events;
mod heartbeat;
mod sc;
mod status;

pub use acknack::AckNackMessage;
pub use config::{
    Configuration, ConfigurationQueryField, Identification, IdentificationQueryType,
    QueryConfiguration, QueryIdentification, QueryServices, QuerySubsystemList,
    ReportConfiguration, ReportIdentification, ReportServices, ReportSubsystemList, Service,
};
pub use events::{
    reject_reason, CancelEvent, ConfirmEventRequest, CreateEvent, EventNotification, EventSummary,
    EventType, QueryEvents, RejectEventRequest, ReportEvents,
};
pub use heartbeat::{QueryHeartbeatPulse, ReportHeartbeatPulse};
pub use sc::{
    ActivateServiceConnection, ConfirmServiceConnection, CreateServiceConnection,
    ScResponseCode, SuspendServiceConnection, TerminateServiceConnection,
};
pub use status::{
    ComponentStatus, QueryComponentAuthority, QueryComponentStatus, QueryTime,
    ReportComponentAuthority, ReportComponentStatus, ReportTime,
};
