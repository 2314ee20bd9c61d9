use crate::codec::{codes, MessageBody};
use crate::error::WireError;
use crate::stream::Stream;

macro_rules! empty_body {
    ($name:ident, $code:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name;

        impl MessageBody for $name {
            const CODE: u16 = $code;

            fn write_body(&self, _stream: &mut Stream) {}

            fn read_body(_stream: &mut Stream) -> Result<Self, WireError> {
                Ok($name)
            }
        }
    };
}

empty_body!(
    QueryComponentAuthority,
    codes::QUERY_COMPONENT_AUTHORITY,
    "Asks a component for its authority code."
);
empty_body!(
    QueryComponentStatus,
    codes::QUERY_COMPONENT_STATUS,
    "Asks a component for its primary/secondary status."
);
empty_body!(QueryTime, codes::QUERY_TIME, "Asks a node for its current clock.");

/// Authority code reply; authority runs 0 (lowest) to 255.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportComponentAuthority {
    pub authority: u8,
}

impl MessageBody for ReportComponentAuthority {
    const CODE: u16 = codes::REPORT_COMPONENT_AUTHORITY;

    fn write_body(&self, stream: &mut Stream) {
        stream.write_u8(self.authority);
    }

    fn read_body(stream: &mut Stream) -> Result<Self, WireError> {
        Ok(Self { authority: stream.read_u8()? })
    }
}

/// Primary status values a component reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ComponentStatus {
    Initializing = 0,
    #[default]
    Ready = 1,
    Standby = 2,
    Shutdown = 3,
    Failure = 4,
    Emergency = 5,
}

impl ComponentStatus {
    fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(ComponentStatus::Initializing),
            1 => Ok(ComponentStatus::Ready),
            2 => Ok(ComponentStatus::Standby),
            3 => Ok(ComponentStatus::Shutdown),
            4 => Ok(ComponentStatus::Failure),
            5 => Ok(ComponentStatus::Emergency),
            _ => Err(WireError::BadPacket("component status out of range")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportComponentStatus {
    pub primary: ComponentStatus,
    pub secondary: u32,
}

impl MessageBody for ReportComponentStatus {
    const CODE: u16 = codes::REPORT_COMPONENT_STATUS;

    fn write_body(&self, stream: &mut Stream) {
        stream.write_u8(self.primary as u8);
        stream.write_u32(self.secondary);
    }

    fn read_body(stream: &mut Stream) -> Result<Self, WireError> {
        Ok(Self {
            primary: ComponentStatus::from_u8(stream.read_u8()?)?,
            secondary: stream.read_u32()?,
        })
    }
}

/// Clock reply: milliseconds since the Unix epoch, UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportTime {
    pub timestamp_ms: u64,
}

impl MessageBody for ReportTime {
    const CODE: u16 = codes::REPORT_TIME;

    fn write_body(&self, stream: &mut Stream) {
        stream.write_u64(self.timestamp_ms);
    }

    fn read_body(stream: &mut Stream) -> Result<Self, WireError> {
        Ok(Self { timestamp_ms: stream.read_u64()? })
    }
}
