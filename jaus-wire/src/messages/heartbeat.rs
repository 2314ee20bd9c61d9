use crate::codec::{codes, MessageBody};
use crate::error::WireError;
use crate::stream::Stream;

/// Asks a node manager to confirm it is alive. No body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryHeartbeatPulse;

impl MessageBody for QueryHeartbeatPulse {
    const CODE: u16 = codes::QUERY_HEARTBEAT_PULSE;

    fn write_body(&self, _stream: &mut Stream) {}

    fn read_body(_stream: &mut Stream) -> Result<Self, WireError> {
        Ok(QueryHeartbeatPulse)
    }
}

/// The 1 Hz liveness pulse every node manager emits, and the reply to
/// [`QueryHeartbeatPulse`]. No body; the header carries everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportHeartbeatPulse;

impl MessageBody for ReportHeartbeatPulse {
    const CODE: u16 = codes::REPORT_HEARTBEAT_PULSE;

    fn write_body(&self, _stream: &mut Stream) {}

    fn read_body(_stream: &mut Stream) -> Result<Self, WireError> {
        Ok(ReportHeartbeatPulse)
    }
}
