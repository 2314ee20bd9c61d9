use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("another process is already servicing this address")]
    AddressConflict,
    #[error("invalid address")]
    InvalidAddress,
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
    #[error("blocking send timed out")]
    TimeOut,
    #[error("unknown destination")]
    UnknownDestination,
    #[error("no response defined for message type {0:#06x}")]
    UnknownMessageType(u16),
    #[error("connection failure: {0}")]
    ConnectionFailure(String),
    #[error("send failed")]
    SendFailed,
    #[error("wire error: {0}")]
    Wire(#[from] jaus_wire::WireError),
    #[error("transport error: {0}")]
    Transport(#[from] jaus_transport::TransportError),
}

/// How many errors a history ring retains.
const HISTORY_DEPTH: usize = 32;

/// Bounded ring of recent errors. Worker threads record here instead of
/// propagating across thread boundaries; the most recent entry is
/// retrievable on demand.
#[derive(Debug, Default)]
pub struct ErrorHistory {
    entries: Mutex<VecDeque<(Instant, String)>>,
}

impl ErrorHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, error: &ComponentError) {
        let mut entries = self.entries.lock();
        if entries.len() == HISTORY_DEPTH {
            entries.pop_front();
        }
        entries.push_back((Instant::now(), error.to_string()));
    }

    /// The most recent error, if any.
    pub fn last(&self) -> Option<String> {
        self.entries.lock().back().map(|(_, text)| text.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
