use parking_lot::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Source of time for everything with a staleness rule (reassembly tables,
/// discovery sweeps, subsystem lists). Swappable so tests can advance the
/// clock by hand.
pub trait TimeProvider: Send + Sync {
    fn now_instant(&self) -> Instant;
    /// Milliseconds since the Unix epoch.
    fn now_system_ms(&self) -> i64;
}

/// The real clock.
#[derive(Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_instant(&self) -> Instant {
        Instant::now()
    }

    fn now_system_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualTimeProvider {
    state: RwLock<(Instant, i64)>,
}

impl ManualTimeProvider {
    pub fn new() -> Self {
        Self { state: RwLock::new((Instant::now(), 0)) }
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.state.write();
        state.0 += by;
        state.1 += by.as_millis() as i64;
    }
}

impl Default for ManualTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now_instant(&self) -> Instant {
        self.state.read().0
    }

    fn now_system_ms(&self) -> i64 {
        self.state.read().1
    }
}
