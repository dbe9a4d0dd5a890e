use std::time::{Duration, Instant};

/// Tracks socket activity for heartbeat emission and peer liveness.
///
/// We owe the server a heartbeat when nothing was written for one interval;
/// the server is considered gone when nothing was read for two.
pub(crate) struct Heartbeat {
    last_read: Instant,
    last_write: Instant,
}

impl Heartbeat {
    pub(crate) fn new() -> Self {
        let now = Instant::now();
        Self {
            last_read: now,
            last_write: now,
        }
    }

    pub(crate) fn record_read(&mut self) {
        self.last_read = Instant::now();
    }

    pub(crate) fn record_write(&mut self) {
        self.last_write = Instant::now();
    }

    pub(crate) fn should_send(&self, now: Instant, interval: Duration) -> bool {
        now.duration_since(self.last_write) >= interval
    }

    pub(crate) fn peer_expired(&self, now: Instant, interval: Duration) -> bool {
        now.duration_since(self.last_read) >= interval * 2
    }
}
