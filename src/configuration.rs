use parking_lot::Mutex;
use std::{fmt, sync::Arc};

/// The connection parameters negotiated during `connection.tune`.
#[derive(Clone, Default)]
pub struct Configuration {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    channel_max: u16,
    frame_max: u32,
    heartbeat: u16,
}

impl Configuration {
    pub fn channel_max(&self) -> u16 {
        self.inner.lock().channel_max
    }

    pub(crate) fn set_channel_max(&self, channel_max: u16) {
        self.inner.lock().channel_max = channel_max;
    }

    pub fn frame_max(&self) -> u32 {
        self.inner.lock().frame_max
    }

    pub(crate) fn set_frame_max(&self, frame_max: u32) {
        self.inner.lock().frame_max = frame_max;
    }

    pub fn heartbeat(&self) -> u16 {
        self.inner.lock().heartbeat
    }

    pub(crate) fn set_heartbeat(&self, heartbeat: u16) {
        self.inner.lock().heartbeat = heartbeat;
    }

    /// Applies the server's `connection.tune` values.
    ///
    /// For each parameter the lowest of both parties wins, 0 meaning "take
    /// the peer's value".
    pub(crate) fn negotiate(&self, channel_max: u16, frame_max: u32, heartbeat: u16) {
        let mut inner = self.inner.lock();

        if inner.heartbeat == 0 || (heartbeat != 0 && heartbeat < inner.heartbeat) {
            inner.heartbeat = heartbeat;
        }

        if channel_max != 0 && (inner.channel_max == 0 || channel_max < inner.channel_max) {
            inner.channel_max = channel_max;
        }
        if inner.channel_max == 0 {
            inner.channel_max = u16::max_value();
        }

        if frame_max != 0 && (inner.frame_max == 0 || frame_max < inner.frame_max) {
            inner.frame_max = frame_max;
        }
        if inner.frame_max == 0 {
            inner.frame_max = u32::max_value();
        }
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Configuration")
            .field("channel_max", &inner.channel_max)
            .field("frame_max", &inner.frame_max)
            .field("heartbeat", &inner.heartbeat)
            .finish()
    }
}
