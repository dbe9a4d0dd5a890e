use crate::{Error, Result};
use amq_protocol::frame::{gen_frame, AMQPFrame};
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};

/// The multi-producer single-consumer outbound frame queue.
///
/// Application threads push, the I/O thread pops. [`push_group`] inserts a
/// whole content sequence under one lock so frames of different channels can
/// only interleave at group boundaries, never inside a method+header+body
/// run.
///
/// [`push_group`]: Frames::push_group
#[derive(Clone, Default)]
pub(crate) struct Frames {
    inner: Arc<Mutex<VecDeque<Outbound>>>,
}

pub(crate) enum Outbound {
    Frame(AMQPFrame),
    /// Tells the I/O thread to flush what it has and exit.
    Shutdown,
}

impl Frames {
    pub(crate) fn push(&self, frame: AMQPFrame) {
        self.inner.lock().push_back(Outbound::Frame(frame));
    }

    pub(crate) fn push_group(&self, frames: Vec<AMQPFrame>) {
        let mut inner = self.inner.lock();
        for frame in frames {
            inner.push_back(Outbound::Frame(frame));
        }
    }

    pub(crate) fn push_shutdown(&self) {
        self.inner.lock().push_back(Outbound::Shutdown);
    }

    pub(crate) fn pop(&self) -> Option<Outbound> {
        self.inner.lock().pop_front()
    }

    #[cfg(test)]
    pub(crate) fn pop_frame(&self) -> Option<AMQPFrame> {
        match self.pop() {
            Some(Outbound::Frame(frame)) => Some(frame),
            _ => None,
        }
    }
}

/// Serializes one frame to wire bytes.
pub(crate) fn serialize_frame(frame: &AMQPFrame) -> Result<Vec<u8>> {
    gen_frame(frame)(Vec::new().into())
        .map(|ctx| ctx.write)
        .map_err(|e| Error::SerialisationError(Arc::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use amq_protocol::frame::ProtocolVersion;

    #[test]
    fn groups_stay_contiguous() {
        let frames = Frames::default();
        frames.push(AMQPFrame::Heartbeat(0));
        frames.push_group(vec![AMQPFrame::Heartbeat(1), AMQPFrame::Body(1, vec![1])]);
        assert!(matches!(frames.pop_frame(), Some(AMQPFrame::Heartbeat(0))));
        assert!(matches!(frames.pop_frame(), Some(AMQPFrame::Heartbeat(1))));
        assert!(matches!(frames.pop_frame(), Some(AMQPFrame::Body(1, _))));
        assert!(frames.pop().is_none());
    }

    #[test]
    fn serializes_the_protocol_header() {
        let bytes =
            serialize_frame(&AMQPFrame::ProtocolHeader(ProtocolVersion::amqp_0_9_1())).unwrap();
        assert_eq!(bytes, b"AMQP\x00\x00\x09\x01");
    }
}
