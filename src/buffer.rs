use crate::{Error, Result};
use amq_protocol::frame::{parse_frame, AMQPFrame};

/// Inbound byte accumulator the I/O thread parses frames out of.
pub(crate) struct ReadBuffer {
    data: Vec<u8>,
    start: usize,
}

impl ReadBuffer {
    pub(crate) fn new() -> Self {
        Self {
            data: Vec::with_capacity(16384),
            start: 0,
        }
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Pops the next complete frame, `None` while bytes are still missing.
    pub(crate) fn parse(&mut self) -> Result<Option<AMQPFrame>> {
        if self.start >= self.data.len() {
            self.compact();
            return Ok(None);
        }
        let available = self.data.len() - self.start;
        match parse_frame(&self.data[self.start..]) {
            Ok((remaining, frame)) => {
                self.start += available - remaining.len();
                Ok(Some(frame))
            }
            Err(e) => {
                if e.is_incomplete() {
                    self.compact();
                    Ok(None)
                } else {
                    Err(Error::ParsingError(format!("{:?}", e)))
                }
            }
        }
    }

    fn compact(&mut self) {
        if self.start == self.data.len() {
            self.data.clear();
            self.start = 0;
        } else if self.start > 16384 {
            self.data.drain(..self.start);
            self.start = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::serialize_frame;

    #[test]
    fn parses_a_complete_frame() {
        let bytes = serialize_frame(&AMQPFrame::Heartbeat(0)).unwrap();
        let mut buffer = ReadBuffer::new();
        buffer.extend(&bytes);
        assert!(matches!(
            buffer.parse().unwrap(),
            Some(AMQPFrame::Heartbeat(0))
        ));
        assert!(buffer.parse().unwrap().is_none());
    }

    #[test]
    fn waits_for_missing_bytes() {
        let bytes = serialize_frame(&AMQPFrame::Body(1, b"payload".to_vec())).unwrap();
        let mut buffer = ReadBuffer::new();
        buffer.extend(&bytes[..4]);
        assert!(buffer.parse().unwrap().is_none());
        buffer.extend(&bytes[4..]);
        match buffer.parse().unwrap() {
            Some(AMQPFrame::Body(1, payload)) => assert_eq!(payload, b"payload"),
            other => panic!("expected body frame, got {:?}", other),
        }
    }

    #[test]
    fn parses_back_to_back_frames() {
        let mut bytes = serialize_frame(&AMQPFrame::Heartbeat(0)).unwrap();
        bytes.extend(serialize_frame(&AMQPFrame::Body(3, b"x".to_vec())).unwrap());
        let mut buffer = ReadBuffer::new();
        buffer.extend(&bytes);
        assert!(matches!(
            buffer.parse().unwrap(),
            Some(AMQPFrame::Heartbeat(0))
        ));
        assert!(matches!(buffer.parse().unwrap(), Some(AMQPFrame::Body(3, _))));
        assert!(buffer.parse().unwrap().is_none());
    }
}
