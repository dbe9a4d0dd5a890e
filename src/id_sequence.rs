use crate::{Error, Result};
use parking_lot::Mutex;
use std::{collections::BTreeSet, sync::Arc};

/// Monotonic counter for outbound delivery-tags.
///
/// Starts over at 1 after a [`reset`](IdSequence::reset), mirroring the
/// broker numbering once publisher confirms are enabled.
#[derive(Clone, Debug, Default)]
pub(crate) struct IdSequence {
    inner: Arc<Mutex<u64>>,
}

impl IdSequence {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next(&self) -> u64 {
        let mut id = self.inner.lock();
        *id += 1;
        *id
    }

    pub(crate) fn reset(&self) {
        *self.inner.lock() = 0;
    }
}

/// Channel-id allocator over `[1, channel_max]`.
///
/// Hands out the lowest free id: released ids are always lower than the
/// next fresh one, so they are reused first.
#[derive(Debug, Default)]
pub(crate) struct ChannelIds {
    next: u16,
    released: BTreeSet<u16>,
}

impl ChannelIds {
    pub(crate) fn allocate(&mut self, channel_max: u16) -> Result<u16> {
        if let Some(&id) = self.released.iter().next() {
            self.released.remove(&id);
            return Ok(id);
        }
        if self.next >= channel_max {
            return Err(Error::ChannelsLimitReached);
        }
        self.next += 1;
        Ok(self.next)
    }

    pub(crate) fn release(&mut self, id: u16) {
        if id != 0 && id <= self.next {
            self.released.insert(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_starts_at_one() {
        let sequence = IdSequence::new();
        assert_eq!(sequence.next(), 1);
        assert_eq!(sequence.next(), 2);
        sequence.reset();
        assert_eq!(sequence.next(), 1);
    }

    #[test]
    fn allocates_lowest_free_id() {
        let mut ids = ChannelIds::default();
        assert_eq!(ids.allocate(10).unwrap(), 1);
        assert_eq!(ids.allocate(10).unwrap(), 2);
        assert_eq!(ids.allocate(10).unwrap(), 3);
        ids.release(2);
        assert_eq!(ids.allocate(10).unwrap(), 2);
        assert_eq!(ids.allocate(10).unwrap(), 4);
    }

    #[test]
    fn refuses_when_id_space_is_exhausted() {
        let mut ids = ChannelIds::default();
        assert_eq!(ids.allocate(2).unwrap(), 1);
        assert_eq!(ids.allocate(2).unwrap(), 2);
        assert!(matches!(ids.allocate(2), Err(Error::ChannelsLimitReached)));
        ids.release(1);
        assert_eq!(ids.allocate(2).unwrap(), 1);
    }
}
