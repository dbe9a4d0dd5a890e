use crate::{channel::Channel, id_sequence::ChannelIds, Error, Result};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

/// The id → channel map shared between the connection and the I/O thread.
///
/// The lock is only held for allocation, registration, lookup and release;
/// frame handling happens on the `Channel` clones it hands out.
#[derive(Clone, Default)]
pub(crate) struct Channels {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    channels: HashMap<u16, Channel>,
    ids: ChannelIds,
}

impl Channels {
    pub(crate) fn allocate_id(&self, channel_max: u16) -> Result<u16> {
        self.inner.lock().ids.allocate(channel_max)
    }

    pub(crate) fn register(&self, channel: Channel) {
        self.inner.lock().channels.insert(channel.id(), channel);
    }

    pub(crate) fn get(&self, id: u16) -> Option<Channel> {
        self.inner.lock().channels.get(&id).cloned()
    }

    /// Removes a closed channel and returns its id to the allocator.
    pub(crate) fn remove(&self, id: u16) {
        let mut inner = self.inner.lock();
        if inner.channels.remove(&id).is_some() {
            inner.ids.release(id);
        }
    }

    /// Channels currently worth closing gracefully.
    pub(crate) fn open_channels(&self) -> Vec<Channel> {
        self.inner
            .lock()
            .channels
            .values()
            .filter(|channel| channel.status().connected())
            .cloned()
            .collect()
    }

    /// Kills every channel after a connection-level failure.
    pub(crate) fn poison(&self, error: Error) {
        let channels: Vec<Channel> = {
            let mut inner = self.inner.lock();
            inner.channels.drain().map(|(_, channel)| channel).collect()
        };
        for channel in channels {
            channel.poison(error.clone());
        }
    }
}
