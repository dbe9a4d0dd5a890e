use crate::{message::Delivery, types::ShortString, Error};
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use parking_lot::Mutex;
use tracing::warn;

/// A subscription created by `basic.consume`.
///
/// `Consumer` is a blocking iterator over the deliveries the broker pushes
/// for its consumer-tag, in arrival order. Iteration ends cleanly when the
/// consumer is cancelled (client or broker side) or when its channel
/// closes; it never panics out of a broken connection.
///
/// A `Consumer` can be cloned and moved to another thread; all clones drain
/// the same delivery queue.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    tag: ShortString,
    queue: ShortString,
    no_ack: bool,
    sender: flume::Sender<ConsumerMessage>,
    receiver: flume::Receiver<ConsumerMessage>,
    cancelled: AtomicBool,
}

pub(crate) enum ConsumerMessage {
    Delivery(Box<Delivery>),
    Cancelled,
    Closed(Error),
}

impl Consumer {
    pub(crate) fn new(tag: ShortString, queue: ShortString, no_ack: bool) -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            inner: Arc::new(ConsumerInner {
                tag,
                queue,
                no_ack,
                sender,
                receiver,
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    pub fn tag(&self) -> &ShortString {
        &self.inner.tag
    }

    pub fn queue(&self) -> &ShortString {
        &self.inner.queue
    }

    pub fn no_ack(&self) -> bool {
        self.inner.no_ack
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Blocks for the next delivery; `None` once the subscription ended.
    pub fn recv(&self) -> Option<Delivery> {
        match self.inner.receiver.recv() {
            Ok(ConsumerMessage::Delivery(delivery)) => Some(*delivery),
            Ok(message @ ConsumerMessage::Cancelled) | Ok(message @ ConsumerMessage::Closed(_)) => {
                // recycle the terminal marker so every later recv sees it
                let _ = self.inner.sender.send(message);
                None
            }
            Err(_) => None,
        }
    }

    pub(crate) fn deliver(&self, delivery: Delivery) {
        let _ = self
            .inner
            .sender
            .send(ConsumerMessage::Delivery(Box::new(delivery)));
    }

    pub(crate) fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let _ = self.inner.sender.send(ConsumerMessage::Cancelled);
    }

    pub(crate) fn close(&self, error: Error) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let _ = self.inner.sender.send(ConsumerMessage::Closed(error));
    }
}

impl Iterator for Consumer {
    type Item = Delivery;

    fn next(&mut self) -> Option<Delivery> {
        self.recv()
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("tag", &self.inner.tag)
            .field("queue", &self.inner.queue)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// The consumer-tag registry of one channel.
#[derive(Clone, Default)]
pub(crate) struct Consumers {
    inner: Arc<Mutex<HashMap<ShortString, Consumer>>>,
}

impl Consumers {
    pub(crate) fn register(&self, tag: ShortString, consumer: Consumer) {
        if let Some(previous) = self.inner.lock().insert(tag, consumer) {
            warn!(
                "duplicate consumer tag {}, dropping previous consumer",
                previous.tag().as_str()
            );
            previous.cancel();
        }
    }

    pub(crate) fn deliver(&self, tag: &str, delivery: Delivery) {
        match self.inner.lock().get(tag) {
            Some(consumer) => consumer.deliver(delivery),
            None => warn!("delivery for unknown consumer tag {}, dropping it", tag),
        }
    }

    pub(crate) fn cancel(&self, tag: &str) -> Option<Consumer> {
        let consumer = self.inner.lock().remove(tag);
        if let Some(consumer) = &consumer {
            consumer.cancel();
        }
        consumer
    }

    pub(crate) fn cancel_all(&self) {
        for (_, consumer) in self.inner.lock().drain() {
            consumer.cancel();
        }
    }

    pub(crate) fn poison(&self, error: Error) {
        for (_, consumer) in self.inner.lock().drain() {
            consumer.close(error.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acker::Acker;

    fn delivery(tag: u64) -> Delivery {
        Delivery {
            delivery_tag: tag,
            exchange: "".into(),
            routing_key: "q".into(),
            redelivered: false,
            properties: Default::default(),
            data: vec![],
            acker: Acker::default(),
        }
    }

    #[test]
    fn deliveries_come_out_in_order_then_cancel_ends_iteration() {
        let mut consumer = Consumer::new("ctag".into(), "q".into(), false);
        consumer.deliver(delivery(1));
        consumer.deliver(delivery(2));
        consumer.cancel();
        assert_eq!(consumer.next().unwrap().delivery_tag, 1);
        assert_eq!(consumer.next().unwrap().delivery_tag, 2);
        assert!(consumer.next().is_none());
        assert!(consumer.is_cancelled());
    }

    #[test]
    fn channel_failure_ends_iteration() {
        let mut consumer = Consumer::new("ctag".into(), "q".into(), false);
        consumer.close(Error::RpcTimeout);
        assert!(consumer.next().is_none());
    }

    #[test]
    fn registry_routes_by_tag() {
        let consumers = Consumers::default();
        let consumer = Consumer::new("ctag".into(), "q".into(), false);
        consumers.register("ctag".into(), consumer.clone());
        consumers.deliver("ctag", delivery(1));
        consumers.deliver("other", delivery(2));
        assert_eq!(consumer.recv().unwrap().delivery_tag, 1);
        consumers.cancel_all();
        assert!(consumer.recv().is_none());
    }
}
