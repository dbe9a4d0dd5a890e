use crate::{message::BasicReturnMessage, Error, Result};
use amq_protocol::protocol::{AMQPError, AMQPSoftError};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::Arc,
};

/// Outcome of a single confirmed publish.
#[derive(Debug)]
pub(crate) enum Confirmation {
    Ack,
    Nack,
    Returned(Box<BasicReturnMessage>),
}

/// The publisher-confirms ledger of one channel.
///
/// Publishing threads register their delivery-tag and park in [`wait`];
/// the I/O thread resolves tags as `basic.ack`/`basic.nack` frames arrive.
/// `basic.return` carries no delivery-tag, but the broker sends each
/// return before the ack of the publish it rejected, so completed returns
/// are queued in arrival order and matched to acks FIFO.
///
/// [`wait`]: Acknowledgements::wait
#[derive(Clone, Default)]
pub(crate) struct Acknowledgements {
    inner: Arc<AckInner>,
}

#[derive(Default)]
struct AckInner {
    state: Mutex<AckState>,
    cond: Condvar,
}

#[derive(Default)]
struct AckState {
    pending: BTreeSet<u64>,
    resolved: BTreeMap<u64, Confirmation>,
    returned: VecDeque<Box<BasicReturnMessage>>,
    poison: Option<Error>,
}

impl Acknowledgements {
    pub(crate) fn register(&self, delivery_tag: u64) {
        self.inner.state.lock().pending.insert(delivery_tag);
    }

    pub(crate) fn on_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.resolve(delivery_tag, multiple, true)
    }

    pub(crate) fn on_nack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.resolve(delivery_tag, multiple, false)
    }

    pub(crate) fn record_returned(&self, message: BasicReturnMessage) {
        self.inner
            .state
            .lock()
            .returned
            .push_back(Box::new(message));
    }

    fn resolve(&self, delivery_tag: u64, multiple: bool, ack: bool) -> Result<()> {
        let mut state = self.inner.state.lock();
        if multiple {
            let tags: Vec<u64> = if delivery_tag == 0 {
                state.pending.iter().copied().collect()
            } else {
                state
                    .pending
                    .range(..=delivery_tag)
                    .copied()
                    .collect()
            };
            for tag in tags {
                Self::resolve_one(&mut state, tag, ack);
            }
        } else {
            if !state.pending.contains(&delivery_tag) {
                return Err(Error::ProtocolError(AMQPError::new(
                    AMQPSoftError::PRECONDITIONFAILED.into(),
                    format!("unknown delivery tag {}", delivery_tag).into(),
                )));
            }
            Self::resolve_one(&mut state, delivery_tag, ack);
        }
        self.inner.cond.notify_all();
        Ok(())
    }

    fn resolve_one(state: &mut AckState, delivery_tag: u64, ack: bool) {
        state.pending.remove(&delivery_tag);
        let confirmation = if ack {
            match state.returned.pop_front() {
                Some(message) => Confirmation::Returned(message),
                None => Confirmation::Ack,
            }
        } else {
            Confirmation::Nack
        };
        state.resolved.insert(delivery_tag, confirmation);
    }

    /// Blocks the publishing thread until its tag is resolved or the
    /// channel fails.
    pub(crate) fn wait(&self, delivery_tag: u64) -> Result<Confirmation> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(confirmation) = state.resolved.remove(&delivery_tag) {
                return Ok(confirmation);
            }
            if let Some(error) = state.poison.clone() {
                return Err(error);
            }
            self.inner.cond.wait(&mut state);
        }
    }

    pub(crate) fn poison(&self, error: Error) {
        let mut state = self.inner.state.lock();
        if state.poison.is_none() {
            state.poison = Some(error);
        }
        self.inner.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn single_ack_resolves_its_tag() {
        let acks = Acknowledgements::default();
        acks.register(1);
        acks.on_ack(1, false).unwrap();
        assert!(matches!(acks.wait(1).unwrap(), Confirmation::Ack));
    }

    #[test]
    fn multiple_ack_resolves_everything_below() {
        let acks = Acknowledgements::default();
        for tag in 1..=3 {
            acks.register(tag);
        }
        acks.on_ack(2, true).unwrap();
        assert!(matches!(acks.wait(1).unwrap(), Confirmation::Ack));
        assert!(matches!(acks.wait(2).unwrap(), Confirmation::Ack));
        acks.on_nack(3, false).unwrap();
        assert!(matches!(acks.wait(3).unwrap(), Confirmation::Nack));
    }

    #[test]
    fn zero_tag_multiple_ack_resolves_all_pending() {
        let acks = Acknowledgements::default();
        acks.register(1);
        acks.register(2);
        acks.on_ack(0, true).unwrap();
        assert!(matches!(acks.wait(1).unwrap(), Confirmation::Ack));
        assert!(matches!(acks.wait(2).unwrap(), Confirmation::Ack));
    }

    #[test]
    fn unknown_tag_is_a_protocol_error() {
        let acks = Acknowledgements::default();
        assert!(matches!(
            acks.on_ack(7, false),
            Err(Error::ProtocolError(_))
        ));
    }

    fn no_route(routing_key: &str) -> BasicReturnMessage {
        BasicReturnMessage {
            reply_code: 312,
            reply_text: "NO_ROUTE".into(),
            exchange: "amq.direct".into(),
            routing_key: routing_key.into(),
            properties: Default::default(),
            data: b"hello".to_vec(),
        }
    }

    #[test]
    fn returned_message_rides_on_the_next_ack() {
        let acks = Acknowledgements::default();
        acks.register(1);
        acks.record_returned(no_route("nosuch"));
        acks.on_ack(1, false).unwrap();
        match acks.wait(1).unwrap() {
            Confirmation::Returned(message) => assert_eq!(message.reply_code, 312),
            other => panic!("expected returned confirmation, got {:?}", other),
        }
    }

    #[test]
    fn concurrent_returns_match_their_acks_in_order() {
        // two publishes pending at once, both returned: the returns have no
        // delivery-tag, they pair up with the acks FIFO
        let acks = Acknowledgements::default();
        acks.register(1);
        acks.register(2);
        acks.record_returned(no_route("first"));
        acks.record_returned(no_route("second"));
        acks.on_ack(1, false).unwrap();
        acks.on_ack(2, false).unwrap();
        match acks.wait(1).unwrap() {
            Confirmation::Returned(message) => assert_eq!(message.routing_key, "first".into()),
            other => panic!("expected returned confirmation, got {:?}", other),
        }
        match acks.wait(2).unwrap() {
            Confirmation::Returned(message) => assert_eq!(message.routing_key, "second".into()),
            other => panic!("expected returned confirmation, got {:?}", other),
        }
    }

    #[test]
    fn poison_wakes_a_parked_publisher() {
        let acks = Acknowledgements::default();
        acks.register(1);
        let waiter = acks.clone();
        let handle = thread::spawn(move || waiter.wait(1));
        thread::sleep(Duration::from_millis(20));
        acks.poison(Error::RpcTimeout);
        assert!(handle.join().unwrap().is_err());
    }
}
