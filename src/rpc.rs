use crate::{
    consumer::Consumer,
    message::BasicGetMessage,
    types::ShortString,
    wait::{promise, Promise, PromiseResolver},
    Error, Result,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// The decoded payload of a synchronous method reply.
#[derive(Debug)]
pub(crate) enum Reply {
    ChannelOpenOk,
    ChannelFlowOk(bool),
    ChannelCloseOk,
    ExchangeDeclareOk,
    ExchangeDeleteOk,
    ExchangeBindOk,
    ExchangeUnbindOk,
    QueueDeclareOk {
        name: ShortString,
        message_count: u32,
        consumer_count: u32,
    },
    QueueBindOk,
    QueueUnbindOk,
    QueuePurgeOk {
        message_count: u32,
    },
    QueueDeleteOk {
        message_count: u32,
    },
    BasicQosOk,
    BasicConsumeOk(Consumer),
    BasicCancelOk,
    BasicGetOk(Option<BasicGetMessage>),
    BasicRecoverOk,
    TxSelectOk,
    TxCommitOk,
    TxRollbackOk,
    ConfirmSelectOk,
}

/// What the registered waiter is allowed to be woken by.
///
/// Some variants carry request context the I/O thread needs when it builds
/// the reply (e.g. which queue a new consumer belongs to).
#[derive(Debug)]
pub(crate) enum ExpectedReply {
    ChannelOpenOk,
    ChannelFlowOk,
    ChannelCloseOk,
    ExchangeDeclareOk,
    ExchangeDeleteOk,
    ExchangeBindOk,
    ExchangeUnbindOk,
    QueueDeclareOk,
    QueueBindOk,
    QueueUnbindOk,
    QueuePurgeOk,
    QueueDeleteOk,
    BasicQosOk,
    BasicConsumeOk { queue: ShortString, no_ack: bool },
    BasicCancelOk { consumer_tag: ShortString },
    BasicGetOk,
    BasicRecoverOk,
    TxSelectOk,
    TxCommitOk,
    TxRollbackOk,
    ConfirmSelectOk,
}

#[derive(Debug)]
pub(crate) struct PendingRpc {
    pub(crate) expected: ExpectedReply,
    pub(crate) resolver: PromiseResolver<Reply>,
}

/// The single-slot waiter of a channel: at most one RPC is in flight.
#[derive(Clone, Default)]
pub(crate) struct RpcSlot {
    inner: Arc<Mutex<Option<PendingRpc>>>,
}

impl RpcSlot {
    pub(crate) fn register(&self, expected: ExpectedReply) -> Result<Promise<Reply>> {
        let mut slot = self.inner.lock();
        if slot.is_some() {
            return Err(Error::RpcAlreadyRunning);
        }
        let (promise, resolver) = promise();
        *slot = Some(PendingRpc { expected, resolver });
        Ok(promise)
    }

    pub(crate) fn take(&self) -> Option<PendingRpc> {
        self.inner.lock().take()
    }

    /// Forgets the waiter, e.g. after an RPC timeout. A reply arriving
    /// later is logged and dropped by the dispatcher.
    pub(crate) fn forget(&self) {
        self.inner.lock().take();
    }

    pub(crate) fn poison(&self, error: Error) {
        if let Some(pending) = self.take() {
            pending.resolver.resolve(Err(error));
        }
    }
}
