use crate::{
    acker::Acker,
    acknowledgements::{Acknowledgements, Confirmation},
    channel_status::{ChannelState, ChannelStatus},
    configuration::Configuration,
    connection_status::ConnectionStatus,
    consumer::{Consumer, Consumers},
    error::CloseReason,
    exchange::ExchangeKind,
    frames::Frames,
    id_sequence::IdSequence,
    io_loop::IoWaker,
    message::{content_frames, BasicGetMessage, BasicReturnMessage, Delivery},
    options::*,
    queue::Queue,
    rpc::{ExpectedReply, PendingRpc, Reply, RpcSlot},
    types::{AMQPValue, FieldTable, ShortString},
    wait::PromiseResolver,
    BasicProperties, Error, Result,
};
use amq_protocol::{
    frame::AMQPFrame,
    protocol::{self, AMQPClass, AMQPError, AMQPHardError},
};
use parking_lot::Mutex;
use std::{convert::TryFrom, fmt, sync::Arc, time::Duration};
use tracing::{debug, error, trace, warn};

/// Main entry point for most AMQP operations.
///
/// A `Channel` is a lightweight logical session multiplexed over a
/// [`Connection`], obtained from [`Connection::channel`]. It owns the
/// synchronous RPC machinery: every operation encodes its method frame,
/// hands it to the I/O thread and parks the calling thread until the reply
/// arrives.
///
/// A channel carries at most one RPC at a time; issuing a second one from
/// another thread fails with [`Error::RpcAlreadyRunning`]. Use one channel
/// per thread; channels of the same connection are independent.
///
/// Dropping the last application handle of an open channel sends a
/// best-effort `channel.close`.
///
/// [`Connection`]: crate::Connection
/// [`Connection::channel`]: crate::Connection::channel
#[derive(Clone)]
pub struct Channel {
    id: u16,
    configuration: Configuration,
    status: ChannelStatus,
    connection_status: ConnectionStatus,
    frames: Frames,
    waker: IoWaker,
    rpc: RpcSlot,
    acknowledgements: Acknowledgements,
    delivery_tag: IdSequence,
    consumers: Consumers,
    receive: ContentAccumulator,
    _closer: Option<Arc<ChannelCloser>>,
}

impl Channel {
    pub(crate) fn new(
        id: u16,
        configuration: Configuration,
        connection_status: ConnectionStatus,
        frames: Frames,
        waker: IoWaker,
    ) -> Channel {
        let status = ChannelStatus::new();
        let closer = ChannelCloser {
            id,
            status: status.clone(),
            frames: frames.clone(),
            waker: waker.clone(),
        };
        Channel {
            id,
            configuration,
            status,
            connection_status,
            frames,
            waker,
            rpc: RpcSlot::default(),
            acknowledgements: Acknowledgements::default(),
            delivery_tag: IdSequence::new(),
            consumers: Consumers::default(),
            receive: ContentAccumulator::default(),
            _closer: Some(Arc::new(closer)),
        }
    }

    /// A clone for the I/O side, without the close-on-drop handle.
    pub(crate) fn clone_internal(&self) -> Channel {
        Channel {
            _closer: None,
            ..self.clone()
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn status(&self) -> &ChannelStatus {
        &self.status
    }

    /// Deadline applied to every subsequent RPC on this channel.
    /// `None` (the default) blocks until the broker answers.
    pub fn set_rpc_timeout(&self, timeout: Option<Duration>) {
        self.status.set_rpc_timeout(timeout);
    }

    /// Closes the channel and waits for the server's `channel.close-ok`.
    pub fn close(&self, reply_code: u16, reply_text: &str) -> Result<()> {
        if !self.status.begin_close() {
            return Ok(());
        }
        self.rpc
            .poison(Error::InvalidChannelState(ChannelState::Closing));
        self.rpc_unchecked(
            AMQPClass::Channel(protocol::channel::AMQPMethod::Close(
                protocol::channel::Close {
                    reply_code,
                    reply_text: reply_text.into(),
                    class_id: 0,
                    method_id: 0,
                },
            )),
            ExpectedReply::ChannelCloseOk,
        )
        .map(|_| ())
    }

    /// Pauses or resumes the broker-to-client delivery flow.
    pub fn channel_flow(&self, active: bool) -> Result<bool> {
        match self.rpc(
            AMQPClass::Channel(protocol::channel::AMQPMethod::Flow(
                protocol::channel::Flow { active },
            )),
            ExpectedReply::ChannelFlowOk,
        )? {
            Reply::ChannelFlowOk(active) => Ok(active),
            reply => Err(mismatched_reply(reply)),
        }
    }

    pub fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<()> {
        self.rpc(
            AMQPClass::Exchange(protocol::exchange::AMQPMethod::Declare(
                protocol::exchange::Declare {
                    exchange: exchange.into(),
                    kind: kind.kind(),
                    passive: options.passive,
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    nowait: false,
                    arguments,
                },
            )),
            ExpectedReply::ExchangeDeclareOk,
        )
        .map(|_| ())
    }

    pub fn exchange_delete(&self, exchange: &str, options: ExchangeDeleteOptions) -> Result<()> {
        self.rpc(
            AMQPClass::Exchange(protocol::exchange::AMQPMethod::Delete(
                protocol::exchange::Delete {
                    exchange: exchange.into(),
                    if_unused: options.if_unused,
                    nowait: false,
                },
            )),
            ExpectedReply::ExchangeDeleteOk,
        )
        .map(|_| ())
    }

    pub fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        self.rpc(
            AMQPClass::Exchange(protocol::exchange::AMQPMethod::Bind(
                protocol::exchange::Bind {
                    destination: destination.into(),
                    source: source.into(),
                    routing_key: routing_key.into(),
                    nowait: false,
                    arguments,
                },
            )),
            ExpectedReply::ExchangeBindOk,
        )
        .map(|_| ())
    }

    pub fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        self.rpc(
            AMQPClass::Exchange(protocol::exchange::AMQPMethod::Unbind(
                protocol::exchange::Unbind {
                    destination: destination.into(),
                    source: source.into(),
                    routing_key: routing_key.into(),
                    nowait: false,
                    arguments,
                },
            )),
            ExpectedReply::ExchangeUnbindOk,
        )
        .map(|_| ())
    }

    pub fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<Queue> {
        match self.rpc(
            AMQPClass::Queue(protocol::queue::AMQPMethod::Declare(
                protocol::queue::Declare {
                    queue: queue.into(),
                    passive: options.passive,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                    arguments: arguments.clone(),
                },
            )),
            ExpectedReply::QueueDeclareOk,
        )? {
            Reply::QueueDeclareOk {
                name,
                message_count,
                consumer_count,
            } => Ok(Queue::new(
                self.clone(),
                name,
                message_count,
                consumer_count,
                options,
                arguments,
            )),
            reply => Err(mismatched_reply(reply)),
        }
    }

    pub fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        self.rpc(
            AMQPClass::Queue(protocol::queue::AMQPMethod::Bind(protocol::queue::Bind {
                queue: queue.into(),
                exchange: exchange.into(),
                routing_key: routing_key.into(),
                nowait: false,
                arguments,
            })),
            ExpectedReply::QueueBindOk,
        )
        .map(|_| ())
    }

    pub fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        self.rpc(
            AMQPClass::Queue(protocol::queue::AMQPMethod::Unbind(
                protocol::queue::Unbind {
                    queue: queue.into(),
                    exchange: exchange.into(),
                    routing_key: routing_key.into(),
                    arguments,
                },
            )),
            ExpectedReply::QueueUnbindOk,
        )
        .map(|_| ())
    }

    /// Drops every message of the queue, returning how many there were.
    pub fn queue_purge(&self, queue: &str) -> Result<u32> {
        match self.rpc(
            AMQPClass::Queue(protocol::queue::AMQPMethod::Purge(protocol::queue::Purge {
                queue: queue.into(),
                nowait: false,
            })),
            ExpectedReply::QueuePurgeOk,
        )? {
            Reply::QueuePurgeOk { message_count } => Ok(message_count),
            reply => Err(mismatched_reply(reply)),
        }
    }

    pub fn queue_delete(&self, queue: &str, options: QueueDeleteOptions) -> Result<u32> {
        match self.rpc(
            AMQPClass::Queue(protocol::queue::AMQPMethod::Delete(
                protocol::queue::Delete {
                    queue: queue.into(),
                    if_unused: options.if_unused,
                    if_empty: options.if_empty,
                    nowait: false,
                },
            )),
            ExpectedReply::QueueDeleteOk,
        )? {
            Reply::QueueDeleteOk { message_count } => Ok(message_count),
            reply => Err(mismatched_reply(reply)),
        }
    }

    pub fn basic_qos(&self, options: BasicQosOptions) -> Result<()> {
        self.rpc(
            AMQPClass::Basic(protocol::basic::AMQPMethod::Qos(protocol::basic::Qos {
                prefetch_count: options.prefetch_count,
                global: options.global,
            })),
            ExpectedReply::BasicQosOk,
        )
        .map(|_| ())
    }

    /// Subscribes to a queue.
    ///
    /// An empty `consumer_tag` lets the broker assign one; the effective
    /// tag is available on the returned [`Consumer`]. When
    /// `options.prefetch_count` is set, a `basic.qos` is issued first.
    pub fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> Result<Consumer> {
        if let Some(prefetch_count) = options.prefetch_count {
            self.basic_qos(BasicQosOptions {
                prefetch_count,
                global: false,
            })?;
        }
        let mut arguments = arguments;
        if let Some(priority) = options.priority {
            arguments.insert("x-priority".into(), AMQPValue::LongInt(priority));
        }
        match self.rpc(
            AMQPClass::Basic(protocol::basic::AMQPMethod::Consume(
                protocol::basic::Consume {
                    queue: queue.into(),
                    consumer_tag: consumer_tag.into(),
                    no_local: options.no_local,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                    arguments,
                },
            )),
            ExpectedReply::BasicConsumeOk {
                queue: queue.into(),
                no_ack: options.no_ack,
            },
        )? {
            Reply::BasicConsumeOk(consumer) => Ok(consumer),
            reply => Err(mismatched_reply(reply)),
        }
    }

    pub fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.rpc(
            AMQPClass::Basic(protocol::basic::AMQPMethod::Cancel(
                protocol::basic::Cancel {
                    consumer_tag: consumer_tag.into(),
                    nowait: false,
                },
            )),
            ExpectedReply::BasicCancelOk {
                consumer_tag: consumer_tag.into(),
            },
        )
        .map(|_| ())
    }

    /// Polls the queue for one message.
    pub fn basic_get(
        &self,
        queue: &str,
        options: BasicGetOptions,
    ) -> Result<Option<BasicGetMessage>> {
        match self.rpc(
            AMQPClass::Basic(protocol::basic::AMQPMethod::Get(protocol::basic::Get {
                queue: queue.into(),
                no_ack: options.no_ack,
            })),
            ExpectedReply::BasicGetOk,
        )? {
            Reply::BasicGetOk(message) => Ok(message),
            reply => Err(mismatched_reply(reply)),
        }
    }

    /// Publishes a message.
    ///
    /// Fire-and-forget (and transactional) publishes return `Ok(true)`
    /// immediately. With publisher confirms enabled the call blocks for the
    /// broker's verdict: `Ok(true)` on ack, `Ok(false)` on nack, and
    /// [`Error::MessageReturned`] when a mandatory or immediate publish
    /// came back unrouted.
    ///
    /// While the server has the channel paused with `channel.flow`, the
    /// call blocks until the flow resumes.
    pub fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<bool> {
        self.status.check_open()?;
        self.status.wait_send_flow()?;
        if self.connection_status.blocked() {
            // informational only, the broker will park the publish
            debug!(
                "publishing on channel {} while the connection is blocked",
                self.id
            );
        }

        let confirm_tag = if self.status.confirm() {
            let delivery_tag = self.delivery_tag.next();
            self.acknowledgements.register(delivery_tag);
            Some(delivery_tag)
        } else {
            None
        };

        let method = AMQPClass::Basic(protocol::basic::AMQPMethod::Publish(
            protocol::basic::Publish {
                exchange: exchange.into(),
                routing_key: routing_key.into(),
                mandatory: options.mandatory,
                immediate: options.immediate,
            },
        ));
        trace!("channel {} publish, confirm tag {:?}", self.id, confirm_tag);
        self.frames.push_group(content_frames(
            self.id,
            method,
            payload,
            self.configuration.frame_max(),
            properties,
        ));
        self.waker.wake()?;

        match confirm_tag {
            None => Ok(true),
            Some(delivery_tag) => match self.acknowledgements.wait(delivery_tag)? {
                Confirmation::Ack => Ok(true),
                Confirmation::Nack => Ok(false),
                Confirmation::Returned(message) => Err(Error::MessageReturned(message)),
            },
        }
    }

    pub fn basic_ack(&self, delivery_tag: u64, options: BasicAckOptions) -> Result<()> {
        self.status.check_open()?;
        self.send_method_frame(AMQPClass::Basic(protocol::basic::AMQPMethod::Ack(
            protocol::basic::Ack {
                delivery_tag,
                multiple: options.multiple,
            },
        )))
    }

    pub fn basic_nack(&self, delivery_tag: u64, options: BasicNackOptions) -> Result<()> {
        self.status.check_open()?;
        self.send_method_frame(AMQPClass::Basic(protocol::basic::AMQPMethod::Nack(
            protocol::basic::Nack {
                delivery_tag,
                multiple: options.multiple,
                requeue: options.requeue,
            },
        )))
    }

    pub fn basic_reject(&self, delivery_tag: u64, options: BasicRejectOptions) -> Result<()> {
        self.status.check_open()?;
        self.send_method_frame(AMQPClass::Basic(protocol::basic::AMQPMethod::Reject(
            protocol::basic::Reject {
                delivery_tag,
                requeue: options.requeue,
            },
        )))
    }

    /// Asks the broker to redeliver every unacknowledged message of this
    /// channel.
    pub fn basic_recover(&self, requeue: bool) -> Result<()> {
        self.rpc(
            AMQPClass::Basic(protocol::basic::AMQPMethod::Recover(
                protocol::basic::Recover { requeue },
            )),
            ExpectedReply::BasicRecoverOk,
        )
        .map(|_| ())
    }

    /// Puts the channel in publisher-confirms mode.
    ///
    /// Confirms and transactions are mutually exclusive on one channel.
    pub fn confirm_select(&self) -> Result<()> {
        if self.status.transactional() {
            return Err(Error::NotSupported(
                "publisher confirms on a transactional channel",
            ));
        }
        if self.status.confirm() {
            return Ok(());
        }
        self.rpc(
            AMQPClass::Confirm(protocol::confirm::AMQPMethod::Select(
                protocol::confirm::Select { nowait: false },
            )),
            ExpectedReply::ConfirmSelectOk,
        )
        .map(|_| ())
    }

    /// Puts the channel in transactional mode.
    pub fn tx_select(&self) -> Result<()> {
        if self.status.confirm() {
            return Err(Error::NotSupported(
                "transactions on a confirms-mode channel",
            ));
        }
        if self.status.transactional() {
            return Ok(());
        }
        self.rpc(
            AMQPClass::Tx(protocol::tx::AMQPMethod::Select(protocol::tx::Select {})),
            ExpectedReply::TxSelectOk,
        )
        .map(|_| ())
    }

    pub fn tx_commit(&self) -> Result<()> {
        self.rpc(
            AMQPClass::Tx(protocol::tx::AMQPMethod::Commit(protocol::tx::Commit {})),
            ExpectedReply::TxCommitOk,
        )
        .map(|_| ())
    }

    pub fn tx_rollback(&self) -> Result<()> {
        self.rpc(
            AMQPClass::Tx(protocol::tx::AMQPMethod::Rollback(
                protocol::tx::Rollback {},
            )),
            ExpectedReply::TxRollbackOk,
        )
        .map(|_| ())
    }

    // Wire plumbing, application side.

    pub(crate) fn open(&self) -> Result<()> {
        self.rpc_unchecked(
            AMQPClass::Channel(protocol::channel::AMQPMethod::Open(
                protocol::channel::Open {},
            )),
            ExpectedReply::ChannelOpenOk,
        )
        .map(|_| ())
    }

    fn rpc(&self, method: AMQPClass, expected: ExpectedReply) -> Result<Reply> {
        self.status.check_open()?;
        self.rpc_unchecked(method, expected)
    }

    fn rpc_unchecked(&self, method: AMQPClass, expected: ExpectedReply) -> Result<Reply> {
        let promise = self.rpc.register(expected)?;
        if let Err(error) = self.send_method_frame(method) {
            self.rpc.forget();
            return Err(error);
        }
        match promise.wait_timeout(self.status.rpc_timeout()) {
            Err(Error::RpcTimeout) => {
                self.rpc.forget();
                Err(Error::RpcTimeout)
            }
            res => res,
        }
    }

    fn send_method_frame(&self, method: AMQPClass) -> Result<()> {
        trace!("channel {} send_method_frame", self.id);
        self.frames.push(AMQPFrame::Method(self.id, method));
        self.waker.wake()
    }

    fn acker(&self, delivery_tag: u64) -> Acker {
        Acker::new(
            self.id,
            delivery_tag,
            self.frames.clone(),
            self.waker.clone(),
            self.status.clone(),
        )
    }

    /// Kills every waiter after a connection-level failure.
    pub(crate) fn poison(&self, error: Error) {
        self.status.set_close_reason(error.clone());
        self.status.set_state(ChannelState::RemoteClosed);
        self.rpc.poison(error.clone());
        self.acknowledgements.poison(error.clone());
        self.consumers.poison(error);
        self.receive.clear();
    }

    // Inbound dispatch, I/O thread side.

    pub(crate) fn handle_method(&self, method: AMQPClass) -> Result<()> {
        trace!("channel {} received {:?}", self.id, method);
        use protocol::basic::AMQPMethod as Basic;
        use protocol::channel::AMQPMethod as Chan;
        use protocol::confirm::AMQPMethod as Confirm;
        use protocol::exchange::AMQPMethod as Exchange;
        use protocol::queue::AMQPMethod as Que;
        use protocol::tx::AMQPMethod as Tx;
        match method {
            AMQPClass::Channel(Chan::OpenOk(_)) => self.on_channel_open_ok(),
            AMQPClass::Channel(Chan::Flow(m)) => self.on_channel_flow(m),
            AMQPClass::Channel(Chan::FlowOk(m)) => self.on_channel_flow_ok(m),
            AMQPClass::Channel(Chan::Close(m)) => self.on_channel_close(m),
            AMQPClass::Channel(Chan::CloseOk(_)) => self.on_channel_close_ok(),
            AMQPClass::Exchange(Exchange::DeclareOk(_)) => {
                self.resolve("exchange.declare-ok", Reply::ExchangeDeclareOk)
            }
            AMQPClass::Exchange(Exchange::DeleteOk(_)) => {
                self.resolve("exchange.delete-ok", Reply::ExchangeDeleteOk)
            }
            AMQPClass::Exchange(Exchange::BindOk(_)) => {
                self.resolve("exchange.bind-ok", Reply::ExchangeBindOk)
            }
            AMQPClass::Exchange(Exchange::UnbindOk(_)) => {
                self.resolve("exchange.unbind-ok", Reply::ExchangeUnbindOk)
            }
            AMQPClass::Queue(Que::DeclareOk(m)) => self.resolve(
                "queue.declare-ok",
                Reply::QueueDeclareOk {
                    name: m.queue,
                    message_count: m.message_count,
                    consumer_count: m.consumer_count,
                },
            ),
            AMQPClass::Queue(Que::BindOk(_)) => self.resolve("queue.bind-ok", Reply::QueueBindOk),
            AMQPClass::Queue(Que::UnbindOk(_)) => {
                self.resolve("queue.unbind-ok", Reply::QueueUnbindOk)
            }
            AMQPClass::Queue(Que::PurgeOk(m)) => self.resolve(
                "queue.purge-ok",
                Reply::QueuePurgeOk {
                    message_count: m.message_count,
                },
            ),
            AMQPClass::Queue(Que::DeleteOk(m)) => self.resolve(
                "queue.delete-ok",
                Reply::QueueDeleteOk {
                    message_count: m.message_count,
                },
            ),
            AMQPClass::Basic(Basic::QosOk(_)) => self.resolve("basic.qos-ok", Reply::BasicQosOk),
            AMQPClass::Basic(Basic::ConsumeOk(m)) => self.on_basic_consume_ok(m),
            AMQPClass::Basic(Basic::CancelOk(m)) => self.on_basic_cancel_ok(m),
            AMQPClass::Basic(Basic::Cancel(m)) => self.on_basic_cancel(m),
            AMQPClass::Basic(Basic::Deliver(m)) => self.on_basic_deliver(m),
            AMQPClass::Basic(Basic::GetOk(m)) => self.on_basic_get_ok(m),
            AMQPClass::Basic(Basic::GetEmpty(_)) => self.on_basic_get_empty(),
            AMQPClass::Basic(Basic::Return(m)) => self.on_basic_return(m),
            AMQPClass::Basic(Basic::Ack(m)) => self.on_basic_ack(m),
            AMQPClass::Basic(Basic::Nack(m)) => self.on_basic_nack(m),
            AMQPClass::Basic(Basic::RecoverOk(_)) => {
                self.resolve("basic.recover-ok", Reply::BasicRecoverOk)
            }
            AMQPClass::Confirm(Confirm::SelectOk(_)) => self.on_confirm_select_ok(),
            AMQPClass::Tx(Tx::SelectOk(_)) => self.on_tx_select_ok(),
            AMQPClass::Tx(Tx::CommitOk(_)) => self.resolve("tx.commit-ok", Reply::TxCommitOk),
            AMQPClass::Tx(Tx::RollbackOk(_)) => {
                self.resolve("tx.rollback-ok", Reply::TxRollbackOk)
            }
            method => {
                error!("unexpected method on channel {}: {:?}", self.id, method);
                Err(Error::ProtocolError(AMQPError::new(
                    AMQPHardError::COMMANDINVALID.into(),
                    format!("unexpected method on channel {}", self.id).into(),
                )))
            }
        }
    }

    fn resolve(&self, received: &'static str, reply: Reply) -> Result<()> {
        match self.rpc.take() {
            Some(PendingRpc { expected, resolver }) if expected_matches(&expected, &reply) => {
                resolver.resolve(Ok(reply));
                Ok(())
            }
            pending => self.unexpected_reply(received, pending),
        }
    }

    fn unexpected_reply(&self, received: &'static str, pending: Option<PendingRpc>) -> Result<()> {
        match pending {
            Some(pending) => {
                let error = Error::ProtocolError(AMQPError::new(
                    AMQPHardError::UNEXPECTEDFRAME.into(),
                    format!(
                        "unexpected {} while waiting for {:?} on channel {}",
                        received, pending.expected, self.id
                    )
                    .into(),
                ));
                pending.resolver.resolve(Err(error.clone()));
                Err(error)
            }
            None => {
                warn!(
                    "unsolicited {} on channel {}, dropping it",
                    received, self.id
                );
                Ok(())
            }
        }
    }

    fn on_channel_open_ok(&self) -> Result<()> {
        self.status.set_state(ChannelState::Open);
        self.resolve("channel.open-ok", Reply::ChannelOpenOk)
    }

    fn on_channel_flow(&self, method: protocol::channel::Flow) -> Result<()> {
        debug!(
            "server set channel {} flow active={}",
            self.id, method.active
        );
        self.status.set_send_flow(method.active);
        self.frames.push(AMQPFrame::Method(
            self.id,
            AMQPClass::Channel(protocol::channel::AMQPMethod::FlowOk(
                protocol::channel::FlowOk {
                    active: method.active,
                },
            )),
        ));
        Ok(())
    }

    fn on_channel_flow_ok(&self, method: protocol::channel::FlowOk) -> Result<()> {
        self.resolve("channel.flow-ok", Reply::ChannelFlowOk(method.active))
    }

    fn on_channel_close(&self, method: protocol::channel::Close) -> Result<()> {
        let error = match AMQPError::try_from(method.clone()) {
            Ok(amqp_error) => {
                error!(
                    "channel {} closed by server by {}:{} => {:?} => {}",
                    self.id, method.class_id, method.method_id, amqp_error, method.reply_text
                );
                Error::ChannelClosedByServer(CloseReason {
                    error: amqp_error,
                    class_id: method.class_id,
                    method_id: method.method_id,
                })
            }
            Err(e) => {
                error!("channel {} closed by server: {:?} ({})", self.id, method, e);
                Error::InvalidChannelState(ChannelState::RemoteClosed)
            }
        };
        self.status.set_close_reason(error.clone());
        self.status.set_state(ChannelState::RemoteClosed);
        self.rpc.poison(error.clone());
        self.acknowledgements.poison(error.clone());
        self.consumers.poison(error);
        self.receive.clear();
        self.frames.push(AMQPFrame::Method(
            self.id,
            AMQPClass::Channel(protocol::channel::AMQPMethod::CloseOk(
                protocol::channel::CloseOk {},
            )),
        ));
        Ok(())
    }

    fn on_channel_close_ok(&self) -> Result<()> {
        let res = match self.rpc.take() {
            Some(PendingRpc {
                expected: ExpectedReply::ChannelCloseOk,
                resolver,
            }) => {
                resolver.resolve(Ok(Reply::ChannelCloseOk));
                Ok(())
            }
            // a close initiated by the drop handle has no waiter
            None => Ok(()),
            pending => self.unexpected_reply("channel.close-ok", pending),
        };
        self.status.set_state(ChannelState::Closed);
        self.consumers.cancel_all();
        self.acknowledgements
            .poison(Error::InvalidChannelState(ChannelState::Closed));
        self.receive.clear();
        res
    }

    fn on_basic_consume_ok(&self, method: protocol::basic::ConsumeOk) -> Result<()> {
        match self.rpc.take() {
            Some(PendingRpc {
                expected: ExpectedReply::BasicConsumeOk { queue, no_ack },
                resolver,
            }) => {
                let consumer = Consumer::new(method.consumer_tag.clone(), queue, no_ack);
                self.consumers
                    .register(method.consumer_tag, consumer.clone());
                resolver.resolve(Ok(Reply::BasicConsumeOk(consumer)));
                Ok(())
            }
            pending => self.unexpected_reply("basic.consume-ok", pending),
        }
    }

    fn on_basic_cancel_ok(&self, method: protocol::basic::CancelOk) -> Result<()> {
        self.consumers.cancel(method.consumer_tag.as_str());
        self.resolve("basic.cancel-ok", Reply::BasicCancelOk)
    }

    /// Broker-initiated consumer cancellation (e.g. its queue was deleted).
    fn on_basic_cancel(&self, method: protocol::basic::Cancel) -> Result<()> {
        debug!(
            "server cancelled consumer {} on channel {}",
            method.consumer_tag.as_str(),
            self.id
        );
        self.consumers.cancel(method.consumer_tag.as_str());
        if !method.nowait {
            self.frames.push(AMQPFrame::Method(
                self.id,
                AMQPClass::Basic(protocol::basic::AMQPMethod::CancelOk(
                    protocol::basic::CancelOk {
                        consumer_tag: method.consumer_tag,
                    },
                )),
            ));
        }
        Ok(())
    }

    fn on_basic_deliver(&self, method: protocol::basic::Deliver) -> Result<()> {
        self.receive.begin(ContentKind::Deliver {
            consumer_tag: method.consumer_tag,
            delivery_tag: method.delivery_tag,
            exchange: method.exchange,
            routing_key: method.routing_key,
            redelivered: method.redelivered,
        })
    }

    fn on_basic_get_ok(&self, method: protocol::basic::GetOk) -> Result<()> {
        match self.rpc.take() {
            Some(PendingRpc {
                expected: ExpectedReply::BasicGetOk,
                resolver,
            }) => self.receive.begin(ContentKind::Get {
                resolver,
                delivery_tag: method.delivery_tag,
                exchange: method.exchange,
                routing_key: method.routing_key,
                redelivered: method.redelivered,
                message_count: method.message_count,
            }),
            pending => self.unexpected_reply("basic.get-ok", pending),
        }
    }

    fn on_basic_get_empty(&self) -> Result<()> {
        match self.rpc.take() {
            Some(PendingRpc {
                expected: ExpectedReply::BasicGetOk,
                resolver,
            }) => {
                resolver.resolve(Ok(Reply::BasicGetOk(None)));
                Ok(())
            }
            pending => self.unexpected_reply("basic.get-empty", pending),
        }
    }

    fn on_basic_return(&self, method: protocol::basic::Return) -> Result<()> {
        self.receive.begin(ContentKind::Return {
            reply_code: method.reply_code,
            reply_text: method.reply_text,
            exchange: method.exchange,
            routing_key: method.routing_key,
        })
    }

    fn on_basic_ack(&self, method: protocol::basic::Ack) -> Result<()> {
        if !self.status.confirm() {
            warn!("basic.ack on non-confirms channel {}, ignoring", self.id);
            return Ok(());
        }
        if let Err(error) = self
            .acknowledgements
            .on_ack(method.delivery_tag, method.multiple)
        {
            self.close_on_protocol_error(error);
        }
        Ok(())
    }

    fn on_basic_nack(&self, method: protocol::basic::Nack) -> Result<()> {
        if !self.status.confirm() {
            warn!("basic.nack on non-confirms channel {}, ignoring", self.id);
            return Ok(());
        }
        if let Err(error) = self
            .acknowledgements
            .on_nack(method.delivery_tag, method.multiple)
        {
            self.close_on_protocol_error(error);
        }
        Ok(())
    }

    fn on_confirm_select_ok(&self) -> Result<()> {
        self.status.set_confirm();
        self.delivery_tag.reset();
        self.resolve("confirm.select-ok", Reply::ConfirmSelectOk)
    }

    fn on_tx_select_ok(&self) -> Result<()> {
        self.status.set_transactional();
        self.resolve("tx.select-ok", Reply::TxSelectOk)
    }

    /// The server broke the confirms contract, close the channel and keep
    /// the connection alive.
    fn close_on_protocol_error(&self, error: Error) {
        error!(
            "protocol error on channel {}, closing it: {}",
            self.id, error
        );
        if self.status.begin_close() {
            if let Error::ProtocolError(amqp_error) = &error {
                self.frames.push(AMQPFrame::Method(
                    self.id,
                    AMQPClass::Channel(protocol::channel::AMQPMethod::Close(
                        protocol::channel::Close {
                            reply_code: amqp_error.get_id(),
                            reply_text: amqp_error.get_message().clone(),
                            class_id: 0,
                            method_id: 0,
                        },
                    )),
                ));
            }
        }
        self.status.set_close_reason(error.clone());
        self.rpc.poison(error.clone());
        self.acknowledgements.poison(error.clone());
        self.consumers.poison(error);
    }

    pub(crate) fn handle_content_header(
        &self,
        size: u64,
        properties: BasicProperties,
    ) -> Result<()> {
        match self.receive.set_header(size, properties)? {
            Some(partial) => self.complete_content(partial),
            None => Ok(()),
        }
    }

    pub(crate) fn handle_body(&self, payload: Vec<u8>) -> Result<()> {
        match self.receive.append_body(payload)? {
            Some(partial) => self.complete_content(partial),
            None => Ok(()),
        }
    }

    fn complete_content(&self, partial: PartialDelivery) -> Result<()> {
        let PartialDelivery {
            kind,
            properties,
            data,
            ..
        } = partial;
        match kind {
            ContentKind::Deliver {
                consumer_tag,
                delivery_tag,
                exchange,
                routing_key,
                redelivered,
            } => {
                let acker = self.acker(delivery_tag);
                self.consumers.deliver(
                    consumer_tag.as_str(),
                    Delivery {
                        delivery_tag,
                        exchange,
                        routing_key,
                        redelivered,
                        properties,
                        data,
                        acker,
                    },
                );
                Ok(())
            }
            ContentKind::Get {
                resolver,
                delivery_tag,
                exchange,
                routing_key,
                redelivered,
                message_count,
            } => {
                let acker = self.acker(delivery_tag);
                resolver.resolve(Ok(Reply::BasicGetOk(Some(BasicGetMessage {
                    delivery: Delivery {
                        delivery_tag,
                        exchange,
                        routing_key,
                        redelivered,
                        properties,
                        data,
                        acker,
                    },
                    message_count,
                }))));
                Ok(())
            }
            ContentKind::Return {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            } => {
                let message = BasicReturnMessage {
                    reply_code,
                    reply_text,
                    exchange,
                    routing_key,
                    properties,
                    data,
                };
                if self.status.confirm() {
                    self.acknowledgements.record_returned(message);
                } else {
                    warn!(
                        "message returned by server on channel {}: {} ({})",
                        self.id,
                        message.reply_text.as_str(),
                        message.reply_code
                    );
                }
                Ok(())
            }
        }
    }
}

fn expected_matches(expected: &ExpectedReply, reply: &Reply) -> bool {
    matches!(
        (expected, reply),
        (ExpectedReply::ChannelOpenOk, Reply::ChannelOpenOk)
            | (ExpectedReply::ChannelFlowOk, Reply::ChannelFlowOk(_))
            | (ExpectedReply::ChannelCloseOk, Reply::ChannelCloseOk)
            | (ExpectedReply::ExchangeDeclareOk, Reply::ExchangeDeclareOk)
            | (ExpectedReply::ExchangeDeleteOk, Reply::ExchangeDeleteOk)
            | (ExpectedReply::ExchangeBindOk, Reply::ExchangeBindOk)
            | (ExpectedReply::ExchangeUnbindOk, Reply::ExchangeUnbindOk)
            | (ExpectedReply::QueueDeclareOk, Reply::QueueDeclareOk { .. })
            | (ExpectedReply::QueueBindOk, Reply::QueueBindOk)
            | (ExpectedReply::QueueUnbindOk, Reply::QueueUnbindOk)
            | (ExpectedReply::QueuePurgeOk, Reply::QueuePurgeOk { .. })
            | (ExpectedReply::QueueDeleteOk, Reply::QueueDeleteOk { .. })
            | (ExpectedReply::BasicQosOk, Reply::BasicQosOk)
            | (ExpectedReply::BasicCancelOk { .. }, Reply::BasicCancelOk)
            | (ExpectedReply::BasicRecoverOk, Reply::BasicRecoverOk)
            | (ExpectedReply::TxSelectOk, Reply::TxSelectOk)
            | (ExpectedReply::TxCommitOk, Reply::TxCommitOk)
            | (ExpectedReply::TxRollbackOk, Reply::TxRollbackOk)
            | (ExpectedReply::ConfirmSelectOk, Reply::ConfirmSelectOk)
    )
}

fn mismatched_reply(reply: Reply) -> Error {
    Error::ProtocolError(AMQPError::new(
        AMQPHardError::INTERNALERROR.into(),
        format!("mismatched RPC reply: {:?}", reply).into(),
    ))
}

/// In-flight reassembly of one inbound message.
///
/// A content-bearing method opens the accumulator, the content header
/// declares the body size, body frames fill it exactly.
#[derive(Clone, Default)]
struct ContentAccumulator {
    inner: Arc<Mutex<Option<PartialDelivery>>>,
}

struct PartialDelivery {
    kind: ContentKind,
    properties: BasicProperties,
    body_size: u64,
    header_received: bool,
    data: Vec<u8>,
}

enum ContentKind {
    Deliver {
        consumer_tag: ShortString,
        delivery_tag: u64,
        exchange: ShortString,
        routing_key: ShortString,
        redelivered: bool,
    },
    Get {
        resolver: PromiseResolver<Reply>,
        delivery_tag: u64,
        exchange: ShortString,
        routing_key: ShortString,
        redelivered: bool,
        message_count: u32,
    },
    Return {
        reply_code: u16,
        reply_text: ShortString,
        exchange: ShortString,
        routing_key: ShortString,
    },
}

impl ContentAccumulator {
    fn begin(&self, kind: ContentKind) -> Result<()> {
        let mut slot = self.inner.lock();
        if slot.is_some() {
            return Err(unexpected_frame(
                "content method while assembling a message",
            ));
        }
        *slot = Some(PartialDelivery {
            kind,
            properties: BasicProperties::default(),
            body_size: 0,
            header_received: false,
            data: Vec::new(),
        });
        Ok(())
    }

    /// Returns the finished delivery when the declared body size is 0.
    fn set_header(
        &self,
        size: u64,
        properties: BasicProperties,
    ) -> Result<Option<PartialDelivery>> {
        let mut slot = self.inner.lock();
        match slot.as_mut() {
            Some(partial) if !partial.header_received => {
                partial.header_received = true;
                partial.body_size = size;
                partial.properties = properties;
                if size == 0 {
                    Ok(slot.take())
                } else {
                    Ok(None)
                }
            }
            _ => Err(unexpected_frame("content header without a content method")),
        }
    }

    /// Returns the finished delivery once the bodies sum up to the
    /// declared size.
    fn append_body(&self, payload: Vec<u8>) -> Result<Option<PartialDelivery>> {
        let mut slot = self.inner.lock();
        match slot.as_mut() {
            Some(partial) if partial.header_received => {
                partial.data.extend_from_slice(&payload);
                if (partial.data.len() as u64) > partial.body_size {
                    Err(Error::ProtocolError(AMQPError::new(
                        AMQPHardError::FRAMEERROR.into(),
                        "content body overflows the declared body size".into(),
                    )))
                } else if (partial.data.len() as u64) == partial.body_size {
                    Ok(slot.take())
                } else {
                    Ok(None)
                }
            }
            _ => Err(unexpected_frame("content body without a content header")),
        }
    }

    fn clear(&self) {
        self.inner.lock().take();
    }
}

fn unexpected_frame(message: &str) -> Error {
    Error::ProtocolError(AMQPError::new(
        AMQPHardError::UNEXPECTEDFRAME.into(),
        message.into(),
    ))
}

/// Closes the channel when the application drops its last handle.
struct ChannelCloser {
    id: u16,
    status: ChannelStatus,
    frames: Frames,
    waker: IoWaker,
}

impl Drop for ChannelCloser {
    fn drop(&mut self) {
        if self.status.begin_close() {
            debug!("channel {} dropped while open, closing it", self.id);
            self.frames.push(AMQPFrame::Method(
                self.id,
                AMQPClass::Channel(protocol::channel::AMQPMethod::Close(
                    protocol::channel::Close {
                        reply_code: 200,
                        reply_text: "Normal shutdown".into(),
                        class_id: 0,
                        method_id: 0,
                    },
                )),
            ));
            let _ = self.waker.wake();
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("configuration", &self.configuration)
            .field("status", &self.status)
            .finish()
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_channel() -> Channel {
        let configuration = Configuration::default();
        configuration.set_frame_max(131072);
        let channel = Channel::new(
            1,
            configuration,
            ConnectionStatus::default(),
            Frames::default(),
            IoWaker::default(),
        );
        channel.status.set_state(ChannelState::Open);
        channel
    }

    fn deliver_frame(consumer_tag: &str, delivery_tag: u64) -> AMQPClass {
        AMQPClass::Basic(protocol::basic::AMQPMethod::Deliver(
            protocol::basic::Deliver {
                consumer_tag: consumer_tag.into(),
                delivery_tag,
                redelivered: false,
                exchange: "".into(),
                routing_key: "q".into(),
            },
        ))
    }

    #[test]
    fn deliver_header_body_reaches_the_consumer() {
        let channel = test_channel();
        let consumer = Consumer::new("ctag".into(), "q".into(), false);
        channel.consumers.register("ctag".into(), consumer.clone());

        channel.handle_method(deliver_frame("ctag", 7)).unwrap();
        let properties = BasicProperties::default()
            .with_content_type("text/plain".into())
            .with_delivery_mode(2);
        channel
            .handle_content_header(11, properties.clone())
            .unwrap();
        channel.handle_body(b"hello ".to_vec()).unwrap();
        channel.handle_body(b"world".to_vec()).unwrap();

        let delivery = consumer.recv().unwrap();
        assert_eq!(delivery.delivery_tag, 7);
        assert_eq!(delivery.data, b"hello world");
        assert_eq!(delivery.properties, properties);
    }

    #[test]
    fn empty_body_completes_on_the_header() {
        let channel = test_channel();
        let consumer = Consumer::new("ctag".into(), "q".into(), false);
        channel.consumers.register("ctag".into(), consumer.clone());

        channel.handle_method(deliver_frame("ctag", 1)).unwrap();
        channel
            .handle_content_header(0, BasicProperties::default())
            .unwrap();
        assert_eq!(consumer.recv().unwrap().data, b"");
    }

    #[test]
    fn content_header_without_method_is_a_protocol_error() {
        let channel = test_channel();
        assert!(matches!(
            channel.handle_content_header(3, BasicProperties::default()),
            Err(Error::ProtocolError(_))
        ));
    }

    #[test]
    fn body_overflow_is_a_protocol_error() {
        let channel = test_channel();
        let consumer = Consumer::new("ctag".into(), "q".into(), false);
        channel.consumers.register("ctag".into(), consumer);
        channel.handle_method(deliver_frame("ctag", 1)).unwrap();
        channel
            .handle_content_header(2, BasicProperties::default())
            .unwrap();
        assert!(matches!(
            channel.handle_body(b"too long".to_vec()),
            Err(Error::ProtocolError(_))
        ));
    }

    #[test]
    fn remote_close_fails_the_waiter_and_seals_the_channel() {
        let channel = test_channel();
        let promise = channel.rpc.register(ExpectedReply::QueueDeclareOk).unwrap();

        channel
            .handle_method(AMQPClass::Channel(protocol::channel::AMQPMethod::Close(
                protocol::channel::Close {
                    reply_code: 406,
                    reply_text: "PRECONDITION_FAILED - inequivalent arg 'durable'".into(),
                    class_id: 50,
                    method_id: 10,
                },
            )))
            .unwrap();

        match promise.wait() {
            Err(Error::ChannelClosedByServer(reason)) => assert_eq!(reason.reply_code(), 406),
            other => panic!("expected server close, got {:?}", other.map(|_| ())),
        }
        assert_eq!(channel.status.state(), ChannelState::RemoteClosed);
        // we must answer with close-ok
        match channel.frames.pop_frame() {
            Some(AMQPFrame::Method(
                1,
                AMQPClass::Channel(protocol::channel::AMQPMethod::CloseOk(_)),
            )) => {}
            other => panic!("expected channel.close-ok, got {:?}", other),
        }
        // later operations surface the stored close reason
        assert!(matches!(
            channel.basic_get("q", BasicGetOptions::default()),
            Err(Error::ChannelClosedByServer(_))
        ));
    }

    #[test]
    fn server_flow_pause_is_acknowledged() {
        let channel = test_channel();
        channel
            .handle_method(AMQPClass::Channel(protocol::channel::AMQPMethod::Flow(
                protocol::channel::Flow { active: false },
            )))
            .unwrap();
        match channel.frames.pop_frame() {
            Some(AMQPFrame::Method(
                1,
                AMQPClass::Channel(protocol::channel::AMQPMethod::FlowOk(flow_ok)),
            )) => assert!(!flow_ok.active),
            other => panic!("expected channel.flow-ok, got {:?}", other),
        }
    }

    #[test]
    fn broker_cancel_ends_the_consumer_and_is_acknowledged() {
        let channel = test_channel();
        let consumer = Consumer::new("ctag".into(), "q".into(), false);
        channel.consumers.register("ctag".into(), consumer.clone());

        channel
            .handle_method(AMQPClass::Basic(protocol::basic::AMQPMethod::Cancel(
                protocol::basic::Cancel {
                    consumer_tag: "ctag".into(),
                    nowait: false,
                },
            )))
            .unwrap();

        assert!(consumer.recv().is_none());
        assert_eq!(channel.status.state(), ChannelState::Open);
        match channel.frames.pop_frame() {
            Some(AMQPFrame::Method(
                1,
                AMQPClass::Basic(protocol::basic::AMQPMethod::CancelOk(cancel_ok)),
            )) => assert_eq!(cancel_ok.consumer_tag, "ctag".into()),
            other => panic!("expected basic.cancel-ok, got {:?}", other),
        }
    }

    #[test]
    fn bad_acknowledgement_closes_the_channel_not_the_connection() {
        let channel = test_channel();
        channel.status.set_confirm();
        channel
            .handle_method(AMQPClass::Basic(protocol::basic::AMQPMethod::Ack(
                protocol::basic::Ack {
                    delivery_tag: 42,
                    multiple: false,
                },
            )))
            .unwrap();
        assert_eq!(channel.status.state(), ChannelState::Closing);
        match channel.frames.pop_frame() {
            Some(AMQPFrame::Method(
                1,
                AMQPClass::Channel(protocol::channel::AMQPMethod::Close(close)),
            )) => assert_eq!(close.reply_code, 406),
            other => panic!("expected channel.close, got {:?}", other),
        }
    }

    #[test]
    fn get_empty_resolves_to_none() {
        let channel = test_channel();
        let promise = channel.rpc.register(ExpectedReply::BasicGetOk).unwrap();
        channel
            .handle_method(AMQPClass::Basic(protocol::basic::AMQPMethod::GetEmpty(
                protocol::basic::GetEmpty {},
            )))
            .unwrap();
        match promise.wait().unwrap() {
            Reply::BasicGetOk(None) => {}
            reply => panic!("expected empty basic.get-ok, got {:?}", reply),
        }
    }

    #[test]
    fn second_rpc_on_a_busy_channel_is_rejected() {
        let channel = test_channel();
        let _first = channel.rpc.register(ExpectedReply::QueueDeclareOk).unwrap();
        assert!(matches!(
            channel.rpc.register(ExpectedReply::QueueBindOk),
            Err(Error::RpcAlreadyRunning)
        ));
    }
}
