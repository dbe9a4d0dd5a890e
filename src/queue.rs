use crate::{
    channel::Channel,
    consumer::Consumer,
    message::BasicGetMessage,
    options::{BasicConsumeOptions, BasicGetOptions, QueueDeclareOptions, QueueDeleteOptions},
    types::{FieldTable, ShortString},
    Result,
};

/// A declared queue, thin request builder over its [`Channel`].
///
/// Obtained from [`Channel::queue_declare`] (or [`Queue::declare`]); holds
/// the broker-assigned name so it works with server-named (`""`) queues.
#[derive(Clone, Debug)]
pub struct Queue {
    channel: Channel,
    name: ShortString,
    message_count: u32,
    consumer_count: u32,
    options: QueueDeclareOptions,
    arguments: FieldTable,
}

impl Queue {
    pub(crate) fn new(
        channel: Channel,
        name: ShortString,
        message_count: u32,
        consumer_count: u32,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Self {
        Self {
            channel,
            name,
            message_count,
            consumer_count,
            options,
            arguments,
        }
    }

    pub fn declare(
        channel: &Channel,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<Queue> {
        channel.queue_declare(name, options, arguments)
    }

    /// The queue name, broker-assigned when declared with `""`.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Message count reported by the declare that produced this handle.
    pub fn declared_message_count(&self) -> u32 {
        self.message_count
    }

    /// Consumer count reported by the declare that produced this handle.
    pub fn declared_consumer_count(&self) -> u32 {
        self.consumer_count
    }

    /// The current number of ready messages, read with a passive
    /// re-declare so the count is fresh on every call.
    pub fn message_count(&self) -> Result<u32> {
        let queue = self.channel.queue_declare(
            self.name.as_str(),
            QueueDeclareOptions {
                passive: true,
                ..self.options
            },
            self.arguments.clone(),
        )?;
        Ok(queue.declared_message_count())
    }

    pub fn bind(&self, exchange: &str, routing_key: &str, arguments: FieldTable) -> Result<()> {
        self.channel
            .queue_bind(self.name.as_str(), exchange, routing_key, arguments)
    }

    pub fn unbind(&self, exchange: &str, routing_key: &str, arguments: FieldTable) -> Result<()> {
        self.channel
            .queue_unbind(self.name.as_str(), exchange, routing_key, arguments)
    }

    pub fn get(&self, options: BasicGetOptions) -> Result<Option<BasicGetMessage>> {
        self.channel.basic_get(self.name.as_str(), options)
    }

    pub fn consume(&self, options: BasicConsumeOptions, arguments: FieldTable) -> Result<Consumer> {
        self.channel
            .basic_consume(self.name.as_str(), "", options, arguments)
    }

    pub fn purge(&self) -> Result<u32> {
        self.channel.queue_purge(self.name.as_str())
    }

    pub fn delete(&self, options: QueueDeleteOptions) -> Result<u32> {
        self.channel.queue_delete(self.name.as_str(), options)
    }
}
