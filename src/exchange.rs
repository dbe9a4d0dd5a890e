use crate::{
    channel::Channel,
    options::{BasicPublishOptions, ExchangeDeclareOptions, ExchangeDeleteOptions},
    types::{FieldTable, ShortString},
    BasicProperties, Result,
};

/// The exchange types RabbitMQ routes with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Headers,
    Topic,
    Custom(String),
}

impl ExchangeKind {
    pub(crate) fn kind(&self) -> ShortString {
        match self {
            ExchangeKind::Direct => "direct".into(),
            ExchangeKind::Fanout => "fanout".into(),
            ExchangeKind::Headers => "headers".into(),
            ExchangeKind::Topic => "topic".into(),
            ExchangeKind::Custom(kind) => kind.as_str().into(),
        }
    }
}

impl Default for ExchangeKind {
    fn default() -> Self {
        ExchangeKind::Direct
    }
}

/// A declared exchange, thin request builder over its [`Channel`].
#[derive(Clone, Debug)]
pub struct Exchange {
    channel: Channel,
    name: ShortString,
    kind: ExchangeKind,
}

impl Exchange {
    pub fn declare(
        channel: &Channel,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<Exchange> {
        channel.exchange_declare(name, kind.clone(), options, arguments)?;
        Ok(Exchange {
            channel: channel.clone(),
            name: name.into(),
            kind,
        })
    }

    /// Handle to an exchange that already exists on the broker, e.g. the
    /// `amq.*` defaults.
    pub fn existing(channel: &Channel, name: &str, kind: ExchangeKind) -> Exchange {
        Exchange {
            channel: channel.clone(),
            name: name.into(),
            kind,
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn kind(&self) -> &ExchangeKind {
        &self.kind
    }

    pub fn publish(
        &self,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<bool> {
        self.channel
            .basic_publish(self.name.as_str(), routing_key, options, payload, properties)
    }

    /// Binds this exchange to `source` (exchange-to-exchange, RabbitMQ
    /// extension): messages published to `source` flow into this one.
    pub fn bind(&self, source: &str, routing_key: &str, arguments: FieldTable) -> Result<()> {
        self.channel
            .exchange_bind(self.name.as_str(), source, routing_key, arguments)
    }

    pub fn unbind(&self, source: &str, routing_key: &str, arguments: FieldTable) -> Result<()> {
        self.channel
            .exchange_unbind(self.name.as_str(), source, routing_key, arguments)
    }

    pub fn delete(&self, options: ExchangeDeleteOptions) -> Result<()> {
        self.channel.exchange_delete(self.name.as_str(), options)
    }
}
