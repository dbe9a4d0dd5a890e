use crate::{
    channels::Channels,
    configuration::Configuration,
    connection::ConnectionProperties,
    connection_status::{ConnectionState, ConnectionStatus},
    error::CloseReason,
    frames::Frames,
    types::{AMQPValue, FieldTable},
    wait::PromiseResolver,
    Error, Result,
};
use amq_protocol::{
    auth::{Credentials, SASLMechanism},
    frame::AMQPFrame,
    protocol::{connection, AMQPClass, AMQPError, AMQPHardError},
};
use parking_lot::Mutex;
use std::convert::TryFrom;
use tracing::{debug, error, trace};

const ACCESS_REFUSED: u16 = 403;

/// The connection-level state machine, fed by the I/O thread with every
/// frame addressed to channel 0.
///
/// Walks the handshake (`start`/`tune`/`open`), then handles close and
/// blocked notifications for the lifetime of the connection.
pub(crate) struct Channel0 {
    configuration: Configuration,
    status: ConnectionStatus,
    frames: Frames,
    channels: Channels,
    credentials: Credentials,
    mechanism: SASLMechanism,
    properties: ConnectionProperties,
    vhost: String,
    open: PromiseResolver<()>,
    close: Mutex<Option<PromiseResolver<()>>>,
}

impl Channel0 {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        configuration: Configuration,
        status: ConnectionStatus,
        frames: Frames,
        channels: Channels,
        credentials: Credentials,
        mechanism: SASLMechanism,
        properties: ConnectionProperties,
        vhost: String,
        open: PromiseResolver<()>,
    ) -> Self {
        Self {
            configuration,
            status,
            frames,
            channels,
            credentials,
            mechanism,
            properties,
            vhost,
            open,
            close: Mutex::new(None),
        }
    }

    pub(crate) fn register_close_resolver(&self, resolver: PromiseResolver<()>) {
        *self.close.lock() = Some(resolver);
    }

    pub(crate) fn handle_method(&self, method: AMQPClass) -> Result<()> {
        match method {
            AMQPClass::Connection(connection::AMQPMethod::Start(method)) => {
                self.on_start(method)
            }
            AMQPClass::Connection(connection::AMQPMethod::Secure(_)) => {
                let error = Error::NotSupported("SASL secure/secure-ok exchange");
                self.open.resolve(Err(error.clone()));
                Err(error)
            }
            AMQPClass::Connection(connection::AMQPMethod::Tune(method)) => self.on_tune(method),
            AMQPClass::Connection(connection::AMQPMethod::OpenOk(_)) => self.on_open_ok(),
            AMQPClass::Connection(connection::AMQPMethod::Close(method)) => self.on_close(method),
            AMQPClass::Connection(connection::AMQPMethod::CloseOk(_)) => self.on_close_ok(),
            AMQPClass::Connection(connection::AMQPMethod::Blocked(method)) => {
                debug!("connection blocked by server: {}", method.reason.as_str());
                self.status.block();
                Ok(())
            }
            AMQPClass::Connection(connection::AMQPMethod::Unblocked(_)) => {
                debug!("connection unblocked by server");
                self.status.unblock();
                Ok(())
            }
            method => {
                error!("unexpected method on channel 0: {:?}", method);
                Err(Error::ProtocolError(AMQPError::new(
                    AMQPHardError::COMMANDINVALID.into(),
                    "unexpected method on channel 0".into(),
                )))
            }
        }
    }

    fn expect_state(&self, expected: ConnectionState) -> Result<()> {
        let state = self.status.state();
        if state == expected {
            Ok(())
        } else {
            error!("invalid connection state: {:?}", state);
            let error = Error::InvalidConnectionState(state);
            self.open.resolve(Err(error.clone()));
            Err(error)
        }
    }

    fn on_start(&self, method: connection::Start) -> Result<()> {
        trace!("server sent connection.start: {:?}", method);
        self.expect_state(ConnectionState::ProtocolHeaderSent)?;

        let mechanism = self.mechanism.to_string();
        let locale = self.properties.locale.clone();
        if !String::from_utf8_lossy(method.mechanisms.as_bytes())
            .split_whitespace()
            .any(|m| m == mechanism)
        {
            error!("unsupported mechanism: {}", mechanism);
        }
        if !String::from_utf8_lossy(method.locales.as_bytes())
            .split_whitespace()
            .any(|l| l == locale)
        {
            error!("unsupported locale: {}", locale);
        }

        let mut client_properties = self.properties.client_properties.clone();
        if !client_properties.contains_key("product") || !client_properties.contains_key("version")
        {
            client_properties.insert(
                "product".into(),
                AMQPValue::LongString(env!("CARGO_PKG_NAME").into()),
            );
            client_properties.insert(
                "version".into(),
                AMQPValue::LongString(env!("CARGO_PKG_VERSION").into()),
            );
        }
        client_properties.insert("platform".into(), AMQPValue::LongString("rust".into()));

        let mut capabilities = FieldTable::default();
        capabilities.insert("publisher_confirms".into(), true.into());
        capabilities.insert("exchange_exchange_bindings".into(), true.into());
        capabilities.insert("basic.nack".into(), true.into());
        capabilities.insert("consumer_cancel_notify".into(), true.into());
        capabilities.insert("connection.blocked".into(), true.into());
        capabilities.insert("consumer_priorities".into(), true.into());
        capabilities.insert("authentication_failure_close".into(), true.into());
        client_properties.insert("capabilities".into(), AMQPValue::FieldTable(capabilities));

        self.send(connection::AMQPMethod::StartOk(connection::StartOk {
            client_properties,
            mechanism: mechanism.into(),
            response: self
                .credentials
                .sasl_auth_string(self.mechanism.clone())
                .into(),
            locale: locale.into(),
        }));
        self.status.set_state(ConnectionState::StartReceived);
        Ok(())
    }

    fn on_tune(&self, method: connection::Tune) -> Result<()> {
        debug!("server sent connection.tune: {:?}", method);
        self.expect_state(ConnectionState::StartReceived)?;

        self.configuration
            .negotiate(method.channel_max, method.frame_max, method.heartbeat);
        self.send(connection::AMQPMethod::TuneOk(connection::TuneOk {
            channel_max: self.configuration.channel_max(),
            frame_max: self.configuration.frame_max(),
            heartbeat: self.configuration.heartbeat(),
        }));
        self.status.set_state(ConnectionState::TuneReceived);

        self.send(connection::AMQPMethod::Open(connection::Open {
            virtual_host: self.vhost.as_str().into(),
        }));
        self.status.set_state(ConnectionState::OpenSent);
        Ok(())
    }

    fn on_open_ok(&self) -> Result<()> {
        self.expect_state(ConnectionState::OpenSent)?;
        debug!("connection open, vhost {}", self.vhost);
        self.status.set_state(ConnectionState::Open);
        self.open.resolve(Ok(()));
        Ok(())
    }

    fn on_close(&self, method: connection::Close) -> Result<()> {
        let handshaking = self.status.state() != ConnectionState::Open;
        let error = match AMQPError::try_from(method.clone()) {
            Ok(amqp_error) => {
                error!(
                    "connection closed by server: {} => {:?} => {}",
                    method.reply_code, amqp_error, method.reply_text
                );
                let reason = CloseReason {
                    error: amqp_error,
                    class_id: method.class_id,
                    method_id: method.method_id,
                };
                if handshaking && reason.reply_code() == ACCESS_REFUSED {
                    Error::AuthenticationFailure(reason)
                } else {
                    Error::ConnectionClosedByServer(reason)
                }
            }
            Err(e) => {
                error!("connection closed by server: {:?} ({})", method, e);
                Error::InvalidConnectionState(ConnectionState::ClosedByServer)
            }
        };
        self.status.set_state(ConnectionState::ClosedByServer);
        self.status.set_error(error.clone());
        self.send(connection::AMQPMethod::CloseOk(connection::CloseOk {}));
        self.frames.push_shutdown();
        self.poison(error);
        Ok(())
    }

    fn on_close_ok(&self) -> Result<()> {
        debug!("server confirmed connection close");
        self.status.set_state(ConnectionState::ClosedByClient);
        if let Some(resolver) = self.close.lock().take() {
            resolver.resolve(Ok(()));
        }
        Ok(())
    }

    /// Wakes everything still parked on this connection after a failure.
    pub(crate) fn poison(&self, error: Error) {
        self.open.resolve(Err(error.clone()));
        if let Some(resolver) = self.close.lock().take() {
            resolver.resolve(Err(error.clone()));
        }
        self.channels.poison(error);
    }

    fn send(&self, method: connection::AMQPMethod) {
        self.frames
            .push(AMQPFrame::Method(0, AMQPClass::Connection(method)));
    }
}
