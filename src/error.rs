use crate::{
    channel_status::ChannelState, connection_status::ConnectionState, message::BasicReturnMessage,
};
use amq_protocol::{
    frame::{GenError, ProtocolVersion},
    protocol::{AMQPError, AMQPHardError, AMQPSoftError},
};
use std::{error, fmt, io, sync::Arc};

/// A std Result with a prepopulated warren Error type
pub type Result<T> = std::result::Result<T, Error>;

/// The broker reason attached to a `connection.close` or `channel.close`.
///
/// Carries the reply-code/reply-text pair mapped to its canonical
/// [`AMQPError`] kind, plus the class and method ids of the request that
/// triggered the close (0 when not applicable).
#[derive(Clone, Debug, PartialEq)]
pub struct CloseReason {
    pub error: AMQPError,
    pub class_id: u16,
    pub method_id: u16,
}

impl CloseReason {
    pub fn reply_code(&self) -> u16 {
        self.error.get_id()
    }

    pub fn reply_text(&self) -> &str {
        self.error.get_message().as_str()
    }

    pub fn is_soft_error(&self) -> bool {
        AMQPSoftError::from_id(self.error.get_id()).is_some()
    }

    pub fn is_hard_error(&self) -> bool {
        AMQPHardError::from_id(self.error.get_id()).is_some()
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reply_text(), self.reply_code())
    }
}

/// The errors that can be returned in this crate.
#[derive(Clone, Debug)]
pub enum Error {
    /// The `channel_max` id space is exhausted.
    ChannelsLimitReached,
    /// The server spoke a protocol version we do not.
    InvalidProtocolVersion(ProtocolVersion),
    /// An operation was attempted on a channel in the wrong state.
    InvalidChannelState(ChannelState),
    /// An operation was attempted on a connection in the wrong state.
    InvalidConnectionState(ConnectionState),
    /// The connection string could not be parsed.
    InvalidUri(String),
    /// An I/O error outside of the socket lifecycle (registration, wakeup).
    IOError(Arc<io::Error>),
    /// The socket died: read/write error, unexpected EOF or missed
    /// heartbeats. The underlying cause is carried along.
    ConnectionReset(Arc<io::Error>),
    /// Inbound bytes did not parse as an AMQP frame.
    ParsingError(String),
    /// An outbound frame could not be serialized.
    SerialisationError(Arc<GenError>),
    /// A protocol violation, ours or the server's.
    ProtocolError(AMQPError),
    /// The server closed the connection, e.g. on a hard error.
    ConnectionClosedByServer(CloseReason),
    /// The server closed a channel, e.g. on a soft error.
    ChannelClosedByServer(CloseReason),
    /// The server refused our credentials during the handshake.
    AuthenticationFailure(CloseReason),
    /// A mandatory or immediate publish came back with `basic.return`.
    MessageReturned(Box<BasicReturnMessage>),
    /// The requested combination is not supported, e.g. enabling publisher
    /// confirms on a transactional channel.
    NotSupported(&'static str),
    /// The caller-specified RPC deadline elapsed.
    RpcTimeout,
    /// A second RPC was issued on a channel whose waiter is occupied.
    RpcAlreadyRunning,
}

impl Error {
    /// The AMQP-level error behind this error, if there is one.
    pub fn amqp_error(&self) -> Option<&AMQPError> {
        match self {
            Error::ProtocolError(error) => Some(error),
            Error::ConnectionClosedByServer(reason)
            | Error::ChannelClosedByServer(reason)
            | Error::AuthenticationFailure(reason) => Some(&reason.error),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ChannelsLimitReached => write!(
                f,
                "the maximum number of channels for this connection has been reached"
            ),
            Error::InvalidProtocolVersion(version) => {
                write!(f, "the server answered with protocol version {:?}", version)
            }
            Error::InvalidChannelState(state) => write!(f, "invalid channel state: {:?}", state),
            Error::InvalidConnectionState(state) => {
                write!(f, "invalid connection state: {:?}", state)
            }
            Error::InvalidUri(error) => write!(f, "invalid connection string: {}", error),
            Error::IOError(error) => write!(f, "IO error: {}", error),
            Error::ConnectionReset(error) => write!(f, "connection reset: {}", error),
            Error::ParsingError(error) => write!(f, "failed to parse frame: {}", error),
            Error::SerialisationError(error) => write!(f, "failed to serialise frame: {:?}", error),
            Error::ProtocolError(error) => write!(
                f,
                "protocol error: {} ({})",
                error.get_message().as_str(),
                error.get_id()
            ),
            Error::ConnectionClosedByServer(reason) => {
                write!(f, "connection closed by server: {}", reason)
            }
            Error::ChannelClosedByServer(reason) => {
                write!(f, "channel closed by server: {}", reason)
            }
            Error::AuthenticationFailure(reason) => {
                write!(f, "authentication failure: {}", reason)
            }
            Error::MessageReturned(message) => write!(
                f,
                "message returned by server: {} ({})",
                message.reply_text.as_str(),
                message.reply_code
            ),
            Error::NotSupported(what) => write!(f, "{} is not supported", what),
            Error::RpcTimeout => write!(f, "RPC deadline exceeded"),
            Error::RpcAlreadyRunning => write!(f, "an RPC is already running on this channel"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::IOError(error) | Error::ConnectionReset(error) => Some(&**error),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::IOError(Arc::new(error))
    }
}
