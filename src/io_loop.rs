use crate::{
    buffer::ReadBuffer,
    channel0::Channel0,
    channels::Channels,
    configuration::Configuration,
    connection_status::{ConnectionState, ConnectionStatus},
    frames::{serialize_frame, Frames, Outbound},
    heartbeat::Heartbeat,
    Error, Result,
};
use amq_protocol::{frame::AMQPFrame, protocol, protocol::AMQPClass};
use mio::{net::TcpStream, Events, Interest, Poll, Token, Waker};
use std::{
    io::{self, Read, Write},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, trace, warn};

const SOCKET: Token = Token(0);
const WAKER: Token = Token(1);

const READ_CHUNK_SIZE: usize = 16384;
// stop pulling frames off the queue once this much is buffered unwritten
const WRITE_HIGH_WATER: usize = 131072;

/// The cross-thread write-trigger.
///
/// Wakes the I/O thread out of its blocking poll when an application
/// thread queued outbound frames. No-ops when detached (unit tests).
#[derive(Clone, Default)]
pub(crate) struct IoWaker {
    waker: Option<Arc<Waker>>,
}

impl IoWaker {
    pub(crate) fn wake(&self) -> Result<()> {
        match &self.waker {
            Some(waker) => waker.wake().map_err(Error::from),
            None => Ok(()),
        }
    }
}

/// The dedicated thread owning the socket.
///
/// Reads and parses inbound frames, demultiplexes them per channel-id,
/// drains the outbound queue, and emits/supervises heartbeats. It never
/// surfaces an error inline: failures poison the connection and every
/// parked waiter, then the thread exits.
pub(crate) struct IoLoop {
    poll: Poll,
    events: Events,
    stream: TcpStream,
    frames: Frames,
    channels: Channels,
    channel0: Arc<Channel0>,
    configuration: Configuration,
    status: ConnectionStatus,
    read_buffer: ReadBuffer,
    write_buffer: Vec<u8>,
    write_pos: usize,
    heartbeat: Heartbeat,
    can_write: bool,
    shutting_down: bool,
}

impl IoLoop {
    /// Registers the socket, spawns the thread, and hands back its join
    /// handle plus the write-trigger.
    pub(crate) fn start(
        stream: std::net::TcpStream,
        frames: Frames,
        channels: Channels,
        channel0: Arc<Channel0>,
        configuration: Configuration,
        status: ConnectionStatus,
    ) -> Result<(thread::JoinHandle<()>, IoWaker)> {
        stream.set_nonblocking(true)?;
        let mut stream = TcpStream::from_std(stream);
        let poll = Poll::new()?;
        let waker = IoWaker {
            waker: Some(Arc::new(Waker::new(poll.registry(), WAKER)?)),
        };
        poll.registry()
            .register(&mut stream, SOCKET, Interest::READABLE | Interest::WRITABLE)?;

        let io_loop = IoLoop {
            poll,
            events: Events::with_capacity(16),
            stream,
            frames,
            channels,
            channel0,
            configuration,
            status,
            read_buffer: ReadBuffer::new(),
            write_buffer: Vec::with_capacity(WRITE_HIGH_WATER),
            write_pos: 0,
            heartbeat: Heartbeat::new(),
            can_write: false,
            shutting_down: false,
        };
        let handle = thread::Builder::new()
            .name("warren-io".into())
            .spawn(move || io_loop.run())?;
        Ok((handle, waker))
    }

    fn run(mut self) {
        match self.main_loop() {
            Ok(()) => debug!("io loop exiting after clean shutdown"),
            Err(error) => self.fail(error),
        }
    }

    fn main_loop(&mut self) -> Result<()> {
        loop {
            let timeout = self.poll_timeout();
            if let Err(e) = self.poll.poll(&mut self.events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::IOError(Arc::new(e)));
            }

            let mut readable = false;
            for event in self.events.iter() {
                match event.token() {
                    SOCKET => {
                        if event.is_readable() {
                            readable = true;
                        }
                        if event.is_writable() {
                            self.can_write = true;
                        }
                    }
                    WAKER => trace!("woken up by the write trigger"),
                    _ => {}
                }
            }

            if readable {
                self.read_frames()?;
            }
            self.flush_outbound()?;
            if self.shutting_down && self.write_pos >= self.write_buffer.len() {
                debug!("outbound queue flushed, closing the socket");
                return Ok(());
            }
            self.check_heartbeats()?;
        }
    }

    /// Half the heartbeat interval, per the timeout the protocol suggests.
    fn poll_timeout(&self) -> Option<Duration> {
        if !self.heartbeats_armed() {
            return None;
        }
        let interval = self.configuration.heartbeat();
        if interval == 0 {
            None
        } else {
            Some(Duration::from_secs(u64::from(interval)) / 2)
        }
    }

    /// Heartbeats only run once `connection.tune` fixed the interval.
    fn heartbeats_armed(&self) -> bool {
        matches!(
            self.status.state(),
            ConnectionState::TuneReceived
                | ConnectionState::OpenSent
                | ConnectionState::Open
                | ConnectionState::Closing
        )
    }

    fn read_frames(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(Error::ConnectionReset(Arc::new(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "the server closed the socket",
                    ))))
                }
                Ok(n) => {
                    self.heartbeat.record_read();
                    self.read_buffer.extend(&chunk[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::ConnectionReset(Arc::new(e))),
            }
        }
        while let Some(frame) = self.read_buffer.parse()? {
            self.dispatch(frame)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, frame: AMQPFrame) -> Result<()> {
        trace!("io loop received {:?}", frame);
        match frame {
            // heartbeats are consumed here, channels never see them
            AMQPFrame::Heartbeat(_) => Ok(()),
            AMQPFrame::ProtocolHeader(version) => Err(Error::InvalidProtocolVersion(version)),
            AMQPFrame::Method(0, method) => self.channel0.handle_method(method),
            AMQPFrame::Method(channel_id, method) => {
                self.with_channel(channel_id, |channel| channel.handle_method(method))
            }
            AMQPFrame::Header(0, _, _) | AMQPFrame::Body(0, _) => {
                Err(Error::ProtocolError(protocol::AMQPError::new(
                    protocol::AMQPHardError::UNEXPECTEDFRAME.into(),
                    "content frame on channel 0".into(),
                )))
            }
            AMQPFrame::Header(channel_id, _, header) => self.with_channel(channel_id, |channel| {
                channel.handle_content_header(header.body_size, header.properties)
            }),
            AMQPFrame::Body(channel_id, payload) => {
                self.with_channel(channel_id, |channel| channel.handle_body(payload))
            }
        }
    }

    fn with_channel<F>(&self, channel_id: u16, f: F) -> Result<()>
    where
        F: FnOnce(&crate::channel::Channel) -> Result<()>,
    {
        match self.channels.get(channel_id) {
            Some(channel) => {
                let res = f(&channel);
                // closed channels leave the registry, their id is reusable
                if channel.status().is_exited() {
                    self.channels.remove(channel_id);
                }
                res
            }
            None => {
                // can trail behind a close, not worth killing the connection
                warn!("frame for unknown channel {}, dropping it", channel_id);
                Ok(())
            }
        }
    }

    fn flush_outbound(&mut self) -> Result<()> {
        while !self.shutting_down && self.write_buffer.len() - self.write_pos < WRITE_HIGH_WATER {
            match self.frames.pop() {
                Some(Outbound::Frame(frame)) => {
                    trace!("io loop serializing {:?}", frame);
                    let bytes = serialize_frame(&frame)?;
                    self.write_buffer.extend_from_slice(&bytes);
                }
                Some(Outbound::Shutdown) => {
                    debug!("shutdown sentinel reached");
                    self.shutting_down = true;
                }
                None => break,
            }
        }
        self.write()
    }

    fn write(&mut self) -> Result<()> {
        while self.can_write && self.write_pos < self.write_buffer.len() {
            match self.stream.write(&self.write_buffer[self.write_pos..]) {
                Ok(0) => {
                    return Err(Error::ConnectionReset(Arc::new(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "the server stopped accepting bytes",
                    ))))
                }
                Ok(n) => {
                    self.write_pos += n;
                    self.heartbeat.record_write();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.can_write = false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::ConnectionReset(Arc::new(e))),
            }
        }
        if self.write_pos >= self.write_buffer.len() {
            self.write_buffer.clear();
            self.write_pos = 0;
        }
        Ok(())
    }

    fn check_heartbeats(&mut self) -> Result<()> {
        if !self.heartbeats_armed() {
            return Ok(());
        }
        let interval = self.configuration.heartbeat();
        if interval == 0 {
            return Ok(());
        }
        let interval = Duration::from_secs(u64::from(interval));
        let now = Instant::now();
        if self.heartbeat.peer_expired(now, interval) {
            return Err(Error::ConnectionReset(Arc::new(io::Error::new(
                io::ErrorKind::TimedOut,
                "missed heartbeats from server",
            ))));
        }
        if self.heartbeat.should_send(now, interval) && !self.shutting_down {
            trace!("emitting heartbeat");
            let bytes = serialize_frame(&AMQPFrame::Heartbeat(0))?;
            self.write_buffer.extend_from_slice(&bytes);
            self.write()?;
        }
        Ok(())
    }

    /// Routes a fatal failure through the connection: mark the state,
    /// best-effort tell the server when it was a protocol error, then wake
    /// every waiter with the error.
    fn fail(&mut self, error: Error) {
        error!("io loop terminating: {}", error);
        if let Error::ProtocolError(amqp_error) = &error {
            let close = AMQPFrame::Method(
                0,
                AMQPClass::Connection(protocol::connection::AMQPMethod::Close(
                    protocol::connection::Close {
                        reply_code: amqp_error.get_id(),
                        reply_text: amqp_error.get_message().clone(),
                        class_id: 0,
                        method_id: 0,
                    },
                )),
            );
            if let Ok(bytes) = serialize_frame(&close) {
                let _ = self.stream.write(&bytes);
            }
        }
        self.status.set_state(ConnectionState::Closed);
        self.status.set_error(error.clone());
        self.channel0.poison(error.clone());
        self.channels.poison(error);
    }
}
