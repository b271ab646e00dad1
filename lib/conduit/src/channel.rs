//! The channel runtime: socket lifecycle, optional TLS upgrade, the receive
//! pump feeding inbound bytes through the pipeline, the outbound backlog,
//! and the module registry.

use crate::buffer::{ChunkPool, ChunkedBuffer};
use crate::config::ChannelConfig;
use crate::module::Module;
use crate::pipeline::{Direction, HandlerId, Item, Op, Pipeline, Position};
use crate::tls::{CertValidator, TlsProvider, TlsSession};
use lumen::logging;
use lumen::shared::{ErrorType, ErrorUtils, NetworkError, NetworkResult};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Registry, Token};
use std::any::{Any, TypeId};
use std::io;
use std::net::{Shutdown, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    TlsHandshaking,
    Connected,
    Disconnecting,
}

/// Identity of a registered module, used for removal.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ModuleId(usize);

/// The socket, possibly wrapped by a host TLS session.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<dyn TlsSession>),
}

impl Transport {
    fn socket(&self) -> &TcpStream {
        match self {
            Transport::Plain(socket) => socket,
            Transport::Tls(session) => session.socket(),
        }
    }

    fn socket_mut(&mut self) -> &mut TcpStream {
        match self {
            Transport::Plain(socket) => socket,
            Transport::Tls(session) => session.socket_mut(),
        }
    }
}

impl io::Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(socket) => io::Read::read(socket, buf),
            Transport::Tls(session) => session.read(buf),
        }
    }
}

impl io::Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(socket) => io::Write::write(socket, buf),
            Transport::Tls(session) => session.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A single endpoint of a connection. Client channels own their poll and
/// drive themselves through `service`/`run`; server channels are registered
/// on an endpoint's poll and driven by it.
pub struct Channel {
    state: ChannelState,
    transport: Option<Transport>,

    pool: Arc<ChunkPool>,
    config: ChannelConfig,

    pipeline: Pipeline,
    modules: Vec<Option<Box<dyn Module>>>,

    inbound: Option<ChunkedBuffer>,
    outbound: ChunkedBuffer,

    // Present on self-driven (client) channels only.
    poll: Option<Poll>,
    events: Events,
    // Present whenever the socket is registered somewhere.
    registry: Option<Registry>,
    token: Token,
    writable_armed: bool,

    handshake_callbacks: Vec<Box<dyn FnMut(&mut Channel)>>,
    handshake_pending: bool,

    error: Option<ErrorType>,

    log: logging::Logger,
}

const CLIENT_TOKEN: Token = Token(0);
const EVENT_CAPACITY: usize = 256;

impl Channel {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        pool: &Arc<ChunkPool>,
        config: ChannelConfig,
        log: L,
    ) -> Channel {
        let channel_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        Channel {
            state: ChannelState::Disconnected,
            transport: None,
            pool: pool.clone(),
            outbound: ChunkedBuffer::new(pool),
            inbound: None,
            config,
            pipeline: Pipeline::new(),
            modules: Vec::new(),
            poll: None,
            events: Events::with_capacity(EVENT_CAPACITY),
            registry: None,
            token: CLIENT_TOKEN,
            writable_armed: false,
            handshake_callbacks: Vec::new(),
            handshake_pending: false,
            error: None,
            log: channel_log,
        }
    }

    /// Wraps an already-established server-side socket. The caller registers
    /// the channel on its poll and installs modules afterwards.
    pub fn accept<'a, L: Into<Option<&'a logging::Logger>>>(
        pool: &Arc<ChunkPool>,
        config: ChannelConfig,
        socket: TcpStream,
        log: L,
    ) -> Channel {
        let mut channel = Channel::new(pool, config, log);

        channel.transport = Some(Transport::Plain(socket));
        channel.inbound = Some(ChunkedBuffer::new(pool));
        channel.state = ChannelState::Connected;

        logging::debug!(channel.log, "channel accepted"; "context" => "accept");

        channel
    }

    #[inline]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    #[inline]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    #[inline]
    pub fn pool(&self) -> &Arc<ChunkPool> {
        &self.pool
    }

    /// The error that tore the channel down, if any.
    #[inline]
    pub fn last_error(&self) -> Option<&ErrorType> {
        self.error.as_ref()
    }

    /// Open the connection: resolve, connect, start the receive machinery
    /// and install registered modules. Blocks on socket readiness; callers
    /// wanting a bounded wait wrap the call externally.
    pub fn connect(&mut self, address: &str) -> NetworkResult<()> {
        self.start_connect(address)?;
        self.finish_connect()
    }

    /// Like `connect`, but upgrades the socket through the host TLS stack
    /// before the channel goes live.
    pub fn connect_with_tls(
        &mut self,
        address: &str,
        server_name: &str,
        provider: &dyn TlsProvider,
        validator: CertValidator,
    ) -> NetworkResult<()> {
        self.start_connect(address)?;
        self.state = ChannelState::TlsHandshaking;

        let socket = match self.transport.take() {
            Some(Transport::Plain(socket)) => socket,
            _ => unreachable!(),
        };

        let session = match provider.client_session(socket, server_name, validator) {
            Ok(session) => session,
            Err(_) => return Err(self.abort(ErrorType::Tls)),
        };
        self.transport = Some(Transport::Tls(session));

        loop {
            let progress = match &mut self.transport {
                Some(Transport::Tls(session)) => session.handshake(),
                _ => unreachable!(),
            };

            match progress {
                Ok(true) => break,
                Ok(false) | Err(NetworkError::Incomplete) => self.wait_for_readiness()?,
                Err(_) => return Err(self.abort(ErrorType::Tls)),
            }
        }

        logging::debug!(self.log, "tls session established"; "context" => "connect");

        self.finish_connect()
    }

    fn start_connect(&mut self, address: &str) -> NetworkResult<()> {
        if self.state != ChannelState::Disconnected {
            panic!("Attempted to connect an already open channel");
        }

        logging::debug!(self.log, "connecting"; "context" => "connect", "address" => address);

        let target = address
            .to_socket_addrs()
            .map_err(|_| NetworkError::Fatal(ErrorType::AddrParse))?
            .next()
            .ok_or(NetworkError::Fatal(ErrorType::AddrParse))?;

        self.error = None;
        self.state = ChannelState::Connecting;

        let mut socket = match TcpStream::connect(target) {
            Ok(socket) => socket,
            Err(error) => return Err(self.abort(ErrorType::Io(error.kind()))),
        };

        let poll = match Poll::new() {
            Ok(poll) => poll,
            Err(error) => return Err(self.abort(ErrorType::Io(error.kind()))),
        };

        let registry = match poll.registry().try_clone() {
            Ok(registry) => registry,
            Err(error) => return Err(self.abort(ErrorType::Io(error.kind()))),
        };

        if let Err(error) = poll.registry().register(
            &mut socket,
            CLIENT_TOKEN,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            return Err(self.abort(ErrorType::Io(error.kind())));
        }

        self.poll = Some(poll);
        self.registry = Some(registry);
        self.token = CLIENT_TOKEN;
        self.writable_armed = true;
        self.transport = Some(Transport::Plain(socket));

        // Wait until the connect either completes or is refused.
        loop {
            self.wait_for_readiness()?;

            let (socket_error, peer) = match &self.transport {
                Some(transport) => {
                    let socket = transport.socket();
                    (socket.take_error(), socket.peer_addr())
                }
                None => return Err(NetworkError::Fatal(ErrorType::Aborted)),
            };

            match socket_error {
                Ok(Some(error)) => return Err(self.abort(ErrorType::Io(error.kind()))),
                Ok(None) => {}
                Err(error) => return Err(self.abort(ErrorType::Io(error.kind()))),
            }

            match peer {
                Ok(_) => break,
                Err(ref error) if error.kind() == io::ErrorKind::NotConnected => {}
                Err(ref error) if error.raw_os_error() == Some(libc::EINPROGRESS) => {}
                Err(error) => return Err(self.abort(ErrorType::Io(error.kind()))),
            }
        }

        Ok(())
    }

    fn finish_connect(&mut self) -> NetworkResult<()> {
        self.state = ChannelState::Connected;
        self.inbound = Some(ChunkedBuffer::new(&self.pool));
        self.update_interest()?;

        logging::debug!(self.log, "channel connected"; "context" => "connect");

        for index in 0..self.modules.len() {
            self.install_module_at(index);
        }

        Ok(())
    }

    /// One blocking poll pass used while connecting / handshaking.
    fn wait_for_readiness(&mut self) -> NetworkResult<()> {
        let poll = match self.poll.as_mut() {
            Some(poll) => poll,
            None => panic!("Channel has no poll to wait on"),
        };

        match poll.poll(&mut self.events, None) {
            Ok(()) => Ok(()),
            Err(error) => Err(self.abort(ErrorType::Io(error.kind()))),
        }
    }

    /// Flush the send backlog, close the socket and return every buffer to
    /// the pool. The error that caused an earlier teardown, if any, is
    /// surfaced to the caller.
    pub fn disconnect(&mut self) -> NetworkResult<()> {
        match self.state {
            ChannelState::Disconnected => {}
            ChannelState::Disconnecting => {}
            _ => {
                self.state = ChannelState::Disconnecting;

                logging::debug!(self.log, "disconnecting";
                                "context" => "disconnect",
                                "outbound" => self.outbound.available());

                drop(self.flush());
                self.uninstall_modules();
                self.close_transport();
            }
        }

        match self.error.take() {
            Some(error) => Err(NetworkError::Fatal(error)),
            None => Ok(()),
        }
    }

    /// Run the outgoing chain over `value`; the final object must reduce to
    /// a `ChunkedBuffer` or raw bytes, which join the send backlog.
    pub fn send<T: Any>(&mut self, value: T) -> NetworkResult<()> {
        if self.state != ChannelState::Connected {
            return Err(NetworkError::Fatal(ErrorType::Aborted));
        }

        let mut item = Item::new(value);
        self.handle_outgoing(&mut item)?;

        if let Some(mut buffer) = item.take::<ChunkedBuffer>() {
            buffer.drain_to(&mut self.outbound)?;
            drop(buffer.dispose());
        } else if let Some(bytes) = item.take::<Vec<u8>>() {
            self.outbound.write(&bytes)?;
        } else {
            return Err(NetworkError::Fatal(ErrorType::Unhandled));
        }

        match self.flush() {
            Ok(()) => Ok(()),
            Err(NetworkError::Fatal(error)) => Err(self.abort(error)),
            Err(other) => Err(other),
        }
    }

    /// Convenience for sending raw bytes through the outgoing chain.
    pub fn send_bytes(&mut self, bytes: &[u8]) -> NetworkResult<()> {
        let mut buffer = ChunkedBuffer::new(&self.pool);
        buffer.write(bytes)?;
        self.send(buffer)
    }

    /// One non-blocking service pass on a self-driven channel: wait for
    /// readiness up to `timeout`, then receive, pump and flush.
    pub fn service(&mut self, timeout: Option<Duration>) -> NetworkResult<()> {
        if self.state != ChannelState::Connected {
            return Err(NetworkError::Fatal(ErrorType::Aborted));
        }

        let poll = match self.poll.as_mut() {
            Some(poll) => poll,
            None => panic!("Channel is not driving its own poll"),
        };

        if let Err(error) = poll.poll(&mut self.events, timeout) {
            if error.kind() != io::ErrorKind::Interrupted {
                let error = ErrorType::Io(error.kind());
                return Err(self.abort(error));
            }
        }

        let mut readable = false;
        let mut writable = false;

        for event in self.events.iter() {
            if event.token() == self.token {
                readable |= event.is_readable();
                writable |= event.is_writable();
            }
        }

        self.drive(readable, writable)
    }

    /// Service the channel until it disconnects. Returns the surfaced error
    /// on failure and `Ok` on a clean peer close.
    pub fn run(&mut self) -> NetworkResult<()> {
        while self.state == ChannelState::Connected {
            self.service(None)?;
        }

        match self.error.take() {
            Some(error) => Err(NetworkError::Fatal(error)),
            None => Ok(()),
        }
    }

    /// Drive one readiness cycle. Fatal errors tear the channel down.
    pub fn drive(&mut self, readable: bool, writable: bool) -> NetworkResult<()> {
        let result = self.drive_inner(readable, writable);

        match result {
            Ok(()) => Ok(()),
            Err(NetworkError::Incomplete) => Ok(()),
            Err(NetworkError::Fatal(error)) => Err(self.abort(error)),
        }
    }

    fn drive_inner(&mut self, readable: bool, writable: bool) -> NetworkResult<()> {
        if readable {
            self.receive()?;
        }

        if writable || self.outbound.available() > 0 {
            self.flush()?;
        }

        self.update_interest()
    }

    /// Read everything the socket has, then pump the pipeline.
    pub fn receive(&mut self) -> NetworkResult<()> {
        let transport = match &mut self.transport {
            Some(transport) => transport,
            None => return Ok(()),
        };

        let mut inbound = match self.inbound.take() {
            Some(inbound) => inbound,
            None => ChunkedBuffer::new(&self.pool),
        };

        let result = inbound.ingress(transport);
        self.inbound = Some(inbound);

        let (received, closed) = result?;

        logging::trace!(self.log, "received data";
                        "context" => "receive",
                        "count" => received,
                        "peer_closed" => closed);

        self.pump()?;

        if closed {
            logging::debug!(self.log, "peer closed connection"; "context" => "receive");
            self.state = ChannelState::Disconnecting;
            self.uninstall_modules();
            self.close_transport();
        }

        Ok(())
    }

    /// Feed the inbound buffer through the incoming chain until a pass stops
    /// making progress, as observed on the read cursor.
    fn pump(&mut self) -> NetworkResult<()> {
        loop {
            let buffer = match self.inbound.take() {
                Some(buffer) => buffer,
                None => return Ok(()),
            };

            if buffer.available() == 0 {
                self.inbound = Some(buffer);
                return Ok(());
            }

            let pre_read = buffer.read_position();

            let mut item = Item::new(buffer);
            let result = self.handle_incoming(&mut item);

            // A codec handler normally parks the buffer back on the channel
            // before rewriting the item; reclaim it from the item otherwise.
            if self.inbound.is_none() && item.is::<ChunkedBuffer>() {
                self.inbound = item.take::<ChunkedBuffer>();
            }

            // Whatever non-buffer object is left over was consumed by no
            // handler and gets disposed here.
            drop(item);

            match result {
                Ok(()) | Err(NetworkError::Incomplete) => {}
                Err(error) => return Err(error),
            }

            let progressed = match &mut self.inbound {
                Some(buffer) => {
                    buffer.compact();
                    buffer.read_position() != pre_read && buffer.available() > 0
                }
                None => return Ok(()),
            };

            if !progressed {
                return Ok(());
            }
        }
    }

    /// Push backlog bytes to the socket until it would block.
    pub fn flush(&mut self) -> NetworkResult<()> {
        if self.outbound.available() == 0 {
            return self.update_interest();
        }

        let sent = match &mut self.transport {
            Some(transport) => self.outbound.egress(transport)?,
            None => return Ok(()),
        };

        logging::trace!(self.log, "flushed data";
                        "context" => "flush",
                        "count" => sent,
                        "backlog" => self.outbound.available());

        self.update_interest()
    }

    /// Arm writable interest while a backlog exists, disarm once drained.
    fn update_interest(&mut self) -> NetworkResult<()> {
        let want_writable = self.outbound.available() > 0;

        if want_writable == self.writable_armed {
            return Ok(());
        }

        if let (Some(registry), Some(transport)) = (&self.registry, &mut self.transport) {
            let interest = if want_writable {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };

            registry.reregister(transport.socket_mut(), self.token, interest)?;
            self.writable_armed = want_writable;
        }

        Ok(())
    }

    /// Tear the channel down because of `error`, which is kept for the
    /// disconnect waiter.
    fn abort(&mut self, error: ErrorType) -> NetworkError {
        logging::warn!(self.log, "channel aborted";
                       "context" => "abort",
                       "error" => ?error);

        self.uninstall_modules();
        self.close_transport();
        self.error = Some(error);

        NetworkError::Fatal(error)
    }

    fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Transport::Tls(session) = &mut transport {
                session.shutdown();
            }
            drop(transport.socket().shutdown(Shutdown::Both));
        }

        self.poll = None;
        self.registry = None;
        self.writable_armed = false;

        if let Some(mut inbound) = self.inbound.take() {
            drop(inbound.dispose());
        }

        let mut outbound = std::mem::replace(&mut self.outbound, ChunkedBuffer::new(&self.pool));
        drop(outbound.dispose());

        self.state = ChannelState::Disconnected;

        logging::debug!(self.log, "channel closed"; "context" => "close");
    }

    /// Register the channel's socket on an external poll (server side).
    pub fn register(&mut self, registry: &Registry, token: Token) -> NetworkResult<()> {
        let transport = match &mut self.transport {
            Some(transport) => transport,
            None => panic!("Can't register a disconnected channel"),
        };

        registry.register(transport.socket_mut(), token, Interest::READABLE)?;

        self.registry = Some(registry.try_clone().map_err(NetworkError::from)?);
        self.token = token;
        self.writable_armed = false;

        Ok(())
    }

    pub fn deregister(&mut self) -> NetworkResult<()> {
        if let (Some(registry), Some(transport)) = (&self.registry, &mut self.transport) {
            registry.deregister(transport.socket_mut())?;
        }

        self.registry = None;

        Ok(())
    }
}

// Pipeline surface.
impl Channel {
    pub fn add_incoming_first<T: Any, F>(&mut self, handler: F) -> HandlerId
    where
        F: FnMut(&mut Channel, &mut Item) -> NetworkResult<()> + 'static,
    {
        self.pipeline
            .add(Direction::Incoming, Position::First, TypeId::of::<T>(), Box::new(handler))
    }

    pub fn add_incoming_last<T: Any, F>(&mut self, handler: F) -> HandlerId
    where
        F: FnMut(&mut Channel, &mut Item) -> NetworkResult<()> + 'static,
    {
        self.pipeline
            .add(Direction::Incoming, Position::Last, TypeId::of::<T>(), Box::new(handler))
    }

    pub fn add_outgoing_first<T: Any, F>(&mut self, handler: F) -> HandlerId
    where
        F: FnMut(&mut Channel, &mut Item) -> NetworkResult<()> + 'static,
    {
        self.pipeline
            .add(Direction::Outgoing, Position::First, TypeId::of::<T>(), Box::new(handler))
    }

    pub fn add_outgoing_last<T: Any, F>(&mut self, handler: F) -> HandlerId
    where
        F: FnMut(&mut Channel, &mut Item) -> NetworkResult<()> + 'static,
    {
        self.pipeline
            .add(Direction::Outgoing, Position::Last, TypeId::of::<T>(), Box::new(handler))
    }

    pub fn remove_incoming(&mut self, id: HandlerId) {
        self.pipeline.remove(Direction::Incoming, id);
    }

    pub fn remove_outgoing(&mut self, id: HandlerId) {
        self.pipeline.remove(Direction::Outgoing, id);
    }

    /// Run the incoming chain over `item` directly.
    pub fn handle_incoming(&mut self, item: &mut Item) -> NetworkResult<()> {
        let mut chain = self.pipeline.begin_dispatch(Direction::Incoming);
        let result = chain.dispatch(self, Direction::Incoming, item);
        self.pipeline.end_dispatch(Direction::Incoming, chain);

        self.run_handshake_callbacks();

        result
    }

    /// Run the outgoing chain over `item` directly.
    pub fn handle_outgoing(&mut self, item: &mut Item) -> NetworkResult<()> {
        let mut chain = self.pipeline.begin_dispatch(Direction::Outgoing);
        let result = chain.dispatch(self, Direction::Outgoing, item);
        self.pipeline.end_dispatch(Direction::Outgoing, chain);

        result
    }

    pub(crate) fn pipeline_pending(&mut self, direction: Direction) -> Vec<Op> {
        self.pipeline.take_pending(direction)
    }

    /// Hand the inbound buffer back to the channel. Codec handlers call this
    /// after pulling a complete frame out, before rewriting the in-flight
    /// item into the decoded frame.
    pub fn restore_inbound(&mut self, buffer: ChunkedBuffer) {
        self.inbound = Some(buffer);
    }
}

// Module registry and handshake notifications.
impl Channel {
    /// Register a module. Installation runs immediately when the channel is
    /// already connected; install errors are reported but not fatal.
    pub fn add_module<M: Module + 'static>(&mut self, module: M) -> ModuleId {
        self.add_boxed_module(Box::new(module))
    }

    pub fn add_boxed_module(&mut self, module: Box<dyn Module>) -> ModuleId {
        self.modules.push(Some(module));
        let id = ModuleId(self.modules.len() - 1);

        if self.state == ChannelState::Connected {
            self.install_module_at(id.0);
        }

        id
    }

    /// Unregister a module, running its uninstall callback when connected.
    pub fn remove_module(&mut self, id: ModuleId) {
        let mut module = match self.modules.get_mut(id.0).and_then(|slot| slot.take()) {
            Some(module) => module,
            None => return,
        };

        if self.state == ChannelState::Connected {
            let result = module.uninstall(self);

            if result.has_failed() {
                logging::warn!(self.log, "module uninstall failed";
                               "context" => "remove_module",
                               "module" => module.name());
            }
        }
    }

    /// Register a callback fired when a protocol module reports that its
    /// upgrade handshake finished.
    pub fn on_handshake_complete<F: FnMut(&mut Channel) + 'static>(&mut self, callback: F) {
        self.handshake_callbacks.push(Box::new(callback));
    }

    /// Called by modules once their handshake completes. The callbacks run
    /// after the current pipeline pass unwinds.
    pub fn notify_handshake_complete(&mut self) {
        self.handshake_pending = true;
    }

    fn run_handshake_callbacks(&mut self) {
        if !self.handshake_pending {
            return;
        }
        self.handshake_pending = false;

        let mut callbacks = std::mem::take(&mut self.handshake_callbacks);
        for callback in callbacks.iter_mut() {
            callback(self);
        }

        let mut added = std::mem::replace(&mut self.handshake_callbacks, callbacks);
        self.handshake_callbacks.append(&mut added);
    }

    fn install_module_at(&mut self, index: usize) {
        if let Some(mut module) = self.modules[index].take() {
            let result = module.install(self);

            if result.has_failed() {
                logging::warn!(self.log, "module install failed";
                               "context" => "install",
                               "module" => module.name());
            } else {
                logging::debug!(self.log, "module installed";
                                "context" => "install",
                                "module" => module.name());
            }

            self.modules[index] = Some(module);
        }
    }

    fn uninstall_modules(&mut self) {
        for index in 0..self.modules.len() {
            if let Some(mut module) = self.modules[index].take() {
                let result = module.uninstall(self);

                if result.has_failed() {
                    logging::warn!(self.log, "module uninstall failed";
                                   "context" => "uninstall",
                                   "module" => module.name());
                }

                self.modules[index] = Some(module);
            }
        }
    }
}
