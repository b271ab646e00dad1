//! Server side: a listener plus the set of accepted channels, all driven off
//! one poll. Channel slots are recycled through a free list; connectivity
//! changes accumulate until the application drains them.

use crate::buffer::ChunkPool;
use crate::channel::{Channel, ChannelState};
use crate::config::EndpointConfig;
use crate::module::Module;
use indexmap::IndexSet;
use lumen::logging;
use lumen::shared::{NetworkError, NetworkResult};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type ChannelId = usize;

/// Produces the module set installed on every accepted channel.
pub type ModuleFactory = Box<dyn FnMut() -> Vec<Box<dyn Module>>>;

/// Describes a change in the connectivity status of a channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionChange {
    Connected(ChannelId),
    Disconnected(ChannelId),
}

pub struct Endpoint {
    listener: TcpListener,

    poll: Poll,
    events: Events,

    pool: Arc<ChunkPool>,
    config: EndpointConfig,
    module_factory: ModuleFactory,

    channels: Vec<Channel>,
    free: Vec<ChannelId>,
    live: IndexSet<ChannelId>,
    last_ingress: Vec<Instant>,

    changes: Vec<ConnectionChange>,

    log: logging::Logger,
}

const LISTENER_TOKEN: Token = Token(0);
const EVENT_CAPACITY: usize = 1024;

impl Endpoint {
    /// Bind the listener described by `config`. Accepted channels share
    /// `pool` and get a fresh module set from `module_factory`.
    pub fn bind<'a, L: Into<Option<&'a logging::Logger>>>(
        config: EndpointConfig,
        pool: &Arc<ChunkPool>,
        module_factory: ModuleFactory,
        log: L,
    ) -> NetworkResult<Endpoint> {
        let endpoint_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        let address: SocketAddr = config.address.parse()?;
        let mut listener = TcpListener::bind(address)?;

        let poll = Poll::new().map_err(NetworkError::from)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        logging::info!(endpoint_log, "endpoint bound"; "context" => "bind", "address" => %address);

        Ok(Endpoint {
            listener,
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            pool: pool.clone(),
            config,
            module_factory,
            channels: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            last_ingress: Vec::new(),
            changes: Vec::new(),
            log: endpoint_log,
        })
    }

    /// The address the listener actually bound to.
    pub fn local_addr(&self) -> NetworkResult<SocketAddr> {
        self.listener.local_addr().map_err(Into::into)
    }

    /// Borrow a live channel, e.g. to send on it.
    pub fn channel_mut(&mut self, id: ChannelId) -> &mut Channel {
        &mut self.channels[id]
    }

    /// Drains all the changes accumulated since the last `sync`.
    #[inline]
    pub fn changes(&mut self) -> impl Iterator<Item = ConnectionChange> + '_ {
        self.changes.drain(..)
    }

    /// One drive pass: accept pending connections, service ready channels,
    /// run housekeeping. `now` feeds the idle-timeout bookkeeping.
    pub fn sync(&mut self, now: Instant, timeout: Option<Duration>) -> NetworkResult<()> {
        self.housekeeping(now);

        if let Err(error) = self.poll.poll(&mut self.events, timeout) {
            if error.kind() != io::ErrorKind::Interrupted {
                return Err(error.into());
            }
        }

        let mut ready = Vec::new();
        let mut accept = false;

        for event in self.events.iter() {
            if event.token() == LISTENER_TOKEN {
                accept = true;
            } else {
                ready.push((event.token().0 - 1, event.is_readable(), event.is_writable()));
            }
        }

        if accept {
            self.accept_pending(now)?;
        }

        for (id, readable, writable) in ready {
            if !self.live.contains(&id) {
                continue;
            }

            if readable {
                self.last_ingress[id] = now;
            }

            let result = self.channels[id].drive(readable, writable);

            if result.is_err() || self.channels[id].state() != ChannelState::Connected {
                self.reclaim(id);
            }
        }

        // Push out anything the application queued between syncs.
        let live: Vec<ChannelId> = self.live.iter().copied().collect();
        for id in live {
            if self.channels[id].drive(false, false).is_err() {
                self.reclaim(id);
            }
        }

        Ok(())
    }

    fn accept_pending(&mut self, now: Instant) -> NetworkResult<()> {
        loop {
            match self.listener.accept() {
                Ok((socket, peer)) => {
                    logging::debug!(self.log, "accepting connection";
                                    "context" => "accept",
                                    "peer" => %peer);
                    self.open_channel(socket, now)?;
                }
                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn open_channel(&mut self, socket: mio::net::TcpStream, now: Instant) -> NetworkResult<()> {
        let mut channel = Channel::accept(&self.pool, self.config.channel.clone(), socket, &self.log);

        // Retrieve a recycled slot or grow the table.
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.channels.push(Channel::new(&self.pool, self.config.channel.clone(), None));
                self.last_ingress.push(now);
                self.channels.len() - 1
            }
        };

        channel.register(self.poll.registry(), Token(id + 1))?;

        for module in (self.module_factory)() {
            channel.add_boxed_module(module);
        }

        self.channels[id] = channel;
        self.last_ingress[id] = now;
        self.live.insert(id);
        self.changes.push(ConnectionChange::Connected(id));

        Ok(())
    }

    fn reclaim(&mut self, id: ChannelId) {
        logging::debug!(self.log, "reclaiming channel"; "context" => "reclaim", "channel_id" => id);

        drop(self.channels[id].disconnect());
        self.live.swap_remove(&id);
        self.free.push(id);
        self.changes.push(ConnectionChange::Disconnected(id));
    }

    /// Disconnect channels whose ingress has been silent past the configured
    /// timeout. A timeout of zero disables the check.
    fn housekeeping(&mut self, now: Instant) {
        if self.config.idle_timeout_secs == 0 {
            return;
        }

        let timeout = Duration::from_secs(self.config.idle_timeout_secs);
        let idle: Vec<ChannelId> = self
            .live
            .iter()
            .copied()
            .filter(|&id| now.duration_since(self.last_ingress[id]) >= timeout)
            .collect();

        for id in idle {
            logging::debug!(self.log, "channel idle timeout"; "context" => "housekeeping", "channel_id" => id);
            self.reclaim(id);
        }
    }
}
