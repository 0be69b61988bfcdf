//! Single-threaded reactor.
//!
//! Readiness-based model: the selector reports which sockets are ready, then
//! the loop performs non-blocking accept/read/write calls and echoes every
//! byte back to its sender.
//!
//! ## Lifecycle
//!
//! ```text
//! Initializing -> Listening -> Running -> ShuttingDown -> Stopped
//! ```
//!
//! [`Reactor::bind`] covers `Initializing` and leaves the reactor `Listening`.
//! [`Reactor::run`] loops until [`ReactorHandle::shutdown`] is called, then
//! closes every connection and the listener.
//!
//! ## Ownership
//!
//! The reactor owns the selector, the registry and every connection buffer.
//! Buffers are `!Send`, which makes the reactor `!Send` too: it is built and
//! run on the same thread. Other threads talk to it only through the
//! [`ReactorHandle`].
//!
//! ## Echo path
//!
//! A readable connection is read until the socket has nothing more. After each
//! read the buffer is flipped and written back. When the socket stops taking
//! bytes the remainder stays in the buffer, the connection switches to write
//! interest, and reading resumes only after a later writable event has flushed
//! it.

use crate::runtime::buffer::BufferPool;
use crate::runtime::channel::{ListenChannel, ReadOutcome, StreamChannel};
use crate::runtime::connection::{ConnState, Connection, ConnectionRegistry};
use crate::runtime::error::ReactorError;
use crate::runtime::selector::{Ops, Ready, Selector};
use mio::{Token, Waker};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Greeting sent to every new connection unless disabled.
pub const DEFAULT_GREETING: &[u8] = b"Hi there!\r\n";

/// Lifecycle state of a [`Reactor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorState {
    Initializing,
    Listening,
    Running,
    ShuttingDown,
    Stopped,
}

/// Selector attachment: what kind of channel a token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Listener,
    Connection,
}

/// Reactor settings.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    pub addr: SocketAddr,
    pub backlog: i32,
    pub max_connections: usize,
    /// Capacity of each connection buffer.
    pub buffer_size: usize,
    /// Maximum events handled per wake.
    pub batch_size: usize,
    /// `None` waits indefinitely; zero is rejected.
    pub poll_timeout: Option<Duration>,
    pub greeting: Option<Vec<u8>>,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 1234)),
            backlog: 1024,
            max_connections: 10_000,
            buffer_size: 1024,
            batch_size: 1024,
            poll_timeout: None,
            greeting: Some(DEFAULT_GREETING.to_vec()),
        }
    }
}

impl ReactorConfig {
    fn validate(&self) -> Result<(), ReactorError> {
        if self.poll_timeout == Some(Duration::ZERO) {
            return Err(ReactorError::InvalidConfig("poll timeout must be non-zero"));
        }
        if self.buffer_size == 0 {
            return Err(ReactorError::InvalidConfig("buffer size must be non-zero"));
        }
        if self.max_connections == 0 {
            return Err(ReactorError::InvalidConfig("max connections must be non-zero"));
        }
        // Connection ids share the token space with the reserved tokens
        if self.max_connections >= WAKER_TOKEN.0 {
            return Err(ReactorError::InvalidConfig("max connections too large"));
        }
        if self
            .greeting
            .as_ref()
            .is_some_and(|g| g.len() > self.buffer_size)
        {
            return Err(ReactorError::InvalidConfig(
                "greeting does not fit in a connection buffer",
            ));
        }
        Ok(())
    }
}

struct Shared {
    stop: AtomicBool,
    connections: AtomicUsize,
    waker: Waker,
    local_addr: SocketAddr,
}

/// Thread-safe handle for observing and stopping a reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl ReactorHandle {
    /// Ask the reactor to stop after its current batch of events.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Err(e) = self.shared.waker.wake() {
            warn!(error = %e, "Failed to wake reactor");
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    /// Live connections as of the reactor's last accept or close.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }
}

/// Single-threaded echo reactor.
pub struct Reactor {
    config: ReactorConfig,
    state: ReactorState,
    selector: Selector<Endpoint>,
    listener: Option<ListenChannel>,
    connections: ConnectionRegistry,
    buffers: BufferPool,
    shared: Arc<Shared>,
}

impl Reactor {
    /// Create the selector, bind the listener and register it for accepts.
    ///
    /// This is the only place fatal errors come from.
    pub fn bind(config: ReactorConfig) -> Result<Self, ReactorError> {
        debug!(state = ?ReactorState::Initializing, addr = %config.addr, "Initializing reactor");
        config.validate()?;

        let mut selector = Selector::new(config.batch_size).map_err(ReactorError::Selector)?;
        let mut listener = ListenChannel::bind(config.addr, config.backlog)?;
        selector.register(&mut listener, LISTENER_TOKEN, Ops::ACCEPT, Endpoint::Listener)?;
        let waker = selector.waker(WAKER_TOKEN)?;
        let buffers = BufferPool::new(config.max_connections, config.buffer_size)?;

        let local_addr = listener.local_addr();
        info!(
            addr = %local_addr,
            max_connections = config.max_connections,
            buffer_size = config.buffer_size,
            "Listening"
        );

        Ok(Self {
            connections: ConnectionRegistry::new(config.max_connections),
            config,
            state: ReactorState::Listening,
            selector,
            listener: Some(listener),
            buffers,
            shared: Arc::new(Shared {
                stop: AtomicBool::new(false),
                connections: AtomicUsize::new(0),
                waker,
                local_addr,
            }),
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> ReactorState {
        self.state
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run the event loop until shutdown is requested.
    ///
    /// Per-connection failures never end the loop. A failing selector does,
    /// after the reactor has shut down cleanly.
    pub fn run(&mut self) -> Result<(), ReactorError> {
        if self.state != ReactorState::Listening {
            return Err(ReactorError::InvalidState(self.state));
        }
        self.state = ReactorState::Running;
        info!("Reactor running");

        let mut ready = Vec::with_capacity(self.config.batch_size);
        let mut result = Ok(());

        while !self.shared.stop.load(Ordering::Acquire) {
            match self.selector.select(&mut ready, self.config.poll_timeout) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Selector failed");
                    result = Err(ReactorError::Selector(e));
                    break;
                }
            }

            for event in ready.iter() {
                self.dispatch(*event);
            }
        }

        self.shutdown();
        result
    }

    fn dispatch(&mut self, event: Ready) {
        match self.selector.attachment(event.token).copied() {
            Some(Endpoint::Listener) if event.ops.is_acceptable() => self.accept_connections(),
            Some(Endpoint::Connection) => {
                let conn_id = event.token.0;
                if let Err(e) = self.handle_connection_event(conn_id, event.ops) {
                    debug!(conn_id, error = %e, "Connection error");
                    self.close_connection(conn_id);
                }
            }
            // Closed earlier in this batch
            _ => {}
        }
    }

    /// Accept until the backlog is empty.
    fn accept_connections(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            match listener.accept_nonblocking() {
                Ok(Some(channel)) => self.register_connection(channel),
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn register_connection(&mut self, mut channel: StreamChannel) {
        let peer = channel.peer_addr();

        if self.connections.is_full() {
            warn!(peer = %peer, "Connection limit reached, rejecting");
            reject(&mut channel);
            return;
        }
        let Some(buffer) = self.buffers.alloc() else {
            warn!(peer = %peer, "Buffer pool exhausted, rejecting connection");
            reject(&mut channel);
            return;
        };

        let conn_id = match self.connections.insert(Connection::new(channel, buffer)) {
            Ok(id) => id,
            Err(mut conn) => {
                reject(&mut conn.channel);
                self.buffers.free(conn.buffer);
                return;
            }
        };
        self.publish_connection_count();

        let registered = match self.connections.get_mut(conn_id) {
            Some(conn) => self.selector.register(
                &mut conn.channel,
                Token(conn_id),
                Ops::READ,
                Endpoint::Connection,
            ),
            None => return,
        };
        if let Err(e) = registered {
            warn!(conn_id, peer = %peer, error = %e, "Failed to register connection");
            self.close_connection(conn_id);
            return;
        }

        debug!(conn_id, peer = %peer, "Accepted connection");

        if self.config.greeting.is_some() {
            if let Err(e) = self.send_greeting(conn_id) {
                debug!(conn_id, error = %e, "Failed to greet");
                self.close_connection(conn_id);
            }
        }
    }

    fn send_greeting(&mut self, conn_id: usize) -> Result<(), ReactorError> {
        let Some(greeting) = self.config.greeting.as_deref() else {
            return Ok(());
        };
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };

        conn.buffer.clear();
        conn.buffer.put_slice(greeting)?;
        conn.buffer.flip();
        if conn.flush()? {
            conn.start_filling();
        } else {
            conn.start_draining();
            self.selector.register(
                &mut conn.channel,
                Token(conn_id),
                Ops::WRITE,
                Endpoint::Connection,
            )?;
        }
        Ok(())
    }

    fn handle_connection_event(&mut self, conn_id: usize, ops: Ops) -> Result<(), ReactorError> {
        if ops.is_writable() {
            self.handle_writable(conn_id)?;
        }
        if ops.is_readable() {
            self.handle_readable(conn_id)?;
        }
        Ok(())
    }

    /// Read and echo until the socket has nothing more or stops taking bytes.
    fn handle_readable(&mut self, conn_id: usize) -> Result<(), ReactorError> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };
        if conn.state != ConnState::Filling {
            return Ok(());
        }

        loop {
            match conn.channel.read_into(&mut conn.buffer)? {
                ReadOutcome::EndOfStream => {
                    debug!(conn_id, "Peer closed connection");
                    self.close_connection(conn_id);
                    return Ok(());
                }
                ReadOutcome::Read(0) => return Ok(()),
                ReadOutcome::Read(n) => {
                    trace!(conn_id, bytes = n, "Read");
                    conn.buffer.flip();
                    if conn.flush()? {
                        conn.start_filling();
                    } else {
                        trace!(conn_id, pending = conn.buffer.remaining(), "Socket full, awaiting writable");
                        conn.start_draining();
                        self.selector.register(
                            &mut conn.channel,
                            Token(conn_id),
                            Ops::WRITE,
                            Endpoint::Connection,
                        )?;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Continue a parked echo; once flushed, go back to reading.
    fn handle_writable(&mut self, conn_id: usize) -> Result<(), ReactorError> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };
        if conn.state != ConnState::Draining {
            return Ok(());
        }

        if !conn.flush()? {
            return Ok(());
        }

        conn.start_filling();
        self.selector.register(
            &mut conn.channel,
            Token(conn_id),
            Ops::READ,
            Endpoint::Connection,
        )?;

        // Input that arrived while draining produced no event of its own
        self.handle_readable(conn_id)
    }

    /// Deregister, close and forget a connection. Safe to call twice.
    fn close_connection(&mut self, conn_id: usize) {
        let Some(mut conn) = self.connections.remove(conn_id) else {
            return;
        };

        if let Err(e) = self.selector.deregister(&mut conn.channel, Token(conn_id)) {
            debug!(conn_id, error = %e, "Deregister failed");
        }
        if let Err(e) = conn.channel.close() {
            debug!(conn_id, error = %e, "Close failed");
        }
        self.buffers.free(conn.buffer);
        self.publish_connection_count();

        debug!(conn_id, peer = %conn.channel.peer_addr(), "Connection closed");
    }

    fn publish_connection_count(&self) {
        self.shared
            .connections
            .store(self.connections.len(), Ordering::Release);
    }

    fn shutdown(&mut self) {
        self.state = ReactorState::ShuttingDown;
        info!(connections = self.connections.len(), "Shutting down");

        // Stop accepting before tearing connections down
        let mut listener = self.listener.take();
        if let Some(listener) = listener.as_mut() {
            if let Err(e) = self.selector.deregister(listener, LISTENER_TOKEN) {
                debug!(error = %e, "Listener deregister failed");
            }
        }
        for conn_id in self.connections.ids() {
            self.close_connection(conn_id);
        }
        drop(listener);

        self.state = ReactorState::Stopped;
        info!("Reactor stopped");
    }
}

/// Close a connection that was never registered.
fn reject(channel: &mut StreamChannel) {
    if let Err(e) = channel.close() {
        debug!(peer = %channel.peer_addr(), error = %e, "Close failed");
    }
}
