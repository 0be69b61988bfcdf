//! Connection state machine and registry.
//!
//! Each connection owns its channel and its buffer. While `Filling` the buffer
//! collects input; while `Draining` it holds an echo the socket has not taken
//! yet, and no new input is read until it is flushed.

use crate::runtime::buffer::Buffer;
use crate::runtime::channel::StreamChannel;
use crate::runtime::error::ReactorError;
use slab::Slab;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Registered for read interest; the buffer is empty and filling.
    Filling,
    /// Registered for write interest; the buffer holds undrained bytes.
    Draining,
}

/// A single client connection.
pub struct Connection {
    pub channel: StreamChannel,
    pub buffer: Buffer,
    pub state: ConnState,
}

impl Connection {
    /// Create a new connection in the filling state.
    pub fn new(channel: StreamChannel, buffer: Buffer) -> Self {
        Self {
            channel,
            buffer,
            state: ConnState::Filling,
        }
    }

    /// Write the buffer out until it is empty or the socket stops taking bytes.
    ///
    /// Returns `true` once everything was written.
    pub fn flush(&mut self) -> Result<bool, ReactorError> {
        while self.buffer.has_remaining() {
            if self.channel.write_from(&mut self.buffer)? == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Park undrained bytes until the socket becomes writable.
    pub fn start_draining(&mut self) {
        self.state = ConnState::Draining;
    }

    /// Reset the buffer for the next read.
    pub fn start_filling(&mut self) {
        self.buffer.clear();
        self.state = ConnState::Filling;
    }
}

/// Registry of active connections using slab allocation.
///
/// Slab keys double as selector tokens. Provides O(1) insert, lookup and
/// remove.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Hands the connection back if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Result<usize, Connection> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    pub fn get(&self, id: usize) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection; `None` if it is already gone.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Ids of all live connections.
    pub fn ids(&self) -> Vec<usize> {
        self.connections.iter().map(|(id, _)| id).collect()
    }
}
