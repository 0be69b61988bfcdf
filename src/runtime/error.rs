//! Error taxonomy for the reactor.
//!
//! Fatal errors (`Bind`, `Selector`, `InvalidConfig`) only come out of
//! `Reactor::bind`. Everything else is scoped to a single connection and is
//! turned into close-and-log at the dispatch boundary.

use crate::runtime::buffer::BufferError;
use crate::runtime::event_loop::ReactorState;
use mio::Token;
use std::fmt;
use std::io;
use std::net::SocketAddr;

#[derive(Debug)]
pub enum ReactorError {
    /// The listening socket could not be created or bound.
    Bind { addr: SocketAddr, source: io::Error },
    /// The readiness selector could not be created or polled.
    Selector(io::Error),
    /// Rejected reactor settings.
    InvalidConfig(&'static str),
    /// A single accept attempt failed.
    Accept(io::Error),
    /// Read or write failure on a connection.
    Io(io::Error),
    /// Buffer contract violation.
    Buffer(BufferError),
    /// Operation on a channel that was already closed.
    AlreadyClosed,
    /// Token or descriptor is already registered under a different identity.
    DuplicateRegistration(Token),
    /// Lifecycle operation not valid in the current state.
    InvalidState(ReactorState),
}

impl fmt::Display for ReactorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactorError::Bind { addr, source } => {
                write!(f, "failed to bind {addr}: {source}")
            }
            ReactorError::Selector(e) => write!(f, "selector failure: {e}"),
            ReactorError::InvalidConfig(reason) => write!(f, "invalid configuration: {reason}"),
            ReactorError::Accept(e) => write!(f, "accept failed: {e}"),
            ReactorError::Io(e) => write!(f, "I/O error: {e}"),
            ReactorError::Buffer(e) => write!(f, "{e}"),
            ReactorError::AlreadyClosed => write!(f, "channel already closed"),
            ReactorError::DuplicateRegistration(token) => {
                write!(f, "conflicting registration for token {}", token.0)
            }
            ReactorError::InvalidState(state) => {
                write!(f, "operation not allowed in state {state:?}")
            }
        }
    }
}

impl std::error::Error for ReactorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReactorError::Bind { source, .. } => Some(source),
            ReactorError::Selector(e) | ReactorError::Accept(e) | ReactorError::Io(e) => Some(e),
            ReactorError::Buffer(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ReactorError {
    fn from(e: io::Error) -> Self {
        ReactorError::Io(e)
    }
}

impl From<BufferError> for ReactorError {
    fn from(e: BufferError) -> Self {
        ReactorError::Buffer(e)
    }
}
