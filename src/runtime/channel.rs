//! Non-blocking channels the reactor multiplexes.
//!
//! A [`ListenChannel`] accepts connections, a [`StreamChannel`] moves bytes
//! between a socket and a [`Buffer`]. Neither ever blocks: "nothing pending"
//! and "no data right now" are ordinary results, not errors.

use crate::runtime::buffer::Buffer;
use crate::runtime::error::ReactorError;
use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

/// A readiness-pollable endpoint.
///
/// The descriptor identifies the channel inside a selector; it is `None`
/// once the channel has been closed.
pub trait Channel: Source {
    fn descriptor(&self) -> Option<RawFd>;
}

/// Outcome of a non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes transferred; zero means nothing is available yet.
    Read(usize),
    /// The peer closed its side.
    EndOfStream,
}

/// Listening TCP socket.
pub struct ListenChannel {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ListenChannel {
    /// Bind a non-blocking listener.
    pub fn bind(addr: SocketAddr, backlog: i32) -> Result<Self, ReactorError> {
        let listener = create_listener(addr, backlog)
            .map_err(|source| ReactorError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ReactorError::Bind { addr, source })?;
        Ok(Self {
            listener: TcpListener::from_std(listener),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept one pending connection, or `None` when the backlog is empty.
    pub fn accept_nonblocking(&self) -> Result<Option<StreamChannel>, ReactorError> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => return Ok(Some(StreamChannel::new(stream, peer))),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ReactorError::Accept(e)),
            }
        }
    }
}

impl Source for ListenChannel {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.listener.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.listener.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.listener.deregister(registry)
    }
}

impl Channel for ListenChannel {
    fn descriptor(&self) -> Option<RawFd> {
        Some(self.listener.as_raw_fd())
    }
}

/// Connected TCP socket.
pub struct StreamChannel {
    /// `None` after close; dropping the stream releases the descriptor.
    stream: Option<TcpStream>,
    peer: SocketAddr,
}

impl StreamChannel {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream: Some(stream),
            peer,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// One non-blocking read into the buffer's free region.
    pub fn read_into(&mut self, buffer: &mut Buffer) -> Result<ReadOutcome, ReactorError> {
        let stream = self.stream.as_mut().ok_or(ReactorError::AlreadyClosed)?;
        if !buffer.has_remaining() {
            return Ok(ReadOutcome::Read(0));
        }

        let mut eof = false;
        let n = buffer.with_writable(|region| loop {
            match stream.read(region) {
                Ok(0) => {
                    eof = true;
                    return Ok(0);
                }
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ReactorError::Io(e)),
            }
        })?;

        if eof {
            Ok(ReadOutcome::EndOfStream)
        } else {
            Ok(ReadOutcome::Read(n))
        }
    }

    /// One non-blocking write from the buffer's readable region.
    ///
    /// Returns the bytes written; zero means the socket is not accepting
    /// data right now.
    pub fn write_from(&mut self, buffer: &mut Buffer) -> Result<usize, ReactorError> {
        let stream = self.stream.as_mut().ok_or(ReactorError::AlreadyClosed)?;
        if !buffer.has_remaining() {
            return Ok(0);
        }

        buffer.with_readable(|region| loop {
            match stream.write(region) {
                Ok(0) => {
                    return Err(ReactorError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0",
                    )))
                }
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ReactorError::Io(e)),
            }
        })
    }

    /// Shut the socket down and release its descriptor.
    ///
    /// Deregister from the selector first. A second close reports
    /// `AlreadyClosed`.
    pub fn close(&mut self) -> Result<(), ReactorError> {
        let stream = self.stream.take().ok_or(ReactorError::AlreadyClosed)?;
        match stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Peer already tore the connection down
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(ReactorError::Io(e)),
        }
    }

    fn stream_mut(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "channel closed"))
    }
}

impl Source for StreamChannel {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.stream_mut()?.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.stream_mut()?.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.stream_mut()?.deregister(registry)
    }
}

impl Channel for StreamChannel {
    fn descriptor(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }
}

/// Create a non-blocking TCP listener.
///
/// `SO_REUSEADDR` lets a restarted server rebind past TIME_WAIT. `SO_REUSEPORT`
/// is left off so a second server on the same port fails to bind.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Connected pair over loopback: the server side as a channel, the client as
/// a blocking std stream.
#[cfg(test)]
pub(crate) fn loopback_pair() -> (StreamChannel, std::net::TcpStream) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, peer) = listener.accept().unwrap();
    server.set_nonblocking(true).unwrap();
    (StreamChannel::new(TcpStream::from_std(server), peer), client)
}
