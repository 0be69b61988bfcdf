//! Readiness selector over mio.
//!
//! Tracks which channels are registered, what each is interested in and an
//! opaque attachment per registration. `select` blocks until something is
//! ready and reports `(token, matched interest)` pairs. The reported set has
//! no ordering guarantee.

use crate::runtime::channel::Channel;
use crate::runtime::error::ReactorError;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Interest / readiness mask.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Ops(u8);

impl Ops {
    pub const ACCEPT: Ops = Ops(0b001);
    pub const READ: Ops = Ops(0b010);
    pub const WRITE: Ops = Ops(0b100);

    pub const fn empty() -> Ops {
        Ops(0)
    }

    pub fn contains(self, other: Ops) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_acceptable(self) -> bool {
        self.contains(Ops::ACCEPT)
    }

    pub fn is_readable(self) -> bool {
        self.contains(Ops::READ)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Ops::WRITE)
    }

    /// Accept and read both map onto mio's readable interest.
    fn to_interest(self) -> Option<Interest> {
        let readable = self.0 & (Ops::ACCEPT.0 | Ops::READ.0) != 0;
        match (readable, self.is_writable()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl BitOr for Ops {
    type Output = Ops;

    fn bitor(self, rhs: Ops) -> Ops {
        Ops(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ops {
    fn bitor_assign(&mut self, rhs: Ops) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Ops {
    type Output = Ops;

    fn bitand(self, rhs: Ops) -> Ops {
        Ops(self.0 & rhs.0)
    }
}

impl fmt::Debug for Ops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.is_acceptable() {
            names.push("ACCEPT");
        }
        if self.is_readable() {
            names.push("READ");
        }
        if self.is_writable() {
            names.push("WRITE");
        }
        write!(f, "Ops({})", names.join(" | "))
    }
}

/// A registration that became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub token: Token,
    /// Readiness intersected with the registered interest.
    pub ops: Ops,
}

struct Registration<A> {
    fd: RawFd,
    ops: Ops,
    attachment: A,
}

/// Registration set plus the underlying poller.
pub struct Selector<A> {
    poll: Poll,
    events: Events,
    registrations: HashMap<Token, Registration<A>>,
    /// Reverse index enforcing one registration per descriptor.
    descriptors: HashMap<RawFd, Token>,
    waker_token: Option<Token>,
}

impl<A> Selector<A> {
    /// Create a selector reporting at most `batch_size` events per wake.
    pub fn new(batch_size: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(batch_size.max(1)),
            registrations: HashMap::new(),
            descriptors: HashMap::new(),
            waker_token: None,
        })
    }

    /// Register `channel` under `token`, or update its interest in place.
    ///
    /// The same descriptor under the same token is an update. Any other
    /// overlap with an existing registration is a `DuplicateRegistration`.
    pub fn register<C>(
        &mut self,
        channel: &mut C,
        token: Token,
        ops: Ops,
        attachment: A,
    ) -> Result<(), ReactorError>
    where
        C: Channel + ?Sized,
    {
        let fd = channel.descriptor().ok_or(ReactorError::AlreadyClosed)?;
        let interest = ops
            .to_interest()
            .ok_or(ReactorError::InvalidConfig("empty interest set"))?;

        if self.waker_token == Some(token) {
            return Err(ReactorError::DuplicateRegistration(token));
        }
        if let Some(&owner) = self.descriptors.get(&fd) {
            if owner != token {
                return Err(ReactorError::DuplicateRegistration(owner));
            }
        }

        match self.registrations.get_mut(&token) {
            Some(existing) if existing.fd != fd => Err(ReactorError::DuplicateRegistration(token)),
            Some(existing) => {
                channel.reregister(self.poll.registry(), token, interest)?;
                existing.ops = ops;
                existing.attachment = attachment;
                Ok(())
            }
            None => {
                channel.register(self.poll.registry(), token, interest)?;
                self.registrations.insert(
                    token,
                    Registration {
                        fd,
                        ops,
                        attachment,
                    },
                );
                self.descriptors.insert(fd, token);
                Ok(())
            }
        }
    }

    /// Remove a registration. Unknown tokens are ignored.
    pub fn deregister<C>(&mut self, channel: &mut C, token: Token) -> io::Result<()>
    where
        C: Channel + ?Sized,
    {
        match self.registrations.remove(&token) {
            Some(registration) => {
                self.descriptors.remove(&registration.fd);
                channel.deregister(self.poll.registry())
            }
            None => Ok(()),
        }
    }

    /// Block until at least one registration is ready or `timeout` elapses.
    ///
    /// `ready` is cleared and refilled. A zero return is a timeout or a
    /// spurious wake, never an error.
    pub fn select(&mut self, ready: &mut Vec<Ready>, timeout: Option<Duration>) -> io::Result<usize> {
        ready.clear();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            let token = event.token();
            let Some(registration) = self.registrations.get(&token) else {
                // Waker, or a channel dropped earlier in this batch
                continue;
            };

            let mut ops = Ops::empty();
            // Hang-ups and errors surface through the read path
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                ops |= registration.ops & (Ops::ACCEPT | Ops::READ);
            }
            if event.is_writable() || event.is_write_closed() || event.is_error() {
                ops |= registration.ops & Ops::WRITE;
            }

            if !ops.is_empty() {
                ready.push(Ready { token, ops });
            }
        }

        Ok(ready.len())
    }

    /// Create a handle that interrupts `select` from another thread.
    pub fn waker(&mut self, token: Token) -> Result<Waker, ReactorError> {
        if self.registrations.contains_key(&token) || self.waker_token.is_some() {
            return Err(ReactorError::DuplicateRegistration(token));
        }
        let waker = Waker::new(self.poll.registry(), token).map_err(ReactorError::Selector)?;
        self.waker_token = Some(token);
        Ok(waker)
    }

    pub fn attachment(&self, token: Token) -> Option<&A> {
        self.registrations.get(&token).map(|r| &r.attachment)
    }

    pub fn interest(&self, token: Token) -> Option<Ops> {
        self.registrations.get(&token).map(|r| r.ops)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.registrations.contains_key(&token)
    }

    /// Number of registered channels (the waker is not counted).
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::channel::{loopback_pair, ListenChannel};
    use std::io::Write;
    use std::time::Instant;

    fn select_until(selector: &mut Selector<u32>, ready: &mut Vec<Ready>) -> usize {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let n = selector
                .select(ready, Some(Duration::from_millis(50)))
                .unwrap();
            if n > 0 {
                return n;
            }
        }
        0
    }

    #[test]
    fn test_ops_mask() {
        let ops = Ops::READ | Ops::WRITE;
        assert!(ops.is_readable());
        assert!(ops.is_writable());
        assert!(!ops.is_acceptable());
        assert_eq!(ops & Ops::WRITE, Ops::WRITE);
        assert!(Ops::empty().is_empty());
        assert_eq!(format!("{:?}", ops), "Ops(READ | WRITE)");
        assert!(Ops::empty().to_interest().is_none());
    }

    #[test]
    fn test_register_and_update_in_place() {
        let mut selector: Selector<u32> = Selector::new(16).unwrap();
        let (mut channel, _client) = loopback_pair();

        selector
            .register(&mut channel, Token(1), Ops::READ, 7)
            .unwrap();
        assert_eq!(selector.interest(Token(1)), Some(Ops::READ));
        assert_eq!(selector.attachment(Token(1)), Some(&7));

        selector
            .register(&mut channel, Token(1), Ops::WRITE, 8)
            .unwrap();
        assert_eq!(selector.len(), 1);
        assert_eq!(selector.interest(Token(1)), Some(Ops::WRITE));
        assert_eq!(selector.attachment(Token(1)), Some(&8));
    }

    #[test]
    fn test_duplicate_registration() {
        let mut selector: Selector<u32> = Selector::new(16).unwrap();
        let (mut first, _c1) = loopback_pair();
        let (mut second, _c2) = loopback_pair();

        selector.register(&mut first, Token(1), Ops::READ, 0).unwrap();

        // Same descriptor under a second token
        assert!(matches!(
            selector.register(&mut first, Token(2), Ops::READ, 0),
            Err(ReactorError::DuplicateRegistration(Token(1)))
        ));
        // Token already held by another descriptor
        assert!(matches!(
            selector.register(&mut second, Token(1), Ops::READ, 0),
            Err(ReactorError::DuplicateRegistration(Token(1)))
        ));
        assert_eq!(selector.len(), 1);
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let mut selector: Selector<u32> = Selector::new(16).unwrap();
        let (mut channel, _client) = loopback_pair();

        selector.register(&mut channel, Token(3), Ops::READ, 0).unwrap();
        selector.deregister(&mut channel, Token(3)).unwrap();
        assert!(!selector.contains(Token(3)));
        selector.deregister(&mut channel, Token(3)).unwrap();

        // Descriptor is free to register again under a new token
        selector.register(&mut channel, Token(4), Ops::READ, 0).unwrap();
        assert!(selector.contains(Token(4)));
    }

    #[test]
    fn test_register_closed_channel() {
        let mut selector: Selector<u32> = Selector::new(16).unwrap();
        let (mut channel, _client) = loopback_pair();
        channel.close().unwrap();

        assert!(matches!(
            selector.register(&mut channel, Token(1), Ops::READ, 0),
            Err(ReactorError::AlreadyClosed)
        ));
    }

    #[test]
    fn test_select_reports_matched_interest() {
        let mut selector: Selector<u32> = Selector::new(16).unwrap();
        let mut listener = ListenChannel::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        selector
            .register(&mut listener, Token(0), Ops::ACCEPT, 0)
            .unwrap();

        let mut ready = Vec::new();
        assert_eq!(
            selector
                .select(&mut ready, Some(Duration::from_millis(10)))
                .unwrap(),
            0
        );

        let _client = std::net::TcpStream::connect(listener.local_addr()).unwrap();
        assert_eq!(select_until(&mut selector, &mut ready), 1);
        assert_eq!(ready[0].token, Token(0));
        assert_eq!(ready[0].ops, Ops::ACCEPT);
    }

    #[test]
    fn test_select_readable_stream() {
        let mut selector: Selector<u32> = Selector::new(16).unwrap();
        let (mut channel, mut client) = loopback_pair();
        selector
            .register(&mut channel, Token(5), Ops::READ, 0)
            .unwrap();

        client.write_all(b"ping").unwrap();
        let mut ready = Vec::new();
        assert_eq!(select_until(&mut selector, &mut ready), 1);
        assert_eq!(ready[0], Ready { token: Token(5), ops: Ops::READ });
    }

    #[test]
    fn test_waker_interrupts_select() {
        let mut selector: Selector<u32> = Selector::new(16).unwrap();
        let waker = selector.waker(Token(usize::MAX)).unwrap();
        assert!(matches!(
            selector.waker(Token(1)),
            Err(ReactorError::DuplicateRegistration(_))
        ));

        waker.wake().unwrap();
        let mut ready = Vec::new();
        let started = Instant::now();
        let n = selector
            .select(&mut ready, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(n, 0);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
