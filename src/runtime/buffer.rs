//! Cursor-based byte buffers and the per-reactor buffer pool.
//!
//! A [`Buffer`] is a fixed-capacity byte region with a `position`, a `limit`
//! and an optional `mark`:
//!
//! ```text
//! 0 <= mark <= position <= limit <= capacity
//! ```
//!
//! Buffers alternate between two modes by convention. While *filling*, the
//! limit sits at the capacity and writes advance the position. [`Buffer::flip`]
//! switches to *draining*: the limit becomes the amount of valid data and reads
//! advance the position from zero. [`Buffer::clear`] and [`Buffer::compact`]
//! go back to filling.
//!
//! ## Views
//!
//! [`Buffer::duplicate`], [`Buffer::slice`] and [`Buffer::as_read_only`] return
//! views over the same backing storage. A write through any view is visible
//! through every other view of that storage, but each view carries its own
//! cursor. Storage is reference counted with `Rc`, so buffers and their views
//! are `!Send` and can never leave the thread that owns them.
//!
//! ## Pooling
//!
//! [`BufferPool`] recycles connection buffers so the event loop does not
//! allocate on every accept. Buffers handed back while views still alias them
//! are dropped instead of recycled.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

type Storage = Rc<RefCell<Box<[u8]>>>;

/// Largest capacity a buffer may be allocated with.
pub const MAX_CAPACITY: usize = isize::MAX as usize;

/// Contract violations reported by [`Buffer`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// Requested capacity cannot be allocated.
    InvalidCapacity(usize),
    /// Not enough room between position and limit for a write.
    Overflow { requested: usize, remaining: usize },
    /// Not enough data between position and limit for a read.
    Underflow { requested: usize, remaining: usize },
    /// Mutation attempted through a read-only view.
    ReadOnly,
    /// Position set beyond the limit.
    InvalidPosition { position: usize, limit: usize },
    /// Limit set beyond the capacity.
    InvalidLimit { limit: usize, capacity: usize },
    /// `reset` called without a mark.
    InvalidMark,
    /// Absolute index outside `[0, limit)`.
    IndexOutOfBounds { index: usize, limit: usize },
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::InvalidCapacity(capacity) => {
                write!(f, "invalid buffer capacity: {capacity}")
            }
            BufferError::Overflow {
                requested,
                remaining,
            } => write!(
                f,
                "buffer overflow: {requested} bytes requested, {remaining} remaining"
            ),
            BufferError::Underflow {
                requested,
                remaining,
            } => write!(
                f,
                "buffer underflow: {requested} bytes requested, {remaining} remaining"
            ),
            BufferError::ReadOnly => write!(f, "buffer is read-only"),
            BufferError::InvalidPosition { position, limit } => {
                write!(f, "position {position} exceeds limit {limit}")
            }
            BufferError::InvalidLimit { limit, capacity } => {
                write!(f, "limit {limit} exceeds capacity {capacity}")
            }
            BufferError::InvalidMark => write!(f, "mark is not set"),
            BufferError::IndexOutOfBounds { index, limit } => {
                write!(f, "index {index} out of bounds for limit {limit}")
            }
        }
    }
}

impl std::error::Error for BufferError {}

/// A fixed-capacity byte buffer with a read/write cursor.
pub struct Buffer {
    storage: Storage,
    /// Start of this view within the shared storage.
    offset: usize,
    capacity: usize,
    position: usize,
    limit: usize,
    mark: Option<usize>,
    read_only: bool,
}

impl Buffer {
    /// Allocate a zeroed buffer in filling mode.
    pub fn allocate(capacity: usize) -> Result<Self, BufferError> {
        if capacity > MAX_CAPACITY {
            return Err(BufferError::InvalidCapacity(capacity));
        }
        Ok(Self::zeroed(capacity))
    }

    /// Create a buffer holding a copy of `data`, ready to be drained.
    pub fn wrap(data: &[u8]) -> Self {
        Self::from_storage(data.to_vec().into_boxed_slice())
    }

    /// Wrap a copy of `data` with the cursor over `[offset, offset + len)`.
    ///
    /// The capacity is the whole of `data`; bytes outside the window stay
    /// reachable through `clear` or absolute access.
    pub fn wrap_range(data: &[u8], offset: usize, len: usize) -> Result<Self, BufferError> {
        if offset > data.len() {
            return Err(BufferError::InvalidPosition {
                position: offset,
                limit: data.len(),
            });
        }
        let limit = offset.checked_add(len).unwrap_or(usize::MAX);
        if limit > data.len() {
            return Err(BufferError::InvalidLimit {
                limit,
                capacity: data.len(),
            });
        }

        let mut buffer = Self::wrap(data);
        buffer.limit = limit;
        buffer.position = offset;
        Ok(buffer)
    }

    fn zeroed(capacity: usize) -> Self {
        Self::from_storage(vec![0u8; capacity].into_boxed_slice())
    }

    fn from_storage(bytes: Box<[u8]>) -> Self {
        let capacity = bytes.len();
        Self {
            storage: Rc::new(RefCell::new(bytes)),
            offset: 0,
            capacity,
            position: 0,
            limit: capacity,
            mark: None,
            read_only: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes between position and limit.
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Move the cursor. A mark above the new position is discarded.
    pub fn set_position(&mut self, position: usize) -> Result<&mut Self, BufferError> {
        if position > self.limit {
            return Err(BufferError::InvalidPosition {
                position,
                limit: self.limit,
            });
        }
        if self.mark.is_some_and(|m| m > position) {
            self.mark = None;
        }
        self.position = position;
        Ok(self)
    }

    /// Move the limit. The position and mark are pulled down with it.
    pub fn set_limit(&mut self, limit: usize) -> Result<&mut Self, BufferError> {
        if limit > self.capacity {
            return Err(BufferError::InvalidLimit {
                limit,
                capacity: self.capacity,
            });
        }
        self.limit = limit;
        if self.position > limit {
            self.position = limit;
        }
        if self.mark.is_some_and(|m| m > limit) {
            self.mark = None;
        }
        Ok(self)
    }

    /// Remember the current position.
    pub fn mark(&mut self) -> &mut Self {
        self.mark = Some(self.position);
        self
    }

    /// Return to the marked position.
    pub fn reset(&mut self) -> Result<&mut Self, BufferError> {
        let mark = self.mark.ok_or(BufferError::InvalidMark)?;
        self.position = mark;
        Ok(self)
    }

    /// Enter filling mode from empty. Old bytes are left in place.
    pub fn clear(&mut self) -> &mut Self {
        self.position = 0;
        self.limit = self.capacity;
        self.mark = None;
        self
    }

    /// Switch from filling to draining.
    pub fn flip(&mut self) -> &mut Self {
        self.limit = self.position;
        self.position = 0;
        self.mark = None;
        self
    }

    /// Drain the same data again.
    pub fn rewind(&mut self) -> &mut Self {
        self.position = 0;
        self.mark = None;
        self
    }

    /// Move the undrained bytes to the front and re-enter filling mode after them.
    pub fn compact(&mut self) -> Result<&mut Self, BufferError> {
        self.ensure_writable()?;
        let remaining = self.remaining();
        if remaining > 0 && self.position > 0 {
            let start = self.offset + self.position;
            let end = self.offset + self.limit;
            self.storage
                .borrow_mut()
                .copy_within(start..end, self.offset);
        }
        self.position = remaining;
        self.limit = self.capacity;
        self.mark = None;
        Ok(self)
    }

    /// Relative single-byte write.
    pub fn put(&mut self, byte: u8) -> Result<&mut Self, BufferError> {
        self.put_slice(&[byte])
    }

    /// Relative bulk write. Nothing is written when `src` does not fit.
    pub fn put_slice(&mut self, src: &[u8]) -> Result<&mut Self, BufferError> {
        self.ensure_writable()?;
        if src.len() > self.remaining() {
            return Err(BufferError::Overflow {
                requested: src.len(),
                remaining: self.remaining(),
            });
        }
        let start = self.offset + self.position;
        self.storage.borrow_mut()[start..start + src.len()].copy_from_slice(src);
        self.position += src.len();
        Ok(self)
    }

    /// Absolute write; the cursor does not move.
    pub fn put_at(&mut self, index: usize, byte: u8) -> Result<&mut Self, BufferError> {
        self.ensure_writable()?;
        self.check_index(index)?;
        self.storage.borrow_mut()[self.offset + index] = byte;
        Ok(self)
    }

    /// Relative single-byte read.
    pub fn get(&mut self) -> Result<u8, BufferError> {
        let mut byte = [0u8; 1];
        self.get_into(&mut byte)?;
        Ok(byte[0])
    }

    /// Relative bulk read filling all of `dst`.
    pub fn get_into(&mut self, dst: &mut [u8]) -> Result<(), BufferError> {
        if dst.len() > self.remaining() {
            return Err(BufferError::Underflow {
                requested: dst.len(),
                remaining: self.remaining(),
            });
        }
        let start = self.offset + self.position;
        dst.copy_from_slice(&self.storage.borrow()[start..start + dst.len()]);
        self.position += dst.len();
        Ok(())
    }

    /// Relative read of exactly `count` bytes.
    pub fn get_slice(&mut self, count: usize) -> Result<Vec<u8>, BufferError> {
        let mut out = vec![0u8; count];
        self.get_into(&mut out)?;
        Ok(out)
    }

    /// Absolute read; the cursor does not move.
    pub fn get_at(&self, index: usize) -> Result<u8, BufferError> {
        self.check_index(index)?;
        Ok(self.storage.borrow()[self.offset + index])
    }

    /// A view over the same storage with a copy of this cursor.
    pub fn duplicate(&self) -> Buffer {
        Buffer {
            storage: Rc::clone(&self.storage),
            offset: self.offset,
            capacity: self.capacity,
            position: self.position,
            limit: self.limit,
            mark: self.mark,
            read_only: self.read_only,
        }
    }

    /// A view over `[position, limit)`, addressed from zero.
    pub fn slice(&self) -> Buffer {
        let len = self.remaining();
        Buffer {
            storage: Rc::clone(&self.storage),
            offset: self.offset + self.position,
            capacity: len,
            position: 0,
            limit: len,
            mark: None,
            read_only: self.read_only,
        }
    }

    /// A duplicate that rejects every mutation of the shared bytes.
    pub fn as_read_only(&self) -> Buffer {
        let mut view = self.duplicate();
        view.read_only = true;
        view
    }

    /// Let `fill` write into `[position, limit)` and advance by the count it returns.
    ///
    /// This is the bridge used by channels: a socket read lands directly in
    /// the buffer's free region.
    pub fn with_writable<E, F>(&mut self, fill: F) -> Result<usize, E>
    where
        E: From<BufferError>,
        F: FnOnce(&mut [u8]) -> Result<usize, E>,
    {
        self.ensure_writable()?;
        let start = self.offset + self.position;
        let end = self.offset + self.limit;
        let n = fill(&mut self.storage.borrow_mut()[start..end])?;
        self.advance(n)?;
        Ok(n)
    }

    /// Let `drain` consume from `[position, limit)` and advance by the count it returns.
    pub fn with_readable<E, F>(&mut self, drain: F) -> Result<usize, E>
    where
        E: From<BufferError>,
        F: FnOnce(&[u8]) -> Result<usize, E>,
    {
        let start = self.offset + self.position;
        let end = self.offset + self.limit;
        let n = drain(&self.storage.borrow()[start..end])?;
        self.advance(n)?;
        Ok(n)
    }

    fn advance(&mut self, n: usize) -> Result<(), BufferError> {
        if n > self.remaining() {
            return Err(BufferError::Overflow {
                requested: n,
                remaining: self.remaining(),
            });
        }
        self.position += n;
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), BufferError> {
        if self.read_only {
            Err(BufferError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn check_index(&self, index: usize) -> Result<(), BufferError> {
        if index >= self.limit {
            Err(BufferError::IndexOutOfBounds {
                index,
                limit: self.limit,
            })
        } else {
            Ok(())
        }
    }

    /// True when no other view aliases this buffer's storage.
    fn is_exclusive(&self) -> bool {
        Rc::strong_count(&self.storage) == 1
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("capacity", &self.capacity)
            .field("mark", &self.mark)
            .field("read_only", &self.read_only)
            .finish()
    }
}

/// Pool of equally sized connection buffers.
///
/// Buffers are created lazily up to `max_buffers` and recycled LIFO for cache
/// locality. Every buffer handed out is cleared.
pub struct BufferPool {
    free_list: Vec<Buffer>,
    buffer_size: usize,
    max_buffers: usize,
    outstanding: usize,
}

impl BufferPool {
    /// Create a pool.
    ///
    /// # Arguments
    /// * `max_buffers` - Upper bound on buffers handed out at once
    /// * `buffer_size` - Capacity of each buffer in bytes
    pub fn new(max_buffers: usize, buffer_size: usize) -> Result<Self, BufferError> {
        if buffer_size > MAX_CAPACITY {
            return Err(BufferError::InvalidCapacity(buffer_size));
        }
        Ok(Self {
            free_list: Vec::new(),
            buffer_size,
            max_buffers,
            outstanding: 0,
        })
    }

    /// Take a cleared buffer from the pool.
    ///
    /// Returns `None` once `max_buffers` are outstanding.
    pub fn alloc(&mut self) -> Option<Buffer> {
        if self.outstanding >= self.max_buffers {
            return None;
        }
        let mut buffer = self
            .free_list
            .pop()
            .unwrap_or_else(|| Buffer::zeroed(self.buffer_size));
        buffer.clear();
        self.outstanding += 1;
        Some(buffer)
    }

    /// Hand a buffer back.
    pub fn free(&mut self, buffer: Buffer) {
        debug_assert!(self.outstanding > 0, "buffer freed twice");
        self.outstanding = self.outstanding.saturating_sub(1);
        if buffer.is_exclusive()
            && !buffer.read_only
            && buffer.offset == 0
            && buffer.capacity == self.buffer_size
        {
            self.free_list.push(buffer);
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Buffers that can still be handed out.
    pub fn available(&self) -> usize {
        self.max_buffers - self.outstanding
    }

    /// Buffers currently handed out.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_allocate() {
        let buf = Buffer::allocate(16).unwrap();
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.limit(), 16);
        assert_eq!(buf.remaining(), 16);

        assert_eq!(
            Buffer::allocate(MAX_CAPACITY + 1).unwrap_err(),
            BufferError::InvalidCapacity(MAX_CAPACITY + 1)
        );
        assert!(!Buffer::allocate(0).unwrap().has_remaining());
    }

    #[test]
    fn test_fill_flip_drain_clear() {
        let mut buf = Buffer::allocate(100).unwrap();
        let strings = ["A random string value", "Hey hey we're the Monkees"];

        for s in strings {
            buf.put_slice(s.as_bytes()).unwrap();
            buf.flip();
            let mut drained = Vec::new();
            while buf.has_remaining() {
                drained.push(buf.get().unwrap());
            }
            assert_eq!(drained, s.as_bytes());
            buf.clear();
            assert_eq!(buf.remaining(), 100);
        }
    }

    #[test]
    fn test_overflow_and_underflow() {
        let mut buf = Buffer::allocate(4).unwrap();
        buf.put_slice(b"abc").unwrap();

        let err = buf.put_slice(b"de").unwrap_err();
        assert_eq!(
            err,
            BufferError::Overflow {
                requested: 2,
                remaining: 1
            }
        );
        // Failed writes leave the cursor alone
        assert_eq!(buf.position(), 3);

        buf.flip();
        assert_eq!(buf.get_slice(2).unwrap(), b"ab");
        assert_eq!(
            buf.get_slice(2).unwrap_err(),
            BufferError::Underflow {
                requested: 2,
                remaining: 1
            }
        );
        assert_eq!(buf.get().unwrap(), b'c');
        assert!(matches!(buf.get(), Err(BufferError::Underflow { .. })));
    }

    #[test]
    fn test_compact_keeps_undrained_suffix() {
        let mut buf = Buffer::allocate(8).unwrap();
        buf.put_slice(b"hello").unwrap();
        buf.flip();
        assert_eq!(buf.get_slice(2).unwrap(), b"he");

        let remaining = buf.remaining();
        buf.compact().unwrap();
        assert_eq!(buf.position(), remaining);
        assert_eq!(buf.limit(), 8);

        buf.flip();
        assert_eq!(buf.remaining(), remaining);
        assert_eq!(buf.get_slice(3).unwrap(), b"llo");
    }

    #[test]
    fn test_clear_then_flip_is_empty() {
        let mut buf = Buffer::allocate(32).unwrap();
        buf.put_slice(b"stale").unwrap();
        buf.clear();
        buf.flip();
        assert_eq!(buf.remaining(), 0);
        assert!(!buf.has_remaining());
    }

    #[test]
    fn test_cursor_setters() {
        let mut buf = Buffer::allocate(8).unwrap();
        buf.set_position(3)
            .unwrap()
            .set_limit(6)
            .unwrap()
            .mark()
            .set_position(5)
            .unwrap();
        assert_eq!((buf.position(), buf.limit()), (5, 6));

        buf.reset().unwrap();
        assert_eq!(buf.position(), 3);

        assert_eq!(
            buf.set_position(7).unwrap_err(),
            BufferError::InvalidPosition {
                position: 7,
                limit: 6
            }
        );
        assert_eq!(
            buf.set_limit(9).unwrap_err(),
            BufferError::InvalidLimit {
                limit: 9,
                capacity: 8
            }
        );

        // Lowering the limit below the position drags the position and drops the mark
        buf.set_position(5).unwrap().mark();
        buf.set_limit(4).unwrap();
        assert_eq!(buf.position(), 4);
        assert_eq!(buf.reset().unwrap_err(), BufferError::InvalidMark);

        buf.mark();
        buf.flip();
        assert_eq!(buf.reset().unwrap_err(), BufferError::InvalidMark);
    }

    #[test]
    fn test_duplicate_shares_bytes_not_cursor() {
        let mut buf = Buffer::allocate(8).unwrap();
        buf.set_position(3)
            .unwrap()
            .set_limit(6)
            .unwrap()
            .mark()
            .set_position(5)
            .unwrap();
        let mut dupe = buf.duplicate();
        buf.clear();

        assert_eq!((buf.position(), buf.limit()), (0, 8));
        assert_eq!((dupe.position(), dupe.limit()), (5, 6));
        dupe.reset().unwrap();
        assert_eq!(dupe.position(), 3);

        buf.put_at(5, b'T').unwrap();
        assert_eq!(dupe.get_at(5).unwrap(), b'T');
    }

    #[test]
    fn test_read_only_view() {
        let mut buf = Buffer::allocate(8).unwrap();
        let mut view = buf.as_read_only();
        assert!(view.is_read_only());
        assert!(!buf.is_read_only());

        buf.put_at(5, b'T').unwrap();
        assert_eq!(view.get_at(5).unwrap(), b'T');

        assert_eq!(view.put(b'x').unwrap_err(), BufferError::ReadOnly);
        assert_eq!(view.put_at(0, b'x').unwrap_err(), BufferError::ReadOnly);
        assert_eq!(view.compact().unwrap_err(), BufferError::ReadOnly);

        // Cursor movement is still allowed
        view.set_position(5).unwrap();
        assert_eq!(view.get().unwrap(), b'T');

        // Views of a read-only view stay read-only
        assert!(view.duplicate().is_read_only());
        assert!(view.slice().is_read_only());
    }

    #[test]
    fn test_slice_window() {
        let mut buf = Buffer::allocate(8).unwrap();
        buf.set_position(3).unwrap().set_limit(5).unwrap();
        let mut slice = buf.slice();

        assert_eq!(slice.capacity(), 2);
        assert_eq!(slice.position(), 0);
        assert_eq!(slice.limit(), 2);

        buf.put_at(3, b'T').unwrap();
        assert_eq!(slice.get_at(0).unwrap(), b'T');

        slice.put_at(1, b'U').unwrap();
        assert_eq!(buf.get_at(4).unwrap(), b'U');

        assert!(matches!(
            slice.get_at(2),
            Err(BufferError::IndexOutOfBounds { index: 2, limit: 2 })
        ));
        assert!(matches!(slice.put_slice(b"abc"), Err(BufferError::Overflow { .. })));
    }

    #[test]
    fn test_with_writable_and_readable() {
        let mut buf = Buffer::allocate(8).unwrap();
        let n = buf
            .with_writable(|region| -> Result<usize, BufferError> {
                assert_eq!(region.len(), 8);
                region[..3].copy_from_slice(b"xyz");
                Ok(3)
            })
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(buf.position(), 3);

        buf.flip();
        let n = buf
            .with_readable(|region| -> Result<usize, BufferError> {
                assert_eq!(region, b"xyz");
                Ok(2)
            })
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(buf.remaining(), 1);

        let err = buf
            .with_readable(|_| -> Result<usize, BufferError> { Ok(5) })
            .unwrap_err();
        assert!(matches!(err, BufferError::Overflow { .. }));

        let mut view = buf.as_read_only();
        let err = view
            .with_writable(|_| -> Result<usize, BufferError> { Ok(0) })
            .unwrap_err();
        assert_eq!(err, BufferError::ReadOnly);
    }

    #[test]
    fn test_wrap() {
        let mut buf = Buffer::wrap(b"Hi there!\r\n");
        assert_eq!(buf.capacity(), 11);
        assert_eq!(buf.remaining(), 11);
        assert_eq!(buf.get_slice(2).unwrap(), b"Hi");
    }

    #[test]
    fn test_wrap_range() {
        let data: Vec<u8> = (0..100).collect();
        let mut buf = Buffer::wrap_range(&data, 12, 42).unwrap();
        assert_eq!(buf.capacity(), 100);
        assert_eq!((buf.position(), buf.limit()), (12, 54));
        assert_eq!(buf.get().unwrap(), 12);
        assert_eq!(
            buf.get_at(99).unwrap_err(),
            BufferError::IndexOutOfBounds {
                index: 99,
                limit: 54
            }
        );

        // The whole array is still behind the window
        buf.clear();
        assert_eq!(buf.get_at(99).unwrap(), 99);

        assert_eq!(
            Buffer::wrap_range(&data, 101, 0).unwrap_err(),
            BufferError::InvalidPosition {
                position: 101,
                limit: 100
            }
        );
        assert_eq!(
            Buffer::wrap_range(&data, 60, 41).unwrap_err(),
            BufferError::InvalidLimit {
                limit: 101,
                capacity: 100
            }
        );
        assert!(matches!(
            Buffer::wrap_range(&data, 1, usize::MAX),
            Err(BufferError::InvalidLimit { .. })
        ));
        assert!(!Buffer::wrap_range(&data, 100, 0).unwrap().has_remaining());
    }

    #[test]
    fn test_rewind_rereads_data() {
        let mut buf = Buffer::wrap(b"abc");
        assert_eq!(buf.get_slice(2).unwrap(), b"ab");
        buf.mark();

        buf.rewind();
        assert_eq!((buf.position(), buf.limit()), (0, 3));
        assert_eq!(buf.reset().unwrap_err(), BufferError::InvalidMark);
        assert_eq!(buf.get_slice(3).unwrap(), b"abc");
    }

    #[test]
    fn test_buffer_pool_basic() {
        let mut pool = BufferPool::new(2, 64).unwrap();
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.buffer_size(), 64);

        let mut b0 = pool.alloc().unwrap();
        let b1 = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        assert_eq!(pool.outstanding(), 2);

        b0.put_slice(b"dirty").unwrap();
        pool.free(b0);
        assert_eq!(pool.available(), 1);

        // Recycled buffers come back cleared
        let b2 = pool.alloc().unwrap();
        assert_eq!(b2.position(), 0);
        assert_eq!(b2.remaining(), 64);

        pool.free(b1);
        pool.free(b2);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_buffer_pool_drops_aliased_buffers() {
        let mut pool = BufferPool::new(1, 16).unwrap();
        let buf = pool.alloc().unwrap();
        let view = buf.duplicate();
        pool.free(buf);

        let mut fresh = pool.alloc().unwrap();
        fresh.put_at(0, b'z').unwrap();
        assert_eq!(view.get_at(0).unwrap(), 0);
    }

    proptest! {
        #[test]
        fn test_put_flip_get_roundtrip(
            data in proptest::collection::vec(any::<u8>(), 0..256),
            slack in 0usize..64,
        ) {
            let mut buf = Buffer::allocate(data.len() + slack).unwrap();
            for &b in &data {
                buf.put(b).unwrap();
            }
            buf.flip();
            prop_assert_eq!(buf.remaining(), data.len());

            let mut out = Vec::with_capacity(data.len());
            for _ in 0..data.len() {
                out.push(buf.get().unwrap());
            }
            prop_assert_eq!(out, data);
            prop_assert!(!buf.has_remaining());
        }

        #[test]
        fn test_compact_preserves_remaining(
            data in proptest::collection::vec(any::<u8>(), 1..128),
            drained in 0usize..128,
        ) {
            let drained = drained % (data.len() + 1);
            let mut buf = Buffer::allocate(128).unwrap();
            buf.put_slice(&data).unwrap();
            buf.flip();
            buf.get_slice(drained).unwrap();

            let before = buf.remaining();
            buf.compact().unwrap();
            buf.flip();

            prop_assert_eq!(buf.remaining(), before);
            prop_assert_eq!(buf.get_slice(before).unwrap(), data[drained..].to_vec());
        }
    }
}
