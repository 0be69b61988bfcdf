//! One-way byte handoff between a worker thread and a consumer.
//!
//! A pipe is a bounded queue of byte chunks. The producing side blocks when
//! the queue is full, so a slow consumer slows the producer down instead of
//! growing memory. The consuming side never blocks unless asked to: it copies
//! whatever is queued into a [`Buffer`] and reports zero when nothing is.
//!
//! Workers only ever hold a [`PipeSink`]. They never see reactor-owned
//! channels or buffers.

use crate::runtime::buffer::{Buffer, BufferError};
use crate::runtime::channel::ReadOutcome;
use bytes::{Buf, Bytes};
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use rand::seq::SliceRandom;
use std::fmt;
use std::io::{self, Read, Write};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Buffer size each worker fills before handing a chunk off.
const WORKER_BUFFER_SIZE: usize = 100;

const PRODUCTS: &[&str] = &[
    "No good deed goes unpunished",
    "To be, or what?",
    "No matter where you go, there you are",
    "Just say \"Yo\"",
    "My karma ran over my dogma",
];

#[derive(Debug)]
pub enum PipeError {
    /// The other end of the pipe is gone.
    Closed,
    Buffer(BufferError),
    Io(io::Error),
}

impl fmt::Display for PipeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeError::Closed => write!(f, "pipe closed"),
            PipeError::Buffer(e) => write!(f, "{e}"),
            PipeError::Io(e) => write!(f, "pipe output failed: {e}"),
        }
    }
}

impl std::error::Error for PipeError {}

impl From<BufferError> for PipeError {
    fn from(e: BufferError) -> Self {
        PipeError::Buffer(e)
    }
}

impl From<io::Error> for PipeError {
    fn from(e: io::Error) -> Self {
        PipeError::Io(e)
    }
}

/// Create a pipe holding at most `capacity` chunks in flight.
pub fn pipe(capacity: usize) -> (PipeSink, PipeSource) {
    let (tx, rx) = channel::bounded(capacity.max(1));
    (
        PipeSink { tx: Some(tx) },
        PipeSource {
            rx,
            pending: Bytes::new(),
        },
    )
}

/// Producing end. Dropping it ends the stream.
pub struct PipeSink {
    tx: Option<Sender<Bytes>>,
}

impl PipeSink {
    /// Queue a chunk, blocking while the pipe is full.
    pub fn write(&self, chunk: Bytes) -> Result<usize, PipeError> {
        let tx = self.tx.as_ref().ok_or(PipeError::Closed)?;
        let len = chunk.len();
        if len == 0 {
            return Ok(0);
        }
        tx.send(chunk).map_err(|_| PipeError::Closed)?;
        Ok(len)
    }

    /// Queue everything between the buffer's position and limit.
    pub fn write_from(&self, buffer: &mut Buffer) -> Result<usize, PipeError> {
        buffer.with_readable(|region| self.write(Bytes::copy_from_slice(region)))
    }

    /// Signal end-of-stream to the consumer.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

/// Consuming end.
pub struct PipeSource {
    rx: Receiver<Bytes>,
    /// Unconsumed tail of the last chunk taken off the queue.
    pending: Bytes,
}

impl PipeSource {
    /// Copy queued bytes into the buffer's free region without blocking.
    ///
    /// Returns `Read(0)` when nothing is queued and `EndOfStream` once the
    /// sink is gone and everything has been consumed.
    pub fn read_into(&mut self, buffer: &mut Buffer) -> Result<ReadOutcome, PipeError> {
        let mut total = 0;

        while buffer.has_remaining() {
            if self.pending.is_empty() {
                match self.rx.try_recv() {
                    Ok(chunk) => self.pending = chunk,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) if total == 0 => {
                        return Ok(ReadOutcome::EndOfStream)
                    }
                    Err(TryRecvError::Disconnected) => break,
                }
                continue;
            }

            let n = self.pending.len().min(buffer.remaining());
            buffer.put_slice(&self.pending[..n])?;
            self.pending.advance(n);
            total += n;
        }

        Ok(ReadOutcome::Read(total))
    }

    /// Like [`read_into`](Self::read_into), but waits for data first.
    pub fn read_into_blocking(&mut self, buffer: &mut Buffer) -> Result<ReadOutcome, PipeError> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending = chunk,
                Err(_) => return Ok(ReadOutcome::EndOfStream),
            }
        }
        self.read_into(buffer)
    }
}

/// Drain a pipe into `out` through `buffer`: fill, flip, drain, clear.
///
/// Returns the number of bytes copied once the producer has finished.
pub fn copy_to<W: Write>(
    source: &mut PipeSource,
    buffer: &mut Buffer,
    out: &mut W,
) -> Result<u64, PipeError> {
    let mut copied = 0u64;
    buffer.clear();

    while let ReadOutcome::Read(_) = source.read_into_blocking(buffer)? {
        buffer.flip();
        let n = buffer.with_readable(|region| -> Result<usize, PipeError> {
            out.write_all(region)?;
            Ok(region.len())
        })?;
        copied += n as u64;
        buffer.clear();
    }

    out.flush()?;
    Ok(copied)
}

/// Copy `src` to `out` through `buffer` until `src` reaches end of stream.
///
/// Each round reads once, flips, writes once and compacts whatever `out` did
/// not take back to the front. Fewer writes than [`copy_to`] at the cost of
/// moving bytes. The tail left after the last read is drained before
/// returning.
pub fn copy_compacting<R: Read, W: Write>(
    src: &mut R,
    buffer: &mut Buffer,
    out: &mut W,
) -> Result<u64, PipeError> {
    // An empty buffer would read zero bytes forever and look like end of stream
    if buffer.capacity() == 0 {
        return Err(BufferError::InvalidCapacity(0).into());
    }

    let mut copied = 0u64;
    buffer.clear();

    loop {
        let n = buffer.with_writable(|region| read_once(src, region))?;
        if n == 0 {
            break;
        }
        buffer.flip();
        copied += write_once(out, buffer)? as u64;
        buffer.compact()?;
    }

    buffer.flip();
    while buffer.has_remaining() {
        copied += write_once(out, buffer)? as u64;
    }

    out.flush()?;
    Ok(copied)
}

fn read_once<R: Read>(src: &mut R, region: &mut [u8]) -> Result<usize, PipeError> {
    loop {
        match src.read(region) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// One write of the buffer's readable region. Zero only when interrupted.
fn write_once<W: Write>(out: &mut W, buffer: &mut Buffer) -> Result<usize, PipeError> {
    buffer.with_readable(|region| -> Result<usize, PipeError> {
        match out.write(region) {
            Ok(0) if !region.is_empty() => Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e.into()),
        }
    })
}

/// Start a worker that writes `reps` random lines into `sink`, then closes it.
pub fn spawn_worker(reps: usize, sink: PipeSink) -> io::Result<JoinHandle<Result<(), PipeError>>> {
    thread::Builder::new()
        .name("pipe-worker".to_string())
        .spawn(move || run_worker(reps, sink))
}

fn run_worker(reps: usize, mut sink: PipeSink) -> Result<(), PipeError> {
    let mut buffer = Buffer::allocate(WORKER_BUFFER_SIZE)?;
    let mut rng = rand::thread_rng();

    for _ in 0..reps {
        let product = PRODUCTS.choose(&mut rng).copied().unwrap_or_default();
        buffer.clear();
        buffer.put_slice(product.as_bytes())?.put_slice(b"\r\n")?;
        buffer.flip();

        // The sink may not take it all at once
        while buffer.has_remaining() {
            sink.write_from(&mut buffer)?;
        }
    }

    sink.close();
    debug!(reps, "Worker finished");
    Ok(())
}
