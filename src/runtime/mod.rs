//! Single-threaded readiness runtime.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).
//!
//! Layers, leaf first:
//! - `Buffer`: cursor-based byte buffer with shared-storage views
//! - `StreamChannel` / `ListenChannel`: non-blocking socket endpoints
//! - `Selector`: registration set and readiness wait
//! - `Reactor`: the accept/read/echo loop
//!
//! `pipe` provides the one-way handoff worker threads use to feed data to a
//! single consumer.

pub mod buffer;
pub mod channel;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod pipe;
pub mod selector;

pub use buffer::{Buffer, BufferError, BufferPool};
pub use channel::{Channel, ListenChannel, ReadOutcome, StreamChannel};
pub use error::ReactorError;
pub use event_loop::{Reactor, ReactorConfig, ReactorHandle, ReactorState, DEFAULT_GREETING};
pub use pipe::{pipe, spawn_worker, PipeError, PipeSink, PipeSource};
pub use selector::{Ops, Ready, Selector};
