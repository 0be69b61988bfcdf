//! nio-echo: a single-threaded echo server
//!
//! One thread multiplexes every connection through a readiness selector:
//! - Non-blocking accept, read and write on mio sockets
//! - NIO-style buffers (position/limit/mark, flip/clear/compact, views)
//! - Partial writes parked on write interest instead of spinning
//! - Bounded worker-to-consumer byte pipe with backpressure

pub mod config;
pub mod runtime;
