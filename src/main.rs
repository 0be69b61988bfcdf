//! nio-echo: a single-threaded echo server
//!
//! Every byte a client sends is echoed back verbatim. New connections are
//! greeted unless `--no-greeting` is given. `--pipe <REPS>` runs the worker
//! pipe instead and prints what the worker produced. `--copy` copies stdin to
//! stdout through a single buffer.

use nio_echo::config::Config;
use nio_echo::runtime::{pipe, spawn_worker, Buffer, Reactor};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Chunks the worker may queue ahead of the consumer.
const PIPE_CAPACITY: usize = 4;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Some(reps) = config.pipe_reps {
        return run_pipe(reps);
    }
    if config.copy_stdin {
        return run_copy();
    }

    info!(
        host = %config.host,
        port = config.port,
        max_connections = config.max_connections,
        buffer_size = config.buffer_size,
        greeting = config.greeting.is_some(),
        "Starting nio-echo server"
    );

    let mut reactor = match Reactor::bind(config.reactor_config()?) {
        Ok(reactor) => reactor,
        Err(e) => {
            error!(error = %e, "Failed to start reactor");
            return Err(e.into());
        }
    };

    let handle = reactor.handle();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        handle.shutdown();
    })?;

    reactor.run()?;
    Ok(())
}

/// Copy stdin to stdout until stdin is exhausted.
fn run_copy() -> Result<(), Box<dyn std::error::Error>> {
    let mut buffer = Buffer::allocate(COPY_BUFFER_SIZE)?;
    let mut stdin = std::io::stdin().lock();
    let mut stdout = std::io::stdout().lock();
    let copied = pipe::copy_compacting(&mut stdin, &mut buffer, &mut stdout)?;

    info!(bytes = copied, "Copy finished");
    Ok(())
}

/// Drain a worker's output to stdout.
fn run_pipe(reps: usize) -> Result<(), Box<dyn std::error::Error>> {
    info!(reps, "Running pipe worker");

    let (sink, mut source) = pipe(PIPE_CAPACITY);
    let worker = spawn_worker(reps, sink)?;

    let mut buffer = Buffer::allocate(100)?;
    let mut stdout = std::io::stdout().lock();
    let copied = pipe::copy_to(&mut source, &mut buffer, &mut stdout)?;

    worker.join().map_err(|_| "pipe worker panicked")??;
    info!(bytes = copied, "Pipe drained");
    Ok(())
}
