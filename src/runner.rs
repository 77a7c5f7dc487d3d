//! Client and server test runners.
//!
//! Each call owns one engine session from creation to release and blocks the
//! calling thread until the test ends. The client side retries the run while
//! the server is not listening yet; every other failure is returned at once.

use crate::config::{ClientConfig, ServerConfig};
use crate::engine::Engine;
use crate::error::Result;
use crate::native::NativeEngine;
use crate::output::OutputHandle;
use crate::session::{self, SessionConfig, SessionGuard};
use log::debug;
use std::thread;
use std::time::Duration;

/// Pause between connection attempts while the server is not ready.
///
/// Fixed on purpose: the retry only bridges a server's startup window.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// How many times the client may retry a refused connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectRetry {
    /// Retry until the server answers.
    #[default]
    Unbounded,
    /// Give up after this many retries and return the refusal.
    Limited(usize),
}

impl ConnectRetry {
    fn allows(&self, retries_done: usize) -> bool {
        match self {
            ConnectRetry::Unbounded => true,
            ConnectRetry::Limited(max) => retries_done < *max,
        }
    }
}

/// Drives sessions of one engine.
///
/// # Examples
///
/// ```no_run
/// use rperf3_runner::{describe_error, ClientConfig, NativeEngine, OutputHandle, Runner};
///
/// let runner = Runner::new(NativeEngine::default());
/// let config = ClientConfig::new("127.0.0.1", 5201).with_duration(5);
///
/// let result = runner.run_client(&config, OutputHandle::stdout());
/// if result.is_err() {
///     eprintln!("{}", describe_error(&result));
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Runner<E> {
    engine: E,
    connect_retry: ConnectRetry,
}

impl<E: Engine> Runner<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            connect_retry: ConnectRetry::Unbounded,
        }
    }

    pub fn with_connect_retry(mut self, connect_retry: ConnectRetry) -> Self {
        self.connect_retry = connect_retry;
        self
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Runs one client-role test, writing results to `output`.
    pub fn run_client(&self, config: &ClientConfig, output: OutputHandle) -> Result<()> {
        let mut guard = SessionGuard::open(&self.engine)?;
        session::configure(&self.engine, guard.session_mut(), SessionConfig::Client(config));
        session::bind_output(&self.engine, guard.session_mut(), output)?;

        let mut retries = 0usize;
        loop {
            match self.engine.run_client(guard.session_mut()) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_peer_not_ready() && self.connect_retry.allows(retries) => {
                    retries += 1;
                    debug!(
                        "{}:{} not ready ({}), retry {}",
                        config.target_host, config.target_port, e, retries
                    );
                    thread::sleep(CONNECT_RETRY_DELAY);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Serves one server-role test on the configured port, writing results
    /// to `output`. Blocks until a client has completed or failed a test.
    pub fn run_server(&self, config: &ServerConfig, output: OutputHandle) -> Result<()> {
        let mut guard = SessionGuard::open(&self.engine)?;
        session::configure(&self.engine, guard.session_mut(), SessionConfig::Server(config));
        session::bind_output(&self.engine, guard.session_mut(), output)?;

        self.engine.run_server(guard.session_mut())?;
        Ok(())
    }
}

/// Runs a client test with the built-in engine.
pub fn run_client(config: &ClientConfig, output: OutputHandle) -> Result<()> {
    Runner::new(NativeEngine::default()).run_client(config, output)
}

/// Serves one test with the built-in engine.
pub fn run_server(config: &ServerConfig, output: OutputHandle) -> Result<()> {
    Runner::new(NativeEngine::default()).run_server(config, output)
}
