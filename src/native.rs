//! The built-in measurement engine.
//!
//! Each session carries its own single-threaded tokio runtime; the run calls
//! block on it, so a test occupies exactly the calling thread.
//!
//! # Examples
//!
//! ```no_run
//! use rperf3_runner::{ClientConfig, EngineDefaults, NativeEngine, OutputHandle, Runner};
//! use std::time::Duration;
//!
//! let engine = NativeEngine::with_defaults(EngineDefaults {
//!     duration: Duration::from_secs(3),
//!     ..EngineDefaults::default()
//! });
//! let runner = Runner::new(engine);
//! runner
//!     .run_client(&ClientConfig::new("127.0.0.1", 5201), OutputHandle::stdout())
//!     .unwrap();
//! ```

use crate::config::Protocol;
use crate::engine::{Engine, EngineError, EngineErrorKind, EngineResult, Role};
use crate::measurements::IntervalStats;
use crate::output::{self, OutputHandle};
use crate::protocol::Message;
use crate::report::{EndReport, Report, StartInfo, TestStart, Timestamp};
use crate::udp_packet::{HEADER_SIZE, MAX_DATAGRAM_SIZE};
use log::{debug, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

/// Values a session starts from before any setting is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineDefaults {
    pub port: u16,
    pub duration: Duration,
    pub interval: Duration,
    pub tcp_block_size: u64,
    pub udp_block_size: u64,
    /// UDP send rate in bits per second; 0 sends as fast as possible
    pub udp_bandwidth: u64,
    /// How long the server keeps reading datagrams after the client finished
    pub udp_drain: Duration,
    /// How long the server waits for the TCP data connection
    pub data_connect_timeout: Duration,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            port: 5201,
            duration: Duration::from_secs(10),
            interval: Duration::from_secs(1),
            tcp_block_size: 128 * 1024,
            udp_block_size: 8 * 1024,
            udp_bandwidth: 1_000_000,
            udp_drain: Duration::from_millis(250),
            data_connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NativeEngine {
    defaults: EngineDefaults,
}

impl NativeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(defaults: EngineDefaults) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &EngineDefaults {
        &self.defaults
    }
}

/// Per-session test settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Settings {
    pub role: Role,
    pub protocol: Protocol,
    pub interval: Duration,
    pub duration: Duration,
    pub block_size: Option<u64>,
    pub bytes: Option<u64>,
    pub blocks: Option<u64>,
    pub host: Option<String>,
    pub port: u16,
}

impl Settings {
    fn from_defaults(defaults: &EngineDefaults) -> Self {
        Self {
            role: Role::Client,
            protocol: Protocol::Tcp,
            interval: defaults.interval,
            duration: defaults.duration,
            block_size: None,
            bytes: None,
            blocks: None,
            host: None,
            port: defaults.port,
        }
    }

    /// Block size in effect; UDP blocks must fit the header and one datagram.
    pub fn effective_block_size(&self, defaults: &EngineDefaults) -> usize {
        match self.protocol {
            Protocol::Udp => {
                let size = self.block_size.unwrap_or(defaults.udp_block_size);
                (size as usize).clamp(HEADER_SIZE, MAX_DATAGRAM_SIZE)
            }
            _ => self.block_size.unwrap_or(defaults.tcp_block_size).max(1) as usize,
        }
    }

    pub fn test_start(&self, block_size: usize) -> TestStart {
        TestStart {
            duration_secs: self.duration.as_secs(),
            block_size: block_size as u64,
            bytes: self.bytes,
            blocks: self.blocks,
        }
    }
}

/// When the sending side stops.
///
/// A byte or block limit replaces the time limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Limit {
    deadline: Option<Duration>,
    bytes: Option<u64>,
    blocks: Option<u64>,
}

impl Limit {
    pub fn new(settings: &Settings) -> Self {
        let deadline = if settings.bytes.is_some() || settings.blocks.is_some() {
            None
        } else {
            Some(settings.duration)
        };
        Self {
            deadline,
            bytes: settings.bytes,
            blocks: settings.blocks,
        }
    }

    pub fn reached(&self, elapsed: Duration, bytes_sent: u64, blocks_sent: u64) -> bool {
        self.deadline.is_some_and(|d| elapsed >= d)
            || self.bytes.is_some_and(|b| bytes_sent >= b)
            || self.blocks.is_some_and(|b| blocks_sent >= b)
    }

    /// Length of the next block, trimmed so a byte limit is hit exactly.
    pub fn next_block(&self, block_size: usize, bytes_sent: u64) -> usize {
        match self.bytes {
            Some(limit) => {
                let remaining = limit.saturating_sub(bytes_sent);
                block_size.min(usize::try_from(remaining).unwrap_or(usize::MAX))
            }
            None => block_size,
        }
    }

    /// Length of the next datagram, or `None` once the byte limit leaves no
    /// room for a datagram header.
    pub fn next_datagram(&self, block_size: usize, bytes_sent: u64) -> Option<usize> {
        let len = self.next_block(block_size, bytes_sent);
        (len >= HEADER_SIZE).then_some(len)
    }
}

pub(crate) fn io_error(err: io::Error) -> EngineError {
    EngineError::from_io(EngineErrorKind::Io, &err)
}

pub(crate) fn protocol_error(err: io::Error) -> EngineError {
    EngineError::from_io(EngineErrorKind::Protocol, &err)
}

pub(crate) fn unexpected(got: &Message, wanted: &str) -> EngineError {
    match got {
        Message::Error { message } => {
            EngineError::with_detail(EngineErrorKind::Protocol, format!("peer reported: {}", message))
        }
        other => EngineError::with_detail(
            EngineErrorKind::Protocol,
            format!("expected {}, got {}", wanted, other.name()),
        ),
    }
}

pub(crate) fn sctp_unsupported() -> EngineError {
    EngineError::with_detail(
        EngineErrorKind::Unsupported,
        "SCTP is not supported by the built-in engine",
    )
}

pub(crate) fn new_cookie() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(36)
        .map(char::from)
        .collect()
}

pub(crate) fn build_report(
    settings: &Settings,
    remote_host: Option<String>,
    port: u16,
    cookie: String,
    test: TestStart,
    intervals: Vec<IntervalStats>,
    end: EndReport,
) -> Report {
    Report {
        start: StartInfo {
            version: format!("rperf3-runner {}", crate::VERSION),
            role: settings.role,
            protocol: settings.protocol,
            remote_host,
            port,
            cookie,
            timestamp: Timestamp::now(),
            test,
        },
        intervals,
        end,
    }
}

/// Engine state for one run.
#[derive(Debug)]
pub struct NativeSession {
    settings: Settings,
    json: bool,
    output: Option<BufWriter<File>>,
    runtime: Runtime,
}

impl NativeSession {
    fn emit(&mut self, report: &Report) -> EngineResult<()> {
        let out = self
            .output
            .as_mut()
            .ok_or_else(|| EngineError::new(EngineErrorKind::NoOutput))?;
        let written = if self.json {
            report.write_json(out)
        } else {
            report.write_text(out)
        };
        written.and_then(|_| out.flush()).map_err(io_error)
    }

    fn check_output(&self) -> EngineResult<()> {
        if self.output.is_none() {
            return Err(EngineError::new(EngineErrorKind::NoOutput));
        }
        Ok(())
    }
}

impl Engine for NativeEngine {
    type Session = NativeSession;

    fn new_session(&self) -> EngineResult<NativeSession> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| EngineError::from_io(EngineErrorKind::SessionInit, &e))?;
        Ok(NativeSession {
            settings: Settings::from_defaults(&self.defaults),
            json: false,
            output: None,
            runtime,
        })
    }

    fn apply_defaults(&self, session: &mut NativeSession) {
        session.settings = Settings::from_defaults(&self.defaults);
        session.json = false;
    }

    fn set_role(&self, session: &mut NativeSession, role: Role) {
        session.settings.role = role;
    }

    fn set_protocol(&self, session: &mut NativeSession, protocol: Protocol) {
        session.settings.protocol = protocol;
    }

    fn set_interval(&self, session: &mut NativeSession, secs: u64) {
        if secs > 0 {
            session.settings.interval = Duration::from_secs(secs);
        }
    }

    fn set_duration(&self, session: &mut NativeSession, secs: u64) {
        if secs > 0 {
            session.settings.duration = Duration::from_secs(secs);
        }
    }

    fn set_block_size(&self, session: &mut NativeSession, bytes: u64) {
        if bytes > 0 {
            session.settings.block_size = Some(bytes);
        }
    }

    fn set_byte_limit(&self, session: &mut NativeSession, bytes: u64) {
        if bytes > 0 {
            session.settings.bytes = Some(bytes);
        }
    }

    fn set_block_count(&self, session: &mut NativeSession, blocks: u64) {
        if blocks > 0 {
            session.settings.blocks = Some(blocks);
        }
    }

    fn set_target(&self, session: &mut NativeSession, host: &str, port: u16) {
        session.settings.host = Some(host.to_string());
        session.settings.port = port;
    }

    fn set_listen_port(&self, session: &mut NativeSession, port: u16) {
        session.settings.port = port;
    }

    fn bind_output(&self, session: &mut NativeSession, output: OutputHandle) -> io::Result<()> {
        let file = output::open_stream(output)?;
        session.output = Some(BufWriter::new(file));
        Ok(())
    }

    fn enable_json_output(&self, session: &mut NativeSession) {
        session.json = true;
    }

    fn run_client(&self, session: &mut NativeSession) -> EngineResult<()> {
        session.check_output()?;
        let report = session
            .runtime
            .block_on(crate::client::run(&session.settings, &self.defaults))?;
        session.emit(&report)
    }

    fn run_server(&self, session: &mut NativeSession) -> EngineResult<()> {
        session.check_output()?;
        let report = session
            .runtime
            .block_on(crate::server::serve(&session.settings, &self.defaults))?;
        session.emit(&report)
    }

    fn release_session(&self, mut session: NativeSession) {
        if let Some(mut out) = session.output.take() {
            if let Err(e) = out.flush() {
                warn!("Failed to flush test output: {}", e);
            }
        }
        debug!("Releasing {} session", session.settings.role);
    }
}
