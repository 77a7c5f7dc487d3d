//! The measurement engine contract consumed by the runners.
//!
//! An engine owns sockets, timing and result serialization. The runners only
//! ever hold an engine [`Engine::Session`] value and hand it back to engine
//! calls; they never look inside it.

use crate::config::Protocol;
use crate::output::OutputHandle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// Which side of a measurement a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Connects to a server and initiates the test
    Client,
    /// Listens for a client and serves one test
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// Engine error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineErrorKind {
    /// A session could not be created
    SessionInit,
    /// The peer refused the connection; it is most likely not listening yet
    ConnectRefused,
    /// Connecting to the peer failed for any other reason
    Connect,
    /// The listening socket could not be set up
    Listen,
    /// Accepting a peer failed
    Accept,
    /// The peer sent something unexpected on the control channel
    Protocol,
    /// The requested setting is not supported by this engine
    Unsupported,
    /// A run was requested without an output stream bound
    NoOutput,
    /// Any other I/O failure during the test
    Io,
}

impl EngineErrorKind {
    /// Short description used as the message prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineErrorKind::SessionInit => "unable to create a new test",
            EngineErrorKind::ConnectRefused => "unable to connect to server",
            EngineErrorKind::Connect => "unable to connect to server",
            EngineErrorKind::Listen => "unable to start listener for connections",
            EngineErrorKind::Accept => "unable to accept connection from client",
            EngineErrorKind::Protocol => "control channel protocol error",
            EngineErrorKind::Unsupported => "unsupported test setting",
            EngineErrorKind::NoOutput => "no output stream bound to the test",
            EngineErrorKind::Io => "test I/O error",
        }
    }
}

/// An engine failure, captured by value at the call that produced it.
///
/// Engines report failures through the returned value only, so the message
/// always belongs to the call that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub detail: Option<String>,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind) -> Self {
        Self { kind, detail: None }
    }

    pub fn with_detail(kind: EngineErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: Some(detail.into()),
        }
    }

    /// Wraps an I/O error, promoting `ECONNREFUSED` to [`EngineErrorKind::ConnectRefused`]
    /// when the failure happened while connecting.
    pub fn from_io(kind: EngineErrorKind, err: &io::Error) -> Self {
        let kind = match (kind, err.kind()) {
            (EngineErrorKind::Connect, io::ErrorKind::ConnectionRefused) => {
                EngineErrorKind::ConnectRefused
            }
            (kind, _) => kind,
        };
        Self::with_detail(kind, err.to_string())
    }

    /// True for the one failure the client runner retries: the server is not
    /// listening yet.
    pub fn is_peer_not_ready(&self) -> bool {
        self.kind == EngineErrorKind::ConnectRefused
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", self.kind.as_str(), detail),
            None => f.write_str(self.kind.as_str()),
        }
    }
}

impl std::error::Error for EngineError {}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// A throughput-measurement engine.
///
/// Setters are best-effort: an engine may ignore a value it cannot apply and
/// report the problem from the run call instead.
pub trait Engine {
    /// Opaque per-run handle. Owned by exactly one runner invocation.
    type Session;

    fn new_session(&self) -> EngineResult<Self::Session>;

    /// Resets every setting to the engine's own defaults.
    fn apply_defaults(&self, session: &mut Self::Session);

    fn set_role(&self, session: &mut Self::Session, role: Role);

    fn set_protocol(&self, session: &mut Self::Session, protocol: Protocol);

    fn set_interval(&self, session: &mut Self::Session, secs: u64);

    fn set_duration(&self, session: &mut Self::Session, secs: u64);

    fn set_block_size(&self, session: &mut Self::Session, bytes: u64);

    fn set_byte_limit(&self, session: &mut Self::Session, bytes: u64);

    fn set_block_count(&self, session: &mut Self::Session, blocks: u64);

    fn set_target(&self, session: &mut Self::Session, host: &str, port: u16);

    fn set_listen_port(&self, session: &mut Self::Session, port: u16);

    /// Attaches the caller's handle as the session's output stream.
    ///
    /// The handle itself stays owned by the caller.
    fn bind_output(&self, session: &mut Self::Session, output: OutputHandle) -> io::Result<()>;

    fn enable_json_output(&self, session: &mut Self::Session);

    /// Runs one test as the client.
    fn run_client(&self, session: &mut Self::Session) -> EngineResult<()>;

    /// Listens and serves exactly one test. Blocks until it completes or fails.
    fn run_server(&self, session: &mut Self::Session) -> EngineResult<()>;

    /// Frees the session, flushing and closing its output stream.
    fn release_session(&self, session: Self::Session);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_refused_is_peer_not_ready() {
        let err = io::Error::from(io::ErrorKind::ConnectionRefused);
        let engine_err = EngineError::from_io(EngineErrorKind::Connect, &err);
        assert_eq!(engine_err.kind, EngineErrorKind::ConnectRefused);
        assert!(engine_err.is_peer_not_ready());
    }

    #[test]
    fn test_refused_outside_connect_is_not_retryable() {
        let err = io::Error::from(io::ErrorKind::ConnectionRefused);
        let engine_err = EngineError::from_io(EngineErrorKind::Io, &err);
        assert_eq!(engine_err.kind, EngineErrorKind::Io);
        assert!(!engine_err.is_peer_not_ready());
    }

    #[test]
    fn test_display() {
        let err = EngineError::new(EngineErrorKind::Listen);
        assert_eq!(err.to_string(), "unable to start listener for connections");

        let err = EngineError::with_detail(EngineErrorKind::Unsupported, "SCTP");
        assert_eq!(err.to_string(), "unsupported test setting: SCTP");
    }
}
