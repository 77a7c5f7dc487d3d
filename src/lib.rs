//! rperf3-runner - session orchestration for iperf-style throughput tests
//!
//! This library turns a small configuration record into one complete test
//! session: it creates a measurement engine session, forwards the requested
//! settings, routes the JSON results to a caller-supplied output stream, runs
//! the client or server role and releases the session again.
//!
//! # Features
//!
//! - Blocking client and server runners with a uniform result code
//! - Automatic retry while the server is not listening yet
//! - Pluggable measurement engine behind the [`Engine`] trait
//! - Built-in TCP and UDP engine with iperf-like JSON reports
//! - Convenience helpers that return the transferred bytes directly
//!
//! # Examples
//!
//! ```no_run
//! use rperf3_runner::{run_client, ClientConfig, OutputHandle, ResultCode};
//!
//! let config = ClientConfig::new("127.0.0.1", 5201).with_duration(5);
//! let result = run_client(&config, OutputHandle::stdout());
//! assert_eq!(ResultCode::of(&result), ResultCode::Success);
//! ```

mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod measurements;
pub mod native;
pub mod output;
pub mod protocol;
pub mod report;
pub mod runner;
mod server;
pub mod session;
pub mod transfer;
pub mod udp_packet;

#[cfg(test)]
mod fake_engine;

pub use config::{ClientConfig, Protocol, ServerConfig, TestConfig};
pub use engine::{Engine, EngineError, EngineErrorKind, EngineResult, Role};
pub use error::{describe_code, describe_error, Error, Result, ResultCode};
pub use native::{EngineDefaults, NativeEngine};
pub use output::OutputHandle;
pub use report::Report;
pub use runner::{run_client, run_server, ConnectRetry, Runner, CONNECT_RETRY_DELAY};
pub use transfer::{listen_and_serve, run_test, TransferError, TransferResults};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
