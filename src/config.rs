use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport protocol used for the measurement traffic.
///
/// # Examples
///
/// ```
/// use rperf3_runner::{ClientConfig, Protocol};
///
/// let config = ClientConfig::new("127.0.0.1", 5201).with_protocol(Protocol::Udp);
/// assert_eq!(config.protocol, Protocol::Udp);
/// assert_eq!("sctp".parse::<Protocol>().unwrap(), Protocol::Sctp);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Protocol {
    /// Transmission Control Protocol
    #[default]
    Tcp,
    /// User Datagram Protocol
    Udp,
    /// Stream Control Transmission Protocol
    Sctp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Sctp => "SCTP",
        };
        f.write_str(name)
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "sctp" => Ok(Protocol::Sctp),
            other => Err(format!("unknown protocol `{}`", other)),
        }
    }
}

/// Settings shared by both roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestConfig {
    /// Seconds between periodic bandwidth, jitter and loss samples.
    /// Zero leaves the engine default in place.
    pub measurement_interval: u64,
}

/// Configuration for a server-role session.
///
/// The listen port is always handed to the engine as-is; rejecting port 0 or
/// other unusable values is left to the engine.
///
/// # Examples
///
/// ```
/// use rperf3_runner::ServerConfig;
///
/// let config = ServerConfig::new(5201).with_measurement_interval(2);
/// assert_eq!(config.listen_port, 5201);
/// assert_eq!(config.test.measurement_interval, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub test: TestConfig,
    /// Port to listen on
    pub listen_port: u16,
}

impl ServerConfig {
    pub fn new(listen_port: u16) -> Self {
        Self {
            test: TestConfig::default(),
            listen_port,
        }
    }

    pub fn with_measurement_interval(mut self, secs: u64) -> Self {
        self.test.measurement_interval = secs;
        self
    }
}

/// Configuration for a client-role session.
///
/// Every numeric limit uses zero as "not set": the session adapter only
/// forwards a value to the engine when it is strictly positive, so a zeroed
/// field lets the engine pick its own default.
///
/// # Examples
///
/// ## Time-bound TCP test
///
/// ```
/// use rperf3_runner::ClientConfig;
///
/// let config = ClientConfig::new("192.168.1.100", 5201)
///     .with_duration(30)
///     .with_buffer_size(256 * 1024);
/// assert_eq!(config.bytes, 0); // unset
/// ```
///
/// ## Byte-bound UDP test
///
/// ```
/// use rperf3_runner::{ClientConfig, Protocol};
///
/// let config = ClientConfig::new("192.168.1.100", 5201)
///     .with_protocol(Protocol::Udp)
///     .with_bytes(10 * 1024 * 1024);
/// assert_eq!(config.duration_secs, 0); // engine default
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub test: TestConfig,

    /// Host name or address of the server to connect to
    pub target_host: String,

    /// Port the server listens on
    pub target_port: u16,

    /// Transport protocol for the measurement traffic
    pub protocol: Protocol,

    /// Test duration in seconds. Engine default: 10 seconds.
    pub duration_secs: u64,

    /// Amount of bytes to send
    pub bytes: u64,

    /// Size of the transmission buffer. Engine default: 128 KB for TCP and 8 KB for UDP.
    pub buffer_size: u64,

    /// Amount of packets (blocks) to send
    pub packets: u64,
}

impl ClientConfig {
    /// Creates a client configuration targeting `host:port` with every limit unset.
    pub fn new(target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            test: TestConfig::default(),
            target_host: target_host.into(),
            target_port,
            protocol: Protocol::Tcp,
            duration_secs: 0,
            bytes: 0,
            buffer_size: 0,
            packets: 0,
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_measurement_interval(mut self, secs: u64) -> Self {
        self.test.measurement_interval = secs;
        self
    }

    pub fn with_duration(mut self, secs: u64) -> Self {
        self.duration_secs = secs;
        self
    }

    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = bytes;
        self
    }

    pub fn with_buffer_size(mut self, size: u64) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_packets(mut self, packets: u64) -> Self {
        self.packets = packets;
        self
    }
}
