//! Datagram header used by UDP tests for loss and jitter accounting.
//!
//! ```text
//! | Magic (4 bytes) | Sequence (8 bytes) | Timestamp µs (8 bytes) | Payload |
//! ```
//!
//! All fields are big-endian. Datagrams without the magic marker are ignored
//! by the receiver.
//!
//! ```
//! use rperf3_runner::udp_packet::{parse_header, write_header, HEADER_SIZE};
//!
//! let mut datagram = vec![0u8; 1024];
//! write_header(&mut datagram, 42, 1_000_000);
//! let header = parse_header(&datagram).unwrap();
//! assert_eq!(header.sequence, 42);
//! assert_eq!(header.timestamp_us, 1_000_000);
//! assert!(datagram.len() > HEADER_SIZE);
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

const MAGIC: u32 = 0x5250_4633; // "RPF3"

pub const HEADER_SIZE: usize = 20;

/// Largest datagram payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub sequence: u64,
    pub timestamp_us: u64,
}

/// Microseconds since the UNIX epoch, or 0 if the clock is before it.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Stamps the header into the front of `datagram`, which must hold at least
/// [`HEADER_SIZE`] bytes. The payload after it is left untouched.
pub fn write_header(datagram: &mut [u8], sequence: u64, timestamp_us: u64) {
    datagram[0..4].copy_from_slice(&MAGIC.to_be_bytes());
    datagram[4..12].copy_from_slice(&sequence.to_be_bytes());
    datagram[12..20].copy_from_slice(&timestamp_us.to_be_bytes());
}

pub fn parse_header(datagram: &[u8]) -> Option<Header> {
    if datagram.len() < HEADER_SIZE {
        return None;
    }
    let magic = u32::from_be_bytes(datagram[0..4].try_into().ok()?);
    if magic != MAGIC {
        return None;
    }
    Some(Header {
        sequence: u64::from_be_bytes(datagram[4..12].try_into().ok()?),
        timestamp_us: u64::from_be_bytes(datagram[12..20].try_into().ok()?),
    })
}
