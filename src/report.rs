//! The JSON report the built-in engine writes to a session's output.
//!
//! One report per completed test, serialized on a single line so a stream of
//! reports can be consumed as line-delimited JSON.

use crate::config::Protocol;
use crate::engine::Role;
use crate::measurements::IntervalStats;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Write};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub start: StartInfo,
    pub intervals: Vec<IntervalStats>,
    pub end: EndReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartInfo {
    pub version: String,
    pub role: Role,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
    pub port: u16,
    pub cookie: String,
    pub timestamp: Timestamp,
    pub test: TestStart,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub time: String,
    pub timesecs: i64,
}

impl Timestamp {
    pub fn now() -> Self {
        let now = chrono::Utc::now();
        Self {
            time: now.to_rfc2822(),
            timesecs: now.timestamp(),
        }
    }
}

/// The settings the test actually ran with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStart {
    pub duration_secs: u64,
    pub block_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocks: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndReport {
    pub sum_sent: Summary,
    pub sum_received: Summary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp: Option<UdpSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub bytes: u64,
    pub seconds: f64,
    pub bits_per_second: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packets: Option<u64>,
}

impl Summary {
    pub fn new(bytes: u64, seconds: f64) -> Self {
        let bits_per_second = if seconds > 0.0 {
            bytes as f64 * 8.0 / seconds
        } else {
            0.0
        };
        Self {
            bytes,
            seconds,
            bits_per_second,
            packets: None,
        }
    }

    pub fn with_packets(mut self, packets: u64) -> Self {
        self.packets = Some(packets);
        self
    }
}

/// Receiver-side datagram accounting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UdpSummary {
    pub packets: u64,
    pub lost_packets: u64,
    pub lost_percent: f64,
    pub jitter_ms: f64,
    pub out_of_order: u64,
}

impl Report {
    /// Writes the report as one JSON line.
    pub fn write_json<W: Write>(&self, out: &mut W) -> io::Result<()> {
        serde_json::to_writer(&mut *out, self)?;
        out.write_all(b"\n")
    }

    /// Writes a short human-readable summary.
    pub fn write_text<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(
            out,
            "Connecting to host {}, port {}",
            self.start.remote_host.as_deref().unwrap_or("-"),
            self.start.port
        )?;
        writeln!(out, "[ ID] Interval           Transfer        Bitrate")?;
        for interval in &self.intervals {
            writeln!(
                out,
                "[  5] {:5.2}-{:<5.2} sec  {:>10} bytes  {:8.2} Mbits/sec",
                interval.start,
                interval.end,
                interval.bytes,
                interval.bits_per_second / 1_000_000.0
            )?;
        }
        writeln!(out, "- - - - - - - - - - - - - - - - - - - - - - - - -")?;
        for (label, sum) in [("sender", &self.end.sum_sent), ("receiver", &self.end.sum_received)] {
            writeln!(
                out,
                "[  5] {:5.2} sec  {:>10} bytes  {:8.2} Mbits/sec  {}",
                sum.seconds,
                sum.bytes,
                sum.bits_per_second / 1_000_000.0,
                label
            )?;
        }
        if let Some(udp) = &self.end.udp {
            writeln!(
                out,
                "[  5] jitter {:.3} ms  lost {}/{} ({:.2}%)  out-of-order {}",
                udp.jitter_ms, udp.lost_packets, udp.packets, udp.lost_percent, udp.out_of_order
            )?;
        }
        Ok(())
    }

    /// Reads the first report from a line-delimited stream.
    ///
    /// Returns `Ok(None)` on an empty stream.
    pub fn read_first<R: BufRead>(reader: R) -> serde_json::Result<Option<Report>> {
        serde_json::Deserializer::from_reader(reader)
            .into_iter::<Report>()
            .next()
            .transpose()
    }
}
