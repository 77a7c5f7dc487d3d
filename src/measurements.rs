//! Interval sampling and UDP receive statistics for the built-in engine.

use crate::report::UdpSummary;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// One periodic sample. Times are seconds relative to the test start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalStats {
    pub start: f64,
    pub end: f64,
    pub seconds: f64,
    pub bytes: u64,
    pub bits_per_second: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packets: Option<u64>,
}

/// Accumulates transferred bytes and cuts a sample every `interval`.
///
/// # Examples
///
/// ```
/// use rperf3_runner::measurements::IntervalRecorder;
/// use std::time::Duration;
///
/// let mut recorder = IntervalRecorder::new(Duration::from_secs(1), false);
/// recorder.record(4096);
/// let (intervals, total) = recorder.finish();
/// assert_eq!(total.bytes, 4096);
/// assert_eq!(intervals.len(), 1);
/// ```
#[derive(Debug)]
pub struct IntervalRecorder {
    interval: Duration,
    count_packets: bool,
    start: Instant,
    interval_start: Instant,
    interval_bytes: u64,
    interval_packets: u64,
    total_bytes: u64,
    total_packets: u64,
    samples: Vec<IntervalStats>,
}

/// Totals over the whole test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Totals {
    pub bytes: u64,
    pub packets: u64,
    pub seconds: f64,
}

impl IntervalRecorder {
    /// Starts the clock. `count_packets` adds per-sample packet counts (UDP).
    pub fn new(interval: Duration, count_packets: bool) -> Self {
        let now = Instant::now();
        Self {
            interval,
            count_packets,
            start: now,
            interval_start: now,
            interval_bytes: 0,
            interval_packets: 0,
            total_bytes: 0,
            total_packets: 0,
            samples: Vec::new(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn total_packets(&self) -> u64 {
        self.total_packets
    }

    /// Records one block or datagram of `bytes`.
    pub fn record(&mut self, bytes: u64) {
        self.interval_bytes += bytes;
        self.interval_packets += 1;
        self.total_bytes += bytes;
        self.total_packets += 1;

        let now = Instant::now();
        if !self.interval.is_zero() && now.duration_since(self.interval_start) >= self.interval {
            self.cut(now);
        }
    }

    fn cut(&mut self, now: Instant) {
        let start = self.interval_start.duration_since(self.start).as_secs_f64();
        let end = now.duration_since(self.start).as_secs_f64();
        let seconds = end - start;
        let bits_per_second = if seconds > 0.0 {
            self.interval_bytes as f64 * 8.0 / seconds
        } else {
            0.0
        };

        self.samples.push(IntervalStats {
            start,
            end,
            seconds,
            bytes: self.interval_bytes,
            bits_per_second,
            packets: self.count_packets.then_some(self.interval_packets),
        });

        self.interval_start = now;
        self.interval_bytes = 0;
        self.interval_packets = 0;
    }

    /// Closes the trailing partial interval, if it saw any traffic.
    pub fn finish(mut self) -> (Vec<IntervalStats>, Totals) {
        let now = Instant::now();
        if self.interval_packets > 0 {
            self.cut(now);
        }
        let totals = Totals {
            bytes: self.total_bytes,
            packets: self.total_packets,
            seconds: now.duration_since(self.start).as_secs_f64(),
        };
        (self.samples, totals)
    }
}

/// Receiver-side datagram statistics.
///
/// Jitter follows RFC 3550: `J += (|D(i-1,i)| - J) / 16`, where `D` is the
/// change in one-way transit time between consecutive datagrams.
#[derive(Debug, Default)]
pub struct UdpReceiveStats {
    received: u64,
    highest_sequence: Option<u64>,
    out_of_order: u64,
    last_transit_us: Option<i64>,
    jitter_us: f64,
}

impl UdpReceiveStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn record(&mut self, sequence: u64, sent_us: u64, received_us: u64) {
        self.received += 1;

        let transit = received_us as i64 - sent_us as i64;
        if let Some(last) = self.last_transit_us {
            let delta = (transit - last).abs() as f64;
            self.jitter_us += (delta - self.jitter_us) / 16.0;
        }
        self.last_transit_us = Some(transit);

        match self.highest_sequence {
            Some(highest) if sequence < highest => self.out_of_order += 1,
            _ => self.highest_sequence = Some(sequence),
        }
    }

    /// Summary against the sender's datagram count.
    pub fn summary(&self, packets_sent: u64) -> UdpSummary {
        let lost_packets = packets_sent.saturating_sub(self.received);
        let lost_percent = if packets_sent > 0 {
            lost_packets as f64 * 100.0 / packets_sent as f64
        } else {
            0.0
        };
        UdpSummary {
            packets: packets_sent,
            lost_packets,
            lost_percent,
            jitter_ms: self.jitter_us / 1000.0,
            out_of_order: self.out_of_order,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_totals() {
        let mut recorder = IntervalRecorder::new(Duration::from_secs(60), false);
        recorder.record(1000);
        recorder.record(2000);
        assert_eq!(recorder.total_bytes(), 3000);
        assert_eq!(recorder.total_packets(), 2);

        let (intervals, totals) = recorder.finish();
        assert_eq!(totals.bytes, 3000);
        assert_eq!(totals.packets, 2);
        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].bytes, 3000);
        assert_eq!(intervals[0].packets, None);
    }

    #[test]
    fn test_recorder_cuts_intervals() {
        let mut recorder = IntervalRecorder::new(Duration::from_millis(10), true);
        recorder.record(100);
        std::thread::sleep(Duration::from_millis(15));
        recorder.record(100);
        recorder.record(100);

        let (intervals, totals) = recorder.finish();
        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals[0].bytes, 200);
        assert_eq!(intervals[0].packets, Some(2));
        assert_eq!(intervals[1].bytes, 100);
        assert!(intervals[0].end <= intervals[1].start + f64::EPSILON);
        assert_eq!(totals.bytes, 300);
    }

    #[test]
    fn test_recorder_without_traffic() {
        let recorder = IntervalRecorder::new(Duration::from_secs(1), false);
        let (intervals, totals) = recorder.finish();
        assert!(intervals.is_empty());
        assert_eq!(totals.bytes, 0);
    }

    #[test]
    fn test_udp_loss() {
        let mut stats = UdpReceiveStats::new();
        let base = 1_000_000u64;
        for seq in [0u64, 1, 3, 5] {
            stats.record(seq, base + seq * 1000, base + seq * 1000 + 100);
        }

        let summary = stats.summary(6);
        assert_eq!(summary.packets, 6);
        assert_eq!(summary.lost_packets, 2);
        assert!((summary.lost_percent - 33.333).abs() < 0.01);
        assert_eq!(summary.out_of_order, 0);
        assert_eq!(summary.jitter_ms, 0.0);
    }

    #[test]
    fn test_udp_out_of_order() {
        let mut stats = UdpReceiveStats::new();
        let base = 1_000_000u64;
        stats.record(0, base, base + 100);
        stats.record(2, base + 2000, base + 2100);
        stats.record(1, base + 1000, base + 3100);
        stats.record(3, base + 3000, base + 3200);

        assert_eq!(stats.summary(4).out_of_order, 1);
        assert_eq!(stats.summary(4).lost_packets, 0);
    }

    #[test]
    fn test_udp_jitter() {
        let mut stats = UdpReceiveStats::new();
        stats.record(0, 0, 100);
        stats.record(1, 10_000, 10_260); // transit changes by 160 µs

        let jitter = stats.summary(2).jitter_ms;
        assert!((jitter - 0.010).abs() < 1e-9, "jitter was {}", jitter);
    }

    #[test]
    fn test_udp_more_received_than_sent() {
        let mut stats = UdpReceiveStats::new();
        stats.record(0, 0, 1);
        stats.record(0, 0, 1);
        assert_eq!(stats.summary(1).lost_packets, 0);
        assert_eq!(stats.summary(0).lost_percent, 0.0);
    }
}
