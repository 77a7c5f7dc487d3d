//! Client side of a built-in engine test.

use crate::config::Protocol;
use crate::engine::{EngineError, EngineErrorKind, EngineResult};
use crate::measurements::{IntervalRecorder, IntervalStats, Totals};
use crate::native::{
    build_report, io_error, protocol_error, sctp_unsupported, unexpected, EngineDefaults, Limit,
    Settings,
};
use crate::protocol::{read_message, write_message, Message, PROTOCOL_VERSION};
use crate::report::{EndReport, Report, Summary};
use crate::udp_packet;
use log::{debug, info};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time;

/// Connects to the server, sends the test traffic and collects both sides'
/// totals into a report.
///
/// A refused control connection surfaces as
/// [`EngineErrorKind::ConnectRefused`] so the runner can retry it.
pub(crate) async fn run(settings: &Settings, defaults: &EngineDefaults) -> EngineResult<Report> {
    if settings.protocol == Protocol::Sctp {
        return Err(sctp_unsupported());
    }
    let host = settings
        .host
        .as_deref()
        .ok_or_else(|| EngineError::with_detail(EngineErrorKind::Connect, "no server host set"))?;

    let mut control = TcpStream::connect((host, settings.port))
        .await
        .map_err(|e| EngineError::from_io(EngineErrorKind::Connect, &e))?;
    let peer = control.peer_addr().map_err(io_error)?;
    info!("Connected to {} ({})", peer, settings.protocol);

    let block_size = settings.effective_block_size(defaults);
    let setup = Message::Setup {
        version: PROTOCOL_VERSION,
        protocol: settings.protocol,
        duration_secs: settings.duration.as_secs(),
        block_size: block_size as u64,
        bytes: settings.bytes,
        blocks: settings.blocks,
    };
    write_message(&mut control, &setup).await.map_err(protocol_error)?;

    let cookie = match read_message(&mut control).await.map_err(protocol_error)? {
        Message::SetupAck { cookie } => cookie,
        other => return Err(unexpected(&other, "SetupAck")),
    };
    debug!("Test accepted, cookie {}", cookie);

    let limit = Limit::new(settings);
    let (intervals, sent) = match settings.protocol {
        Protocol::Udp => {
            send_udp(peer, block_size, limit, settings.interval, defaults.udp_bandwidth).await?
        }
        _ => send_tcp(peer, block_size, limit, settings.interval).await?,
    };

    let finished = Message::Finished {
        bytes: sent.bytes,
        packets: sent.packets,
        seconds: sent.seconds,
    };
    write_message(&mut control, &finished).await.map_err(protocol_error)?;

    let end = match read_message(&mut control).await.map_err(protocol_error)? {
        Message::Result {
            bytes,
            packets,
            seconds,
            udp,
        } => {
            let mut sum_sent = Summary::new(sent.bytes, sent.seconds);
            let mut sum_received = Summary::new(bytes, seconds);
            if settings.protocol == Protocol::Udp {
                sum_sent = sum_sent.with_packets(sent.packets);
                sum_received = sum_received.with_packets(packets);
            }
            EndReport {
                sum_sent,
                sum_received,
                udp,
            }
        }
        other => return Err(unexpected(&other, "Result")),
    };

    info!(
        "Test complete: {} bytes in {:.2}s, {:.2} Mbps",
        end.sum_sent.bytes,
        end.sum_sent.seconds,
        end.sum_sent.bits_per_second / 1_000_000.0
    );

    Ok(build_report(
        settings,
        Some(host.to_string()),
        peer.port(),
        cookie,
        settings.test_start(block_size),
        intervals,
        end,
    ))
}

async fn send_tcp(
    peer: SocketAddr,
    block_size: usize,
    limit: Limit,
    interval: Duration,
) -> EngineResult<(Vec<IntervalStats>, Totals)> {
    let mut data = TcpStream::connect(peer).await.map_err(io_error)?;
    let buffer = vec![0u8; block_size];
    let mut recorder = IntervalRecorder::new(interval, false);

    while !limit.reached(recorder.elapsed(), recorder.total_bytes(), recorder.total_packets()) {
        let len = limit.next_block(block_size, recorder.total_bytes());
        data.write_all(&buffer[..len]).await.map_err(io_error)?;
        recorder.record(len as u64);
    }

    data.shutdown().await.map_err(io_error)?;
    Ok(recorder.finish())
}

async fn send_udp(
    peer: SocketAddr,
    block_size: usize,
    limit: Limit,
    interval: Duration,
    bandwidth: u64,
) -> EngineResult<(Vec<IntervalStats>, Totals)> {
    let local: SocketAddr = if peer.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await.map_err(io_error)?;
    socket.connect(peer).await.map_err(io_error)?;

    let bytes_per_sec = bandwidth / 8;
    let mut datagram = vec![0u8; block_size];
    let mut recorder = IntervalRecorder::new(interval, true);
    let mut sequence = 0u64;

    while !limit.reached(recorder.elapsed(), recorder.total_bytes(), recorder.total_packets()) {
        let Some(len) = limit.next_datagram(block_size, recorder.total_bytes()) else {
            break;
        };
        udp_packet::write_header(&mut datagram, sequence, udp_packet::now_micros());
        let n = socket.send(&datagram[..len]).await.map_err(io_error)?;
        recorder.record(n as u64);
        sequence += 1;

        if bytes_per_sec > 0 {
            let on_schedule =
                Duration::from_secs_f64(recorder.total_bytes() as f64 / bytes_per_sec as f64);
            let elapsed = recorder.elapsed();
            if on_schedule > elapsed {
                time::sleep(on_schedule - elapsed).await;
            }
        }
    }

    debug!("Sent {} datagrams to {}", sequence, peer);
    Ok(recorder.finish())
}
