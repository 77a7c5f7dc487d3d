//! Server side of a built-in engine test.

use crate::config::Protocol;
use crate::engine::{EngineError, EngineErrorKind, EngineResult};
use crate::measurements::{IntervalRecorder, IntervalStats, Totals, UdpReceiveStats};
use crate::native::{
    build_report, io_error, new_cookie, protocol_error, sctp_unsupported, unexpected,
    EngineDefaults, Settings,
};
use crate::protocol::{read_message, write_message, Message, PROTOCOL_VERSION};
use crate::report::{EndReport, Report, Summary, TestStart, UdpSummary};
use crate::udp_packet::{self, MAX_DATAGRAM_SIZE};
use log::{debug, info, warn};
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::time;

const LISTEN_BACKLOG: u32 = 1024;

/// Upper bound on the TCP read buffer.
const MAX_READ_SIZE: usize = 1024 * 1024;

/// What the client reported once it stopped sending.
struct SenderTotals {
    bytes: u64,
    packets: u64,
    seconds: f64,
}

struct Received {
    intervals: Vec<IntervalStats>,
    totals: Totals,
    sender: SenderTotals,
    udp: Option<UdpSummary>,
}

/// Listens on the configured port, serves exactly one test and returns its
/// report. The listener is closed when this returns.
pub(crate) async fn serve(settings: &Settings, defaults: &EngineDefaults) -> EngineResult<Report> {
    let listener = bind_listener(settings.port)
        .map_err(|e| EngineError::from_io(EngineErrorKind::Listen, &e))?;
    let local = listener.local_addr().map_err(io_error)?;
    let port = local.port();
    info!("Server listening on {}", local);

    let (mut control, peer) = listener
        .accept()
        .await
        .map_err(|e| EngineError::from_io(EngineErrorKind::Accept, &e))?;
    let peer = canonical(peer);
    info!("Accepted connection from {}", peer);

    let (protocol, test) = match read_message(&mut control).await.map_err(protocol_error)? {
        Message::Setup {
            version,
            protocol,
            duration_secs,
            block_size,
            bytes,
            blocks,
        } => {
            if version != PROTOCOL_VERSION {
                let msg = format!("unsupported protocol version {}", version);
                reject(&mut control, &msg).await;
                return Err(EngineError::with_detail(EngineErrorKind::Protocol, msg));
            }
            let test = TestStart {
                duration_secs,
                block_size,
                bytes,
                blocks,
            };
            (protocol, test)
        }
        other => return Err(unexpected(&other, "Setup")),
    };
    info!(
        "Client {} setup: protocol={}, duration={}s, block_size={}",
        peer, protocol, test.duration_secs, test.block_size
    );

    if protocol == Protocol::Sctp {
        let err = sctp_unsupported();
        reject(&mut control, &err.to_string()).await;
        return Err(err);
    }

    let cookie = new_cookie();
    let block_size = usize::try_from(test.block_size)
        .unwrap_or(MAX_READ_SIZE)
        .clamp(1, MAX_READ_SIZE);
    let received = match protocol {
        Protocol::Udp => {
            receive_udp(&mut control, peer, port, &cookie, settings.interval, defaults.udp_drain)
                .await?
        }
        _ => {
            receive_tcp(
                &listener,
                &mut control,
                peer,
                &cookie,
                block_size,
                settings.interval,
                defaults.data_connect_timeout,
            )
            .await?
        }
    };

    let result = Message::Result {
        bytes: received.totals.bytes,
        packets: received.totals.packets,
        seconds: received.totals.seconds,
        udp: received.udp,
    };
    write_message(&mut control, &result).await.map_err(protocol_error)?;

    let mut sum_sent = Summary::new(received.sender.bytes, received.sender.seconds);
    let mut sum_received = Summary::new(received.totals.bytes, received.totals.seconds);
    if protocol == Protocol::Udp {
        sum_sent = sum_sent.with_packets(received.sender.packets);
        sum_received = sum_received.with_packets(received.totals.packets);
    }

    info!(
        "Test completed for {}: {:.2} Mbps",
        peer,
        sum_received.bits_per_second / 1_000_000.0
    );

    let mut served = settings.clone();
    served.protocol = protocol;
    Ok(build_report(
        &served,
        Some(peer.ip().to_string()),
        port,
        cookie,
        test,
        received.intervals,
        EndReport {
            sum_sent,
            sum_received,
            udp: received.udp,
        },
    ))
}

/// Listens on `[::]` with IPv4-mapped addresses enabled, so clients of either
/// family reach the server. Falls back to IPv4 only when the host has no IPv6.
fn bind_listener(port: u16) -> io::Result<TcpListener> {
    match bind_dual_stack(port) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => Err(e),
        Err(e) => {
            debug!("Dual-stack listen on port {} failed ({}), using IPv4", port, e);
            let socket = TcpSocket::new_v4()?;
            socket.set_reuseaddr(true)?;
            socket.bind((Ipv4Addr::UNSPECIFIED, port).into())?;
            socket.listen(LISTEN_BACKLOG)
        }
    }
}

fn bind_dual_stack(port: u16) -> io::Result<TcpListener> {
    let socket = TcpSocket::new_v6()?;
    set_v6_only(&socket, false)?;
    socket.set_reuseaddr(true)?;
    socket.bind((Ipv6Addr::UNSPECIFIED, port).into())?;
    socket.listen(LISTEN_BACKLOG)
}

fn set_v6_only<S: AsRawFd>(socket: &S, only: bool) -> io::Result<()> {
    let value = libc::c_int::from(only);
    // SAFETY: `value` outlives the call and the length matches its type.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IPV6,
            libc::IPV6_V6ONLY,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Unwraps IPv4-mapped IPv6 peers reported by the dual-stack listener.
fn canonical(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

/// Accepts the payload connection of the current test. Connections from any
/// other address are closed and the wait goes on until `timeout` expires.
async fn accept_data(
    listener: &TcpListener,
    peer_ip: IpAddr,
    timeout: Duration,
) -> EngineResult<TcpStream> {
    let matching = async {
        loop {
            let (stream, addr) = listener.accept().await?;
            if addr.ip().to_canonical() == peer_ip {
                return Ok::<_, io::Error>(stream);
            }
            warn!("Rejecting data connection from {}, test peer is {}", addr, peer_ip);
        }
    };
    time::timeout(timeout, matching)
        .await
        .map_err(|_| {
            EngineError::with_detail(
                EngineErrorKind::Accept,
                "timed out waiting for the data connection",
            )
        })?
        .map_err(|e| EngineError::from_io(EngineErrorKind::Accept, &e))
}

async fn reject(control: &mut TcpStream, message: &str) {
    if let Err(e) = write_message(control, &Message::error(message)).await {
        debug!("Could not send rejection to client: {}", e);
    }
}

async fn read_finished(control: &mut TcpStream) -> EngineResult<SenderTotals> {
    match read_message(control).await.map_err(protocol_error)? {
        Message::Finished {
            bytes,
            packets,
            seconds,
        } => Ok(SenderTotals {
            bytes,
            packets,
            seconds,
        }),
        other => Err(unexpected(&other, "Finished")),
    }
}

async fn receive_tcp(
    listener: &TcpListener,
    control: &mut TcpStream,
    peer: SocketAddr,
    cookie: &str,
    block_size: usize,
    interval: Duration,
    connect_timeout: Duration,
) -> EngineResult<Received> {
    let ack = Message::SetupAck {
        cookie: cookie.to_string(),
    };
    write_message(control, &ack).await.map_err(protocol_error)?;

    let mut data = accept_data(listener, peer.ip(), connect_timeout).await?;

    let mut buffer = vec![0u8; block_size];
    let mut recorder = IntervalRecorder::new(interval, false);
    loop {
        let n = data.read(&mut buffer).await.map_err(io_error)?;
        if n == 0 {
            break;
        }
        recorder.record(n as u64);
    }
    let (intervals, totals) = recorder.finish();

    let sender = read_finished(control).await?;
    Ok(Received {
        intervals,
        totals,
        sender,
        udp: None,
    })
}

async fn receive_udp(
    control: &mut TcpStream,
    peer: SocketAddr,
    port: u16,
    cookie: &str,
    interval: Duration,
    drain: Duration,
) -> EngineResult<Received> {
    let local: SocketAddr = if peer.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, port).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, port).into()
    };
    // Bound before the ack so no early datagram is lost.
    let socket = UdpSocket::bind(local).await.map_err(io_error)?;
    let ack = Message::SetupAck {
        cookie: cookie.to_string(),
    };
    write_message(control, &ack).await.map_err(protocol_error)?;

    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut recorder = IntervalRecorder::new(interval, true);
    let mut stats = UdpReceiveStats::new();

    let sender = {
        let finished = read_finished(control);
        tokio::pin!(finished);
        loop {
            tokio::select! {
                sender = &mut finished => break sender?,
                recv = socket.recv_from(&mut buffer) => match recv {
                    Ok((n, _)) => record_datagram(&buffer[..n], &mut recorder, &mut stats),
                    Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                        debug!("Ignoring ICMP error on UDP socket: {}", e);
                    }
                    Err(e) => return Err(io_error(e)),
                },
            }
        }
    };

    while stats.received() < sender.packets {
        match time::timeout(drain, socket.recv_from(&mut buffer)).await {
            Ok(Ok((n, _))) => record_datagram(&buffer[..n], &mut recorder, &mut stats),
            Ok(Err(e)) => {
                debug!("UDP receive error while draining: {}", e);
                break;
            }
            Err(_) => break,
        }
    }

    let (intervals, totals) = recorder.finish();
    let udp = stats.summary(sender.packets);
    debug!(
        "UDP receive done: {}/{} datagrams, {:.3} ms jitter",
        stats.received(),
        sender.packets,
        udp.jitter_ms
    );

    Ok(Received {
        intervals,
        totals,
        sender,
        udp: Some(udp),
    })
}

fn record_datagram(datagram: &[u8], recorder: &mut IntervalRecorder, stats: &mut UdpReceiveStats) {
    match udp_packet::parse_header(datagram) {
        Some(header) => {
            stats.record(header.sequence, header.timestamp_us, udp_packet::now_micros());
            recorder.record(datagram.len() as u64);
        }
        None => debug!("Ignoring foreign datagram of {} bytes", datagram.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv6_loopback_available() -> bool {
        std::net::TcpListener::bind("[::1]:0").is_ok()
    }

    #[tokio::test]
    async fn test_listener_accepts_ipv4_clients() {
        let listener = bind_listener(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        let (_, addr) = listener.accept().await.unwrap();
        assert_eq!(canonical(addr), client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_listener_accepts_ipv6_clients() {
        if !ipv6_loopback_available() {
            return;
        }
        let listener = bind_listener(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = TcpStream::connect((Ipv6Addr::LOCALHOST, port)).await.unwrap();
        let (_, addr) = listener.accept().await.unwrap();
        assert_eq!(addr.ip(), IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(canonical(addr), client.local_addr().unwrap());
    }

    #[test]
    fn test_canonical_unmaps_ipv4() {
        let mapped: SocketAddr = "[::ffff:127.0.0.1]:5201".parse().unwrap();
        assert_eq!(canonical(mapped), "127.0.0.1:5201".parse().unwrap());

        let v6: SocketAddr = "[::1]:5201".parse().unwrap();
        assert_eq!(canonical(v6), v6);
    }

    #[tokio::test]
    async fn test_accept_data_from_test_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();

        let data = accept_data(
            &listener,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(data.peer_addr().unwrap(), client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_accept_data_ignores_other_peers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _stray = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();

        let err = accept_data(
            &listener,
            "192.0.2.1".parse().unwrap(),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::Accept);
        assert!(err.to_string().contains("timed out"));
    }
}
