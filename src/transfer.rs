//! One-call helpers that run a test and hand back what it transferred.
//!
//! The report is routed through an anonymous pipe and decoded here, so the
//! caller never deals with output handles.

use crate::config::{ClientConfig, ServerConfig};
use crate::engine::Engine;
use crate::error::Error;
use crate::native::NativeEngine;
use crate::output::OutputHandle;
use crate::report::Report;
use crate::runner::Runner;
use log::debug;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::os::fd::{FromRawFd, OwnedFd};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Totals of one completed test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferResults {
    /// Bytes sent by the client, or received by the server.
    pub bytes_sent: u64,
    /// Sending time as reported by the client.
    pub duration: Duration,
}

impl TransferResults {
    fn from_report(report: &Report, bytes: u64) -> Self {
        let seconds = report.end.sum_sent.seconds;
        let duration = if seconds.is_finite() && seconds > 0.0 {
            Duration::from_secs_f64(seconds)
        } else {
            Duration::ZERO
        };
        Self {
            bytes_sent: bytes,
            duration,
        }
    }
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("{0}")]
    Run(#[from] Error),

    #[error("creating pipe: {0}")]
    Pipe(#[source] io::Error),

    #[error("reading test output: {0}")]
    Read(#[source] io::Error),

    #[error("decoding test report: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("test produced no report")]
    NoReport,
}

/// Runs a client test with the built-in engine.
pub fn run_test(config: &ClientConfig) -> Result<TransferResults, TransferError> {
    run_test_with(&Runner::new(NativeEngine::default()), config)
}

/// Serves one test with the built-in engine.
pub fn listen_and_serve(config: &ServerConfig) -> Result<TransferResults, TransferError> {
    listen_and_serve_with(&Runner::new(NativeEngine::default()), config)
}

/// Runs a client test on `runner`; the result counts bytes the client sent.
pub fn run_test_with<E: Engine>(
    runner: &Runner<E>,
    config: &ClientConfig,
) -> Result<TransferResults, TransferError> {
    let report = collect_report(|output| runner.run_client(config, output))?;
    Ok(TransferResults::from_report(&report, report.end.sum_sent.bytes))
}

/// Serves one test on `runner`; the result counts bytes the server received.
pub fn listen_and_serve_with<E: Engine>(
    runner: &Runner<E>,
    config: &ServerConfig,
) -> Result<TransferResults, TransferError> {
    let report = collect_report(|output| runner.run_server(config, output))?;
    Ok(TransferResults::from_report(&report, report.end.sum_received.bytes))
}

fn collect_report<F>(run: F) -> Result<Report, TransferError>
where
    F: FnOnce(OutputHandle) -> crate::error::Result<()>,
{
    let (read_end, write_end) = pipe().map_err(TransferError::Pipe)?;

    // Drained concurrently so a large report never blocks the writer.
    let reader = thread::spawn(move || -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        File::from(read_end).read_to_end(&mut buf)?;
        Ok(buf)
    });

    let result = run(OutputHandle::of(&write_end));
    // The reader only sees EOF once our end is closed too.
    drop(write_end);

    let output = match reader.join() {
        Ok(read) => read.map_err(TransferError::Read)?,
        Err(_) => {
            return Err(TransferError::Read(io::Error::new(
                io::ErrorKind::Other,
                "output reader panicked",
            )))
        }
    };
    result?;

    debug!("Collected {} bytes of test output", output.len());
    Report::read_first(BufReader::new(output.as_slice()))?.ok_or(TransferError::NoReport)
}

/// Creates a close-on-exec pipe as `(read_end, write_end)`.
fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    open_pipe(&mut fds)?;
    // SAFETY: the pipe was just created, so both descriptors are open and unowned.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
    target_os = "illumos"
))]
fn open_pipe(fds: &mut [libc::c_int; 2]) -> io::Result<()> {
    // SAFETY: `fds` has room for the two descriptors pipe2(2) writes.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// No pipe2 here; the flag is set right after creation.
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
    target_os = "illumos"
)))]
fn open_pipe(fds: &mut [libc::c_int; 2]) -> io::Result<()> {
    // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    for fd in *fds {
        // SAFETY: fcntl on a descriptor pipe(2) just returned.
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: both descriptors are still unowned.
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_engine::FakeEngine;
    use crate::report::{EndReport, StartInfo, Summary, TestStart, Timestamp};
    use crate::Protocol;
    use crate::Role;
    use std::io::Write;

    fn report(sent: u64, received: u64) -> Report {
        Report {
            start: StartInfo {
                version: "test".to_string(),
                role: Role::Client,
                protocol: Protocol::Tcp,
                remote_host: None,
                port: 5201,
                cookie: String::new(),
                timestamp: Timestamp::now(),
                test: TestStart {
                    duration_secs: 1,
                    block_size: 1024,
                    bytes: None,
                    blocks: None,
                },
            },
            intervals: Vec::new(),
            end: EndReport {
                sum_sent: Summary::new(sent, 1.5),
                sum_received: Summary::new(received, 1.5),
                udp: None,
            },
        }
    }

    fn write_to(output: OutputHandle, report: &Report) -> crate::error::Result<()> {
        let mut out = crate::output::open_stream(output).unwrap();
        report.write_json(&mut out).unwrap();
        out.flush().unwrap();
        Ok(())
    }

    #[test]
    fn test_collect_report_reads_first_line() {
        let expected = report(4096, 4000);
        let got = collect_report(|output| write_to(output, &expected)).unwrap();
        assert_eq!(got.end, expected.end);

        let results = TransferResults::from_report(&got, got.end.sum_sent.bytes);
        assert_eq!(results.bytes_sent, 4096);
        assert_eq!(results.duration, Duration::from_millis(1500));
    }

    #[test]
    fn test_collect_report_empty_output() {
        let err = collect_report(|_| Ok(())).unwrap_err();
        assert!(matches!(err, TransferError::NoReport));
    }

    #[test]
    fn test_collect_report_garbage_output() {
        let err = collect_report(|output| {
            let mut out = crate::output::open_stream(output).unwrap();
            out.write_all(b"not json\n").unwrap();
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, TransferError::Decode(_)));
    }

    #[test]
    fn test_run_failure_is_surfaced() {
        let runner = Runner::new(FakeEngine::new().failing_new_session());
        let err = run_test_with(&runner, &ClientConfig::new("127.0.0.1", 5201)).unwrap_err();
        assert!(matches!(err, TransferError::Run(Error::Engine(_))));
    }

    #[test]
    fn test_pipe_is_close_on_exec() {
        use std::os::fd::AsRawFd;

        let (read_end, write_end) = pipe().unwrap();
        for fd in [&read_end, &write_end] {
            // SAFETY: querying flags of a descriptor owned by this test.
            let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
            assert!(flags >= 0);
            assert_ne!(flags & libc::FD_CLOEXEC, 0);
        }
    }

    #[test]
    fn test_duration_of_bad_seconds() {
        let mut r = report(1, 1);
        r.end.sum_sent.seconds = f64::NAN;
        assert_eq!(TransferResults::from_report(&r, 1).duration, Duration::ZERO);
    }
}
