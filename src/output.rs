//! Caller-owned output handles.
//!
//! Results are written to a descriptor the caller already opened. Binding a
//! handle duplicates the descriptor, so the session can flush and close its
//! own copy while the caller's descriptor stays open and caller-owned.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// A borrowed, already-open writable descriptor.
///
/// Creating a handle never checks the descriptor; an unusable handle is
/// reported when a session tries to bind it.
///
/// # Examples
///
/// ```
/// use rperf3_runner::OutputHandle;
///
/// let stdout = OutputHandle::stdout();
/// assert_eq!(stdout.raw_fd(), 1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputHandle {
    fd: RawFd,
}

impl OutputHandle {
    pub fn from_raw_fd(fd: RawFd) -> Self {
        Self { fd }
    }

    /// Borrows the descriptor behind any open file-like value.
    pub fn of<T: AsRawFd>(file: &T) -> Self {
        Self {
            fd: file.as_raw_fd(),
        }
    }

    pub fn stdout() -> Self {
        Self {
            fd: libc::STDOUT_FILENO,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl AsRawFd for OutputHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

/// Wraps the handle as a writable stream owned by the caller of this function.
///
/// Fails with the OS error when the descriptor is closed or invalid, and with
/// `EBADF` when it was opened read-only.
pub fn open_stream(handle: OutputHandle) -> io::Result<File> {
    let fd = handle.raw_fd();
    if fd < 0 {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }

    // SAFETY: F_GETFL only inspects the descriptor table; a stale descriptor yields EBADF.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY | libc::O_RDWR => {}
        _ => return Err(io::Error::from_raw_os_error(libc::EBADF)),
    }

    // SAFETY: F_DUPFD_CLOEXEC returns a new descriptor or -1, it never touches `fd` itself.
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: `dup` was just created and nothing else owns it.
    let owned = unsafe { OwnedFd::from_raw_fd(dup) };
    Ok(File::from(owned))
}
