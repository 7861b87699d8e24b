//! Thin wrappers over the libc calls shared by the source and kernel drivers.

use std::io;
use std::os::fd::RawFd;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// poll(2)
// ---------------------------------------------------------------------------

/// Wait until `fd` reports any of `events`, or `timeout` passes.
///
/// Returns `Ok(true)` when the descriptor has any event pending, including
/// hangup or error, so the following read or write reports the real state.
/// An interrupted poll is reported as not ready so callers re-check their
/// own deadlines.
pub fn poll_fd(fd: RawFd, events: libc::c_short, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    // Round up so a sub-millisecond remainder still waits.
    let millis = timeout.as_micros().div_ceil(1000).min(libc::c_int::MAX as u128) as libc::c_int;
    // SAFETY: `pfd` is a valid pollfd that lives for the duration of the call,
    // and we pass nfds = 1 to match.
    let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(rc > 0)
}

pub fn poll_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    poll_fd(fd, libc::POLLIN, timeout)
}

pub fn poll_writable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    poll_fd(fd, libc::POLLOUT, timeout)
}

// ---------------------------------------------------------------------------
// /proc helpers
// ---------------------------------------------------------------------------

/// First whitespace-separated token of a small text file, parsed as `u32`.
pub fn read_first_u32(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.split_whitespace().next().and_then(|v| v.parse().ok()))
}
