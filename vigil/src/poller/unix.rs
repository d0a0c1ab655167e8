use libc::{EBADF, EINVAL, c_int, close};

use std::io;

pub use std::os::fd::RawFd;

/// Marker stored in place of a released descriptor.
pub(crate) const CLOSED: RawFd = -1;

/// Turns a `-1` return value into the pending `errno`.
pub(crate) fn cvt(rc: c_int) -> io::Result<c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// Error for any call made on a poller after [`sys_close`].
pub(crate) fn bad_descriptor() -> io::Error {
    io::Error::from_raw_os_error(EBADF)
}

/// Error for a `wait` call without room for a single entry.
pub(crate) fn invalid_argument() -> io::Error {
    io::Error::from_raw_os_error(EINVAL)
}

/// Closes `*fd` once and replaces it with [`CLOSED`].
///
/// Calling it again is a no-op.
pub(crate) fn sys_close(fd: &mut RawFd) -> io::Result<()> {
    if *fd == CLOSED {
        return Ok(());
    }

    let raw = std::mem::replace(fd, CLOSED);
    cvt(unsafe { close(raw) }).map(drop)
}

/// Fails with `EBADF` if the descriptor was already released.
pub(crate) fn ensure_open(fd: RawFd) -> io::Result<RawFd> {
    if fd == CLOSED {
        Err(bad_descriptor())
    } else {
        Ok(fd)
    }
}
