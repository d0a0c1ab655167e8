//! Linux `epoll`-based poller implementation.
//!
//! This backend is a thin pass-through: [`Readiness`] is bit-identical to the
//! native `EPOLL*` constants, so interest and results cross the syscall
//! boundary untranslated. The only copy made is between [`Watch`] and the
//! (packed on x86_64) `epoll_event` layout.
//!
//! This backend is selected automatically on Linux targets.

use super::unix::{RawFd, cvt, ensure_open, invalid_argument, sys_close};
use crate::event::{Readiness, Watch};

use libc::{
    EINTR, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, c_int, epoll_create1,
    epoll_ctl, epoll_event, epoll_wait,
};
use log::{debug, trace, warn};
use std::{fmt, io, ptr};

/// Linux `epoll` poller.
///
/// This poller owns:
/// - an `epoll` instance,
/// - a reusable buffer for native events.
pub(crate) struct EpollPoller {
    /// Epoll file descriptor, `CLOSED` once released.
    epoll: RawFd,

    /// Reusable buffer for epoll events.
    events: Vec<epoll_event>,
}

unsafe impl Send for EpollPoller {}

impl EpollPoller {
    /// Creates a new epoll instance fetching up to `capacity` events per wait.
    pub(crate) fn new(capacity: usize) -> io::Result<Self> {
        let epoll = cvt(unsafe { epoll_create1(EPOLL_CLOEXEC) })?;
        debug!("epoll: created fd={epoll} capacity={capacity}");

        Ok(Self {
            epoll,
            events: vec![epoll_event { events: 0, u64: 0 }; capacity],
        })
    }

    /// Registers `fd` with the given interest.
    pub(crate) fn add(&mut self, fd: RawFd, watch: Watch) -> io::Result<()> {
        trace!("epoll: add fd={fd} events={:?} token={}", watch.events, watch.token);
        self.ctl(EPOLL_CTL_ADD, fd, Some(watch))
    }

    /// Updates interest flags for an already registered descriptor.
    pub(crate) fn modify(&mut self, fd: RawFd, watch: Watch) -> io::Result<()> {
        trace!("epoll: modify fd={fd} events={:?} token={}", watch.events, watch.token);
        self.ctl(EPOLL_CTL_MOD, fd, Some(watch))
    }

    /// Removes a descriptor from the interest list.
    pub(crate) fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        trace!("epoll: delete fd={fd}");
        self.ctl(EPOLL_CTL_DEL, fd, None)
    }

    fn ctl(&self, op: c_int, fd: RawFd, watch: Option<Watch>) -> io::Result<()> {
        let epoll = ensure_open(self.epoll)?;

        let mut event = watch.map(|watch| epoll_event {
            events: watch.events.bits(),
            u64: watch.token,
        });
        let event_ptr = event.as_mut().map_or(ptr::null_mut(), |e| e as *mut _);

        cvt(unsafe { epoll_ctl(epoll, op, fd, event_ptr) })?;
        Ok(())
    }

    /// Polls for readiness events.
    ///
    /// Blocks until at least one descriptor is ready or the timeout
    /// expires. An interrupted wait reports an empty batch.
    pub(crate) fn wait(&mut self, out: &mut [Watch], timeout_ms: i32) -> io::Result<usize> {
        let epoll = ensure_open(self.epoll)?;
        if out.is_empty() {
            return Err(invalid_argument());
        }

        let max = out.len().min(self.events.len());
        let n = unsafe { epoll_wait(epoll, self.events.as_mut_ptr(), max as c_int, timeout_ms) };

        let n = match cvt(n) {
            Ok(n) => n as usize,
            Err(err) if err.raw_os_error() == Some(EINTR) => {
                trace!("epoll: wait interrupted");
                return Ok(0);
            }
            Err(err) => return Err(err),
        };

        for (slot, native) in out.iter_mut().zip(&self.events[..n]) {
            *slot = Watch::new(Readiness::from_bits_retain(native.events), native.u64);
        }

        trace!("epoll: wait fd={epoll} timeout={timeout_ms} ready={n}");
        Ok(n)
    }

    /// Closes the epoll descriptor; a second call does nothing.
    pub(crate) fn close(&mut self) -> io::Result<()> {
        if self.epoll >= 0 {
            debug!("epoll: closing fd={}", self.epoll);
        }
        sys_close(&mut self.epoll)
    }
}

impl fmt::Debug for EpollPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpollPoller")
            .field("epoll", &self.epoll)
            .field("capacity", &self.events.len())
            .finish()
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("epoll: close failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn reported_flags_cover_requested_ones() {
        let mut poller = EpollPoller::new(4).unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();

        let wanted = Readiness::IN | Readiness::RDNORM;
        poller.add(a.as_raw_fd(), Watch::new(wanted, 1)).unwrap();
        b.write_all(b"x").unwrap();

        let mut out = [Watch::default(); 4];
        let n = poller.wait(&mut out, 1000).unwrap();
        assert_eq!(n, 1);
        assert!(out[0].events.contains(wanted));
    }

    #[test]
    fn deleting_twice_reports_not_found() {
        let mut poller = EpollPoller::new(4).unwrap();
        let (a, _b) = UnixStream::pair().unwrap();

        poller.add(a.as_raw_fd(), Watch::new(Readiness::IN, 1)).unwrap();
        poller.delete(a.as_raw_fd()).unwrap();

        let err = poller.delete(a.as_raw_fd()).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn batch_is_bounded_by_capacity() {
        let mut poller = EpollPoller::new(1).unwrap();
        let (a, _a) = UnixStream::pair().unwrap();
        let (b, _b) = UnixStream::pair().unwrap();

        poller.add(a.as_raw_fd(), Watch::new(Readiness::OUT, 1)).unwrap();
        poller.add(b.as_raw_fd(), Watch::new(Readiness::OUT, 2)).unwrap();

        let mut out = [Watch::default(); 8];
        assert_eq!(poller.wait(&mut out, 1000).unwrap(), 1);
    }
}
