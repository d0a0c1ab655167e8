//! macOS `kqueue`-based poller implementation.
//!
//! kqueue watches each I/O direction with its own filter and has no notion of
//! a per-descriptor interest set, so `epoll` semantics are rebuilt on top:
//! - every registration installs both `EVFILT_READ` and `EVFILT_WRITE`, each
//!   enabled or disabled according to the requested [`Readiness`],
//! - one-shot maps to `EV_DISPATCH`, edge-triggered to `EV_CLEAR`,
//! - two bits of sticky state per descriptor ("registered", "report
//!   `RDHUP`") live in the kernel as disabled `EVFILT_USER` events whose
//!   identifier is `fd | bit << KEY_BITS`. A bit is read back with a
//!   receipt-only change: `ENOENT` means the phantom event does not exist.
//!
//! Because the identifiers share the descriptor's key space, descriptors
//! must fit in `KEY_BITS` bits.
//!
//! This backend is selected automatically on macOS targets.

use super::unix::{RawFd, bad_descriptor, cvt, ensure_open, invalid_argument, sys_close};
use crate::event::{Readiness, Watch};

use libc::{
    EEXIST, EINTR, ENOENT, EV_ADD, EV_CLEAR, EV_DELETE, EV_DISABLE, EV_DISPATCH, EV_ENABLE,
    EV_EOF, EV_ERROR, EV_RECEIPT, EVFILT_READ, EVFILT_USER, EVFILT_WRITE, FD_CLOEXEC, F_SETFD,
    c_int, c_long, c_void, fcntl, kevent, kqueue, time_t, timespec,
};
use log::{debug, trace, warn};
use std::{fmt, io, ptr};

/// Width of the descriptor part of a phantom event identifier.
const KEY_BITS: u32 = 30;

/// Sticky per-descriptor state stored as phantom user events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
enum StateBit {
    /// The descriptor is part of the poll set.
    Registered = 0,

    /// `EV_EOF` on the read filter is reported as [`Readiness::RDHUP`].
    ReadHangUp = 1,
}

fn state_key(fd: RawFd, bit: StateBit) -> usize {
    fd as usize | (bit as usize) << KEY_BITS
}

fn check_key(fd: RawFd) -> io::Result<()> {
    if fd < 0 || (fd as usize) >> KEY_BITS != 0 {
        Err(bad_descriptor())
    } else {
        Ok(())
    }
}

/// Builds a change that always produces a receipt.
fn change(ident: usize, filter: i16, flags: u16, token: u64) -> libc::kevent {
    libc::kevent {
        ident,
        filter,
        flags: flags | EV_RECEIPT,
        fflags: 0,
        data: 0,
        udata: token as usize as *mut c_void,
    }
}

/// Error carried by a receipt, if it is one the caller must see.
///
/// Deleting something already gone and failing to arm a direction the
/// caller did not ask for are both harmless.
fn receipt_error(receipt: &libc::kevent) -> Option<io::Error> {
    if receipt.flags & EV_ERROR == 0 || receipt.data == 0 {
        return None;
    }

    let errno = receipt.data as c_int;
    let io_filter = receipt.filter != EVFILT_USER;

    if receipt.flags & EV_DELETE != 0 && (errno == ENOENT || io_filter) {
        return None;
    }
    if io_filter && receipt.flags & EV_DISABLE != 0 && errno != libc::EBADF {
        return None;
    }

    Some(io::Error::from_raw_os_error(errno))
}

/// macOS `kqueue` poller emulating `epoll`.
pub(crate) struct KqueuePoller {
    /// Kqueue file descriptor, `CLOSED` once released.
    kq: RawFd,

    /// Reusable buffer for kernel events.
    events: Vec<libc::kevent>,

    /// Identifiers already reported during the current wait, by output slot.
    ready: Vec<usize>,
}

unsafe impl Send for KqueuePoller {}

impl KqueuePoller {
    /// Creates a new kqueue fetching up to `capacity` events per wait.
    pub(crate) fn new(capacity: usize) -> io::Result<Self> {
        let mut kq = cvt(unsafe { kqueue() })?;

        if let Err(err) = cvt(unsafe { fcntl(kq, F_SETFD, FD_CLOEXEC) }) {
            let _ = sys_close(&mut kq);
            return Err(err);
        }

        debug!("kqueue: created fd={kq} capacity={capacity}");

        Ok(Self {
            kq,
            events: vec![change(0, 0, 0, 0); capacity],
            ready: Vec::with_capacity(capacity),
        })
    }

    /// Registers `fd`, failing with `EEXIST` if it already is.
    pub(crate) fn add(&mut self, fd: RawFd, watch: Watch) -> io::Result<()> {
        trace!("kqueue: add fd={fd} events={:?} token={}", watch.events, watch.token);
        check_key(fd)?;

        if self.has_state(fd, StateBit::Registered)? {
            return Err(io::Error::from_raw_os_error(EEXIST));
        }

        let mut changes = Self::interest_changes(fd, watch);
        if let Err(err) = self.apply(&mut changes) {
            self.forget(fd);
            return Err(err);
        }

        Ok(())
    }

    /// Replaces the interest of a registered descriptor, re-arming it.
    pub(crate) fn modify(&mut self, fd: RawFd, watch: Watch) -> io::Result<()> {
        trace!("kqueue: modify fd={fd} events={:?} token={}", watch.events, watch.token);
        check_key(fd)?;

        if !self.has_state(fd, StateBit::Registered)? {
            return Err(io::Error::from_raw_os_error(ENOENT));
        }

        // `EV_ADD` on an existing knote keeps its `EV_DISPATCH`/`EV_CLEAR`
        // flags, so the I/O filters are recreated from scratch.
        let ident = fd as usize;
        let [read, write, registered, read_hang_up] = Self::interest_changes(fd, watch);
        let mut changes = [
            change(ident, EVFILT_READ, EV_DELETE, 0),
            change(ident, EVFILT_WRITE, EV_DELETE, 0),
            read,
            write,
            registered,
            read_hang_up,
        ];
        self.apply(&mut changes)
    }

    /// Removes both filters and every phantom state bit of `fd`.
    pub(crate) fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        trace!("kqueue: delete fd={fd}");
        check_key(fd)?;

        if !self.has_state(fd, StateBit::Registered)? {
            return Err(io::Error::from_raw_os_error(ENOENT));
        }

        let mut changes = Self::removal_changes(fd);
        self.apply(&mut changes)
    }

    /// Polls for readiness events.
    ///
    /// Read and write readiness of one descriptor are merged into a single
    /// entry. An interrupted wait reports an empty batch.
    pub(crate) fn wait(&mut self, out: &mut [Watch], timeout_ms: i32) -> io::Result<usize> {
        let kq = ensure_open(self.kq)?;
        if out.is_empty() {
            return Err(invalid_argument());
        }

        let timeout = timespec {
            tv_sec: (timeout_ms / 1000) as time_t,
            tv_nsec: ((timeout_ms % 1000) as c_long) * 1_000_000,
        };
        let timeout_ptr = if timeout_ms < 0 {
            ptr::null()
        } else {
            &timeout as *const timespec
        };

        let max = out.len().min(self.events.len());
        let n = unsafe {
            kevent(
                kq,
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                max as c_int,
                timeout_ptr,
            )
        };

        let n = match cvt(n) {
            Ok(n) => n as usize,
            Err(err) if err.raw_os_error() == Some(EINTR) => {
                trace!("kqueue: wait interrupted");
                return Ok(0);
            }
            Err(err) => return Err(err),
        };

        self.ready.clear();
        let mut disarm = Vec::new();

        for i in 0..n {
            let event = self.events[i];
            if event.filter == EVFILT_USER {
                continue;
            }

            let flags = self.translate(&event);

            let slot = match self.ready.iter().position(|&ident| ident == event.ident) {
                Some(slot) => slot,
                None => {
                    let slot = self.ready.len();
                    self.ready.push(event.ident);
                    out[slot] = Watch::new(Readiness::empty(), event.udata as usize as u64);
                    slot
                }
            };
            out[slot].events |= flags;

            if event.flags & EV_DISPATCH != 0 {
                let other = if event.filter == EVFILT_READ {
                    EVFILT_WRITE
                } else {
                    EVFILT_READ
                };
                disarm.push(change(event.ident, other, EV_DISABLE, 0));
            }
        }

        if !disarm.is_empty() {
            if let Err(err) = self.submit(&mut disarm) {
                warn!("kqueue: failed to disarm one-shot watches: {err}");
            }
        }

        trace!("kqueue: wait fd={kq} timeout={timeout_ms} ready={}", self.ready.len());
        Ok(self.ready.len())
    }

    /// Closes the kqueue, dropping every filter and phantom event with it.
    pub(crate) fn close(&mut self) -> io::Result<()> {
        if self.kq >= 0 {
            debug!("kqueue: closing fd={}", self.kq);
        }
        sys_close(&mut self.kq)
    }

    /// Converts one kernel event into readiness flags.
    fn translate(&self, event: &libc::kevent) -> Readiness {
        if event.flags & EV_ERROR != 0 {
            return Readiness::ERR;
        }

        let eof = event.flags & EV_EOF != 0;
        let mut flags = Readiness::empty();

        match event.filter {
            EVFILT_READ => {
                flags |= Readiness::IN;
                if eof && self.reports_read_hang_up(event.ident as RawFd) {
                    flags |= Readiness::RDHUP;
                }
                // A reset connection only surfaces on the read filter when
                // the write filter is disabled.
                if eof && event.fflags != 0 {
                    flags |= Readiness::HUP;
                }
            }
            EVFILT_WRITE => {
                flags |= Readiness::OUT;
                if eof {
                    flags |= Readiness::HUP;
                }
            }
            _ => {}
        }

        if eof && event.fflags != 0 {
            flags |= Readiness::ERR;
        }

        flags
    }

    fn reports_read_hang_up(&self, fd: RawFd) -> bool {
        self.has_state(fd, StateBit::ReadHangUp)
            .unwrap_or_else(|err| {
                warn!("kqueue: cannot read RDHUP state of fd={fd}: {err}");
                false
            })
    }

    /// Changes installing `watch` on both filters and syncing the state bits.
    fn interest_changes(fd: RawFd, watch: Watch) -> [libc::kevent; 4] {
        let mut mode = 0;
        if watch.events.contains(Readiness::ONESHOT) {
            mode |= EV_DISPATCH;
        }
        if watch.events.contains(Readiness::ET) {
            mode |= EV_CLEAR;
        }

        let toggle = |wanted: bool| {
            if wanted {
                EV_ADD | EV_ENABLE | mode
            } else {
                EV_ADD | EV_DISABLE | mode
            }
        };

        let read = toggle(watch.events.intersects(Readiness::READ_SIDE));
        let write = toggle(watch.events.intersects(Readiness::WRITE_SIDE));
        let read_hang_up = if watch.events.contains(Readiness::RDHUP) {
            EV_ADD | EV_DISABLE
        } else {
            EV_DELETE
        };

        let ident = fd as usize;
        [
            change(ident, EVFILT_READ, read, watch.token),
            change(ident, EVFILT_WRITE, write, watch.token),
            change(state_key(fd, StateBit::Registered), EVFILT_USER, EV_ADD | EV_DISABLE, 0),
            change(state_key(fd, StateBit::ReadHangUp), EVFILT_USER, read_hang_up, 0),
        ]
    }

    /// Changes undoing everything [`interest_changes`](Self::interest_changes) installs.
    fn removal_changes(fd: RawFd) -> [libc::kevent; 4] {
        let ident = fd as usize;
        [
            change(ident, EVFILT_READ, EV_DELETE, 0),
            change(ident, EVFILT_WRITE, EV_DELETE, 0),
            change(state_key(fd, StateBit::Registered), EVFILT_USER, EV_DELETE, 0),
            change(state_key(fd, StateBit::ReadHangUp), EVFILT_USER, EV_DELETE, 0),
        ]
    }

    /// Reads one phantom state bit back from the kernel.
    fn has_state(&self, fd: RawFd, bit: StateBit) -> io::Result<bool> {
        let mut probe = [change(state_key(fd, bit), EVFILT_USER, EV_DISABLE, 0)];
        self.submit(&mut probe)?;

        match probe[0].data as c_int {
            0 => Ok(true),
            ENOENT => Ok(false),
            errno => Err(io::Error::from_raw_os_error(errno)),
        }
    }

    /// Submits receipt-only changes, reporting the first relevant failure.
    fn apply(&self, changes: &mut [libc::kevent]) -> io::Result<()> {
        self.submit(changes)?;

        match changes.iter().find_map(receipt_error) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Submits changes; receipts are written back over `changes`.
    fn submit(&self, changes: &mut [libc::kevent]) -> io::Result<()> {
        let kq = ensure_open(self.kq)?;
        let len = changes.len() as c_int;
        let list = changes.as_mut_ptr();

        cvt(unsafe { kevent(kq, list, len, list, len, ptr::null()) })?;
        Ok(())
    }

    /// Best-effort rollback of a failed registration.
    fn forget(&self, fd: RawFd) {
        let mut changes = Self::removal_changes(fd);
        if let Err(err) = self.apply(&mut changes) {
            warn!("kqueue: rollback of fd={fd} failed: {err}");
        }
    }
}

impl fmt::Debug for KqueuePoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KqueuePoller")
            .field("kq", &self.kq)
            .field("capacity", &self.events.len())
            .finish()
    }
}

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("kqueue: close failed: {err}");
        }
    }
}
