//! Platform-specific readiness poller.
//!
//! This module provides a unified `epoll`-style interface over the
//! readiness facilities of each supported operating system:
//! - Linux: native `epoll`, forwarded as-is,
//! - macOS: `kqueue`, with per-descriptor state kept in phantom user events,
//! - Windows: the AFD driver's asynchronous poll request and a completion port.
//!
//! The concrete implementation is selected at compile time
//! depending on the target operating system.

pub(crate) mod common;

#[cfg(unix)]
pub(crate) mod unix;

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(target_os = "macos")]
mod kqueue;

#[cfg(windows)]
mod windows;

#[cfg(target_os = "linux")]
type Selector = epoll::EpollPoller;

#[cfg(target_os = "macos")]
type Selector = kqueue::KqueuePoller;

#[cfg(windows)]
type Selector = windows::IocpPoller;

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
compile_error!("vigil supports Linux, macOS and Windows only");

#[cfg(unix)]
pub use unix::RawFd;

#[cfg(windows)]
pub use windows::RawFd;

use crate::builder::PollerBuilder;
use crate::event::Watch;

use std::cell::Cell;
use std::io;
use std::marker::PhantomData;
use std::time::Duration;

/// Number of native entries fetched per system call unless configured.
pub(crate) const DEFAULT_CAPACITY: usize = 64;

/// A set of watched descriptors.
///
/// Registration follows `epoll_ctl` semantics: a descriptor is added once,
/// its interest is changed with [`modify`](Self::modify) and removed with
/// [`delete`](Self::delete). [`wait`](Self::wait) fills a caller-provided
/// slice with one [`Watch`] per ready descriptor, echoing the token given at
/// registration.
///
/// Watches are level-triggered unless [`Readiness::ET`](crate::Readiness::ET)
/// is set; [`Readiness::ONESHOT`](crate::Readiness::ONESHOT) disarms a watch
/// after its first report until it is modified again.
///
/// A poller is meant to be driven by a single owner. It may be moved to
/// another thread but is not shared between threads.
///
/// # Examples
///
/// ```rust,ignore
/// use vigil::{Poller, Readiness, Watch};
///
/// let mut poller = Poller::new()?;
/// poller.add(fd, Watch::new(Readiness::IN, 7))?;
///
/// let mut ready = [Watch::default(); 16];
/// let n = poller.wait(&mut ready, 1000)?;
/// for watch in &ready[..n] {
///     assert_eq!(watch.token, 7);
/// }
/// ```
#[derive(Debug)]
pub struct Poller {
    inner: Selector,
    /// Movable between threads, never shared.
    _single_owner: PhantomData<Cell<()>>,
}

impl Poller {
    /// Creates a poller with the default configuration.
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Returns a builder for a configured poller.
    pub fn builder() -> PollerBuilder {
        PollerBuilder::new()
    }

    pub(crate) fn with_capacity(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            inner: Selector::new(capacity)?,
            _single_owner: PhantomData,
        })
    }

    /// Starts watching `fd`.
    ///
    /// Fails with `AlreadyExists` if `fd` is already registered. On Windows
    /// the call also fails if `fd` is not a socket.
    pub fn add(&mut self, fd: RawFd, watch: Watch) -> io::Result<()> {
        self.inner.add(fd, watch)
    }

    /// Replaces the interest and token of a registered descriptor.
    ///
    /// This is also how a fired one-shot watch is re-armed.
    pub fn modify(&mut self, fd: RawFd, watch: Watch) -> io::Result<()> {
        self.inner.modify(fd, watch)
    }

    /// Stops watching `fd`.
    ///
    /// No report for `fd` is produced after this returns, even if a
    /// platform request was still in flight.
    pub fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        self.inner.delete(fd)
    }

    /// Waits for readiness and fills `events` from the front.
    ///
    /// A negative `timeout_ms` blocks until at least one event is ready,
    /// `0` polls without blocking. Returns the number of filled entries,
    /// `0` meaning the timeout expired.
    pub fn wait(&mut self, events: &mut [Watch], timeout_ms: i32) -> io::Result<usize> {
        self.inner.wait(events, timeout_ms)
    }

    /// Like [`wait`](Self::wait), with an optional [`Duration`].
    ///
    /// Partial milliseconds are rounded up.
    pub fn wait_timeout(
        &mut self,
        events: &mut [Watch],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        self.wait(events, common::timeout_ms(timeout))
    }

    /// Releases the operating system resources of the poller.
    ///
    /// Registered descriptors are forgotten, not closed. Closing twice is a
    /// no-op; every other operation fails afterwards.
    pub fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}
