//! Windows poll set.
//!
//! Registration only records interest and queues the socket; the AFD
//! requests themselves are (re)issued in batches at the start of every
//! [`IocpPoller::wait`] iteration, so several changes to one socket between
//! two waits cost a single request.

use super::afd::{self, Afd, PollState};
use super::sock::{Destroy, Fed, SockState, Update};
use super::{already_exists, invalid_handle, invalid_parameter, not_found};
use crate::event::Watch;
use crate::poller::common;
use crate::utils::Slab;

use std::collections::{HashMap, VecDeque};
use std::os::windows::io::RawSocket;
use std::time::Instant;
use std::{fmt, io, mem};

use log::{debug, trace, warn};
use windows_sys::Win32::System::IO::OVERLAPPED_ENTRY;
use windows_sys::Win32::System::Threading::INFINITE;

pub(crate) struct IocpPoller {
    afd: Afd,
    /// Registered sockets, by the handle the caller gave.
    sockets: HashMap<RawSocket, usize>,
    /// Socket states, including deleted ones awaiting their completion.
    states: Slab<SockState>,
    /// Sockets whose request must be brought up to date.
    updates: VecDeque<usize>,
    completions: Vec<OVERLAPPED_ENTRY>,
}

unsafe impl Send for IocpPoller {}

impl IocpPoller {
    pub(crate) fn new(capacity: usize) -> io::Result<Self> {
        let afd = Afd::new()?;
        let completions = (0..capacity)
            .map(|_| unsafe { mem::zeroed::<OVERLAPPED_ENTRY>() })
            .collect();

        Ok(Self {
            afd,
            sockets: HashMap::new(),
            states: Slab::new(capacity),
            updates: VecDeque::new(),
            completions,
        })
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.afd.is_closed() {
            Err(invalid_handle())
        } else {
            Ok(())
        }
    }

    pub(crate) fn add(&mut self, socket: RawSocket, watch: Watch) -> io::Result<()> {
        self.ensure_open()?;

        if self.sockets.contains_key(&socket) {
            return Err(already_exists());
        }

        let base = afd::base_socket(socket)?;
        let key = self.states.vacant_key();
        let key = self.states.insert(SockState::new(socket, base, key, watch));
        self.sockets.insert(socket, key);
        self.enqueue(key);

        debug!("iocp: add socket={socket} base={base} key={key} events={:?}", watch.events);
        Ok(())
    }

    pub(crate) fn modify(&mut self, socket: RawSocket, watch: Watch) -> io::Result<()> {
        self.ensure_open()?;

        let key = *self.sockets.get(&socket).ok_or_else(not_found)?;
        if let Some(state) = self.states.get_mut(key) {
            state.set_watch(watch);
        }
        self.enqueue(key);

        trace!("iocp: modify socket={socket} events={:?}", watch.events);
        Ok(())
    }

    pub(crate) fn delete(&mut self, socket: RawSocket) -> io::Result<()> {
        self.ensure_open()?;

        let key = self.sockets.remove(&socket).ok_or_else(not_found)?;
        self.release(key);

        debug!("iocp: delete socket={socket}");
        Ok(())
    }

    pub(crate) fn wait(&mut self, out: &mut [Watch], timeout_ms: i32) -> io::Result<usize> {
        self.ensure_open()?;

        if out.is_empty() {
            return Err(invalid_parameter());
        }

        let deadline = common::deadline(timeout_ms);

        loop {
            self.flush_updates()?;

            let timeout = match deadline {
                Some(deadline) => common::remaining_ms(deadline),
                None => INFINITE,
            };

            let batch = out.len().min(self.completions.len());
            let count = self.afd.wait(&mut self.completions[..batch], timeout)?;
            debug_assert!(count <= batch);

            let mut filled = 0;
            for index in 0..count {
                let overlapped = self.completions[index].lpOverlapped;
                let key = unsafe { PollState::key_of(overlapped) };

                if let Some(watch) = self.feed(key) {
                    out[filled] = watch;
                    filled += 1;
                }
            }

            trace!("iocp: {count} completions, {filled} events");

            if filled > 0 {
                return Ok(filled);
            }
            if timeout_ms == 0 || deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(0);
            }
        }
    }

    /// Closes the driver handles and forgets every socket. Idempotent.
    pub(crate) fn close(&mut self) -> io::Result<()> {
        if self.afd.is_closed() {
            return Ok(());
        }

        let result = self.afd.close();

        self.sockets.clear();
        self.updates.clear();
        self.states = Slab::new(0);

        debug!("iocp: closed");
        result
    }

    /// Queues `key` for an update unless it is already queued.
    fn enqueue(&mut self, key: usize) {
        if let Some(state) = self.states.get_mut(key) {
            if !state.queued {
                state.queued = true;
                self.updates.push_back(key);
            }
        }
    }

    /// Issues or cancels requests for every queued socket.
    ///
    /// Stops at the first failure, leaving the failed socket at the head of
    /// the queue so the next wait retries it.
    fn flush_updates(&mut self) -> io::Result<()> {
        while let Some(key) = self.updates.pop_front() {
            let Some(state) = self.states.get_mut(key) else {
                continue;
            };

            match state.update(&self.afd) {
                Ok(Update::Armed) => state.queued = false,
                Ok(Update::Closed) => {
                    state.queued = false;
                    let socket = state.socket();
                    self.forget(socket, key);
                }
                Err(err) => {
                    self.updates.push_front(key);
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// Turns the completion of `key`'s request into a report, if any.
    fn feed(&mut self, key: usize) -> Option<Watch> {
        let state = self.states.get_mut(key)?;

        match state.feed() {
            Fed::Release => {
                self.states.remove(key);
                None
            }
            Fed::Closed => {
                let socket = state.socket();
                self.forget(socket, key);
                None
            }
            Fed::Quiet => {
                self.enqueue(key);
                None
            }
            Fed::Ready(watch) => {
                self.enqueue(key);
                Some(watch)
            }
        }
    }

    /// Drops a socket that was closed without being deleted first.
    fn forget(&mut self, socket: RawSocket, key: usize) {
        debug!("iocp: socket={socket} was closed, dropping it");

        if self.sockets.get(&socket) == Some(&key) {
            self.sockets.remove(&socket);
        }
        self.release(key);
    }

    /// Unqueues `key` and frees its state now or once its request completes.
    fn release(&mut self, key: usize) {
        self.updates.retain(|&queued| queued != key);

        let Some(state) = self.states.get_mut(key) else {
            return;
        };
        state.queued = false;

        match state.destroy(&self.afd) {
            Destroy::Release => {
                self.states.remove(key);
            }
            Destroy::Deferred | Destroy::AlreadyPending => {}
        }
    }
}

impl fmt::Debug for IocpPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IocpPoller")
            .field("afd", &self.afd)
            .field("registered", &self.sockets.len())
            .field("states", &self.states.len())
            .field("queued", &self.updates.len())
            .finish()
    }
}

impl Drop for IocpPoller {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("iocp: failed to close poller: {err}");
        }
    }
}
