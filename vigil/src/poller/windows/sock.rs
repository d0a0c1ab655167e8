//! Per-socket poll request state.
//!
//! Each registered socket owns at most one AFD poll request at a time. The
//! request outlives unregistration when it is still in flight: the driver
//! writes into its block until the completion is dequeued, so a deleted
//! socket stays allocated (`delete_pending`) until then.

use super::afd::{self, Afd, PollOutcome, PollState};
use crate::event::{Readiness, Watch};

use std::io;
use std::os::windows::io::RawSocket;

use log::{trace, warn};
use windows_sys::Win32::Foundation::ERROR_INVALID_HANDLE;

/// Conditions reported whether requested or not.
const ALWAYS: Readiness = Readiness::ERR.union(Readiness::HUP);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollStatus {
    /// No request in flight.
    Idle,
    /// A request for `events` is in flight.
    Pending { events: Readiness },
    /// The in-flight request was cancelled; its completion is still due.
    Cancelled,
}

/// Outcome of [`SockState::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Update {
    /// The socket is armed for its current interest.
    Armed,
    /// The socket handle is gone; the socket must be dropped from the set.
    Closed,
}

/// Outcome of [`SockState::feed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fed {
    /// The socket was deleted while its request was in flight; free it.
    Release,
    /// The socket was closed behind the poller's back.
    Closed,
    /// Nothing to report for this completion.
    Quiet,
    Ready(Watch),
}

/// Outcome of [`SockState::destroy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Destroy {
    /// No request in flight; free the state now.
    Release,
    /// Free the state once its completion is dequeued.
    Deferred,
    /// A previous call already deferred the release.
    AlreadyPending,
}

pub(crate) struct SockState {
    socket: RawSocket,
    poll: PollState,
    status: PollStatus,
    user_events: Readiness,
    token: u64,
    delete_pending: bool,
    /// Set while the socket sits in the update queue.
    pub(crate) queued: bool,
}

impl SockState {
    pub(crate) fn new(socket: RawSocket, base_socket: RawSocket, key: usize, watch: Watch) -> Self {
        let mut state = Self {
            socket,
            poll: PollState::new(base_socket, key),
            status: PollStatus::Idle,
            user_events: Readiness::empty(),
            token: 0,
            delete_pending: false,
            queued: false,
        };
        state.set_watch(watch);
        state
    }

    /// The socket as registered by the caller.
    pub(crate) fn socket(&self) -> RawSocket {
        self.socket
    }

    /// Pretends a request for nothing is in flight.
    #[cfg(test)]
    pub(crate) fn assume_pending(&mut self) {
        self.poll.mark_pending();
        self.status = PollStatus::Pending {
            events: Readiness::empty(),
        };
    }

    /// Replaces the interest and token. Takes effect on the next update.
    pub(crate) fn set_watch(&mut self, watch: Watch) {
        self.user_events = watch.events | ALWAYS;
        self.token = watch.token;
    }

    /// Brings the in-flight request in line with the current interest.
    ///
    /// An idle socket gets a new request. A pending request that already
    /// covers every wanted condition is left alone (surplus results are
    /// filtered when fed); otherwise it is cancelled and re-issued after its
    /// completion comes back.
    pub(crate) fn update(&mut self, afd: &Afd) -> io::Result<Update> {
        match self.status {
            PollStatus::Idle => {
                let events = self.user_events;
                match afd.poll(&self.poll, afd::readiness_to_afd(events)) {
                    Ok(()) => {
                        self.status = PollStatus::Pending { events };
                        Ok(Update::Armed)
                    }
                    Err(err) if err.raw_os_error() == Some(ERROR_INVALID_HANDLE as i32) => {
                        trace!("sock: socket={} is gone", self.socket);
                        Ok(Update::Closed)
                    }
                    Err(err) => Err(err),
                }
            }
            PollStatus::Pending { events } => {
                let missing = self.user_events - Readiness::MODES - events;
                if !missing.is_empty() {
                    afd.cancel(&self.poll)?;
                    self.status = PollStatus::Cancelled;
                }
                Ok(Update::Armed)
            }
            PollStatus::Cancelled => Ok(Update::Armed),
        }
    }

    /// Consumes the completion of this socket's request.
    pub(crate) fn feed(&mut self) -> Fed {
        self.status = PollStatus::Idle;

        if self.delete_pending {
            return Fed::Release;
        }

        let events = match self.poll.outcome() {
            PollOutcome::Cancelled | PollOutcome::Nothing => return Fed::Quiet,
            PollOutcome::Closed => return Fed::Closed,
            PollOutcome::Failed => Readiness::ERR,
            PollOutcome::Ready(events) => events,
        };

        let events = events & (self.user_events - Readiness::MODES);
        if events.is_empty() {
            return Fed::Quiet;
        }

        if self.user_events.contains(Readiness::ONESHOT) {
            self.user_events = Readiness::empty();
        }

        Fed::Ready(Watch::new(events, self.token))
    }

    /// Marks the socket as deleted, cancelling any request in flight.
    pub(crate) fn destroy(&mut self, afd: &Afd) -> Destroy {
        if self.delete_pending {
            return Destroy::AlreadyPending;
        }

        if let PollStatus::Pending { .. } = self.status {
            if let Err(err) = afd.cancel(&self.poll) {
                warn!("sock: failed to cancel request of socket={}: {err}", self.socket);
            }
            self.status = PollStatus::Cancelled;
        }

        self.delete_pending = true;

        if self.status == PollStatus::Idle {
            Destroy::Release
        } else {
            Destroy::Deferred
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(events: Readiness) -> SockState {
        SockState::new(0, 0, 0, Watch::new(events, 9))
    }

    #[test]
    fn errors_and_hangups_are_always_wanted() {
        let state = state(Readiness::IN);
        assert_eq!(state.user_events, Readiness::IN | Readiness::ERR | Readiness::HUP);
    }

    #[test]
    fn idle_state_is_released_at_once() {
        let afd = Afd::new().unwrap();
        let mut state = state(Readiness::IN);

        assert_eq!(state.destroy(&afd), Destroy::Release);
        assert_eq!(state.destroy(&afd), Destroy::AlreadyPending);
    }

    #[test]
    fn cancelled_state_waits_for_its_completion() {
        let afd = Afd::new().unwrap();
        let mut state = state(Readiness::IN);
        state.status = PollStatus::Cancelled;

        assert_eq!(state.destroy(&afd), Destroy::Deferred);
        assert_eq!(state.feed(), Fed::Release);
    }

    #[test]
    fn pending_request_covering_interest_is_kept() {
        let afd = Afd::new().unwrap();
        let mut state = state(Readiness::IN);
        state.status = PollStatus::Pending {
            events: Readiness::IN | Readiness::OUT | Readiness::ERR | Readiness::HUP,
        };

        assert_eq!(state.update(&afd).unwrap(), Update::Armed);
        assert!(matches!(state.status, PollStatus::Pending { .. }));
    }

    #[test]
    fn empty_completion_reports_nothing() {
        let mut state = state(Readiness::IN | Readiness::ONESHOT);
        state.status = PollStatus::Pending {
            events: state.user_events,
        };

        assert_eq!(state.feed(), Fed::Quiet);
        assert_eq!(state.status, PollStatus::Idle);
        assert!(state.user_events.contains(Readiness::IN));
    }
}
