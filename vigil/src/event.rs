//! Readiness flags and watch entries.
//!
//! [`Readiness`] is the bitmask used both to declare interest and to report
//! results. Its values are the Linux `epoll` constants on every platform, so a
//! raw `u32` can be passed through higher layers without a translation table.
//! On Linux the type is bit-identical to the native representation, on macOS
//! the subset shared with `poll(2)` is identical too (checked at compile time
//! below).

use bitflags::bitflags;

bitflags! {
    /// A set of I/O readiness conditions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub struct Readiness: u32 {
        /// Data may be read without blocking.
        const IN = 0x001;
        /// Urgent (out-of-band) data may be read.
        const PRI = 0x002;
        /// Data may be written without blocking.
        const OUT = 0x004;
        /// An error condition happened on the descriptor.
        ///
        /// Always reported, whether requested or not.
        const ERR = 0x008;
        /// The descriptor was hung up.
        ///
        /// Always reported, whether requested or not.
        const HUP = 0x010;
        /// Normal data may be read.
        const RDNORM = 0x040;
        /// Priority band data may be read.
        const RDBAND = 0x080;
        /// Normal data may be written.
        const WRNORM = 0x100;
        /// Priority band data may be written.
        const WRBAND = 0x200;
        /// Message boundary (unused by every backend, kept for ABI parity).
        const MSG = 0x400;
        /// The peer shut down its writing half of the connection.
        const RDHUP = 0x2000;
        /// Disarm the watch after the first reported event.
        const ONESHOT = 1 << 30;
        /// Report only transitions into the ready state.
        const ET = 1 << 31;
    }
}

impl Readiness {
    /// Conditions that make a descriptor interesting for reading.
    #[cfg_attr(not(target_os = "macos"), allow(dead_code))]
    pub(crate) const READ_SIDE: Readiness = Readiness::IN
        .union(Readiness::PRI)
        .union(Readiness::RDNORM)
        .union(Readiness::RDBAND)
        .union(Readiness::RDHUP);

    /// Conditions that make a descriptor interesting for writing.
    #[cfg_attr(target_os = "linux", allow(dead_code))]
    pub(crate) const WRITE_SIDE: Readiness = Readiness::OUT
        .union(Readiness::WRNORM)
        .union(Readiness::WRBAND);

    /// Bits that change how a watch is armed rather than what it reports.
    #[cfg_attr(not(windows), allow(dead_code))]
    pub(crate) const MODES: Readiness = Readiness::ONESHOT.union(Readiness::ET);
}

#[cfg(target_os = "linux")]
const _: () = {
    assert!(Readiness::IN.bits() == libc::EPOLLIN as u32);
    assert!(Readiness::PRI.bits() == libc::EPOLLPRI as u32);
    assert!(Readiness::OUT.bits() == libc::EPOLLOUT as u32);
    assert!(Readiness::ERR.bits() == libc::EPOLLERR as u32);
    assert!(Readiness::HUP.bits() == libc::EPOLLHUP as u32);
    assert!(Readiness::RDNORM.bits() == libc::EPOLLRDNORM as u32);
    assert!(Readiness::RDBAND.bits() == libc::EPOLLRDBAND as u32);
    assert!(Readiness::WRNORM.bits() == libc::EPOLLWRNORM as u32);
    assert!(Readiness::WRBAND.bits() == libc::EPOLLWRBAND as u32);
    assert!(Readiness::MSG.bits() == libc::EPOLLMSG as u32);
    assert!(Readiness::RDHUP.bits() == libc::EPOLLRDHUP as u32);
    assert!(Readiness::ONESHOT.bits() == libc::EPOLLONESHOT as u32);
    assert!(Readiness::ET.bits() == libc::EPOLLET as u32);
};

#[cfg(target_os = "macos")]
const _: () = {
    assert!(Readiness::IN.bits() == libc::POLLIN as u32);
    assert!(Readiness::PRI.bits() == libc::POLLPRI as u32);
    assert!(Readiness::OUT.bits() == libc::POLLOUT as u32);
    assert!(Readiness::ERR.bits() == libc::POLLERR as u32);
    assert!(Readiness::HUP.bits() == libc::POLLHUP as u32);
    assert!(Readiness::RDNORM.bits() == libc::POLLRDNORM as u32);
    assert!(Readiness::RDBAND.bits() == libc::POLLRDBAND as u32);
};

/// An interest declaration or a readiness report.
///
/// The `token` is chosen by the caller when registering a descriptor and is
/// echoed back unchanged in every report for that descriptor. The poller never
/// interprets it, so it may hold an index, a descriptor or a pointer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Watch {
    /// Requested or reported conditions.
    pub events: Readiness,

    /// Caller-defined identifier.
    pub token: u64,
}

impl Watch {
    /// Creates a watch entry.
    pub const fn new(events: Readiness, token: u64) -> Self {
        Self { events, token }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: [Readiness; 6] = [
        Readiness::empty(),
        Readiness::IN,
        Readiness::OUT.union(Readiness::ONESHOT),
        Readiness::RDHUP.union(Readiness::ET),
        Readiness::ERR.union(Readiness::HUP).union(Readiness::MSG),
        Readiness::all(),
    ];

    #[test]
    fn union_contains_both_operands() {
        for a in SAMPLES {
            for b in SAMPLES {
                assert!((a | b).contains(a));
                assert!((a | b).contains(b));
            }
        }
    }

    #[test]
    fn double_complement_is_identity() {
        for a in SAMPLES {
            assert_eq!(!!a, a);
        }
    }

    #[test]
    fn in_place_operators_match_binary_ones() {
        let mut flags = Readiness::IN;
        flags |= Readiness::OUT;
        assert_eq!(flags, Readiness::IN | Readiness::OUT);

        flags &= Readiness::OUT | Readiness::ERR;
        assert_eq!(flags, Readiness::OUT);

        flags ^= Readiness::OUT | Readiness::HUP;
        assert_eq!(flags, Readiness::HUP);
    }

    #[test]
    fn values_match_epoll_abi() {
        assert_eq!(Readiness::IN.bits(), 0x001);
        assert_eq!(Readiness::RDHUP.bits(), 0x2000);
        assert_eq!(Readiness::ONESHOT.bits(), 0x4000_0000);
        assert_eq!(Readiness::ET.bits(), 0x8000_0000);
    }

    #[test]
    fn unknown_bits_survive_retain() {
        let raw = Readiness::IN.bits() | 0x1000_0000;
        assert_eq!(Readiness::from_bits_retain(raw).bits(), raw);
    }

    #[test]
    fn sides_do_not_overlap() {
        assert!(Readiness::READ_SIDE.intersection(Readiness::WRITE_SIDE).is_empty());
        assert!(!Readiness::READ_SIDE.intersects(Readiness::MODES));
    }
}
