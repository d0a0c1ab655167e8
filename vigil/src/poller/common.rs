use std::time::{Duration, Instant};

/// Converts an optional timeout into the signed millisecond form taken by
/// [`Poller::wait`](crate::Poller::wait).
///
/// `None` means "block forever" (`-1`). Sub-millisecond remainders round up so a
/// short timeout never turns into a busy poll; huge values saturate.
pub(crate) fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(timeout) => {
            let mut ms = timeout.as_millis();
            if Duration::from_millis(ms.min(u64::MAX as u128) as u64) < timeout {
                ms += 1;
            }
            ms.min(i32::MAX as u128) as i32
        }
    }
}

/// Absolute deadline for a signed millisecond timeout, `None` when negative.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn deadline(timeout_ms: i32) -> Option<Instant> {
    u64::try_from(timeout_ms)
        .ok()
        .and_then(|ms| Instant::now().checked_add(Duration::from_millis(ms)))
}

/// Milliseconds left until `deadline`, rounded up, zero once it has passed.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn remaining_ms(deadline: Instant) -> u32 {
    let left = deadline.saturating_duration_since(Instant::now());
    timeout_ms(Some(left)) as u32
}
