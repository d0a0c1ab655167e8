use crate::poller::{DEFAULT_CAPACITY, Poller};

use std::io;

/// Builder for configuring and creating a [`Poller`].
///
/// The only tunable is the size of the internal batch buffer handed to the
/// operating system on each wait. A single [`Poller::wait`] call retrieves at
/// most `min(out.len(), capacity)` native entries.
///
/// # Examples
///
/// ```rust,ignore
/// let poller = PollerBuilder::new()
///     .capacity(256)
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct PollerBuilder {
    /// Number of native entries fetched per system call.
    capacity: usize,
}

impl PollerBuilder {
    /// Creates a new `PollerBuilder` with default configuration.
    pub fn new() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Sets the number of native entries fetched per system call.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn capacity(mut self, n: usize) -> Self {
        assert!(n > 0, "capacity must be > 0");

        self.capacity = n;
        self
    }

    /// Creates the poller with the configured options.
    pub fn build(self) -> io::Result<Poller> {
        Poller::with_capacity(self.capacity)
    }
}

impl Default for PollerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_uses_crate_capacity() {
        assert_eq!(PollerBuilder::default().capacity, DEFAULT_CAPACITY);
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn zero_capacity_is_rejected() {
        let _ = PollerBuilder::new().capacity(0);
    }

    #[test]
    fn build_with_small_capacity() {
        let mut poller = PollerBuilder::new().capacity(1).build().unwrap();
        poller.close().unwrap();
    }
}
