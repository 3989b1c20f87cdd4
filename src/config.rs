//! Wait policy shared by every blocking call on a queue.

use core::time::Duration;

use crate::sync::yield_now;

/// How long `push`/`pop` wait by default before giving up.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);

/// Wait policy of a [`Queue`](crate::Queue).
///
/// While the buffer is full (on push) or empty (on pop) the calling thread
/// busy-spins for `spin_limit` iterations, then yields its time slice on
/// every further iteration until `timeout` has elapsed since the call began.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Wall-clock budget of one blocking call, measured from its entry.
    pub timeout: Duration,
    /// Busy-spin iterations before falling back to `yield_now`.
    pub spin_limit: u32,
}

impl Config {
    /// 200ms timeout, yield on every wait iteration.
    pub const fn new() -> Self {
        Config { timeout: DEFAULT_TIMEOUT, spin_limit: 0 }
    }

    /// Replace the per-call timeout.
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the number of busy-spin iterations before yielding.
    pub const fn with_spin_limit(mut self, spin_limit: u32) -> Self {
        self.spin_limit = spin_limit;
        self
    }

    /// One wait iteration: spin a bit, then yield.
    #[inline(always)]
    pub(crate) fn backoff(&self, mut spin: u32) -> u32 {
        if spin < self.spin_limit {
            spin += 1;
            core::hint::spin_loop();
        } else {
            yield_now();
        }
        spin
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
