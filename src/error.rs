//! Failure values returned by the queue. None of them are faults: a timeout
//! is backpressure the caller decides how to handle.

use core::fmt;

use thiserror::Error;

/// `push` gave up because the buffer stayed full until the deadline.
///
/// The rejected value is handed back untouched.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PushTimeout<T>(pub T);

impl<T> PushTimeout<T> {
    /// Recover the value that could not be pushed.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for PushTimeout<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PushTimeout(..)")
    }
}

impl<T> fmt::Display for PushTimeout<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "push timed out: queue stayed full")
    }
}

impl<T> std::error::Error for PushTimeout<T> {}

/// `pop` gave up because the buffer stayed empty until the deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("pop timed out: queue stayed empty")]
pub struct PopTimeout;

/// `try_push` found the buffer full.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Full<T>(pub T);

impl<T> Full<T> {
    /// Recover the value that could not be pushed.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Full(..)")
    }
}

impl<T> fmt::Display for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue is full")
    }
}

impl<T> std::error::Error for Full<T> {}

/// `try_pop` found the buffer empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("queue is empty")]
pub struct Empty;

/// Rejected capacity parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CapacityError {
    /// `CAP == 0`.
    #[error("capacity must be greater than 0")]
    Zero,
    /// `CAP` cannot be masked into an index.
    #[error("capacity must be a power of 2, got {0}")]
    NotPowerOfTwo(usize),
}
