//! Definition of errors.

use std::error;
use std::fmt;

/// Fatal conditions of the engine. Contention and emptiness are never errors.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Error {
    /// The lease is already active on the current thread
    Busy,
    /// Every record of the thread table is leased
    ThreadNumOverflow,
    /// The node arena reached its configured capacity
    ArenaExhausted,
    /// Invalid parameter
    InvalidParam,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl error::Error for Error {}

/// Returned by `try_push`/`try_enqueue`; hands the rejected value back.
pub struct PushError<T> {
    value: T,
    kind: Error,
}

impl<T> PushError<T> {
    pub(crate) fn new(value: T, kind: Error) -> Self {
        PushError { value, kind }
    }

    pub fn kind(&self) -> Error {
        self.kind
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PushError")
            .field("kind", &self.kind)
            .finish()
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "push rejected: {}", self.kind)
    }
}

impl<T> error::Error for PushError<T> {}
