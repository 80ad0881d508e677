// queue error types.

use std::fmt::{self, Debug, Display, Formatter};
use thiserror::Error;


// ==== base error types ====


/// Error for trying to send into a queue for which all receivers have been dropped
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("all receivers of the queue have been dropped")]
pub struct NoReceiversError;

/// Error for attempting an operation with no or limited blocking, and the operation not
/// completing immediately or by the specified deadline
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("operation would block")]
pub struct WouldBlockError;


// ==== message-carrying error types ====


/// Error for trying to send into a queue which has no receivers left
///
/// Carries the message that could not be sent.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SendError<T> {
    /// The message that could not be sent
    pub msg: T,
}

impl<T> SendError<T> {
    /// Take back the message that could not be sent
    pub fn into_inner(self) -> T {
        self.msg
    }
}

impl<T> Debug for SendError<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("SendError").finish_non_exhaustive()
    }
}

impl<T> Display for SendError<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&NoReceiversError, f)
    }
}

impl<T> std::error::Error for SendError<T> {}

/// Error for trying to send into a queue with no or limited blocking
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TrySendError<T> {
    /// All receivers have been dropped
    NoReceivers(T),
    /// The operation could not be resolved immediately or by the specified deadline
    WouldBlock(T),
}

impl<T> TrySendError<T> {
    /// Take back the message that could not be sent
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::NoReceivers(msg) | TrySendError::WouldBlock(msg) => msg,
        }
    }

    /// Whether this error is the [`WouldBlockError`] case
    pub fn is_would_block(&self) -> bool {
        matches!(self, TrySendError::WouldBlock(_))
    }
}

impl<T> From<SendError<T>> for TrySendError<T> {
    fn from(error: SendError<T>) -> Self {
        TrySendError::NoReceivers(error.msg)
    }
}

impl<T> Debug for TrySendError<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            TrySendError::NoReceivers(_) => f.write_str("NoReceivers(..)"),
            TrySendError::WouldBlock(_) => f.write_str("WouldBlock(..)"),
        }
    }
}

impl<T> Display for TrySendError<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            TrySendError::NoReceivers(_) => Display::fmt(&NoReceiversError, f),
            TrySendError::WouldBlock(_) => Display::fmt(&WouldBlockError, f),
        }
    }
}

impl<T> std::error::Error for TrySendError<T> {}
