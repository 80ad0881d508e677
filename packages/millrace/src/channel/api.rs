// exposed API of the bounded queue

use self::future::*;
use super::{
    claim::ClaimRef,
    error::*,
    core,
};
use std::fmt::{self, Debug, Formatter};


// ==== the exposed API ====


/// Create a bounded queue
///
/// The queue buffers up to `capacity` messages. Once full, sending blocks until a receiver makes
/// room. A `capacity` of 0 creates a rendezvous queue, see [`rendezvous`].
pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let channel_1 = core::Channel::new(capacity);
    let channel_2 = channel_1.clone();
    (Sender(channel_1), Receiver(channel_2))
}

/// Create a rendezvous queue
///
/// A rendezvous queue has no buffer: a send only completes once a receiver has taken the message,
/// so the sender and receiver synchronize on every message.
pub fn rendezvous<T>() -> (Sender<T>, Receiver<T>) {
    bounded(0)
}


/// Sender handle to a bounded queue
///
/// Sender handles can be cloned to create multiple producers. When the last sender handle is
/// dropped, the queue is closed as if by [`close`](Self::close), unless it was already closed.
pub struct Sender<T>(core::Channel<T>);

impl<T> Sender<T> {
    /// Create a future to send a message into this queue
    ///
    /// The returned [`SendFut`] can be awaited, or driven from a plain thread with its `block*`
    /// and `try_now` methods.
    ///
    /// Sending into a closed queue is a usage error and panics when the future is first polled.
    pub fn send(&self, msg: T) -> SendFut<T> {
        SendFut {
            op: self.0.send(msg, None),
            _sender: self.clone(),
        }
    }

    // send as an arm of a select.
    pub(crate) fn send_claimed(&self, msg: T, claim: ClaimRef) -> SendFut<T> {
        SendFut {
            op: self.0.send(msg, Some(claim)),
            _sender: self.clone(),
        }
    }

    /// Try to send a message without blocking
    ///
    /// For a rendezvous queue, this only succeeds if a receiver is already waiting.
    pub fn try_send(&self, msg: T) -> Result<(), TrySendError<T>> {
        self.send(msg).try_now()
    }

    /// Close the queue
    ///
    /// Messages already buffered can still be received. Once they are drained, every receive
    /// operation on every receiver resolves to `None`.
    ///
    /// Only the producing side may close a queue, and only once. Closing an already closed queue
    /// is a usage error and panics, as does any later attempt to send.
    #[track_caller]
    pub fn close(&self) {
        let mut lock = self.0.lock();
        if lock.is_closed() {
            drop(lock);
            panic!("close of closed queue");
        }
        lock.close();
    }

    /// Whether the queue has been closed
    pub fn is_closed(&self) -> bool {
        self.0.lock().is_closed()
    }

    /// Whether every receiver handle has been dropped, so that sending would fail
    pub fn has_no_receivers(&self) -> bool {
        self.0.receiver_count() == 0
    }

    /// Number of currently buffered messages
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Whether no messages are currently buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of buffered messages
    pub fn capacity(&self) -> usize {
        self.0.lock().capacity()
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.0.inc_senders();
        Sender(self.0.clone())
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.0.dec_senders();
    }
}

impl<T> Debug for Sender<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let lock = self.0.lock();
        f.debug_struct("Sender")
            .field("len", &lock.len())
            .field("capacity", &lock.capacity())
            .field("closed", &lock.is_closed())
            .finish()
    }
}


/// Receiver handle to a bounded queue
///
/// Receiver handles can be cloned to create multiple consumers, each message being received by
/// exactly one of them. When the last receiver handle is dropped, sending fails with
/// [`SendError`].
pub struct Receiver<T>(core::Channel<T>);

impl<T> Receiver<T> {
    /// Create a future to receive a message from this queue
    ///
    /// Resolves to `None` once the queue is closed and all buffered messages have been received.
    /// Like [`send`](Sender::send), the returned [`RecvFut`] also has blocking methods.
    pub fn recv(&self) -> RecvFut<T> {
        RecvFut {
            op: self.0.recv(None),
            _receiver: self.clone(),
        }
    }

    // receive as an arm of a select.
    pub(crate) fn recv_claimed(&self, claim: ClaimRef) -> RecvFut<T> {
        RecvFut {
            op: self.0.recv(Some(claim)),
            _receiver: self.clone(),
        }
    }

    /// Try to receive a message without blocking
    ///
    /// Returns `Ok(None)` if the queue is closed and drained, and [`WouldBlockError`] if it is
    /// open but has nothing to receive right now.
    pub fn try_recv(&self) -> Result<Option<T>, WouldBlockError> {
        self.recv().try_now()
    }

    /// Blocking iterator over received messages, ending once the queue is closed and drained
    pub fn iter(&self) -> Iter<'_, T> {
        Iter(self)
    }

    /// Whether the queue has been closed
    ///
    /// A closed queue may still have buffered messages left to receive.
    pub fn is_closed(&self) -> bool {
        self.0.lock().is_closed()
    }

    /// Number of currently buffered messages
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Whether no messages are currently buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of buffered messages
    pub fn capacity(&self) -> usize {
        self.0.lock().capacity()
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.0.inc_receivers();
        Receiver(self.0.clone())
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.0.dec_receivers();
    }
}

impl<T> Debug for Receiver<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let lock = self.0.lock();
        f.debug_struct("Receiver")
            .field("len", &lock.len())
            .field("capacity", &lock.capacity())
            .field("closed", &lock.is_closed())
            .finish()
    }
}

impl<'a, T> IntoIterator for &'a Receiver<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}


// future types for queues.
pub(crate) mod future {
    use super::*;
    use crate::channel::polling::{Timeout, Abandon, poll};
    use std::{
        task::{Poll, Context},
        future::Future,
        pin::Pin,
        time::{Duration, Instant},
    };

    /// Pending send into a queue, see [`Sender::send`]
    ///
    /// Until it resolves, the send can be called off with [`rescind`](Self::rescind), which hands
    /// the message back unless a receiver already took it. Dropping it calls the send off too.
    ///
    /// While it exists it keeps the queue open, the same as a [`Sender`] would.
    pub struct SendFut<T> {
        // dropped before `_sender`, so the operation leaves the queue before the queue can close.
        pub(super) op: core::SendOp<T>,
        pub(super) _sender: Sender<T>,
    }

    impl<T> Abandon for core::SendOp<T> {
        type Abandoned = Option<T>;

        fn abandon(&mut self) -> Option<T> {
            core::SendOp::abandon(self)
        }
    }

    fn map_send_result<T>(result: Result<(), T>) -> Result<(), SendError<T>> {
        result.map_err(|msg| SendError { msg })
    }

    fn map_try_send_result<T>(
        result: Result<Result<(), T>, Option<T>>,
    ) -> Result<(), TrySendError<T>> {
        match result {
            Ok(send_result) => map_send_result(send_result).map_err(TrySendError::from),
            Err(Some(msg)) => Err(TrySendError::WouldBlock(msg)),
            // abandoned after a receiver had already taken it
            Err(None) => Ok(()),
        }
    }

    impl<T> Future for SendFut<T> {
        type Output = Result<(), SendError<T>>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
            let this = self.get_mut();
            // for implementation of FusedFuture
            if this.is_terminated() {
                return Poll::Pending;
            }
            this.op.poll_send(cx).map(map_send_result)
        }
    }

    impl<T> SendFut<T> {
        /// If the message has not yet been sent, abort the send operation and rescind the message
        ///
        /// Returns `None` if this future already resolved, or if a receiver already took the
        /// message.
        pub fn rescind(&mut self) -> Option<T> {
            self.op.abandon()
        }

        /// Send now if that is possible without waiting, otherwise rescind
        ///
        /// Panics if already resolved or rescinded.
        pub fn try_now(&mut self) -> Result<(), TrySendError<T>> {
            assert!(!self.is_terminated(), "SendFut.try_now called after terminated");
            map_try_send_result(poll(&mut self.op, Timeout::NonBlocking))
        }

        /// Block the calling thread until the message is sent or every receiver is gone
        ///
        /// Panics if already resolved or rescinded.
        pub fn block(&mut self) -> Result<(), SendError<T>> {
            assert!(!self.is_terminated(), "SendFut.block called after terminated");
            let result = poll(&mut self.op, Timeout::Never)
                .ok().expect("poll timed out with Timeout::Never");
            map_send_result(result)
        }

        /// Like [`block`](Self::block), but rescinds the message once `timeout` elapses
        pub fn block_timeout(&mut self, timeout: Duration) -> Result<(), TrySendError<T>> {
            assert!(!self.is_terminated(), "SendFut.block_timeout called after terminated");
            map_try_send_result(poll(&mut self.op, Timeout::after(timeout)))
        }

        /// Like [`block`](Self::block), but rescinds the message at `deadline`
        ///
        /// The rescinded message comes back in [`TrySendError::WouldBlock`].
        pub fn block_deadline(&mut self, deadline: Instant) -> Result<(), TrySendError<T>> {
            assert!(!self.is_terminated(), "SendFut.block_deadline called after terminated");
            map_try_send_result(poll(&mut self.op, Timeout::At(deadline)))
        }

        /// Whether this future has already resolved or rescinded
        pub fn is_terminated(&self) -> bool {
            self.op.is_terminated()
        }
    }

    #[cfg(feature = "futures")]
    impl<T> futures::future::FusedFuture for SendFut<T> {
        fn is_terminated(&self) -> bool {
            Self::is_terminated(self)
        }
    }


    /// Pending receive from a queue, see [`Receiver::recv`]
    ///
    /// Resolves to `None` once the queue is closed and drained.
    ///
    /// A sender may hand a message straight to a pending receive, at which point the send has
    /// completed. Calling the receive off never loses such a message: [`abort`](Self::abort) and
    /// the timeouts of the blocking methods return it as received, and dropping the future
    /// without polling it again puts the message back at the front of the queue.
    pub struct RecvFut<T> {
        pub(super) op: core::RecvOp<T>,
        pub(super) _receiver: Receiver<T>,
    }

    impl<T> Abandon for core::RecvOp<T> {
        type Abandoned = Option<T>;

        fn abandon(&mut self) -> Self::Abandoned {
            core::RecvOp::abandon(self)
        }
    }

    impl<T> Future for RecvFut<T> {
        type Output = Option<T>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
            let this = self.get_mut();
            // for implementation of FusedFuture
            if this.is_terminated() {
                return Poll::Pending;
            }
            this.op.poll_recv(cx)
        }
    }

    // a message handed over right as the wait gave up was still received.
    fn map_recv_abandoned<T>(handed: Option<T>) -> Result<Option<T>, WouldBlockError> {
        match handed {
            Some(msg) => Ok(Some(msg)),
            None => Err(WouldBlockError),
        }
    }

    impl<T> RecvFut<T> {
        /// Call off the receive, if it has not resolved yet. Never panics.
        ///
        /// Returns the message if a sender had already handed one to this receive.
        pub fn abort(&mut self) -> Option<T> {
            self.op.abandon()
        }

        /// Block the calling thread until a message arrives or the queue is closed and drained
        ///
        /// Panics if already resolved or aborted.
        pub fn block(&mut self) -> Option<T> {
            assert!(!self.is_terminated(), "RecvFut.block called after terminated");
            poll(&mut self.op, Timeout::Never)
                .ok().expect("poll timed out with Timeout::Never")
        }

        /// Receive now if that is possible without waiting, otherwise abort with
        /// [`WouldBlockError`]
        pub fn try_now(&mut self) -> Result<Option<T>, WouldBlockError> {
            assert!(!self.is_terminated(), "RecvFut.try_now called after terminated");
            poll(&mut self.op, Timeout::NonBlocking).or_else(map_recv_abandoned)
        }

        /// Like [`block`](Self::block), but aborts once `timeout` elapses
        pub fn block_timeout(&mut self, timeout: Duration) -> Result<Option<T>, WouldBlockError> {
            assert!(!self.is_terminated(), "RecvFut.block_timeout called after terminated");
            poll(&mut self.op, Timeout::after(timeout)).or_else(map_recv_abandoned)
        }

        /// Like [`block`](Self::block), but aborts at `deadline`
        pub fn block_deadline(&mut self, deadline: Instant) -> Result<Option<T>, WouldBlockError> {
            assert!(!self.is_terminated(), "RecvFut.block_deadline called after terminated");
            poll(&mut self.op, Timeout::At(deadline)).or_else(map_recv_abandoned)
        }

        /// Whether this future has already resolved or aborted
        pub fn is_terminated(&self) -> bool {
            self.op.is_terminated()
        }
    }

    impl<T> Abandon for RecvFut<T> {
        type Abandoned = Option<T>;

        fn abandon(&mut self) -> Self::Abandoned {
            self.abort()
        }
    }

    #[cfg(feature = "futures")]
    impl<T> futures::future::FusedFuture for RecvFut<T> {
        fn is_terminated(&self) -> bool {
            Self::is_terminated(self)
        }
    }


    /// Blocking iterator over a [`Receiver`], see [`Receiver::iter`]
    pub struct Iter<'a, T>(pub(super) &'a Receiver<T>);

    impl<'a, T> Iterator for Iter<'a, T> {
        type Item = T;

        fn next(&mut self) -> Option<T> {
            self.0.recv().block()
        }
    }
}


// ==== tests ====
