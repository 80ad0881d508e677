//! Fan-in counter for waiting on a group of tasks.

use crate::channel::{
    polling::{Abandon, Timeout, poll},
    waiters::{WaiterId, WaiterQueue},
};
use crate::error::WouldBlockError;
use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    pin::Pin,
    sync::{
        atomic::{
            Ordering::{AcqRel, Acquire},
            AtomicUsize,
        },
        Arc,
        Mutex,
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};


/// Counter of outstanding tasks which can be waited on until it reaches zero
///
/// Each task is registered with [`add`](Self::add) or, preferably, [`register`](Self::register),
/// and deregisters when it exits. [`wait`](Self::wait) resolves once the counter is zero.
///
/// Registrations must happen-before the wait they are meant to gate: register a task before
/// spawning it, not from inside it. Decrementing the counter below zero is a usage error and
/// panics.
#[derive(Clone, Default)]
pub struct WaitGroup(Arc<Inner>);

#[derive(Default)]
struct Inner {
    // number of outstanding registrations.
    count: AtomicUsize,
    // pending waits. each one leaves when it resolves or is abandoned.
    waiters: Mutex<WaiterQueue<()>>,
}

impl WaitGroup {
    /// Construct with a count of zero
    pub fn new() -> Self {
        WaitGroup::default()
    }

    /// Register `n` more outstanding tasks
    pub fn add(&self, n: usize) {
        self.0.count.fetch_add(n, AcqRel);
    }

    /// Deregister one outstanding task
    ///
    /// Panics if the count is already zero.
    #[track_caller]
    pub fn done(&self) {
        let prev = self.0.count
            .fetch_update(AcqRel, Acquire, |n| n.checked_sub(1))
            .unwrap_or_else(|_| panic!("wait group counter went negative"));
        if prev == 1 {
            self.0.waiters.lock().unwrap().wake_all();
        }
    }

    /// Register one outstanding task, returning a guard that deregisters it when dropped
    ///
    /// Move the guard into the task. Because deregistration happens in `Drop`, it runs on every
    /// exit path of the task, including unwinding.
    pub fn register(&self) -> WaitGuard {
        self.add(1);
        WaitGuard(self.clone())
    }

    /// Current number of outstanding tasks
    pub fn count(&self) -> usize {
        self.0.count.load(Acquire)
    }

    /// Create a future which resolves once the count is zero
    pub fn wait(&self) -> Wait {
        Wait { group: self.clone(), id: None }
    }

    /// Block until the count is zero
    pub fn wait_all(&self) {
        self.wait().block();
    }

    /// Block until the count is zero or the timeout elapses
    pub fn wait_all_timeout(&self, timeout: Duration) -> Result<(), WouldBlockError> {
        self.wait().block_timeout(timeout)
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.0.waiters.lock().unwrap().len()
    }
}

impl Debug for WaitGroup {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("WaitGroup").field("count", &self.count()).finish()
    }
}


/// Registration in a [`WaitGroup`], deregistered on drop
#[must_use = "dropping the guard immediately deregisters the task"]
#[derive(Debug)]
pub struct WaitGuard(WaitGroup);

impl WaitGuard {
    /// The group this guard is registered in
    pub fn group(&self) -> &WaitGroup {
        &self.0
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.0.done();
    }
}


/// Future which resolves once a [`WaitGroup`]'s count is zero
#[derive(Debug)]
pub struct Wait {
    group: WaitGroup,
    // set while parked in the group's waiters.
    id: Option<WaiterId>,
}

impl Wait {
    // leave the group's waiters, if parked.
    fn leave(&mut self) {
        if let Some(id) = self.id.take() {
            self.group.0.waiters.lock().unwrap().remove(id);
        }
    }
}

impl Future for Wait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        let this = self.get_mut();
        let inner = &this.group.0;
        if inner.count.load(Acquire) == 0 {
            this.leave();
            return Poll::Ready(());
        }
        let mut waiters = inner.waiters.lock().unwrap();
        // re-check under the lock, since done wakes waiters under it
        if inner.count.load(Acquire) == 0 {
            if let Some(id) = this.id.take() {
                waiters.remove(id);
            }
            return Poll::Ready(());
        }
        match this.id.and_then(|id| waiters.get_mut(id)) {
            Some(entry) => entry.set_waker(cx.waker()),
            None => this.id = Some(waiters.push(None, cx.waker())),
        }
        Poll::Pending
    }
}

impl Abandon for Wait {
    type Abandoned = ();

    fn abandon(&mut self) -> Self::Abandoned {
        self.leave();
    }
}

impl Drop for Wait {
    fn drop(&mut self) {
        self.leave();
    }
}

impl Wait {
    /// Block until the count is zero
    pub fn block(&mut self) {
        poll(self, Timeout::Never).ok().expect("poll timed out with Timeout::Never")
    }

    /// Check whether the count is zero without blocking
    pub fn try_now(&mut self) -> Result<(), WouldBlockError> {
        poll(self, Timeout::NonBlocking).map_err(|()| WouldBlockError)
    }

    /// Block until the count is zero or the timeout elapses
    pub fn block_timeout(&mut self, timeout: Duration) -> Result<(), WouldBlockError> {
        poll(self, Timeout::after(timeout)).map_err(|()| WouldBlockError)
    }

    /// Block until the count is zero or the deadline is reached
    pub fn block_deadline(&mut self, deadline: Instant) -> Result<(), WouldBlockError> {
        poll(self, Timeout::At(deadline)).map_err(|()| WouldBlockError)
    }
}
