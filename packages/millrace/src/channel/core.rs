// minimal API for the queue. the exposed API is a convenience wrapper around this.

use super::{
    claim::{ClaimRef, Conflict, Contended, Lost, claim_pair},
    waiters::{WaiterQueue, WaiterId},
};
use std::{
    collections::VecDeque,
    future::Future,
    mem::replace,
    pin::Pin,
    sync::{
        atomic::{
            Ordering::{AcqRel, Acquire},
            AtomicUsize,
        },
        Arc,
        Mutex,
        MutexGuard,
    },
    task::{Poll, Context},
};


// handle to a queue.
pub(crate) struct Channel<T>(Arc<Shared<T>>);

// queue shared state.
struct Shared<T> {
    // mutex around lockable state.
    lockable: Mutex<Lockable<T>>,
    // number of live sender handles.
    send_count: AtomicUsize,
    // number of live receiver handles.
    recv_count: AtomicUsize,
}

// queue lockable state.
pub(crate) struct Lockable<T> {
    // buffered elements.
    //
    // len <= capacity, except that a receive future dropped after a sender handed it an element
    // pushes that element back to the front.
    elems: VecDeque<T>,
    // elems maximum length. 0 makes the queue a rendezvous.
    capacity: usize,
    // parked send operations.
    senders: WaiterQueue<T>,
    // parked recv operations.
    receivers: WaiterQueue<T>,
    // once true, never becomes false again. sending panics, receiving drains then returns None.
    closed: bool,
    // once true, never becomes false again. sending returns the element as an error.
    no_receivers: bool,
}

impl<T> Channel<T> {
    // construct empty queue with send and recv counts of 1.
    pub(crate) fn new(capacity: usize) -> Self {
        Channel(Arc::new(Shared {
            lockable: Mutex::new(Lockable {
                elems: VecDeque::with_capacity(capacity),
                capacity,
                senders: WaiterQueue::new(),
                receivers: WaiterQueue::new(),
                closed: false,
                no_receivers: false,
            }),
            send_count: AtomicUsize::new(1),
            recv_count: AtomicUsize::new(1),
        }))
    }

    // clone another handle to the queue without touching the handle counts.
    pub(crate) fn clone(&self) -> Self {
        Channel(Arc::clone(&self.0))
    }

    // lock the queue.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Lockable<T>> {
        self.0.lockable.lock().unwrap()
    }

    // register another sender handle.
    pub(crate) fn inc_senders(&self) {
        self.0.send_count.fetch_add(1, AcqRel);
    }

    // unregister a sender handle. closes the queue if it was the last one and the queue is still
    // open.
    pub(crate) fn dec_senders(&self) {
        if self.0.send_count.fetch_sub(1, AcqRel) == 1 {
            let mut lock = self.lock();
            if !lock.closed {
                lock.close();
            }
        }
    }

    // register another receiver handle.
    pub(crate) fn inc_receivers(&self) {
        self.0.recv_count.fetch_add(1, AcqRel);
    }

    // unregister a receiver handle. fails all senders if it was the last one.
    pub(crate) fn dec_receivers(&self) {
        if self.0.recv_count.fetch_sub(1, AcqRel) == 1 {
            let mut lock = self.lock();
            lock.no_receivers = true;
            lock.senders.wake_all();
        }
    }

    // number of live receiver handles.
    pub(crate) fn receiver_count(&self) -> usize {
        self.0.recv_count.load(Acquire)
    }

    // construct a send operation, as an arm of a select if `claim` is set. does not lock.
    pub(crate) fn send(&self, elem: T, claim: Option<ClaimRef>) -> SendOp<T> {
        SendOp { channel: self.clone(), claim, state: SendState::Fresh(elem) }
    }

    // construct a recv operation, as an arm of a select if `claim` is set. does not lock.
    pub(crate) fn recv(&self, claim: Option<ClaimRef>) -> RecvOp<T> {
        RecvOp { channel: self.clone(), claim, state: RecvState::Fresh }
    }
}

impl<T> Lockable<T> {
    // number of buffered elements.
    pub(crate) fn len(&self) -> usize {
        self.elems.len()
    }

    // maximum number of buffered elements.
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    // whether the queue has been closed.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    // mark closed and wake everything parked.
    //
    // panics if already closed.
    pub(crate) fn close(&mut self) {
        assert!(!self.closed, "internal bug: queue closed twice");
        self.closed = true;
        self.receivers.wake_all();
        self.senders.wake_all();
    }

    // take the next element, if one is available without waiting.
    //
    // takes from the buffer first, refilling the freed space from parked senders. with an empty
    // buffer, takes directly from the frontmost parked sender that can be claimed. errs if `own`
    // lost its select to another arm.
    fn take(&mut self, own: Option<&ClaimRef>) -> Result<Option<T>, Lost> {
        if self.elems.is_empty() {
            return self.take_parked(own);
        }
        claim_pair(own, None).map_err(|_| Lost)?;
        let elem = self.elems.pop_front();
        self.refill();
        Ok(elem)
    }

    // take the element of the frontmost parked sender whose claim can be won alongside `own`.
    //
    // senders of a select which is busy polling are woken and passed over, as are senders of a
    // select which went another way.
    fn take_parked(&mut self, own: Option<&ClaimRef>) -> Result<Option<T>, Lost> {
        for entry in self.senders.iter_mut() {
            if entry.slot.is_none() {
                continue;
            }
            match claim_pair(own, entry.claim.as_ref()) {
                Ok(()) => {
                    let elem = entry.slot.take();
                    entry.wake();
                    return Ok(elem);
                }
                Err(Conflict::Own) => return Err(Lost),
                Err(Conflict::Peer(Contended::Busy)) => entry.wake(),
                Err(Conflict::Peer(Contended::Lost)) => (),
            }
        }
        Ok(None)
    }

    // move elements of parked senders into free buffer space.
    fn refill(&mut self) {
        while self.elems.len() < self.capacity {
            match self.take_parked(None) {
                Ok(Some(elem)) => self.elems.push_back(elem),
                _ => break,
            }
        }
    }

    // put an element straight into the slot of the frontmost parked receiver whose claim can be
    // won alongside `own`.
    fn hand_off(&mut self, own: Option<&ClaimRef>, elem: T) -> HandOff<T> {
        for entry in self.receivers.iter_mut() {
            if entry.slot.is_some() {
                continue;
            }
            match claim_pair(own, entry.claim.as_ref()) {
                Ok(()) => {
                    entry.slot = Some(elem);
                    entry.wake();
                    return HandOff::Done;
                }
                Err(Conflict::Own) => return HandOff::Lost(elem),
                Err(Conflict::Peer(Contended::Busy)) => entry.wake(),
                Err(Conflict::Peer(Contended::Lost)) => (),
            }
        }
        HandOff::Nobody(elem)
    }

    // after a receiver leaves the line, pass the wakeup on if there is more to take.
    //
    // senders wake only the frontmost empty receiver, which may be woken several times before it
    // polls. this keeps the rest of the line moving.
    fn wake_next_receiver(&mut self) {
        if self.elems.is_empty() && !self.senders.any_full() && !self.closed {
            return;
        }
        if let Some(entry) = self.receivers.first_empty() {
            entry.wake();
        }
    }

    // return an element handed to a receive future which was then dropped without polling it.
    fn give_back(&mut self, elem: T) {
        match self.hand_off(None, elem) {
            HandOff::Done => (),
            HandOff::Nobody(elem) | HandOff::Lost(elem) => self.elems.push_front(elem),
        }
    }
}

// outcome of `Lockable::hand_off`.
enum HandOff<T> {
    Done,
    // no parked receiver could take it.
    Nobody(T),
    // the sending operation lost its select to another arm.
    Lost(T),
}


// ==== send operation ====


// send state machine. abandons itself when dropped.
pub(crate) struct SendOp<T> {
    channel: Channel<T>,
    // set if the operation is an arm of a select.
    claim: Option<ClaimRef>,
    state: SendState<T>,
}

enum SendState<T> {
    // not yet polled.
    Fresh(T),
    // element is sitting in the sender waiter queue.
    Parked(WaiterId),
    // resolved or abandoned.
    Done,
}

// the element is never pinned.
impl<T> Unpin for SendOp<T> {}

impl<T> SendOp<T> {
    // poll the operation.
    //
    // - resolves to ok once the element is buffered or taken by a receiver.
    // - resolves to err with the element if all receivers have been dropped.
    // - as an arm of a select, stays pending once another arm has won.
    //
    // panics if the queue is closed, or if already resolved or abandoned.
    pub(crate) fn poll_send(&mut self, cx: &mut Context) -> Poll<Result<(), T>> {
        let own = self.claim.as_ref();
        let mut guard = self.channel.lock();
        let lock = &mut *guard;
        match replace(&mut self.state, SendState::Done) {
            SendState::Done => {
                drop(guard);
                panic!("send polled after already resolved or abandoned");
            }
            SendState::Fresh(elem) => {
                if lock.closed {
                    drop(guard);
                    panic!("send on closed queue");
                }
                if lock.no_receivers {
                    if claim_pair(own, None).is_err() {
                        self.state = SendState::Fresh(elem);
                        return Poll::Pending;
                    }
                    return Poll::Ready(Err(elem));
                }

                let nobody_ahead = !lock.senders.any_full();

                // hand off straight to a parked receiver
                let elem = if nobody_ahead && lock.elems.is_empty() {
                    match lock.hand_off(own, elem) {
                        HandOff::Done => return Poll::Ready(Ok(())),
                        HandOff::Lost(elem) => {
                            self.state = SendState::Fresh(elem);
                            return Poll::Pending;
                        }
                        HandOff::Nobody(elem) => elem,
                    }
                } else {
                    elem
                };

                // buffer it
                if nobody_ahead && lock.elems.len() < lock.capacity {
                    if claim_pair(own, None).is_err() {
                        self.state = SendState::Fresh(elem);
                        return Poll::Pending;
                    }
                    lock.elems.push_back(elem);
                    lock.wake_next_receiver();
                    return Poll::Ready(Ok(()));
                }

                // park with the element so a receiver can pick it up
                let id = lock.senders.push_claimed(Some(elem), cx.waker(), own.cloned());
                lock.wake_next_receiver();
                self.state = SendState::Parked(id);
                Poll::Pending
            }
            SendState::Parked(id) => {
                // space may have freed up without a receiver taking from us directly
                lock.refill();
                let entry = lock.senders.get_mut(id).expect("internal bug: parked sender missing");
                if entry.slot.is_none() {
                    // a receiver took it
                    lock.senders.remove(id);
                    return Poll::Ready(Ok(()));
                }
                if lock.closed {
                    lock.senders.remove(id);
                    drop(guard);
                    panic!("send on closed queue");
                }
                if lock.no_receivers && claim_pair(own, None).is_ok() {
                    let elem = lock.senders.remove(id).flatten()
                        .expect("internal bug: parked sender lost its element");
                    return Poll::Ready(Err(elem));
                }
                entry.set_waker(cx.waker());
                // a receiver may have passed us over while our select was busy
                lock.wake_next_receiver();
                self.state = SendState::Parked(id);
                Poll::Pending
            }
        }
    }

    // if not already resolved or abandoned, abandon the operation.
    //
    // returns the element if it was not delivered. returns None if it was delivered, or if there
    // was nothing to abandon. never panics.
    pub(crate) fn abandon(&mut self) -> Option<T> {
        match replace(&mut self.state, SendState::Done) {
            SendState::Done => None,
            SendState::Fresh(elem) => Some(elem),
            SendState::Parked(id) => {
                let mut lock = self.channel.lock();
                let elem = lock.senders.remove(id).flatten();
                // senders parked behind us may fit in the buffer now
                lock.refill();
                elem
            }
        }
    }

    // whether already resolved or abandoned.
    pub(crate) fn is_terminated(&self) -> bool {
        matches!(&self.state, SendState::Done)
    }
}

impl<T> Future for SendOp<T> {
    type Output = Result<(), T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        self.get_mut().poll_send(cx)
    }
}

impl<T> Drop for SendOp<T> {
    fn drop(&mut self) {
        self.abandon();
    }
}


// ==== recv operation ====


// recv state machine. abandons itself when dropped.
pub(crate) struct RecvOp<T> {
    channel: Channel<T>,
    // set if the operation is an arm of a select.
    claim: Option<ClaimRef>,
    state: RecvState,
}

#[derive(Copy, Clone)]
enum RecvState {
    // not yet polled.
    Fresh,
    // parked in the receiver waiter queue.
    Parked(WaiterId),
    // resolved or abandoned.
    Done,
}

impl<T> RecvOp<T> {
    // poll the operation.
    //
    // resolves to some element, or to none once the queue is closed and drained. as an arm of a
    // select, stays pending once another arm has won.
    //
    // panics if already resolved or abandoned.
    pub(crate) fn poll_recv(&mut self, cx: &mut Context) -> Poll<Option<T>> {
        let own = self.claim.as_ref();
        let mut guard = self.channel.lock();
        let lock = &mut *guard;
        let prev = replace(&mut self.state, RecvState::Done);
        let parked = match prev {
            RecvState::Done => {
                drop(guard);
                panic!("recv polled after already resolved or abandoned");
            }
            RecvState::Fresh => None,
            RecvState::Parked(id) => Some(id),
        };

        // a sender may have filled our slot directly, having already won our claim
        if let Some(id) = parked {
            let entry = lock.receivers.get_mut(id).expect("internal bug: parked receiver missing");
            if let Some(elem) = entry.slot.take() {
                lock.receivers.remove(id);
                lock.wake_next_receiver();
                return Poll::Ready(Some(elem));
            }
        }

        match lock.take(own) {
            Ok(Some(elem)) => {
                if let Some(id) = parked {
                    lock.receivers.remove(id);
                }
                lock.wake_next_receiver();
                return Poll::Ready(Some(elem));
            }
            Ok(None) => (),
            Err(Lost) => {
                self.state = prev;
                return Poll::Pending;
            }
        }
        if lock.closed {
            if claim_pair(own, None).is_err() {
                self.state = prev;
                return Poll::Pending;
            }
            if let Some(id) = parked {
                lock.receivers.remove(id);
            }
            return Poll::Ready(None);
        }

        // park, keeping our place in line if we were already parked
        let id = match parked {
            Some(id) => {
                lock.receivers.get_mut(id)
                    .expect("internal bug: parked receiver missing")
                    .set_waker(cx.waker());
                id
            }
            None => lock.receivers.push_claimed(None, cx.waker(), own.cloned()),
        };
        self.state = RecvState::Parked(id);
        Poll::Pending
    }

    // if not already resolved or abandoned, abandon the operation. never panics.
    //
    // returns the element if a sender had already handed one to this operation. the send has
    // completed, so the element counts as received.
    pub(crate) fn abandon(&mut self) -> Option<T> {
        self.leave(false)
    }

    // abandon, either returning a handed-off element or giving it back to the queue.
    fn leave(&mut self, give_back: bool) -> Option<T> {
        let RecvState::Parked(id) = replace(&mut self.state, RecvState::Done) else {
            return None;
        };
        let mut lock = self.channel.lock();
        match lock.receivers.remove(id).flatten() {
            Some(elem) if give_back => {
                lock.give_back(elem);
                None
            }
            Some(elem) => Some(elem),
            None => {
                // we may have consumed a wakeup meant for whoever is next
                lock.wake_next_receiver();
                None
            }
        }
    }

    // whether already resolved or abandoned.
    pub(crate) fn is_terminated(&self) -> bool {
        matches!(&self.state, RecvState::Done)
    }
}

impl<T> Future for RecvOp<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        self.get_mut().poll_recv(cx)
    }
}

impl<T> Drop for RecvOp<T> {
    fn drop(&mut self) {
        // nobody is left to return a handed-off element to
        self.leave(true);
    }
}
