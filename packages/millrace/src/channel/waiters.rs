// waiter queue part of a queue.

use super::claim::ClaimRef;
use std::{
    collections::VecDeque,
    task::Waker,
};


// identifies an entry within a WaiterQueue. never reused within the same WaiterQueue.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct WaiterId(u64);

// FIFO of parked operations, each with a payload slot and an optional waker.
//
// the payload of a sender entry is the element it is trying to send (None once a receiver took
// it). the payload of a receiver entry is the element handed to it (None until a sender fills it).
pub(crate) struct WaiterQueue<T> {
    entries: VecDeque<Entry<T>>,
    next_id: u64,
}

// a parked operation.
pub(crate) struct Entry<T> {
    id: WaiterId,
    pub(crate) slot: Option<T>,
    waker: Option<Waker>,
    // set if the operation is an arm of a select.
    pub(crate) claim: Option<ClaimRef>,
}

impl<T> Entry<T> {
    // wake the parked operation, if it installed a waker.
    pub(crate) fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    // install or replace the waker.
    pub(crate) fn set_waker(&mut self, waker: &Waker) {
        match &self.waker {
            Some(prev) if prev.will_wake(waker) => (),
            _ => self.waker = Some(waker.clone()),
        }
    }

    // whether the operation's select went another way, so it can never complete.
    pub(crate) fn is_lost(&self) -> bool {
        self.claim.as_ref().is_some_and(ClaimRef::is_lost)
    }
}

impl<T> Default for WaiterQueue<T> {
    fn default() -> Self {
        WaiterQueue::new()
    }
}

impl<T> WaiterQueue<T> {
    // construct empty queue.
    pub(crate) fn new() -> Self {
        WaiterQueue {
            entries: VecDeque::new(),
            next_id: 0,
        }
    }

    // number of parked operations, including ones whose slot was already resolved.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    // park a new operation at the back of the queue.
    pub(crate) fn push(&mut self, slot: Option<T>, waker: &Waker) -> WaiterId {
        self.push_claimed(slot, waker, None)
    }

    // park a new operation at the back of the queue, as an arm of a select if `claim` is set.
    pub(crate) fn push_claimed(
        &mut self,
        slot: Option<T>,
        waker: &Waker,
        claim: Option<ClaimRef>,
    ) -> WaiterId {
        let id = WaiterId(self.next_id);
        self.next_id += 1;
        self.entries.push_back(Entry { id, slot, waker: Some(waker.clone()), claim });
        id
    }

    // look up a parked operation.
    pub(crate) fn get_mut(&mut self, id: WaiterId) -> Option<&mut Entry<T>> {
        self.entries.iter_mut().find(|entry| entry.id == id)
    }

    // unpark an operation, returning its slot. returns None if the id is not parked.
    //
    // the waker is dropped along with the entry.
    pub(crate) fn remove(&mut self, id: WaiterId) -> Option<Option<T>> {
        let index = self.entries.iter().position(|entry| entry.id == id)?;
        self.entries.remove(index).map(|entry| entry.slot)
    }

    // entries from front to back.
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entry<T>> {
        self.entries.iter_mut()
    }

    // frontmost entry whose slot is occupied.
    #[cfg(test)]
    pub(crate) fn first_full(&mut self) -> Option<&mut Entry<T>> {
        self.entries.iter_mut().find(|entry| entry.slot.is_some())
    }

    // frontmost entry whose slot is empty and which can still complete.
    pub(crate) fn first_empty(&mut self) -> Option<&mut Entry<T>> {
        self.entries.iter_mut().find(|entry| entry.slot.is_none() && !entry.is_lost())
    }

    // whether any entry has an occupied slot.
    pub(crate) fn any_full(&self) -> bool {
        self.entries.iter().any(|entry| entry.slot.is_some())
    }

    // wake every parked operation.
    pub(crate) fn wake_all(&mut self) {
        for entry in &mut self.entries {
            entry.wake();
        }
    }
}
