// implementation of the bounded queue.
//
// the basic architecture is vaguely inspired by go's runtime channels. it is as such:
//
// queue handles wrap around Arc<Mutex<lockable state>>
//                                         |
//          /------------------------------/
//          v
//       lockable state
//          |
//          |------ it contains a VecDeque<T> of buffered elements, at most `capacity` long
//          |
//          |------ it contains a "sender waiter queue":
//          |
//          |       a FIFO of parked send operations. a parked sender leaves its element in its
//          |       waiter entry, so a receiver can take it directly (this is how a rendezvous queue
//          |       with capacity 0 hands elements over) or move it into the buffer once a slot
//          |       frees up. the sender is then woken and resolves without retrying.
//          |
//          \------ it contains a "receiver waiter queue":
//
//                  a FIFO of parked receive operations. a sender that finds a parked receiver
//                  with an empty slot puts the element straight into that slot.
//
// an operation which is an arm of a select also carries the select's claim (see the claim module).
// an element only moves into or out of such an operation after its claim is won, which is what
// keeps a select from completing more than one arm.
//
// there are also atomic handle counts for senders and receivers. dropping the last sender closes
// the queue, dropping the last receiver makes sends fail.
//
// blocking versions of operations are built as a layer on top of the futures in the polling
// module. the same layer is used by the select, wait group and shutdown futures.
//
// the organization of these modules is as such:
//
//      claim<-----waiters<---core: owns the lockable state and the send/recv state machines.
//                             ^    panics on misuse of the internal API.
//                             |
//      polling<---------------api: wraps core into the handle and future types that the crate
//                                  re-exports publically.
//
// there is also the error module, which contains the relevant error types, which is also
// re-exported publically.

pub(crate) mod error;
pub(crate) mod api;
pub(crate) mod polling;
pub(crate) mod claim;
pub(crate) mod waiters;

mod core;
