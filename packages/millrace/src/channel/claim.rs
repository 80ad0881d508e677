// arbitration between the arms of one select.
//
// every queue operation belonging to a select carries a reference to the select's claim, tagged
// with the index of its arm. whoever completes such an operation, whether the select's own thread
// or a peer operation on some other thread, first wins the claim for that arm while holding the
// lock of the queue the element moves through. once one arm has won, no other arm of the same
// select can move an element, so a select transfers at most one element in total.

use std::sync::{
    atomic::{
        Ordering::{AcqRel, Acquire, Release},
        AtomicUsize,
    },
    Arc,
};


// nobody has won.
const FREE: usize = 0;
// the select's own thread is in the middle of completing one of its arms.
const HELD: usize = usize::MAX;
// the select gave up without any arm winning.
const SEALED: usize = usize::MAX - 1;

// any other state is the index of the winning arm, plus one.
pub(crate) struct Claim(AtomicUsize);

// why the claim of a parked peer could not be won.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) enum Contended {
    // the peer's select is busy polling. it is worth waking, since it may take the element next.
    Busy,
    // the peer's select already went another way.
    Lost,
}

// which side of a transfer could not be claimed.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) enum Conflict {
    // the operation doing the transfer lost its own select to another arm.
    Own,
    Peer(Contended),
}

// the operation lost its select to another arm.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) struct Lost;

impl Claim {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Claim(AtomicUsize::new(FREE)))
    }

    // the arm which won, if any.
    pub(crate) fn winner(&self) -> Option<usize> {
        match self.0.load(Acquire) {
            FREE | HELD | SEALED => None,
            won => Some(won - 1),
        }
    }

    // hold the claim while the select's own thread polls an arm that cannot claim by itself.
    // fails if an arm already won.
    pub(crate) fn hold(&self) -> bool {
        self.0.compare_exchange(FREE, HELD, AcqRel, Acquire).is_ok()
    }

    // let go of a hold without winning.
    pub(crate) fn release(&self) {
        let _ = self.0.compare_exchange(HELD, FREE, AcqRel, Acquire);
    }

    // turn a hold into a win for `arm`.
    pub(crate) fn settle(&self, arm: usize) {
        debug_assert_eq!(self.0.load(Acquire), HELD);
        self.0.store(arm + 1, Release);
    }

    // give up the select so no arm can win anymore. if an arm won first, returns it instead.
    pub(crate) fn seal(&self) -> Result<(), usize> {
        match self.0.compare_exchange(FREE, SEALED, AcqRel, Acquire) {
            Ok(_) | Err(SEALED) => Ok(()),
            Err(HELD) => unreachable!("internal bug: select sealed while held"),
            Err(won) => Err(won - 1),
        }
    }
}


// a claim, tagged with the arm an operation belongs to.
#[derive(Clone)]
pub(crate) struct ClaimRef {
    claim: Arc<Claim>,
    arm: usize,
}

impl ClaimRef {
    pub(crate) fn new(claim: &Arc<Claim>, arm: usize) -> Self {
        ClaimRef { claim: Arc::clone(claim), arm }
    }

    fn won(&self) -> usize {
        self.arm + 1
    }

    // win the claim for this arm. winning it again is fine.
    fn win(&self) -> Result<(), Contended> {
        match self.claim.0.compare_exchange(FREE, self.won(), AcqRel, Acquire) {
            Ok(_) => Ok(()),
            Err(state) if state == self.won() => Ok(()),
            Err(HELD) => Err(Contended::Busy),
            Err(_) => Err(Contended::Lost),
        }
    }

    // whether the select went another way, so this arm can never complete.
    pub(crate) fn is_lost(&self) -> bool {
        match self.claim.0.load(Acquire) {
            FREE | HELD => false,
            state => state != self.won(),
        }
    }
}

// win the claims of both sides of a transfer, or neither.
//
// `own` belongs to the operation being polled, `peer` to the parked operation it would transfer an
// element with.
pub(crate) fn claim_pair(own: Option<&ClaimRef>, peer: Option<&ClaimRef>) -> Result<(), Conflict> {
    match (own, peer) {
        (None, None) => Ok(()),
        (Some(own), None) => own.win().map_err(|_| Conflict::Own),
        (None, Some(peer)) => peer.win().map_err(Conflict::Peer),
        (Some(own), Some(peer)) => {
            // a select never completes two of its own arms against each other
            if Arc::ptr_eq(&own.claim, &peer.claim) {
                return Err(Conflict::Peer(Contended::Lost));
            }
            // hold our side so no other thread completes us while the peer is tried
            if !own.claim.hold() {
                return Err(Conflict::Own);
            }
            match peer.win() {
                Ok(()) => {
                    own.claim.settle(own.arm);
                    Ok(())
                }
                Err(contended) => {
                    own.claim.release();
                    Err(Conflict::Peer(contended))
                }
            }
        }
    }
}
