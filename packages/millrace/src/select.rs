//! Waiting on whichever of several operations becomes ready first.

use crate::{
    channel::{
        claim::{Claim, ClaimRef},
        polling::{Abandon, Timeout, poll},
    },
    error::SendError,
    shutdown::StopToken,
    Receiver,
    Sender,
};
use rand::Rng;
use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll, Waker},
    time::{Duration, Instant},
};


/// Multiplexed wait over several operations
///
/// Each arm pairs an operation with a closure that maps its output to the select's output.
/// Exactly one arm's closure runs: the arm which becomes ready first, or, if several are ready at
/// once, one of them chosen from a random starting position so that no arm is starved. Queue arms
/// complete atomically with respect to each other: once one of them has received or sent a
/// message, no other queue arm of the same select can, so a losing arm never takes a message from
/// a queue or delivers one into it.
///
/// With a [`default`](Self::default) branch, the select never waits: if no arm is ready, the
/// default branch runs. Otherwise it waits until an arm is ready or, if a
/// [`timeout`](Self::timeout) or [`deadline`](Self::deadline) is set, the deadline passes, in
/// which case the timeout branch runs.
///
/// [`block`](Self::block) drives the select on the calling thread. Awaiting it drives it as a
/// future, in which case a timeout needs a tokio runtime with the time driver enabled.
///
/// ```
/// use millrace::{bounded, Select};
/// use std::time::Duration;
///
/// let (send_a, recv_a) = bounded::<u32>(1);
/// let (_send_b, recv_b) = bounded::<&str>(1);
/// send_a.try_send(7).unwrap();
///
/// let picked = Select::new()
///     .recv(&recv_a, |n| format!("a: {:?}", n))
///     .recv(&recv_b, |s| format!("b: {:?}", s))
///     .timeout(Duration::from_secs(1), || String::from("timed out"))
///     .block();
/// assert_eq!(picked, "a: Some(7)");
/// ```
#[must_use = "a select does nothing until blocked on or awaited"]
pub struct Select<'a, O> {
    arms: Arms<'a, O>,
    default: Option<Box<dyn FnOnce() -> O + Send + 'a>>,
    deadline: Option<(Instant, Box<dyn FnOnce() -> O + Send + 'a>)>,
    // created on first async poll with a deadline.
    sleep: Option<Pin<Box<tokio::time::Sleep>>>,
    done: bool,
}

#[allow(clippy::new_without_default)]
impl<'a, O> Select<'a, O> {
    /// Construct with no arms
    pub fn new() -> Self {
        Select {
            arms: Arms { arms: Vec::new(), claim: Claim::new() },
            default: None,
            deadline: None,
            sleep: None,
            done: false,
        }
    }

    /// Add an arm which receives from a queue
    ///
    /// The arm is ready with `None` once the queue is closed and drained, so a loop selecting over
    /// a closed queue never waits on it again.
    pub fn recv<T, F>(mut self, recv: &Receiver<T>, f: F) -> Self
    where
        T: Send + 'a,
        F: FnOnce(Option<T>) -> O + Send + 'a,
    {
        let fut = recv.recv_claimed(self.arms.next_claim());
        self.arms.push(MapArm { fut, map: Some(f), claims: true });
        self
    }

    /// Add an arm which sends `msg` into a queue
    ///
    /// The arm is ready with `Ok(())` once the message is buffered or taken by a receiver, and
    /// with [`SendError`] if every receiver is gone. If another branch is taken instead, the send
    /// is rescinded: the message never reaches the queue and is dropped along with the select.
    ///
    /// Like any send, this panics if the queue is closed.
    pub fn send<T, F>(mut self, send: &Sender<T>, msg: T, f: F) -> Self
    where
        T: Send + 'a,
        F: FnOnce(Result<(), SendError<T>>) -> O + Send + 'a,
    {
        let fut = send.send_claimed(msg, self.arms.next_claim());
        self.arms.push(MapArm { fut, map: Some(f), claims: true });
        self
    }

    /// Add an arm which becomes ready once stop is requested of the token
    pub fn stopped<F>(mut self, token: &StopToken, f: F) -> Self
    where
        F: FnOnce() -> O + Send + 'a,
    {
        self.arms.push(MapArm { fut: token.stopped(), map: Some(move |()| f()), claims: false });
        self
    }

    /// Add an arm for an arbitrary future
    ///
    /// If the arm loses, the future is dropped.
    pub fn future<Fut, F>(mut self, fut: Fut, f: F) -> Self
    where
        Fut: Future + Send + 'a,
        F: FnOnce(Fut::Output) -> O + Send + 'a,
    {
        self.arms.push(MapArm { fut: Box::pin(fut), map: Some(f), claims: false });
        self
    }

    /// Set the branch to take if no arm is ready immediately
    ///
    /// A select with a default branch never waits.
    pub fn default<F>(mut self, f: F) -> Self
    where
        F: FnOnce() -> O + Send + 'a,
    {
        self.default = Some(Box::new(f));
        self
    }

    /// Set the branch to take if no arm becomes ready within `timeout`
    ///
    /// The timeout starts now, not when the select is first polled. A timeout too long to
    /// represent never elapses, and its branch is never taken.
    pub fn timeout<F>(self, timeout: Duration, f: F) -> Self
    where
        F: FnOnce() -> O + Send + 'a,
    {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.deadline(deadline, f),
            None => self,
        }
    }

    /// Set the branch to take if no arm becomes ready by `deadline`
    pub fn deadline<F>(mut self, deadline: Instant, f: F) -> Self
    where
        F: FnOnce() -> O + Send + 'a,
    {
        self.deadline = Some((deadline, Box::new(f)));
        self.sleep = None;
        self
    }

    /// Number of arms, not counting the default or timeout branch
    pub fn len(&self) -> usize {
        self.arms.arms.len()
    }

    /// Whether there are no arms, not counting the default or timeout branch
    pub fn is_empty(&self) -> bool {
        self.arms.arms.is_empty()
    }

    /// Block the calling thread until one branch is taken, returning its output
    ///
    /// Panics if the select has no arms, no default and no timeout, since it would block forever.
    #[track_caller]
    pub fn block(mut self) -> O {
        self.assert_can_resolve();
        self.done = true;
        let timeout = if self.default.is_some() {
            Timeout::NonBlocking
        } else if let Some(&(deadline, _)) = self.deadline.as_ref() {
            Timeout::At(deadline)
        } else {
            Timeout::Never
        };
        match poll(&mut self.arms, timeout) {
            Ok(output) | Err(Some(output)) => output,
            Err(None) => self.take_fallback().expect("select timed out with no fallback branch"),
        }
    }

    #[track_caller]
    fn assert_can_resolve(&self) {
        assert!(
            !self.arms.arms.is_empty() || self.default.is_some() || self.deadline.is_some(),
            "select with no arms, no default and no timeout would block forever",
        );
    }

    // the default branch if there is one, otherwise the timeout branch.
    fn take_fallback(&mut self) -> Option<O> {
        if let Some(default) = self.default.take() {
            return Some(default());
        }
        self.deadline.take().map(|(_, f)| f())
    }
}

impl<'a, O> Future for Select<'a, O> {
    type Output = O;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<O> {
        let this = self.get_mut();
        assert!(!this.done, "select polled after already resolved");
        this.assert_can_resolve();

        if let Poll::Ready(output) = Pin::new(&mut this.arms).poll(cx) {
            this.finish();
            return Poll::Ready(output);
        }
        let fallback_due = if this.default.is_some() {
            true
        } else if let Some(&(deadline, _)) = this.deadline.as_ref() {
            let sleep = this.sleep.get_or_insert_with(|| {
                Box::pin(tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)))
            });
            sleep.as_mut().poll(cx).is_ready()
        } else {
            false
        };
        if fallback_due {
            let output = match this.finish() {
                Some(output) => output,
                None => this.take_fallback().expect("fallback branch missing"),
            };
            return Poll::Ready(output);
        }
        Poll::Pending
    }
}

impl<'a, O> Select<'a, O> {
    // abandon every arm. returns the output of an arm which another thread completed after the
    // last poll, which then beats the fallback branch.
    fn finish(&mut self) -> Option<O> {
        self.done = true;
        self.sleep = None;
        self.arms.abandon()
    }
}

impl<'a, O> Debug for Select<'a, O> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Select")
            .field("arms", &self.arms.arms.len())
            .field("default", &self.default.is_some())
            .field("deadline", &self.deadline.as_ref().map(|&(deadline, _)| deadline))
            .finish()
    }
}


// the operation of one arm, with its output mapped to the select's output.
trait Arm<O> {
    fn poll_arm(&mut self, cx: &mut Context) -> Poll<O>;

    // whether the operation wins the select's claim by itself when it completes.
    fn claims(&self) -> bool;
}

struct MapArm<F, M> {
    fut: F,
    // taken when the arm resolves.
    map: Option<M>,
    claims: bool,
}

impl<F, M, O> Arm<O> for MapArm<F, M>
where
    F: Future + Unpin,
    M: FnOnce(F::Output) -> O,
{
    fn poll_arm(&mut self, cx: &mut Context) -> Poll<O> {
        let output = ready!(Pin::new(&mut self.fut).poll(cx));
        let map = self.map.take().expect("select arm resolved twice");
        Poll::Ready(map(output))
    }

    fn claims(&self) -> bool {
        self.claims
    }
}


// the arms of a select, polled from a random starting position.
//
// queue arms win the claim themselves, possibly from another thread. any other arm is polled
// while holding the claim, so that no queue arm completes while it might resolve.
struct Arms<'a, O> {
    arms: Vec<Box<dyn Arm<O> + Send + 'a>>,
    claim: Arc<Claim>,
}

impl<'a, O> Arms<'a, O> {
    // claim reference for the arm about to be pushed.
    fn next_claim(&self) -> ClaimRef {
        ClaimRef::new(&self.claim, self.arms.len())
    }

    fn push<A: Arm<O> + Send + 'a>(&mut self, arm: A) {
        self.arms.push(Box::new(arm));
    }

    // poll the arm which won the claim. it is ready unless its operation was abandoned.
    fn poll_winner(&mut self, i: usize, cx: &mut Context) -> Poll<O> {
        let polled = self.arms[i].poll_arm(cx);
        if polled.is_ready() {
            self.arms.clear();
        }
        polled
    }
}

impl<'a, O> Future for Arms<'a, O> {
    type Output = O;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<O> {
        let this = self.get_mut();
        let n = this.arms.len();
        if n == 0 {
            return Poll::Pending;
        }
        if let Some(i) = this.claim.winner() {
            return this.poll_winner(i, cx);
        }
        let start = rand::thread_rng().gen_range(0..n);
        for i in (start..n).chain(0..start) {
            let polled = if this.arms[i].claims() {
                this.arms[i].poll_arm(cx)
            } else {
                if !this.claim.hold() {
                    break;
                }
                let polled = this.arms[i].poll_arm(cx);
                match polled {
                    Poll::Ready(_) => this.claim.settle(i),
                    Poll::Pending => this.claim.release(),
                }
                polled
            };
            if polled.is_ready() {
                // drop the rest now, while the winner's closure has already run
                this.arms.clear();
                return polled;
            }
        }
        // another thread may have completed an arm we already passed
        match this.claim.winner() {
            Some(i) => this.poll_winner(i, cx),
            None => Poll::Pending,
        }
    }
}

impl<'a, O> Abandon for Arms<'a, O> {
    type Abandoned = Option<O>;

    // dropping an arm's operation abandons it. an arm which another thread already completed
    // cannot be abandoned, so it is resolved instead.
    fn abandon(&mut self) -> Self::Abandoned {
        if self.arms.is_empty() {
            return None;
        }
        let output = match self.claim.seal() {
            Ok(()) => None,
            Err(i) => match self.arms[i].poll_arm(&mut Context::from_waker(Waker::noop())) {
                Poll::Ready(output) => Some(output),
                Poll::Pending => None,
            },
        };
        self.arms.clear();
        output
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bounded, rendezvous, shutdown, error::WouldBlockError};
    use std::{
        sync::atomic::{AtomicUsize, Ordering::Relaxed},
        thread,
    };

    #[derive(Debug, PartialEq)]
    enum Event {
        Value(Option<u32>),
        Default,
        Timeout,
        Stop,
        Sent,
    }

    #[test]
    fn default_taken_when_nothing_ready() {
        let (_send, recv) = bounded::<u32>(1);
        let start = Instant::now();
        let event = Select::new()
            .recv(&recv, Event::Value)
            .default(|| Event::Default)
            .block();
        assert_eq!(event, Event::Default);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn ready_arm_beats_default() {
        let (send, recv) = bounded(1);
        send.try_send(4).unwrap();
        let event = Select::new()
            .recv(&recv, Event::Value)
            .default(|| Event::Default)
            .block();
        assert_eq!(event, Event::Value(Some(4)));
    }

    #[test]
    fn timeout_before_source_fires() {
        let (send, recv) = rendezvous::<u32>();
        let join = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            let _ = send.send(1).block_timeout(Duration::from_millis(10));
        });
        let start = Instant::now();
        let event = Select::new()
            .recv(&recv, Event::Value)
            .timeout(Duration::from_millis(40), || Event::Timeout)
            .block();
        assert_eq!(event, Event::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(40));
        join.join().unwrap();
    }

    #[test]
    fn source_before_timeout_fires() {
        let (send, recv) = rendezvous::<u32>();
        let join = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            send.send(1).block().unwrap();
        });
        let event = Select::new()
            .recv(&recv, Event::Value)
            .timeout(Duration::from_millis(500), || Event::Timeout)
            .block();
        assert_eq!(event, Event::Value(Some(1)));
        join.join().unwrap();
    }

    #[test]
    fn closed_queue_arm_ready_with_none() {
        let (send, recv) = bounded::<u32>(1);
        send.close();
        let event = Select::new()
            .recv(&recv, Event::Value)
            .timeout(Duration::from_secs(5), || Event::Timeout)
            .block();
        assert_eq!(event, Event::Value(None));
    }

    #[test]
    fn stop_arm() {
        let (shutdown, token) = shutdown::channel();
        let (_send, recv) = bounded::<u32>(1);
        shutdown.request_stop();
        let event = Select::new()
            .recv(&recv, Event::Value)
            .stopped(&token, || Event::Stop)
            .block();
        assert_eq!(event, Event::Stop);
    }

    #[test]
    fn every_ready_arm_makes_progress() {
        let (send_a, recv_a) = bounded(100);
        let (send_b, recv_b) = bounded(100);
        for i in 0..100 {
            send_a.try_send(i).unwrap();
            send_b.try_send(i).unwrap();
        }
        let from_a = AtomicUsize::new(0);
        let from_b = AtomicUsize::new(0);
        for _ in 0..100 {
            Select::new()
                .recv(&recv_a, |_| { from_a.fetch_add(1, Relaxed); })
                .recv(&recv_b, |_| { from_b.fetch_add(1, Relaxed); })
                .block();
        }
        assert_eq!(from_a.load(Relaxed) + from_b.load(Relaxed), 100);
        assert!(from_a.load(Relaxed) > 0);
        assert!(from_b.load(Relaxed) > 0);
        // losing arms put nothing back out of place
        assert_eq!(recv_a.len() + recv_b.len(), 100);
    }

    #[test]
    fn losing_arm_loses_nothing() {
        let (send_a, recv_a) = rendezvous::<u32>();
        let (send_b, recv_b) = bounded::<u32>(1);
        send_b.try_send(2).unwrap();
        for _ in 0..20 {
            let event = Select::new()
                .recv(&recv_a, Event::Value)
                .recv(&recv_b, Event::Value)
                .block();
            assert_eq!(event, Event::Value(Some(2)));
            send_b.try_send(2).unwrap();
        }
        assert_eq!(recv_a.try_recv(), Err(WouldBlockError));
        drop(send_a);
    }

    #[test]
    fn one_rendezvous_hand_off_per_select() {
        let (send_a, recv_a) = rendezvous::<u32>();
        let (send_b, recv_b) = rendezvous::<u32>();
        let mut select = Select::new()
            .recv(&recv_a, |n| ('a', n))
            .recv(&recv_b, |n| ('b', n));
        let mut cx = Context::from_waker(Waker::noop());
        assert!(Pin::new(&mut select).poll(&mut cx).is_pending());

        // both arms are parked, but once one has been handed a message the other is out
        send_a.try_send(1).unwrap();
        assert!(send_b.try_send(2).unwrap_err().is_would_block());
        assert_eq!(Pin::new(&mut select).poll(&mut cx), Poll::Ready(('a', Some(1))));
        drop(select);

        assert_eq!(recv_a.len(), 0);
        assert_eq!(recv_b.len(), 0);
        assert_eq!(recv_b.try_recv(), Err(WouldBlockError));
    }

    #[test]
    fn hand_off_at_the_deadline_is_received() {
        for _ in 0..50 {
            let (send, recv) = rendezvous::<u32>();
            let join = thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                send.send(1).block_timeout(Duration::from_millis(5)).is_ok()
            });
            let event = Select::new()
                .recv(&recv, Event::Value)
                .timeout(Duration::from_millis(5), || Event::Timeout)
                .block();
            // the message was received if and only if the send reported success
            let sent = join.join().unwrap();
            assert_eq!(event == Event::Value(Some(1)), sent);
            assert_eq!(recv.len(), 0);
        }
    }

    #[test]
    fn send_arm_with_default() {
        let (send, recv) = bounded(1);
        let sent = Select::new()
            .send(&send, 1, |result| result.is_ok())
            .default(|| false)
            .block();
        assert!(sent);

        // the queue is full, so the default is taken and the message rescinded
        let sent = Select::new()
            .send(&send, 2, |result| result.is_ok())
            .default(|| false)
            .block();
        assert!(!sent);
        assert_eq!(recv.len(), 1);
        assert_eq!(recv.try_recv(), Ok(Some(1)));
        assert_eq!(recv.try_recv(), Err(WouldBlockError));
    }

    #[test]
    fn send_arm_with_timeout() {
        let (send, recv) = rendezvous::<u32>();
        let start = Instant::now();
        let event = Select::new()
            .send(&send, 1, |_| Event::Sent)
            .timeout(Duration::from_millis(30), || Event::Timeout)
            .block();
        assert_eq!(event, Event::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(recv.try_recv(), Err(WouldBlockError));

        let join = thread::spawn(move || recv.recv().block());
        let event = Select::new()
            .send(&send, 2, |result| {
                result.unwrap();
                Event::Sent
            })
            .timeout(Duration::from_secs(5), || Event::Timeout)
            .block();
        assert_eq!(event, Event::Sent);
        assert_eq!(join.join().unwrap(), Some(2));
    }

    #[test]
    fn send_arm_without_receivers() {
        let (send, recv) = bounded::<u32>(1);
        drop(recv);
        let returned = Select::new()
            .send(&send, 3, |result| result.unwrap_err().into_inner())
            .block();
        assert_eq!(returned, 3);
    }

    #[test]
    fn taken_send_arm_shuts_out_receive_arm() {
        let (send_a, recv_a) = rendezvous::<u32>();
        let (send_b, recv_b) = rendezvous::<u32>();
        let mut select = Select::new()
            .send(&send_a, 1, |result| ('s', result.is_ok()))
            .recv(&recv_b, |n| ('r', n.is_some()));
        let mut cx = Context::from_waker(Waker::noop());
        assert!(Pin::new(&mut select).poll(&mut cx).is_pending());

        // a receiver takes the parked message, so the receive arm can no longer complete
        assert_eq!(recv_a.try_recv(), Ok(Some(1)));
        assert!(send_b.try_send(2).unwrap_err().is_would_block());
        assert_eq!(Pin::new(&mut select).poll(&mut cx), Poll::Ready(('s', true)));
    }

    #[test]
    fn selects_exchange_messages() {
        let (send, recv) = rendezvous::<u32>();
        let (_idle_send, idle_recv) = rendezvous::<u32>();
        let join = thread::spawn(move || {
            Select::new()
                .recv(&recv, Event::Value)
                .recv(&idle_recv, Event::Value)
                .timeout(Duration::from_secs(5), || Event::Timeout)
                .block()
        });
        let event = Select::new()
            .send(&send, 8, |result| {
                result.unwrap();
                Event::Sent
            })
            .timeout(Duration::from_secs(5), || Event::Timeout)
            .block();
        assert_eq!(event, Event::Sent);
        assert_eq!(join.join().unwrap(), Event::Value(Some(8)));
    }

    #[test]
    fn unrepresentable_timeout_never_fires() {
        let (send, recv) = bounded(1);
        send.try_send(5).unwrap();
        let event = Select::new()
            .recv(&recv, Event::Value)
            .timeout(Duration::MAX, || Event::Timeout)
            .block();
        assert_eq!(event, Event::Value(Some(5)));

        let join = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            send.try_send(6).unwrap();
        });
        let event = Select::new()
            .recv(&recv, Event::Value)
            .timeout(Duration::MAX, || Event::Timeout)
            .block();
        assert_eq!(event, Event::Value(Some(6)));
        join.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "would block forever")]
    fn empty_select_panics() {
        Select::<()>::new().block();
    }

    #[test]
    fn default_alone() {
        assert_eq!(Select::new().default(|| 3).block(), 3);
    }

    #[tokio::test]
    async fn async_select_timeout() {
        let (_send, recv) = bounded::<u32>(1);
        let start = Instant::now();
        let event = Select::new()
            .recv(&recv, Event::Value)
            .timeout(Duration::from_millis(30), || Event::Timeout)
            .await;
        assert_eq!(event, Event::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn async_select_future_arm() {
        let event = Select::new()
            .future(tokio::time::sleep(Duration::from_millis(10)), |()| Event::Default)
            .timeout(Duration::from_secs(5), || Event::Timeout)
            .await;
        assert_eq!(event, Event::Default);
    }
}
