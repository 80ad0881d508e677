// drives the crate's futures on the calling thread, which is how every operation gets its blocking
// form. the waker is a condvar signal in the style of the pollster crate.

use std::{
    future::Future,
    sync::{Arc, Condvar, Mutex},
    task::{Context, Poll, Wake, Waker},
    time::{Duration, Instant},
    pin::Pin,
};


// `Future` which can be abandoned before it resolves.
//
// abandoning is how a blocking call gives up when it times out. the output of abandoning carries
// whatever the operation still owns back to the caller (for example, an element that could not be
// sent). implementations must leave no trace of the operation in shared state once `abandon`
// returns, and must tolerate `abandon` being called after they resolved.
pub(crate) trait Abandon: Future + Unpin {
    type Abandoned;

    fn abandon(&mut self) -> Self::Abandoned;
}

// how long `poll` may block.
#[derive(Debug, Copy, Clone)]
pub(crate) enum Timeout {
    // wait as long as it takes.
    Never,
    // give up once this instant passes.
    At(Instant),
    // give up unless the first poll resolves.
    NonBlocking,
}

impl Timeout {
    // give up once `timeout` elapses from now. a timeout too long to represent as an instant
    // never elapses.
    pub(crate) fn after(timeout: Duration) -> Self {
        Instant::now().checked_add(timeout).map_or(Timeout::Never, Timeout::At)
    }
}

// poll the future until it resolves or the timeout is reached, in which case abandon it and return
// err.
pub(crate) fn poll<F: Abandon>(fut: &mut F, timeout: Timeout) -> Result<F::Output, F::Abandoned> {
    let signal = Arc::new(Signal {
        state: Mutex::new(State::Empty),
        cond: Condvar::new(),
    });
    let waker = Waker::from(Arc::clone(&signal));
    let mut cx = Context::from_waker(&waker);
    poll_inner(fut, &signal, &mut cx, timeout).ok_or_else(|| fut.abandon())
}

// the polling loop of `poll`. returns None on timeout, leaving the abandoning to the caller.
fn poll_inner<F: Future + Unpin>(
    fut: &mut F,
    signal: &Signal,
    cx: &mut Context,
    timeout: Timeout,
) -> Option<F::Output> {
    loop {
        if let Poll::Ready(output) = Pin::new(&mut *fut).poll(cx) {
            return Some(output);
        }

        let mut lock = signal.state.lock().unwrap();

        // woken while we were polling: re-poll straight away
        if let State::Notified = *lock {
            *lock = State::Empty;
            continue;
        }

        debug_assert!(matches!(*lock, State::Empty));
        if let Timeout::NonBlocking = timeout {
            return None;
        }
        *lock = State::Waiting;
        match timeout {
            Timeout::Never =>
                while let State::Waiting = *lock {
                    lock = signal.cond.wait(lock).unwrap();
                },

            // deadline is checked against the clock, condvar timeouts can be spurious
            Timeout::At(deadline) =>
                while let State::Waiting = *lock {
                    let Some(duration) = deadline.checked_duration_since(Instant::now())
                        else { break };
                    lock = signal.cond.wait_timeout(lock, duration).unwrap().0;
                },

            Timeout::NonBlocking => unreachable!(),
        }
        let notified = !matches!(*lock, State::Waiting);
        *lock = State::Empty;
        drop(lock);

        if !notified {
            // deadline reached without a notification. an operation that became ready right at
            // the deadline still wins.
            return match Pin::new(&mut *fut).poll(cx) {
                Poll::Ready(output) => Some(output),
                Poll::Pending => None,
            };
        }
    }
}

// progress of the thread blocked in `poll_inner`.
enum State {
    Empty,
    Waiting,
    Notified,
}

// synchronization signal, shared with every waker cloned from the polling context.
struct Signal {
    state: Mutex<State>,
    cond: Condvar,
}

impl Wake for Signal {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let mut lock = self.state.lock().unwrap();
        match *lock {
            State::Notified => (),
            State::Empty => {
                *lock = State::Notified;
            }
            State::Waiting => {
                *lock = State::Notified;
                self.cond.notify_one();
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        thread,
        time::Duration,
    };

    // resolves once its shared flag is set, remembering the last waker.
    struct Gate {
        shared: Arc<Mutex<(bool, Option<Waker>)>>,
        abandoned: bool,
    }

    impl Future for Gate {
        type Output = ();

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
            let mut lock = self.shared.lock().unwrap();
            if lock.0 {
                Poll::Ready(())
            } else {
                lock.1 = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    impl Abandon for Gate {
        type Abandoned = ();

        fn abandon(&mut self) -> Self::Abandoned {
            self.abandoned = true;
        }
    }

    fn gate() -> (Gate, Arc<Mutex<(bool, Option<Waker>)>>) {
        let shared = Arc::new(Mutex::new((false, None)));
        (Gate { shared: Arc::clone(&shared), abandoned: false }, shared)
    }

    fn open(shared: &Mutex<(bool, Option<Waker>)>) {
        let waker = {
            let mut lock = shared.lock().unwrap();
            lock.0 = true;
            lock.1.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    #[test]
    fn non_blocking_abandons_immediately() {
        let (mut fut, _shared) = gate();
        let start = Instant::now();
        assert!(poll(&mut fut, Timeout::NonBlocking).is_err());
        assert!(fut.abandoned);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn deadline_abandons() {
        let (mut fut, _shared) = gate();
        let start = Instant::now();
        let result = poll(&mut fut, Timeout::At(Instant::now() + Duration::from_millis(30)));
        assert!(result.is_err());
        assert!(fut.abandoned);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn unrepresentable_timeout_never_elapses() {
        assert!(matches!(Timeout::after(Duration::MAX), Timeout::Never));
        assert!(matches!(Timeout::after(Duration::from_secs(1)), Timeout::At(_)));
    }

    #[test]
    fn woken_from_other_thread() {
        let (mut fut, shared) = gate();
        let join = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            open(&shared);
        });
        assert!(poll(&mut fut, Timeout::Never).is_ok());
        assert!(!fut.abandoned);
        join.join().unwrap();
    }
}
