//! Two-party stop request and acknowledgment.
//!
//! The controller holds a [`Shutdown`], the worker holds a [`StopToken`] passed to it explicitly.
//! The stop request is delivered by closing a queue, so every clone of the token observes it and
//! it can be observed at any suspension point that can select over queues. The acknowledgment is
//! delivered when every clone of the token has been [acknowledged](StopToken::acknowledge) or
//! dropped, so a worker that exits by any path, unwinding included, acknowledges.

use crate::{
    channel::polling::{Abandon, Timeout, poll},
    error::WouldBlockError,
    future::RecvFut,
    Receiver,
    Sender,
    rendezvous,
};
use std::{
    convert::Infallible,
    future::Future,
    pin::Pin,
    sync::Mutex,
    task::{Context, Poll},
    time::Duration,
};


/// Create a connected controller and stop token
pub fn channel() -> (Shutdown, StopToken) {
    let (request_send, request_recv) = rendezvous();
    let (ack_send, ack_recv) = rendezvous();
    let shutdown = Shutdown {
        request: Mutex::new(Some(request_send)),
        acks: ack_recv,
    };
    let token = StopToken {
        request: request_recv,
        _ack: ack_send,
    };
    (shutdown, token)
}


/// Controller side of a stop handshake
///
/// Dropping the controller without calling [`request_stop`](Self::request_stop) requests stop
/// as well.
#[derive(Debug)]
pub struct Shutdown {
    // the only sender of the request queue. taking and dropping it closes the queue.
    request: Mutex<Option<Sender<Infallible>>>,
    // closed once every token is gone.
    acks: Receiver<Infallible>,
}

impl Shutdown {
    /// Request stop
    ///
    /// The request is delivered at most once. Returns true if this call was the one to deliver
    /// it.
    pub fn request_stop(&self) -> bool {
        let sender = self.request.lock().unwrap().take();
        let delivered = sender.is_some();
        if delivered {
            debug!("stop requested");
        }
        // dropping the last sender closes the queue
        drop(sender);
        delivered
    }

    /// Whether stop has been requested
    pub fn is_stop_requested(&self) -> bool {
        self.request.lock().unwrap().is_none()
    }

    /// Create a future which resolves once every stop token has been acknowledged or dropped
    ///
    /// This does not request stop on its own.
    pub fn acknowledged(&self) -> Acknowledged {
        Acknowledged(self.acks.recv())
    }

    /// Request stop, then block until every stop token has been acknowledged or dropped
    pub fn stop_and_wait(self) {
        self.request_stop();
        self.acknowledged().block();
        debug!("stop acknowledged");
    }

    /// Request stop, then block until every stop token has been acknowledged or dropped, or the
    /// timeout elapses
    pub fn stop_and_wait_timeout(self, timeout: Duration) -> Result<(), WouldBlockError> {
        self.request_stop();
        let result = self.acknowledged().block_timeout(timeout);
        match result {
            Ok(()) => debug!("stop acknowledged"),
            Err(WouldBlockError) => warn!(?timeout, "timed out waiting for stop acknowledgment"),
        }
        result
    }
}


/// Worker side of a stop handshake
///
/// Pass it explicitly to every task that must observe the stop request. Clones observe the same
/// request, and the controller's acknowledgment wait covers every clone.
#[derive(Debug, Clone)]
pub struct StopToken {
    // closed when stop is requested. never carries a message.
    request: Receiver<Infallible>,
    // dropped to acknowledge. never sends.
    _ack: Sender<Infallible>,
}

impl StopToken {
    /// Whether stop has been requested
    pub fn is_stop_requested(&self) -> bool {
        matches!(self.request.try_recv(), Ok(None))
    }

    /// Create a future which resolves once stop has been requested
    ///
    /// This is the arm to select over alongside a task's normal work.
    pub fn stopped(&self) -> Stopped {
        Stopped(self.request.recv())
    }

    /// Block until stop has been requested
    pub fn wait_stopped(&self) {
        self.stopped().block();
    }

    /// Acknowledge the stop request
    ///
    /// Call this once all of the task's side effects are complete; the controller's wait returns
    /// once every clone of the token is acknowledged or dropped.
    pub fn acknowledge(self) {
        trace!("stop token acknowledged");
        drop(self);
    }
}


/// Future which resolves once stop has been requested, see [`StopToken::stopped`]
pub struct Stopped(RecvFut<Infallible>);

impl Future for Stopped {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        Pin::new(&mut self.get_mut().0).poll(cx).map(|msg| match msg {
            None => (),
            Some(never) => match never {},
        })
    }
}

impl Abandon for Stopped {
    type Abandoned = ();

    fn abandon(&mut self) -> Self::Abandoned {
        let _ = self.0.abort();
    }
}

impl Stopped {
    /// Block until stop has been requested
    pub fn block(&mut self) {
        poll(self, Timeout::Never).ok().expect("poll timed out with Timeout::Never")
    }

    /// Block until stop has been requested or the timeout elapses
    pub fn block_timeout(&mut self, timeout: Duration) -> Result<(), WouldBlockError> {
        poll(self, Timeout::after(timeout)).map_err(|()| WouldBlockError)
    }
}


/// Future which resolves once every stop token has been acknowledged or dropped, see
/// [`Shutdown::acknowledged`]
pub struct Acknowledged(RecvFut<Infallible>);

impl Future for Acknowledged {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        Pin::new(&mut self.get_mut().0).poll(cx).map(|msg| match msg {
            None => (),
            Some(never) => match never {},
        })
    }
}

impl Abandon for Acknowledged {
    type Abandoned = ();

    fn abandon(&mut self) -> Self::Abandoned {
        let _ = self.0.abort();
    }
}

impl Acknowledged {
    /// Block until acknowledged
    pub fn block(&mut self) {
        poll(self, Timeout::Never).ok().expect("poll timed out with Timeout::Never")
    }

    /// Block until acknowledged or the timeout elapses
    pub fn block_timeout(&mut self, timeout: Duration) -> Result<(), WouldBlockError> {
        poll(self, Timeout::after(timeout)).map_err(|()| WouldBlockError)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::Select;
    use std::{
        sync::{Arc, Mutex},
        thread,
        time::Instant,
    };

    #[test]
    fn join_waits_for_delayed_acknowledgment() {
        let (values_send, values_recv) = rendezvous::<u32>();
        let (shutdown, token) = channel();
        let log = Arc::new(Mutex::new(Vec::new()));

        let worker_log = Arc::clone(&log);
        let worker = thread::spawn(move || loop {
            let stop = Select::new()
                .recv(&values_recv, |value| {
                    worker_log.lock().unwrap().extend(value);
                    false
                })
                .stopped(&token, || true)
                .block();
            if stop {
                thread::sleep(Duration::from_millis(50));
                worker_log.lock().unwrap().push(u32::MAX);
                token.acknowledge();
                return;
            }
        });

        values_send.send(3).block().unwrap();
        while log.lock().unwrap().is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        let start = Instant::now();
        shutdown.stop_and_wait();
        assert!(start.elapsed() >= Duration::from_millis(50));
        // every side effect of the worker is visible once the join returns
        assert_eq!(*log.lock().unwrap(), vec![3, u32::MAX]);
        worker.join().unwrap();
    }

    #[test]
    fn signal_queues_never_buffer() {
        let (shutdown, token) = channel();
        assert_eq!(token.request.capacity(), 0);
        assert_eq!(shutdown.acks.capacity(), 0);
    }

    #[test]
    fn stop_request_delivered_once_to_every_clone() {
        let (shutdown, token) = channel();
        let token_2 = token.clone();
        assert!(!token.is_stop_requested());
        assert!(shutdown.request_stop());
        assert!(!shutdown.request_stop());
        assert!(shutdown.is_stop_requested());
        assert!(token.is_stop_requested());
        assert!(token_2.is_stop_requested());
        token_2.wait_stopped();
    }

    #[test]
    fn acknowledgment_waits_for_every_clone() {
        let (shutdown, token) = channel();
        let token_2 = token.clone();
        shutdown.request_stop();
        token.acknowledge();
        assert_eq!(
            shutdown.acknowledged().block_timeout(Duration::from_millis(20)),
            Err(WouldBlockError),
        );
        drop(token_2);
        assert_eq!(shutdown.stop_and_wait_timeout(Duration::from_secs(1)), Ok(()));
    }

    #[test]
    fn dropping_controller_requests_stop() {
        let (shutdown, token) = channel();
        drop(shutdown);
        assert!(token.is_stop_requested());
    }

    #[test]
    fn panicking_worker_still_acknowledges() {
        let (shutdown, token) = channel();
        let worker = thread::spawn(move || {
            token.wait_stopped();
            panic!("teardown failed");
        });
        assert_eq!(shutdown.stop_and_wait_timeout(Duration::from_secs(5)), Ok(()));
        assert!(worker.join().is_err());
    }

    #[test]
    fn unrepresentable_timeouts_wait_without_deadline() {
        let (shutdown, token) = channel();
        let worker = thread::spawn(move || {
            token.stopped().block_timeout(Duration::MAX).unwrap();
            token.acknowledge();
        });
        thread::sleep(Duration::from_millis(10));
        assert_eq!(shutdown.stop_and_wait_timeout(Duration::MAX), Ok(()));
        worker.join().unwrap();
    }

    #[test]
    fn stopped_times_out_until_requested() {
        let (shutdown, token) = channel();
        assert_eq!(
            token.stopped().block_timeout(Duration::from_millis(10)),
            Err(WouldBlockError),
        );
        shutdown.request_stop();
        assert_eq!(token.stopped().block_timeout(Duration::from_millis(10)), Ok(()));
    }

    #[test]
    fn ticker_consumer_runs_until_stopped() {
        use crate::Ticker;

        let (shutdown, token) = channel();
        let worker = thread::spawn(move || {
            let ticker = Ticker::start(Duration::from_millis(5)).unwrap();
            let mut ticks = 0;
            loop {
                let stop = Select::new()
                    .recv(ticker.events(), |tick| {
                        assert!(tick.is_some());
                        ticks += 1;
                        false
                    })
                    .stopped(&token, || true)
                    .block();
                if stop {
                    break;
                }
            }
            ticker.stop();
            token.acknowledge();
            ticks
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(shutdown.stop_and_wait_timeout(Duration::from_secs(5)), Ok(()));
        let ticks = worker.join().unwrap();
        assert!(ticks >= 1);
    }

    #[tokio::test]
    async fn async_handshake() {
        let (shutdown, token) = channel();
        let worker = tokio::spawn(async move {
            token.stopped().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.acknowledge();
        });
        let start = Instant::now();
        shutdown.request_stop();
        shutdown.acknowledged().await;
        assert!(start.elapsed() >= Duration::from_millis(20));
        worker.await.unwrap();
    }
}
