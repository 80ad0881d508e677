//! Periodic and one-shot time sources.
//!
//! Each source owns a producer thread which waits on a control queue with a deadline, so
//! stopping the source wakes the thread immediately rather than after the next tick.

use crate::{
    error::{TrySendError, WouldBlockError},
    Receiver,
    Sender,
    bounded,
    rendezvous,
};
use std::{
    convert::Infallible,
    io,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};


/// Periodic time source
///
/// Emits the scheduled time of each tick into a queue with a capacity of 1. If the consumer has
/// not taken the previous tick when the next is due, the new tick is dropped, and ticks missed
/// while the producer could not run are skipped rather than delivered in a burst. Over any
/// duration `D` a consumer thus receives at most `floor(D / interval) + 1` ticks.
///
/// Stopping the ticker, explicitly or by dropping it, closes its queue after discarding any
/// pending tick, so no tick is received after stop returns.
#[derive(Debug)]
pub struct Ticker {
    events: Receiver<Instant>,
    control: Sender<Duration>,
    thread: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Start ticking every `interval`, with the first tick one interval from now
    ///
    /// Panics if `interval` is zero. Errors if the producer thread cannot be spawned.
    #[track_caller]
    pub fn start(interval: Duration) -> io::Result<Self> {
        assert!(!interval.is_zero(), "non-positive interval for Ticker");
        let (events_send, events_recv) = bounded(1);
        let (control_send, control_recv) = rendezvous();
        let thread = thread::Builder::new()
            .name("millrace-ticker".into())
            .spawn(move || tick_loop(interval, control_recv, events_send))?;
        debug!(?interval, "ticker started");
        Ok(Ticker {
            events: events_recv,
            control: control_send,
            thread: Some(thread),
        })
    }

    /// The queue ticks are delivered into
    ///
    /// It is closed once the ticker is stopped.
    pub fn events(&self) -> &Receiver<Instant> {
        &self.events
    }

    /// Restart the schedule with a new interval, with the next tick one interval from now
    ///
    /// A tick that is already pending stays pending. Panics if `interval` is zero.
    #[track_caller]
    pub fn reset(&self, interval: Duration) {
        assert!(!interval.is_zero(), "non-positive interval for Ticker");
        if self.control.send(interval).block().is_err() {
            warn!("ticker thread exited, reset ignored");
        }
    }

    /// Stop ticking
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else { return };
        self.control.close();
        if thread.join().is_err() {
            error!("ticker thread panicked");
        }
        // discard the pending tick, leaving the queue closed and drained
        while let Ok(Some(_)) = self.events.try_recv() {}
        debug!("ticker stopped");
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// body of the ticker thread. exits once the control queue closes or the ticks have nowhere to go.
//
// a tick too far off to represent as an instant never comes, leaving only the control queue to
// wait on.
fn tick_loop(mut interval: Duration, control: Receiver<Duration>, events: Sender<Instant>) {
    let mut next = Instant::now().checked_add(interval);
    loop {
        let Some(tick) = next else {
            match control.recv().block() {
                Some(new_interval) => {
                    trace!(interval = ?new_interval, "ticker reset");
                    interval = new_interval;
                    next = Instant::now().checked_add(interval);
                    continue;
                }
                None => return,
            }
        };
        match control.recv().block_deadline(tick) {
            Ok(Some(new_interval)) => {
                trace!(interval = ?new_interval, "ticker reset");
                interval = new_interval;
                next = Instant::now().checked_add(interval);
            }
            Ok(None) => return,
            Err(WouldBlockError) => {
                match events.try_send(tick) {
                    Ok(()) => trace!("tick"),
                    Err(TrySendError::WouldBlock(_)) => trace!("tick dropped, consumer is behind"),
                    Err(TrySendError::NoReceivers(_)) => return,
                }
                next = next_after(tick, interval, Instant::now());
            }
        }
    }
}

// the first tick strictly after `now` on the schedule `prev + k * interval`, or None if that is
// too far off to represent.
fn next_after(prev: Instant, interval: Duration, now: Instant) -> Option<Instant> {
    let next = prev.checked_add(interval)?;
    if next > now {
        return Some(next);
    }
    let behind = now.duration_since(next).as_nanos();
    let skipped = behind / interval.as_nanos() + 1;
    trace!(?skipped, "ticks skipped");
    next.checked_add(interval.checked_mul(u32::try_from(skipped).ok()?)?)
}


/// One-shot time source
///
/// Delivers the scheduled time into [`fired`](Self::fired) once the duration elapses, unless
/// stopped first.
#[derive(Debug)]
pub struct Timer {
    fired: Receiver<Instant>,
    control: Sender<Infallible>,
    thread: Option<JoinHandle<bool>>,
}

impl Timer {
    /// Fire once `duration` from now
    ///
    /// A duration too long to represent as an instant never elapses. Errors if the producer
    /// thread cannot be spawned.
    pub fn after(duration: Duration) -> io::Result<Self> {
        let deadline = Instant::now().checked_add(duration);
        let (fired_send, fired_recv) = bounded(1);
        let (control_send, control_recv) = rendezvous::<Infallible>();
        let thread = thread::Builder::new()
            .name("millrace-timer".into())
            .spawn(move || {
                let Some(deadline) = deadline else {
                    // only stopping ends the wait
                    let stopped = control_recv.recv().block();
                    debug_assert!(stopped.is_none());
                    return false;
                };
                match control_recv.recv().block_deadline(deadline) {
                    Err(WouldBlockError) => {
                        trace!("timer fired");
                        fired_send.try_send(deadline).is_ok()
                    }
                    Ok(None) => false,
                    Ok(Some(never)) => match never {},
                }
            })?;
        Ok(Timer {
            fired: fired_recv,
            control: control_send,
            thread: Some(thread),
        })
    }

    /// The queue the firing is delivered into
    pub fn fired(&self) -> &Receiver<Instant> {
        &self.fired
    }

    /// Stop the timer
    ///
    /// Returns true if this stopped the timer before it fired, and false if it had already fired.
    pub fn stop(mut self) -> bool {
        !self.shutdown()
    }

    // returns whether the timer fired.
    fn shutdown(&mut self) -> bool {
        let Some(thread) = self.thread.take() else { return false };
        self.control.close();
        match thread.join() {
            Ok(fired) => fired,
            Err(_) => {
                error!("timer thread panicked");
                false
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
