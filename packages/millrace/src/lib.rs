//! Task dispatch and lifecycle coordination.
//!
//! - [`bounded`] queues, with rendezvous behavior at capacity 0, connect producers to consumers.
//! - [`WorkerPool`] and [`TaskPool`] fan jobs out from a queue to a fixed set of workers.
//! - [`Ticker`] and [`Timer`] are time sources which can be stopped without leaking their thread.
//! - [`shutdown::channel`] pairs a controller with workers in a stop-and-acknowledge handshake,
//!   and [`WaitGroup`] joins a group of tasks.
//! - [`Select`] waits on whichever of several operations is ready first, with optional default
//!   and timeout branches.
//!
//! Every waiting operation is a future, and also offers blocking methods (`block`,
//! `block_timeout`, `block_deadline`, `try_now`) for use from plain threads.

#[macro_use]
extern crate tracing;

mod channel;
mod select;
mod timer;
mod wait_group;
mod pool;
pub mod shutdown;

pub use crate::{
    channel::api::*,
    select::Select,
    timer::{Ticker, Timer},
    wait_group::{WaitGroup, WaitGuard},
    pool::{Job, JobResult, JobError, PoolError, PoolConfig, WorkerPool, TaskPool},
    shutdown::{Shutdown, StopToken},
};

/// Error types
pub mod error {
    pub use crate::channel::error::*;
    pub use crate::pool::{JobError, PoolError};
}

/// Future types
pub mod future {
    pub use crate::{
        channel::api::future::*,
        wait_group::Wait,
        shutdown::{Stopped, Acknowledged},
    };
}
