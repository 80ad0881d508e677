//! Fan-out of jobs from a shared queue to a fixed set of workers.
//!
//! Workers block on the job queue, run the processing function on each job, and publish exactly
//! one [`JobResult`] per job into the result queue. A worker exits once the job queue is closed
//! and drained, so closing the job queue is how the controller winds the pool down. Each worker
//! holds its own handle to the result queue, so once every worker has exited the result queue
//! closes too, and the controller can simply receive results until it sees `None`.

use crate::{
    error::WouldBlockError,
    wait_group::WaitGroup,
    Receiver,
    Sender,
};
use std::{
    any::Any,
    future::Future,
    io,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;


/// Unit of work sent to a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job<I> {
    /// Identifier copied into the job's result, for correlating results which arrive out of order
    pub id: u64,
    pub payload: I,
}

impl<I> Job<I> {
    pub fn new(id: u64, payload: I) -> Self {
        Job { id, payload }
    }
}

/// Result of processing one [`Job`]
#[derive(Debug)]
pub struct JobResult<O, E> {
    /// Id of the job this is the result of
    pub job_id: u64,
    /// Index of the worker which processed the job
    pub worker_id: usize,
    pub outcome: Result<O, JobError<E>>,
}

/// Processing failure of a single job
///
/// A failing job does not take its worker down: the failure is reported in the job's result and
/// the worker moves on to the next job.
#[derive(Error, Debug)]
pub enum JobError<E> {
    /// The processing function returned an error
    #[error("job failed: {0}")]
    Failed(E),
    /// The processing function panicked, with the panic message if it had one
    #[error("job panicked: {0}")]
    Panicked(String),
}

/// Error starting or joining a pool
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("a pool needs at least one worker")]
    NoWorkers,
    #[error("task pool must be spawned from within a tokio runtime")]
    NoRuntime,
    #[error("failed to spawn worker thread")]
    Spawn(#[source] io::Error),
    #[error("worker {0} panicked")]
    WorkerPanicked(usize),
}


/// Configuration for spawning a pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    workers: usize,
    name_prefix: String,
}

impl PoolConfig {
    /// Construct for a pool of `workers` workers
    ///
    /// Spawning errors with [`PoolError::NoWorkers`] if `workers` is zero.
    pub fn new(workers: usize) -> Self {
        PoolConfig {
            workers,
            name_prefix: "millrace-worker".into(),
        }
    }

    /// Prefix of worker thread names, followed by `-` and the worker index
    ///
    /// Defaults to `millrace-worker`. Has no effect on a [`TaskPool`].
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn name_prefix(&self) -> &str {
        &self.name_prefix
    }

    fn validate(&self) -> Result<(), PoolError> {
        if self.workers == 0 {
            return Err(PoolError::NoWorkers);
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    /// One worker per unit of available parallelism
    fn default() -> Self {
        PoolConfig::new(thread::available_parallelism().map(usize::from).unwrap_or(1))
    }
}


/// Pool of worker threads
#[derive(Debug)]
pub struct WorkerPool {
    threads: Vec<JoinHandle<()>>,
    group: WaitGroup,
}

impl WorkerPool {
    /// Spawn `config.workers()` worker threads consuming `jobs` and publishing into `results`
    ///
    /// `process` may fail or panic on a job; either becomes a [`JobError`] outcome. If spawning a
    /// thread fails, the workers already spawned keep running until the job queue is closed.
    pub fn spawn<I, O, E, F>(
        config: PoolConfig,
        jobs: Receiver<Job<I>>,
        results: Sender<JobResult<O, E>>,
        process: F,
    ) -> Result<Self, PoolError>
    where
        I: Send + 'static,
        O: Send + 'static,
        E: Send + 'static,
        F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
    {
        config.validate()?;
        let process = Arc::new(process);
        let group = WaitGroup::new();
        let mut threads = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            let guard = group.register();
            let jobs = jobs.clone();
            let results = results.clone();
            let process = Arc::clone(&process);
            let thread = thread::Builder::new()
                .name(format!("{}-{}", config.name_prefix, worker_id))
                .spawn(move || {
                    let _guard = guard;
                    run_worker(worker_id, &jobs, &results, &*process);
                })
                .map_err(|e| {
                    error!(worker_id, error = %e, "failed to spawn worker thread");
                    PoolError::Spawn(e)
                })?;
            threads.push(thread);
        }
        debug!(workers = config.workers, "worker pool started");
        Ok(WorkerPool { threads, group })
    }

    /// Number of workers
    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Wait group counting the workers which have not yet exited
    pub fn wait_group(&self) -> &WaitGroup {
        &self.group
    }

    /// Block until every worker has exited and been joined
    ///
    /// Only returns once the job queue is closed and drained. Errors if a worker thread panicked
    /// outside of a job, which can only happen through misuse of the result queue, such as
    /// closing it while workers are still sending.
    pub fn wait_all(self) -> Result<(), PoolError> {
        let mut result = Ok(());
        for (worker_id, thread) in self.threads.into_iter().enumerate() {
            if thread.join().is_err() {
                error!(worker_id, "worker thread panicked");
                result = Err(PoolError::WorkerPanicked(worker_id));
            }
        }
        debug!("worker pool joined");
        result
    }

    /// Block until every worker has exited or the timeout elapses
    pub fn wait_all_timeout(&self, timeout: Duration) -> Result<(), WouldBlockError> {
        self.group.wait_all_timeout(timeout)
    }
}

// body of a worker thread.
fn run_worker<I, O, E, F>(
    worker_id: usize,
    jobs: &Receiver<Job<I>>,
    results: &Sender<JobResult<O, E>>,
    process: &F,
)
where
    F: Fn(I) -> Result<O, E>,
{
    debug!(worker_id, "worker started");
    for job in jobs {
        let outcome = match catch_unwind(AssertUnwindSafe(|| process(job.payload))) {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(JobError::Failed(e)),
            Err(panic) => Err(JobError::Panicked(panic_message(&*panic))),
        };
        trace!(worker_id, job_id = job.id, ok = outcome.is_ok(), "job processed");
        let result = JobResult { job_id: job.id, worker_id, outcome };
        if results.send(result).block().is_err() {
            warn!(worker_id, "result queue has no receivers, worker exiting");
            return;
        }
    }
    debug!(worker_id, "job queue closed, worker exiting");
}


/// Pool of workers running as tokio tasks
///
/// Same contract as [`WorkerPool`], with an async processing function.
#[derive(Debug)]
pub struct TaskPool {
    tasks: Vec<tokio::task::JoinHandle<()>>,
    group: WaitGroup,
}

impl TaskPool {
    /// Spawn `config.workers()` worker tasks onto the current tokio runtime
    ///
    /// Each job is processed in its own task, so a panicking job becomes a
    /// [`JobError::Panicked`] outcome. Errors with [`PoolError::NoRuntime`] if called outside of a
    /// tokio runtime.
    pub fn spawn<I, O, E, F, Fut>(
        config: PoolConfig,
        jobs: Receiver<Job<I>>,
        results: Sender<JobResult<O, E>>,
        process: F,
    ) -> Result<Self, PoolError>
    where
        I: Send + 'static,
        O: Send + 'static,
        E: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
    {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PoolError::NoRuntime)?;
        let process = Arc::new(process);
        let group = WaitGroup::new();
        let tasks = (0..config.workers)
            .map(|worker_id| {
                let guard = group.register();
                let jobs = jobs.clone();
                let results = results.clone();
                let process = Arc::clone(&process);
                runtime.spawn(async move {
                    let _guard = guard;
                    run_task_worker(worker_id, jobs, results, process).await;
                })
            })
            .collect();
        debug!(workers = config.workers, "task pool started");
        Ok(TaskPool { tasks, group })
    }

    /// Number of workers
    pub fn size(&self) -> usize {
        self.tasks.len()
    }

    /// Wait group counting the workers which have not yet exited
    pub fn wait_group(&self) -> &WaitGroup {
        &self.group
    }

    /// Wait until every worker has exited
    pub async fn wait_all(self) -> Result<(), PoolError> {
        let mut result = Ok(());
        for (worker_id, task) in self.tasks.into_iter().enumerate() {
            match task.await {
                Ok(()) => (),
                Err(e) if e.is_panic() => {
                    error!(worker_id, "worker task panicked");
                    result = Err(PoolError::WorkerPanicked(worker_id));
                }
                Err(_) => debug!(worker_id, "worker task cancelled"),
            }
        }
        debug!("task pool joined");
        result
    }
}

// body of a worker task.
async fn run_task_worker<I, O, E, F, Fut>(
    worker_id: usize,
    jobs: Receiver<Job<I>>,
    results: Sender<JobResult<O, E>>,
    process: Arc<F>,
)
where
    O: Send + 'static,
    E: Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
{
    debug!(worker_id, "worker started");
    while let Some(job) = jobs.recv().await {
        let outcome = match tokio::spawn((*process)(job.payload)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(JobError::Failed(e)),
            Err(e) if e.is_panic() => Err(JobError::Panicked(panic_message(&*e.into_panic()))),
            Err(_) => {
                debug!(worker_id, job_id = job.id, "job cancelled, runtime shutting down");
                return;
            }
        };
        trace!(worker_id, job_id = job.id, ok = outcome.is_ok(), "job processed");
        let result = JobResult { job_id: job.id, worker_id, outcome };
        if results.send(result).await.is_err() {
            warn!(worker_id, "result queue has no receivers, worker exiting");
            return;
        }
    }
    debug!(worker_id, "job queue closed, worker exiting");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("non-string panic payload")
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded;
    use anyhow::anyhow;
    use rand::prelude::*;
    use rand_pcg::Pcg32;
    use std::{collections::HashSet, time::Instant};

    fn new_rng() -> impl Rng {
        Pcg32::from_seed(0xdeadbeefdeadbeefdeadbeefdeadbeefu128.to_le_bytes())
    }

    #[test]
    fn every_job_yields_exactly_one_result() {
        let mut rng = new_rng();
        for _ in 0..20 {
            let n_jobs = rng.gen_range(0..300u64);
            let n_workers = rng.gen_range(1..8);
            let (jobs_send, jobs_recv) = bounded(rng.gen_range(0..4));
            let (results_send, results_recv) = bounded(rng.gen_range(0..4));

            let pool = WorkerPool::spawn(
                PoolConfig::new(n_workers),
                jobs_recv,
                results_send,
                |n: u64| Ok::<_, anyhow::Error>(n * 2),
            ).unwrap();
            assert_eq!(pool.size(), n_workers);

            let producer = thread::spawn(move || {
                for id in 0..n_jobs {
                    jobs_send.send(Job::new(id, id)).block().unwrap();
                }
                jobs_send.close();
            });

            let mut seen = HashSet::new();
            for result in &results_recv {
                assert!(result.worker_id < n_workers);
                assert_eq!(result.outcome.unwrap(), result.job_id * 2);
                assert!(seen.insert(result.job_id), "duplicate result for {}", result.job_id);
            }
            assert_eq!(seen, (0..n_jobs).collect::<HashSet<_>>());
            producer.join().unwrap();
            pool.wait_all().unwrap();
        }
    }

    #[test]
    fn failures_and_panics_become_outcomes() {
        let (jobs_send, jobs_recv) = bounded(10);
        let (results_send, results_recv) = bounded(10);
        let pool = WorkerPool::spawn(PoolConfig::new(2), jobs_recv, results_send, |n: u32| {
            match n {
                7 => panic!("seven is unlucky"),
                n if n % 3 == 0 => Err(anyhow!("{} is divisible by three", n)),
                n => Ok(n),
            }
        }).unwrap();
        for id in 0..10 {
            jobs_send.send(Job::new(id as u64, id)).block().unwrap();
        }
        jobs_send.close();

        let mut results = results_recv.iter().collect::<Vec<_>>();
        results.sort_by_key(|result| result.job_id);
        assert_eq!(results.len(), 10);
        for result in results {
            match (result.job_id, result.outcome) {
                (7, Err(JobError::Panicked(msg))) => assert_eq!(msg, "seven is unlucky"),
                (id, Err(JobError::Failed(e))) => {
                    assert_eq!(id % 3, 0);
                    assert!(e.to_string().contains("divisible"));
                }
                (id, Ok(n)) => assert_eq!(id, n as u64),
                (id, outcome) => panic!("unexpected outcome for job {}: {:?}", id, outcome),
            }
        }
        pool.wait_all().unwrap();
    }

    #[test]
    fn close_then_join_terminates() {
        let (jobs_send, jobs_recv) = bounded::<Job<()>>(1);
        let (results_send, results_recv) = bounded::<JobResult<(), ()>>(1);
        let pool = WorkerPool::spawn(PoolConfig::new(4), jobs_recv, results_send, Ok).unwrap();
        assert_eq!(pool.wait_group().count(), 4);
        assert_eq!(pool.wait_all_timeout(Duration::from_millis(20)), Err(WouldBlockError));

        jobs_send.close();
        pool.wait_all_timeout(Duration::from_secs(5)).unwrap();
        pool.wait_all().unwrap();
        // every worker dropped its result handle
        assert!(results_recv.recv().block().is_none());
    }

    #[test]
    fn idle_workers_block() {
        let (jobs_send, jobs_recv) = bounded::<Job<u8>>(1);
        let (results_send, results_recv) = bounded(1);
        let pool = WorkerPool::spawn(PoolConfig::new(2), jobs_recv, results_send, Ok::<_, ()>)
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        jobs_send.send(Job::new(1, 5)).block().unwrap();
        let start = Instant::now();
        let result = results_recv.recv().block_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(result.outcome.unwrap(), 5);
        drop(jobs_send);
        pool.wait_all().unwrap();
    }

    #[test]
    fn workers_named_with_prefix() {
        let (jobs_send, jobs_recv) = bounded(4);
        let (results_send, results_recv) = bounded(4);
        let config = PoolConfig::new(3).with_name_prefix("resizer");
        let pool = WorkerPool::spawn(config, jobs_recv, results_send, |()| {
            Ok::<_, ()>(thread::current().name().map(String::from))
        }).unwrap();
        jobs_send.send(Job::new(0, ())).block().unwrap();
        jobs_send.close();
        let name = results_recv.recv().block().unwrap().outcome.unwrap().unwrap();
        assert!(name.starts_with("resizer-"), "{}", name);
        pool.wait_all().unwrap();
    }

    #[test]
    fn zero_workers_rejected() {
        let (_jobs_send, jobs_recv) = bounded::<Job<()>>(1);
        let (results_send, _results_recv) = bounded::<JobResult<(), ()>>(1);
        let result = WorkerPool::spawn(PoolConfig::new(0), jobs_recv, results_send, Ok);
        assert!(matches!(result, Err(PoolError::NoWorkers)));
    }

    #[test]
    fn dropped_result_receiver_stops_workers() {
        let (jobs_send, jobs_recv) = bounded(4);
        let (results_send, results_recv) = bounded::<JobResult<u8, ()>>(0);
        let pool = WorkerPool::spawn(PoolConfig::new(2), jobs_recv, results_send, Ok).unwrap();
        drop(results_recv);
        let _ = jobs_send.send(Job::new(0, 1)).block();
        let _ = jobs_send.send(Job::new(1, 2)).block();
        pool.wait_all_timeout(Duration::from_secs(5)).unwrap();
        pool.wait_all().unwrap();
    }

    #[test]
    fn task_pool_requires_runtime() {
        let (_jobs_send, jobs_recv) = bounded::<Job<()>>(1);
        let (results_send, _results_recv) = bounded::<JobResult<(), ()>>(1);
        let result = TaskPool::spawn(PoolConfig::new(1), jobs_recv, results_send, |()| async {
            Ok(())
        });
        assert!(matches!(result, Err(PoolError::NoRuntime)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn task_pool_processes_every_job() {
        let (jobs_send, jobs_recv) = bounded(2);
        let (results_send, results_recv) = bounded(2);
        let pool = TaskPool::spawn(PoolConfig::new(3), jobs_recv, results_send, |n: u64| async move {
            tokio::time::sleep(Duration::from_millis(n % 5)).await;
            if n == 13 {
                panic!("thirteen");
            }
            Ok::<_, anyhow::Error>(n + 1)
        }).unwrap();

        let producer = tokio::spawn(async move {
            for id in 0..50 {
                jobs_send.send(Job::new(id, id)).await.unwrap();
            }
        });

        let mut seen = HashSet::new();
        while let Some(result) = results_recv.recv().await {
            match result.outcome {
                Ok(n) => assert_eq!(n, result.job_id + 1),
                Err(JobError::Panicked(msg)) => {
                    assert_eq!(result.job_id, 13);
                    assert_eq!(msg, "thirteen");
                }
                Err(e) => panic!("unexpected error {}", e),
            }
            assert!(seen.insert(result.job_id));
        }
        assert_eq!(seen.len(), 50);
        producer.await.unwrap();
        pool.wait_all().await.unwrap();
    }
}
