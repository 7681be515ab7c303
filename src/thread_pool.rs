//! Thread pools used for parallel cluster dispatch and queue workers.

use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error};

use crate::error::{PipeError, Result};

/// A pool of threads that run fire-and-forget jobs.
pub trait ThreadPool {
    /// creates a pool with the given number of threads
    fn new(threads: u32) -> Result<Self>
    where
        Self: Sized;

    /// Spawns a job into the pool.
    ///
    /// # Panics
    /// Panics if the pool has lost all of its threads.
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static;
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A thread pool backed by a shared crossbeam MPMC channel.
///
/// The pool itself is the single producer; worker threads are the consumers.
/// A worker that panics while running a job is replaced from its `Drop`
/// guard, so the pool keeps its capacity across panicking jobs.
pub struct SharedQueueThreadPool {
    tx: Sender<Job>,
}

impl ThreadPool for SharedQueueThreadPool {
    fn new(threads: u32) -> Result<Self> {
        let (tx, rx) = channel::unbounded::<Job>();
        for _ in 0..threads {
            let guard = WorkerGuard(rx.clone());
            thread::Builder::new().spawn(move || run_jobs(guard))?;
        }
        Ok(SharedQueueThreadPool { tx })
    }

    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(Box::new(job))
            .expect("there are no threads left in the pool");
    }
}

/// Receiving end of the job channel; respawns the worker thread on panic.
#[derive(Clone)]
struct WorkerGuard(Receiver<Job>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            debug!("worker panicked, starting a replacement thread");
            let guard = self.clone();
            if let Err(e) = thread::Builder::new().spawn(move || run_jobs(guard)) {
                error!("failed to respawn worker thread: {}", e);
            }
        }
    }
}

fn run_jobs(guard: WorkerGuard) {
    loop {
        match guard.0.recv() {
            Ok(job) => job(),
            Err(_) => {
                debug!("worker exiting, pool was dropped");
                break;
            }
        }
    }
}

/// A thread pool backed by rayon's work-stealing scheduler.
pub struct RayonThreadPool {
    pool: rayon::ThreadPool,
}

impl ThreadPool for RayonThreadPool {
    fn new(threads: u32) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads as usize)
            .build()
            .map_err(|e| PipeError::Config(format!("could not build thread pool: {}", e)))?;
        Ok(RayonThreadPool { pool })
    }

    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.spawn(job);
    }
}
