use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use tracing::{debug, error, info, warn};

use super::job::{Job, JobResult, Request, Response};
use super::{unix_now, Worker};
use crate::engine::StorageEngine;
use crate::error::{Result, TableKvError};

/// number of workers a pool starts with unless configured otherwise
pub const DEFAULT_WORKERS: usize = 4;

/// number of jobs that may wait in the queue before submitters block
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A fixed set of [`Worker`]s fed from one shared, bounded job queue.
///
/// This uses the MPMC [`channel`] provided by the crossbeam crate: every connection submits
/// into the same queue and whichever worker is free takes the next job. Once the queue is full,
/// submitters block until a worker catches up.
///
/// The number of workers is fixed when the pool is created.
///
/// [`channel`]: https://docs.rs/crossbeam/0.8.1/crossbeam/channel/index.html
pub struct WorkerPool {
    /// the sending part of the queue, `None` once the pool is shut down
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    sweeper: Option<Sweeper>,
}

/// A cloneable handle for submitting jobs to a [`WorkerPool`]
#[derive(Clone, Debug)]
pub struct JobQueue {
    tx: Sender<Job>,
}

/// the periodic expiry sweep, running on its own thread
struct Sweeper {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl WorkerPool {
    /// Starts `workers` workers over `engine`, sharing a queue that holds up to `capacity`
    /// waiting jobs.
    ///
    /// # Errors
    /// returns [`TableKvError::Config`] if `workers` or `capacity` is 0, or an io error if a
    /// worker thread could not be spawned
    pub fn new<E: StorageEngine>(engine: E, workers: usize, capacity: usize) -> Result<Self> {
        if workers == 0 {
            return Err(TableKvError::Config("worker count must be at least 1".into()));
        }
        if capacity == 0 {
            return Err(TableKvError::Config("queue capacity must be at least 1".into()));
        }

        let (tx, rx) = channel::bounded::<Job>(capacity);
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let worker = Worker::new(id as u32, engine.clone());
            let jobs: Receiver<Job> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || worker.run(jobs))?;
            handles.push(handle);
        }
        info!(workers, capacity, "worker pool started");

        Ok(WorkerPool {
            tx: Some(tx),
            workers: handles,
            sweeper: None,
        })
    }

    /// returns a handle for submitting jobs
    ///
    /// # Errors
    /// [`TableKvError::PoolClosed`] after shutdown
    pub fn queue(&self) -> Result<JobQueue> {
        self.tx
            .as_ref()
            .map(|tx| JobQueue { tx: tx.clone() })
            .ok_or(TableKvError::PoolClosed)
    }

    /// number of worker threads
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Starts submitting an expiry sweep of up to `batch` records every `interval`.
    /// Replaces a sweeper started earlier.
    pub fn start_sweeper(&mut self, interval: Duration, batch: usize) -> Result<()> {
        self.stop_sweeper();
        let queue = self.queue()?;
        let (stop, stopped) = channel::bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("expiry-sweeper".into())
            .spawn(move || run_sweeper(queue, stopped, interval, batch))?;
        self.sweeper = Some(Sweeper { stop, handle });
        debug!(?interval, batch, "expiry sweeper started");
        Ok(())
    }

    /// Closes the queue and waits for every worker to finish its jobs and close its handles.
    ///
    /// Jobs already queued are still executed. Every [`JobQueue`] handed out must be dropped
    /// for the queue to close.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop_sweeper(&mut self) {
        if let Some(Sweeper { stop, handle }) = self.sweeper.take() {
            drop(stop);
            if handle.join().is_err() {
                error!("expiry sweeper panicked");
            }
        }
    }

    fn stop(&mut self) {
        self.stop_sweeper();
        if self.tx.take().is_none() {
            return;
        }
        debug!("closing job queue");
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("a worker thread panicked");
            }
        }
        info!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl JobQueue {
    /// Submits `request` and blocks until a worker has executed it.
    ///
    /// # Errors
    /// [`TableKvError::PoolClosed`] if every worker is gone or the worker dropped the job
    pub fn submit(&self, request: Request) -> Result<JobResult> {
        let (job, reply) = Job::new(request);
        self.tx.send(job).map_err(|_| TableKvError::PoolClosed)?;
        reply.recv().map_err(|_| TableKvError::PoolClosed)
    }
}

/// submits a sweep job on every tick until `stopped` is disconnected
fn run_sweeper(queue: JobQueue, stopped: Receiver<()>, interval: Duration, batch: usize) {
    let ticker = channel::tick(interval);
    loop {
        select! {
            recv(stopped) -> _ => break,
            recv(ticker) -> _ => {
                let request = Request::ExpireSweep { now: unix_now(), limit: batch };
                match queue.submit(request) {
                    Ok(Ok(Response::Swept(0))) => {}
                    Ok(Ok(Response::Swept(removed))) => info!(removed, "expired keys swept"),
                    Ok(Ok(other)) => warn!(?other, "unexpected sweep response"),
                    Ok(Err(e)) => warn!("expiry sweep failed: {}", e),
                    Err(_) => break,
                }
            }
        }
    }
    debug!("expiry sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;

    #[test]
    fn rejects_zero_workers_or_capacity() {
        assert!(WorkerPool::new(MemoryEngine::new(), 0, 8).is_err());
        assert!(WorkerPool::new(MemoryEngine::new(), 2, 0).is_err());
    }

    #[test]
    fn jobs_are_executed_and_replied() {
        let pool = WorkerPool::new(MemoryEngine::new(), 2, 4).unwrap();
        assert_eq!(pool.size(), 2);
        let queue = pool.queue().unwrap();

        let set = Request::Set { key: b"k".to_vec(), value: b"v".to_vec(), no_overwrite: false };
        assert_eq!(queue.submit(set).unwrap(), Ok(Response::Done));
        let get = Request::Get { key: b"k".to_vec() };
        assert_eq!(queue.submit(get).unwrap(), Ok(Response::Value(Some(b"v".to_vec()))));

        drop(queue);
        pool.shutdown();
    }

    #[test]
    fn shutdown_closes_every_handle() {
        let engine = MemoryEngine::new();
        let pool = WorkerPool::new(engine.clone(), 4, 16).unwrap();
        let queue = pool.queue().unwrap();
        for i in 0..32 {
            let key = format!("t{}:k", i % 5).into_bytes();
            queue.submit(Request::SetWithExpiry { key, value: b"v".to_vec(), ttl: 60 }).unwrap().unwrap();
        }
        assert!(engine.open_handles() > 0);

        drop(queue);
        pool.shutdown();
        assert_eq!(engine.open_handles(), 0);
        assert_eq!(engine.open_transactions(), 0);
    }

    #[test]
    fn sweeper_removes_expired_keys() {
        let engine = MemoryEngine::new();
        let mut pool = WorkerPool::new(engine.clone(), 1, 4).unwrap();
        let queue = pool.queue().unwrap();
        queue
            .submit(Request::SetWithExpiry { key: b"k".to_vec(), value: b"v".to_vec(), ttl: 1 })
            .unwrap()
            .unwrap();

        pool.start_sweeper(Duration::from_millis(50), 16).unwrap();
        let mut gone = false;
        for _ in 0..100 {
            thread::sleep(Duration::from_millis(50));
            if queue.submit(Request::Get { key: b"k".to_vec() }).unwrap() == Ok(Response::Value(None)) {
                gone = true;
                break;
            }
        }
        assert!(gone, "key was not swept");

        drop(queue);
        pool.shutdown();
        assert_eq!(engine.open_handles(), 0);
    }
}
