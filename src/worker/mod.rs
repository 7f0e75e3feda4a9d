//! The workers: the only code that touches storage handles.
//!
//! Each [`Worker`] runs on its own thread, owns a private [`HandleCache`] and
//! [`ExpirationCoordinator`], and executes one [`Job`] at a time from the queue it shares with
//! the other workers of the [`WorkerPool`]. Handles are never shared between workers, so none
//! of this needs a lock. Two workers may still hold handles onto the same table at once;
//! consistency between them is left to the storage engine.

use std::panic::{self, AssertUnwindSafe};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam::channel::Receiver;
use tracing::{debug, error, info, info_span};

use crate::engine::{Isolation, StorageEngine};
use crate::error::{JobError, StoreError, StoreResult};
use crate::router::{self, Table};

mod cache;
mod expire;
mod job;
mod pool;

pub use self::cache::HandleCache;
pub use self::expire::{ExpirationCoordinator, ExpiryRecord};
pub use self::job::{Job, JobResult, Request, Response};
pub use self::pool::{JobQueue, WorkerPool, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS};

/// lifecycle of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// taking jobs off the queue
    Running,
    /// the queue is closed, no more jobs will arrive
    Draining,
    /// every cached handle is closed
    Stopped,
}

/// A single storage worker.
pub struct Worker<E: StorageEngine> {
    id: u32,
    state: WorkerState,
    engine: E,
    cache: HandleCache<E>,
    expiry: ExpirationCoordinator,
}

/// A transaction that aborts itself unless it is committed
struct Transaction<'a, E: StorageEngine> {
    engine: &'a E,
    txn: Option<E::Txn>,
}

impl<'a, E: StorageEngine> Transaction<'a, E> {
    fn begin(engine: &'a E, isolation: Isolation) -> StoreResult<Self> {
        let txn = engine.begin(isolation)?;
        Ok(Transaction {
            engine,
            txn: Some(txn),
        })
    }

    fn txn(&mut self) -> &mut E::Txn {
        self.txn.as_mut().expect("transaction used after commit")
    }

    fn commit(mut self) -> StoreResult<()> {
        match self.txn.take() {
            Some(txn) => self.engine.commit(txn),
            None => Ok(()),
        }
    }
}

impl<'a, E: StorageEngine> Drop for Transaction<'a, E> {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            self.engine.abort(txn);
        }
    }
}

impl<E: StorageEngine> Worker<E> {
    /// creates worker `id` over `engine`. No handle is opened until a job needs it.
    pub fn new(id: u32, engine: E) -> Self {
        Worker {
            id,
            state: WorkerState::Running,
            cache: HandleCache::new(engine.clone()),
            engine,
            expiry: ExpirationCoordinator::new(id),
        }
    }

    /// the worker's id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// the worker's current lifecycle state
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Takes jobs off `jobs` until the queue is closed and empty, then closes every handle.
    ///
    /// A panic while executing a job is contained: the job's reply channel is dropped, the
    /// handle cache is flushed, and the worker moves on to the next job.
    pub fn run(mut self, jobs: Receiver<Job>) {
        let span = info_span!("worker", id = self.id);
        let _entered = span.enter();
        info!("worker started");
        while let Ok(Job { request, reply_to }) = jobs.recv() {
            debug!(?request, "received a new job");
            match panic::catch_unwind(AssertUnwindSafe(|| self.execute(request))) {
                Ok(result) => {
                    if reply_to.send(result).is_err() {
                        debug!("requester went away before the reply");
                    }
                }
                Err(_) => {
                    error!("job panicked, dropping cached handles");
                    self.cache.close_all();
                }
            }
        }
        self.stop();
    }

    fn stop(&mut self) {
        self.state = WorkerState::Draining;
        debug!(worker = self.id, handles = self.cache.len(), "queue closed, closing handles");
        self.cache.close_all();
        self.state = WorkerState::Stopped;
        info!(worker = self.id, "worker stopped");
    }

    /// executes one request against the storage engine
    pub fn execute(&mut self, request: Request) -> JobResult {
        match request {
            Request::Get { key } => self.get(&key),
            Request::Set { key, value, no_overwrite } => self.set(&key, &value, no_overwrite),
            Request::SetWithExpiry { key, value, ttl } => self.set_with_expiry(&key, &value, ttl),
            Request::IncrementBy { key, delta } => self.increment_by(&key, delta),
            Request::Delete { key } => self.delete(&key),
            Request::ExpireSweep { now, limit } => self.sweep(now, limit),
        }
    }

    fn get(&mut self, key: &[u8]) -> JobResult {
        let route = router::split(key);
        let result = self
            .cache
            .get(&route.table)
            .and_then(|handle| self.engine.get(&handle, None, &route.local_key, false));

        match result {
            Ok(value) => Ok(Response::Value(Some(value))),
            Err(StoreError::NotFound) => Ok(Response::Value(None)),
            Err(e) => {
                self.cache.invalidate(&route.table);
                Err(e.into())
            }
        }
    }

    fn set(&mut self, key: &[u8], value: &[u8], no_overwrite: bool) -> JobResult {
        let route = router::split(key);
        let result = self
            .cache
            .get(&route.table)
            .and_then(|handle| self.engine.put(&handle, None, &route.local_key, value, no_overwrite));

        match result {
            Ok(()) => Ok(Response::Done),
            Err(e) => {
                self.cache.invalidate_if_dead(&route.table, e);
                Err(e.into())
            }
        }
    }

    fn set_with_expiry(&mut self, key: &[u8], value: &[u8], ttl: u32) -> JobResult {
        let route = router::split(key);
        let mut tx = Transaction::begin(&self.engine, Isolation::ReadUncommitted)?;

        self.expiry
            .record_expiry(&self.engine, &mut self.cache, tx.txn(), &route, ttl, unix_now())?;

        let result = self
            .cache
            .get(&route.table)
            .and_then(|handle| self.engine.put(&handle, Some(tx.txn()), &route.local_key, value, false));
        if let Err(e) = result {
            self.cache.invalidate_if_dead(&route.table, e);
            return Err(e.into());
        }

        if let Err(e) = tx.commit() {
            self.invalidate_all_if_dead(&[&route.table, &Table::ExpireByTime, &Table::ExpireIndex], e);
            return Err(e.into());
        }
        Ok(Response::Done)
    }

    fn increment_by(&mut self, key: &[u8], delta: i64) -> JobResult {
        let route = router::split(key);
        let mut tx = Transaction::begin(&self.engine, Isolation::ReadCommitted)?;
        let handle = self.cache.get(&route.table)?;

        let current = match self.engine.get(&handle, Some(tx.txn()), &route.local_key, true) {
            Ok(value) => parse_integer(&value).ok_or(JobError::NotAnInteger)?,
            Err(StoreError::NotFound) => 0,
            Err(e) => {
                self.cache.invalidate_if_dead(&route.table, e);
                return Err(e.into());
            }
        };
        let next = current.wrapping_add(delta);

        let written = self
            .engine
            .put(&handle, Some(tx.txn()), &route.local_key, next.to_string().as_bytes(), false)
            .and_then(|()| tx.commit());
        if let Err(e) = written {
            self.cache.invalidate_if_dead(&route.table, e);
            return Err(e.into());
        }
        Ok(Response::Integer(next))
    }

    fn delete(&mut self, key: &[u8]) -> JobResult {
        let route = router::split(key);
        let mut tx = Transaction::begin(&self.engine, Isolation::ReadCommitted)?;

        let removed = match self
            .cache
            .get(&route.table)
            .and_then(|handle| self.engine.delete(&handle, Some(tx.txn()), &route.local_key))
        {
            Ok(()) => true,
            Err(StoreError::NotFound) => false,
            Err(e) => {
                self.cache.invalidate_if_dead(&route.table, e);
                return Err(e.into());
            }
        };
        self.expiry.clear(&self.engine, &mut self.cache, tx.txn(), &route)?;

        if let Err(e) = tx.commit() {
            self.invalidate_all_if_dead(&[&route.table, &Table::ExpireIndex], e);
            return Err(e.into());
        }
        Ok(Response::Removed(removed))
    }

    fn sweep(&mut self, now: u64, limit: usize) -> JobResult {
        let mut tx = Transaction::begin(&self.engine, Isolation::ReadCommitted)?;
        let expired = self.expiry.sweep(&self.engine, &mut self.cache, tx.txn(), now, limit)?;

        let mut removed = 0;
        let mut touched = vec![Table::ExpireByTime, Table::ExpireIndex];
        for route in expired {
            let result = self
                .cache
                .get(&route.table)
                .and_then(|handle| self.engine.delete(&handle, Some(tx.txn()), &route.local_key));
            match result {
                Ok(()) => removed += 1,
                Err(StoreError::NotFound) => {}
                Err(e) => {
                    self.cache.invalidate_if_dead(&route.table, e);
                    return Err(e.into());
                }
            }
            touched.push(route.table);
        }

        if let Err(e) = tx.commit() {
            let touched: Vec<&Table> = touched.iter().collect();
            self.invalidate_all_if_dead(&touched, e);
            return Err(e.into());
        }
        if removed > 0 {
            debug!(worker = self.id, removed, "expired keys removed");
        }
        Ok(Response::Swept(removed))
    }

    fn invalidate_all_if_dead(&mut self, tables: &[&Table], err: StoreError) {
        for table in tables {
            self.cache.invalidate_if_dead(table, err);
        }
    }
}

/// parses a stored value as a base-10 signed 64 bit integer
fn parse_integer(value: &[u8]) -> Option<i64> {
    std::str::from_utf8(value).ok()?.parse().ok()
}

/// seconds since the unix epoch
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MemoryEngine, SledEngine};

    fn worker() -> (MemoryEngine, Worker<MemoryEngine>) {
        let engine = MemoryEngine::new();
        (engine.clone(), Worker::new(0, engine))
    }

    fn get(key: &[u8]) -> Request {
        Request::Get { key: key.to_vec() }
    }

    fn set(key: &[u8], value: &[u8]) -> Request {
        Request::Set { key: key.to_vec(), value: value.to_vec(), no_overwrite: false }
    }

    fn incr(key: &[u8], delta: i64) -> Request {
        Request::IncrementBy { key: key.to_vec(), delta }
    }

    #[test]
    fn get_of_absent_key_is_no_value() {
        let (_, mut w) = worker();
        assert_eq!(w.execute(get(b"nothing")), Ok(Response::Value(None)));
    }

    #[test]
    fn set_then_get_in_named_table() {
        let (engine, mut w) = worker();
        assert_eq!(w.execute(set(b"users:1", b"ann")), Ok(Response::Done));
        assert_eq!(w.execute(get(b"users:1")), Ok(Response::Value(Some(b"ann".to_vec()))));
        assert_eq!(engine.peek(b"users.db", b"1"), Some(b"ann".to_vec()));
    }

    #[test]
    fn set_no_overwrite_keeps_first_value() {
        let (_, mut w) = worker();
        let setnx = |v: &[u8]| Request::Set { key: b"k".to_vec(), value: v.to_vec(), no_overwrite: true };
        assert_eq!(w.execute(setnx(b"v1")), Ok(Response::Done));
        assert_eq!(w.execute(setnx(b"v2")), Err(JobError::Store(StoreError::KeyExists)));
        assert_eq!(w.execute(get(b"k")), Ok(Response::Value(Some(b"v1".to_vec()))));
    }

    #[test]
    fn increment_from_absent_then_negative() {
        let (engine, mut w) = worker();
        assert_eq!(w.execute(incr(b"n", 5)), Ok(Response::Integer(5)));
        assert_eq!(w.execute(incr(b"n", -3)), Ok(Response::Integer(2)));
        assert_eq!(engine.open_transactions(), 0);
    }

    #[test]
    fn increment_wraps_on_overflow() {
        let (_, mut w) = worker();
        w.execute(set(b"n", i64::MAX.to_string().as_bytes())).unwrap();
        assert_eq!(w.execute(incr(b"n", 1)), Ok(Response::Integer(i64::MIN)));
    }

    #[test]
    fn increment_of_non_integer_leaves_value_and_aborts() {
        let (engine, mut w) = worker();
        w.execute(set(b"n", b"abc")).unwrap();
        assert_eq!(w.execute(incr(b"n", 1)), Err(JobError::NotAnInteger));
        assert_eq!(w.execute(get(b"n")), Ok(Response::Value(Some(b"abc".to_vec()))));
        assert_eq!(engine.open_transactions(), 0);
    }

    #[test]
    fn set_with_expiry_writes_value_and_both_indexes() {
        let (engine, mut w) = worker();
        let req = Request::SetWithExpiry { key: b"s:k".to_vec(), value: b"v".to_vec(), ttl: 30 };
        assert_eq!(w.execute(req), Ok(Response::Done));
        assert_eq!(engine.peek(b"s.db", b"k"), Some(b"v".to_vec()));
        assert_eq!(engine.len_of(b"__expire"), 1);
        assert!(engine.peek(b"__expire.index", &router::split(b"s:k").identity()).is_some());
        assert_eq!(engine.open_transactions(), 0);
    }

    #[test]
    fn replication_dead_evicts_and_next_request_reopens() {
        let (engine, mut w) = worker();
        w.execute(set(b"t:k", b"v")).unwrap();
        assert_eq!(engine.open_handles_for(b"t.db"), 1);

        engine.failover();
        assert_eq!(w.execute(set(b"t:k", b"w")), Err(JobError::Store(StoreError::ReplicationDead)));
        assert_eq!(engine.open_handles_for(b"t.db"), 0);

        assert_eq!(w.execute(set(b"t:k", b"w")), Ok(Response::Done));
        assert_eq!(w.execute(get(b"t:k")), Ok(Response::Value(Some(b"w".to_vec()))));
    }

    #[test]
    fn failed_set_with_expiry_aborts_everything() {
        let (engine, mut w) = worker();
        w.execute(set(b"t:warm", b"v")).unwrap();
        w.execute(Request::SetWithExpiry { key: b"t:a".to_vec(), value: b"1".to_vec(), ttl: 5 }).unwrap();

        engine.failover();
        let req = Request::SetWithExpiry { key: b"t:b".to_vec(), value: b"2".to_vec(), ttl: 5 };
        assert_eq!(w.execute(req), Err(JobError::Store(StoreError::ReplicationDead)));
        assert_eq!(engine.open_transactions(), 0);
        assert_eq!(engine.peek(b"t.db", b"b"), None);
        assert_eq!(engine.len_of(b"__expire"), 1);
        assert_eq!(engine.open_handles_for(b"__expire"), 0);
        assert_eq!(engine.open_handles_for(b"__expire.index"), 0);
    }

    #[test]
    fn delete_removes_value_and_pending_expiry() {
        let (engine, mut w) = worker();
        w.execute(Request::SetWithExpiry { key: b"k".to_vec(), value: b"v".to_vec(), ttl: 5 }).unwrap();
        assert_eq!(w.execute(Request::Delete { key: b"k".to_vec() }), Ok(Response::Removed(true)));
        assert_eq!(w.execute(Request::Delete { key: b"k".to_vec() }), Ok(Response::Removed(false)));
        assert!(engine.peek(b"__expire.index", &router::split(b"k").identity()).is_none());
    }

    #[test]
    fn sweep_removes_only_expired_keys() {
        let (_, mut w) = worker();
        let now = unix_now();
        w.execute(Request::SetWithExpiry { key: b"short".to_vec(), value: b"v".to_vec(), ttl: 1 }).unwrap();
        w.execute(Request::SetWithExpiry { key: b"t:long".to_vec(), value: b"v".to_vec(), ttl: 3600 }).unwrap();

        let swept = w.execute(Request::ExpireSweep { now: now + 10, limit: 100 });
        assert_eq!(swept, Ok(Response::Swept(1)));
        assert_eq!(w.execute(get(b"short")), Ok(Response::Value(None)));
        assert_eq!(w.execute(get(b"t:long")), Ok(Response::Value(Some(b"v".to_vec()))));
    }

    fn setex(key: &[u8], value: &[u8], ttl: u32) -> Request {
        Request::SetWithExpiry { key: key.to_vec(), value: value.to_vec(), ttl }
    }

    #[test]
    fn newer_ttl_under_another_spelling_supersedes() {
        let (_, mut w) = worker();
        let now = unix_now();
        w.execute(setex(b"x", b"old", 1)).unwrap();
        w.execute(setex(b"__default:x", b"new", 3600)).unwrap();

        assert_eq!(w.execute(Request::ExpireSweep { now: now + 10, limit: 100 }), Ok(Response::Swept(0)));
        assert_eq!(w.execute(get(b"x")), Ok(Response::Value(Some(b"new".to_vec()))));
    }

    #[test]
    fn delete_under_another_spelling_clears_pending_expiry() {
        let (_, mut w) = worker();
        let now = unix_now();
        w.execute(setex(b"x", b"v", 1)).unwrap();
        assert_eq!(w.execute(Request::Delete { key: b":x".to_vec() }), Ok(Response::Removed(true)));
        w.execute(set(b"x", b"fresh")).unwrap();

        w.execute(setex(b"t:", b"v", 1)).unwrap();
        assert_eq!(w.execute(Request::Delete { key: b"t:\0".to_vec() }), Ok(Response::Removed(true)));
        w.execute(set(b"t:", b"fresh")).unwrap();

        assert_eq!(w.execute(Request::ExpireSweep { now: now + 10, limit: 100 }), Ok(Response::Swept(0)));
        assert_eq!(w.execute(get(b"x")), Ok(Response::Value(Some(b"fresh".to_vec()))));
        assert_eq!(w.execute(get(b"t:\0")), Ok(Response::Value(Some(b"fresh".to_vec()))));
    }

    #[test]
    fn every_job_kind_runs_on_sled() {
        let db = ::sled::Config::new().temporary(true).open().unwrap();
        let mut w = Worker::new(0, SledEngine::new(db));
        let now = unix_now();

        assert_eq!(w.execute(setex(b"s:k", b"v", 1)), Ok(Response::Done));
        assert_eq!(w.execute(incr(b"c:n", 5)), Ok(Response::Integer(5)));
        assert_eq!(w.execute(incr(b"c:n", -3)), Ok(Response::Integer(2)));
        let setnx = Request::Set { key: b"c:n".to_vec(), value: b"9".to_vec(), no_overwrite: true };
        assert_eq!(w.execute(setnx), Err(JobError::Store(StoreError::KeyExists)));

        assert_eq!(w.execute(Request::ExpireSweep { now: now + 10, limit: 16 }), Ok(Response::Swept(1)));
        assert_eq!(w.execute(get(b"s:k")), Ok(Response::Value(None)));
        assert_eq!(w.execute(Request::Delete { key: b"c:n".to_vec() }), Ok(Response::Removed(true)));
        assert_eq!(w.execute(get(b"c:n")), Ok(Response::Value(None)));
    }

    #[test]
    fn stop_closes_every_handle() {
        let (engine, mut w) = worker();
        w.execute(set(b"a:1", b"v")).unwrap();
        w.execute(Request::SetWithExpiry { key: b"b:1".to_vec(), value: b"v".to_vec(), ttl: 9 }).unwrap();
        assert_eq!(engine.open_handles(), 4);

        w.stop();
        assert_eq!(w.state(), WorkerState::Stopped);
        assert_eq!(engine.open_handles(), 0);
    }
}
