use crossbeam::channel::{self, Receiver, Sender};

use crate::error::JobError;

/// These are the operations a worker can be asked to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// read the value of `key`
    Get {
        /// the client key, `table:name` or just `name`
        key: Vec<u8>,
    },
    /// write `value` under `key`, failing with `KeyExists` if `no_overwrite` is set and the
    /// key already has a value
    Set {
        /// the client key
        key: Vec<u8>,
        /// the value to store
        value: Vec<u8>,
        /// refuse to replace an existing value
        no_overwrite: bool,
    },
    /// write `value` under `key` and record that it expires in `ttl` seconds
    SetWithExpiry {
        /// the client key
        key: Vec<u8>,
        /// the value to store
        value: Vec<u8>,
        /// seconds until the key expires, never 0
        ttl: u32,
    },
    /// add `delta` to the integer stored under `key`
    IncrementBy {
        /// the client key
        key: Vec<u8>,
        /// amount to add, may be negative
        delta: i64,
    },
    /// remove `key` and any pending expiry of it
    Delete {
        /// the client key
        key: Vec<u8>,
    },
    /// remove up to `limit` keys whose expiry time is at or before `now`
    ExpireSweep {
        /// seconds since the unix epoch
        now: u64,
        /// maximum number of expiry records to examine
        limit: usize,
    },
}

/// The successful outcome of a [`Request`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// the value read by a `Get`, `None` if the key has no value
    Value(Option<Vec<u8>>),
    /// a `Set` or `SetWithExpiry` was applied
    Done,
    /// the new value after an `IncrementBy`
    Integer(i64),
    /// whether a `Delete` removed anything
    Removed(bool),
    /// number of keys an `ExpireSweep` removed
    Swept(usize),
}

/// what a worker sends back for one job
pub type JobResult = Result<Response, JobError>;

/// A unit of work for the pool: a request plus the channel its result goes back on
#[derive(Debug)]
pub struct Job {
    /// the operation to perform
    pub request: Request,
    /// single-use reply channel
    pub reply_to: Sender<JobResult>,
}

impl Job {
    /// creates a job for `request`, returning it with the receiving end of its reply channel
    pub fn new(request: Request) -> (Job, Receiver<JobResult>) {
        let (reply_to, rx) = channel::bounded(1);
        (Job { request, reply_to }, rx)
    }
}
