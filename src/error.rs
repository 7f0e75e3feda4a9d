use thiserror::Error;

/// type alias for all crate operations that could fail with a [`TableKvError`]
pub type Result<T> = std::result::Result<T, TableKvError>;

/// result of a single call into a [`StorageEngine`](crate::engine::StorageEngine)
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The failure signals a storage engine can report.
///
/// Every engine maps its native error codes 1:1 onto these kinds. The worker decides what to
/// do with them: `NotFound` becomes a "no value" reply on reads, `ReplicationDead` evicts the
/// offending table handle(s), everything else is surfaced to the command handler as is.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreError {
    /// the engine environment is not ready to serve requests
    #[error("not_ready")]
    NotReady,

    /// the named table does not exist and could not be created
    #[error("not_exist")]
    NotExist,

    /// the operation lost a lock conflict and was rolled back
    #[error("dead_lock")]
    DeadLock,

    /// the handle is no longer usable, its replication group changed primary
    #[error("rep_dead")]
    ReplicationDead,

    /// the engine is locked out while replication catches up
    #[error("lockout")]
    Lockout,

    /// permission denied by the engine
    #[error("access")]
    AccessDenied,

    /// invalid argument, or the handle was already closed
    #[error("inval")]
    InvalidArgument,

    /// the requested key has no value
    #[error("not_found")]
    NotFound,

    /// a no-overwrite write hit an existing key
    #[error("key_exist")]
    KeyExists,

    /// any other engine failure
    #[error("unknown")]
    Unknown,
}

/// Errors raised while decoding request frames off the wire.
/// Every one of these terminates the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// io failure while reading from the socket
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// the peer closed the socket in the middle of a request
    #[error("connection closed mid-request")]
    UnexpectedEof,

    /// a header line was empty or did not end in CRLF
    #[error("invalid line")]
    InvalidLine,

    /// a header line exceeded the maximum length
    #[error("line too long")]
    LineTooLong,

    /// the header line carried the wrong type tag
    #[error("expected tag '{expected}', got {found:#04x}")]
    UnexpectedTag {
        /// the tag the codec was looking for
        expected: char,
        /// the byte actually found
        found: u8,
    },

    /// the count or length field was not a decimal integer
    #[error("invalid number")]
    InvalidNumber,

    /// array count was zero or negative
    #[error("invalid array count: {0}")]
    InvalidCount(i64),

    /// bulk length was negative or larger than allowed
    #[error("invalid bulk length: {0}")]
    InvalidLength(i64),

    /// the bulk payload was not followed by CRLF
    #[error("bulk payload not terminated by CRLF")]
    MissingCrlf,

    /// a reply frame could not be understood (client side)
    #[error("invalid reply: {0}")]
    InvalidReply(String),
}

/// The failure half of a job's outcome, as seen by the command handler
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum JobError {
    /// the storage engine reported a failure
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// the stored value (or the delta) is not a base-10 signed 64 bit integer
    #[error("value is not an integer")]
    NotAnInteger,
}

/// The Error variants used throughout the crate.
#[derive(Debug, Error)]
pub enum TableKvError {
    /// variant for errors caused by socket or file IO
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// malformed request framing
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// sled failed while opening the database
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// the config file could not be parsed
    #[error("config error: {0}")]
    Json(#[from] serde_json::Error),

    /// an invalid configuration value
    #[error("config error: {0}")]
    Config(String),

    /// the worker pool queue is closed or the worker dropped the job
    #[error("worker pool is closed")]
    PoolClosed,

    /// the server returned an error reply (client side)
    #[error("{0}")]
    Reply(String),
}
