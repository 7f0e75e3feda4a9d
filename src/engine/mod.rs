//! This module provides the storage engine contract the workers consume, plus two
//! implementations of it: [`SledEngine`], a persistent engine backed by the [`sled`] database,
//! and [`MemoryEngine`], an in-process engine with hooks for observing handles and transactions
//! and for simulating a replication failover.
//!
//! The workers never see an engine's native errors, only the [`StoreError`] taxonomy.
//!
//! [`sled`]: https://docs.rs/sled/latest/sled/
use crate::error::StoreResult;

/// physical layout requested when opening a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    /// unordered point-lookup table, used for user tables
    Hash,
    /// key-ordered table, used for the expiry stores
    Ordered,
}

/// isolation level of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    /// reads see committed data and reads made with a lock hint are validated at commit
    ReadCommitted,
    /// reads are not validated at commit
    ReadUncommitted,
}

/// A trait for the transactional, table-partitioned storage a worker reads and writes.
///
/// Handles are owned by exactly one worker at a time and are only ever used from that
/// worker's thread. A transaction must be finished with exactly one call to [`commit`] or
/// [`abort`].
///
/// [`commit`]: StorageEngine::commit
/// [`abort`]: StorageEngine::abort
pub trait StorageEngine: Clone + Send + Sync + 'static {
    /// an open reference to one table
    type Handle: Clone + Send + 'static;

    /// an open transaction
    type Txn: Send;

    /// opens (creating if needed) the table `name` with the given layout
    ///
    /// # Errors
    /// `NotExist`, `DeadLock` or `Unknown`
    fn open_table(&self, name: &[u8], kind: TableKind) -> StoreResult<Self::Handle>;

    /// reads `key`. `lock_for_update` asks for the read to be protected until commit.
    ///
    /// # Errors
    /// `NotFound` if the key has no value
    fn get(
        &self,
        handle: &Self::Handle,
        txn: Option<&mut Self::Txn>,
        key: &[u8],
        lock_for_update: bool,
    ) -> StoreResult<Vec<u8>>;

    /// writes `value` under `key`.
    ///
    /// # Errors
    /// `KeyExists` if `no_overwrite` is set and the key already has a value
    fn put(
        &self,
        handle: &Self::Handle,
        txn: Option<&mut Self::Txn>,
        key: &[u8],
        value: &[u8],
        no_overwrite: bool,
    ) -> StoreResult<()>;

    /// removes `key`.
    ///
    /// # Errors
    /// `NotFound` if the key has no value
    fn delete(&self, handle: &Self::Handle, txn: Option<&mut Self::Txn>, key: &[u8])
        -> StoreResult<()>;

    /// returns up to `limit` entries of the table, smallest key first
    fn scan(
        &self,
        handle: &Self::Handle,
        txn: Option<&mut Self::Txn>,
        limit: usize,
    ) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// starts a transaction
    fn begin(&self, isolation: Isolation) -> StoreResult<Self::Txn>;

    /// makes every write of `txn` visible at once, or none of them
    fn commit(&self, txn: Self::Txn) -> StoreResult<()>;

    /// discards every write of `txn`
    fn abort(&self, txn: Self::Txn);

    /// releases `handle`.
    ///
    /// # Errors
    /// `InvalidArgument` if the handle is already closed and can never be closed again,
    /// any other error is transient and the close may be retried.
    fn close_table(&self, handle: &Self::Handle) -> StoreResult<()>;
}

mod memory;
mod sled;

pub use self::memory::MemoryEngine;
pub use self::sled::SledEngine;
