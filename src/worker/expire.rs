//! Expiry bookkeeping.
//!
//! Two auxiliary tables track keys written with a time-to-live:
//!
//! - `ExpireByTime` maps an [`ExpiryRecord`] (expiry time, sequence, worker id, big-endian so
//!   the table's key order is expiry order) to the [identity](Route::identity) of the stored key
//! - `ExpireIndex` maps that identity to the key's most recent expiry record
//!
//! Keying both by the routed identity rather than the client's spelling means `x`, `:x` and
//! `__default:x` share one pending expiry.
//!
//! Both are written inside the caller's transaction, so they become visible together with the
//! value write. A key re-armed with a new ttl leaves its old record behind in `ExpireByTime`.
//! The sweeper recognises such stale records because the index no longer points at them.

use tracing::{debug, warn};

use super::cache::HandleCache;
use crate::engine::StorageEngine;
use crate::error::{StoreError, StoreResult};
use crate::router::{Route, Table};

/// Identity of one expiry entry. Distinct across workers even for the same key and second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExpiryRecord {
    /// seconds since the unix epoch at which the key expires
    pub expires_at: u64,
    /// per-worker sequence number
    pub seq: u32,
    /// id of the worker that wrote the record
    pub worker_id: u32,
}

impl ExpiryRecord {
    /// encoded size in bytes
    pub const LEN: usize = 16;

    /// encodes the record so that byte order equals (expires_at, seq, worker_id) order
    pub fn to_bytes(&self) -> [u8; ExpiryRecord::LEN] {
        let mut buf = [0u8; ExpiryRecord::LEN];
        buf[..8].copy_from_slice(&self.expires_at.to_be_bytes());
        buf[8..12].copy_from_slice(&self.seq.to_be_bytes());
        buf[12..].copy_from_slice(&self.worker_id.to_be_bytes());
        buf
    }

    /// decodes a record written by [`to_bytes`](ExpiryRecord::to_bytes)
    pub fn from_bytes(buf: &[u8]) -> Option<ExpiryRecord> {
        if buf.len() != ExpiryRecord::LEN {
            return None;
        }
        let mut expires_at = [0u8; 8];
        let mut seq = [0u8; 4];
        let mut worker_id = [0u8; 4];
        expires_at.copy_from_slice(&buf[..8]);
        seq.copy_from_slice(&buf[8..12]);
        worker_id.copy_from_slice(&buf[12..]);
        Some(ExpiryRecord {
            expires_at: u64::from_be_bytes(expires_at),
            seq: u32::from_be_bytes(seq),
            worker_id: u32::from_be_bytes(worker_id),
        })
    }
}

/// A worker's view of the expiry tables. Owns the worker's expiry sequence counter.
#[derive(Debug)]
pub struct ExpirationCoordinator {
    worker_id: u32,
    seq: u32,
}

impl ExpirationCoordinator {
    /// creates a coordinator for worker `worker_id`
    pub fn new(worker_id: u32) -> Self {
        ExpirationCoordinator { worker_id, seq: 0 }
    }

    /// Records that the key at `route` expires `ttl` seconds after `now`, inside `txn`.
    ///
    /// A dead replication handle on either expiry table evicts both, other errors are returned
    /// as they are.
    pub fn record_expiry<E: StorageEngine>(
        &mut self,
        engine: &E,
        cache: &mut HandleCache<E>,
        txn: &mut E::Txn,
        route: &Route,
        ttl: u32,
        now: u64,
    ) -> StoreResult<ExpiryRecord> {
        self.seq = self.seq.wrapping_add(1);
        let record = ExpiryRecord {
            expires_at: now + u64::from(ttl),
            seq: self.seq,
            worker_id: self.worker_id,
        };

        let result = write_record(engine, cache, txn, &route.identity(), &record);
        self.evict_if_dead(cache, result)?;
        debug!(worker = self.worker_id, seq = record.seq, expires_at = record.expires_at, "recorded expiry");
        Ok(record)
    }

    /// drops any pending expiry of the key at `route`, inside `txn`
    pub fn clear<E: StorageEngine>(
        &mut self,
        engine: &E,
        cache: &mut HandleCache<E>,
        txn: &mut E::Txn,
        route: &Route,
    ) -> StoreResult<()> {
        let identity = route.identity();
        let result = cache
            .get(&Table::ExpireIndex)
            .and_then(|index| match engine.delete(&index, Some(txn), &identity) {
                Err(StoreError::NotFound) => Ok(()),
                other => other,
            });
        self.evict_if_dead(cache, result)
    }

    /// Removes up to `limit` expiry records due at or before `now`, inside `txn`, and returns
    /// the routes of the stored keys whose value must be deleted with them.
    ///
    /// Records are visited oldest first and the scan stops at the first record still in the
    /// future. A record only yields its key when the index still points at it.
    pub fn sweep<E: StorageEngine>(
        &mut self,
        engine: &E,
        cache: &mut HandleCache<E>,
        txn: &mut E::Txn,
        now: u64,
        limit: usize,
    ) -> StoreResult<Vec<Route>> {
        let result = sweep_records(engine, cache, txn, now, limit);
        self.evict_if_dead(cache, result)
    }

    fn evict_if_dead<E: StorageEngine, T>(&self, cache: &mut HandleCache<E>, result: StoreResult<T>) -> StoreResult<T> {
        if let Err(StoreError::ReplicationDead) = result {
            warn!(worker = self.worker_id, "expiry tables lost their replication handle");
            cache.invalidate(&Table::ExpireByTime);
            cache.invalidate(&Table::ExpireIndex);
        }
        result
    }
}

fn write_record<E: StorageEngine>(
    engine: &E,
    cache: &mut HandleCache<E>,
    txn: &mut E::Txn,
    identity: &[u8],
    record: &ExpiryRecord,
) -> StoreResult<()> {
    let by_time = cache.get(&Table::ExpireByTime)?;
    let index = cache.get(&Table::ExpireIndex)?;
    let record = record.to_bytes();
    engine.put(&by_time, Some(&mut *txn), &record, identity, false)?;
    engine.put(&index, Some(txn), identity, &record, false)
}

fn sweep_records<E: StorageEngine>(
    engine: &E,
    cache: &mut HandleCache<E>,
    txn: &mut E::Txn,
    now: u64,
    limit: usize,
) -> StoreResult<Vec<Route>> {
    let by_time = cache.get(&Table::ExpireByTime)?;
    let index = cache.get(&Table::ExpireIndex)?;

    let mut expired = Vec::new();
    for (raw_record, identity) in engine.scan(&by_time, Some(&mut *txn), limit)? {
        if let Some(record) = ExpiryRecord::from_bytes(&raw_record) {
            if record.expires_at > now {
                break;
            }
        } else {
            warn!("dropping malformed expiry record");
        }
        engine.delete(&by_time, Some(&mut *txn), &raw_record)?;

        match engine.get(&index, Some(&mut *txn), &identity, true) {
            Ok(current) if current == raw_record => {
                engine.delete(&index, Some(&mut *txn), &identity)?;
                match Route::from_identity(&identity) {
                    Some(route) => expired.push(route),
                    None => warn!("dropping expiry record with a malformed key identity"),
                }
            }
            Ok(_) | Err(StoreError::NotFound) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(expired)
}
