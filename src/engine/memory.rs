use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tracing::{debug, info};

use super::{Isolation, StorageEngine, TableKind};
use crate::error::{StoreError, StoreResult};

/// An in-process [`StorageEngine`].
///
/// All tables live behind one lock, so a commit applies every write of a transaction at once.
/// Besides serving `--engine memory`, it exposes the hooks the tests need:
/// - [`open_handles`](MemoryEngine::open_handles) counts handles that were opened and not yet
///   closed
/// - [`open_transactions`](MemoryEngine::open_transactions) counts transactions that were begun
///   and neither committed nor aborted
/// - [`failover`](MemoryEngine::failover) simulates a change of replication primary: every
///   handle opened before the call reports [`StoreError::ReplicationDead`] from then on
#[derive(Clone, Default, Debug)]
pub struct MemoryEngine {
    inner: Arc<Inner>,
}

#[derive(Default, Debug)]
struct Inner {
    tables: RwLock<HashMap<Vec<u8>, MemTable>>,
    // open handle id -> table name
    handles: DashMap<u64, Vec<u8>>,
    next_handle: AtomicU64,
    epoch: AtomicU64,
    transactions: AtomicUsize,
}

#[derive(Debug)]
struct MemTable {
    kind: TableKind,
    rows: BTreeMap<Vec<u8>, Vec<u8>>,
}

/// a handle onto one table of a [`MemoryEngine`]
#[derive(Debug, Clone)]
pub struct MemoryHandle {
    id: u64,
    name: Vec<u8>,
    epoch: u64,
}

/// an open [`MemoryEngine`] transaction
#[derive(Debug)]
pub struct MemoryTxn {
    isolation: Isolation,
    reads: Vec<(Vec<u8>, Vec<u8>, Option<Vec<u8>>)>,
    writes: Vec<(Vec<u8>, Vec<u8>, Option<Vec<u8>>)>,
}

impl MemoryEngine {
    /// creates an empty engine
    pub fn new() -> Self {
        MemoryEngine::default()
    }

    /// number of handles opened and not closed yet
    pub fn open_handles(&self) -> usize {
        self.inner.handles.len()
    }

    /// number of open handles onto the table `name`
    pub fn open_handles_for(&self, name: &[u8]) -> usize {
        self.inner.handles.iter().filter(|h| h.value().as_slice() == name).count()
    }

    /// number of transactions begun and neither committed nor aborted
    pub fn open_transactions(&self) -> usize {
        self.inner.transactions.load(Ordering::SeqCst)
    }

    /// makes every handle opened so far report [`StoreError::ReplicationDead`]
    pub fn failover(&self) {
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!(epoch, "simulated replication failover");
    }

    /// reads `key` of table `name` directly, bypassing handles
    pub fn peek(&self, name: &[u8], key: &[u8]) -> Option<Vec<u8>> {
        let tables = self.inner.tables.read().ok()?;
        tables.get(name).and_then(|t| t.rows.get(key).cloned())
    }

    /// number of rows in table `name`
    pub fn len_of(&self, name: &[u8]) -> usize {
        self.inner
            .tables
            .read()
            .map(|tables| tables.get(name).map_or(0, |t| t.rows.len()))
            .unwrap_or(0)
    }

    fn check(&self, handle: &MemoryHandle) -> StoreResult<()> {
        if !self.inner.handles.contains_key(&handle.id) {
            return Err(StoreError::InvalidArgument);
        }
        if handle.epoch != self.inner.epoch.load(Ordering::SeqCst) {
            return Err(StoreError::ReplicationDead);
        }
        Ok(())
    }

    fn read_committed(&self, name: &[u8], key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let tables = self.inner.tables.read().map_err(|_| StoreError::Unknown)?;
        let table = tables.get(name).ok_or(StoreError::NotExist)?;
        Ok(table.rows.get(key).cloned())
    }

    fn write_committed(&self, name: &[u8], key: &[u8], value: Option<&[u8]>) -> StoreResult<Option<Vec<u8>>> {
        let mut tables = self.inner.tables.write().map_err(|_| StoreError::Unknown)?;
        let table = tables.get_mut(name).ok_or(StoreError::NotExist)?;
        Ok(match value {
            Some(value) => table.rows.insert(key.to_vec(), value.to_vec()),
            None => table.rows.remove(key),
        })
    }
}

impl MemoryTxn {
    fn pending(&self, name: &[u8], key: &[u8]) -> Option<Option<Vec<u8>>> {
        self.writes
            .iter()
            .rev()
            .find(|(n, k, _)| n.as_slice() == name && k.as_slice() == key)
            .map(|(_, _, v)| v.clone())
    }
}

impl StorageEngine for MemoryEngine {
    type Handle = MemoryHandle;
    type Txn = MemoryTxn;

    fn open_table(&self, name: &[u8], kind: TableKind) -> StoreResult<MemoryHandle> {
        {
            let mut tables = self.inner.tables.write().map_err(|_| StoreError::Unknown)?;
            let table = tables.entry(name.to_vec()).or_insert_with(|| MemTable {
                kind,
                rows: BTreeMap::new(),
            });
            if table.kind != kind {
                return Err(StoreError::InvalidArgument);
            }
        }
        let id = self.inner.next_handle.fetch_add(1, Ordering::SeqCst);
        self.inner.handles.insert(id, name.to_vec());
        debug!(id, table = %String::from_utf8_lossy(name), "opened memory table handle");
        Ok(MemoryHandle {
            id,
            name: name.to_vec(),
            epoch: self.inner.epoch.load(Ordering::SeqCst),
        })
    }

    fn get(&self, handle: &MemoryHandle, txn: Option<&mut MemoryTxn>, key: &[u8], lock_for_update: bool) -> StoreResult<Vec<u8>> {
        self.check(handle)?;
        let value = match txn {
            Some(txn) => match txn.pending(&handle.name, key) {
                Some(pending) => pending,
                None => {
                    let current = self.read_committed(&handle.name, key)?;
                    if lock_for_update || txn.isolation == Isolation::ReadCommitted {
                        txn.reads.push((handle.name.clone(), key.to_vec(), current.clone()));
                    }
                    current
                }
            },
            None => self.read_committed(&handle.name, key)?,
        };
        value.ok_or(StoreError::NotFound)
    }

    fn put(&self, handle: &MemoryHandle, txn: Option<&mut MemoryTxn>, key: &[u8], value: &[u8], no_overwrite: bool) -> StoreResult<()> {
        self.check(handle)?;
        match txn {
            Some(txn) => {
                if no_overwrite && self.get(handle, Some(&mut *txn), key, true).is_ok() {
                    return Err(StoreError::KeyExists);
                }
                txn.writes.push((handle.name.clone(), key.to_vec(), Some(value.to_vec())));
                Ok(())
            }
            None => {
                let mut tables = self.inner.tables.write().map_err(|_| StoreError::Unknown)?;
                let table = tables.get_mut(&handle.name).ok_or(StoreError::NotExist)?;
                if no_overwrite && table.rows.contains_key(key) {
                    return Err(StoreError::KeyExists);
                }
                table.rows.insert(key.to_vec(), value.to_vec());
                Ok(())
            }
        }
    }

    fn delete(&self, handle: &MemoryHandle, txn: Option<&mut MemoryTxn>, key: &[u8]) -> StoreResult<()> {
        self.check(handle)?;
        match txn {
            Some(txn) => {
                self.get(handle, Some(&mut *txn), key, true)?;
                txn.writes.push((handle.name.clone(), key.to_vec(), None));
                Ok(())
            }
            None => match self.write_committed(&handle.name, key, None)? {
                Some(_) => Ok(()),
                None => Err(StoreError::NotFound),
            },
        }
    }

    fn scan(&self, handle: &MemoryHandle, _txn: Option<&mut MemoryTxn>, limit: usize) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check(handle)?;
        let tables = self.inner.tables.read().map_err(|_| StoreError::Unknown)?;
        let table = tables.get(&handle.name).ok_or(StoreError::NotExist)?;
        Ok(table
            .rows
            .iter()
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn begin(&self, isolation: Isolation) -> StoreResult<MemoryTxn> {
        self.inner.transactions.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryTxn {
            isolation,
            reads: Vec::new(),
            writes: Vec::new(),
        })
    }

    fn commit(&self, txn: MemoryTxn) -> StoreResult<()> {
        self.inner.transactions.fetch_sub(1, Ordering::SeqCst);
        let mut tables = self.inner.tables.write().map_err(|_| StoreError::Unknown)?;

        for (name, key, observed) in &txn.reads {
            let current = tables.get(name).and_then(|t| t.rows.get(key));
            if current != observed.as_ref() {
                return Err(StoreError::DeadLock);
            }
        }
        if txn.writes.iter().any(|(name, _, _)| !tables.contains_key(name)) {
            return Err(StoreError::NotExist);
        }
        for (name, key, value) in txn.writes {
            if let Some(table) = tables.get_mut(&name) {
                match value {
                    Some(value) => {
                        table.rows.insert(key, value);
                    }
                    None => {
                        table.rows.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn abort(&self, _txn: MemoryTxn) {
        self.inner.transactions.fetch_sub(1, Ordering::SeqCst);
    }

    fn close_table(&self, handle: &MemoryHandle) -> StoreResult<()> {
        match self.inner.handles.remove(&handle.id) {
            Some(_) => Ok(()),
            None => Err(StoreError::InvalidArgument),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_counted_until_closed() {
        let engine = MemoryEngine::new();
        let a = engine.open_table(b"a.db", TableKind::Hash).unwrap();
        let b = engine.open_table(b"a.db", TableKind::Hash).unwrap();
        assert_eq!(engine.open_handles(), 2);
        assert_eq!(engine.open_handles_for(b"a.db"), 2);

        engine.close_table(&a).unwrap();
        assert_eq!(engine.open_handles(), 1);
        assert_eq!(engine.close_table(&a), Err(StoreError::InvalidArgument));
        engine.close_table(&b).unwrap();
        assert_eq!(engine.open_handles(), 0);
    }

    #[test]
    fn failover_kills_old_handles_only() {
        let engine = MemoryEngine::new();
        let old = engine.open_table(b"a.db", TableKind::Hash).unwrap();
        engine.put(&old, None, b"k", b"v", false).unwrap();

        engine.failover();
        assert_eq!(engine.get(&old, None, b"k", false), Err(StoreError::ReplicationDead));
        assert_eq!(engine.put(&old, None, b"k", b"w", false), Err(StoreError::ReplicationDead));

        let fresh = engine.open_table(b"a.db", TableKind::Hash).unwrap();
        assert_eq!(engine.get(&fresh, None, b"k", false).unwrap(), b"v".to_vec());
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let engine = MemoryEngine::new();
        engine.open_table(b"x", TableKind::Ordered).unwrap();
        assert_eq!(engine.open_table(b"x", TableKind::Hash).unwrap_err(), StoreError::InvalidArgument);
    }

    #[test]
    fn transactions_are_tracked_and_atomic() {
        let engine = MemoryEngine::new();
        let a = engine.open_table(b"a.db", TableKind::Hash).unwrap();
        let b = engine.open_table(b"b", TableKind::Ordered).unwrap();

        let mut txn = engine.begin(Isolation::ReadUncommitted).unwrap();
        assert_eq!(engine.open_transactions(), 1);
        engine.put(&a, Some(&mut txn), b"k", b"1", false).unwrap();
        engine.put(&b, Some(&mut txn), b"k", b"2", false).unwrap();
        assert_eq!(engine.peek(b"a.db", b"k"), None);

        engine.commit(txn).unwrap();
        assert_eq!(engine.open_transactions(), 0);
        assert_eq!(engine.peek(b"a.db", b"k"), Some(b"1".to_vec()));
        assert_eq!(engine.peek(b"b", b"k"), Some(b"2".to_vec()));
    }

    #[test]
    fn locked_read_conflict_is_a_deadlock() {
        let engine = MemoryEngine::new();
        let a = engine.open_table(b"a.db", TableKind::Hash).unwrap();

        let mut txn = engine.begin(Isolation::ReadCommitted).unwrap();
        assert_eq!(engine.get(&a, Some(&mut txn), b"n", true), Err(StoreError::NotFound));
        engine.put(&a, None, b"n", b"7", false).unwrap();
        engine.put(&a, Some(&mut txn), b"n", b"1", false).unwrap();

        assert_eq!(engine.commit(txn), Err(StoreError::DeadLock));
        assert_eq!(engine.peek(b"a.db", b"n"), Some(b"7".to_vec()));
        assert_eq!(engine.open_transactions(), 0);
    }
}
