use std::path::Path;

use ::sled::transaction::{abort, ConflictableTransactionResult, TransactionError, Transactional};
use ::sled::{Db, IVec, Tree};
use tracing::{debug, warn};

use super::{Isolation, StorageEngine, TableKind};
use crate::error::{Result, StoreError, StoreResult};

/// A [`StorageEngine`] backed by a [`sled`] database. Each table is a sled [`Tree`].
///
/// sled transactions are closure based, so a [`SledTxn`] buffers its writes and remembers the
/// values its validated reads observed. [`commit`](StorageEngine::commit) replays the buffer
/// inside one sled transaction spanning every tree the transaction touched, after checking
/// that none of the validated reads changed. A changed read is reported as
/// [`StoreError::DeadLock`], just as a lock conflict would be.
///
/// [`sled`]: https://docs.rs/sled/latest/sled/
#[derive(Clone, Debug)]
pub struct SledEngine {
    db: Db,
}

/// an open sled transaction
#[derive(Debug)]
pub struct SledTxn {
    isolation: Isolation,
    reads: Vec<(Tree, Vec<u8>, Option<IVec>)>,
    writes: Vec<(Tree, Vec<u8>, Option<Vec<u8>>)>,
}

/// marker abort reason for a failed read validation
#[derive(Debug)]
struct Conflict;

impl SledEngine {
    /// opens (or creates) a sled database in `path`
    ///
    /// # Errors
    /// sled's own error, so the caller sees why the database could not be opened
    pub fn open(path: impl AsRef<Path>) -> Result<SledEngine> {
        let db = ::sled::open(path)?;
        Ok(SledEngine { db })
    }

    /// wraps an already opened sled database
    pub fn new(db: Db) -> Self {
        SledEngine { db }
    }
}

impl SledTxn {
    /// the value this transaction itself last wrote to `key`, if any
    fn pending(&self, tree: &Tree, key: &[u8]) -> Option<Option<Vec<u8>>> {
        self.writes
            .iter()
            .rev()
            .find(|(t, k, _)| t.name() == tree.name() && k.as_slice() == key)
            .map(|(_, _, v)| v.clone())
    }

    fn read(&mut self, tree: &Tree, key: &[u8], lock_for_update: bool) -> StoreResult<Option<Vec<u8>>> {
        if let Some(pending) = self.pending(tree, key) {
            return Ok(pending);
        }
        let current = tree.get(key).map_err(map_err)?;
        if lock_for_update || self.isolation == Isolation::ReadCommitted {
            self.reads.push((tree.clone(), key.to_vec(), current.clone()));
        }
        Ok(current.map(|v| v.to_vec()))
    }
}

impl StorageEngine for SledEngine {
    type Handle = Tree;
    type Txn = SledTxn;

    fn open_table(&self, name: &[u8], kind: TableKind) -> StoreResult<Tree> {
        debug!(table = %String::from_utf8_lossy(name), ?kind, "opening sled tree");
        self.db.open_tree(name).map_err(map_err)
    }

    fn get(&self, tree: &Tree, txn: Option<&mut SledTxn>, key: &[u8], lock_for_update: bool) -> StoreResult<Vec<u8>> {
        let value = match txn {
            Some(txn) => txn.read(tree, key, lock_for_update)?,
            None => tree.get(key).map_err(map_err)?.map(|v| v.to_vec()),
        };
        value.ok_or(StoreError::NotFound)
    }

    fn put(&self, tree: &Tree, txn: Option<&mut SledTxn>, key: &[u8], value: &[u8], no_overwrite: bool) -> StoreResult<()> {
        match txn {
            Some(txn) => {
                if no_overwrite && txn.read(tree, key, true)?.is_some() {
                    return Err(StoreError::KeyExists);
                }
                txn.writes.push((tree.clone(), key.to_vec(), Some(value.to_vec())));
                Ok(())
            }
            None if no_overwrite => tree
                .compare_and_swap(key, None as Option<&[u8]>, Some(value))
                .map_err(map_err)?
                .map_err(|_| StoreError::KeyExists),
            None => tree.insert(key, value).map(|_| ()).map_err(map_err),
        }
    }

    fn delete(&self, tree: &Tree, txn: Option<&mut SledTxn>, key: &[u8]) -> StoreResult<()> {
        match txn {
            Some(txn) => {
                if txn.read(tree, key, true)?.is_none() {
                    return Err(StoreError::NotFound);
                }
                txn.writes.push((tree.clone(), key.to_vec(), None));
                Ok(())
            }
            None => match tree.remove(key).map_err(map_err)? {
                Some(_) => Ok(()),
                None => Err(StoreError::NotFound),
            },
        }
    }

    fn scan(&self, tree: &Tree, _txn: Option<&mut SledTxn>, limit: usize) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        tree.iter()
            .take(limit)
            .map(|entry| entry.map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(map_err))
            .collect()
    }

    fn begin(&self, isolation: Isolation) -> StoreResult<SledTxn> {
        Ok(SledTxn {
            isolation,
            reads: Vec::new(),
            writes: Vec::new(),
        })
    }

    fn commit(&self, txn: SledTxn) -> StoreResult<()> {
        if txn.writes.is_empty() {
            return Ok(());
        }

        // every tree touched by the transaction, and each read/write's index into that list
        let mut trees: Vec<Tree> = Vec::new();
        let mut slot = |tree: &Tree| -> usize {
            match trees.iter().position(|t| t.name() == tree.name()) {
                Some(idx) => idx,
                None => {
                    trees.push(tree.clone());
                    trees.len() - 1
                }
            }
        };
        let reads: Vec<(usize, &[u8], Option<&IVec>)> = txn
            .reads
            .iter()
            .map(|(t, k, v)| (slot(t), k.as_slice(), v.as_ref()))
            .collect();
        let writes: Vec<(usize, &[u8], Option<&[u8]>)> = txn
            .writes
            .iter()
            .map(|(t, k, v)| (slot(t), k.as_slice(), v.as_deref()))
            .collect();

        let result = trees.as_slice().transaction(|views| -> ConflictableTransactionResult<(), Conflict> {
            for (idx, key, observed) in &reads {
                if views[*idx].get(key)?.as_ref() != *observed {
                    return abort(Conflict);
                }
            }
            for (idx, key, value) in &writes {
                match value {
                    Some(value) => {
                        views[*idx].insert(*key, *value)?;
                    }
                    None => {
                        views[*idx].remove(*key)?;
                    }
                }
            }
            Ok(())
        });

        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(Conflict)) => {
                debug!("sled transaction lost a read validation");
                Err(StoreError::DeadLock)
            }
            Err(TransactionError::Storage(e)) => Err(map_err(e)),
        }
    }

    fn abort(&self, txn: SledTxn) {
        debug!(writes = txn.writes.len(), "discarding sled transaction");
    }

    fn close_table(&self, tree: &Tree) -> StoreResult<()> {
        tree.flush().map(|_| ()).map_err(|e| {
            warn!(table = %String::from_utf8_lossy(&tree.name()), "flush on close failed: {}", e);
            map_err(e)
        })
    }
}

/// maps sled's native errors onto the engine error taxonomy
fn map_err(e: ::sled::Error) -> StoreError {
    warn!("sled error: {}", e);
    match e {
        ::sled::Error::CollectionNotFound(_) => StoreError::NotExist,
        ::sled::Error::Unsupported(_) => StoreError::InvalidArgument,
        ::sled::Error::Io(ref io) if io.kind() == std::io::ErrorKind::PermissionDenied => StoreError::AccessDenied,
        _ => StoreError::Unknown,
    }
}
