use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::engine::StorageEngine;
use crate::error::{StoreError, StoreResult};
use crate::router::Table;

// close retries: attempts and the backoff before the first retry, doubled each time
const CLOSE_RETRIES: u32 = 8;
const CLOSE_BACKOFF: Duration = Duration::from_millis(1);
const CLOSE_BACKOFF_MAX: Duration = Duration::from_millis(100);

/// A worker's private map of open table handles.
///
/// Holds at most one handle per table. Handles are opened on first use and evicted as soon as
/// the engine reports them unusable, so the next [`get`](HandleCache::get) reopens them.
pub struct HandleCache<E: StorageEngine> {
    engine: E,
    handles: HashMap<Table, E::Handle>,
}

impl<E: StorageEngine> HandleCache<E> {
    /// creates an empty cache over `engine`
    pub fn new(engine: E) -> Self {
        HandleCache {
            engine,
            handles: HashMap::new(),
        }
    }

    /// returns the cached handle for `table`, opening and caching it if needed
    ///
    /// # Errors
    /// the engine's open error, unmodified
    pub fn get(&mut self, table: &Table) -> StoreResult<E::Handle> {
        if let Some(handle) = self.handles.get(table) {
            return Ok(handle.clone());
        }
        let handle = self.engine.open_table(&table.physical_name(), table.kind())?;
        debug!(%table, "cached new table handle");
        self.handles.insert(table.clone(), handle.clone());
        Ok(handle)
    }

    /// evicts and closes the handle for `table`, if one is cached
    pub fn invalidate(&mut self, table: &Table) {
        if let Some(handle) = self.handles.remove(table) {
            warn!(%table, "evicting table handle");
            close_handle(&self.engine, handle, table);
        }
    }

    /// evicts `table` if `err` says its handle is dead
    pub fn invalidate_if_dead(&mut self, table: &Table, err: StoreError) {
        if err == StoreError::ReplicationDead {
            self.invalidate(table);
        }
    }

    /// whether a handle for `table` is cached
    pub fn contains(&self, table: &Table) -> bool {
        self.handles.contains_key(table)
    }

    /// number of cached handles
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// whether no handle is cached
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// closes every cached handle
    pub fn close_all(&mut self) {
        for (table, handle) in self.handles.drain() {
            close_handle(&self.engine, handle, &table);
        }
    }
}

impl<E: StorageEngine> Drop for HandleCache<E> {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Closes `handle`. A transient failure is retried on a background thread with a bounded,
/// doubling backoff. An invalid-handle failure is final: it is logged and the handle dropped.
fn close_handle<E: StorageEngine>(engine: &E, handle: E::Handle, table: &Table) {
    match engine.close_table(&handle) {
        Ok(()) => {}
        Err(StoreError::InvalidArgument) => error!(%table, "close failed, handle is invalid"),
        Err(e) => {
            warn!(%table, "close failed ({}), retrying in background", e);
            let engine = engine.clone();
            let table = table.clone();
            let spawned = thread::Builder::new()
                .name("close-retry".into())
                .spawn(move || retry_close(engine, handle, table));
            if let Err(e) = spawned {
                error!("failed to spawn close-retry thread: {}", e);
            }
        }
    }
}

fn retry_close<E: StorageEngine>(engine: E, handle: E::Handle, table: Table) {
    let mut backoff = CLOSE_BACKOFF;
    for attempt in 1..=CLOSE_RETRIES {
        thread::sleep(backoff);
        match engine.close_table(&handle) {
            Ok(()) => {
                debug!(%table, attempt, "closed table handle on retry");
                return;
            }
            Err(StoreError::InvalidArgument) => {
                error!(%table, "close retry failed, handle is invalid");
                return;
            }
            Err(e) => warn!(%table, attempt, "close retry failed: {}", e),
        }
        backoff = (backoff * 2).min(CLOSE_BACKOFF_MAX);
    }
    error!(%table, "giving up on closing table handle");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;

    #[test]
    fn get_opens_once_and_reuses() {
        let engine = MemoryEngine::new();
        let mut cache = HandleCache::new(engine.clone());
        let table = Table::Named(b"users".to_vec());

        cache.get(&table).unwrap();
        cache.get(&table).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(engine.open_handles_for(b"users.db"), 1);
    }

    #[test]
    fn invalidate_closes_and_next_get_reopens() {
        let engine = MemoryEngine::new();
        let mut cache = HandleCache::new(engine.clone());
        let table = Table::Default;

        cache.get(&table).unwrap();
        cache.invalidate(&table);
        assert!(!cache.contains(&table));
        assert_eq!(engine.open_handles(), 0);

        cache.get(&table).unwrap();
        assert_eq!(engine.open_handles(), 1);
    }

    #[test]
    fn only_replication_dead_invalidates() {
        let engine = MemoryEngine::new();
        let mut cache = HandleCache::new(engine);
        let table = Table::Default;
        cache.get(&table).unwrap();

        cache.invalidate_if_dead(&table, StoreError::DeadLock);
        assert!(cache.contains(&table));
        cache.invalidate_if_dead(&table, StoreError::ReplicationDead);
        assert!(!cache.contains(&table));
    }

    #[test]
    fn drop_closes_everything() {
        let engine = MemoryEngine::new();
        {
            let mut cache = HandleCache::new(engine.clone());
            cache.get(&Table::Default).unwrap();
            cache.get(&Table::ExpireByTime).unwrap();
            cache.get(&Table::ExpireIndex).unwrap();
            assert_eq!(engine.open_handles(), 3);
        }
        assert_eq!(engine.open_handles(), 0);
    }
}
