//! Transaction manager: begin, commit and abort with undo.

use crate::lock_manager::LockManager;
use crate::transaction::{Transaction, TxnId, TxnState, UndoKind, UndoRecord};
use basalt_buffer::PageStore;
use basalt_common::{BasaltError, EngineConfig, Result};
use basalt_storage::Tables;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Hands out transactions and finishes them.
///
/// Live transactions are kept in a registry until commit or abort completes.
/// Abort reverses the transaction's logged writes against the tables before
/// releasing its locks, so no other transaction observes a half-undone state.
pub struct TxnManager {
    next_id: AtomicU64,
    txns: RwLock<HashMap<TxnId, Arc<Transaction>>>,
    lock_manager: Arc<LockManager>,
    tables: Arc<Tables>,
}

impl TxnManager {
    pub fn new(lock_manager: Arc<LockManager>, tables: Arc<Tables>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            txns: RwLock::new(HashMap::new()),
            lock_manager,
            tables,
        }
    }

    /// Builds a page store, an empty table registry and a lock manager from `config`.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(PageStore::new(config.storage.clone())?);
        let tables = Arc::new(Tables::new(store));
        let lock_manager = Arc::new(LockManager::new(config.lock.clone()));
        info!(
            page_size = config.storage.page_size,
            persistent = config.storage.data_dir.is_some(),
            "transaction manager opened"
        );
        Ok(Self::new(lock_manager, tables))
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn tables(&self) -> &Arc<Tables> {
        &self.tables
    }

    /// Starts a transaction in GROWING with a fresh, increasing id.
    pub fn begin(&self) -> Arc<Transaction> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(id));
        self.txns.write().insert(id, Arc::clone(&txn));
        debug!(txn = id, "transaction started");
        txn
    }

    /// Looks up a live transaction.
    pub fn get(&self, id: TxnId) -> Option<Arc<Transaction>> {
        self.txns.read().get(&id).cloned()
    }

    /// Number of transactions begun and not yet finished.
    pub fn active_count(&self) -> usize {
        self.txns.read().len()
    }

    /// Commits: keeps every write and releases all locks, rows first.
    pub fn commit(&self, txn: &Transaction) -> Result<()> {
        let state = txn.state();
        if state.is_finished() {
            return Err(BasaltError::ProtocolViolation {
                txn_id: txn.id(),
                reason: format!("commit of a {} transaction", state),
            });
        }

        txn.set_state(TxnState::Committed);
        let released = self.release_all(txn);
        self.txns.write().remove(&txn.id());
        debug!(txn = txn.id(), released, "transaction committed");
        Ok(())
    }

    /// Aborts: undoes logged writes newest first, then releases all locks.
    ///
    /// A transaction already moved to ABORTED by a lock failure is aborted
    /// normally. Aborting a committed transaction is an error.
    ///
    /// # Panics
    ///
    /// Panics if an undo entry cannot be applied. The tables would otherwise
    /// be left holding a partially rolled-back transaction.
    pub fn abort(&self, txn: &Transaction) -> Result<()> {
        if txn.state() == TxnState::Committed {
            return Err(BasaltError::ProtocolViolation {
                txn_id: txn.id(),
                reason: "abort of a COMMITTED transaction".to_string(),
            });
        }

        txn.set_state(TxnState::Aborted);
        let records = txn.take_undo();
        let undone = records.len();
        for record in records.into_iter().rev() {
            if let Err(e) = self.undo(&record) {
                panic!(
                    "txn {}: failed to undo {:?} on table {}: {}",
                    txn.id(),
                    record.kind,
                    record.table,
                    e
                );
            }
        }

        let released = self.release_all(txn);
        self.txns.write().remove(&txn.id());
        info!(txn = txn.id(), undone, released, "transaction aborted");
        Ok(())
    }

    fn undo(&self, record: &UndoRecord) -> Result<()> {
        let table = self.tables.get(&record.table)?;
        let mut table = table.lock();
        let old_value = || {
            record.old_value.as_ref().ok_or_else(|| {
                BasaltError::Internal(format!("{:?} record without an old value", record.kind))
            })
        };

        let applied = match record.kind {
            UndoKind::Inserted => table.delete(&record.key)?,
            UndoKind::Deleted => table.insert(&record.key, old_value()?)?,
            UndoKind::Updated => table.update(&record.key, old_value()?)?,
        };
        if !applied {
            return Err(BasaltError::Internal(format!(
                "key {:?} not in the expected state",
                record.key
            )));
        }
        Ok(())
    }

    /// Releases row locks, then table locks. Returns how many were released.
    fn release_all(&self, txn: &Transaction) -> usize {
        let mut released = 0;
        for (table, key, _) in txn.tuple_locks() {
            if self.lock_manager.unlock_tuple(txn, &table, &key) {
                released += 1;
            }
        }
        for (table, _) in txn.table_locks() {
            if self.lock_manager.unlock_table(txn, &table) {
                released += 1;
            }
        }
        released
    }
}

impl std::fmt::Debug for TxnManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnManager")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("active", &self.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_manager::LockMode;
    use basalt_common::{FieldType, LockConfig, StorageConfig};
    use basalt_storage::int_key;

    fn manager() -> TxnManager {
        let tables = Arc::new(Tables::new(Arc::new(PageStore::in_memory(256).unwrap())));
        tables.create("t", FieldType::Int64).unwrap();
        TxnManager::new(Arc::new(LockManager::default()), tables)
    }

    #[test]
    fn test_open_from_engine_config() {
        let config = EngineConfig {
            storage: StorageConfig::in_memory(1024),
            lock: LockConfig {
                wait_timeout_ms: Some(250),
            },
        };
        let tm = TxnManager::open(&config).unwrap();
        assert_eq!(tm.tables().store().page_size(), 1024);
        assert_eq!(tm.lock_manager().config().wait_timeout_ms, Some(250));

        let bad = EngineConfig {
            lock: LockConfig {
                wait_timeout_ms: Some(0),
            },
            ..EngineConfig::default()
        };
        assert!(matches!(
            TxnManager::open(&bad),
            Err(BasaltError::ConfigError(_))
        ));
    }

    #[test]
    fn test_begin_assigns_increasing_ids() {
        let tm = manager();
        let a = tm.begin();
        let b = tm.begin();
        assert!(a.id() < b.id());
        assert_eq!(a.state(), TxnState::Growing);
        assert_eq!(tm.active_count(), 2);
        assert_eq!(tm.get(a.id()).unwrap().id(), a.id());
    }

    #[test]
    fn test_commit_releases_locks_and_evicts() {
        let tm = manager();
        let txn = tm.begin();
        tm.lock_manager()
            .lock_table(&txn, LockMode::IntentionExclusive, "t")
            .unwrap();
        tm.lock_manager()
            .lock_tuple(&txn, LockMode::Exclusive, "t", &int_key(1))
            .unwrap();

        tm.commit(&txn).unwrap();
        assert_eq!(txn.state(), TxnState::Committed);
        assert!(txn.table_locks().is_empty());
        assert!(txn.tuple_locks().is_empty());
        assert!(tm.get(txn.id()).is_none());
        assert_eq!(tm.active_count(), 0);

        assert!(matches!(
            tm.commit(&txn),
            Err(BasaltError::ProtocolViolation { .. })
        ));
        assert!(tm.abort(&txn).is_err());
    }

    #[test]
    fn test_commit_keeps_writes() {
        let tm = manager();
        let table = tm.tables().get("t").unwrap();
        let txn = tm.begin();
        txn.record_insert("t", &int_key(5));
        table.lock().insert(&int_key(5), b"five").unwrap();
        tm.commit(&txn).unwrap();
        assert_eq!(table.lock().get(&int_key(5)).unwrap().unwrap().as_ref(), b"five");
    }

    #[test]
    fn test_abort_undoes_in_reverse() {
        let tm = manager();
        let table = tm.tables().get("t").unwrap();
        table.lock().insert(&int_key(2), b"two").unwrap();
        table.lock().insert(&int_key(3), b"three").unwrap();

        let txn = tm.begin();
        {
            let mut t = table.lock();
            txn.record_insert("t", &int_key(1));
            t.insert(&int_key(1), b"one").unwrap();
            txn.record_update("t", &int_key(2), b"two");
            t.update(&int_key(2), b"TWO").unwrap();
            let old = t.take(&int_key(3)).unwrap().unwrap();
            txn.record_delete("t", &int_key(3), &old);
            // Same key touched twice: only reverse order restores it
            txn.record_update("t", &int_key(2), b"TWO");
            t.update(&int_key(2), b"2").unwrap();
        }

        tm.abort(&txn).unwrap();
        let t = table.lock();
        assert!(t.get(&int_key(1)).unwrap().is_none());
        assert_eq!(t.get(&int_key(2)).unwrap().unwrap().as_ref(), b"two");
        assert_eq!(t.get(&int_key(3)).unwrap().unwrap().as_ref(), b"three");
        assert_eq!(t.tuple_num().unwrap(), 2);
        assert_eq!(txn.state(), TxnState::Aborted);
        assert_eq!(tm.active_count(), 0);
    }

    #[test]
    #[should_panic(expected = "failed to undo")]
    fn test_abort_panics_on_unknown_table() {
        let tm = manager();
        let txn = tm.begin();
        txn.record_insert("missing", &int_key(1));
        let _ = tm.abort(&txn);
    }
}
