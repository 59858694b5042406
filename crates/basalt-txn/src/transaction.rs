//! Transaction handle: phase, held locks and the undo log.

use crate::lock_manager::LockMode;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Transaction identifier. Smaller ids belong to older transactions.
pub type TxnId = u64;

/// Two-phase locking phase, plus the two terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnState {
    /// May acquire locks.
    Growing,
    /// Has released a lock; may not acquire any more.
    Shrinking,
    Committed,
    Aborted,
}

impl TxnState {
    #[inline]
    pub fn is_finished(self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnState::Growing => "GROWING",
            TxnState::Shrinking => "SHRINKING",
            TxnState::Committed => "COMMITTED",
            TxnState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// What a logged write did, and therefore how to reverse it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoKind {
    /// Key was inserted; undone by deleting it.
    Inserted,
    /// Key was deleted; undone by inserting the old value.
    Deleted,
    /// Key's value was replaced; undone by restoring the old value.
    Updated,
}

/// One entry of a transaction's undo log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoRecord {
    pub kind: UndoKind,
    pub table: String,
    pub key: Bytes,
    /// Value before the write. `None` for inserts.
    pub old_value: Option<Bytes>,
}

#[derive(Debug, Default)]
struct LockSet {
    tables: HashMap<LockMode, HashSet<String>>,
    tuples: HashMap<LockMode, HashMap<String, HashSet<Bytes>>>,
}

/// A transaction. Shared as `Arc<Transaction>` between its owner, the
/// transaction manager's registry and the lock manager.
///
/// Writes are applied directly to table indexes; the caller records an undo
/// entry before each write so that abort can reverse it.
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    state: Mutex<TxnState>,
    locks: Mutex<LockSet>,
    undo: Mutex<Vec<UndoRecord>>,
}

impl Transaction {
    pub(crate) fn new(id: TxnId) -> Self {
        Self {
            id,
            state: Mutex::new(TxnState::Growing),
            locks: Mutex::new(LockSet::default()),
            undo: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TxnState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TxnState) {
        *self.state.lock() = state;
    }

    /// Moves GROWING to SHRINKING; any other state is left alone.
    pub(crate) fn begin_shrinking(&self) {
        let mut state = self.state.lock();
        if *state == TxnState::Growing {
            *state = TxnState::Shrinking;
        }
    }

    // ------------------------------------------------------------------
    // Undo log
    // ------------------------------------------------------------------

    pub fn record_insert(&self, table: &str, key: &[u8]) {
        self.push_undo(UndoKind::Inserted, table, key, None);
    }

    pub fn record_delete(&self, table: &str, key: &[u8], old_value: &[u8]) {
        self.push_undo(UndoKind::Deleted, table, key, Some(old_value));
    }

    pub fn record_update(&self, table: &str, key: &[u8], old_value: &[u8]) {
        self.push_undo(UndoKind::Updated, table, key, Some(old_value));
    }

    fn push_undo(&self, kind: UndoKind, table: &str, key: &[u8], old_value: Option<&[u8]>) {
        self.undo.lock().push(UndoRecord {
            kind,
            table: table.to_string(),
            key: Bytes::copy_from_slice(key),
            old_value: old_value.map(Bytes::copy_from_slice),
        });
    }

    /// Number of undo entries logged so far.
    pub fn undo_len(&self) -> usize {
        self.undo.lock().len()
    }

    /// Drains the undo log in the order the entries were recorded.
    pub(crate) fn take_undo(&self) -> Vec<UndoRecord> {
        std::mem::take(&mut *self.undo.lock())
    }

    // ------------------------------------------------------------------
    // Lock sets
    // ------------------------------------------------------------------

    /// Mode held on `table`, if any.
    pub fn holds_table_lock(&self, table: &str) -> Option<LockMode> {
        let locks = self.locks.lock();
        LockMode::ALL
            .into_iter()
            .find(|mode| locks.tables.get(mode).is_some_and(|set| set.contains(table)))
    }

    /// Mode held on row `key` of `table`, if any.
    pub fn holds_tuple_lock(&self, table: &str, key: &[u8]) -> Option<LockMode> {
        let locks = self.locks.lock();
        LockMode::ALL.into_iter().find(|mode| {
            locks
                .tuples
                .get(mode)
                .and_then(|per_table| per_table.get(table))
                .is_some_and(|keys| keys.contains(key))
        })
    }

    /// Held table locks as `(table, mode)`.
    pub fn table_locks(&self) -> Vec<(String, LockMode)> {
        let locks = self.locks.lock();
        locks
            .tables
            .iter()
            .flat_map(|(mode, tables)| tables.iter().map(move |t| (t.clone(), *mode)))
            .collect()
    }

    /// Held row locks as `(table, key, mode)`.
    pub fn tuple_locks(&self) -> Vec<(String, Bytes, LockMode)> {
        let locks = self.locks.lock();
        locks
            .tuples
            .iter()
            .flat_map(|(mode, per_table)| {
                per_table.iter().flat_map(move |(table, keys)| {
                    keys.iter().map(move |k| (table.clone(), k.clone(), *mode))
                })
            })
            .collect()
    }

    pub(crate) fn add_table_lock(&self, table: &str, mode: LockMode) {
        self.locks
            .lock()
            .tables
            .entry(mode)
            .or_default()
            .insert(table.to_string());
    }

    pub(crate) fn remove_table_lock(&self, table: &str, mode: LockMode) {
        if let Some(set) = self.locks.lock().tables.get_mut(&mode) {
            set.remove(table);
        }
    }

    pub(crate) fn add_tuple_lock(&self, table: &str, key: &[u8], mode: LockMode) {
        self.locks
            .lock()
            .tuples
            .entry(mode)
            .or_default()
            .entry(table.to_string())
            .or_default()
            .insert(Bytes::copy_from_slice(key));
    }

    pub(crate) fn remove_tuple_lock(&self, table: &str, key: &[u8], mode: LockMode) {
        let mut locks = self.locks.lock();
        if let Some(keys) = locks
            .tuples
            .get_mut(&mode)
            .and_then(|per_table| per_table.get_mut(table))
        {
            keys.remove(key);
        }
    }
}
