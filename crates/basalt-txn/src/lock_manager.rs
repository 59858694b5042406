//! Multi-granularity lock manager with wait-die deadlock avoidance.
//!
//! Tables and rows are locked in one of five modes. Each locked resource owns
//! a wait queue: a request list in arrival order guarded by a mutex, plus a
//! condition variable that every release notifies. A blocked request re-checks
//! its conflicts on every wake.
//!
//! A new request waits for every conflicting granted request, for conflicting
//! requests queued ahead of it even while those still wait, and for an upgrade
//! in flight on the resource. An upgrade waits for conflicting granted requests.
//!
//! Deadlocks are avoided with wait-die: a transaction may only wait for
//! transactions younger than itself. If any transaction it would wait for is
//! older, the requester gives up immediately with `DeadlockAvoided`.
//!
//! Every failure moves the requesting transaction to ABORTED.

use crate::transaction::{Transaction, TxnId, TxnState};
use basalt_common::{BasaltError, LockConfig, Result};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    pub const ALL: [LockMode; 5] = [
        LockMode::IntentionShared,
        LockMode::IntentionExclusive,
        LockMode::Shared,
        LockMode::SharedIntentionExclusive,
        LockMode::Exclusive,
    ];

    /// Returns true if a lock held in `self` can be granted alongside a request for `other`.
    pub fn coexists_with(self, other: LockMode) -> bool {
        use LockMode::*;
        match self {
            IntentionShared => other != Exclusive,
            IntentionExclusive => matches!(other, IntentionShared | IntentionExclusive),
            Shared => matches!(other, IntentionShared | Shared),
            SharedIntentionExclusive => other == IntentionShared,
            Exclusive => false,
        }
    }

    /// Returns true if a holder of `self` may upgrade to `to`.
    pub fn can_upgrade_to(self, to: LockMode) -> bool {
        use LockMode::*;
        match self {
            IntentionShared => to != IntentionShared,
            Shared | IntentionExclusive => matches!(to, Exclusive | SharedIntentionExclusive),
            SharedIntentionExclusive => to == Exclusive,
            Exclusive => false,
        }
    }

    /// Table modes that permit a row lock of this mode.
    fn required_table_modes(self) -> &'static [LockMode] {
        use LockMode::*;
        match self {
            Exclusive => &[Exclusive, IntentionExclusive, SharedIntentionExclusive],
            _ => &[
                Shared,
                Exclusive,
                IntentionShared,
                IntentionExclusive,
                SharedIntentionExclusive,
            ],
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockMode::IntentionShared => "IS",
            LockMode::IntentionExclusive => "IX",
            LockMode::Shared => "S",
            LockMode::SharedIntentionExclusive => "SIX",
            LockMode::Exclusive => "X",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

#[derive(Debug, Default)]
struct LockQueue {
    /// Requests in arrival order, granted and waiting alike.
    requests: Vec<LockRequest>,
    /// Transaction currently waiting to upgrade its lock on this resource.
    upgrading: Option<TxnId>,
}

impl LockQueue {
    fn position(&self, txn_id: TxnId) -> Option<usize> {
        self.requests.iter().position(|r| r.txn_id == txn_id)
    }

    fn mode_of(&self, txn_id: TxnId) -> Option<LockMode> {
        self.position(txn_id).map(|i| self.requests[i].mode)
    }

    fn remove(&mut self, txn_id: TxnId) -> Option<LockMode> {
        if self.upgrading == Some(txn_id) {
            self.upgrading = None;
        }
        let index = self.position(txn_id)?;
        Some(self.requests.remove(index).mode)
    }

    /// True once no request is queued and no upgrade is in flight.
    fn is_idle(&self) -> bool {
        self.requests.is_empty() && self.upgrading.is_none()
    }

    /// Granted requests of other transactions that conflict with `mode`.
    fn granted_conflicts(&self, txn_id: TxnId, mode: LockMode) -> Vec<TxnId> {
        self.requests
            .iter()
            .filter(|r| r.granted && r.txn_id != txn_id && !r.mode.coexists_with(mode))
            .map(|r| r.txn_id)
            .collect()
    }

    /// Requests the waiting request at `index` must let go first: conflicting
    /// granted requests anywhere in the queue and conflicting requests queued
    /// ahead of it, granted or not.
    fn blockers(&self, index: usize, mode: LockMode) -> Vec<TxnId> {
        let txn_id = self.requests[index].txn_id;
        self.requests
            .iter()
            .enumerate()
            .filter(|(i, r)| {
                (r.granted || *i < index) && r.txn_id != txn_id && !r.mode.coexists_with(mode)
            })
            .map(|(_, r)| r.txn_id)
            .collect()
    }
}

#[derive(Debug, Default)]
struct WaitQueue {
    queue: Mutex<LockQueue>,
    cvar: Condvar,
}

/// Outcome of a successful acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    AlreadyHeld,
    Granted,
    Upgraded(LockMode),
}

type TupleKey = (String, Bytes);

/// Grants and releases table and row locks.
///
/// A resource's wait queue exists only while some transaction holds or waits
/// for a lock on it.
#[derive(Debug, Default)]
pub struct LockManager {
    tables: Mutex<HashMap<String, Arc<WaitQueue>>>,
    tuples: Mutex<HashMap<TupleKey, Arc<WaitQueue>>>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(config: LockConfig) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            tuples: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Number of tables and rows that currently have a wait queue.
    pub fn tracked_resources(&self) -> usize {
        self.tables.lock().len() + self.tuples.lock().len()
    }

    fn table_queue(&self, table: &str) -> Arc<WaitQueue> {
        let mut tables = self.tables.lock();
        Arc::clone(tables.entry(table.to_string()).or_default())
    }

    fn tuple_queue(&self, key: &TupleKey) -> Arc<WaitQueue> {
        let mut tuples = self.tuples.lock();
        Arc::clone(tuples.entry(key.clone()).or_default())
    }

    /// Drops the queue for `key` from `map` once it is idle and the caller's
    /// `wq` is the only handle outside the map.
    fn prune<K, Q>(map: &Mutex<HashMap<K, Arc<WaitQueue>>>, key: &Q, wq: &Arc<WaitQueue>)
    where
        K: Borrow<Q> + Eq + Hash,
        Q: Eq + Hash + ?Sized,
    {
        let mut map = map.lock();
        let idle = match map.get(key) {
            Some(entry) if Arc::ptr_eq(entry, wq) => {
                Arc::strong_count(wq) == 2 && wq.queue.lock().is_idle()
            }
            _ => false,
        };
        if idle {
            map.remove(key);
        }
    }

    /// Locks `table` in `mode`, upgrading a weaker lock already held.
    pub fn lock_table(&self, txn: &Transaction, mode: LockMode, table: &str) -> Result<()> {
        self.check_phase(txn, mode, table)?;

        let wq = self.table_queue(table);
        match self.acquire(&wq, txn, mode, table) {
            Ok(Grant::AlreadyHeld) => {}
            Ok(Grant::Granted) => txn.add_table_lock(table, mode),
            Ok(Grant::Upgraded(old)) => {
                txn.remove_table_lock(table, old);
                txn.add_table_lock(table, mode);
            }
            Err(e) => {
                // A request dropped while waiting takes the held lock with it
                if wq.queue.lock().mode_of(txn.id()).is_none() {
                    if let Some(old) = txn.holds_table_lock(table) {
                        txn.remove_table_lock(table, old);
                    }
                }
                Self::prune(&self.tables, table, &wq);
                return Err(e);
            }
        }
        debug!(txn = txn.id(), table, mode = %mode, "table lock granted");
        Ok(())
    }

    /// Locks row `key` of `table` in `mode`. Requires a table lock that permits it.
    pub fn lock_tuple(
        &self,
        txn: &Transaction,
        mode: LockMode,
        table: &str,
        key: &[u8],
    ) -> Result<()> {
        self.check_phase(txn, mode, table)?;

        let permitted = txn
            .holds_table_lock(table)
            .is_some_and(|held| mode.required_table_modes().contains(&held));
        if !permitted {
            txn.set_state(TxnState::Aborted);
            warn!(txn = txn.id(), table, mode = %mode, "row lock without table lock");
            return Err(BasaltError::InvalidRowLockRequest {
                txn_id: txn.id(),
                table: table.to_string(),
            });
        }

        let tuple = (table.to_string(), Bytes::copy_from_slice(key));
        let wq = self.tuple_queue(&tuple);
        match self.acquire(&wq, txn, mode, table) {
            Ok(Grant::AlreadyHeld) => {}
            Ok(Grant::Granted) => txn.add_tuple_lock(table, key, mode),
            Ok(Grant::Upgraded(old)) => {
                txn.remove_tuple_lock(table, key, old);
                txn.add_tuple_lock(table, key, mode);
            }
            Err(e) => {
                if wq.queue.lock().mode_of(txn.id()).is_none() {
                    if let Some(old) = txn.holds_tuple_lock(table, key) {
                        txn.remove_tuple_lock(table, key, old);
                    }
                }
                Self::prune(&self.tuples, &tuple, &wq);
                return Err(e);
            }
        }
        debug!(txn = txn.id(), table, mode = %mode, "row lock granted");
        Ok(())
    }

    /// Releases the lock `txn` holds on `table`. Returns false if it held none.
    ///
    /// Releasing while GROWING moves the transaction to SHRINKING.
    pub fn unlock_table(&self, txn: &Transaction, table: &str) -> bool {
        let wq = match self.tables.lock().get(table) {
            Some(wq) => Arc::clone(wq),
            None => return false,
        };
        let released = Self::release(&wq, txn.id());
        Self::prune(&self.tables, table, &wq);
        if let Some(mode) = released {
            txn.remove_table_lock(table, mode);
            txn.begin_shrinking();
            debug!(txn = txn.id(), table, mode = %mode, "table lock released");
        }
        released.is_some()
    }

    /// Releases the lock `txn` holds on row `key` of `table`. Returns false if it held none.
    pub fn unlock_tuple(&self, txn: &Transaction, table: &str, key: &[u8]) -> bool {
        let tuple = (table.to_string(), Bytes::copy_from_slice(key));
        let wq = match self.tuples.lock().get(&tuple) {
            Some(wq) => Arc::clone(wq),
            None => return false,
        };
        let released = Self::release(&wq, txn.id());
        Self::prune(&self.tuples, &tuple, &wq);
        if let Some(mode) = released {
            txn.remove_tuple_lock(table, key, mode);
            txn.begin_shrinking();
            debug!(txn = txn.id(), table, mode = %mode, "row lock released");
        }
        released.is_some()
    }

    fn release(wq: &WaitQueue, txn_id: TxnId) -> Option<LockMode> {
        let released = wq.queue.lock().remove(txn_id);
        wq.cvar.notify_all();
        released
    }

    /// Two-phase locking: no acquisitions once the transaction started releasing.
    fn check_phase(&self, txn: &Transaction, mode: LockMode, table: &str) -> Result<()> {
        let state = txn.state();
        let reason = match state {
            TxnState::Growing => return Ok(()),
            TxnState::Shrinking => "lock requested while shrinking",
            TxnState::Committed => "lock requested after commit",
            TxnState::Aborted => "lock requested after abort",
        };
        if state == TxnState::Shrinking {
            txn.set_state(TxnState::Aborted);
        }
        warn!(txn = txn.id(), table, mode = %mode, state = %state, "two-phase locking violated");
        Err(BasaltError::ProtocolViolation {
            txn_id: txn.id(),
            reason: reason.to_string(),
        })
    }

    fn acquire(
        &self,
        wq: &WaitQueue,
        txn: &Transaction,
        mode: LockMode,
        resource: &str,
    ) -> Result<Grant> {
        let result = {
            let mut queue = wq.queue.lock();
            match queue.mode_of(txn.id()) {
                Some(held) if held == mode => Ok(Grant::AlreadyHeld),
                Some(held) => self.upgrade(wq, &mut queue, txn.id(), held, mode, resource),
                None => self.request(wq, &mut queue, txn.id(), mode, resource),
            }
        };
        match result {
            Err(_) => {
                txn.set_state(TxnState::Aborted);
                wq.cvar.notify_all();
            }
            // Requests held back by the finished upgrade may proceed
            Ok(Grant::Upgraded(_)) => {
                wq.cvar.notify_all();
            }
            Ok(_) => {}
        }
        result
    }

    fn upgrade(
        &self,
        wq: &WaitQueue,
        queue: &mut MutexGuard<'_, LockQueue>,
        txn_id: TxnId,
        held: LockMode,
        mode: LockMode,
        resource: &str,
    ) -> Result<Grant> {
        if queue.upgrading.is_some() {
            warn!(txn = txn_id, resource, "concurrent upgrade rejected");
            return Err(BasaltError::ConcurrentUpgradeConflict { txn_id });
        }
        if !held.can_upgrade_to(mode) {
            warn!(txn = txn_id, resource, from = %held, to = %mode, "illegal upgrade");
            return Err(BasaltError::IllegalUpgrade {
                txn_id,
                from: held.to_string(),
                to: mode.to_string(),
            });
        }

        queue.upgrading = Some(txn_id);
        let started = Instant::now();
        loop {
            let conflicts = queue.granted_conflicts(txn_id, mode);
            if conflicts.is_empty() {
                break;
            }
            if let Some(e) = self.wait_or_die(wq, queue, txn_id, &conflicts, started, resource) {
                return Err(e);
            }
        }

        queue.upgrading = None;
        if let Some(index) = queue.position(txn_id) {
            queue.requests[index].mode = mode;
        }
        Ok(Grant::Upgraded(held))
    }

    fn request(
        &self,
        wq: &WaitQueue,
        queue: &mut MutexGuard<'_, LockQueue>,
        txn_id: TxnId,
        mode: LockMode,
        resource: &str,
    ) -> Result<Grant> {
        queue.requests.push(LockRequest {
            txn_id,
            mode,
            granted: false,
        });

        let started = Instant::now();
        loop {
            let index = match queue.position(txn_id) {
                Some(index) => index,
                None => {
                    return Err(BasaltError::Internal(format!(
                        "lock request of txn {} vanished from {}",
                        txn_id, resource
                    )))
                }
            };
            let mut blockers = queue.blockers(index, mode);
            // An upgrade in flight holds back every new request
            if let Some(upgrader) = queue.upgrading.filter(|&id| id != txn_id) {
                if !blockers.contains(&upgrader) {
                    blockers.push(upgrader);
                }
            }

            if blockers.is_empty() {
                queue.requests[index].granted = true;
                return Ok(Grant::Granted);
            }
            if let Some(e) = self.wait_or_die(wq, queue, txn_id, &blockers, started, resource) {
                return Err(e);
            }
        }
    }

    /// Wait-die step: dies if any blocking transaction is older, otherwise waits
    /// for the next release. Returns the error to fail with, or `None` to re-check.
    fn wait_or_die(
        &self,
        wq: &WaitQueue,
        queue: &mut MutexGuard<'_, LockQueue>,
        txn_id: TxnId,
        conflicts: &[TxnId],
        started: Instant,
        resource: &str,
    ) -> Option<BasaltError> {
        if let Some(&holder) = conflicts.iter().filter(|&&h| h < txn_id).min() {
            queue.remove(txn_id);
            warn!(txn = txn_id, holder, resource, "wait-die: younger requester aborted");
            return Some(BasaltError::DeadlockAvoided { txn_id, holder });
        }

        debug!(txn = txn_id, resource, holders = ?conflicts, "waiting for lock");
        match self.config.wait_timeout() {
            Some(timeout) => {
                let timed_out = wq.cvar.wait_until(queue, started + timeout).timed_out();
                if timed_out {
                    queue.remove(txn_id);
                    let waited_ms = started.elapsed().as_millis() as u64;
                    warn!(txn = txn_id, resource, waited_ms, "lock wait timed out");
                    return Some(BasaltError::LockWaitTimeout { txn_id, waited_ms });
                }
            }
            None => wq.cvar.wait(queue),
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LockMode::*;

    #[test]
    fn test_lock_mode_compatibility_matrix() {
        let expected = [
            // IS    IX     S      SIX    X
            [true, true, true, true, false],     // IS held
            [true, true, false, false, false],   // IX held
            [true, false, true, false, false],   // S held
            [true, false, false, false, false],  // SIX held
            [false, false, false, false, false], // X held
        ];
        for (i, held) in LockMode::ALL.iter().enumerate() {
            for (j, requested) in LockMode::ALL.iter().enumerate() {
                assert_eq!(
                    held.coexists_with(*requested),
                    expected[i][j],
                    "{} held, {} requested",
                    held,
                    requested
                );
            }
        }
    }

    #[test]
    fn test_lock_mode_upgrade_paths() {
        for to in [IntentionExclusive, Shared, SharedIntentionExclusive, Exclusive] {
            assert!(IntentionShared.can_upgrade_to(to));
        }
        assert!(Shared.can_upgrade_to(Exclusive));
        assert!(Shared.can_upgrade_to(SharedIntentionExclusive));
        assert!(!Shared.can_upgrade_to(IntentionExclusive));
        assert!(IntentionExclusive.can_upgrade_to(SharedIntentionExclusive));
        assert!(SharedIntentionExclusive.can_upgrade_to(Exclusive));
        assert!(!SharedIntentionExclusive.can_upgrade_to(Shared));
        for to in LockMode::ALL {
            assert!(!Exclusive.can_upgrade_to(to));
        }
    }

    #[test]
    fn test_lock_mode_display() {
        let names: Vec<String> = LockMode::ALL.iter().map(|m| m.to_string()).collect();
        assert_eq!(names, vec!["IS", "IX", "S", "SIX", "X"]);
    }

    #[test]
    fn test_lock_table_grant_and_release() {
        let lm = LockManager::default();
        let txn = Transaction::new(1);
        lm.lock_table(&txn, Shared, "t").unwrap();
        assert_eq!(txn.holds_table_lock("t"), Some(Shared));

        // Same mode again is a no-op
        lm.lock_table(&txn, Shared, "t").unwrap();
        assert_eq!(txn.table_locks().len(), 1);

        assert!(lm.unlock_table(&txn, "t"));
        assert_eq!(txn.holds_table_lock("t"), None);
        assert_eq!(txn.state(), TxnState::Shrinking);
        assert!(!lm.unlock_table(&txn, "t"));
    }

    #[test]
    fn test_lock_table_upgrade() {
        let lm = LockManager::default();
        let txn = Transaction::new(1);
        lm.lock_table(&txn, IntentionShared, "t").unwrap();
        lm.lock_table(&txn, Exclusive, "t").unwrap();
        assert_eq!(txn.holds_table_lock("t"), Some(Exclusive));
        assert_eq!(txn.table_locks().len(), 1);
    }

    #[test]
    fn test_lock_table_illegal_upgrade_aborts() {
        let lm = LockManager::default();
        let txn = Transaction::new(1);
        lm.lock_table(&txn, Exclusive, "t").unwrap();
        let err = lm.lock_table(&txn, Shared, "t").unwrap_err();
        assert!(matches!(err, BasaltError::IllegalUpgrade { txn_id: 1, .. }));
        assert_eq!(txn.state(), TxnState::Aborted);
        // The exclusive lock is still held
        assert_eq!(txn.holds_table_lock("t"), Some(Exclusive));
    }

    #[test]
    fn test_lock_after_release_is_protocol_violation() {
        let lm = LockManager::default();
        let txn = Transaction::new(1);
        lm.lock_table(&txn, Shared, "a").unwrap();
        lm.unlock_table(&txn, "a");

        let err = lm.lock_table(&txn, Shared, "b").unwrap_err();
        assert!(matches!(err, BasaltError::ProtocolViolation { txn_id: 1, .. }));
        assert_eq!(txn.state(), TxnState::Aborted);

        // Still rejected once aborted
        assert!(matches!(
            lm.lock_table(&txn, Shared, "c"),
            Err(BasaltError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_row_lock_requires_table_lock() {
        let lm = LockManager::default();
        let txn = Transaction::new(1);
        let err = lm.lock_tuple(&txn, Shared, "t", b"k").unwrap_err();
        assert!(matches!(err, BasaltError::InvalidRowLockRequest { .. }));
        assert_eq!(txn.state(), TxnState::Aborted);

        let txn = Transaction::new(2);
        lm.lock_table(&txn, IntentionShared, "t").unwrap();
        lm.lock_tuple(&txn, Shared, "t", b"k").unwrap();
        assert_eq!(txn.holds_tuple_lock("t", b"k"), Some(Shared));
        // IS does not permit an exclusive row lock
        assert!(matches!(
            lm.lock_tuple(&txn, Exclusive, "t", b"other"),
            Err(BasaltError::InvalidRowLockRequest { .. })
        ));
    }

    #[test]
    fn test_younger_requester_dies() {
        let lm = LockManager::default();
        let older = Transaction::new(1);
        let younger = Transaction::new(2);
        lm.lock_table(&older, Exclusive, "t").unwrap();

        let err = lm.lock_table(&younger, Shared, "t").unwrap_err();
        assert!(matches!(
            err,
            BasaltError::DeadlockAvoided {
                txn_id: 2,
                holder: 1
            }
        ));
        assert_eq!(younger.state(), TxnState::Aborted);
        assert_eq!(younger.holds_table_lock("t"), None);

        // The dead request left no trace in the queue
        lm.unlock_table(&older, "t");
        let third = Transaction::new(3);
        lm.lock_table(&third, Exclusive, "t").unwrap();
    }

    #[test]
    fn test_upgrade_dies_against_older_holder() {
        let lm = LockManager::default();
        let older = Transaction::new(1);
        let younger = Transaction::new(2);
        lm.lock_table(&older, Shared, "t").unwrap();
        lm.lock_table(&younger, Shared, "t").unwrap();

        let err = lm.lock_table(&younger, Exclusive, "t").unwrap_err();
        assert!(matches!(err, BasaltError::DeadlockAvoided { txn_id: 2, .. }));
        // The upgrade failure dropped the shared lock as well
        assert_eq!(younger.holds_table_lock("t"), None);
        assert_eq!(older.holds_table_lock("t"), Some(Shared));

        // With the younger one gone the older holder upgrades freely
        lm.lock_table(&older, Exclusive, "t").unwrap();
    }

    #[test]
    fn test_lock_wait_timeout() {
        let lm = LockManager::new(LockConfig {
            wait_timeout_ms: Some(50),
        });
        let older = Transaction::new(1);
        let younger = Transaction::new(2);
        lm.lock_table(&younger, Exclusive, "t").unwrap();

        let err = lm.lock_table(&older, Exclusive, "t").unwrap_err();
        assert!(matches!(err, BasaltError::LockWaitTimeout { txn_id: 1, .. }));
        assert_eq!(older.state(), TxnState::Aborted);
        assert_eq!(older.holds_table_lock("t"), None);
        assert_eq!(younger.holds_table_lock("t"), Some(Exclusive));
    }
}
