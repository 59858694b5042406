//! Lock manager integration tests.
//!
//! Covers the compatibility matrix with live transactions, wait-die in both
//! directions with real threads, upgrades under contention and two-phase
//! locking enforcement.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use basalt_buffer::PageStore;
use basalt_common::{BasaltError, LockConfig};
use basalt_storage::{int_key, Tables};
use basalt_txn::{LockManager, LockMode, TxnManager, TxnState};

// =============================================================================
// Helpers
// =============================================================================

fn manager_with(config: LockConfig) -> Arc<TxnManager> {
    let tables = Arc::new(Tables::new(Arc::new(PageStore::in_memory(256).unwrap())));
    Arc::new(TxnManager::new(Arc::new(LockManager::new(config)), tables))
}

fn manager() -> Arc<TxnManager> {
    manager_with(LockConfig::default())
}

const SETTLE: Duration = Duration::from_millis(100);

// =============================================================================
// Compatibility
// =============================================================================

#[test]
fn test_compatibility_matrix_with_live_transactions() {
    for held in LockMode::ALL {
        for requested in LockMode::ALL {
            let tm = manager();
            let lm = tm.lock_manager();
            let holder = tm.begin();
            let requester = tm.begin();
            lm.lock_table(&holder, held, "t").unwrap();

            // The requester is younger: it is granted or dies, never waits
            let result = lm.lock_table(&requester, requested, "t");
            if held.coexists_with(requested) {
                assert!(result.is_ok(), "{} then {} should coexist", held, requested);
                assert_eq!(requester.holds_table_lock("t"), Some(requested));
            } else {
                assert!(
                    matches!(result, Err(BasaltError::DeadlockAvoided { .. })),
                    "{} then {} should conflict",
                    held,
                    requested
                );
                assert_eq!(requester.state(), TxnState::Aborted);
            }
        }
    }
}

#[test]
fn test_shared_holders_run_together() {
    let tm = manager();
    let lm = tm.lock_manager();
    let txns: Vec<_> = (0..4).map(|_| tm.begin()).collect();
    for txn in &txns {
        lm.lock_table(txn, LockMode::Shared, "t").unwrap();
    }
    for txn in &txns {
        assert_eq!(txn.holds_table_lock("t"), Some(LockMode::Shared));
    }
}

// =============================================================================
// Wait-die
// =============================================================================

#[test]
fn test_older_requester_waits_for_younger_holder() {
    let tm = manager();
    let older = tm.begin();
    let younger = tm.begin();
    tm.lock_manager()
        .lock_table(&younger, LockMode::Exclusive, "t")
        .unwrap();

    let granted = Arc::new(AtomicBool::new(false));
    let handle = {
        let tm = Arc::clone(&tm);
        let older = Arc::clone(&older);
        let granted = Arc::clone(&granted);
        thread::spawn(move || {
            tm.lock_manager()
                .lock_table(&older, LockMode::Exclusive, "t")
                .unwrap();
            granted.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(SETTLE);
    assert!(!granted.load(Ordering::SeqCst), "older must wait");

    tm.commit(&younger).unwrap();
    handle.join().unwrap();
    assert!(granted.load(Ordering::SeqCst));
    assert_eq!(older.holds_table_lock("t"), Some(LockMode::Exclusive));
}

#[test]
fn test_younger_requester_dies_against_older_holder() {
    let tm = manager();
    let older = tm.begin();
    let younger = tm.begin();
    tm.lock_manager()
        .lock_table(&older, LockMode::Shared, "t")
        .unwrap();

    let err = tm
        .lock_manager()
        .lock_table(&younger, LockMode::IntentionExclusive, "t")
        .unwrap_err();
    assert!(err.is_lock_failure());
    assert!(matches!(
        err,
        BasaltError::DeadlockAvoided { txn_id, holder } if txn_id == younger.id() && holder == older.id()
    ));

    tm.abort(&younger).unwrap();
    assert_eq!(tm.active_count(), 1);
}

#[test]
fn test_upgrade_waits_for_younger_shared_holder() {
    let tm = manager();
    let older = tm.begin();
    let younger = tm.begin();
    let lm = tm.lock_manager();
    lm.lock_table(&older, LockMode::Shared, "t").unwrap();
    lm.lock_table(&younger, LockMode::Shared, "t").unwrap();

    let (tx, rx) = mpsc::channel();
    let handle = {
        let tm = Arc::clone(&tm);
        let older = Arc::clone(&older);
        thread::spawn(move || {
            let result = tm
                .lock_manager()
                .lock_table(&older, LockMode::Exclusive, "t");
            tx.send(result.is_ok()).unwrap();
        })
    };

    assert!(rx.recv_timeout(SETTLE).is_err(), "upgrade must wait");

    // A second upgrade on the same resource is rejected outright
    let err = lm
        .lock_table(&younger, LockMode::Exclusive, "t")
        .unwrap_err();
    assert!(matches!(err, BasaltError::ConcurrentUpgradeConflict { .. }));
    tm.abort(&younger).unwrap();

    assert!(rx.recv().unwrap());
    handle.join().unwrap();
    assert_eq!(older.holds_table_lock("t"), Some(LockMode::Exclusive));
    assert_eq!(older.table_locks().len(), 1);
}

#[test]
fn test_new_request_waits_behind_pending_upgrade() {
    let tm = manager();
    let requester = tm.begin();
    let upgrader = tm.begin();
    let holder = tm.begin();
    let lm = tm.lock_manager();
    lm.lock_table(&upgrader, LockMode::IntentionShared, "t").unwrap();
    lm.lock_table(&holder, LockMode::Shared, "t").unwrap();

    // upgrader goes IS -> IX and waits on the younger holder's S
    let upgrade = {
        let tm = Arc::clone(&tm);
        let upgrader = Arc::clone(&upgrader);
        thread::spawn(move || {
            tm.lock_manager()
                .lock_table(&upgrader, LockMode::IntentionExclusive, "t")
                .unwrap();
        })
    };
    thread::sleep(SETTLE);

    // IS coexists with every granted lock but still queues behind the upgrade
    let (tx, rx) = mpsc::channel();
    let request = {
        let tm = Arc::clone(&tm);
        let requester = Arc::clone(&requester);
        thread::spawn(move || {
            let result = tm
                .lock_manager()
                .lock_table(&requester, LockMode::IntentionShared, "t");
            tx.send(result.is_ok()).unwrap();
        })
    };
    assert!(rx.recv_timeout(SETTLE).is_err());

    // A transaction younger than the upgrader may not wait for it
    let late = tm.begin();
    assert!(matches!(
        lm.lock_table(&late, LockMode::IntentionShared, "t"),
        Err(BasaltError::DeadlockAvoided { holder, .. }) if holder == upgrader.id()
    ));
    tm.abort(&late).unwrap();

    tm.commit(&holder).unwrap();
    upgrade.join().unwrap();
    assert!(rx.recv().unwrap());
    request.join().unwrap();
    assert_eq!(upgrader.holds_table_lock("t"), Some(LockMode::IntentionExclusive));
    assert_eq!(requester.holds_table_lock("t"), Some(LockMode::IntentionShared));
}

#[test]
fn test_request_queued_behind_waiting_conflict_dies() {
    let tm = manager();
    let older = tm.begin();
    let holder = tm.begin();
    let younger = tm.begin();
    let lm = tm.lock_manager();
    lm.lock_table(&holder, LockMode::Shared, "t").unwrap();

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let tm = Arc::clone(&tm);
        let older = Arc::clone(&older);
        thread::spawn(move || {
            let result = tm
                .lock_manager()
                .lock_table(&older, LockMode::Exclusive, "t");
            tx.send(result.is_ok()).unwrap();
        })
    };
    assert!(rx.recv_timeout(SETTLE).is_err(), "X must wait for S");

    // IS coexists with the granted S but not with the older X queued ahead
    let err = lm
        .lock_table(&younger, LockMode::IntentionShared, "t")
        .unwrap_err();
    assert!(matches!(
        err,
        BasaltError::DeadlockAvoided { txn_id, holder } if txn_id == younger.id() && holder == older.id()
    ));
    assert_eq!(younger.holds_table_lock("t"), None);
    tm.abort(&younger).unwrap();

    tm.commit(&holder).unwrap();
    assert!(rx.recv().unwrap());
    waiter.join().unwrap();
    assert_eq!(older.holds_table_lock("t"), Some(LockMode::Exclusive));
}

#[test]
fn test_waiter_not_granted_over_later_upgrade() {
    let tm = manager();
    let waiter = tm.begin();
    let upgrader = tm.begin();
    let holder = tm.begin();
    let lm = tm.lock_manager();
    lm.lock_table(&holder, LockMode::IntentionExclusive, "t").unwrap();

    // S conflicts with the younger holder's IX: the older waiter queues
    let (tx, rx) = mpsc::channel();
    let wait = {
        let tm = Arc::clone(&tm);
        let waiter = Arc::clone(&waiter);
        thread::spawn(move || {
            let result = tm
                .lock_manager()
                .lock_table(&waiter, LockMode::Shared, "t");
            tx.send(result.is_ok()).unwrap();
        })
    };
    assert!(rx.recv_timeout(SETTLE).is_err());

    // Queued after the waiter, IS coexists with both IX and S
    lm.lock_table(&upgrader, LockMode::IntentionShared, "t").unwrap();
    let upgrade = {
        let tm = Arc::clone(&tm);
        let upgrader = Arc::clone(&upgrader);
        thread::spawn(move || {
            tm.lock_manager()
                .lock_table(&upgrader, LockMode::Exclusive, "t")
                .unwrap();
        })
    };
    thread::sleep(SETTLE);

    tm.commit(&holder).unwrap();
    upgrade.join().unwrap();
    assert_eq!(upgrader.holds_table_lock("t"), Some(LockMode::Exclusive));
    // The granted X blocks the waiter even though it sits later in the queue
    assert!(rx.recv_timeout(SETTLE).is_err());
    assert_eq!(waiter.holds_table_lock("t"), None);

    tm.commit(&upgrader).unwrap();
    assert!(rx.recv().unwrap());
    wait.join().unwrap();
    assert_eq!(waiter.holds_table_lock("t"), Some(LockMode::Shared));
}

#[test]
fn test_lock_wait_timeout_aborts_waiter() {
    let tm = manager_with(LockConfig {
        wait_timeout_ms: Some(30),
    });
    let older = tm.begin();
    let younger = tm.begin();
    tm.lock_manager()
        .lock_table(&younger, LockMode::Exclusive, "t")
        .unwrap();

    let err = tm
        .lock_manager()
        .lock_table(&older, LockMode::Shared, "t")
        .unwrap_err();
    assert!(matches!(err, BasaltError::LockWaitTimeout { .. }));
    assert_eq!(older.state(), TxnState::Aborted);

    // The timed out request left the queue: the next transaction is not blocked by it
    tm.commit(&younger).unwrap();
    let next = tm.begin();
    tm.lock_manager()
        .lock_table(&next, LockMode::Exclusive, "t")
        .unwrap();
}

// =============================================================================
// Queue lifetime
// =============================================================================

#[test]
fn test_wait_queues_dropped_after_commit() {
    let tm = manager();
    let lm = tm.lock_manager();
    let txn = tm.begin();
    lm.lock_table(&txn, LockMode::IntentionExclusive, "t").unwrap();
    for k in 0..50 {
        lm.lock_tuple(&txn, LockMode::Exclusive, "t", &int_key(k))
            .unwrap();
    }
    assert_eq!(lm.tracked_resources(), 51);

    tm.commit(&txn).unwrap();
    assert_eq!(lm.tracked_resources(), 0);

    // Releasing something never locked creates nothing
    let other = tm.begin();
    assert!(!lm.unlock_table(&other, "never"));
    assert!(!lm.unlock_tuple(&other, "never", &int_key(1)));
    assert_eq!(lm.tracked_resources(), 0);
}

#[test]
fn test_wait_queue_dropped_after_failed_request() {
    let tm = manager_with(LockConfig {
        wait_timeout_ms: Some(30),
    });
    let lm = tm.lock_manager();
    let older = tm.begin();
    let younger = tm.begin();
    lm.lock_table(&younger, LockMode::Exclusive, "t").unwrap();

    assert!(lm.lock_table(&older, LockMode::Shared, "t").is_err());
    assert_eq!(lm.tracked_resources(), 1);
    tm.abort(&older).unwrap();
    tm.commit(&younger).unwrap();
    assert_eq!(lm.tracked_resources(), 0);
}

// =============================================================================
// Two-phase locking
// =============================================================================

#[test]
fn test_no_acquire_after_release() {
    let tm = manager();
    let lm = tm.lock_manager();
    let txn = tm.begin();
    lm.lock_table(&txn, LockMode::IntentionExclusive, "a").unwrap();
    lm.lock_tuple(&txn, LockMode::Exclusive, "a", &int_key(1))
        .unwrap();

    assert!(lm.unlock_tuple(&txn, "a", &int_key(1)));
    assert_eq!(txn.state(), TxnState::Shrinking);

    for result in [
        lm.lock_table(&txn, LockMode::Shared, "b"),
        lm.lock_tuple(&txn, LockMode::Exclusive, "a", &int_key(2)),
    ] {
        assert!(matches!(result, Err(BasaltError::ProtocolViolation { .. })));
    }
    assert_eq!(txn.state(), TxnState::Aborted);
    tm.abort(&txn).unwrap();
    assert!(txn.table_locks().is_empty());
}

#[test]
fn test_row_locks_follow_intention_locks() {
    let tm = manager();
    let lm = tm.lock_manager();

    let reader = tm.begin();
    lm.lock_table(&reader, LockMode::IntentionShared, "t").unwrap();
    lm.lock_tuple(&reader, LockMode::Shared, "t", &int_key(1))
        .unwrap();

    let writer = tm.begin();
    lm.lock_table(&writer, LockMode::IntentionExclusive, "t")
        .unwrap();
    lm.lock_tuple(&writer, LockMode::Exclusive, "t", &int_key(2))
        .unwrap();
    // Younger writer on a row the older reader holds dies
    assert!(matches!(
        lm.lock_tuple(&writer, LockMode::Exclusive, "t", &int_key(1)),
        Err(BasaltError::DeadlockAvoided { .. })
    ));
    tm.abort(&writer).unwrap();

    let lone = tm.begin();
    assert!(matches!(
        lm.lock_tuple(&lone, LockMode::Shared, "t", &int_key(1)),
        Err(BasaltError::InvalidRowLockRequest { .. })
    ));
    assert_eq!(lone.state(), TxnState::Aborted);
}
