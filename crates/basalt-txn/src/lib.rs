//! Transactions for Basalt.
//!
//! This crate provides:
//! - A multi-granularity lock manager (IS, IX, S, SIX, X) on tables and rows
//! - Strict two-phase locking checks and wait-die deadlock avoidance
//! - Transactions with an undo log, and a manager that commits or rolls them back

mod lock_manager;
mod manager;
mod transaction;

pub use lock_manager::{LockManager, LockMode};
pub use manager::TxnManager;
pub use transaction::{Transaction, TxnId, TxnState, UndoKind, UndoRecord};
