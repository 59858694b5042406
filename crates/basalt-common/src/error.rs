//! Error types for Basalt.

use thiserror::Error;

/// Result type alias using BasaltError.
pub type Result<T> = std::result::Result<T, BasaltError>;

/// Errors that can occur in Basalt operations.
///
/// Expected misses on an index (absent key, duplicate insert) are not errors;
/// those surface as `bool` or `Option` returns.
#[derive(Debug, Error)]
pub enum BasaltError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Page store errors
    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: u32 },

    #[error("Page {page_id} is still pinned by {pins} handle(s)")]
    PagePinned { page_id: u32, pins: u32 },

    #[error("Page {page_id} full, unable to insert slot of {size} bytes")]
    PageFull { page_id: u32, size: usize },

    #[error("Page corrupted: {page_id}, reason: {reason}")]
    PageCorrupted { page_id: u32, reason: String },

    #[error("Page size mismatch: expected {expected}, got {actual}")]
    PageSizeMismatch { expected: usize, actual: usize },

    #[error("Page store full: all {max_pages} pages in use")]
    StoreFull { max_pages: u32 },

    // B+ tree errors
    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("B+ tree corrupted: {0}")]
    BTreeCorrupted(String),

    // Catalog errors
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Table already exists: {0}")]
    TableAlreadyExists(String),

    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),

    // Lock errors. Every one of these leaves the transaction ABORTED.
    #[error("Transaction {txn_id} violated two-phase locking: {reason}")]
    ProtocolViolation { txn_id: u64, reason: String },

    #[error("Transaction {txn_id} requested a row lock on {table} without a matching table lock")]
    InvalidRowLockRequest { txn_id: u64, table: String },

    #[error("Transaction {txn_id} attempted an upgrade while another upgrade is in flight")]
    ConcurrentUpgradeConflict { txn_id: u64 },

    #[error("Transaction {txn_id} cannot upgrade from {from} to {to}")]
    IllegalUpgrade { txn_id: u64, from: String, to: String },

    #[error("Transaction {txn_id} aborted by wait-die against transaction {holder}")]
    DeadlockAvoided { txn_id: u64, holder: u64 },

    #[error("Transaction {txn_id} timed out after {waited_ms} ms waiting for a lock")]
    LockWaitTimeout { txn_id: u64, waited_ms: u64 },

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BasaltError {
    /// Returns true for lock manager failures. The transaction that received
    /// one is already ABORTED and must be handed to the transaction manager's abort.
    pub fn is_lock_failure(&self) -> bool {
        matches!(
            self,
            BasaltError::ProtocolViolation { .. }
                | BasaltError::InvalidRowLockRequest { .. }
                | BasaltError::ConcurrentUpgradeConflict { .. }
                | BasaltError::IllegalUpgrade { .. }
                | BasaltError::DeadlockAvoided { .. }
                | BasaltError::LockWaitTimeout { .. }
        )
    }
}
