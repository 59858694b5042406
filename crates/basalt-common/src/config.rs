//! Configuration structures for Basalt.

use crate::error::{BasaltError, Result};
use crate::page::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for a storage engine instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Page store settings.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Lock manager settings.
    #[serde(default)]
    pub lock: LockConfig,
}

impl EngineConfig {
    /// Checks every section for out-of-range values.
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.lock.validate()
    }
}

/// Page store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the page file. `None` keeps every page in memory.
    pub data_dir: Option<PathBuf>,
    /// Page size in bytes.
    pub page_size: usize,
    /// Enable fsync after flushing pages.
    pub fsync_enabled: bool,
    /// Upper bound on page ids handed out. `None` leaves the store unbounded.
    #[serde(default)]
    pub max_pages: Option<u32>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            page_size: DEFAULT_PAGE_SIZE,
            fsync_enabled: true,
            max_pages: None,
        }
    }
}

impl StorageConfig {
    /// In-memory store with the given page size. Mostly useful in tests that
    /// need small pages to force splits.
    pub fn in_memory(page_size: usize) -> Self {
        Self {
            data_dir: None,
            page_size,
            fsync_enabled: false,
            max_pages: None,
        }
    }

    /// Rejects page sizes the slotted layout cannot address.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(BasaltError::InvalidParameter {
                name: "page_size".to_string(),
                value: self.page_size.to_string(),
            });
        }
        Ok(())
    }
}

/// Lock manager configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockConfig {
    /// Maximum time a lock request may block, in milliseconds.
    /// `None` blocks until the conflict resolves or wait-die fires.
    pub wait_timeout_ms: Option<u64>,
}

impl LockConfig {
    /// Returns the wait timeout as a Duration.
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.wait_timeout_ms == Some(0) {
            return Err(BasaltError::ConfigError(
                "lock.wait_timeout_ms must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}
