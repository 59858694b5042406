//! Basalt common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all Basalt components.

pub mod config;
pub mod error;
pub mod page;
pub mod types;

pub use config::{EngineConfig, LockConfig, StorageConfig};
pub use error::{BasaltError, Result};
pub use page::{PageId, PgOff, DEFAULT_PAGE_SIZE, PGID_SIZE, PGOFF_SIZE};
pub use types::{FieldType, KeyKind};
