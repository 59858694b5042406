//! Page identifiers and size constants.

use serde::{Deserialize, Serialize};

/// Default page size in bytes (4 KB).
pub const DEFAULT_PAGE_SIZE: usize = 4 * 1024;

/// Smallest page size the store accepts.
pub const MIN_PAGE_SIZE: usize = 64;

/// Largest page size the store accepts. Every in-page offset must fit a [`PgOff`].
pub const MAX_PAGE_SIZE: usize = 32 * 1024;

/// Offset or length within a page.
pub type PgOff = u16;

/// Width in bytes of an encoded [`PgOff`].
pub const PGOFF_SIZE: usize = std::mem::size_of::<PgOff>();

/// Width in bytes of an encoded [`PageId`].
pub const PGID_SIZE: usize = std::mem::size_of::<u32>();

/// Identifier of a fixed-size page in a page store.
///
/// `PageId::NONE` (0) is reserved and never names an allocated page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    /// The reserved "no page" identifier.
    pub const NONE: PageId = PageId(0);

    /// Returns true unless this is [`PageId::NONE`].
    #[inline]
    pub fn is_some(&self) -> bool {
        self.0 != 0
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    /// Encodes the id in native byte order.
    #[inline]
    pub fn to_ne_bytes(self) -> [u8; PGID_SIZE] {
        self.0.to_ne_bytes()
    }

    /// Decodes an id from the first [`PGID_SIZE`] bytes of `buf`.
    #[inline]
    pub fn from_ne_slice(buf: &[u8]) -> Self {
        let mut raw = [0u8; PGID_SIZE];
        raw.copy_from_slice(&buf[..PGID_SIZE]);
        PageId(u32::from_ne_bytes(raw))
    }

    /// Index of this page within a page file.
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pg:{}", self.0)
    }
}
