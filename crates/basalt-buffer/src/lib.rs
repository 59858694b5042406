//! Page store for Basalt.
//!
//! This crate provides fixed-size page management with:
//! - Page allocation and freeing by page id, with id reuse
//! - Pin counting so pages cannot be freed under a live handle
//! - Plain pages (raw byte access) and sorted pages (ordered slots plus a special area)
//! - Optional write-back to a single page file

mod disk;
mod frame;
mod page;
mod store;

pub use disk::{DiskManager, DiskManagerConfig, PAGE_FILE_NAME};
pub use frame::BufferFrame;
pub use page::{
    max_slot_size, PlainPage, RawOrder, SlotOrder, SortedPage, SLOT_DIR_ENTRY_SIZE,
    SORTED_HEADER_SIZE,
};
pub use store::PageStore;
