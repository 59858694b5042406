//! Page handles: plain byte-addressable pages and sorted slotted pages.
//!
//! Sorted page layout:
//!
//! ```text
//! +--------+---------------------+--------+---------------+---------+
//! | header | slot dir (4 B each) |  free  |  slot bytes   | special |
//! +--------+---------------------+--------+---------------+---------+
//! 0        8                     dir_end  data_start      special_start
//! ```
//!
//! Header (8 bytes, little-endian): slot count (2), data start (2),
//! special size (2), reserved (2). Each directory entry is (offset: 2, len: 2).
//! Slot bytes are kept contiguous: deleting a slot compacts the data area.

use crate::frame::BufferFrame;
use basalt_common::{BasaltError, PageId, Result, PGID_SIZE};
use bytes::Bytes;
use std::cmp::Ordering;
use std::sync::Arc;

/// Size of the sorted page header.
pub const SORTED_HEADER_SIZE: usize = 8;

/// Size of one slot directory entry (offset:2 + len:2).
pub const SLOT_DIR_ENTRY_SIZE: usize = 4;

const COUNT_OFFSET: usize = 0;
const DATA_START_OFFSET: usize = 2;
const SPECIAL_SIZE_OFFSET: usize = 4;

/// Orders stored slots against search keys.
///
/// A sorted page never interprets slot bytes itself; the page's owner injects
/// the order when opening it.
pub trait SlotOrder {
    /// Compares the key stored in `slot` with `key`.
    fn cmp_slot_key(&self, slot: &[u8], key: &[u8]) -> Ordering;
}

/// Compares whole slots bytewise against the key.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawOrder;

impl SlotOrder for RawOrder {
    fn cmp_slot_key(&self, slot: &[u8], key: &[u8]) -> Ordering {
        slot.cmp(key)
    }
}

/// Largest slot that still guarantees a split can place any two slots.
pub fn max_slot_size(page_size: usize, special_size: usize) -> usize {
    (page_size - SORTED_HEADER_SIZE - special_size) / 2 - SLOT_DIR_ENTRY_SIZE
}

#[inline]
fn read_u16(data: &[u8], offset: usize) -> usize {
    u16::from_le_bytes([data[offset], data[offset + 1]]) as usize
}

#[inline]
fn write_u16(data: &mut [u8], offset: usize, value: usize) {
    data[offset..offset + 2].copy_from_slice(&(value as u16).to_le_bytes());
}

/// Handle on a pinned page with raw byte access.
///
/// The page stays pinned until the handle is dropped; a pinned page cannot be freed.
pub struct PlainPage {
    id: PageId,
    frame: Arc<BufferFrame>,
}

impl PlainPage {
    pub(crate) fn new(frame: Arc<BufferFrame>) -> Self {
        frame.pin();
        Self {
            id: frame.page_id(),
            frame,
        }
    }

    #[inline]
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Page size in bytes.
    pub fn size(&self) -> usize {
        self.frame.read_data().len()
    }

    /// Copies `len` bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Bytes {
        let data = self.frame.read_data();
        Bytes::copy_from_slice(&data[offset..offset + len])
    }

    /// Overwrites bytes starting at `offset`.
    pub fn write(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.frame.write_data();
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn read_u8(&self, offset: usize) -> u8 {
        self.frame.read_data()[offset]
    }

    pub fn write_u8(&self, offset: usize, value: u8) {
        self.frame.write_data()[offset] = value;
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let data = self.frame.read_data();
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&data[offset..offset + 4]);
        u32::from_ne_bytes(raw)
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        self.write(offset, &value.to_ne_bytes());
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        let data = self.frame.read_data();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&data[offset..offset + 8]);
        u64::from_ne_bytes(raw)
    }

    pub fn write_u64(&self, offset: usize, value: u64) {
        self.write(offset, &value.to_ne_bytes());
    }

    pub fn read_page_id(&self, offset: usize) -> PageId {
        PageId(self.read_u32(offset))
    }

    pub fn write_page_id(&self, offset: usize, id: PageId) {
        self.write_u32(offset, id.0);
    }

    fn frame(&self) -> &BufferFrame {
        &self.frame
    }
}

impl Drop for PlainPage {
    fn drop(&mut self) {
        self.frame.unpin();
    }
}

impl std::fmt::Debug for PlainPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainPage").field("id", &self.id).finish()
    }
}

/// Handle on a pinned page viewed as an ordered array of variable-length slots
/// plus a fixed special area at the end of the page.
pub struct SortedPage<O> {
    page: PlainPage,
    order: O,
}

impl<O: SlotOrder> SortedPage<O> {
    pub(crate) fn new(page: PlainPage, order: O) -> Self {
        Self { page, order }
    }

    #[inline]
    pub fn id(&self) -> PageId {
        self.page.id()
    }

    /// Formats the page as empty with a special area of `special_size` bytes.
    pub fn init(&self, special_size: usize) {
        let mut data = self.page.frame().write_data();
        let page_size = data.len();
        data[..SORTED_HEADER_SIZE].fill(0);
        write_u16(&mut data, COUNT_OFFSET, 0);
        write_u16(&mut data, DATA_START_OFFSET, page_size - special_size);
        write_u16(&mut data, SPECIAL_SIZE_OFFSET, special_size);
        data[page_size - special_size..].fill(0);
    }

    /// Number of slots on the page.
    pub fn slot_count(&self) -> usize {
        read_u16(&self.page.frame().read_data(), COUNT_OFFSET)
    }

    pub fn is_empty(&self) -> bool {
        self.slot_count() == 0
    }

    /// Size of the special area.
    pub fn special_size(&self) -> usize {
        read_u16(&self.page.frame().read_data(), SPECIAL_SIZE_OFFSET)
    }

    /// Bytes available for new slots, directory entries included.
    pub fn free_space(&self) -> usize {
        Self::free_space_in_slice(&self.page.frame().read_data())
    }

    fn free_space_in_slice(data: &[u8]) -> usize {
        let count = read_u16(data, COUNT_OFFSET);
        let data_start = read_u16(data, DATA_START_OFFSET);
        let dir_end = SORTED_HEADER_SIZE + count * SLOT_DIR_ENTRY_SIZE;
        data_start.saturating_sub(dir_end)
    }

    /// Largest slot this page guarantees to accept through a split.
    pub fn max_slot_size(&self) -> usize {
        max_slot_size(self.page.size(), self.special_size())
    }

    /// Returns true if `slot` fits in the page's free space.
    pub fn is_insertable(&self, slot: &[u8]) -> bool {
        self.free_space() >= slot.len() + SLOT_DIR_ENTRY_SIZE
    }

    #[inline]
    fn slot_range(data: &[u8], index: usize) -> (usize, usize) {
        let entry = SORTED_HEADER_SIZE + index * SLOT_DIR_ENTRY_SIZE;
        let offset = read_u16(data, entry);
        let len = read_u16(data, entry + 2);
        (offset, offset + len)
    }

    /// Copies out slot `index`.
    pub fn slot(&self, index: usize) -> Bytes {
        let data = self.page.frame().read_data();
        debug_assert!(index < read_u16(&data, COUNT_OFFSET));
        let (start, end) = Self::slot_range(&data, index);
        Bytes::copy_from_slice(&data[start..end])
    }

    /// Copies out every slot in order.
    pub fn slots(&self) -> Vec<Bytes> {
        let data = self.page.frame().read_data();
        let count = read_u16(&data, COUNT_OFFSET);
        (0..count)
            .map(|i| {
                let (start, end) = Self::slot_range(&data, i);
                Bytes::copy_from_slice(&data[start..end])
            })
            .collect()
    }

    /// Binary search for the first slot where `pred` turns false.
    fn partition_point<F>(&self, key: &[u8], pred: F) -> usize
    where
        F: Fn(Ordering) -> bool,
    {
        let data = self.page.frame().read_data();
        let mut low = 0usize;
        let mut high = read_u16(&data, COUNT_OFFSET);

        while low < high {
            let mid = low + (high - low) / 2;
            let (start, end) = Self::slot_range(&data, mid);
            if pred(self.order.cmp_slot_key(&data[start..end], key)) {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low
    }

    /// Index of the first slot whose key is >= `key`.
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        self.partition_point(key, |ord| ord == Ordering::Less)
    }

    /// Index of the first slot whose key is > `key`.
    pub fn upper_bound(&self, key: &[u8]) -> usize {
        self.partition_point(key, |ord| ord != Ordering::Greater)
    }

    /// Index of the slot whose key equals `key`.
    pub fn find(&self, key: &[u8]) -> Option<usize> {
        let index = self.lower_bound(key);
        let data = self.page.frame().read_data();
        if index >= read_u16(&data, COUNT_OFFSET) {
            return None;
        }
        let (start, end) = Self::slot_range(&data, index);
        match self.order.cmp_slot_key(&data[start..end], key) {
            Ordering::Equal => Some(index),
            _ => None,
        }
    }

    /// Inserts `slot` so that it becomes slot number `index`.
    pub fn insert_before(&self, index: usize, slot: &[u8]) -> Result<()> {
        let mut data = self.page.frame().write_data();
        Self::insert_in_slice(&mut data, self.page.id(), index, slot)
    }

    fn insert_in_slice(data: &mut [u8], id: PageId, index: usize, slot: &[u8]) -> Result<()> {
        let count = read_u16(data, COUNT_OFFSET);
        debug_assert!(index <= count);

        if Self::free_space_in_slice(data) < slot.len() + SLOT_DIR_ENTRY_SIZE {
            return Err(BasaltError::PageFull {
                page_id: id.0,
                size: slot.len(),
            });
        }

        let data_start = read_u16(data, DATA_START_OFFSET) - slot.len();
        data[data_start..data_start + slot.len()].copy_from_slice(slot);

        // Shift directory entries [index, count) one entry right
        let entry = SORTED_HEADER_SIZE + index * SLOT_DIR_ENTRY_SIZE;
        let dir_end = SORTED_HEADER_SIZE + count * SLOT_DIR_ENTRY_SIZE;
        data.copy_within(entry..dir_end, entry + SLOT_DIR_ENTRY_SIZE);
        write_u16(data, entry, data_start);
        write_u16(data, entry + 2, slot.len());

        write_u16(data, COUNT_OFFSET, count + 1);
        write_u16(data, DATA_START_OFFSET, data_start);
        Ok(())
    }

    /// Removes slot `index`.
    pub fn delete(&self, index: usize) {
        let mut data = self.page.frame().write_data();
        Self::delete_in_slice(&mut data, index);
    }

    fn delete_in_slice(data: &mut [u8], index: usize) {
        let count = read_u16(data, COUNT_OFFSET);
        debug_assert!(index < count);

        let (start, end) = Self::slot_range(data, index);
        let len = end - start;
        let data_start = read_u16(data, DATA_START_OFFSET);

        // Close the hole: bytes below the slot move up by its length
        data.copy_within(data_start..start, data_start + len);
        for i in 0..count {
            let entry = SORTED_HEADER_SIZE + i * SLOT_DIR_ENTRY_SIZE;
            let offset = read_u16(data, entry);
            if offset < start {
                write_u16(data, entry, offset + len);
            }
        }

        let entry = SORTED_HEADER_SIZE + index * SLOT_DIR_ENTRY_SIZE;
        let dir_end = SORTED_HEADER_SIZE + count * SLOT_DIR_ENTRY_SIZE;
        data.copy_within(entry + SLOT_DIR_ENTRY_SIZE..dir_end, entry);

        write_u16(data, COUNT_OFFSET, count - 1);
        write_u16(data, DATA_START_OFFSET, data_start + len);
    }

    /// Removes the slot whose key equals `key`. Returns false if absent.
    pub fn delete_key(&self, key: &[u8]) -> bool {
        match self.find(key) {
            Some(index) => {
                self.delete(index);
                true
            }
            None => false,
        }
    }

    /// Replaces slot `index` with `slot`, leaving the page untouched if it does not fit.
    pub fn replace(&self, index: usize, slot: &[u8]) -> Result<()> {
        let mut data = self.page.frame().write_data();
        let (start, end) = Self::slot_range(&data, index);
        let old_len = end - start;
        if slot.len() > old_len && Self::free_space_in_slice(&data) < slot.len() - old_len {
            return Err(BasaltError::PageFull {
                page_id: self.page.id().0,
                size: slot.len(),
            });
        }
        Self::delete_in_slice(&mut data, index);
        Self::insert_in_slice(&mut data, self.page.id(), index, slot)
    }

    /// Inserts `slot` at `index` and moves the upper part of the combined slot
    /// sequence into `right`, which must be freshly initialized and empty.
    ///
    /// Both pages end up non-empty.
    pub fn split_insert(&self, right: &SortedPage<O>, slot: &[u8], index: usize) -> Result<()> {
        if !right.is_empty() {
            return Err(BasaltError::Internal(format!(
                "split target {} is not empty",
                right.id()
            )));
        }

        let mut slots = self.slots();
        debug_assert!(index <= slots.len());
        slots.insert(index, Bytes::copy_from_slice(slot));

        let special_size = self.special_size();
        let capacity = self.page.size() - SORTED_HEADER_SIZE - special_size;
        let sizes: Vec<usize> = slots
            .iter()
            .map(|s| s.len() + SLOT_DIR_ENTRY_SIZE)
            .collect();
        let total: usize = sizes.iter().sum();

        // Smallest prefix holding at least half the bytes; back off one slot
        // when that prefix overflows the left page.
        let mut prefix = 0usize;
        let mut split = slots.len();
        for (i, size) in sizes.iter().enumerate() {
            prefix += size;
            if prefix * 2 >= total {
                split = if prefix <= capacity { i + 1 } else { i };
                break;
            }
        }
        let split = split.clamp(1, slots.len().saturating_sub(1).max(1));

        let left_bytes: usize = sizes[..split].iter().sum();
        if left_bytes > capacity || total - left_bytes > capacity || split >= slots.len() {
            return Err(BasaltError::PageFull {
                page_id: self.page.id().0,
                size: slot.len(),
            });
        }

        self.init_keep_special();
        {
            let mut data = self.page.frame().write_data();
            for (i, s) in slots[..split].iter().enumerate() {
                Self::insert_in_slice(&mut data, self.page.id(), i, s)?;
            }
        }
        {
            let mut data = right.page.frame().write_data();
            for (i, s) in slots[split..].iter().enumerate() {
                Self::insert_in_slice(&mut data, right.page.id(), i, s)?;
            }
        }
        Ok(())
    }

    /// Drops every slot but keeps the special area.
    fn init_keep_special(&self) {
        let mut data = self.page.frame().write_data();
        let special_start = data.len() - read_u16(&data, SPECIAL_SIZE_OFFSET);
        write_u16(&mut data, COUNT_OFFSET, 0);
        write_u16(&mut data, DATA_START_OFFSET, special_start);
    }

    /// Copies `len` bytes at `offset` within the special area.
    pub fn read_special(&self, offset: usize, len: usize) -> Bytes {
        let data = self.page.frame().read_data();
        let start = data.len() - read_u16(&data, SPECIAL_SIZE_OFFSET) + offset;
        Bytes::copy_from_slice(&data[start..start + len])
    }

    /// Overwrites bytes at `offset` within the special area.
    pub fn write_special(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.page.frame().write_data();
        let start = data.len() - read_u16(&data, SPECIAL_SIZE_OFFSET) + offset;
        data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn read_special_page_id(&self, offset: usize) -> PageId {
        PageId::from_ne_slice(&self.read_special(offset, PGID_SIZE))
    }

    pub fn write_special_page_id(&self, offset: usize, id: PageId) {
        self.write_special(offset, &id.to_ne_bytes());
    }
}

impl<O> std::fmt::Debug for SortedPage<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedPage").field("id", &self.page.id).finish()
    }
}
