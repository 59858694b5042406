//! Buffer frame management.

use basalt_common::PageId;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// A frame holding the bytes of one allocated page.
///
/// Each frame contains:
/// - The page data (page_size bytes)
/// - Metadata for page handles (pin count, dirty flag)
pub struct BufferFrame {
    /// The page stored in this frame.
    page_id: PageId,
    /// Page data buffer.
    data: RwLock<Box<[u8]>>,
    /// Number of live handles on this page.
    pin_count: AtomicU32,
    /// Whether the page has been modified since the last flush.
    is_dirty: AtomicBool,
}

impl BufferFrame {
    /// Creates a zeroed frame for a freshly allocated page.
    pub fn new(page_id: PageId, page_size: usize) -> Self {
        Self {
            page_id,
            data: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(true),
        }
    }

    /// Creates a clean frame from bytes read off disk.
    pub fn from_bytes(page_id: PageId, data: Vec<u8>) -> Self {
        Self {
            page_id,
            data: RwLock::new(data.into_boxed_slice()),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count and returns the previous pin count.
    #[inline]
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrements the pin count.
    ///
    /// Returns the new pin count.
    #[inline]
    pub fn unpin(&self) -> u32 {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            // Underflow protection: restore to 0
            self.pin_count.store(0, Ordering::Release);
            return 0;
        }
        prev - 1
    }

    /// Returns true if this frame is pinned.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    /// Returns true if this frame is dirty.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    /// Marks this frame as dirty.
    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::Release);
    }

    /// Reads the page data.
    #[inline]
    pub fn read_data(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Writes to the page data and marks the frame dirty.
    #[inline]
    pub fn write_data(&self) -> parking_lot::RwLockWriteGuard<'_, Box<[u8]>> {
        self.set_dirty(true);
        self.data.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_new() {
        let frame = BufferFrame::new(PageId(3), 128);
        assert_eq!(frame.page_id(), PageId(3));
        assert_eq!(frame.read_data().len(), 128);
        assert!(frame.read_data().iter().all(|&b| b == 0));
        assert!(!frame.is_pinned());
        assert!(frame.is_dirty());
    }

    #[test]
    fn test_frame_from_bytes_is_clean() {
        let frame = BufferFrame::from_bytes(PageId(1), vec![7u8; 64]);
        assert!(!frame.is_dirty());
        assert_eq!(frame.read_data()[63], 7);
    }

    #[test]
    fn test_frame_pin_unpin() {
        let frame = BufferFrame::new(PageId(1), 64);

        assert_eq!(frame.pin(), 0);
        assert_eq!(frame.pin(), 1);
        assert_eq!(frame.pin_count(), 2);
        assert!(frame.is_pinned());

        assert_eq!(frame.unpin(), 1);
        assert_eq!(frame.unpin(), 0);
        assert!(!frame.is_pinned());

        // Underflow stays at zero
        assert_eq!(frame.unpin(), 0);
        assert_eq!(frame.pin_count(), 0);
    }

    #[test]
    fn test_frame_write_marks_dirty() {
        let frame = BufferFrame::from_bytes(PageId(1), vec![0u8; 64]);
        assert!(!frame.is_dirty());

        frame.write_data()[0] = 0xAB;
        assert!(frame.is_dirty());
        assert_eq!(frame.read_data()[0], 0xAB);

        frame.set_dirty(false);
        assert!(!frame.is_dirty());
    }
}
