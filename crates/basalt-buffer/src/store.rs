//! Page store: allocates, frees and hands out pinned handles on fixed-size pages.

use crate::disk::{DiskManager, DiskManagerConfig};
use crate::frame::BufferFrame;
use crate::page::{PlainPage, SlotOrder, SortedPage};
use basalt_common::{BasaltError, PageId, Result, StorageConfig};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info};

/// Magic number at the start of the store header page ("BSLT").
const STORE_MAGIC: u32 = 0x4253_4C54;

// Store header layout on page 0 (native-endian u32 fields)
const MAGIC_OFFSET: usize = 0;
const PAGE_SIZE_OFFSET: usize = 4;
const PAGE_COUNT_OFFSET: usize = 8;
const FREE_HEAD_OFFSET: usize = 12;

/// Owner of every page of one storage engine.
///
/// Pages live in memory for the lifetime of the store. When the store is
/// file-backed, `flush` writes them out and `new` reloads them, so page ids
/// stay valid across restarts. Page 0 is reserved: it is the "no page" id and
/// holds the store header on disk.
pub struct PageStore {
    page_size: usize,
    max_pages: Option<u32>,
    /// Frames indexed by page id. `None` marks a free or reserved id.
    frames: RwLock<Vec<Option<Arc<BufferFrame>>>>,
    /// Freed ids, reused most recent first.
    free_list: Mutex<Vec<PageId>>,
    disk: Option<DiskManager>,
}

impl PageStore {
    /// Opens a store. Reloads existing pages when `config.data_dir` holds a page file.
    pub fn new(config: StorageConfig) -> Result<Self> {
        config.validate()?;

        let disk = match &config.data_dir {
            Some(dir) => Some(DiskManager::new(DiskManagerConfig {
                data_dir: dir.clone(),
                page_size: config.page_size,
                fsync_enabled: config.fsync_enabled,
            })?),
            None => None,
        };

        let store = Self {
            page_size: config.page_size,
            max_pages: config.max_pages,
            frames: RwLock::new(vec![None]),
            free_list: Mutex::new(Vec::new()),
            disk,
        };
        store.load()?;
        Ok(store)
    }

    /// In-memory store with the given page size.
    pub fn in_memory(page_size: usize) -> Result<Self> {
        Self::new(StorageConfig::in_memory(page_size))
    }

    /// Rebuilds the frame table from the page file, if any.
    fn load(&self) -> Result<()> {
        let disk = match &self.disk {
            Some(disk) if disk.num_pages() > 0 => disk,
            _ => return Ok(()),
        };

        let header = disk.read_page(PageId::NONE)?;
        let field = |offset: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&header[offset..offset + 4]);
            u32::from_ne_bytes(raw)
        };

        if field(MAGIC_OFFSET) != STORE_MAGIC {
            return Err(BasaltError::PageCorrupted {
                page_id: 0,
                reason: "bad store header magic".to_string(),
            });
        }
        let stored_page_size = field(PAGE_SIZE_OFFSET) as usize;
        if stored_page_size != self.page_size {
            return Err(BasaltError::PageSizeMismatch {
                expected: self.page_size,
                actual: stored_page_size,
            });
        }
        let page_count = field(PAGE_COUNT_OFFSET);

        // Walk the free chain: each free page stores the next free id at offset 0
        let mut free = Vec::new();
        let mut is_free = vec![false; page_count as usize];
        let mut next = PageId(field(FREE_HEAD_OFFSET));
        while next.is_some() {
            if next.0 >= page_count || is_free[next.index()] {
                return Err(BasaltError::PageCorrupted {
                    page_id: next.0,
                    reason: "broken free page chain".to_string(),
                });
            }
            is_free[next.index()] = true;
            free.push(next);
            next = PageId::from_ne_slice(&disk.read_page(next)?);
        }

        let mut frames = self.frames.write();
        for raw_id in 1..page_count {
            let id = PageId(raw_id);
            if is_free[id.index()] {
                frames.push(None);
            } else {
                frames.push(Some(Arc::new(BufferFrame::from_bytes(id, disk.read_page(id)?))));
            }
        }
        // Reuse in chain order
        free.reverse();
        *self.free_list.lock() = free;

        info!(
            pages = page_count,
            path = %disk.path().display(),
            "page store loaded"
        );
        Ok(())
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns true if the store is backed by a page file.
    pub fn is_persistent(&self) -> bool {
        self.disk.is_some()
    }

    /// Number of allocated pages.
    pub fn allocated_pages(&self) -> usize {
        self.frames.read().iter().filter(|f| f.is_some()).count()
    }

    /// Number of freed ids waiting for reuse.
    pub fn free_pages(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Returns true if `id` names an allocated page.
    pub fn contains(&self, id: PageId) -> bool {
        matches!(self.frames.read().get(id.index()), Some(Some(_)))
    }

    /// Allocates a zeroed page.
    pub fn allocate(&self) -> Result<PageId> {
        let mut free_list = self.free_list.lock();
        let mut frames = self.frames.write();

        let id = match free_list.pop() {
            Some(id) => id,
            None => {
                // frames[0] is the reserved id
                if let Some(max_pages) = self.max_pages {
                    if frames.len() > max_pages as usize {
                        return Err(BasaltError::StoreFull { max_pages });
                    }
                }
                if frames.len() > u32::MAX as usize {
                    return Err(BasaltError::Internal("page ids exhausted".to_string()));
                }
                frames.push(None);
                PageId((frames.len() - 1) as u32)
            }
        };
        frames[id.index()] = Some(Arc::new(BufferFrame::new(id, self.page_size)));
        Ok(id)
    }

    /// Frees a page. Fails while any handle on the page is alive.
    pub fn free(&self, id: PageId) -> Result<()> {
        let mut free_list = self.free_list.lock();
        let mut frames = self.frames.write();

        let frame = match frames.get(id.index()) {
            Some(Some(frame)) if id.is_some() => frame,
            _ => return Err(BasaltError::PageNotFound { page_id: id.0 }),
        };
        if frame.is_pinned() {
            return Err(BasaltError::PagePinned {
                page_id: id.0,
                pins: frame.pin_count(),
            });
        }

        frames[id.index()] = None;
        free_list.push(id);
        Ok(())
    }

    fn frame(&self, id: PageId) -> Result<Arc<BufferFrame>> {
        match self.frames.read().get(id.index()) {
            Some(Some(frame)) => Ok(Arc::clone(frame)),
            _ => Err(BasaltError::PageNotFound { page_id: id.0 }),
        }
    }

    /// Opens a page for raw byte access.
    pub fn plain(&self, id: PageId) -> Result<PlainPage> {
        Ok(PlainPage::new(self.frame(id)?))
    }

    /// Opens a page as a sorted page ordered by `order`.
    ///
    /// The page must already be formatted with [`SortedPage::init`], or be
    /// initialized right after opening.
    pub fn sorted<O: SlotOrder>(&self, id: PageId, order: O) -> Result<SortedPage<O>> {
        Ok(SortedPage::new(self.plain(id)?, order))
    }

    /// Writes the header, the free chain and every dirty page to the page file.
    ///
    /// Returns the number of pages written. A no-op for in-memory stores.
    pub fn flush(&self) -> Result<usize> {
        let disk = match &self.disk {
            Some(disk) => disk,
            None => return Ok(0),
        };

        let free_list = self.free_list.lock();
        let frames = self.frames.read();
        let mut written = 0;

        for frame in frames.iter().flatten() {
            if frame.is_dirty() {
                let data = frame.read_data();
                disk.write_page(frame.page_id(), &data)?;
                frame.set_dirty(false);
                written += 1;
            }
        }

        // Chain free pages so the most recently freed one is reused first after reload
        let mut head = PageId::NONE;
        for &id in free_list.iter() {
            let mut buf = vec![0u8; self.page_size];
            buf[..4].copy_from_slice(&head.to_ne_bytes());
            disk.write_page(id, &buf)?;
            head = id;
        }

        let mut header = vec![0u8; self.page_size];
        header[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&STORE_MAGIC.to_ne_bytes());
        header[PAGE_SIZE_OFFSET..PAGE_SIZE_OFFSET + 4]
            .copy_from_slice(&(self.page_size as u32).to_ne_bytes());
        header[PAGE_COUNT_OFFSET..PAGE_COUNT_OFFSET + 4]
            .copy_from_slice(&(frames.len() as u32).to_ne_bytes());
        header[FREE_HEAD_OFFSET..FREE_HEAD_OFFSET + 4].copy_from_slice(&head.to_ne_bytes());
        disk.write_page(PageId::NONE, &header)?;

        // Drop trailing bytes from an older, larger store
        if disk.num_pages() > frames.len() as u32 {
            disk.truncate(frames.len() as u32)?;
        }
        disk.sync()?;

        debug!(written, free = free_list.len(), "page store flushed");
        Ok(written)
    }
}

impl std::fmt::Debug for PageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageStore")
            .field("page_size", &self.page_size)
            .field("allocated", &self.allocated_pages())
            .field("persistent", &self.is_persistent())
            .finish()
    }
}
