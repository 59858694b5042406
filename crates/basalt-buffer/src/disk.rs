//! Disk manager for page-level file I/O.

use basalt_common::{BasaltError, PageId, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Name of the page file inside the data directory.
pub const PAGE_FILE_NAME: &str = "pages.db";

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Directory holding the page file.
    pub data_dir: PathBuf,
    /// Size of every page in the file.
    pub page_size: usize,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

/// Reads and writes fixed-size pages of a single page file.
///
/// Page `n` lives at byte offset `n * page_size`.
pub struct DiskManager {
    config: DiskManagerConfig,
    path: PathBuf,
    file: Mutex<FileHandle>,
}

/// Handle for the open page file.
struct FileHandle {
    file: File,
    /// Number of pages in the file.
    num_pages: u32,
}

impl DiskManager {
    /// Opens or creates the page file in `config.data_dir`.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let path = config.data_dir.join(PAGE_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        if file_size % config.page_size as u64 != 0 {
            return Err(BasaltError::PageSizeMismatch {
                expected: config.page_size,
                actual: (file_size % config.page_size as u64) as usize,
            });
        }
        let num_pages = (file_size / config.page_size as u64) as u32;

        Ok(Self {
            config,
            path,
            file: Mutex::new(FileHandle { file, num_pages }),
        })
    }

    /// Returns the page file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the page size this file was opened with.
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Reads a page from disk.
    pub fn read_page(&self, page_id: PageId) -> Result<Vec<u8>> {
        let mut handle = self.file.lock();

        if page_id.0 >= handle.num_pages {
            return Err(BasaltError::PageNotFound { page_id: page_id.0 });
        }

        let offset = (page_id.0 as u64) * (self.config.page_size as u64);
        handle.file.seek(SeekFrom::Start(offset))?;

        let mut buffer = vec![0u8; self.config.page_size];
        handle.file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// Writes a page to disk, extending the file when needed.
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != self.config.page_size {
            return Err(BasaltError::PageSizeMismatch {
                expected: self.config.page_size,
                actual: data.len(),
            });
        }

        let mut handle = self.file.lock();

        let offset = (page_id.0 as u64) * (self.config.page_size as u64);
        handle.file.seek(SeekFrom::Start(offset))?;
        handle.file.write_all(data)?;

        // Update page count if we extended the file
        if page_id.0 >= handle.num_pages {
            handle.num_pages = page_id.0 + 1;
        }

        Ok(())
    }

    /// Truncates the file to `num_pages` pages.
    pub fn truncate(&self, num_pages: u32) -> Result<()> {
        let mut handle = self.file.lock();
        handle
            .file
            .set_len(num_pages as u64 * self.config.page_size as u64)?;
        handle.num_pages = num_pages;
        Ok(())
    }

    /// Returns the number of pages in the file.
    pub fn num_pages(&self) -> u32 {
        self.file.lock().num_pages
    }

    /// Flushes pending writes to disk when fsync is enabled.
    pub fn sync(&self) -> Result<()> {
        if self.config.fsync_enabled {
            self.file.lock().file.sync_all()?;
        }
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.sync();
    }
}
