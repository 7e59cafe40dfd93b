//! Blocking page file.
//!
//! The file is a flat array of pages; block N lives at byte offset
//! `N * page_size`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sptree_common::types::PageId;

use super::error::{BufferError, BufferResult};

/// A file of fixed-size pages.
pub struct PageFile {
    file: File,
    path: PathBuf,
    page_size: usize,
}

impl PageFile {
    /// Opens or creates a page file.
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> BufferResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let size = file.metadata()?.len();
        if size % page_size as u64 != 0 {
            return Err(BufferError::TornFile { size, page_size });
        }

        Ok(Self {
            file,
            path,
            page_size,
        })
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of pages in the file.
    pub fn page_count(&self) -> BufferResult<u32> {
        let pages = self.file.metadata()?.len() / self.page_size as u64;
        u32::try_from(pages).map_err(|_| BufferError::FileFull)
    }

    /// Reads a page into `buf`.
    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> BufferResult<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        self.file.seek(SeekFrom::Start(self.position(page_id)))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Writes a page from `buf`, extending the file if needed.
    pub fn write_page(&mut self, page_id: PageId, buf: &[u8]) -> BufferResult<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        self.file.seek(SeekFrom::Start(self.position(page_id)))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    /// Flushes file contents to stable storage.
    pub fn sync(&mut self) -> BufferResult<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    #[inline]
    fn position(&self, page_id: PageId) -> u64 {
        u64::from(page_id.as_u32()) * self.page_size as u64
    }
}

impl std::fmt::Debug for PageFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFile")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .finish()
    }
}
