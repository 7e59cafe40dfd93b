//! The buffer manager.

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use sptree_common::types::PageId;
use tracing::{debug, trace};

use super::config::BufferConfig;
use super::error::{BufferError, BufferResult};
use super::file::PageFile;
use super::latch::{FrameData, PageGuard};
use crate::page::{PageHeader, SlottedPage};

type Frame = Arc<Mutex<FrameData>>;

/// Owns every page of one index and hands out latched guards.
///
/// Without a backing file the manager is purely in memory; with one,
/// [`BufferManager::flush`] writes dirty pages back with fresh checksums.
pub struct BufferManager {
    config: BufferConfig,
    frames: RwLock<Vec<Frame>>,
    file: Option<Mutex<PageFile>>,
}

impl BufferManager {
    /// Creates an empty in-memory manager.
    pub fn new(config: BufferConfig) -> BufferResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            frames: RwLock::new(Vec::new()),
            file: None,
        })
    }

    /// Opens a file-backed manager, loading every existing page.
    pub fn open(path: impl AsRef<Path>, config: BufferConfig) -> BufferResult<Self> {
        config.validate()?;
        let mut file = PageFile::open(path, config.page_size)?;
        let count = file.page_count()?;

        let mut frames = Vec::with_capacity(count as usize);
        for block in 0..count {
            let page_id = PageId::new(block);
            let mut frame = FrameData::zeroed(config.page_size);
            file.read_page(page_id, &mut frame.data)?;

            if config.verify_checksums && !SlottedPage::new(&frame.data[..]).is_new() {
                let header = PageHeader::new(&frame.data[..]);
                if !header.verify_checksum() {
                    return Err(BufferError::ChecksumMismatch {
                        page_id,
                        expected: header.checksum(),
                        actual: header.computed_checksum(),
                    });
                }
            }
            frames.push(Arc::new(Mutex::new(frame)));
        }

        debug!(path = %file.path().display(), pages = count, "opened index file");
        Ok(Self {
            config,
            frames: RwLock::new(frames),
            file: Some(Mutex::new(file)),
        })
    }

    /// Returns the page size.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Returns the number of pages.
    pub fn page_count(&self) -> u32 {
        self.frames.read().len() as u32
    }

    fn frame(&self, page_id: PageId) -> BufferResult<Frame> {
        let frames = self.frames.read();
        frames
            .get(page_id.as_usize())
            .cloned()
            .ok_or(BufferError::PageOutOfRange {
                page_id,
                page_count: frames.len() as u32,
            })
    }

    /// Pins and latches a page, waiting for the latch if necessary.
    pub fn lock(&self, page_id: PageId) -> BufferResult<PageGuard> {
        let frame = self.frame(page_id)?;
        Ok(PageGuard::new(page_id, frame.lock_arc()))
    }

    /// Pins and latches a page only if the latch is free right now.
    pub fn try_lock(&self, page_id: PageId) -> BufferResult<Option<PageGuard>> {
        let frame = self.frame(page_id)?;
        Ok(frame
            .try_lock_arc()
            .map(|guard| PageGuard::new(page_id, guard)))
    }

    /// Appends a zeroed page and returns it latched.
    ///
    /// Nothing references the new page yet, so the latch is uncontended.
    pub fn extend(&self) -> BufferResult<PageGuard> {
        let mut frames = self.frames.write();
        let block = u32::try_from(frames.len()).map_err(|_| BufferError::FileFull)?;
        if block == PageId::INVALID.as_u32() {
            return Err(BufferError::FileFull);
        }

        let frame = Arc::new(Mutex::new(FrameData::zeroed(self.config.page_size)));
        let guard = frame.lock_arc();
        frames.push(frame);
        trace!(block, "extended index");
        Ok(PageGuard::new(PageId::new(block), guard))
    }

    /// Writes every dirty page to the backing file and syncs it.
    ///
    /// Waits for each page latch in turn; callers must not hold any guard.
    /// A no-op for in-memory managers.
    pub fn flush(&self) -> BufferResult<usize> {
        let Some(file) = &self.file else {
            return Ok(0);
        };
        let frames: Vec<Frame> = self.frames.read().clone();
        let mut file = file.lock();

        let mut written = 0;
        for (block, frame) in frames.iter().enumerate() {
            let mut data = frame.lock();
            if !data.dirty {
                continue;
            }
            if !SlottedPage::new(&data.data[..]).is_new() {
                PageHeader::new(&mut data.data[..]).update_checksum();
            }
            file.write_page(PageId::new(block as u32), &data.data)?;
            data.dirty = false;
            written += 1;
        }
        file.sync()?;

        debug!(written, "flushed dirty pages");
        Ok(written)
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("page_size", &self.config.page_size)
            .field("pages", &self.page_count())
            .field("file_backed", &self.file.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageFlags;
    use tempfile::tempdir;

    fn manager() -> BufferManager {
        BufferManager::new(BufferConfig::for_testing()).unwrap()
    }

    #[test]
    fn test_extend_and_lock() {
        let mgr = manager();
        assert_eq!(mgr.page_count(), 0);

        let guard = mgr.extend().unwrap();
        assert_eq!(guard.page_id(), PageId::new(0));
        assert!(guard.page().is_new());
        drop(guard);

        let guard = mgr.lock(PageId::new(0)).unwrap();
        assert_eq!(guard.data().len(), 4096);
        assert_eq!(mgr.page_count(), 1);
    }

    #[test]
    fn test_try_lock_contended() {
        let mgr = manager();
        drop(mgr.extend().unwrap());

        let held = mgr.lock(PageId::new(0)).unwrap();
        assert!(mgr.try_lock(PageId::new(0)).unwrap().is_none());
        drop(held);
        assert!(mgr.try_lock(PageId::new(0)).unwrap().is_some());
    }

    #[test]
    fn test_lock_out_of_range() {
        let mgr = manager();
        let err = mgr.lock(PageId::new(5)).unwrap_err();
        assert!(matches!(err, BufferError::PageOutOfRange { .. }));
        assert!(mgr.try_lock(PageId::new(5)).is_err());
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.sp");

        {
            let mgr = BufferManager::open(&path, BufferConfig::for_testing()).unwrap();
            let mut guard = mgr.extend().unwrap();
            let mut page = guard.page_mut();
            page.initialize(PageId::new(0), PageFlags::LEAF);
            page.add_item(b"persisted").unwrap();
            drop(guard);

            assert_eq!(mgr.flush().unwrap(), 1);
            assert_eq!(mgr.flush().unwrap(), 0);
        }

        let mgr = BufferManager::open(&path, BufferConfig::for_testing()).unwrap();
        assert_eq!(mgr.page_count(), 1);
        let guard = mgr.lock(PageId::new(0)).unwrap();
        assert_eq!(guard.page().item(1).unwrap(), b"persisted");
    }

    #[test]
    fn test_checksum_mismatch_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.sp");
        {
            let mgr = BufferManager::open(&path, BufferConfig::for_testing()).unwrap();
            let mut guard = mgr.extend().unwrap();
            guard
                .page_mut()
                .initialize(PageId::new(0), PageFlags::LEAF);
            drop(guard);
            mgr.flush().unwrap();
        }

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[4000] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let err = BufferManager::open(&path, BufferConfig::for_testing()).unwrap_err();
        assert!(err.is_corruption());

        let mgr = BufferManager::open(
            &path,
            BufferConfig::for_testing().with_verify_checksums(false),
        )
        .unwrap();
        assert_eq!(mgr.page_count(), 1);
    }
}
