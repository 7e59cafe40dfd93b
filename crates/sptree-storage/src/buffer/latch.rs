//! Page latches.
//!
//! A [`PageGuard`] holds the exclusive latch of one frame. The latch is
//! released when the guard is dropped, on every exit path.

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::RawMutex;
use sptree_common::types::PageId;

use crate::page::SlottedPage;

/// Contents of one buffer frame.
pub(crate) struct FrameData {
    pub(crate) data: Box<[u8]>,
    pub(crate) dirty: bool,
}

impl FrameData {
    pub(crate) fn zeroed(page_size: usize) -> Self {
        Self {
            data: vec![0u8; page_size].into_boxed_slice(),
            dirty: false,
        }
    }
}

/// Exclusive latch on a page.
///
/// This guard:
/// - Provides read-write access to page data
/// - Marks the frame dirty on mutable access
/// - Releases the latch when dropped
pub struct PageGuard {
    page_id: PageId,
    frame: ArcMutexGuard<RawMutex, FrameData>,
}

impl PageGuard {
    pub(crate) fn new(page_id: PageId, frame: ArcMutexGuard<RawMutex, FrameData>) -> Self {
        Self { page_id, frame }
    }

    /// Returns the page ID.
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the page data.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.frame.data
    }

    /// Returns the page data mutably, marking the page dirty.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.frame.dirty = true;
        &mut self.frame.data
    }

    /// Returns a slotted-page view of the data.
    #[inline]
    pub fn page(&self) -> SlottedPage<&[u8]> {
        SlottedPage::new(self.data())
    }

    /// Returns a mutable slotted-page view, marking the page dirty.
    #[inline]
    pub fn page_mut(&mut self) -> SlottedPage<&mut [u8]> {
        SlottedPage::new(self.data_mut())
    }

    /// Returns true if the page was modified since it was last flushed.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.frame.dirty
    }
}

impl std::fmt::Debug for PageGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard")
            .field("page_id", &self.page_id)
            .field("dirty", &self.frame.dirty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_guard_releases_on_drop() {
        let frame = Arc::new(Mutex::new(FrameData::zeroed(4096)));

        {
            let mut guard = PageGuard::new(PageId::new(4), frame.lock_arc());
            assert!(frame.try_lock().is_none());
            assert!(!guard.is_dirty());
            guard.data_mut()[100] = 1;
            assert!(guard.is_dirty());
        }

        let data = frame.try_lock().unwrap();
        assert!(data.dirty);
        assert_eq!(data.data[100], 1);
    }
}
