//! Page allocation.
//!
//! The [`SpaceMap`] remembers one recently used page per request class
//! and hands it out again while it has room, so consecutive insertions
//! fill pages instead of extending the file each time. Inner pages are
//! additionally spread over three parity classes: an inner tuple moved
//! off its page goes to a page of a different class than the page it
//! came from, which keeps a parent and child inner tuple apart and makes
//! opposing lock orders between concurrent inserters less likely.

use parking_lot::Mutex;
use sptree_common::types::PageId;
use tracing::{debug, trace};

use super::config::SpGistConfig;
use super::error::{SpGistError, SpGistResult};
use super::meta::{LastUsedPage, MetaData, CACHE_SLOTS};
use super::page::{free_space, is_fixed, page_flags};
use crate::buffer::{BufferManager, PageGuard};
use crate::page::PageFlags;

const SLOT_LEAF: usize = 3;
const SLOT_NULLS: usize = 4;

/// Parity class of a block.
#[inline]
pub fn parity_of(page_id: PageId) -> u32 {
    page_id.as_u32() % 3
}

/// Kind of page wanted from the space map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// A leaf page.
    Leaf,
    /// An inner page whose block number has the given parity.
    Inner {
        /// Block number modulo three.
        parity: u32,
    },
}

/// A page request: kind plus which tree the page belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Leaf or inner.
    pub kind: PageKind,
    /// Page belongs to the nulls tree.
    pub nulls: bool,
}

impl PageRequest {
    /// Requests a leaf page.
    pub fn leaf(nulls: bool) -> Self {
        Self {
            kind: PageKind::Leaf,
            nulls,
        }
    }

    /// Requests an inner page with the parity of `block`.
    pub fn inner(block: u32, nulls: bool) -> Self {
        Self {
            kind: PageKind::Inner { parity: block % 3 },
            nulls,
        }
    }

    /// Returns true for leaf requests.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.kind == PageKind::Leaf
    }

    /// Flags of a page satisfying this request.
    #[inline]
    pub fn page_flags(&self) -> PageFlags {
        page_flags(self.is_leaf(), self.nulls)
    }

    /// Cache slot for this request.
    #[inline]
    pub fn slot(&self) -> usize {
        let base = match self.kind {
            PageKind::Leaf => SLOT_LEAF,
            PageKind::Inner { parity } => parity as usize,
        };
        if self.nulls {
            base | SLOT_NULLS
        } else {
            base
        }
    }

    fn matches(&self, flags: PageFlags) -> bool {
        flags.is_leaf() == self.is_leaf() && flags.stores_nulls() == self.nulls
    }
}

/// Last-used-page cache and allocation policy.
pub struct SpaceMap {
    capacity: usize,
    target_free_space: usize,
    cache: Mutex<[LastUsedPage; CACHE_SLOTS]>,
}

impl SpaceMap {
    /// Creates an empty space map.
    pub fn new(config: &SpGistConfig) -> Self {
        Self {
            capacity: config.page_capacity(),
            target_free_space: config.target_free_space(),
            cache: Mutex::new([LastUsedPage::EMPTY; CACHE_SLOTS]),
        }
    }

    /// Replaces the cache with one read from the meta page.
    pub fn load(&self, meta: &MetaData) {
        *self.cache.lock() = meta.last_used;
    }

    /// Returns the cache in meta page form.
    pub fn snapshot(&self) -> MetaData {
        MetaData {
            last_used: *self.cache.lock(),
        }
    }

    /// Returns the cached entry for a request.
    pub fn cached(&self, request: PageRequest) -> LastUsedPage {
        self.cache.lock()[request.slot()]
    }

    /// Returns a latched page of the requested kind with at least `need`
    /// bytes free, and whether the page was (re)initialized for the caller.
    ///
    /// Pages the caller already holds are never returned: their latches
    /// cannot be taken again, so they are skipped like busy pages.
    pub fn get_page(
        &self,
        buffers: &BufferManager,
        request: PageRequest,
        need: usize,
    ) -> SpGistResult<(PageGuard, bool)> {
        if need > self.capacity {
            return Err(SpGistError::internal(format!(
                "desired tuple size {need} is too big for a page of capacity {}",
                self.capacity
            )));
        }
        let need = (need + self.target_free_space).min(self.capacity);

        let slot = request.slot();
        let cached = self.cache.lock()[slot];
        if !cached.page_id.is_valid() || cached.free_space < need {
            return Ok((self.alloc_new(buffers, request)?, true));
        }

        if let Some(mut guard) = buffers.try_lock(cached.page_id)? {
            let flags = guard.page().flags();
            let reusable = {
                let page = guard.page();
                page.is_new() || page.is_empty() || flags.contains(PageFlags::DELETED)
            };
            if reusable {
                let page_id = guard.page_id();
                guard.page_mut().initialize(page_id, request.page_flags());
                let free = guard.page().exact_free_space();
                self.update_slot(slot, page_id, free.saturating_sub(need));
                trace!(page = %page_id, slot, "reinitialized cached page");
                return Ok((guard, true));
            }

            if request.matches(flags) {
                let free = guard.page().exact_free_space();
                if free >= need {
                    self.update_slot(slot, guard.page_id(), free - need);
                    return Ok((guard, false));
                }
            }
        }

        Ok((self.alloc_new(buffers, request)?, true))
    }

    fn update_slot(&self, slot: usize, page_id: PageId, free_space: usize) {
        self.cache.lock()[slot] = LastUsedPage {
            page_id,
            free_space,
        };
    }

    /// Extends the index until a page of the right parity turns up.
    ///
    /// Inner pages of the wrong parity are parked in the cache for later
    /// requests of their own class.
    fn alloc_new(&self, buffers: &BufferManager, request: PageRequest) -> SpGistResult<PageGuard> {
        loop {
            let mut guard = buffers.extend()?;
            let page_id = guard.page_id();
            guard.page_mut().initialize(page_id, request.page_flags());

            let PageKind::Inner { parity } = request.kind else {
                debug!(page = %page_id, nulls = request.nulls, "allocated leaf page");
                return Ok(guard);
            };
            if parity_of(page_id) == parity {
                debug!(page = %page_id, parity, "allocated inner page");
                return Ok(guard);
            }

            let parked = PageRequest::inner(page_id.as_u32(), request.nulls);
            let free = guard.page().exact_free_space();
            self.update_slot(parked.slot(), page_id, free);
            trace!(page = %page_id, wanted = parity, "parked inner page of other parity");
        }
    }

    /// Notes that the caller is done with a page, remembering it if it has
    /// more room than the page cached for its class.
    pub fn set_last_used(&self, guard: &PageGuard) {
        let page_id = guard.page_id();
        if is_fixed(page_id) {
            return;
        }
        let page = guard.page();
        let flags = page.flags();
        let request = if flags.is_leaf() {
            PageRequest::leaf(flags.stores_nulls())
        } else {
            PageRequest::inner(page_id.as_u32(), flags.stores_nulls())
        };
        let free = free_space(&page, 1);

        let mut cache = self.cache.lock();
        let entry = &mut cache[request.slot()];
        if !entry.page_id.is_valid() || entry.page_id == page_id || entry.free_space < free {
            *entry = LastUsedPage {
                page_id,
                free_space: free,
            };
        }
    }

    /// Releases a page latch after recording the page in the cache.
    pub fn release(&self, guard: PageGuard) {
        self.set_last_used(&guard);
        drop(guard);
    }
}

impl std::fmt::Debug for SpaceMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceMap")
            .field("capacity", &self.capacity)
            .field("target_free_space", &self.target_free_space)
            .field("cache", &*self.cache.lock())
            .finish()
    }
}
