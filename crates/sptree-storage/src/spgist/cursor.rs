//! Positions in the tree during a descent.
//!
//! An insertion tracks two [`PageCursor`]s: `current`, the tuple being
//! worked on, and `parent`, the inner tuple node whose downlink led there.
//! Each latched page is held by exactly one [`PageGuard`]. When both
//! cursors address the same page, the single guard is kept by `current`
//! once it has been materialized and by `parent` until then, so a page is
//! never latched or released twice.

use sptree_common::types::{ItemOffset, ItemPointer, PageId, INVALID_OFFSET};
use tracing::trace;

use super::error::{SpGistError, SpGistResult};
use super::page::item_at_mut;
use super::space::SpaceMap;
use super::tuple::set_node_downlink;
use crate::buffer::{BufferManager, PageGuard};
use sptree_wal::NodeLink;

/// One location in the tree, possibly not latched yet.
#[derive(Debug)]
pub struct PageCursor {
    /// Page, or invalid when a fresh leaf page is still to be chosen.
    pub page_id: PageId,
    /// Latch on the page, when this cursor holds it.
    pub guard: Option<PageGuard>,
    /// Tuple offset, or `INVALID_OFFSET`.
    pub offset: ItemOffset,
    /// Node of the inner tuple being followed (parent cursors only).
    pub node: Option<usize>,
}

impl PageCursor {
    /// A cursor that addresses nothing.
    pub fn unset() -> Self {
        Self {
            page_id: PageId::INVALID,
            guard: None,
            offset: INVALID_OFFSET,
            node: None,
        }
    }

    /// A cursor at a known tuple, not latched yet.
    pub fn at(page_id: PageId, offset: ItemOffset) -> Self {
        Self {
            page_id,
            guard: None,
            offset,
            node: None,
        }
    }

    /// Returns true once the cursor names a page.
    #[inline]
    pub fn is_located(&self) -> bool {
        self.page_id.is_valid()
    }

    /// Returns the cursor's tuple address.
    #[inline]
    pub fn pointer(&self) -> ItemPointer {
        ItemPointer::new(self.page_id, self.offset)
    }
}

/// Result of latching the current page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Materialized {
    /// The page is latched; `is_new` if it was freshly initialized.
    Ready {
        /// Page was (re)initialized by the space map.
        is_new: bool,
    },
    /// The latch could not be taken without risking a lock-order
    /// inversion; every latch has been released.
    Contended,
}

/// The pair of cursors of one insertion.
#[derive(Debug)]
pub struct Descent {
    /// Tuple being worked on.
    pub current: PageCursor,
    /// Inner tuple whose node points at `current`.
    pub parent: PageCursor,
}

impl Descent {
    /// Starts a descent at a root.
    pub fn from_root(root: PageId, offset: ItemOffset) -> Self {
        Self {
            current: PageCursor::at(root, offset),
            parent: PageCursor::unset(),
        }
    }

    /// Returns true if the descent passed through an inner tuple.
    #[inline]
    pub fn has_parent(&self) -> bool {
        self.parent.is_located()
    }

    /// Returns true if both cursors address one page.
    #[inline]
    pub fn shares_page(&self) -> bool {
        self.current.is_located() && self.current.page_id == self.parent.page_id
    }

    /// Latches the page named by `current`.
    ///
    /// A located page below a held parent on another page is only
    /// try-latched: another inserter may hold it while waiting for our
    /// parent.
    pub fn materialize(&mut self, buffers: &BufferManager) -> SpGistResult<Materialized> {
        if self.current.guard.is_some() {
            return Ok(Materialized::Ready { is_new: false });
        }
        if !self.has_parent() {
            self.current.guard = Some(buffers.lock(self.current.page_id)?);
        } else if self.shares_page() {
            self.current.guard = self.parent.guard.take();
        } else {
            match buffers.try_lock(self.current.page_id)? {
                Some(guard) => self.current.guard = Some(guard),
                None => {
                    trace!(page = %self.current.page_id, parent = %self.parent.page_id, "child latch busy");
                    self.parent.guard = None;
                    return Ok(Materialized::Contended);
                }
            }
        }
        if self.current.guard.is_none() {
            return Err(SpGistError::internal(format!(
                "no latch held for page {}",
                self.current.page_id
            )));
        }
        Ok(Materialized::Ready { is_new: false })
    }

    /// Installs a freshly obtained page as `current`.
    pub fn set_current_page(&mut self, guard: PageGuard, offset: ItemOffset) {
        self.current.page_id = guard.page_id();
        self.current.offset = offset;
        self.current.guard = Some(guard);
    }

    /// Returns the latch on the current page.
    pub fn current_guard(&mut self) -> SpGistResult<&mut PageGuard> {
        if self.current.guard.is_none() && self.shares_page() {
            return self
                .parent
                .guard
                .as_mut()
                .ok_or_else(|| SpGistError::internal("shared page is not latched"));
        }
        let page_id = self.current.page_id;
        self.current
            .guard
            .as_mut()
            .ok_or_else(|| SpGistError::internal(format!("current page {page_id} is not latched")))
    }

    /// Returns the latch on the parent page.
    pub fn parent_guard(&mut self) -> SpGistResult<&mut PageGuard> {
        if self.parent.guard.is_none() && self.shares_page() {
            return self
                .current
                .guard
                .as_mut()
                .ok_or_else(|| SpGistError::internal("shared page is not latched"));
        }
        let page_id = self.parent.page_id;
        self.parent
            .guard
            .as_mut()
            .ok_or_else(|| SpGistError::internal(format!("parent page {page_id} is not latched")))
    }

    /// Returns the parent node as a change-record link.
    pub fn parent_link(&self) -> Option<NodeLink> {
        self.has_parent().then(|| {
            NodeLink::new(
                self.parent.page_id,
                self.parent.offset,
                self.parent.node.unwrap_or(0) as u16,
            )
        })
    }

    /// Points the parent node's downlink at `target`.
    pub fn save_node_link(&mut self, target: ItemPointer) -> SpGistResult<()> {
        let node = self
            .parent
            .node
            .ok_or_else(|| SpGistError::internal("parent cursor has no node"))?;
        let offset = self.parent.offset;
        let guard = self.parent_guard()?;
        let page_id = guard.page_id();
        let mut page = guard.page_mut();
        let item = item_at_mut(&mut page, offset)?;
        set_node_downlink(item, node, target).map_err(|e| e.on_page(page_id))
    }

    /// Releases every latch, noting each page in the space map.
    pub fn release_all(&mut self, space: &SpaceMap) {
        if let Some(guard) = self.current.guard.take() {
            space.release(guard);
        }
        if let Some(guard) = self.parent.guard.take() {
            space.release(guard);
        }
    }
}
