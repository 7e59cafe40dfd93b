//! Structural walk over both trees.
//!
//! The inspector starts at each root and follows every node downlink and
//! every redirect it meets. It verifies what the insertion engine promises
//! about the structure:
//!
//! - an inner root holds exactly one tuple;
//! - a leaf root holds only live, unchained tuples;
//! - a chain stays on one page, ends, and is reached exactly once;
//! - an inner tuple labels either all of its nodes or none;
//! - every page of a tree agrees with the tree's nulls flag.

use std::collections::HashSet;

use sptree_common::types::{ItemPointer, PageId, FIRST_OFFSET, INVALID_OFFSET};
use tracing::trace;

use super::chain::scan_chain;
use super::error::{SpGistError, SpGistResult};
use super::page::{is_root, item_at, read_inner, read_leaf, state_at, NULLS_ROOT_BLOCK, ROOT_BLOCK};
use super::tuple::{DeadTuple, LeafTuple, TupleState};
use crate::buffer::BufferManager;

/// What a walk found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeReport {
    /// Heap pointers of live entries with a key, in visit order.
    pub heap_ptrs: Vec<ItemPointer>,
    /// Heap pointers of live entries with a null key.
    pub null_heap_ptrs: Vec<ItemPointer>,
    /// Live inner tuples.
    pub inner_tuples: usize,
    /// Summed footprint of every live leaf tuple, line pointers included.
    pub live_leaf_bytes: usize,
    /// Inner tuples in allTheSame mode.
    pub all_the_same_tuples: usize,
    /// Redirects followed to reach a tuple.
    pub redirects_followed: usize,
    /// Largest number of inner tuples above any leaf.
    pub depth: usize,
    /// Distinct pages visited.
    pub pages_visited: usize,
}

impl TreeReport {
    /// Returns the number of live entries in both trees.
    pub fn live_entries(&self) -> usize {
        self.heap_ptrs.len() + self.null_heap_ptrs.len()
    }
}

/// A location still to be visited.
#[derive(Debug, Clone, Copy)]
struct Pending {
    ptr: ItemPointer,
    depth: usize,
}

/// Walks the trees of one page store.
pub struct TreeInspector<'a> {
    buffers: &'a BufferManager,
    report: TreeReport,
    pages: HashSet<PageId>,
    visited: HashSet<ItemPointer>,
}

impl<'a> TreeInspector<'a> {
    /// Creates an inspector over `buffers`.
    pub fn new(buffers: &'a BufferManager) -> Self {
        Self {
            buffers,
            report: TreeReport::default(),
            pages: HashSet::new(),
            visited: HashSet::new(),
        }
    }

    /// Walks both trees.
    pub fn run(mut self) -> SpGistResult<TreeReport> {
        for (root, nulls) in [(ROOT_BLOCK, false), (NULLS_ROOT_BLOCK, true)] {
            self.walk(root, nulls)?;
        }
        self.report.pages_visited = self.pages.len();
        Ok(self.report)
    }

    fn walk(&mut self, root: PageId, nulls: bool) -> SpGistResult<()> {
        let mut stack = Vec::new();
        {
            let guard = self.buffers.lock(root)?;
            let page = guard.page();
            self.check_flags(root, page.flags().stores_nulls(), nulls)?;
            self.pages.insert(root);

            if page.flags().is_leaf() {
                for offset in FIRST_OFFSET..=page.max_offset() {
                    if state_at(&page, offset)? != TupleState::Live {
                        return Err(SpGistError::corrupted(
                            root,
                            format!("leaf root holds a dead tuple at {offset}"),
                        ));
                    }
                    let leaf = read_leaf(&page, offset)?;
                    if leaf.next != INVALID_OFFSET {
                        return Err(SpGistError::corrupted(
                            root,
                            format!("leaf root tuple {offset} is chained"),
                        ));
                    }
                    self.record_leaf(&leaf, nulls);
                }
                return Ok(());
            }

            if page.max_offset() != 1 {
                return Err(SpGistError::corrupted(
                    root,
                    format!("inner root holds {} tuples", page.max_offset()),
                ));
            }
            stack.push(Pending {
                ptr: ItemPointer::new(root, FIRST_OFFSET),
                depth: 0,
            });
        }

        while let Some(pending) = stack.pop() {
            self.visit(pending, nulls, &mut stack)?;
        }
        Ok(())
    }

    fn visit(&mut self, pending: Pending, nulls: bool, stack: &mut Vec<Pending>) -> SpGistResult<()> {
        let Pending { ptr, depth } = pending;
        let page_id = ptr.page_id();
        if !self.visited.insert(ptr) {
            return Err(SpGistError::corrupted(
                page_id,
                format!("tuple {ptr} is reached twice"),
            ));
        }

        let guard = self.buffers.lock(page_id)?;
        let page = guard.page();
        self.check_flags(page_id, page.flags().stores_nulls(), nulls)?;
        self.pages.insert(page_id);
        let offset = ptr.offset();

        match state_at(&page, offset)? {
            TupleState::Redirect => {
                let dead = DeadTuple::decode(item_at(&page, offset)?).map_err(|e| e.on_page(page_id))?;
                if !dead.target.is_valid() || is_root(dead.target.page_id()) {
                    return Err(SpGistError::corrupted(
                        page_id,
                        format!("redirect at {offset} points at {}", dead.target),
                    ));
                }
                self.report.redirects_followed += 1;
                trace!(from = %ptr, to = %dead.target, "follow redirect");
                stack.push(Pending {
                    ptr: dead.target,
                    depth,
                });
            }
            _ if page.flags().is_leaf() => {
                let scan = scan_chain(&page, offset)?;
                for &chained in scan.offsets.iter().skip(1) {
                    if !self.visited.insert(ItemPointer::new(page_id, chained)) {
                        return Err(SpGistError::corrupted(
                            page_id,
                            format!("chain from {offset} runs into a visited tuple at {chained}"),
                        ));
                    }
                }
                for leaf in &scan.live {
                    self.record_leaf(leaf, nulls);
                }
                self.report.depth = self.report.depth.max(depth);
            }
            TupleState::Live => {
                let inner = read_inner(&page, offset)?;
                inner.labels().map_err(|e| e.on_page(page_id))?;
                self.report.inner_tuples += 1;
                if inner.all_the_same {
                    self.report.all_the_same_tuples += 1;
                }
                for node in inner.nodes.iter().filter(|n| n.downlink.is_valid()) {
                    stack.push(Pending {
                        ptr: node.downlink,
                        depth: depth + 1,
                    });
                }
            }
            state => {
                return Err(SpGistError::corrupted(
                    page_id,
                    format!("downlink reaches a {state:?} inner tuple at {offset}"),
                ))
            }
        }
        Ok(())
    }

    fn check_flags(&self, page_id: PageId, page_nulls: bool, nulls: bool) -> SpGistResult<()> {
        if page_nulls != nulls {
            return Err(SpGistError::corrupted(
                page_id,
                "page nulls flag does not match its tree",
            ));
        }
        Ok(())
    }

    fn record_leaf(&mut self, leaf: &LeafTuple, nulls: bool) {
        self.report.live_leaf_bytes += leaf.footprint();
        if nulls {
            self.report.null_heap_ptrs.push(leaf.heap_ptr);
        } else {
            self.report.heap_ptrs.push(leaf.heap_ptr);
        }
    }
}
