//! Pick-split: turning an overflowing leaf location into an inner tuple.
//!
//! The live tuples at the location (the whole root page, or one chain)
//! plus the new entry are handed to the strategy, which groups them into
//! nodes. One new inner tuple is built over the groups and each group
//! becomes a chain on either the original page or one new leaf page. A
//! group is never split across pages. If the strategy failed to separate
//! the tuples at all, the split is forced into an allTheSame tuple with a
//! fixed fan-out so that every cycle makes progress.

use std::iter;

use sptree_common::constants::ALL_THE_SAME_FANOUT;
use sptree_common::types::{ItemOffset, ItemPointer, PageId, FIRST_OFFSET, INVALID_OFFSET};
use sptree_wal::{ChangeRecord, PickSplitPayload, RecordFlags};
use tracing::debug;

use super::chain::{scan_chain, tombstone_savings};
use super::cursor::Descent;
use super::error::{SpGistError, SpGistResult};
use super::insert::{stamp, Inserter};
use super::page::{
    add_new_item, free_space, is_root, item_at_mut, multi_delete, page_flags, read_leaf, state_at,
    META_BLOCK,
};
use super::space::PageRequest;
use super::strategy::{PickSplitInput, PickSplitOutput};
use super::tuple::{set_redirect_target, InnerTuple, LeafTuple, NodeTuple, TupleState};
use crate::buffer::PageGuard;
use crate::page::SlottedPage;

/// What the degenerate-split check decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitVerdict {
    /// The strategy's grouping was replaced by a forced fan-out.
    pub all_the_same: bool,
    /// The new entry takes part in this split.
    pub include_new: bool,
}

/// Overrides a pick-split result that put every tuple in one node.
///
/// The new entry is the last tuple of the map. When the tuples cannot all
/// fit on one page (`too_big`), only the old tuples are compared, and the
/// new entry is left out of the split if the strategy put it elsewhere.
/// A forced split spreads the tuples round-robin over a fixed number of
/// nodes that all carry the one label.
pub fn check_all_the_same(output: &mut PickSplitOutput, too_big: bool) -> SpGistResult<SplitVerdict> {
    let n = output.map.len();
    let mut verdict = SplitVerdict {
        all_the_same: false,
        include_new: true,
    };
    if n <= 1 {
        return Ok(verdict);
    }

    let limit = if too_big { n - 1 } else { n };
    let the_node = output.map[0];
    if output.map[1..limit].iter().any(|&node| node != the_node) {
        return Ok(verdict);
    }
    if too_big && output.map[n - 1] != the_node {
        verdict.include_new = false;
    }

    let label = match &output.node_labels {
        Some(labels) => Some(labels.get(the_node).cloned().ok_or_else(|| {
            SpGistError::contract("inconsistent result of pick-split: node out of range")
        })?),
        None => None,
    };
    output.n_nodes = ALL_THE_SAME_FANOUT;
    for (i, node) in output.map.iter_mut().enumerate() {
        *node = i % ALL_THE_SAME_FANOUT;
    }
    if let Some(label) = label {
        output.node_labels = Some(vec![label; ALL_THE_SAME_FANOUT]);
    }
    verdict.all_the_same = true;
    Ok(verdict)
}

/// Greedily assigns node groups to the current page or the new page.
///
/// Returns false if either page overflows.
fn assign_nodes(leaf_sizes: &[usize], current_free: usize, new_free: usize, on_new: &mut [bool]) -> bool {
    let mut current = current_free as isize;
    let mut new = new_free as isize;
    for (size, slot) in leaf_sizes.iter().zip(on_new.iter_mut()) {
        let size = *size as isize;
        if size <= current {
            *slot = false;
            current -= size;
        } else {
            *slot = true;
            new -= size;
        }
    }
    current >= 0 && new >= 0
}

/// Collects every tuple of a leaf root; all of them must be live.
fn collect_root<B: AsRef<[u8]>>(page: &SlottedPage<B>) -> SpGistResult<(Vec<LeafTuple>, usize)> {
    let mut tuples = Vec::with_capacity(page.max_offset() as usize);
    let mut bytes = 0;
    for offset in FIRST_OFFSET..=page.max_offset() {
        match state_at(page, offset)? {
            TupleState::Live => {
                let leaf = read_leaf(page, offset)?;
                bytes += leaf.footprint();
                tuples.push(leaf);
            }
            state => {
                return Err(SpGistError::corrupted(
                    page.page_id(),
                    format!("unexpected tuple state {state:?} on leaf root at {offset}"),
                ))
            }
        }
    }
    Ok((tuples, bytes))
}

/// Where the new inner tuple goes.
enum InnerTarget {
    /// Next to the parent tuple.
    Parent,
    /// On another inner page.
    NewPage(PageGuard, bool),
    /// The leaf root itself, reinitialized as an inner page.
    Root,
}

impl Inserter<'_> {
    /// Splits the current leaf location to make room for `leaf`.
    ///
    /// Returns true if `leaf` was stored. Otherwise `current` addresses the
    /// new inner tuple and the caller continues there.
    pub(crate) fn pick_split(
        &self,
        descent: &mut Descent,
        leaf: &LeafTuple,
        nulls: bool,
        is_new: bool,
        level: u32,
    ) -> SpGistResult<bool> {
        let capacity = self.capacity();
        let src_id = descent.current.page_id;
        let root = is_root(src_id);
        let mut src = descent
            .current
            .guard
            .take()
            .ok_or_else(|| SpGistError::internal(format!("leaf page {src_id} is not latched")))?;

        let (old, to_delete, space_to_delete) = {
            let page = src.page();
            if root {
                let (tuples, bytes) = collect_root(&page)?;
                (tuples, Vec::new(), bytes)
            } else {
                let scan = scan_chain(&page, descent.current.offset)?;
                let savings = tombstone_savings(&scan);
                (scan.live, scan.offsets, savings)
            }
        };
        let n_old = old.len();
        let n_tuples = n_old + 1;

        let (mut output, leaves): (PickSplitOutput, Vec<LeafTuple>) = if nulls {
            let output = PickSplitOutput {
                prefix: None,
                n_nodes: 1,
                node_labels: None,
                map: vec![0; n_tuples],
                leaf_datums: vec![Vec::new(); n_tuples],
            };
            let leaves = old
                .iter()
                .chain(iter::once(leaf))
                .map(|t| LeafTuple::new(t.heap_ptr, None))
                .collect();
            (output, leaves)
        } else {
            let datums: Vec<&[u8]> = old
                .iter()
                .chain(iter::once(leaf))
                .map(|t| t.datum.as_deref().unwrap_or(&[]))
                .collect();
            let output = self.strategy.pick_split(&PickSplitInput {
                datums: &datums,
                level,
            })?;
            output.validate(n_tuples, capacity)?;
            let leaves = old
                .iter()
                .chain(iter::once(leaf))
                .zip(&output.leaf_datums)
                .map(|(t, datum)| LeafTuple::new(t.heap_ptr, Some(datum.clone())))
                .collect();
            (output, leaves)
        };

        let mut total: usize = leaves.iter().map(LeafTuple::footprint).sum();
        let verdict = check_all_the_same(&mut output, total > capacity)?;
        let new_footprint = leaves[n_tuples - 1].footprint();
        let max_to_include = if verdict.include_new {
            n_tuples
        } else {
            total -= new_footprint;
            n_tuples - 1
        };

        let nodes = (0..output.n_nodes)
            .map(|i| {
                NodeTuple::new(
                    output
                        .node_labels
                        .as_ref()
                        .and_then(|labels| labels.get(i).cloned()),
                )
            })
            .collect();
        let mut inner = InnerTuple::new(output.prefix.clone(), nodes, verdict.all_the_same);
        inner.check_size(capacity)?;

        let mut leaf_sizes = vec![0usize; output.n_nodes];
        for i in 0..max_to_include {
            let node = output.map[i];
            if node >= output.n_nodes {
                return Err(SpGistError::contract(format!(
                    "inconsistent result of pick-split: tuple {i} mapped to node {node} of {}",
                    output.n_nodes
                )));
            }
            leaf_sizes[node] += leaves[i].footprint();
        }

        let mut inner_target = if descent.has_parent() {
            let parent_id = descent.parent.page_id;
            let fits = {
                let guard = descent.parent_guard()?;
                let page = guard.page();
                free_space(&page, 1) >= inner.footprint()
            };
            if fits && !is_root(parent_id) {
                InnerTarget::Parent
            } else {
                let request = PageRequest::inner(parent_id.as_u32() + 1, nulls);
                let (guard, is_new) = self.space.get_page(self.buffers, request, inner.footprint())?;
                InnerTarget::NewPage(guard, is_new)
            }
        } else if root {
            InnerTarget::Root
        } else {
            return Err(SpGistError::internal(format!(
                "leaf location on page {src_id} has no parent"
            )));
        };

        let current_free = if root {
            0
        } else {
            src.page().exact_free_space() + space_to_delete
        };
        let mut n_to_insert = n_old;
        let mut inserted_new = false;
        let mut new_leaf: Option<(PageGuard, bool)> = None;
        let mut node_on_new = vec![false; output.n_nodes];

        if total <= current_free {
            if verdict.include_new {
                n_to_insert += 1;
                inserted_new = true;
            }
        } else if n_tuples == 1 && total > capacity {
            // A long value not yet short enough: no leaf is placed and the
            // caller descends into the new inner tuple
        } else {
            let (guard, dest_is_new) =
                self.space
                    .get_page(self.buffers, PageRequest::leaf(nulls), total.min(capacity))?;
            let new_free = guard.page().exact_free_space();
            if assign_nodes(&leaf_sizes, current_free, new_free, &mut node_on_new) {
                if verdict.include_new {
                    n_to_insert += 1;
                    inserted_new = true;
                }
            } else if verdict.include_new {
                let node_of_new = output.map[n_tuples - 1];
                leaf_sizes[node_of_new] -= new_footprint;
                if !assign_nodes(&leaf_sizes, current_free, new_free, &mut node_on_new) {
                    return Err(SpGistError::internal(
                        "failed to divide leaf tuple groups across pages",
                    ));
                }
                debug!(page = %src_id, "new entry left out of split to fit node groups");
            } else {
                return Err(SpGistError::internal(
                    "failed to divide leaf tuple groups across pages",
                ));
            }
            new_leaf = Some((guard, dest_is_new));
        }

        let mut flags = self.record_flags(nulls);
        flags.set(RecordFlags::INIT_SRC, is_new);
        flags.set(RecordFlags::ROOT_SPLIT, root);
        let mut redirect_pos: Option<ItemOffset> = None;
        let mut deleted = Vec::new();
        if !root {
            let mut page = src.page_mut();
            if self.is_build()
                && to_delete.len() + page.n_placeholder() as usize == page.max_offset() as usize
            {
                page.initialize(src_id, page_flags(true, nulls));
                flags |= RecordFlags::INIT_SRC;
            } else if is_new {
                // Nothing on a fresh page to delete
            } else if !self.is_build() {
                // Redirect target is patched once the inner tuple is placed
                redirect_pos = to_delete.first().copied();
                multi_delete(
                    &mut page,
                    &to_delete,
                    TupleState::Redirect,
                    TupleState::Placeholder,
                    ItemPointer::new(META_BLOCK, FIRST_OFFSET),
                    self.ctx.xid,
                )?;
                deleted = to_delete;
            } else {
                multi_delete(
                    &mut page,
                    &to_delete,
                    TupleState::Placeholder,
                    TupleState::Placeholder,
                    ItemPointer::INVALID,
                    self.ctx.xid,
                )?;
                deleted = to_delete;
            }
        }

        let mut hints = [INVALID_OFFSET; 2];
        let mut placed = Vec::with_capacity(n_to_insert);
        for (i, leaf_tuple) in leaves.iter().enumerate().take(n_to_insert) {
            let node = output.map[i];
            let on_new = node_on_new[node];
            let target: &mut PageGuard = match (&mut new_leaf, on_new) {
                (Some((guard, _)), true) => guard,
                _ => &mut src,
            };
            let leaf_block = target.page_id();

            let mut tuple = leaf_tuple.clone();
            let downlink = inner.nodes[node].downlink;
            tuple.next = if downlink.is_valid() {
                if downlink.page_id() != leaf_block {
                    return Err(SpGistError::internal(format!(
                        "node {node} chain split between pages {} and {leaf_block}",
                        downlink.page_id()
                    )));
                }
                downlink.offset()
            } else {
                INVALID_OFFSET
            };
            let offset = {
                let mut page = target.page_mut();
                add_new_item(&mut page, &tuple.encode(), Some(&mut hints[on_new as usize]))?
            };
            let location = ItemPointer::new(leaf_block, offset);
            inner.nodes[node].downlink = location;
            placed.push(location);
        }

        let inner_bytes = inner.encode();
        let mut parent_link = None;
        let inner_location = match &mut inner_target {
            InnerTarget::Parent => {
                let parent_id = descent.parent.page_id;
                let offset = {
                    let guard = descent.parent_guard()?;
                    let mut page = guard.page_mut();
                    add_new_item(&mut page, &inner_bytes, None)?
                };
                let location = ItemPointer::new(parent_id, offset);
                descent.save_node_link(location)?;
                parent_link = descent.parent_link();
                location
            }
            InnerTarget::NewPage(guard, is_new_inner) => {
                let offset = {
                    let mut page = guard.page_mut();
                    add_new_item(&mut page, &inner_bytes, None)?
                };
                flags.set(RecordFlags::INIT_INNER, *is_new_inner);
                ItemPointer::new(guard.page_id(), offset)
            }
            InnerTarget::Root => {
                let mut page = src.page_mut();
                page.initialize(src_id, page_flags(false, nulls));
                let offset = page.add_item(&inner_bytes);
                if offset != Some(FIRST_OFFSET) {
                    return Err(SpGistError::internal(format!(
                        "failed to add inner tuple of size {} to root page",
                        inner_bytes.len()
                    )));
                }
                flags |= RecordFlags::INIT_INNER;
                ItemPointer::new(src_id, FIRST_OFFSET)
            }
        };

        match inner_target {
            InnerTarget::Parent => {
                descent.current.page_id = descent.parent.page_id;
                descent.current.offset = inner_location.offset();
                descent.current.guard = descent.parent.guard.take();
            }
            InnerTarget::NewPage(guard, _) => {
                descent.set_current_page(guard, inner_location.offset());
                descent.save_node_link(inner_location)?;
                parent_link = descent.parent_link();
            }
            InnerTarget::Root => {
                descent.current.offset = FIRST_OFFSET;
            }
        }

        if let Some(pos) = redirect_pos {
            let mut page = src.page_mut();
            set_redirect_target(item_at_mut(&mut page, pos)?, inner_location)
                .map_err(|e| e.on_page(src_id))?;
        }

        let dest_page = new_leaf
            .as_ref()
            .map_or(PageId::INVALID, |(guard, _)| guard.page_id());
        flags.set(
            RecordFlags::INIT_DEST,
            new_leaf.as_ref().is_some_and(|(_, is_new)| *is_new),
        );
        let n_placed = placed.len();
        let lsn = self.log(ChangeRecord::PickSplit(PickSplitPayload {
            src_page: src_id,
            dest_page,
            inner: inner_location,
            flags,
            deleted,
            leaves: placed,
            parent: parent_link,
            inner_tuple: inner_bytes,
        }))?;

        stamp(lsn, &mut src);
        if let Some((guard, _)) = new_leaf.as_mut() {
            stamp(lsn, guard);
        }
        if !root {
            stamp(lsn, descent.current_guard()?);
        }
        if descent.has_parent() {
            stamp(lsn, descent.parent_guard()?);
        }

        if let Some((guard, _)) = new_leaf {
            self.space.release(guard);
        }
        if root {
            descent.current.guard = Some(src);
        } else {
            self.space.release(src);
        }

        debug!(
            page = %src_id,
            tuples = n_tuples,
            placed = n_placed,
            nodes = inner.nodes.len(),
            all_the_same = verdict.all_the_same,
            dest = %dest_page,
            inner = %inner_location,
            "pick-split"
        );
        Ok(inserted_new)
    }
}
