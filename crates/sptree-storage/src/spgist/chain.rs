//! Leaf chains.
//!
//! All leaf tuples below one node of an inner tuple live on a single page,
//! linked through their `next` offsets. The parent's downlink addresses the
//! chain head; order within the chain carries no meaning. A chain may also
//! be a lone dead tuple left behind by vacuum, which the next insertion
//! overwrites.

use sptree_common::types::{ItemOffset, ItemPointer, INVALID_OFFSET};
use sptree_wal::{AddLeafPayload, ChangeRecord, MoveLeafsPayload, RecordFlags};
use tracing::{debug, trace};

use super::cursor::Descent;
use super::error::{SpGistError, SpGistResult};
use super::insert::{stamp, Inserter};
use super::page::{add_new_item, is_root, item_at, item_at_mut, multi_delete, read_leaf, state_at};
use super::space::PageRequest;
use super::tuple::{leaf_next, set_leaf_next, LeafTuple, TupleState, DEAD_TUPLE_SIZE};
use crate::page::SlottedPage;

/// Live tuples of one chain and the offsets they occupy.
#[derive(Debug, Default)]
pub struct ChainScan {
    /// Every chain offset, head first.
    pub offsets: Vec<ItemOffset>,
    /// Live tuples in chain order.
    pub live: Vec<LeafTuple>,
    /// Footprint of the live tuples.
    pub live_bytes: usize,
    /// The chain is a lone dead tuple.
    pub dead_head: bool,
}

/// Walks the chain starting at `head`.
///
/// A dead tuple may only appear as the head of a one-element chain; any
/// other state is corruption. Revisiting an offset is reported as a cycle.
pub fn scan_chain<B: AsRef<[u8]>>(page: &SlottedPage<B>, head: ItemOffset) -> SpGistResult<ChainScan> {
    let mut scan = ChainScan::default();
    let max = page.max_offset();
    let mut offset = head;

    while offset != INVALID_OFFSET {
        if offset > max || scan.offsets.len() >= max as usize {
            return Err(SpGistError::corrupted(
                page.page_id(),
                format!("leaf chain from {head} is cyclic or leaves the page at {offset}"),
            ));
        }
        let item = item_at(page, offset)?;
        let next = leaf_next(item).map_err(|e| e.on_page(page.page_id()))?;
        match state_at(page, offset)? {
            TupleState::Live => {
                let leaf = read_leaf(page, offset)?;
                scan.live_bytes += leaf.footprint();
                scan.live.push(leaf);
            }
            TupleState::Dead if offset == head && next == INVALID_OFFSET => {
                scan.dead_head = true;
            }
            state => {
                return Err(SpGistError::corrupted(
                    page.page_id(),
                    format!("unexpected tuple state {state:?} in leaf chain at {offset}"),
                ))
            }
        }
        scan.offsets.push(offset);
        offset = next;
    }
    Ok(scan)
}

/// Counts the live tuples of a chain and their footprint.
///
/// A root page reports its whole size for both, which rules out moving
/// its contents elsewhere.
pub fn count_and_size<B: AsRef<[u8]>>(
    page: &SlottedPage<B>,
    head: ItemOffset,
) -> SpGistResult<(usize, usize)> {
    if is_root(page.page_id()) {
        let size = page.page_size();
        return Ok((size, size));
    }
    let scan = scan_chain(page, head)?;
    Ok((scan.live.len(), scan.live_bytes))
}

/// Adds `leaf` to the page, linking it into the chain at `head`.
///
/// Without a head the tuple is stored on its own. A live head keeps its
/// position and the new tuple becomes the second chain element; a dead
/// head is overwritten in place. Returns the offset of the new tuple.
pub fn append_to_chain<B: AsRef<[u8]> + AsMut<[u8]>>(
    page: &mut SlottedPage<B>,
    head: Option<ItemOffset>,
    leaf: &LeafTuple,
) -> SpGistResult<ItemOffset> {
    let mut tuple = leaf.clone();
    let Some(head) = head else {
        tuple.next = INVALID_OFFSET;
        return add_new_item(page, &tuple.encode(), None);
    };

    match state_at(page, head)? {
        TupleState::Live => {
            let page_id = page.page_id();
            tuple.next = leaf_next(item_at(page, head)?).map_err(|e| e.on_page(page_id))?;
            let offset = add_new_item(page, &tuple.encode(), None)?;
            set_leaf_next(item_at_mut(page, head)?, offset).map_err(|e| e.on_page(page_id))?;
            Ok(offset)
        }
        TupleState::Dead => {
            tuple.next = INVALID_OFFSET;
            if !page.replace_item(head, &tuple.encode()) {
                return Err(SpGistError::internal(format!(
                    "failed to overwrite dead tuple {head} on page {}",
                    page.page_id()
                )));
            }
            Ok(head)
        }
        state => Err(SpGistError::corrupted(
            page.page_id(),
            format!("unexpected tuple state {state:?} at chain head {head}"),
        )),
    }
}

/// Space freed on a page by tombstoning a chain in place.
pub(crate) fn tombstone_savings(scan: &ChainScan) -> usize {
    scan.live.iter().map(|t| t.size() - DEAD_TUPLE_SIZE).sum()
}

impl Inserter<'_> {
    /// Stores `leaf` at the current leaf location, which has room for it.
    pub(crate) fn add_leaf(
        &self,
        descent: &mut Descent,
        leaf: &LeafTuple,
        nulls: bool,
        is_new: bool,
    ) -> SpGistResult<()> {
        let page_id = descent.current.page_id;
        let head = descent.current.offset;
        let standalone = head == INVALID_OFFSET || is_root(page_id);

        let offset = {
            let guard = descent.current_guard()?;
            let mut page = guard.page_mut();
            append_to_chain(&mut page, (!standalone).then_some(head), leaf)?
        };

        let parent = if standalone && descent.has_parent() {
            descent.save_node_link(ItemPointer::new(page_id, offset))?;
            descent.parent_link()
        } else {
            None
        };

        let mut flags = self.record_flags(nulls);
        flags.set(RecordFlags::NEW_PAGE, is_new);
        let lsn = self.log(ChangeRecord::AddLeaf(AddLeafPayload {
            page_id,
            offset,
            head_offset: if standalone { INVALID_OFFSET } else { head },
            flags,
            parent,
            leaf: leaf.encode(),
        }))?;
        stamp(lsn, descent.current_guard()?);
        if parent.is_some() {
            stamp(lsn, descent.parent_guard()?);
        }

        descent.current.offset = offset;
        trace!(page = %page_id, offset, "added leaf tuple");
        Ok(())
    }

    /// Moves the current chain plus `leaf` to another leaf page.
    pub(crate) fn relocate_chain(
        &self,
        descent: &mut Descent,
        leaf: &LeafTuple,
        nulls: bool,
    ) -> SpGistResult<()> {
        let src_page = descent.current.page_id;
        if is_root(src_page) || !descent.has_parent() {
            return Err(SpGistError::internal("cannot relocate a chain without a parent"));
        }
        let scan = {
            let head = descent.current.offset;
            let guard = descent.current_guard()?;
            let page = guard.page();
            scan_chain(&page, head)?
        };

        let need = leaf.footprint() + scan.live_bytes;
        let (mut dest, is_new) = self
            .space
            .get_page(self.buffers, PageRequest::leaf(nulls), need)?;
        let dest_page = dest.page_id();
        if dest_page == src_page {
            return Err(SpGistError::internal(format!(
                "space map returned the chain's own page {src_page}"
            )));
        }

        let mut inserted = Vec::with_capacity(scan.live.len() + 1);
        let mut tuples = Vec::with_capacity(scan.live.len() + 1);
        let mut last = INVALID_OFFSET;
        {
            let mut page = dest.page_mut();
            let mut hint = INVALID_OFFSET;
            let moved = if scan.dead_head { Vec::new() } else { scan.live };
            for mut tuple in moved.into_iter().chain(std::iter::once(leaf.clone())) {
                // Links come out reversed; chain order is irrelevant
                tuple.next = last;
                let encoded = tuple.encode();
                last = add_new_item(&mut page, &encoded, Some(&mut hint))?;
                inserted.push(last);
                tuples.push(encoded);
            }
        }
        let target = ItemPointer::new(dest_page, last);

        {
            let first = if self.is_build() {
                TupleState::Placeholder
            } else {
                TupleState::Redirect
            };
            let guard = descent.current_guard()?;
            let mut page = guard.page_mut();
            multi_delete(
                &mut page,
                &scan.offsets,
                first,
                TupleState::Placeholder,
                target,
                self.ctx.xid,
            )?;
        }
        descent.save_node_link(target)?;
        let parent = descent
            .parent_link()
            .ok_or_else(|| SpGistError::internal("parent vanished during chain relocation"))?;

        let mut flags = self.record_flags(nulls);
        flags.set(RecordFlags::NEW_PAGE, is_new);
        flags.set(RecordFlags::REPLACE_DEAD, scan.dead_head);
        let lsn = self.log(ChangeRecord::MoveLeafs(MoveLeafsPayload {
            src_page,
            dest_page,
            flags,
            deleted: scan.offsets.clone(),
            inserted: inserted.clone(),
            parent,
            tuples,
        }))?;
        stamp(lsn, descent.current_guard()?);
        stamp(lsn, &mut dest);
        stamp(lsn, descent.parent_guard()?);
        self.space.release(dest);

        debug!(
            from = %src_page,
            to = %dest_page,
            moved = inserted.len() - 1,
            "relocated leaf chain"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spgist::page::page_flags;
    use crate::page::SLOT_SIZE;
    use crate::spgist::tuple::DeadTuple;
    use sptree_common::types::{PageId, TxnId};

    fn leaf_page(block: u32) -> Vec<u8> {
        let mut buffer = vec![0u8; 4096];
        SlottedPage::new(&mut buffer[..]).initialize(PageId::new(block), page_flags(true, false));
        buffer
    }

    fn leaf(n: u8, len: usize) -> LeafTuple {
        LeafTuple::new(ItemPointer::new(PageId::new(50), n as u16), Some(vec![n; len]))
    }

    fn chain_heap_ptrs(page: &SlottedPage<&mut [u8]>, head: ItemOffset) -> Vec<u16> {
        let mut ptrs: Vec<u16> = scan_chain(page, head)
            .unwrap()
            .live
            .iter()
            .map(|t| t.heap_ptr.offset())
            .collect();
        ptrs.sort_unstable();
        ptrs
    }

    #[test]
    fn test_append_threads_second_element() {
        let mut buffer = leaf_page(7);
        let mut page = SlottedPage::new(&mut buffer[..]);
        let head = append_to_chain(&mut page, None, &leaf(1, 8)).unwrap();
        let second = append_to_chain(&mut page, Some(head), &leaf(2, 8)).unwrap();
        let third = append_to_chain(&mut page, Some(head), &leaf(3, 8)).unwrap();

        assert_eq!(read_leaf(&page, head).unwrap().next, third);
        assert_eq!(read_leaf(&page, third).unwrap().next, second);
        assert_eq!(read_leaf(&page, second).unwrap().next, INVALID_OFFSET);
        assert_eq!(chain_heap_ptrs(&page, head), vec![1, 2, 3]);
    }

    #[test]
    fn test_append_overwrites_dead_head() {
        let mut buffer = leaf_page(7);
        let mut page = SlottedPage::new(&mut buffer[..]);
        page.add_item(&leaf(9, 4).encode()).unwrap();
        let dead = DeadTuple::new(TupleState::Dead, ItemPointer::INVALID, TxnId::INVALID);
        page.add_item(&dead.encode()).unwrap();

        let offset = append_to_chain(&mut page, Some(2), &leaf(4, 30)).unwrap();
        assert_eq!(offset, 2);
        let stored = read_leaf(&page, 2).unwrap();
        assert_eq!(stored.datum, Some(vec![4; 30]));
        assert_eq!(stored.next, INVALID_OFFSET);
    }

    #[test]
    fn test_append_rejects_redirect_head() {
        let mut buffer = leaf_page(7);
        let mut page = SlottedPage::new(&mut buffer[..]);
        let redirect = DeadTuple::new(
            TupleState::Redirect,
            ItemPointer::new(PageId::new(9), 1),
            TxnId::MIN,
        );
        page.add_item(&redirect.encode()).unwrap();
        let err = append_to_chain(&mut page, Some(1), &leaf(1, 4)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_count_and_size() {
        let mut buffer = leaf_page(7);
        let mut page = SlottedPage::new(&mut buffer[..]);
        let other = append_to_chain(&mut page, None, &leaf(0, 100)).unwrap();
        let head = append_to_chain(&mut page, None, &leaf(1, 10)).unwrap();
        append_to_chain(&mut page, Some(head), &leaf(2, 20)).unwrap();

        let expected = (12 + 10 + SLOT_SIZE) + (12 + 20 + SLOT_SIZE);
        assert_eq!(count_and_size(&page, head).unwrap(), (2, expected));
        assert_eq!(count_and_size(&page, other).unwrap().0, 1);
        assert_eq!(count_and_size(&page, INVALID_OFFSET).unwrap(), (0, 0));
    }

    #[test]
    fn test_count_and_size_root_reports_full_page() {
        let mut buffer = leaf_page(1);
        let mut page = SlottedPage::new(&mut buffer[..]);
        append_to_chain(&mut page, None, &leaf(1, 10)).unwrap();
        assert_eq!(count_and_size(&page, 1).unwrap(), (4096, 4096));
    }

    #[test]
    fn test_scan_detects_cycle() {
        let mut buffer = leaf_page(7);
        let mut page = SlottedPage::new(&mut buffer[..]);
        let a = append_to_chain(&mut page, None, &leaf(1, 4)).unwrap();
        let b = append_to_chain(&mut page, Some(a), &leaf(2, 4)).unwrap();
        set_leaf_next(page.item_mut(b).unwrap(), a).unwrap();
        assert!(scan_chain(&page, a).unwrap_err().is_fatal());
    }

    #[test]
    fn test_tombstone_savings() {
        let mut buffer = leaf_page(7);
        let mut page = SlottedPage::new(&mut buffer[..]);
        let head = append_to_chain(&mut page, None, &leaf(1, 40)).unwrap();
        append_to_chain(&mut page, Some(head), &leaf(2, 2)).unwrap();
        let scan = scan_chain(&page, head).unwrap();
        assert_eq!(tombstone_savings(&scan), 52 - DEAD_TUPLE_SIZE);
    }
}
