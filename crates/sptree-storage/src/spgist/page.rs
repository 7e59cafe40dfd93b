//! Index page helpers: fixed blocks, space accounting and tombstoning.

use sptree_common::types::{ItemOffset, ItemPointer, PageId, TxnId, FIRST_OFFSET, INVALID_OFFSET};

use super::error::{SpGistError, SpGistResult};
use super::tuple::{tuple_state, DeadTuple, InnerTuple, LeafTuple, TupleState, DEAD_TUPLE_SIZE};
use crate::page::{PageFlags, SlottedPage, SLOT_SIZE};

/// Block holding the meta page.
pub const META_BLOCK: PageId = PageId::new(0);

/// Root of the tree for non-null keys.
pub const ROOT_BLOCK: PageId = PageId::new(1);

/// Root of the tree for null keys.
pub const NULLS_ROOT_BLOCK: PageId = PageId::new(2);

/// Number of blocks every index starts with.
pub const FIXED_BLOCKS: u32 = 3;

/// Returns true for either root.
#[inline]
pub fn is_root(page_id: PageId) -> bool {
    page_id == ROOT_BLOCK || page_id == NULLS_ROOT_BLOCK
}

/// Returns true for the meta page and both roots.
#[inline]
pub fn is_fixed(page_id: PageId) -> bool {
    page_id.as_u32() < FIXED_BLOCKS
}

/// Flags for a data page of the given kind.
#[inline]
pub fn page_flags(leaf: bool, nulls: bool) -> PageFlags {
    let mut flags = PageFlags::empty();
    flags.set(PageFlags::LEAF, leaf);
    flags.set(PageFlags::NULLS, nulls);
    flags
}

/// Free space on a page, counting up to `n` reusable placeholders.
pub fn free_space<B: AsRef<[u8]>>(page: &SlottedPage<B>, n: usize) -> usize {
    let placeholders = (page.n_placeholder() as usize).min(n);
    page.exact_free_space() + placeholders * (DEAD_TUPLE_SIZE + SLOT_SIZE)
}

/// Returns the bytes of the item at `offset`.
pub fn item_at<B: AsRef<[u8]>>(page: &SlottedPage<B>, offset: ItemOffset) -> SpGistResult<&[u8]> {
    page.item(offset).ok_or_else(|| {
        SpGistError::corrupted(
            page.page_id(),
            format!("item {offset} out of range (max {})", page.max_offset()),
        )
    })
}

/// Returns the bytes of the item at `offset` mutably.
pub fn item_at_mut<B: AsRef<[u8]> + AsMut<[u8]>>(
    page: &mut SlottedPage<B>,
    offset: ItemOffset,
) -> SpGistResult<&mut [u8]> {
    let page_id = page.page_id();
    let max = page.max_offset();
    page.item_mut(offset).ok_or_else(|| {
        SpGistError::corrupted(page_id, format!("item {offset} out of range (max {max})"))
    })
}

/// Reads the state of the item at `offset`.
pub fn state_at<B: AsRef<[u8]>>(
    page: &SlottedPage<B>,
    offset: ItemOffset,
) -> SpGistResult<TupleState> {
    tuple_state(item_at(page, offset)?).map_err(|e| e.on_page(page.page_id()))
}

/// Decodes the live leaf tuple at `offset`.
pub fn read_leaf<B: AsRef<[u8]>>(page: &SlottedPage<B>, offset: ItemOffset) -> SpGistResult<LeafTuple> {
    LeafTuple::decode(item_at(page, offset)?).map_err(|e| e.on_page(page.page_id()))
}

/// Decodes the live inner tuple at `offset`.
pub fn read_inner<B: AsRef<[u8]>>(
    page: &SlottedPage<B>,
    offset: ItemOffset,
) -> SpGistResult<InnerTuple> {
    InnerTuple::decode(item_at(page, offset)?).map_err(|e| e.on_page(page.page_id()))
}

/// Adds an item, reusing a placeholder slot when one is big enough.
///
/// `hint` is where to start looking for placeholders; it is advanced past
/// the slot used so repeated calls scan each slot once.
pub fn add_new_item<B: AsRef<[u8]> + AsMut<[u8]>>(
    page: &mut SlottedPage<B>,
    item: &[u8],
    mut hint: Option<&mut ItemOffset>,
) -> SpGistResult<ItemOffset> {
    if page.n_placeholder() > 0 && page.exact_free_space() + DEAD_TUPLE_SIZE >= item.len() {
        let max = page.max_offset();
        let mut found = INVALID_OFFSET;

        loop {
            let start = match hint.as_deref() {
                Some(&h) if h != INVALID_OFFSET => h,
                _ => FIRST_OFFSET,
            };
            for offset in start..=max {
                if state_at(page, offset)? == TupleState::Placeholder {
                    found = offset;
                    break;
                }
            }
            if found != INVALID_OFFSET {
                break;
            }
            match hint.as_deref_mut() {
                // Hint was no good, search again from the start
                Some(h) if *h != INVALID_OFFSET => *h = INVALID_OFFSET,
                _ => {
                    page.set_n_placeholder(0);
                    break;
                }
            }
        }

        if found != INVALID_OFFSET {
            if !page.replace_item(found, item) {
                return Err(SpGistError::internal(format!(
                    "failed to add item of size {} to index page {}",
                    item.len(),
                    page.page_id()
                )));
            }
            let n = page.n_placeholder();
            page.set_n_placeholder(n.saturating_sub(1));
            if let Some(h) = hint {
                *h = found + 1;
            }
            return Ok(found);
        }
    }

    page.add_item(item).ok_or_else(|| {
        SpGistError::internal(format!(
            "failed to add item of size {} to index page {}",
            item.len(),
            page.page_id()
        ))
    })
}

/// Overwrites each listed item with a tombstone.
///
/// The first offset in the list gets `first_state`, the rest get
/// `rest_state`. Redirects point at `target`.
pub fn multi_delete<B: AsRef<[u8]> + AsMut<[u8]>>(
    page: &mut SlottedPage<B>,
    offsets: &[ItemOffset],
    first_state: TupleState,
    rest_state: TupleState,
    target: ItemPointer,
    xid: TxnId,
) -> SpGistResult<()> {
    if offsets.is_empty() {
        return Ok(());
    }
    let first = DeadTuple::new(first_state, target, xid).encode();
    let rest = DeadTuple::new(rest_state, target, xid).encode();

    let mut n_redirection = page.n_redirection();
    let mut n_placeholder = page.n_placeholder();
    for (i, &offset) in offsets.iter().enumerate() {
        let (tuple, state) = if i == 0 {
            (&first, first_state)
        } else {
            (&rest, rest_state)
        };
        if !page.replace_item(offset, tuple) {
            return Err(SpGistError::corrupted(
                page.page_id(),
                format!("cannot tombstone item {offset}"),
            ));
        }
        match state {
            TupleState::Redirect => n_redirection += 1,
            TupleState::Placeholder => n_placeholder += 1,
            _ => {}
        }
    }
    page.set_n_redirection(n_redirection);
    page.set_n_placeholder(n_placeholder);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sptree_common::types::INVALID_OFFSET;

    fn leaf_page() -> Vec<u8> {
        let mut buffer = vec![0u8; 4096];
        SlottedPage::new(&mut buffer[..]).initialize(PageId::new(5), page_flags(true, false));
        buffer
    }

    fn leaf(n: u8) -> Vec<u8> {
        LeafTuple::new(
            ItemPointer::new(PageId::new(100), n as u16 + 1),
            Some(vec![n; 30]),
        )
        .encode()
        .to_vec()
    }

    #[test]
    fn test_fixed_blocks() {
        assert!(is_fixed(META_BLOCK));
        assert!(is_root(ROOT_BLOCK));
        assert!(is_root(NULLS_ROOT_BLOCK));
        assert!(!is_root(META_BLOCK));
        assert!(!is_fixed(PageId::new(3)));
    }

    #[test]
    fn test_page_flags() {
        assert_eq!(page_flags(true, false), PageFlags::LEAF);
        assert_eq!(page_flags(false, true), PageFlags::NULLS);
        assert!(page_flags(true, true).is_leaf());
    }

    #[test]
    fn test_multi_delete_counts_tombstones() {
        let mut buffer = leaf_page();
        let mut page = SlottedPage::new(&mut buffer[..]);
        for n in 0..4 {
            page.add_item(&leaf(n)).unwrap();
        }

        let target = ItemPointer::new(PageId::new(9), 1);
        multi_delete(
            &mut page,
            &[3, 1, 2],
            TupleState::Redirect,
            TupleState::Placeholder,
            target,
            TxnId::MIN,
        )
        .unwrap();

        assert_eq!(page.n_redirection(), 1);
        assert_eq!(page.n_placeholder(), 2);
        assert_eq!(state_at(&page, 3).unwrap(), TupleState::Redirect);
        assert_eq!(state_at(&page, 1).unwrap(), TupleState::Placeholder);
        assert_eq!(state_at(&page, 4).unwrap(), TupleState::Live);
        let redirect = DeadTuple::decode(item_at(&page, 3).unwrap()).unwrap();
        assert_eq!(redirect.target, target);
    }

    #[test]
    fn test_free_space_counts_placeholders() {
        let mut buffer = leaf_page();
        let mut page = SlottedPage::new(&mut buffer[..]);
        for n in 0..3 {
            page.add_item(&leaf(n)).unwrap();
        }
        multi_delete(
            &mut page,
            &[1, 2],
            TupleState::Placeholder,
            TupleState::Placeholder,
            ItemPointer::INVALID,
            TxnId::INVALID,
        )
        .unwrap();

        let exact = page.exact_free_space();
        assert_eq!(free_space(&page, 0), exact);
        assert_eq!(free_space(&page, 1), exact + DEAD_TUPLE_SIZE + SLOT_SIZE);
        assert_eq!(free_space(&page, 10), exact + 2 * (DEAD_TUPLE_SIZE + SLOT_SIZE));
    }

    #[test]
    fn test_add_new_item_reuses_placeholders() {
        let mut buffer = leaf_page();
        let mut page = SlottedPage::new(&mut buffer[..]);
        for n in 0..4 {
            page.add_item(&leaf(n)).unwrap();
        }
        multi_delete(
            &mut page,
            &[2, 4],
            TupleState::Placeholder,
            TupleState::Placeholder,
            ItemPointer::INVALID,
            TxnId::INVALID,
        )
        .unwrap();

        let mut hint = INVALID_OFFSET;
        assert_eq!(add_new_item(&mut page, &leaf(7), Some(&mut hint)).unwrap(), 2);
        assert_eq!(hint, 3);
        assert_eq!(add_new_item(&mut page, &leaf(8), Some(&mut hint)).unwrap(), 4);
        assert_eq!(page.n_placeholder(), 0);
        assert_eq!(add_new_item(&mut page, &leaf(9), None).unwrap(), 5);
        assert_eq!(read_leaf(&page, 4).unwrap().datum, Some(vec![8; 30]));
    }

    #[test]
    fn test_add_new_item_stale_hint_rescans() {
        let mut buffer = leaf_page();
        let mut page = SlottedPage::new(&mut buffer[..]);
        for n in 0..3 {
            page.add_item(&leaf(n)).unwrap();
        }
        multi_delete(
            &mut page,
            &[1],
            TupleState::Placeholder,
            TupleState::Placeholder,
            ItemPointer::INVALID,
            TxnId::INVALID,
        )
        .unwrap();

        let mut hint = 3;
        assert_eq!(add_new_item(&mut page, &leaf(5), Some(&mut hint)).unwrap(), 1);
        assert_eq!(hint, 2);
    }

    #[test]
    fn test_add_new_item_resets_stale_counter() {
        let mut buffer = leaf_page();
        let mut page = SlottedPage::new(&mut buffer[..]);
        page.add_item(&leaf(0)).unwrap();
        page.set_n_placeholder(3);

        assert_eq!(add_new_item(&mut page, &leaf(1), None).unwrap(), 2);
        assert_eq!(page.n_placeholder(), 0);
    }

    #[test]
    fn test_read_helpers_report_corruption() {
        let buffer = leaf_page();
        let page = SlottedPage::new(&buffer[..]);
        let err = read_leaf(&page, 1).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, SpGistError::Corrupted { page_id, .. } if page_id == PageId::new(5)));
    }
}
