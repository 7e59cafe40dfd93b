//! Inner tuple mutations requested by `choose`.

use sptree_common::types::ItemPointer;
use sptree_wal::{AddNodePayload, ChangeRecord, RecordFlags, SplitTuplePayload};
use tracing::debug;

use super::cursor::Descent;
use super::error::{SpGistError, SpGistResult};
use super::insert::{stamp, Inserter};
use super::page::{add_new_item, free_space, is_root};
use super::space::PageRequest;
use super::tuple::{set_node_downlink, DeadTuple, InnerTuple, NodeTuple, TupleState};
use crate::page::SLOT_SIZE;

/// Returns `inner` with a node labeled `label` inserted at `position`
/// (appended when `None`).
pub fn add_node(
    inner: &InnerTuple,
    label: Vec<u8>,
    position: Option<usize>,
) -> SpGistResult<InnerTuple> {
    if inner.all_the_same {
        return Err(SpGistError::contract(
            "cannot add a node to an allTheSame inner tuple",
        ));
    }
    let n = inner.nodes.len();
    let position = position.unwrap_or(n);
    if position > n {
        return Err(SpGistError::contract(format!(
            "invalid position {position} for adding a node to an inner tuple with {n} nodes"
        )));
    }

    let mut nodes = inner.nodes.clone();
    nodes.insert(position, NodeTuple::new(Some(label)));
    Ok(InnerTuple::new(inner.prefix.clone(), nodes, false))
}

/// Splits `inner` into a one-node prefix tuple and a postfix tuple that
/// keeps every original node.
///
/// The prefix tuple's node is not linked yet; the caller points it at the
/// postfix tuple once both are placed.
pub fn split_tuple(
    inner: &InnerTuple,
    prefix_prefix: Option<Vec<u8>>,
    prefix_node_label: Option<Vec<u8>>,
    postfix_prefix: Option<Vec<u8>>,
) -> (InnerTuple, InnerTuple) {
    let prefix = InnerTuple::new(prefix_prefix, vec![NodeTuple::new(prefix_node_label)], false);
    let postfix = InnerTuple::new(postfix_prefix, inner.nodes.clone(), inner.all_the_same);
    (prefix, postfix)
}

impl Inserter<'_> {
    /// Adds a node to the current inner tuple, moving the tuple to another
    /// page if it no longer fits. `current` follows the tuple.
    pub(crate) fn add_node_action(
        &self,
        descent: &mut Descent,
        inner: &InnerTuple,
        label: Vec<u8>,
        position: Option<usize>,
        nulls: bool,
    ) -> SpGistResult<()> {
        let enlarged = add_node(inner, label, position)?;
        enlarged.check_size(self.capacity())?;
        let encoded = enlarged.encode();

        let old_page = descent.current.page_id;
        let old_offset = descent.current.offset;
        let flags = self.record_flags(nulls);

        let grows = enlarged.size().saturating_sub(inner.size());
        let in_place = {
            let guard = descent.current_guard()?;
            guard.page().exact_free_space() >= grows
        };

        if in_place {
            let guard = descent.current_guard()?;
            if !guard.page_mut().replace_item(old_offset, &encoded) {
                return Err(SpGistError::internal(format!(
                    "failed to enlarge inner tuple {old_offset} on page {old_page}"
                )));
            }
            let here = ItemPointer::new(old_page, old_offset);
            let lsn = self.log(ChangeRecord::AddNode(AddNodePayload {
                page_id: old_page,
                offset: old_offset,
                new_location: here,
                flags,
                parent: None,
                tuple: encoded,
            }))?;
            stamp(lsn, descent.current_guard()?);
            return Ok(());
        }

        if is_root(old_page) {
            return Err(SpGistError::internal("cannot enlarge root tuple any more"));
        }
        if !descent.has_parent() {
            return Err(SpGistError::internal(format!(
                "inner tuple on page {old_page} has no parent"
            )));
        }
        let parent_on_old = descent.parent.page_id == old_page;
        let mut old_guard = descent
            .current
            .guard
            .take()
            .ok_or_else(|| SpGistError::internal(format!("page {old_page} is not latched")))?;

        let request = PageRequest::inner(old_page.as_u32(), nulls);
        let (mut new_guard, is_new) =
            self.space
                .get_page(self.buffers, request, enlarged.size() + SLOT_SIZE)?;
        if new_guard.page_id() == old_page {
            return Err(SpGistError::internal(
                "new buffer for an enlarged inner tuple is the old one",
            ));
        }
        let new_offset = {
            let mut page = new_guard.page_mut();
            add_new_item(&mut page, &encoded, None)?
        };
        let new_location = ItemPointer::new(new_guard.page_id(), new_offset);
        descent.set_current_page(new_guard, new_offset);

        {
            let state = if self.is_build() {
                TupleState::Placeholder
            } else {
                TupleState::Redirect
            };
            let dead = DeadTuple::new(state, new_location, self.ctx.xid).encode();
            let mut page = old_guard.page_mut();
            if !page.replace_item(old_offset, &dead) {
                return Err(SpGistError::internal(format!(
                    "failed to tombstone inner tuple {old_offset} on page {old_page}"
                )));
            }
            match state {
                TupleState::Placeholder => {
                    let n = page.n_placeholder();
                    page.set_n_placeholder(n + 1);
                }
                _ => {
                    let n = page.n_redirection();
                    page.set_n_redirection(n + 1);
                }
            }
        }

        let mut old_guard = Some(old_guard);
        if parent_on_old {
            descent.parent.guard = old_guard.take();
        }
        descent.save_node_link(new_location)?;

        let mut flags = flags;
        flags.set(RecordFlags::NEW_PAGE, is_new);
        let lsn = self.log(ChangeRecord::AddNode(AddNodePayload {
            page_id: old_page,
            offset: old_offset,
            new_location,
            flags,
            parent: descent.parent_link(),
            tuple: encoded,
        }))?;
        stamp(lsn, descent.current_guard()?);
        stamp(lsn, descent.parent_guard()?);
        if let Some(mut guard) = old_guard {
            stamp(lsn, &mut guard);
            self.space.release(guard);
        }

        debug!(from = %old_page, to = %new_location, "moved enlarged inner tuple");
        Ok(())
    }

    /// Replaces the current inner tuple with a prefix tuple whose only
    /// node leads to a postfix tuple holding the original nodes.
    pub(crate) fn split_tuple_action(
        &self,
        descent: &mut Descent,
        inner: &InnerTuple,
        prefix_prefix: Option<Vec<u8>>,
        prefix_node_label: Option<Vec<u8>>,
        postfix_prefix: Option<Vec<u8>>,
        nulls: bool,
    ) -> SpGistResult<()> {
        let (mut prefix, postfix) = split_tuple(inner, prefix_prefix, prefix_node_label, postfix_prefix);
        if prefix.size() > inner.size() {
            return Err(SpGistError::contract(
                "inner-tuple split must not produce longer prefix",
            ));
        }
        postfix.check_size(self.capacity())?;

        let page_id = descent.current.page_id;
        let offset = descent.current.offset;
        let needs_page = {
            let guard = descent.current_guard()?;
            let page = guard.page();
            is_root(page_id)
                || free_space(&page, 1) + inner.size()
                    < prefix.size() + postfix.size() + SLOT_SIZE
        };

        let mut new_page = if needs_page {
            let request = PageRequest::inner(page_id.as_u32() + 1, nulls);
            Some(
                self.space
                    .get_page(self.buffers, request, postfix.size() + SLOT_SIZE)?,
            )
        } else {
            None
        };

        let prefix_bytes = prefix.encode();
        let postfix_bytes = postfix.encode();
        {
            let guard = descent.current_guard()?;
            if !guard.page_mut().replace_item(offset, &prefix_bytes) {
                return Err(SpGistError::internal(format!(
                    "failed to add item of size {} to index page {page_id}",
                    prefix_bytes.len()
                )));
            }
        }

        let postfix_location = match new_page.as_mut() {
            Some((guard, _)) => {
                let mut page = guard.page_mut();
                ItemPointer::new(page.page_id(), add_new_item(&mut page, &postfix_bytes, None)?)
            }
            None => {
                let guard = descent.current_guard()?;
                let mut page = guard.page_mut();
                ItemPointer::new(page_id, add_new_item(&mut page, &postfix_bytes, None)?)
            }
        };

        {
            let guard = descent.current_guard()?;
            let mut page = guard.page_mut();
            let item = page.item_mut(offset).ok_or_else(|| {
                SpGistError::corrupted(page_id, format!("prefix tuple {offset} vanished"))
            })?;
            set_node_downlink(item, 0, postfix_location).map_err(|e| e.on_page(page_id))?;
        }
        prefix.nodes[0].downlink = postfix_location;

        let mut flags = self.record_flags(nulls);
        flags.set(
            RecordFlags::NEW_PAGE,
            new_page.as_ref().is_some_and(|(_, is_new)| *is_new),
        );
        let lsn = self.log(ChangeRecord::SplitTuple(SplitTuplePayload {
            prefix: ItemPointer::new(page_id, offset),
            postfix: postfix_location,
            flags,
            prefix_tuple: prefix.encode(),
            postfix_tuple: postfix_bytes,
        }))?;
        stamp(lsn, descent.current_guard()?);
        if let Some((mut guard, _)) = new_page {
            stamp(lsn, &mut guard);
            self.space.release(guard);
        }

        debug!(prefix = %ItemPointer::new(page_id, offset), postfix = %postfix_location, "split inner tuple");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sptree_common::types::PageId;

    fn labeled(labels: &[&[u8]]) -> InnerTuple {
        let nodes = labels
            .iter()
            .enumerate()
            .map(|(i, l)| {
                let mut node = NodeTuple::new(Some(l.to_vec()));
                node.downlink = ItemPointer::new(PageId::new(10 + i as u32), 1);
                node
            })
            .collect();
        InnerTuple::new(Some(b"pre".to_vec()), nodes, false)
    }

    #[test]
    fn test_add_node_at_position() {
        let inner = labeled(&[b"a", b"c"]);
        let out = add_node(&inner, b"b".to_vec(), Some(1)).unwrap();
        let labels: Vec<_> = out.nodes.iter().map(|n| n.label.clone().unwrap()).collect();
        assert_eq!(labels, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(out.prefix, inner.prefix);
        assert_eq!(out.nodes[0].downlink, inner.nodes[0].downlink);
        assert_eq!(out.nodes[2].downlink, inner.nodes[1].downlink);
        assert_eq!(out.nodes[1].downlink, ItemPointer::INVALID);
    }

    #[test]
    fn test_add_node_appends() {
        let inner = labeled(&[b"a"]);
        let out = add_node(&inner, b"z".to_vec(), None).unwrap();
        assert_eq!(out.nodes.len(), 2);
        assert_eq!(out.nodes[1].label.as_deref(), Some(&b"z"[..]));
    }

    #[test]
    fn test_add_node_rejects_bad_position_and_all_the_same() {
        let inner = labeled(&[b"a"]);
        assert!(add_node(&inner, b"z".to_vec(), Some(2)).unwrap_err().is_fatal());

        let mut same = labeled(&[b"a", b"a"]);
        same.all_the_same = true;
        let err = add_node(&same, b"b".to_vec(), None).unwrap_err();
        assert!(matches!(err, SpGistError::ContractViolation(_)));
    }

    #[test]
    fn test_split_tuple_shapes() {
        let mut inner = labeled(&[b"x", b"y", b"z"]);
        inner.all_the_same = true;
        let (prefix, postfix) =
            split_tuple(&inner, Some(b"p".to_vec()), Some(b"r".to_vec()), Some(b"e".to_vec()));

        assert_eq!(prefix.nodes.len(), 1);
        assert_eq!(prefix.nodes[0].label.as_deref(), Some(&b"r"[..]));
        assert!(!prefix.all_the_same);
        assert!(prefix.size() <= inner.size());

        assert_eq!(postfix.nodes, inner.nodes);
        assert!(postfix.all_the_same);
        assert_eq!(postfix.prefix.as_deref(), Some(&b"e"[..]));
    }
}
