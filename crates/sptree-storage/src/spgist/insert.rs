//! The insertion state machine.
//!
//! One call to [`Inserter::run`] places one leaf entry. The descent starts
//! at the root of the tree the key belongs to and alternates between
//! leaf-page handling (append, relocate the chain, or split) and inner
//! tuple handling (follow a node, add a node, or split the tuple). Leaving
//! an inner tuple by adding a node or splitting it loops back to the same
//! tuple; leaving a leaf page after a split that could not take the new
//! entry continues at the inner tuple the split created.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use sptree_common::types::{ItemPointer, Lsn, TxnId, FIRST_OFFSET};
use sptree_wal::{ChangeRecord, RecordFlags, WalSink};
use tracing::{trace, warn};

use super::chain::count_and_size;
use super::config::SpGistConfig;
use super::cursor::{Descent, Materialized};
use super::error::{SpGistError, SpGistResult};
use super::page::{free_space, read_inner, NULLS_ROOT_BLOCK, ROOT_BLOCK};
use super::space::{PageRequest, SpaceMap};
use super::strategy::{ChooseInput, ChooseOutput, PartitionStrategy};
use super::tuple::LeafTuple;
use crate::buffer::{BufferManager, PageGuard};
use crate::page::SLOT_SIZE;

/// How tombstones are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsertMode {
    /// Concurrent readers may exist; moved tuples leave redirects.
    #[default]
    Normal,
    /// Exclusive build: placeholders replace redirects and emptied leaf
    /// pages may be reinitialized.
    Build,
}

/// Cooperative cancellation signal shared with the inserting thread.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Per-call insertion parameters.
#[derive(Debug, Clone)]
pub struct InsertContext {
    /// Tombstone mode.
    pub mode: InsertMode,
    /// Transaction stamped on redirects.
    pub xid: TxnId,
    /// Checked once per step of the state machine.
    pub cancel: CancelFlag,
}

impl Default for InsertContext {
    fn default() -> Self {
        Self {
            mode: InsertMode::Normal,
            xid: TxnId::MIN,
            cancel: CancelFlag::new(),
        }
    }
}

impl InsertContext {
    /// Creates a context for transaction `xid`.
    pub fn new(xid: TxnId) -> Self {
        Self {
            xid,
            ..Self::default()
        }
    }

    /// Sets the tombstone mode.
    pub fn with_mode(mut self, mode: InsertMode) -> Self {
        self.mode = mode;
        self
    }

    /// Uses `cancel` as the cancellation signal.
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Result of one insertion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum InsertOutcome {
    /// The entry is in the tree.
    Completed,
    /// A child latch was busy; nothing was changed and the caller should
    /// try again with the same arguments.
    RetryRequested,
}

/// States of the descent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// `current` names a location (or no page yet) that is not latched.
    Descend,
    /// `current` is a latched leaf location.
    LeafPage { is_new: bool },
    /// `current` is a latched inner tuple.
    InnerTuple,
}

/// Stamps `lsn` on a page if the change was logged.
#[inline]
pub(crate) fn stamp(lsn: Option<Lsn>, guard: &mut PageGuard) {
    if let Some(lsn) = lsn {
        guard.page_mut().set_lsn(lsn);
    }
}

/// Everything one insertion needs, borrowed from the index.
pub(crate) struct Inserter<'a> {
    pub(crate) buffers: &'a BufferManager,
    pub(crate) space: &'a SpaceMap,
    pub(crate) config: &'a SpGistConfig,
    pub(crate) strategy: &'a dyn PartitionStrategy,
    pub(crate) wal: &'a dyn WalSink,
    pub(crate) ctx: &'a InsertContext,
}

impl Inserter<'_> {
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.config.page_capacity()
    }

    #[inline]
    pub(crate) fn is_build(&self) -> bool {
        self.ctx.mode == InsertMode::Build
    }

    /// Flags every record of this insertion carries.
    pub(crate) fn record_flags(&self, nulls: bool) -> RecordFlags {
        let mut flags = RecordFlags::empty();
        flags.set(RecordFlags::STORES_NULLS, nulls);
        flags.set(RecordFlags::BUILD, self.is_build());
        flags
    }

    /// Emits one change record; returns the LSN to stamp, if any.
    pub(crate) fn log(&self, record: ChangeRecord) -> SpGistResult<Option<Lsn>> {
        let lsn = self.wal.record_change(&record)?;
        Ok(self.wal.is_logged().then_some(lsn))
    }

    fn check_cancelled(&self) -> SpGistResult<()> {
        if self.ctx.cancel.is_cancelled() {
            return Err(SpGistError::Cancelled);
        }
        Ok(())
    }

    /// Leaf tuple size for a datum, including its line pointer.
    fn leaf_footprint(datum: Option<&[u8]>) -> usize {
        LeafTuple::size_for(datum) + SLOT_SIZE
    }

    /// Inserts `key` (or a null key) pointing at `heap_ptr`.
    pub(crate) fn run(&self, key: Option<&[u8]>, heap_ptr: ItemPointer) -> SpGistResult<InsertOutcome> {
        let nulls = key.is_none();
        let capacity = self.capacity();
        let long_values_ok = self.strategy.config().long_values_ok;

        let mut leaf_size = Self::leaf_footprint(key);
        if leaf_size > capacity && !long_values_ok {
            return Err(SpGistError::RowTooLarge {
                size: leaf_size - SLOT_SIZE,
                max: capacity - SLOT_SIZE,
            });
        }

        let root = if nulls { NULLS_ROOT_BLOCK } else { ROOT_BLOCK };
        let mut descent = Descent::from_root(root, FIRST_OFFSET);
        let result = self.descend(&mut descent, key, heap_ptr, &mut leaf_size);
        descent.release_all(self.space);
        result
    }

    fn descend(
        &self,
        descent: &mut Descent,
        key: Option<&[u8]>,
        heap_ptr: ItemPointer,
        leaf_size: &mut usize,
    ) -> SpGistResult<InsertOutcome> {
        let nulls = key.is_none();
        let capacity = self.capacity();
        let datum = key.unwrap_or(&[]);
        let mut leaf_datum: Vec<u8> = datum.to_vec();
        let mut level: u32 = 0;
        let mut step = Step::Descend;

        loop {
            self.check_cancelled()?;

            match step {
                Step::Descend => {
                    if !descent.current.is_located() {
                        let request = PageRequest::leaf(nulls);
                        let (guard, is_new) =
                            self.space
                                .get_page(self.buffers, request, (*leaf_size).min(capacity))?;
                        trace!(page = %guard.page_id(), is_new, "new leaf location");
                        descent.set_current_page(guard, descent.current.offset);
                        step = Step::LeafPage { is_new };
                    } else {
                        match descent.materialize(self.buffers)? {
                            Materialized::Contended => {
                                warn!(
                                    page = %descent.current.page_id,
                                    "insertion abandoned on latch contention"
                                );
                                return Ok(InsertOutcome::RetryRequested);
                            }
                            Materialized::Ready { is_new } => {
                                let flags = descent.current_guard()?.page().flags();
                                if flags.stores_nulls() != nulls {
                                    return Err(SpGistError::corrupted(
                                        descent.current.page_id,
                                        "page nulls flag does not match key",
                                    ));
                                }
                                step = if flags.is_leaf() {
                                    Step::LeafPage { is_new }
                                } else {
                                    Step::InnerTuple
                                };
                            }
                        }
                    }
                }

                Step::LeafPage { is_new } => {
                    let leaf = LeafTuple::new(heap_ptr, key.map(|_| leaf_datum.clone()));
                    if self.try_leaf(descent, &leaf, nulls, is_new, level)? {
                        return Ok(InsertOutcome::Completed);
                    }
                    step = Step::InnerTuple;
                }

                Step::InnerTuple => {
                    self.check_cancelled()?;
                    let inner = {
                        let offset = descent.current.offset;
                        let guard = descent.current_guard()?;
                        read_inner(&guard.page(), offset)?
                    };

                    let output = if nulls {
                        ChooseOutput::MatchNode {
                            node: 0,
                            level_add: 0,
                            rest_datum: Vec::new(),
                        }
                    } else {
                        let labels = inner
                            .labels()
                            .map_err(|e| e.on_page(descent.current.page_id))?;
                        self.strategy.choose(&ChooseInput {
                            datum,
                            leaf_datum: &leaf_datum,
                            level,
                            all_the_same: inner.all_the_same,
                            prefix: inner.prefix.as_deref(),
                            node_labels: labels.as_deref(),
                            n_nodes: inner.nodes.len(),
                        })?
                    };

                    let output = if inner.all_the_same {
                        match output {
                            ChooseOutput::AddNode { .. } => {
                                return Err(SpGistError::contract(
                                    "cannot add a node to an allTheSame inner tuple",
                                ))
                            }
                            ChooseOutput::MatchNode {
                                level_add,
                                rest_datum,
                                ..
                            } => ChooseOutput::MatchNode {
                                node: rand::thread_rng().gen_range(0..inner.nodes.len()),
                                level_add,
                                rest_datum,
                            },
                            split => split,
                        }
                    } else {
                        output
                    };

                    match output {
                        ChooseOutput::MatchNode {
                            node,
                            level_add,
                            rest_datum,
                        } => {
                            let downlink = inner
                                .nodes
                                .get(node)
                                .map(|n| n.downlink)
                                .ok_or_else(|| {
                                    SpGistError::contract(format!(
                                        "choose picked node {node} of {}",
                                        inner.nodes.len()
                                    ))
                                })?;
                            level += level_add;
                            if !nulls {
                                leaf_datum = rest_datum;
                                *leaf_size = Self::leaf_footprint(Some(&leaf_datum));
                            }
                            self.match_node(descent, node, downlink);
                            trace!(node, level, child = %downlink, "descend");
                            step = Step::Descend;
                        }
                        ChooseOutput::AddNode { label, position } => {
                            if inner.nodes.iter().any(|n| n.label.is_none()) {
                                return Err(SpGistError::contract(
                                    "cannot add a node to an inner tuple without node labels",
                                ));
                            }
                            self.add_node_action(descent, &inner, label, position, nulls)?;
                        }
                        ChooseOutput::SplitTuple {
                            prefix_prefix,
                            prefix_node_label,
                            postfix_prefix,
                        } => {
                            self.split_tuple_action(
                                descent,
                                &inner,
                                prefix_prefix,
                                prefix_node_label,
                                postfix_prefix,
                                nulls,
                            )?;
                        }
                    }
                }
            }
        }
    }

    /// Places `leaf` at the latched leaf location. Returns false if a
    /// split left the entry for the new inner tuple at `current`.
    fn try_leaf(
        &self,
        descent: &mut Descent,
        leaf: &LeafTuple,
        nulls: bool,
        is_new: bool,
        level: u32,
    ) -> SpGistResult<bool> {
        let capacity = self.capacity();
        let (fits, chain) = {
            let offset = descent.current.offset;
            let guard = descent.current_guard()?;
            let page = guard.page();
            let fits = leaf.footprint() <= free_space(&page, 1);
            let chain = if fits {
                (0, 0)
            } else {
                count_and_size(&page, offset)?
            };
            (fits, chain)
        };

        if fits {
            self.add_leaf(descent, leaf, nulls, is_new)?;
            return Ok(true);
        }

        let (n_tuples, bytes) = chain;
        if bytes < self.config.move_chain_max_bytes()
            && n_tuples < self.config.move_chain_max_tuples
            && leaf.footprint() + bytes <= capacity
        {
            self.relocate_chain(descent, leaf, nulls)?;
            return Ok(true);
        }

        self.pick_split(descent, leaf, nulls, is_new, level)
    }

    /// Steps from the current inner tuple into `node`.
    fn match_node(&self, descent: &mut Descent, node: usize, downlink: ItemPointer) {
        if !descent.shares_page() {
            if let Some(guard) = descent.parent.guard.take() {
                self.space.release(guard);
            }
        }
        descent.parent.page_id = descent.current.page_id;
        descent.parent.offset = descent.current.offset;
        descent.parent.node = Some(node);
        if let Some(guard) = descent.current.guard.take() {
            descent.parent.guard = Some(guard);
        }

        descent.current.page_id = downlink.page_id();
        descent.current.offset = downlink.offset();
    }
}
