//! Space-partitioned generalized search tree (SP-GiST) insertion.
//!
//! An index is two trees over one page store: one for keys and one for
//! null keys. Inner tuples carry an optional prefix and a list of nodes,
//! each with an optional label and a downlink. Leaf tuples hang below a
//! node as a chain: a singly-linked run of tuples on one page sharing the
//! node's downlink. What a prefix or label means is decided by a
//! [`PartitionStrategy`]; this module only moves tuples around.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌─────────────────────────────┐
//!                 │  root (block 1) inner tuple │
//!                 │  prefix | n0 | n1 | n2      │
//!                 └────┬──────┬──────┬──────────┘
//!                      │      │      └──────────────┐
//!                      ▼      ▼                     ▼
//!               ┌──────────┐ ┌──────────────┐  ┌──────────┐
//!               │ inner    │ │ leaf chain   │  │ leaf     │
//!               │ tuple    │ │ a → b → c    │  │ chain    │
//!               └──────────┘ └──────────────┘  └──────────┘
//! ```
//!
//! ## Insertion
//!
//! [`SpGistIndex::insert`] descends from the root holding at most two page
//! latches, the current location and the parent node that led there. When
//! a leaf location overflows, its chain is moved to another page or split
//! into a new inner tuple. At an inner tuple the strategy may ask for a
//! node to be added or for the tuple to be split into a prefix and a
//! postfix. A child page is only try-latched below a held parent; when
//! that fails the insertion releases everything and reports
//! [`InsertOutcome::RetryRequested`].
//!
//! Every group of page changes is described to a [`sptree_wal::WalSink`]
//! before the latches covering it are released.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use sptree_common::types::{ItemPointer, PageId};
//! use sptree_storage::spgist::{InsertContext, SpGistConfig, SpGistIndex, TextRadixStrategy};
//! use sptree_wal::MemoryWal;
//!
//! let config = SpGistConfig::for_testing();
//! let strategy = Arc::new(TextRadixStrategy::for_page_size(config.page_size));
//! let index = SpGistIndex::in_memory(config, strategy, Arc::new(MemoryWal::new())).unwrap();
//!
//! let ctx = InsertContext::default();
//! index
//!     .insert_with_retry(Some(b"hello"), ItemPointer::new(PageId::new(10), 1), &ctx)
//!     .unwrap();
//! index
//!     .insert_with_retry(None, ItemPointer::new(PageId::new(10), 2), &ctx)
//!     .unwrap();
//! assert_eq!(index.inspect().unwrap().live_entries(), 2);
//! ```

pub mod chain;
mod config;
mod cursor;
mod error;
mod index;
mod insert;
mod inspect;
pub mod meta;
mod node;
pub mod page;
pub mod space;
mod split;
mod strategy;
mod text;
pub mod tuple;

pub use config::SpGistConfig;
pub use cursor::{Descent, Materialized, PageCursor};
pub use error::{SpGistError, SpGistResult};
pub use index::{IndexStats, SpGistIndex};
pub use insert::{CancelFlag, InsertContext, InsertMode, InsertOutcome};
pub use inspect::{TreeInspector, TreeReport};
pub use node::{add_node, split_tuple};
pub use split::{check_all_the_same, SplitVerdict};
pub use strategy::{
    ChooseInput, ChooseOutput, PartitionStrategy, PickSplitInput, PickSplitOutput, StrategyConfig,
};
pub use text::{TextRadixStrategy, END_LABEL};
