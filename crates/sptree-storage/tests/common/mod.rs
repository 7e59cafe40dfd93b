//! Shared fixtures for the insertion tests.
//!
//! Strategies here are deliberately simple and deterministic so that
//! tests can predict the shape of the tree they build.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once, OnceLock};

use parking_lot::Mutex;
use sptree_common::types::{ItemPointer, Lsn, PageId};
use sptree_storage::buffer::BufferManager;
use sptree_storage::spgist::{
    CancelFlag, ChooseInput, ChooseOutput, PartitionStrategy, PickSplitInput, PickSplitOutput,
    SpGistConfig, SpGistIndex, SpGistResult, StrategyConfig,
};
use sptree_wal::{ChangeRecord, MemoryWal, RecordType, WalResult, WalSink};
use tracing_subscriber::EnvFilter;

/// Installs a test-writer subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Heap pointer for the `n`-th inserted row.
pub fn heap(n: usize) -> ItemPointer {
    ItemPointer::new(PageId::new(1_000 + (n / 200) as u32), (n % 200) as u16 + 1)
}

// =============================================================================
// Strategies
// =============================================================================

/// Puts every datum in one bucket; choose always follows node 0.
#[derive(Debug, Default)]
pub struct SingleBucket {
    /// Label the one node with `b"k"`.
    pub labeled: bool,
}

impl PartitionStrategy for SingleBucket {
    fn config(&self) -> StrategyConfig {
        StrategyConfig::default()
    }

    fn choose(&self, input: &ChooseInput<'_>) -> SpGistResult<ChooseOutput> {
        Ok(ChooseOutput::MatchNode {
            node: 0,
            level_add: 0,
            rest_datum: input.leaf_datum.to_vec(),
        })
    }

    fn pick_split(&self, input: &PickSplitInput<'_>) -> SpGistResult<PickSplitOutput> {
        Ok(PickSplitOutput {
            prefix: None,
            n_nodes: 1,
            node_labels: self.labeled.then(|| vec![b"k".to_vec()]),
            map: vec![0; input.datums.len()],
            leaf_datums: input.datums.iter().map(|d| d.to_vec()).collect(),
        })
    }
}

/// Answers every choose with a new node.
#[derive(Debug, Default)]
pub struct AlwaysAddNode;

impl PartitionStrategy for AlwaysAddNode {
    fn config(&self) -> StrategyConfig {
        StrategyConfig::default()
    }

    fn choose(&self, input: &ChooseInput<'_>) -> SpGistResult<ChooseOutput> {
        Ok(ChooseOutput::AddNode {
            label: vec![input.n_nodes as u8],
            position: None,
        })
    }

    fn pick_split(&self, input: &PickSplitInput<'_>) -> SpGistResult<PickSplitOutput> {
        SingleBucket { labeled: true }.pick_split(input)
    }
}

/// Returns far more nodes from pick-split than any inner tuple can hold.
#[derive(Debug, Default)]
pub struct OverwideSplit;

impl PartitionStrategy for OverwideSplit {
    fn config(&self) -> StrategyConfig {
        StrategyConfig::default()
    }

    fn choose(&self, input: &ChooseInput<'_>) -> SpGistResult<ChooseOutput> {
        SingleBucket::default().choose(input)
    }

    fn pick_split(&self, input: &PickSplitInput<'_>) -> SpGistResult<PickSplitOutput> {
        Ok(PickSplitOutput {
            prefix: None,
            n_nodes: usize::MAX,
            node_labels: None,
            map: (0..input.datums.len()).collect(),
            leaf_datums: input.datums.iter().map(|d| d.to_vec()).collect(),
        })
    }
}

/// Branches on the byte at the current level; leaf datums keep the full
/// value. Missing bytes are labeled 0.
#[derive(Debug, Default)]
pub struct ByteAtLevel;

impl ByteAtLevel {
    fn label(datum: &[u8], level: u32) -> u8 {
        datum.get(level as usize).copied().unwrap_or(0)
    }
}

impl PartitionStrategy for ByteAtLevel {
    fn config(&self) -> StrategyConfig {
        StrategyConfig::default()
    }

    fn choose(&self, input: &ChooseInput<'_>) -> SpGistResult<ChooseOutput> {
        let c = Self::label(input.datum, input.level);
        let labels = input.node_labels.unwrap_or(&[]);
        match labels.iter().position(|l| *l == [c]) {
            Some(node) => Ok(ChooseOutput::MatchNode {
                node,
                level_add: 1,
                rest_datum: input.leaf_datum.to_vec(),
            }),
            None if input.all_the_same => Ok(ChooseOutput::MatchNode {
                node: 0,
                level_add: 1,
                rest_datum: input.leaf_datum.to_vec(),
            }),
            None => Ok(ChooseOutput::AddNode {
                label: vec![c],
                position: None,
            }),
        }
    }

    fn pick_split(&self, input: &PickSplitInput<'_>) -> SpGistResult<PickSplitOutput> {
        let mut labels: Vec<u8> = Vec::new();
        let map = input
            .datums
            .iter()
            .map(|d| {
                let c = Self::label(d, input.level);
                match labels.iter().position(|&l| l == c) {
                    Some(node) => node,
                    None => {
                        labels.push(c);
                        labels.len() - 1
                    }
                }
            })
            .collect();
        Ok(PickSplitOutput {
            prefix: None,
            n_nodes: labels.len(),
            node_labels: Some(labels.into_iter().map(|c| vec![c]).collect()),
            map,
            leaf_datums: input.datums.iter().map(|d| d.to_vec()).collect(),
        })
    }
}

/// Replays queued choose answers before deferring to `base`.
pub struct Scripted {
    base: Box<dyn PartitionStrategy>,
    script: Mutex<VecDeque<ChooseOutput>>,
}

impl Scripted {
    pub fn new(base: impl PartitionStrategy + 'static) -> Self {
        Self {
            base: Box::new(base),
            script: Mutex::new(VecDeque::new()),
        }
    }

    /// Queues an answer for a later choose call.
    pub fn push(&self, output: ChooseOutput) {
        self.script.lock().push_back(output);
    }

    pub fn pending(&self) -> usize {
        self.script.lock().len()
    }
}

impl PartitionStrategy for Scripted {
    fn config(&self) -> StrategyConfig {
        self.base.config()
    }

    fn choose(&self, input: &ChooseInput<'_>) -> SpGistResult<ChooseOutput> {
        if let Some(output) = self.script.lock().pop_front() {
            return Ok(output);
        }
        self.base.choose(input)
    }

    fn pick_split(&self, input: &PickSplitInput<'_>) -> SpGistResult<PickSplitOutput> {
        self.base.pick_split(input)
    }
}

/// Keeps splitting inner tuples and cancels itself after `limit` calls.
pub struct SplitForever {
    pub cancel: CancelFlag,
    pub limit: usize,
    pub calls: AtomicUsize,
}

impl PartitionStrategy for SplitForever {
    fn config(&self) -> StrategyConfig {
        StrategyConfig::default()
    }

    fn choose(&self, _input: &ChooseInput<'_>) -> SpGistResult<ChooseOutput> {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.limit {
            self.cancel.cancel();
        }
        Ok(ChooseOutput::SplitTuple {
            prefix_prefix: None,
            prefix_node_label: Some(b"s".to_vec()),
            postfix_prefix: None,
        })
    }

    fn pick_split(&self, input: &PickSplitInput<'_>) -> SpGistResult<PickSplitOutput> {
        SingleBucket { labeled: true }.pick_split(input)
    }
}

// =============================================================================
// WAL
// =============================================================================

/// Memory log that checks every touched page is latched when a record
/// arrives.
///
/// A page is latched by the inserting thread exactly when `try_lock`
/// fails on it, since no other thread runs during these checks.
#[derive(Default)]
pub struct LatchCheckingWal {
    buffers: OnceLock<Arc<BufferManager>>,
    log: MemoryWal,
    violations: Mutex<Vec<(RecordType, PageId)>>,
}

impl LatchCheckingWal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts checking records against `buffers`.
    pub fn attach(&self, buffers: Arc<BufferManager>) {
        let _ = self.buffers.set(buffers);
    }

    pub fn violations(&self) -> Vec<(RecordType, PageId)> {
        self.violations.lock().clone()
    }

    pub fn records(&self) -> Vec<ChangeRecord> {
        self.log.records().unwrap()
    }

    pub fn record_count(&self) -> u64 {
        self.log.record_count()
    }

    pub fn count_of(&self, record_type: RecordType) -> usize {
        self.records()
            .iter()
            .filter(|r| r.record_type() == record_type)
            .count()
    }
}

impl WalSink for LatchCheckingWal {
    fn record_change(&self, record: &ChangeRecord) -> WalResult<Lsn> {
        if let Some(buffers) = self.buffers.get() {
            for page in record.touched_pages() {
                if let Ok(Some(_free)) = buffers.try_lock(page) {
                    self.violations.lock().push((record.record_type(), page));
                }
            }
        }
        self.log.record_change(record)
    }
}

// =============================================================================
// Index fixtures
// =============================================================================

/// An index over 4 KB pages filled completely, logging through a
/// latch-checking sink attached after creation.
pub fn test_index(strategy: impl PartitionStrategy + 'static) -> (SpGistIndex, Arc<LatchCheckingWal>) {
    test_index_shared(Arc::new(strategy))
}

pub fn test_index_shared(strategy: Arc<dyn PartitionStrategy>) -> (SpGistIndex, Arc<LatchCheckingWal>) {
    init_tracing();
    let wal = Arc::new(LatchCheckingWal::new());
    let index = SpGistIndex::in_memory(SpGistConfig::for_testing(), strategy, wal.clone()).unwrap();
    wal.attach(index.buffers().clone());
    (index, wal)
}

/// Fixed-width key whose first byte cycles through `buckets` letters.
pub fn bucket_key(i: usize, buckets: usize, width: usize) -> Vec<u8> {
    let mut key = vec![b'a' + (i % buckets) as u8];
    key.extend(format!("{i:0>w$}", w = width - 1).into_bytes());
    key
}
