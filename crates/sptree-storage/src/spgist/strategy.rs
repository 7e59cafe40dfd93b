//! The pluggable partitioning strategy.
//!
//! The engine knows nothing about the values it indexes. A
//! [`PartitionStrategy`] decides which child of an inner tuple a value
//! descends into and how a set of leaf values is carved into child
//! buckets when a leaf location overflows.

use super::error::{SpGistError, SpGistResult};
use super::tuple::{INNER_HEADER_SIZE, NODE_HEADER_SIZE};

/// Properties a strategy declares about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StrategyConfig {
    /// Values whose leaf tuple exceeds a page are accepted; the strategy
    /// promises to shorten them as they descend.
    pub long_values_ok: bool,
}

/// Arguments to [`PartitionStrategy::choose`].
#[derive(Debug, Clone, Copy)]
pub struct ChooseInput<'a> {
    /// The value as originally inserted.
    pub datum: &'a [u8],
    /// What remains of the value at this level.
    pub leaf_datum: &'a [u8],
    /// Strategy-private depth counter, accumulated from `level_add`.
    pub level: u32,
    /// The inner tuple's nodes all share one label.
    pub all_the_same: bool,
    /// The inner tuple's prefix.
    pub prefix: Option<&'a [u8]>,
    /// Node labels in node order, or `None` if the nodes are unlabeled.
    pub node_labels: Option<&'a [&'a [u8]]>,
    /// Number of nodes.
    pub n_nodes: usize,
}

/// Decision returned by [`PartitionStrategy::choose`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChooseOutput {
    /// Descend into node `node`.
    MatchNode {
        /// Node to follow.
        node: usize,
        /// Added to the level counter.
        level_add: u32,
        /// Remaining value to store or pass down.
        rest_datum: Vec<u8>,
    },
    /// Add a node with `label`, then choose again.
    AddNode {
        /// Label of the new node.
        label: Vec<u8>,
        /// Position of the new node; appended when `None`.
        position: Option<usize>,
    },
    /// Split the tuple into a one-node prefix tuple above a postfix tuple
    /// holding the original nodes, then choose again.
    SplitTuple {
        /// Prefix of the upper tuple.
        prefix_prefix: Option<Vec<u8>>,
        /// Label of the upper tuple's only node.
        prefix_node_label: Option<Vec<u8>>,
        /// Prefix of the lower tuple.
        postfix_prefix: Option<Vec<u8>>,
    },
}

/// Arguments to [`PartitionStrategy::pick_split`].
#[derive(Debug, Clone, Copy)]
pub struct PickSplitInput<'a> {
    /// Leaf datums to partition.
    pub datums: &'a [&'a [u8]],
    /// Level of the leaf tuples.
    pub level: u32,
}

/// Partition returned by [`PartitionStrategy::pick_split`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickSplitOutput {
    /// Prefix of the new inner tuple.
    pub prefix: Option<Vec<u8>>,
    /// Number of nodes of the new inner tuple.
    pub n_nodes: usize,
    /// One label per node, or `None` for unlabeled nodes.
    pub node_labels: Option<Vec<Vec<u8>>>,
    /// Node index for each input datum.
    pub map: Vec<usize>,
    /// Datum to store for each input in its new leaf tuple.
    pub leaf_datums: Vec<Vec<u8>>,
}

impl PickSplitOutput {
    /// Checks the shape of the output against `n_inputs` datums and a
    /// page of `capacity` bytes.
    ///
    /// Node indexes are checked where they are used.
    pub fn validate(&self, n_inputs: usize, capacity: usize) -> SpGistResult<()> {
        if self.n_nodes == 0 {
            return Err(SpGistError::contract("pick-split produced no nodes"));
        }
        let max_nodes = capacity.saturating_sub(INNER_HEADER_SIZE) / NODE_HEADER_SIZE;
        if self.n_nodes > max_nodes {
            return Err(SpGistError::contract(format!(
                "pick-split produced {} nodes, at most {max_nodes} fit on a page",
                self.n_nodes
            )));
        }
        if self.map.len() != n_inputs || self.leaf_datums.len() != n_inputs {
            return Err(SpGistError::contract(format!(
                "pick-split mapped {} and returned {} datums for {} inputs",
                self.map.len(),
                self.leaf_datums.len(),
                n_inputs
            )));
        }
        if let Some(labels) = &self.node_labels {
            if labels.len() != self.n_nodes {
                return Err(SpGistError::contract(format!(
                    "pick-split returned {} labels for {} nodes",
                    labels.len(),
                    self.n_nodes
                )));
            }
        }
        Ok(())
    }
}

/// Value-specific half of the index.
pub trait PartitionStrategy: Send + Sync {
    /// Returns the strategy's declared properties.
    fn config(&self) -> StrategyConfig;

    /// Decides how a value proceeds at an inner tuple.
    fn choose(&self, input: &ChooseInput<'_>) -> SpGistResult<ChooseOutput>;

    /// Partitions leaf datums into child buckets.
    fn pick_split(&self, input: &PickSplitInput<'_>) -> SpGistResult<PickSplitOutput>;
}
