//! Radix tree strategy for byte strings.
//!
//! Inner tuples store the run of bytes shared by every value below them as
//! their prefix and branch on the next byte; each node label is that single
//! byte, with 0 standing for "the value ends here". Leaf tuples hold only
//! the suffix left after the bytes consumed on the way down, so values of
//! any length can be indexed: each level shortens them.

use sptree_common::constants::DEFAULT_PAGE_SIZE;
use sptree_common::PAGE_HEADER_SIZE;

use super::error::{SpGistError, SpGistResult};
use super::strategy::{
    ChooseInput, ChooseOutput, PartitionStrategy, PickSplitInput, PickSplitOutput, StrategyConfig,
};
use super::tuple::{INNER_HEADER_SIZE, NODE_HEADER_SIZE};

/// Label of the node holding values that end at this level.
///
/// A 0x00 byte inside a key is indistinguishable from the end of the key,
/// so keys with embedded NULs share the end-of-key node.
pub const END_LABEL: u8 = 0;

const MIN_PREFIX_LENGTH: usize = 32;
const PREFIX_SLACK: usize = 100;

/// Byte-string radix strategy.
#[derive(Debug, Clone)]
pub struct TextRadixStrategy {
    max_prefix_len: usize,
}

impl TextRadixStrategy {
    /// Creates a strategy for pages of `page_size` bytes.
    ///
    /// Prefixes are capped so an inner tuple with one node per byte value
    /// still fits on a page.
    pub fn for_page_size(page_size: usize) -> Self {
        let widest = INNER_HEADER_SIZE + 256 * (NODE_HEADER_SIZE + 1);
        let max_prefix_len = page_size
            .saturating_sub(PAGE_HEADER_SIZE + widest + PREFIX_SLACK)
            .max(MIN_PREFIX_LENGTH);
        Self { max_prefix_len }
    }

    /// Longest prefix this strategy puts in an inner tuple.
    pub fn max_prefix_len(&self) -> usize {
        self.max_prefix_len
    }
}

impl Default for TextRadixStrategy {
    fn default() -> Self {
        Self::for_page_size(DEFAULT_PAGE_SIZE)
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Binary search of single-byte labels: `Ok(found)` or `Err(insert_at)`.
fn search_label(labels: &[&[u8]], c: u8) -> SpGistResult<Result<usize, usize>> {
    let mut bytes = Vec::with_capacity(labels.len());
    for label in labels {
        match label {
            [b] => bytes.push(*b),
            _ => {
                return Err(SpGistError::contract(format!(
                    "radix node label must be one byte, found {} bytes",
                    label.len()
                )))
            }
        }
    }
    Ok(bytes.binary_search(&c))
}

impl PartitionStrategy for TextRadixStrategy {
    fn config(&self) -> StrategyConfig {
        StrategyConfig {
            long_values_ok: true,
        }
    }

    fn choose(&self, input: &ChooseInput<'_>) -> SpGistResult<ChooseOutput> {
        let rest = input.datum.get(input.level as usize..).unwrap_or(&[]);
        let mut common = 0;

        if let Some(prefix) = input.prefix {
            common = common_prefix(rest, prefix);
            if common < prefix.len() {
                // The value leaves the prefix early: split it there
                return Ok(ChooseOutput::SplitTuple {
                    prefix_prefix: (common > 0).then(|| prefix[..common].to_vec()),
                    prefix_node_label: Some(vec![prefix[common]]),
                    postfix_prefix: (prefix.len() - common > 1)
                        .then(|| prefix[common + 1..].to_vec()),
                });
            }
        }
        let node_char = rest.get(common).copied().unwrap_or(END_LABEL);

        let labels = input
            .node_labels
            .ok_or_else(|| SpGistError::contract("radix inner tuple has unlabeled nodes"))?;
        match search_label(labels, node_char)? {
            Ok(node) => Ok(ChooseOutput::MatchNode {
                node,
                level_add: common as u32 + 1,
                rest_datum: rest.get(common + 1..).unwrap_or(&[]).to_vec(),
            }),
            Err(_) if input.all_the_same => Ok(ChooseOutput::SplitTuple {
                prefix_prefix: input.prefix.map(<[u8]>::to_vec),
                prefix_node_label: Some(vec![END_LABEL]),
                postfix_prefix: None,
            }),
            Err(position) => Ok(ChooseOutput::AddNode {
                label: vec![node_char],
                position: Some(position),
            }),
        }
    }

    fn pick_split(&self, input: &PickSplitInput<'_>) -> SpGistResult<PickSplitOutput> {
        let Some(first) = input.datums.first() else {
            return Err(SpGistError::internal("pick-split called without datums"));
        };
        let common = input
            .datums
            .iter()
            .skip(1)
            .fold(first.len(), |len, d| len.min(common_prefix(first, d)))
            .min(self.max_prefix_len);

        let label_of = |d: &[u8]| d.get(common).copied().unwrap_or(END_LABEL);
        let mut order: Vec<usize> = (0..input.datums.len()).collect();
        order.sort_by_key(|&i| label_of(input.datums[i]));

        let mut node_labels: Vec<Vec<u8>> = Vec::new();
        let mut map = vec![0; input.datums.len()];
        let mut leaf_datums = vec![Vec::new(); input.datums.len()];
        for &i in &order {
            let datum = input.datums[i];
            let c = label_of(datum);
            if node_labels.last().map(|l| l[0]) != Some(c) {
                node_labels.push(vec![c]);
            }
            map[i] = node_labels.len() - 1;
            leaf_datums[i] = datum.get(common + 1..).unwrap_or(&[]).to_vec();
        }

        Ok(PickSplitOutput {
            prefix: (common > 0).then(|| first[..common].to_vec()),
            n_nodes: node_labels.len(),
            node_labels: Some(node_labels),
            map,
            leaf_datums,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn choose(
        strategy: &TextRadixStrategy,
        datum: &[u8],
        level: u32,
        prefix: Option<&[u8]>,
        labels: &[u8],
        all_the_same: bool,
    ) -> ChooseOutput {
        let labels: Vec<&[u8]> = labels.chunks(1).collect();
        strategy
            .choose(&ChooseInput {
                datum,
                leaf_datum: datum.get(level as usize..).unwrap_or(&[]),
                level,
                all_the_same,
                prefix,
                node_labels: Some(&labels),
                n_nodes: labels.len(),
            })
            .unwrap()
    }

    #[test]
    fn test_max_prefix_len() {
        assert!(TextRadixStrategy::for_page_size(4096).max_prefix_len() >= MIN_PREFIX_LENGTH);
        assert!(
            TextRadixStrategy::default().max_prefix_len()
                > TextRadixStrategy::for_page_size(4096).max_prefix_len()
        );
    }

    #[test]
    fn test_pick_split_groups_by_next_byte() {
        let strategy = TextRadixStrategy::default();
        let datums: Vec<&[u8]> = ["abcx", "abdy", "abc", "ab"].iter().map(|s| s.as_bytes()).collect();
        let out = strategy
            .pick_split(&PickSplitInput {
                datums: &datums,
                level: 0,
            })
            .unwrap();

        assert_eq!(out.prefix.as_deref(), Some(&b"ab"[..]));
        assert_eq!(
            out.node_labels,
            Some(vec![vec![END_LABEL], b"c".to_vec(), b"d".to_vec()])
        );
        assert_eq!(out.map, vec![1, 2, 1, 0]);
        assert_eq!(out.leaf_datums[0], b"x".to_vec());
        assert_eq!(out.leaf_datums[2], Vec::<u8>::new());
        assert_eq!(out.leaf_datums[3], Vec::<u8>::new());
        assert!(out.validate(4, 4064).is_ok());
    }

    #[test]
    fn test_pick_split_identical_values_single_node() {
        let strategy = TextRadixStrategy::default();
        let datums: Vec<&[u8]> = vec![b"same".as_slice(); 3];
        let out = strategy
            .pick_split(&PickSplitInput {
                datums: &datums,
                level: 0,
            })
            .unwrap();
        assert_eq!(out.n_nodes, 1);
        assert_eq!(out.prefix.as_deref(), Some(&b"same"[..]));
        assert_eq!(out.map, vec![0, 0, 0]);
    }

    #[test]
    fn test_pick_split_caps_prefix() {
        let strategy = TextRadixStrategy::for_page_size(4096);
        let long = vec![b'z'; 5000];
        let datums: Vec<&[u8]> = vec![long.as_slice(), long.as_slice()];
        let out = strategy
            .pick_split(&PickSplitInput {
                datums: &datums,
                level: 0,
            })
            .unwrap();
        let cap = strategy.max_prefix_len();
        assert_eq!(out.prefix.map(|p| p.len()), Some(cap));
        assert_eq!(out.leaf_datums[0].len(), 5000 - cap - 1);
    }

    #[test]
    fn test_choose_match_consumes_prefix_and_label() {
        let strategy = TextRadixStrategy::default();
        let out = choose(&strategy, b"xxabcdef", 2, Some(&b"ab"[..]), b"bc", false);
        assert_eq!(
            out,
            ChooseOutput::MatchNode {
                node: 1,
                level_add: 3,
                rest_datum: b"def".to_vec(),
            }
        );
    }

    #[test]
    fn test_choose_end_of_value() {
        let strategy = TextRadixStrategy::default();
        let out = choose(&strategy, b"ab", 0, Some(&b"ab"[..]), &[END_LABEL, b'c'], false);
        assert_eq!(
            out,
            ChooseOutput::MatchNode {
                node: 0,
                level_add: 3,
                rest_datum: Vec::new(),
            }
        );
    }

    #[test]
    fn test_choose_embedded_nul_shares_end_node() {
        let strategy = TextRadixStrategy::default();
        let out = choose(&strategy, b"ab\0cd", 0, Some(&b"ab"[..]), &[END_LABEL, b'c'], false);
        assert_eq!(
            out,
            ChooseOutput::MatchNode {
                node: 0,
                level_add: 3,
                rest_datum: b"cd".to_vec(),
            }
        );
    }

    #[test]
    fn test_choose_add_node_keeps_labels_sorted() {
        let strategy = TextRadixStrategy::default();
        let out = choose(&strategy, b"m", 0, None, b"az", false);
        assert_eq!(
            out,
            ChooseOutput::AddNode {
                label: b"m".to_vec(),
                position: Some(1),
            }
        );
    }

    #[test]
    fn test_choose_splits_on_prefix_mismatch() {
        let strategy = TextRadixStrategy::default();
        let out = choose(&strategy, b"abxy", 0, Some(&b"abcd"[..]), b"q", false);
        assert_eq!(
            out,
            ChooseOutput::SplitTuple {
                prefix_prefix: Some(b"ab".to_vec()),
                prefix_node_label: Some(b"c".to_vec()),
                postfix_prefix: Some(b"d".to_vec()),
            }
        );

        let out = choose(&strategy, b"q", 0, Some(&b"ab"[..]), b"q", false);
        assert_eq!(
            out,
            ChooseOutput::SplitTuple {
                prefix_prefix: None,
                prefix_node_label: Some(b"a".to_vec()),
                postfix_prefix: Some(b"b".to_vec()),
            }
        );
    }

    #[test]
    fn test_choose_all_the_same_splits_instead_of_adding() {
        let strategy = TextRadixStrategy::default();
        let out = choose(&strategy, b"pq", 0, Some(&b"p"[..]), b"aa", true);
        assert_eq!(
            out,
            ChooseOutput::SplitTuple {
                prefix_prefix: Some(b"p".to_vec()),
                prefix_node_label: Some(vec![END_LABEL]),
                postfix_prefix: None,
            }
        );
    }

    #[test]
    fn test_choose_rejects_wide_labels() {
        let strategy = TextRadixStrategy::default();
        let err = strategy
            .choose(&ChooseInput {
                datum: b"a",
                leaf_datum: b"a",
                level: 0,
                all_the_same: false,
                prefix: None,
                node_labels: Some(&[&b"ab"[..]]),
                n_nodes: 1,
            })
            .unwrap_err();
        assert!(matches!(err, SpGistError::ContractViolation(_)));
    }
}
