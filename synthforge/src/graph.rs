//! Tool dependency graphs and sub-chain enumeration.
//!
//! Chain detection is an LLM call whose reply lists plausible tool
//! sequences; the builder turns the accepted sequences into a directed
//! graph and enumerates every path of bounded length. Output is names-only:
//! one sub-chain per record downstream.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::parse::parse_json_list;

/// One detected chain from the graph-detection reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedChain {
    /// The judge's verdict: `yes`, `no` or `not sure`.
    #[serde(rename = "tool_graph_detect", default)]
    pub verdict: String,
    /// The tool sequence.
    #[serde(rename = "tool_graph_detect_chain", default)]
    pub chain: Vec<String>,
    /// A task that would require the chain.
    #[serde(rename = "tool_graph_detect_task", default)]
    pub task: String,
}

/// Parse a detection reply, keeping only `yes` verdicts.
#[must_use]
pub fn parse_detected_chains(text: &str) -> Vec<DetectedChain> {
    parse_json_list(text)
        .into_iter()
        .filter_map(|item| serde_json::from_value::<DetectedChain>(item).ok())
        .filter(|c| c.verdict == "yes")
        .collect()
}

/// A directed graph over tool names. Nodes and adjacency lists keep
/// first-seen order so enumeration is deterministic.
#[derive(Debug, Clone, Default)]
pub struct ToolGraph {
    nodes: Vec<String>,
    edges: HashMap<String, Vec<String>>,
}

impl ToolGraph {
    /// Build a graph from detected chains: an edge per consecutive pair,
    /// deduplicated, self-edges skipped (a tool may not repeat adjacently).
    #[must_use]
    pub fn from_chains<'c>(chains: impl IntoIterator<Item = &'c [String]>) -> Self {
        let mut graph = Self::default();
        for chain in chains {
            for window in chain.windows(2) {
                graph.add_node(&window[0]);
                graph.add_node(&window[1]);
                if window[0] != window[1] {
                    graph.add_edge(&window[0], &window[1]);
                }
            }
            if let [only] = chain {
                graph.add_node(only);
            }
        }
        graph
    }

    fn add_node(&mut self, name: &str) {
        if !self.nodes.iter().any(|n| n == name) {
            self.nodes.push(name.to_owned());
            self.edges.insert(name.to_owned(), Vec::new());
        }
    }

    fn add_edge(&mut self, from: &str, to: &str) {
        let nexts = self.edges.entry(from.to_owned()).or_default();
        if !nexts.iter().any(|n| n == to) {
            nexts.push(to.to_owned());
        }
    }

    /// Node names in first-seen order.
    #[must_use]
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Successors of a node, in insertion order.
    #[must_use]
    pub fn nexts(&self, name: &str) -> &[String] {
        self.edges.get(name).map_or(&[], Vec::as_slice)
    }

    /// Every path of exactly `length` nodes starting from `start`.
    fn chains_from(&self, start: &str, length: usize) -> Vec<Vec<String>> {
        let mut chains = Vec::new();
        let mut chain = vec![start.to_owned()];
        self.dfs(start, length.saturating_sub(1), &mut chain, &mut chains);
        chains
    }

    fn dfs(&self, node: &str, remaining: usize, chain: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
        if remaining == 0 {
            out.push(chain.clone());
            return;
        }
        for next in self.nexts(node) {
            chain.push(next.clone());
            self.dfs(next, remaining - 1, chain, out);
            chain.pop();
        }
    }

    /// Enumerate every sub-chain of length in `[min_len, max_len]`
    /// inclusive, deduplicated, from every node.
    #[must_use]
    pub fn enumerate_sub_chains(&self, min_len: usize, max_len: usize) -> Vec<Vec<String>> {
        let mut seen: HashSet<Vec<String>> = HashSet::new();
        let mut out = Vec::new();
        for length in min_len.max(1)..=max_len {
            for node in &self.nodes {
                for chain in self.chains_from(node, length) {
                    if seen.insert(chain.clone()) {
                        out.push(chain);
                    }
                }
            }
        }
        out
    }
}

/// Summary statistics for a sub-chain extraction run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubChainReport {
    /// Total sub-chains across all records.
    pub total: usize,
    /// Sub-chain count per chain length.
    pub per_length: BTreeMap<usize, usize>,
    /// Records processed.
    pub records: usize,
}

impl SubChainReport {
    /// Fold one record's sub-chains into the report.
    pub fn add_record(&mut self, sub_chains: &[Vec<String>]) {
        self.records += 1;
        self.total += sub_chains.len();
        for chain in sub_chains {
            *self.per_length.entry(chain.len()).or_default() += 1;
        }
    }
}

/// Read `graph.sub_chains` out of a record value.
#[must_use]
pub fn sub_chains_of(record: &Value) -> Vec<Vec<String>> {
    record
        .pointer("/graph/sub_chains")
        .and_then(Value::as_array)
        .map(|chains| {
            chains
                .iter()
                .filter_map(|c| serde_json::from_value(c.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chains(raw: &[&[&str]]) -> Vec<Vec<String>> {
        raw.iter()
            .map(|c| c.iter().map(|s| (*s).to_owned()).collect())
            .collect()
    }

    #[test]
    fn detection_keeps_only_yes() {
        let reply = r#"[
            {"tool_graph_detect": "yes", "tool_graph_detect_chain": ["a", "b"], "tool_graph_detect_task": "t"},
            {"tool_graph_detect": "no", "tool_graph_detect_chain": ["b", "c"], "tool_graph_detect_task": ""},
            {"tool_graph_detect": "not sure", "tool_graph_detect_chain": ["c"], "tool_graph_detect_task": ""}
        ]"#;
        let detected = parse_detected_chains(reply);
        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].chain, vec!["a", "b"]);
    }

    #[test]
    fn empty_tools_emit_zero_sub_chains() {
        let graph = ToolGraph::from_chains(std::iter::empty::<&[String]>());
        assert!(graph.enumerate_sub_chains(2, 5).is_empty());
    }

    #[test]
    fn linear_chain_enumeration() {
        let source = chains(&[&["a", "b", "c"]]);
        let graph = ToolGraph::from_chains(source.iter().map(Vec::as_slice));
        let subs = graph.enumerate_sub_chains(2, 3);
        let expected = chains(&[&["a", "b"], &["b", "c"], &["a", "b", "c"]]);
        assert_eq!(subs, expected);
    }

    #[test]
    fn diamond_enumeration_matches_simple_paths() {
        // a -> b, a -> c, b -> d, c -> d
        let source = chains(&[&["a", "b", "d"], &["a", "c", "d"]]);
        let graph = ToolGraph::from_chains(source.iter().map(Vec::as_slice));
        let subs = graph.enumerate_sub_chains(2, 3);
        let as_set: HashSet<_> = subs.iter().cloned().collect();
        let expected: HashSet<_> = chains(&[
            &["a", "b"],
            &["a", "c"],
            &["b", "d"],
            &["c", "d"],
            &["a", "b", "d"],
            &["a", "c", "d"],
        ])
        .into_iter()
        .collect();
        assert_eq!(as_set, expected);
        assert_eq!(subs.len(), expected.len(), "no duplicates");
    }

    #[test]
    fn duplicate_detected_chains_do_not_duplicate_paths() {
        let source = chains(&[&["a", "b"], &["a", "b"]]);
        let graph = ToolGraph::from_chains(source.iter().map(Vec::as_slice));
        assert_eq!(graph.enumerate_sub_chains(2, 2).len(), 1);
    }

    #[test]
    fn self_edges_are_skipped() {
        let source = chains(&[&["a", "a", "b"]]);
        let graph = ToolGraph::from_chains(source.iter().map(Vec::as_slice));
        let subs = graph.enumerate_sub_chains(2, 2);
        assert_eq!(subs, chains(&[&["a", "b"]]));
    }

    #[test]
    fn report_counts_by_length() {
        let mut report = SubChainReport::default();
        report.add_record(&chains(&[&["a", "b"], &["a", "b", "c"]]));
        report.add_record(&chains(&[&["x", "y"]]));
        assert_eq!(report.records, 2);
        assert_eq!(report.total, 3);
        assert_eq!(report.per_length[&2], 2);
        assert_eq!(report.per_length[&3], 1);
    }
}
