//! Partitioning an oversized component into communities.
//!
//! Communities are found by cutting bridge edges (edges whose removal
//! disconnects the component, via the low-link DFS) and taking the
//! remaining connected components. Dense clusters joined by thin links
//! split exactly at the links; a component with no bridges stays whole and
//! the caller falls back to PageRank truncation. Fully deterministic:
//! sorted iteration everywhere, community ids assigned in member order.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::topology::Adjacency;

/// Node set plus adjacency of one component.
#[derive(Debug, Clone, Default)]
pub struct GraphTopology {
    pub nodes: Vec<String>,
    pub adjacency: Adjacency,
}

#[derive(Debug, Clone)]
pub struct Community {
    pub community_id: String,
    pub members: HashSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PartitionResult {
    pub communities: Vec<Community>,
    pub node_to_community: HashMap<String, String>,
}

impl PartitionResult {
    pub fn community_count(&self) -> usize {
        self.communities.len()
    }
}

/// Undirected edge in canonical (min, max) order.
fn canonical_edge(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Bridge edges of the adjacency: `(u, v)` is a bridge iff `low[v] >
/// disc[u]` for the tree edge u->v in the low-link DFS.
fn find_bridge_edges(adjacency: &Adjacency) -> HashSet<(String, String)> {
    let mut disc: HashMap<String, usize> = HashMap::new();
    let mut low: HashMap<String, usize> = HashMap::new();
    let mut parent: HashMap<String, Option<String>> = HashMap::new();
    let mut bridges: HashSet<(String, String)> = HashSet::new();
    let mut timer = 0usize;

    for root in adjacency.keys() {
        if disc.contains_key(root) {
            continue;
        }
        parent.insert(root.clone(), None);
        disc.insert(root.clone(), timer);
        low.insert(root.clone(), timer);
        timer += 1;
        let mut stack: Vec<(String, usize)> = vec![(root.clone(), 0)];

        while let Some((node, cursor)) = stack.pop() {
            let neighbors = adjacency.get(&node).cloned().unwrap_or_default();
            if cursor < neighbors.len() {
                let next = neighbors[cursor].clone();
                stack.push((node.clone(), cursor + 1));
                if !disc.contains_key(&next) {
                    parent.insert(next.clone(), Some(node.clone()));
                    disc.insert(next.clone(), timer);
                    low.insert(next.clone(), timer);
                    timer += 1;
                    stack.push((next, 0));
                } else if parent.get(&node).and_then(|p| p.as_ref()) != Some(&next) {
                    let back = disc[&next];
                    if let Some(entry) = low.get_mut(&node) {
                        if back < *entry {
                            *entry = back;
                        }
                    }
                }
            } else if let Some(Some(p)) = parent.get(&node).cloned() {
                let node_low = low[&node];
                if node_low > disc[&p] {
                    bridges.insert(canonical_edge(&p, &node));
                }
                if let Some(parent_low) = low.get_mut(&p) {
                    if node_low < *parent_low {
                        *parent_low = node_low;
                    }
                }
            }
        }
    }
    bridges
}

/// Structural partitioner: cut bridges, components become communities.
#[derive(Debug, Clone, Default)]
pub struct SemanticPartitioner;

impl SemanticPartitioner {
    pub fn new() -> Self {
        Self
    }

    pub fn partition(&self, topology: &GraphTopology) -> PartitionResult {
        if topology.nodes.is_empty() {
            return PartitionResult::default();
        }

        let bridges = find_bridge_edges(&topology.adjacency);

        // Adjacency with bridge edges removed, sorted for determinism.
        let mut cut: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for node in &topology.nodes {
            cut.entry(node.clone()).or_default();
        }
        for (node, neighbors) in &topology.adjacency {
            let kept = cut.entry(node.clone()).or_default();
            for neighbor in neighbors {
                if !bridges.contains(&canonical_edge(node, neighbor)) {
                    kept.push(neighbor.clone());
                }
            }
            kept.sort();
            kept.dedup();
        }

        // Connected components of the cut graph, visited in sorted order.
        let mut visited: HashSet<String> = HashSet::new();
        let mut communities: Vec<Community> = Vec::new();
        let mut node_to_community: HashMap<String, String> = HashMap::new();

        for start in cut.keys() {
            if visited.contains(start) {
                continue;
            }
            let mut members: HashSet<String> = HashSet::new();
            let mut stack = vec![start.clone()];
            while let Some(node) = stack.pop() {
                if !visited.insert(node.clone()) {
                    continue;
                }
                members.insert(node.clone());
                if let Some(neighbors) = cut.get(&node) {
                    for neighbor in neighbors {
                        if !visited.contains(neighbor) {
                            stack.push(neighbor.clone());
                        }
                    }
                }
            }
            let community_id = format!("community_{}", communities.len());
            for member in &members {
                node_to_community.insert(member.clone(), community_id.clone());
            }
            communities.push(Community {
                community_id,
                members,
            });
        }

        PartitionResult {
            communities,
            node_to_community,
        }
    }
}
