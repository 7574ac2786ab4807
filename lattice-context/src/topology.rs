//! Component topology: PageRank and articulation points.
//!
//! Both run on the symmetric adjacency of a single connected component.
//! Components are small (bounded by the traversal caps), so the dense
//! PageRank iteration is fine.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::{candidate_node_ids, Candidate};

pub const PAGERANK_ITERATIONS: usize = 10;
pub const PAGERANK_DAMPING: f64 = 0.85;
pub const BRIDGE_SCORE_MULTIPLIER: f64 = 1.5;

/// Symmetric adjacency keyed by node id. BTreeMap keeps iteration
/// deterministic.
pub type Adjacency = BTreeMap<String, Vec<String>>;

/// Build the symmetric adjacency of a component's candidates.
pub fn build_component_adjacency(component: &[Candidate]) -> Adjacency {
    let mut adj: BTreeMap<String, HashSet<String>> = BTreeMap::new();
    let mut all_nodes: HashSet<String> = HashSet::new();
    for candidate in component {
        let ids = candidate_node_ids(candidate);
        all_nodes.extend(ids.iter().cloned());
        if ids.len() == 2 {
            adj.entry(ids[0].clone()).or_default().insert(ids[1].clone());
            adj.entry(ids[1].clone()).or_default().insert(ids[0].clone());
        }
    }
    for node in all_nodes {
        adj.entry(node).or_default();
    }
    adj.into_iter()
        .map(|(node, neighbors)| {
            let mut sorted: Vec<String> = neighbors.into_iter().collect();
            sorted.sort();
            (node, sorted)
        })
        .collect()
}

/// PageRank over the adjacency: fixed iteration count, damping 0.85.
pub fn pagerank_scores(adjacency: &Adjacency) -> HashMap<String, f64> {
    if adjacency.is_empty() {
        return HashMap::new();
    }
    let n = adjacency.len() as f64;
    let mut scores: HashMap<String, f64> =
        adjacency.keys().map(|k| (k.clone(), 1.0 / n)).collect();

    for _ in 0..PAGERANK_ITERATIONS {
        let mut next: HashMap<String, f64> = HashMap::with_capacity(adjacency.len());
        for node in adjacency.keys() {
            let mut rank = (1.0 - PAGERANK_DAMPING) / n;
            for (src, neighbors) in adjacency {
                if !neighbors.is_empty() && neighbors.iter().any(|nb| nb == node) {
                    rank += PAGERANK_DAMPING * scores[src] / neighbors.len() as f64;
                }
            }
            next.insert(node.clone(), rank);
        }
        scores = next;
    }
    scores
}

/// Articulation points of the adjacency via the low-link DFS. Removing any
/// returned node disconnects its component.
pub fn identify_bridge_nodes(adjacency: &Adjacency) -> HashSet<String> {
    let mut disc: HashMap<String, usize> = HashMap::new();
    let mut low: HashMap<String, usize> = HashMap::new();
    let mut parent: HashMap<String, Option<String>> = HashMap::new();
    let mut bridges: HashSet<String> = HashSet::new();
    let mut timer = 0usize;

    // Iterative DFS with an explicit stack: (node, neighbor cursor).
    for root in adjacency.keys() {
        if disc.contains_key(root) {
            continue;
        }
        parent.insert(root.clone(), None);
        let mut stack: Vec<(String, usize)> = vec![(root.clone(), 0)];
        disc.insert(root.clone(), timer);
        low.insert(root.clone(), timer);
        timer += 1;
        let mut root_children = 0usize;

        while let Some((node, cursor)) = stack.pop() {
            let neighbors = adjacency.get(&node).cloned().unwrap_or_default();
            if cursor < neighbors.len() {
                let next = neighbors[cursor].clone();
                stack.push((node.clone(), cursor + 1));
                if !disc.contains_key(&next) {
                    if node == *root {
                        root_children += 1;
                    }
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
                // Post-order: fold this node's low-link into its parent and
                // test the articulation condition.
                let node_low = low[&node];
                if let Some(parent_low) = low.get_mut(&p) {
                    if node_low < *parent_low {
                        *parent_low = node_low;
                    }
                }
                if parent.get(&p).and_then(|g| g.as_ref()).is_some() && node_low >= disc[&p] {
                    bridges.insert(p.clone());
                }
            }
        }

        if root_children > 1 {
            bridges.insert(root.clone());
        }
    }
    bridges
}

/// Score candidates by max endpoint PageRank, boosting any candidate that
/// touches an articulation point. Sorted descending.
pub fn score_candidates_with_bridge_boost(
    component: &[Candidate],
    adjacency: &Adjacency,
) -> Vec<(f64, Candidate)> {
    let pr = pagerank_scores(adjacency);
    let bridge_nodes = identify_bridge_nodes(adjacency);
    let max_pr = pr.values().cloned().fold(f64::MIN, f64::max).max(1e-12);
    let bridge_boost = if pr.is_empty() {
        BRIDGE_SCORE_MULTIPLIER
    } else {
        max_pr * BRIDGE_SCORE_MULTIPLIER
    };

    let mut scored: Vec<(f64, Candidate)> = component
        .iter()
        .map(|candidate| {
            let ids = candidate_node_ids(candidate);
            let mut score = ids
                .iter()
                .filter_map(|id| pr.get(id).cloned())
                .fold(0.0, f64::max);
            if ids.iter().any(|id| bridge_nodes.contains(id)) {
                score = score.max(bridge_boost);
            }
            (score, candidate.clone())
        })
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn edge(source: &str, target: &str) -> Candidate {
        let mut c = Candidate::new();
        c.insert("source".to_string(), json!(source));
        c.insert("target".to_string(), json!(target));
        c
    }

    #[test]
    fn test_adjacency_is_symmetric() {
        let adj = build_component_adjacency(&[edge("a", "b"), edge("b", "c")]);
        assert_eq!(adj["a"], vec!["b"]);
        assert!(adj["b"].contains(&"a".to_string()));
        assert!(adj["b"].contains(&"c".to_string()));
    }

    #[test]
    fn test_pagerank_favors_the_hub() {
        // Star: hub connected to four leaves.
        let component: Vec<Candidate> = ["l1", "l2", "l3", "l4"]
            .iter()
            .map(|leaf| edge("hub", leaf))
            .collect();
        let adj = build_component_adjacency(&component);
        let scores = pagerank_scores(&adj);
        for leaf in ["l1", "l2", "l3", "l4"] {
            assert!(scores["hub"] > scores[leaf]);
        }
    }

    #[test]
    fn test_pagerank_sums_to_one() {
        let adj = build_component_adjacency(&[edge("a", "b"), edge("b", "c"), edge("c", "a")]);
        let total: f64 = pagerank_scores(&adj).values().sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_articulation_point_in_a_path() {
        // a - b - c: b is the articulation point.
        let adj = build_component_adjacency(&[edge("a", "b"), edge("b", "c")]);
        let bridges = identify_bridge_nodes(&adj);
        assert!(bridges.contains("b"));
        assert!(!bridges.contains("a"));
        assert!(!bridges.contains("c"));
    }

    #[test]
    fn test_cycle_has_no_articulation_points() {
        let adj = build_component_adjacency(&[edge("a", "b"), edge("b", "c"), edge("c", "a")]);
        assert!(identify_bridge_nodes(&adj).is_empty());
    }

    #[test]
    fn test_two_triangles_joined_at_a_node() {
        // Two triangles sharing node m: m is the cut vertex.
        let component = vec![
            edge("a", "b"),
            edge("b", "m"),
            edge("m", "a"),
            edge("m", "x"),
            edge("x", "y"),
            edge("y", "m"),
        ];
        let adj = build_component_adjacency(&component);
        let bridges = identify_bridge_nodes(&adj);
        assert_eq!(bridges, HashSet::from(["m".to_string()]));
    }

    #[test]
    fn test_bridge_boost_outranks_plain_pagerank() {
        // Path a-b-c plus leaf d on a: b bridges, and any candidate touching
        // b must sort first.
        let component = vec![edge("a", "b"), edge("b", "c"), edge("a", "d")];
        let adj = build_component_adjacency(&component);
        let scored = score_candidates_with_bridge_boost(&component, &adj);
        let top_ids = candidate_node_ids(&scored[0].1);
        assert!(top_ids.contains(&"b".to_string()));
    }
}
