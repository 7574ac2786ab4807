//! Candidate ranking and topology-aware truncation.

use serde_json::json;
use std::collections::{HashMap, HashSet};

use lattice_core::TokenBudget;

use crate::partition::{GraphTopology, SemanticPartitioner};
use crate::topology::{build_component_adjacency, score_candidates_with_bridge_boost};
use crate::{candidate_node_ids, estimate_tokens, serialize_candidate, Candidate};

fn candidate_score(candidate: &Candidate) -> f64 {
    candidate
        .get("score")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0)
}

/// Rank by `score` descending when any candidate carries one; otherwise
/// preserve the input order.
pub fn rank_by_relevance(candidates: &[Candidate]) -> Vec<Candidate> {
    if !candidates.iter().any(|c| c.contains_key("score")) {
        return candidates.to_vec();
    }
    let mut ranked = candidates.to_vec();
    ranked.sort_by(|a, b| {
        candidate_score(b)
            .partial_cmp(&candidate_score(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked
}

/// Rank, cap at `max_results`, and admit candidates in order until the token
/// budget is exhausted. Rank order is preserved in the output.
pub fn truncate_context(candidates: &[Candidate], budget: &TokenBudget) -> Vec<Candidate> {
    if candidates.is_empty() {
        return Vec::new();
    }
    let ranked = rank_by_relevance(candidates);
    let capped = &ranked[..ranked.len().min(budget.max_results)];

    let mut result = Vec::new();
    let mut total_tokens = 0usize;
    for candidate in capped {
        let tokens = estimate_tokens(&serialize_candidate(candidate));
        if total_tokens + tokens > budget.max_context_tokens {
            break;
        }
        result.push(candidate.clone());
        total_tokens += tokens;
    }
    result
}

/// Group candidates into connected components over shared node ids.
pub fn identify_connected_paths(candidates: &[Candidate]) -> Vec<Vec<Candidate>> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let mut by_node: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, candidate) in candidates.iter().enumerate() {
        for node_id in candidate_node_ids(candidate) {
            by_node.entry(node_id).or_default().push(idx);
        }
    }

    let mut visited: HashSet<usize> = HashSet::new();
    let mut components: Vec<Vec<Candidate>> = Vec::new();
    for start in 0..candidates.len() {
        if visited.contains(&start) {
            continue;
        }
        let mut indexes: Vec<usize> = Vec::new();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            indexes.push(current);
            for node_id in candidate_node_ids(&candidates[current]) {
                if let Some(neighbors) = by_node.get(&node_id) {
                    for &neighbor in neighbors {
                        if !visited.contains(&neighbor) {
                            stack.push(neighbor);
                        }
                    }
                }
            }
        }
        indexes.sort_unstable();
        components.push(indexes.into_iter().map(|i| candidates[i].clone()).collect());
    }
    components
}

fn path_min_score(path: &[Candidate]) -> f64 {
    path.iter().map(candidate_score).fold(f64::INFINITY, f64::min)
}

fn path_token_cost(path: &[Candidate]) -> usize {
    path.iter()
        .map(|c| estimate_tokens(&serialize_candidate(c)))
        .sum()
}

/// PageRank+bridge truncation of one oversized component. Connectivity is
/// preserved: after the first admitted edge, a new edge must share an
/// endpoint with the already-included set.
pub fn truncate_component_by_pagerank(
    component: &[Candidate],
    token_budget: usize,
    max_results: usize,
) -> Vec<Candidate> {
    let adjacency = build_component_adjacency(component);
    let scored = score_candidates_with_bridge_boost(component, &adjacency);

    let mut result: Vec<Candidate> = Vec::new();
    let mut included_nodes: HashSet<String> = HashSet::new();
    let mut total_tokens = 0usize;

    for (_, candidate) in scored {
        let cost = estimate_tokens(&serialize_candidate(&candidate));
        if total_tokens + cost > token_budget {
            continue;
        }
        if result.len() >= max_results {
            break;
        }
        let ids = candidate_node_ids(&candidate);
        if !result.is_empty()
            && ids.len() == 2
            && !included_nodes.contains(&ids[0])
            && !included_nodes.contains(&ids[1])
        {
            continue;
        }
        total_tokens += cost;
        included_nodes.extend(ids);
        result.push(candidate);
    }
    result
}

fn build_topology_from_component(component: &[Candidate]) -> GraphTopology {
    let adjacency = build_component_adjacency(component);
    GraphTopology {
        nodes: adjacency.keys().cloned().collect(),
        adjacency,
    }
}

fn count_cross_community_edges(
    component: &[Candidate],
    node_to_community: &HashMap<String, String>,
) -> usize {
    component
        .iter()
        .filter(|candidate| {
            let ids = candidate_node_ids(candidate);
            if ids.len() != 2 {
                return false;
            }
            match (node_to_community.get(&ids[0]), node_to_community.get(&ids[1])) {
                (Some(a), Some(b)) => a != b,
                _ => false,
            }
        })
        .count()
}

fn collect_bridge_edges_for_community(
    component: &[Candidate],
    members: &HashSet<String>,
    node_to_community: &HashMap<String, String>,
) -> Vec<serde_json::Value> {
    let mut bridge_edges = Vec::new();
    for candidate in component {
        let ids = candidate_node_ids(candidate);
        if ids.len() != 2 {
            continue;
        }
        let src_in = members.contains(&ids[0]);
        let tgt_in = members.contains(&ids[1]);
        let (node, other) = match (src_in, tgt_in) {
            (true, false) => (&ids[0], &ids[1]),
            (false, true) => (&ids[1], &ids[0]),
            _ => continue,
        };
        let connects_to = node_to_community
            .get(other)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        bridge_edges.push(json!({"node": node, "connects_to": connects_to}));
    }
    bridge_edges
}

/// Compress an oversized component into one summary record per community:
/// community id, member count, sorted members, cross-community edge count,
/// a bounded bridge-edge list, and the best member score.
pub fn compress_component_to_summaries(
    component: &[Candidate],
    budget: &TokenBudget,
) -> Vec<Candidate> {
    if component.is_empty() {
        return Vec::new();
    }

    let topology = build_topology_from_component(component);
    if topology.nodes.len() < 2 {
        return truncate_component_by_pagerank(
            component,
            budget.max_context_tokens,
            budget.max_results,
        );
    }

    let partition = SemanticPartitioner::new().partition(&topology);
    if partition.community_count() <= 1 {
        return truncate_component_by_pagerank(
            component,
            budget.max_context_tokens,
            budget.max_results,
        );
    }

    let cross_edges = count_cross_community_edges(component, &partition.node_to_community);

    let mut summaries: Vec<Candidate> = Vec::new();
    let mut total_tokens = 0usize;
    for community in &partition.communities {
        let mut members: Vec<&String> = community.members.iter().collect();
        members.sort();
        let max_score = component
            .iter()
            .filter(|c| {
                candidate_node_ids(c)
                    .iter()
                    .any(|id| community.members.contains(id))
            })
            .map(candidate_score)
            .fold(0.0, f64::max);

        let mut summary = Candidate::new();
        summary.insert(
            "community_id".to_string(),
            json!(community.community_id),
        );
        summary.insert("member_count".to_string(), json!(community.members.len()));
        summary.insert("members".to_string(), json!(members));
        summary.insert("cross_community_edge_count".to_string(), json!(cross_edges));
        summary.insert("score".to_string(), json!(max_score));

        let mut cost = estimate_tokens(&serialize_candidate(&summary));
        if total_tokens + cost > budget.max_context_tokens {
            break;
        }
        let bridge_edges = collect_bridge_edges_for_community(
            component,
            &community.members,
            &partition.node_to_community,
        );
        if !bridge_edges.is_empty() {
            let mut enriched = summary.clone();
            enriched.insert("bridge_edges".to_string(), json!(bridge_edges));
            let enriched_cost = estimate_tokens(&serialize_candidate(&enriched));
            if total_tokens + enriched_cost <= budget.max_context_tokens {
                summary = enriched;
                cost = enriched_cost;
            }
        }
        if summaries.len() >= budget.max_results {
            break;
        }
        total_tokens += cost;
        summaries.push(summary);
    }
    summaries
}

/// Topology-aware truncation: whole connected components are admitted in
/// min-edge-score order; an oversized component is compressed to community
/// summaries (or PageRank-truncated when it will not partition); isolated
/// records fill the remainder.
pub fn truncate_context_topology(candidates: &[Candidate], budget: &TokenBudget) -> Vec<Candidate> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let paths = identify_connected_paths(candidates);
    let mut isolated: Vec<Vec<Candidate>> = Vec::new();
    let mut connected: Vec<Vec<Candidate>> = Vec::new();
    for path in paths {
        if path.len() == 1 {
            isolated.push(path);
        } else {
            connected.push(path);
        }
    }

    connected.sort_by(|a, b| {
        path_min_score(b)
            .partial_cmp(&path_min_score(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    isolated.sort_by(|a, b| {
        candidate_score(&b[0])
            .partial_cmp(&candidate_score(&a[0]))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut result: Vec<Candidate> = Vec::new();
    let mut total_tokens = 0usize;

    for path in connected {
        let cost = path_token_cost(&path);
        let remaining_budget = budget.max_context_tokens.saturating_sub(total_tokens);
        let remaining_results = budget.max_results.saturating_sub(result.len());
        if remaining_results == 0 {
            break;
        }
        if cost <= remaining_budget && path.len() <= remaining_results {
            total_tokens += cost;
            result.extend(path);
        } else if remaining_budget > 0 {
            let sub_budget = TokenBudget::new(remaining_budget, remaining_results);
            let compressed = compress_component_to_summaries(&path, &sub_budget);
            if compressed.is_empty() {
                let partial =
                    truncate_component_by_pagerank(&path, remaining_budget, remaining_results);
                total_tokens += path_token_cost(&partial);
                result.extend(partial);
            } else {
                total_tokens += path_token_cost(&compressed);
                result.extend(compressed);
            }
        }
    }

    for path in isolated {
        let cost = path_token_cost(&path);
        if total_tokens + cost > budget.max_context_tokens {
            break;
        }
        if result.len() >= budget.max_results {
            break;
        }
        total_tokens += cost;
        result.extend(path);
    }

    result
}
