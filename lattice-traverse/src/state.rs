//! Traversal state.
//!
//! The state object is the contract: every strategy mutates it through
//! [`record_step`](TraversalState::record_step) and consults
//! [`should_continue`](TraversalState::should_continue), so the stop
//! conditions live in exactly one place.

use std::collections::HashSet;

use lattice_core::{count_tokens, TokenBudget, TraversalConfig};
use lattice_graph::Row;

/// One hop's outcome: the rows accepted and the frontier they opened.
#[derive(Debug, Clone, Default)]
pub struct TraversalStep {
    pub source_ids: Vec<String>,
    pub hop_number: usize,
    pub results: Vec<Row>,
    pub new_frontier: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TraversalState {
    pub visited_nodes: HashSet<String>,
    pub frontier: Vec<String>,
    pub accumulated_context: Vec<Row>,
    pub remaining_hops: usize,
    pub token_budget: TokenBudget,
    pub current_tokens: usize,
    max_visited: usize,
}

impl TraversalState {
    pub fn new(start_node_id: &str, config: &TraversalConfig, budget: TokenBudget) -> Self {
        Self {
            visited_nodes: HashSet::new(),
            frontier: vec![start_node_id.to_string()],
            accumulated_context: Vec::new(),
            remaining_hops: config.max_hops,
            token_budget: budget,
            current_tokens: 0,
            max_visited: config.max_visited,
        }
    }

    /// True while every bound still has headroom: hops, visited cap,
    /// non-empty frontier, token budget.
    pub fn should_continue(&self) -> bool {
        self.remaining_hops > 0
            && self.visited_nodes.len() < self.max_visited
            && !self.frontier.is_empty()
            && self.current_tokens < self.token_budget.max_context_tokens
    }

    /// Take the current frontier, deduplicated and with visited nodes
    /// excluded.
    pub fn drain_frontier(&mut self) -> Vec<String> {
        let mut seen = HashSet::new();
        let drained: Vec<String> = self
            .frontier
            .drain(..)
            .filter(|id| !self.visited_nodes.contains(id) && seen.insert(id.clone()))
            .collect();
        drained
    }

    /// Fold one hop into the state: mark sources visited, accumulate rows
    /// under the token budget, admit new frontier entries up to the visited
    /// cap.
    pub fn record_step(&mut self, step: TraversalStep) {
        for source in &step.source_ids {
            self.visited_nodes.insert(source.clone());
        }
        self.remaining_hops = self.remaining_hops.saturating_sub(1);

        for row in step.results {
            let cost = std::cmp::max(
                1,
                count_tokens(&serde_json::Value::Object(row.clone()).to_string()),
            );
            if self.current_tokens + cost > self.token_budget.max_context_tokens {
                break;
            }
            self.accumulated_context.push(row);
            self.current_tokens += cost;
        }

        for node_id in step.new_frontier {
            if !self.visited_nodes.contains(&node_id) && self.frontier.len() < self.max_visited {
                self.frontier.push(node_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> TraversalConfig {
        TraversalConfig::default()
    }

    fn row(id: &str) -> Row {
        let mut r = Row::new();
        r.insert("target_id".to_string(), json!(id));
        r
    }

    #[test]
    fn test_initial_state_continues() {
        let state = TraversalState::new("start", &config(), TokenBudget::default());
        assert!(state.should_continue());
    }

    #[test]
    fn test_stops_when_hops_exhausted() {
        let mut state = TraversalState::new("start", &config(), TokenBudget::default());
        for hop in 0..config().max_hops {
            state.record_step(TraversalStep {
                source_ids: vec![format!("n{hop}")],
                hop_number: hop,
                results: vec![],
                new_frontier: vec![format!("n{}", hop + 1)],
            });
        }
        assert_eq!(state.remaining_hops, 0);
        assert!(!state.should_continue());
    }

    #[test]
    fn test_stops_on_empty_frontier() {
        let mut state = TraversalState::new("start", &config(), TokenBudget::default());
        state.record_step(TraversalStep {
            source_ids: vec!["start".to_string()],
            hop_number: 0,
            results: vec![],
            new_frontier: vec![],
        });
        assert!(!state.should_continue());
    }

    #[test]
    fn test_token_budget_gates_accumulation() {
        let mut state = TraversalState::new("start", &config(), TokenBudget::new(5, 50));
        state.record_step(TraversalStep {
            source_ids: vec!["start".to_string()],
            hop_number: 0,
            results: (0..20).map(|i| row(&format!("n{i}"))).collect(),
            new_frontier: vec!["next".to_string()],
        });
        assert!(state.current_tokens <= 5);
        assert!(state.accumulated_context.len() < 20);
        assert!(!state.should_continue());
    }

    #[test]
    fn test_drain_frontier_dedupes_and_skips_visited() {
        let mut state = TraversalState::new("start", &config(), TokenBudget::default());
        state.visited_nodes.insert("seen".to_string());
        state.frontier = vec![
            "a".to_string(),
            "a".to_string(),
            "seen".to_string(),
            "b".to_string(),
        ];
        assert_eq!(state.drain_frontier(), vec!["a".to_string(), "b".to_string()]);
        assert!(state.frontier.is_empty());
    }
}
