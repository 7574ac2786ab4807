//! Token counting and context budgets.
//!
//! Accurate counting uses the cl100k_base BPE when the tokenizer initializes;
//! otherwise a `len/4` heuristic. The fast estimator is for tight loops only
//! (streaming caps, per-record accumulation guards).

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;

static ENCODER: Lazy<Option<CoreBPE>> = Lazy::new(|| match tiktoken_rs::cl100k_base() {
    Ok(enc) => Some(enc),
    Err(err) => {
        tracing::debug!(%err, "cl100k_base unavailable, falling back to heuristic");
        None
    }
});

/// Count tokens in `text`, accurately when the tokenizer is available.
pub fn count_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    match ENCODER.as_ref() {
        Some(enc) => enc.encode_with_special_tokens(text).len(),
        None => estimate_tokens_fast(text),
    }
}

/// Heuristic estimate: `max(1, len/4)`. Never allocates, never suspends.
pub fn estimate_tokens_fast(text: &str) -> usize {
    std::cmp::max(1, text.len() / 4)
}

/// Per-request context ceilings carried through retrieval and assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBudget {
    pub max_context_tokens: usize,
    pub max_results: usize,
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self {
            max_context_tokens: 32_000,
            max_results: 50,
        }
    }
}

impl TokenBudget {
    pub fn new(max_context_tokens: usize, max_results: usize) -> Self {
        Self {
            max_context_tokens,
            max_results,
        }
    }

    /// Derive a sub-budget for a component once part of the budget is spent.
    pub fn remaining(&self, tokens_used: usize, results_used: usize) -> Self {
        Self {
            max_context_tokens: self.max_context_tokens.saturating_sub(tokens_used),
            max_results: self.max_results.saturating_sub(results_used),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_counts_zero() {
        assert_eq!(count_tokens(""), 0);
    }

    #[test]
    fn test_count_is_positive_for_nonempty() {
        assert!(count_tokens("hello world") >= 1);
    }

    #[test]
    fn test_fast_estimate_floor() {
        assert_eq!(estimate_tokens_fast("ab"), 1);
        assert_eq!(estimate_tokens_fast(&"x".repeat(400)), 100);
    }

    #[test]
    fn test_budget_remaining_saturates() {
        let budget = TokenBudget::default();
        let sub = budget.remaining(40_000, 10);
        assert_eq!(sub.max_context_tokens, 0);
        assert_eq!(sub.max_results, 40);
    }
}
