//! Lattice Context - Context Assembly
//!
//! Turns ranked retrieval candidates into a token-bounded, injection-proof
//! prompt block: relevance ranking, connected-component analysis, PageRank
//! and bridge-aware truncation, community compression for oversized
//! components, and HMAC-fenced formatting with per-value sanitization.

mod format;
mod partition;
mod ranker;
mod topology;

pub use format::*;
pub use partition::*;
pub use ranker::*;
pub use topology::*;

/// A retrieval candidate: one record from the traversal engine or a query
/// template, as a flat JSON object.
pub type Candidate = serde_json::Map<String, serde_json::Value>;

/// Token estimate for a candidate's serialized form, floored at 1.
pub fn estimate_tokens(text: &str) -> usize {
    std::cmp::max(1, lattice_core::count_tokens(text))
}

/// Canonical serialization used for token accounting.
pub fn serialize_candidate(candidate: &Candidate) -> String {
    serde_json::Value::Object(candidate.clone()).to_string()
}

/// The node ids a candidate touches: (source, target) for edge records,
/// its own id otherwise.
pub fn candidate_node_ids(candidate: &Candidate) -> Vec<String> {
    let mut ids = Vec::new();
    for key in ["source", "target"] {
        if let Some(value) = candidate.get(key).and_then(|v| v.as_str()) {
            if !value.is_empty() {
                ids.push(value.to_string());
            }
        }
    }
    if ids.is_empty() {
        if let Some(id) = candidate.get("id").and_then(|v| v.as_str()) {
            if !id.is_empty() {
                ids.push(id.to_string());
            }
        }
    }
    ids
}
