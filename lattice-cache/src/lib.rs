//! Lattice Cache - Tenant-Scoped Query Caches
//!
//! Two-tier caching for retrieval results: an in-process LRU front and an
//! optional shared store behind it. Every entry is tagged with its tenant
//! and the graph node ids it was derived from, so an ingestion that touches
//! node N evicts exactly the entries built on N — no global wipes, ever.

mod key;
mod semantic;
mod tiered;

pub use key::*;
pub use semantic::*;
pub use tiered::*;
