//! External store seams.
//!
//! The graph database and the vector store are collaborators, not parts of
//! the core. The core talks to them through these async traits; drivers live
//! at the edges, mocks live in lattice-test-utils.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use lattice_core::LatticeResult;
use lattice_guard::QueryParams;

/// A result row from the graph driver.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Managed-transaction access to the property graph.
///
/// Implementations must provide MERGE/UNWIND semantics and retry transient
/// errors inside `execute_*` (the managed-transaction contract); anything
/// that escapes is either permanent or a network-class failure for the
/// circuit breaker to classify.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn execute_read(&self, query: &str, params: &QueryParams) -> LatticeResult<Vec<Row>>;

    async fn execute_write(&self, query: &str, params: &QueryParams) -> LatticeResult<Vec<Row>>;
}

/// An embedding row for vector upserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: String,
    pub vector: Vec<f32>,
}

/// Vector store operations the core requires. Eventual consistency with the
/// graph is acceptable; ordering is not assumed.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn delete(&self, collection: &str, ids: &[String]) -> LatticeResult<()>;

    async fn upsert(&self, collection: &str, embeddings: &[EmbeddingRecord]) -> LatticeResult<()>;
}
