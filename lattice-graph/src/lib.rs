//! Lattice Graph - Ontology-Driven Write Layer
//!
//! Batched upserts against the labeled property graph with deterministic
//! ordering, per-type concurrency, content-hash idempotency, hot-edge
//! serialization, and edge tombstoning. Statements are generated from the
//! ontology so custom ontologies flow through every write path. Also home to
//! the external store seams and the vector-sync outbox.

mod ontology;
mod outbox;
mod repository;
mod resolver;
mod routing;
mod schema;
mod store;

pub use ontology::*;
pub use outbox::*;
pub use repository::*;
pub use resolver::*;
pub use routing::*;
pub use schema::*;
pub use store::*;
