//! Lattice Resilience - Breakers, Locks, and Backpressure
//!
//! The failure-containment substrate shared by ingestion and retrieval:
//! - three-state circuit breakers with a per-tenant LRU registry and a
//!   global breaker that trips only on network-class failures
//! - a leased distributed lock with background heartbeat renewal
//! - an explicit bounded task set for per-commit background work

mod breaker;
mod lock;
mod tasks;

pub use breaker::*;
pub use lock::*;
pub use tasks::*;
