//! Lattice Guard - Content Firewall and Tenant-Scope Enforcement
//!
//! Everything that stands between untrusted bytes and a prompt or a graph
//! query:
//! - layered content firewall (control chars, boundary tags, secrets,
//!   injection phrases, structural entropy)
//! - query/source sanitizers with hard input caps
//! - HMAC-minted context delimiters
//! - runtime tenant-scope session validation and ACL enforcement
//! - a build-time scanner that proves every graph-query constant in the
//!   source tree is tenant-scoped

mod delimiter;
mod firewall;
mod sanitizer;
mod scanner;
mod security;
mod session;

pub use delimiter::*;
pub use firewall::*;
pub use sanitizer::*;
pub use scanner::*;
pub use security::*;
pub use session::*;
