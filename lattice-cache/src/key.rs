//! Tenant-scoped cache keys.
//!
//! The private inner struct makes cross-tenant cache access uncompilable:
//! a key cannot exist without a tenant id, and the encoded form leads with
//! the tenant so shared-store lookups are exact GETs, never scans.

use sha2::{Digest, Sha256};

use lattice_core::{LatticeResult, SecurityError};
use lattice_guard::AclParams;

const SEPARATOR: char = '\u{1}';

/// A cache key scoped to one tenant. Constructed only via [`new`](Self::new).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantCacheKey {
    inner: KeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct KeyInner {
    tenant_id: String,
    kind: String,
    digest: String,
}

impl TenantCacheKey {
    pub fn new(tenant_id: &str, kind: &str, digest: &str) -> LatticeResult<Self> {
        if tenant_id.is_empty() {
            return Err(SecurityError::IngestRejection {
                reason: "cache key requires a non-empty tenant id".to_string(),
            }
            .into());
        }
        Ok(Self {
            inner: KeyInner {
                tenant_id: tenant_id.to_string(),
                kind: kind.to_string(),
                digest: digest.to_string(),
            },
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.inner.tenant_id
    }

    /// Encoded form used by both tiers: `tenant␁kind␁digest`.
    pub fn encode(&self) -> String {
        format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.inner.tenant_id, self.inner.kind, self.inner.digest
        )
    }
}

/// Stable fingerprint of the caller's ACL identity. Two callers with
/// different visibility must never share a cache entry.
pub fn acl_fingerprint(acl: &AclParams) -> String {
    let mut namespaces = acl.acl_namespaces.clone();
    namespaces.sort();
    let material = format!(
        "admin={};team={};ns={}",
        acl.is_admin,
        acl.acl_team,
        namespaces.join(",")
    );
    hex::encode(Sha256::digest(material.as_bytes()))[..16].to_string()
}

/// Semantic-cache digest: hash of the query embedding bytes concatenated
/// with the ACL fingerprint.
pub fn embedding_digest(embedding: &[f32], acl: &AclParams) -> String {
    let mut hasher = Sha256::new();
    for value in embedding {
        hasher.update(value.to_le_bytes());
    }
    hasher.update(acl_fingerprint(acl).as_bytes());
    hex::encode(hasher.finalize())
}

/// Subgraph-cache digest: start node plus the traversal shape plus ACL.
pub fn subgraph_digest(start_node_id: &str, config_fingerprint: &str, acl: &AclParams) -> String {
    let mut hasher = Sha256::new();
    hasher.update(start_node_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(config_fingerprint.as_bytes());
    hasher.update([0u8]);
    hasher.update(acl_fingerprint(acl).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_requires_tenant() {
        assert!(TenantCacheKey::new("", "semantic", "abc").is_err());
        assert!(TenantCacheKey::new("tenant-a", "semantic", "abc").is_ok());
    }

    #[test]
    fn test_encoded_key_leads_with_tenant() {
        let key = TenantCacheKey::new("tenant-a", "semantic", "abc").unwrap();
        assert!(key.encode().starts_with("tenant-a\u{1}"));
    }

    #[test]
    fn test_acl_identity_changes_digest() {
        let embedding = vec![0.1_f32, 0.2, 0.3];
        let admin = embedding_digest(&embedding, &AclParams::admin());
        let team = embedding_digest(
            &embedding,
            &AclParams::for_team("payments", vec!["prod".to_string()]),
        );
        assert_ne!(admin, team);
    }

    #[test]
    fn test_acl_fingerprint_is_order_insensitive() {
        let a = AclParams::for_team("t", vec!["a".to_string(), "b".to_string()]);
        let b = AclParams::for_team("t", vec!["b".to_string(), "a".to_string()]);
        assert_eq!(acl_fingerprint(&a), acl_fingerprint(&b));
    }

    #[test]
    fn test_subgraph_digest_varies_by_start_node() {
        let acl = AclParams::admin();
        assert_ne!(
            subgraph_digest("auth", "hops=3", &acl),
            subgraph_digest("billing", "hops=3", &acl)
        );
    }
}
