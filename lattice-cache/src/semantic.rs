//! Named cache fronts over the tiered store.
//!
//! Semantic cache: retrieval results keyed by query-embedding hash plus the
//! caller's ACL fingerprint. Subgraph cache: traversal results keyed by
//! start node plus the traversal shape. Both carry node tags so ingestion
//! evicts exactly what it invalidated.

use std::sync::Arc;

use lattice_core::LatticeResult;
use lattice_guard::AclParams;

use crate::key::{embedding_digest, subgraph_digest, TenantCacheKey};
use crate::tiered::TieredCache;

/// Results of semantically-similar queries, shared across identical ACL
/// identities only.
pub struct SemanticCache {
    inner: Arc<TieredCache>,
}

impl SemanticCache {
    pub fn new(inner: Arc<TieredCache>) -> Self {
        Self { inner }
    }

    fn key(
        &self,
        tenant_id: &str,
        embedding: &[f32],
        acl: &AclParams,
    ) -> LatticeResult<TenantCacheKey> {
        TenantCacheKey::new(tenant_id, "semantic", &embedding_digest(embedding, acl))
    }

    pub async fn get(
        &self,
        tenant_id: &str,
        embedding: &[f32],
        acl: &AclParams,
    ) -> LatticeResult<Option<serde_json::Value>> {
        let key = self.key(tenant_id, embedding, acl)?;
        self.inner.get(&key).await
    }

    pub async fn put(
        &self,
        tenant_id: &str,
        embedding: &[f32],
        acl: &AclParams,
        value: serde_json::Value,
        node_ids: impl IntoIterator<Item = String>,
    ) -> LatticeResult<()> {
        let key = self.key(tenant_id, embedding, acl)?;
        self.inner.put(&key, value, node_ids).await
    }
}

/// Traversal result cache keyed by (start node, traversal shape, ACL).
pub struct SubgraphCache {
    inner: Arc<TieredCache>,
}

impl SubgraphCache {
    pub fn new(inner: Arc<TieredCache>) -> Self {
        Self { inner }
    }

    fn key(
        &self,
        tenant_id: &str,
        start_node_id: &str,
        config_fingerprint: &str,
        acl: &AclParams,
    ) -> LatticeResult<TenantCacheKey> {
        TenantCacheKey::new(
            tenant_id,
            "subgraph",
            &subgraph_digest(start_node_id, config_fingerprint, acl),
        )
    }

    pub async fn get(
        &self,
        tenant_id: &str,
        start_node_id: &str,
        config_fingerprint: &str,
        acl: &AclParams,
    ) -> LatticeResult<Option<serde_json::Value>> {
        let key = self.key(tenant_id, start_node_id, config_fingerprint, acl)?;
        self.inner.get(&key).await
    }

    pub async fn put(
        &self,
        tenant_id: &str,
        start_node_id: &str,
        config_fingerprint: &str,
        acl: &AclParams,
        value: serde_json::Value,
        node_ids: impl IntoIterator<Item = String>,
    ) -> LatticeResult<()> {
        let key = self.key(tenant_id, start_node_id, config_fingerprint, acl)?;
        self.inner.put(&key, value, node_ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn tiered() -> Arc<TieredCache> {
        Arc::new(TieredCache::new(16, Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn test_semantic_cache_isolates_acl_identities() {
        let cache = SemanticCache::new(tiered());
        let embedding = vec![0.1_f32, 0.2, 0.3];
        let admin = AclParams::admin();
        let team = AclParams::for_team("payments", vec!["prod".to_string()]);

        cache
            .put("tenant-a", &embedding, &admin, json!("admin-view"), vec![])
            .await
            .unwrap();
        assert_eq!(
            cache.get("tenant-a", &embedding, &admin).await.unwrap(),
            Some(json!("admin-view"))
        );
        // Same embedding, different visibility: miss.
        assert_eq!(cache.get("tenant-a", &embedding, &team).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_subgraph_cache_evicts_on_node_invalidation() {
        let inner = tiered();
        let cache = SubgraphCache::new(Arc::clone(&inner));
        let acl = AclParams::admin();
        cache
            .put(
                "tenant-a",
                "auth",
                "hops=3,beam=50",
                &acl,
                json!(["auth", "billing"]),
                vec!["auth".to_string(), "billing".to_string()],
            )
            .await
            .unwrap();

        inner
            .invalidate_by_nodes(vec!["billing".to_string()])
            .await
            .unwrap();
        assert_eq!(
            cache
                .get("tenant-a", "auth", "hops=3,beam=50", &acl)
                .await
                .unwrap(),
            None
        );
    }
}
