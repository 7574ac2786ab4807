//! Two-tier cache with node-tag invalidation.
//!
//! L1 is an in-process LRU; L2 is an optional shared store reached by exact
//! key GET (never SCAN). Entries carry (tenant_id, node_ids) tags and a
//! reverse index node_id -> {keys} makes node-targeted invalidation
//! O(|node_ids|). The reverse index is bounded by the same LRU: evicting an
//! entry removes it from every bucket it participated in.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use lattice_core::{LatticeResult, SecurityError};

use crate::key::TenantCacheKey;

// ============================================================================
// SHARED TIER SEAM
// ============================================================================

/// Payload stored in the shared tier. The tenant travels with the value so
/// the reader can enforce tenant equality regardless of who wrote it.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SharedCachePayload {
    pub tenant_id: String,
    pub value: serde_json::Value,
}

/// Shared cache store: exact-key operations only.
#[async_trait]
pub trait SharedCacheStore: Send + Sync {
    async fn get(&self, key: &str) -> LatticeResult<Option<SharedCachePayload>>;

    async fn put(&self, key: &str, payload: SharedCachePayload, ttl: Duration)
        -> LatticeResult<()>;

    async fn remove(&self, key: &str) -> LatticeResult<()>;
}

// ============================================================================
// L1 + TIERED CACHE
// ============================================================================

struct CacheEntry {
    value: serde_json::Value,
    tenant_id: String,
    node_ids: HashSet<String>,
    inserted_at: Instant,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
    node_index: HashMap<String, HashSet<String>>,
}

impl CacheInner {
    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        for node_id in &entry.node_ids {
            if let Some(bucket) = self.node_index.get_mut(node_id) {
                bucket.remove(key);
                if bucket.is_empty() {
                    self.node_index.remove(node_id);
                }
            }
        }
        Some(entry)
    }
}

/// The two-tier cache.
pub struct TieredCache {
    capacity: usize,
    ttl: Duration,
    inner: tokio::sync::Mutex<CacheInner>,
    shared: Option<std::sync::Arc<dyn SharedCacheStore>>,
}

impl TieredCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: tokio::sync::Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                node_index: HashMap::new(),
            }),
            shared: None,
        }
    }

    pub fn with_shared(mut self, shared: std::sync::Arc<dyn SharedCacheStore>) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Insert a value tagged with the node ids it was derived from.
    pub async fn put(
        &self,
        key: &TenantCacheKey,
        value: serde_json::Value,
        node_ids: impl IntoIterator<Item = String>,
    ) -> LatticeResult<()> {
        let encoded = key.encode();
        let node_ids: HashSet<String> = node_ids.into_iter().collect();
        {
            let mut inner = self.inner.lock().await;
            inner.remove_entry(&encoded);
            for node_id in &node_ids {
                inner
                    .node_index
                    .entry(node_id.clone())
                    .or_default()
                    .insert(encoded.clone());
            }
            inner.entries.insert(
                encoded.clone(),
                CacheEntry {
                    value: value.clone(),
                    tenant_id: key.tenant_id().to_string(),
                    node_ids,
                    inserted_at: Instant::now(),
                },
            );
            inner.order.push_back(encoded.clone());
            while inner.entries.len() > self.capacity {
                if let Some(oldest) = inner.order.front().cloned() {
                    inner.remove_entry(&oldest);
                }
            }
        }

        if let Some(shared) = &self.shared {
            shared
                .put(
                    &encoded,
                    SharedCachePayload {
                        tenant_id: key.tenant_id().to_string(),
                        value,
                    },
                    self.ttl,
                )
                .await?;
        }
        Ok(())
    }

    /// Look up a key: L1 first, then the shared tier (with tenant equality
    /// enforced on the stored payload before it is trusted).
    pub async fn get(&self, key: &TenantCacheKey) -> LatticeResult<Option<serde_json::Value>> {
        let encoded = key.encode();
        {
            let mut inner = self.inner.lock().await;
            let expired = matches!(
                inner.entries.get(&encoded),
                Some(entry) if entry.inserted_at.elapsed() > self.ttl
            );
            if expired {
                inner.remove_entry(&encoded);
            } else if let Some(entry) = inner.entries.get(&encoded) {
                if entry.tenant_id == key.tenant_id() {
                    return Ok(Some(entry.value.clone()));
                }
            }
        }

        if let Some(shared) = &self.shared {
            if let Some(payload) = shared.get(&encoded).await? {
                if payload.tenant_id != key.tenant_id() {
                    tracing::warn!(
                        expected = key.tenant_id(),
                        found = %payload.tenant_id,
                        "shared cache payload tenant mismatch, discarding"
                    );
                    return Ok(None);
                }
                return Ok(Some(payload.value));
            }
        }
        Ok(None)
    }

    /// Drop a single entry from both tiers.
    pub async fn invalidate(&self, key: &TenantCacheKey) -> LatticeResult<()> {
        let encoded = key.encode();
        self.inner.lock().await.remove_entry(&encoded);
        if let Some(shared) = &self.shared {
            shared.remove(&encoded).await?;
        }
        Ok(())
    }

    /// Drop every entry for a tenant. Empty tenant ids are refused — there
    /// is no such thing as a global wipe.
    pub async fn invalidate_tenant(&self, tenant_id: &str) -> LatticeResult<usize> {
        if tenant_id.is_empty() {
            return Err(SecurityError::IngestRejection {
                reason: "refusing cache wipe with empty tenant id".to_string(),
            }
            .into());
        }
        let keys: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .entries
                .iter()
                .filter(|(_, e)| e.tenant_id == tenant_id)
                .map(|(k, _)| k.clone())
                .collect()
        };
        let mut removed = 0usize;
        for key in keys {
            self.inner.lock().await.remove_entry(&key);
            if let Some(shared) = &self.shared {
                shared.remove(&key).await?;
            }
            removed += 1;
        }
        Ok(removed)
    }

    /// Drop every entry tagged with any of `node_ids`, in O(|node_ids|)
    /// bucket lookups.
    pub async fn invalidate_by_nodes(
        &self,
        node_ids: impl IntoIterator<Item = String>,
    ) -> LatticeResult<usize> {
        let keys: HashSet<String> = {
            let inner = self.inner.lock().await;
            node_ids
                .into_iter()
                .filter_map(|node_id| inner.node_index.get(&node_id).cloned())
                .flatten()
                .collect()
        };
        let mut removed = 0usize;
        for key in keys {
            self.inner.lock().await.remove_entry(&key);
            if let Some(shared) = &self.shared {
                shared.remove(&key).await?;
            }
            removed += 1;
        }
        Ok(removed)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(tenant: &str, digest: &str) -> TenantCacheKey {
        TenantCacheKey::new(tenant, "semantic", digest).unwrap()
    }

    fn cache() -> TieredCache {
        TieredCache::new(8, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let cache = cache();
        let k = key("tenant-a", "q1");
        cache.put(&k, json!({"answer": 1}), vec![]).await.unwrap();
        assert_eq!(cache.get(&k).await.unwrap(), Some(json!({"answer": 1})));
    }

    #[tokio::test]
    async fn test_node_tag_invalidation_is_targeted() {
        let cache = cache();
        let hit = key("tenant-a", "q-auth");
        let miss = key("tenant-a", "q-billing");
        cache
            .put(&hit, json!(1), vec!["auth".to_string()])
            .await
            .unwrap();
        cache
            .put(&miss, json!(2), vec!["billing".to_string()])
            .await
            .unwrap();

        let removed = cache
            .invalidate_by_nodes(vec!["auth".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.get(&hit).await.unwrap(), None);
        assert_eq!(cache.get(&miss).await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_tenant_invalidation_spares_other_tenants() {
        let cache = cache();
        let a = key("tenant-a", "q");
        let b = key("tenant-b", "q");
        cache.put(&a, json!("a"), vec![]).await.unwrap();
        cache.put(&b, json!("b"), vec![]).await.unwrap();
        cache.invalidate_tenant("tenant-a").await.unwrap();
        assert_eq!(cache.get(&a).await.unwrap(), None);
        assert_eq!(cache.get(&b).await.unwrap(), Some(json!("b")));
    }

    #[tokio::test]
    async fn test_empty_tenant_wipe_is_refused() {
        let cache = cache();
        let err = cache.invalidate_tenant("").await.unwrap_err();
        assert!(matches!(
            err,
            lattice_core::LatticeError::Security(SecurityError::IngestRejection { .. })
        ));
    }

    #[tokio::test]
    async fn test_lru_eviction_prunes_reverse_index() {
        let cache = TieredCache::new(2, Duration::from_secs(60));
        for i in 0..3 {
            let k = key("tenant-a", &format!("q{i}"));
            cache
                .put(&k, json!(i), vec![format!("node{i}")])
                .await
                .unwrap();
        }
        assert_eq!(cache.len().await, 2);
        // The evicted entry's tag bucket is gone: invalidating its node
        // removes nothing.
        let removed = cache
            .invalidate_by_nodes(vec!["node0".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = TieredCache::new(8, Duration::from_millis(10));
        let k = key("tenant-a", "q");
        cache.put(&k, json!(1), vec![]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get(&k).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_multi_tag_entry_invalidated_by_any_node() {
        let cache = cache();
        let k = key("tenant-a", "q");
        cache
            .put(&k, json!(1), vec!["auth".to_string(), "billing".to_string()])
            .await
            .unwrap();
        cache
            .invalidate_by_nodes(vec!["billing".to_string()])
            .await
            .unwrap();
        assert_eq!(cache.get(&k).await.unwrap(), None);
    }
}
