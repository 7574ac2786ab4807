//! Distributed lock with heartbeat renewal.
//!
//! The lock is a leased key owned by a unique token. Acquisition is a
//! set-if-absent with TTL; renewal and release are owner-checked
//! compare-and-set operations so a lock that expired and was re-acquired by
//! another holder can never be extended or deleted by the original owner.
//! A background heartbeat renews at an interval well below the TTL and is
//! stopped on every release path, including drop during cancellation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use lattice_core::{LatticeResult, LockConfig, ResilienceError};

// ============================================================================
// BACKEND SEAM
// ============================================================================

/// Redis-compatible lock primitive: SETNX+PX acquire, owner-checked renew
/// and release (eval scripts on the Redis implementation).
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Acquire `key` for `token` with `ttl`. Returns false when held.
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> LatticeResult<bool>;

    /// Extend the lease only if `token` still owns the key.
    async fn renew_if_owner(&self, key: &str, token: &str, ttl: Duration) -> LatticeResult<bool>;

    /// Delete the key only if `token` still owns it.
    async fn release_if_owner(&self, key: &str, token: &str) -> LatticeResult<bool>;
}

/// In-process backend for tests and single-node development.
#[derive(Debug, Default)]
pub struct InMemoryLockBackend {
    entries: tokio::sync::Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> LatticeResult<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get(key) {
            Some((_, expires)) if *expires > now => Ok(false),
            _ => {
                entries.insert(key.to_string(), (token.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn renew_if_owner(&self, key: &str, token: &str, ttl: Duration) -> LatticeResult<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get_mut(key) {
            Some((owner, expires)) if owner == token && *expires > now => {
                *expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_if_owner(&self, key: &str, token: &str) -> LatticeResult<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((owner, _)) if owner == token => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ============================================================================
// REDIS BACKEND (feature = "redis")
// ============================================================================

#[cfg(feature = "redis")]
mod redis_backend {
    use super::*;
    use lattice_core::StoreError;

    const RENEW_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
  return redis.call('pexpire', KEYS[1], ARGV[2])
else
  return 0
end"#;

    const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
  return redis.call('del', KEYS[1])
else
  return 0
end"#;

    fn map_err(err: redis::RedisError) -> lattice_core::LatticeError {
        if err.is_connection_refusal() || err.is_timeout() || err.is_io_error() {
            StoreError::Unavailable {
                message: err.to_string(),
            }
            .into()
        } else {
            StoreError::Driver {
                message: err.to_string(),
            }
            .into()
        }
    }

    /// Lock backend over a Redis-compatible server.
    pub struct RedisLockBackend {
        client: redis::Client,
    }

    impl RedisLockBackend {
        pub fn new(url: &str) -> LatticeResult<Self> {
            let client = redis::Client::open(url).map_err(map_err)?;
            Ok(Self { client })
        }
    }

    #[async_trait]
    impl LockBackend for RedisLockBackend {
        async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> LatticeResult<bool> {
            let mut conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(map_err)?;
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(token)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(reply.is_some())
        }

        async fn renew_if_owner(
            &self,
            key: &str,
            token: &str,
            ttl: Duration,
        ) -> LatticeResult<bool> {
            let mut conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(map_err)?;
            let renewed: i64 = redis::Script::new(RENEW_SCRIPT)
                .key(key)
                .arg(token)
                .arg(ttl.as_millis() as u64)
                .invoke_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(renewed == 1)
        }

        async fn release_if_owner(&self, key: &str, token: &str) -> LatticeResult<bool> {
            let mut conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(map_err)?;
            let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
                .key(key)
                .arg(token)
                .invoke_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(deleted == 1)
        }
    }
}

#[cfg(feature = "redis")]
pub use redis_backend::RedisLockBackend;

// ============================================================================
// LOCK GUARD
// ============================================================================

/// Key for the per-(tenant, namespace) ingestion lock.
pub fn ingestion_lock_key(tenant_id: &str, namespace: &str) -> String {
    format!("ingest:{tenant_id}:{namespace}")
}

/// An acquired distributed lock.
///
/// Holds a heartbeat task renewing the lease; `release()` (or drop) stops
/// the heartbeat and issues an owner-checked delete. Dropping without an
/// explicit release spawns the delete best-effort.
pub struct DistributedLock {
    backend: Arc<dyn LockBackend>,
    key: String,
    token: String,
    heartbeat: Option<tokio::task::JoinHandle<()>>,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish()
    }
}

impl DistributedLock {
    /// Try to acquire `key` once. On success the heartbeat starts
    /// immediately.
    pub async fn acquire(
        backend: Arc<dyn LockBackend>,
        key: impl Into<String>,
        config: &LockConfig,
    ) -> LatticeResult<Self> {
        let key = key.into();
        let token = Uuid::now_v7().to_string();
        if !backend.acquire(&key, &token, config.ttl).await? {
            return Err(ResilienceError::LockUnavailable { key }.into());
        }

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&backend),
            key.clone(),
            token.clone(),
            config.ttl,
            config.heartbeat_interval,
        ));

        tracing::debug!(key = %key, "distributed lock acquired");
        Ok(Self {
            backend,
            key,
            token,
            heartbeat: Some(heartbeat),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stop the heartbeat and release the lock if still owned.
    pub async fn release(mut self) -> LatticeResult<()> {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        let released = self
            .backend
            .release_if_owner(&self.key, &self.token)
            .await?;
        if !released {
            tracing::warn!(key = %self.key, "lock already expired at release");
        }
        Ok(())
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
            // Best-effort release when dropped without an explicit release
            // (cancellation paths). Ownership is still verified server-side.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let backend = Arc::clone(&self.backend);
                let key = std::mem::take(&mut self.key);
                let token = std::mem::take(&mut self.token);
                handle.spawn(async move {
                    let _ = backend.release_if_owner(&key, &token).await;
                });
            }
        }
    }
}

async fn heartbeat_loop(
    backend: Arc<dyn LockBackend>,
    key: String,
    token: String,
    ttl: Duration,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so the initial lease ages
    // normally.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match backend.renew_if_owner(&key, &token, ttl).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(key = %key, "lock ownership lost, stopping heartbeat");
                break;
            }
            Err(err) => {
                tracing::warn!(key = %key, %err, "lock heartbeat renewal failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::LatticeError;

    fn test_config() -> LockConfig {
        LockConfig {
            redis_url: String::new(),
            ttl: Duration::from_millis(200),
            heartbeat_interval: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_second_acquire_refused() {
        let backend: Arc<dyn LockBackend> = Arc::new(InMemoryLockBackend::new());
        let config = test_config();
        let lock = DistributedLock::acquire(Arc::clone(&backend), "ingest:a:prod", &config)
            .await
            .unwrap();

        let err = DistributedLock::acquire(Arc::clone(&backend), "ingest:a:prod", &config)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LatticeError::Resilience(ResilienceError::LockUnavailable { .. })
        ));

        lock.release().await.unwrap();
        DistributedLock::acquire(backend, "ingest:a:prod", &config)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_keys_do_not_contend() {
        let backend: Arc<dyn LockBackend> = Arc::new(InMemoryLockBackend::new());
        let config = test_config();
        let _a = DistributedLock::acquire(Arc::clone(&backend), "ingest:a:prod", &config)
            .await
            .unwrap();
        let _b = DistributedLock::acquire(backend, "ingest:b:prod", &config)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_outlives_ttl() {
        let backend: Arc<dyn LockBackend> = Arc::new(InMemoryLockBackend::new());
        let config = test_config();
        let lock = DistributedLock::acquire(Arc::clone(&backend), "ingest:a:prod", &config)
            .await
            .unwrap();

        // Sleep past several TTLs; the heartbeat keeps the lease alive.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!backend
            .acquire("ingest:a:prod", "intruder", config.ttl)
            .await
            .unwrap());
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_is_owner_checked() {
        let backend = InMemoryLockBackend::new();
        assert!(backend
            .acquire("k", "owner-1", Duration::from_secs(5))
            .await
            .unwrap());
        // A non-owner cannot release or renew.
        assert!(!backend.release_if_owner("k", "owner-2").await.unwrap());
        assert!(!backend
            .renew_if_owner("k", "owner-2", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(backend.release_if_owner("k", "owner-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_drop_releases_best_effort() {
        let backend: Arc<dyn LockBackend> = Arc::new(InMemoryLockBackend::new());
        let config = test_config();
        {
            let _lock = DistributedLock::acquire(Arc::clone(&backend), "ingest:a:prod", &config)
                .await
                .unwrap();
        }
        // Give the spawned release a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(backend
            .acquire("ingest:a:prod", "next", config.ttl)
            .await
            .unwrap());
    }
}
