//! Circuit breakers.
//!
//! A three-state breaker (Closed / Open / Half-Open) with jittered recovery,
//! a per-tenant LRU registry so one tenant's failures cannot open another
//! tenant's circuit, and a global provider breaker that trips only on
//! network-class failures.
//!
//! ```text
//! Closed --[failures >= threshold]--> Open
//! Open   --[elapsed >= recovery*(1±jitter)]--> Half-Open
//! Half-Open --[success]--> Closed
//! Half-Open --[failure]--> Open
//! ```

use dashmap::DashMap;
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lattice_core::{is_global_failure, LatticeError, LatticeResult, ResilienceError};

// ============================================================================
// STATE MACHINE
// ============================================================================

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Base interval before an open circuit admits a probe.
    pub recovery_timeout: Duration,
    /// Concurrent probes admitted while half-open.
    pub half_open_max_calls: u32,
    /// Randomization applied to the recovery deadline, in [0, 1].
    pub jitter_factor: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
            jitter_factor: 0.1,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    half_open_calls: u32,
    recovery_deadline: Option<Instant>,
}

/// A single breaker. State transitions are serialized under one lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                half_open_calls: 0,
                recovery_deadline: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Jittered recovery deadline computed when the circuit opens, so every
    /// replica recovers at a slightly different instant.
    fn jittered_deadline(&self, now: Instant) -> Instant {
        let jitter = self.config.jitter_factor.clamp(0.0, 1.0);
        let factor = if jitter == 0.0 {
            1.0
        } else {
            1.0 + jitter * (rand::rng().random_range(-1.0..1.0))
        };
        now + self.config.recovery_timeout.mul_f64(factor.max(0.0))
    }

    fn open_locked(&self, inner: &mut BreakerInner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.failure_count = 0;
        inner.half_open_calls = 0;
        inner.recovery_deadline = Some(self.jittered_deadline(now));
    }

    /// Current state, advancing Open to Half-Open when the deadline passed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.advance_locked(&mut inner, Instant::now());
        inner.state
    }

    fn advance_locked(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.state == CircuitState::Open {
            if let Some(deadline) = inner.recovery_deadline {
                if now >= deadline {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_calls = 0;
                    tracing::debug!(breaker = %self.name, "circuit half-open");
                }
            }
        }
    }

    /// Admission check. Reserves a probe slot when half-open.
    pub fn before_call(&self) -> LatticeResult<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.advance_locked(&mut inner, now);
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let retry_after = inner
                    .recovery_deadline
                    .map(|d| d.saturating_duration_since(now))
                    .unwrap_or(self.config.recovery_timeout);
                Err(ResilienceError::CircuitOpen { retry_after }.into())
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls >= self.config.half_open_max_calls {
                    return Err(ResilienceError::CircuitOpen {
                        retry_after: self.config.recovery_timeout,
                    }
                    .into());
                }
                inner.half_open_calls += 1;
                Ok(())
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.half_open_calls = 0;
        inner.recovery_deadline = None;
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::HalfOpen => {
                tracing::warn!(breaker = %self.name, "probe failed, reopening circuit");
                self.open_locked(&mut inner, now);
            }
            _ => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "failure threshold reached, opening circuit"
                    );
                    self.open_locked(&mut inner, now);
                }
            }
        }
    }

    /// Return an admitted probe slot without recording an outcome. Used when
    /// a call was admitted but never dispatched.
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state == CircuitState::HalfOpen && inner.half_open_calls > 0 {
            inner.half_open_calls -= 1;
        }
    }

    /// Run `fut` under the breaker.
    pub async fn call<F, T>(&self, fut: F) -> LatticeResult<T>
    where
        F: Future<Output = LatticeResult<T>>,
    {
        self.before_call()?;
        match fut.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    #[cfg(test)]
    fn force_recovery_due(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state == CircuitState::Open {
            inner.recovery_deadline = Some(Instant::now());
        }
    }
}

// ============================================================================
// PER-TENANT REGISTRY
// ============================================================================

/// tenant_id -> breaker, LRU-bounded so a churn of tenants cannot grow the
/// map without bound. Lookups ride the concurrent map; only the rare
/// over-capacity eviction scans for the least-recently-used slot.
pub struct TenantBreakerRegistry {
    capacity: usize,
    config: CircuitBreakerConfig,
    clock: AtomicU64,
    breakers: DashMap<String, BreakerSlot>,
}

struct BreakerSlot {
    breaker: Arc<CircuitBreaker>,
    last_used: AtomicU64,
}

impl TenantBreakerRegistry {
    pub fn new(capacity: usize, config: CircuitBreakerConfig) -> Self {
        Self {
            capacity: capacity.max(1),
            config,
            clock: AtomicU64::new(0),
            breakers: DashMap::new(),
        }
    }

    /// Fetch (or create) the breaker for a tenant, touching its LRU stamp.
    pub fn breaker_for(&self, tenant_id: &str) -> Arc<CircuitBreaker> {
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed);
        let breaker = {
            let slot = self
                .breakers
                .entry(tenant_id.to_string())
                .or_insert_with(|| BreakerSlot {
                    breaker: Arc::new(CircuitBreaker::new(
                        format!("tenant:{tenant_id}"),
                        self.config.clone(),
                    )),
                    last_used: AtomicU64::new(stamp),
                });
            slot.last_used.store(stamp, Ordering::Relaxed);
            Arc::clone(&slot.breaker)
        };

        while self.breakers.len() > self.capacity {
            self.evict_least_recent();
        }
        breaker
    }

    fn evict_least_recent(&self) {
        let mut oldest: Option<(String, u64)> = None;
        for entry in self.breakers.iter() {
            let used = entry.value().last_used.load(Ordering::Relaxed);
            if oldest.as_ref().map_or(true, |(_, min)| used < *min) {
                oldest = Some((entry.key().clone(), used));
            }
        }
        if let Some((tenant, _)) = oldest {
            self.breakers.remove(&tenant);
            tracing::debug!(tenant = %tenant, "evicted tenant breaker (LRU)");
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

// ============================================================================
// GLOBAL PROVIDER BREAKER
// ============================================================================

/// Wraps the per-tenant registry with a global breaker for the shared
/// network path.
///
/// The global breaker records a failure only when the error classifies as
/// network-class; any provider response — including a rate-limit error —
/// proves the network path and counts as global success. When the global
/// circuit is open every tenant short-circuits; when half-open, only
/// `half_open_max_calls` concurrent probes go through.
pub struct GlobalProviderBreaker {
    registry: TenantBreakerRegistry,
    global: CircuitBreaker,
}

impl GlobalProviderBreaker {
    pub fn new(
        registry_capacity: usize,
        tenant_config: CircuitBreakerConfig,
        global_config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            registry: TenantBreakerRegistry::new(registry_capacity, tenant_config),
            global: CircuitBreaker::new("provider:global", global_config),
        }
    }

    pub fn global_state(&self) -> CircuitState {
        self.global.state()
    }

    pub fn tenant_state(&self, tenant_id: &str) -> CircuitState {
        self.registry.breaker_for(tenant_id).state()
    }

    pub async fn call<F, T>(&self, tenant_id: &str, fut: F) -> LatticeResult<T>
    where
        F: Future<Output = LatticeResult<T>>,
    {
        self.global.before_call()?;
        let tenant_breaker = self.registry.breaker_for(tenant_id);
        if let Err(err) = tenant_breaker.before_call() {
            // The tenant circuit refused before any request was dispatched;
            // nothing was learned about the shared network path.
            self.global.release_probe();
            return Err(err);
        }

        match fut.await {
            Ok(value) => {
                tenant_breaker.record_success();
                self.global.record_success();
                Ok(value)
            }
            Err(err) => {
                tenant_breaker.record_failure();
                if is_global_failure(&err) {
                    self.global.record_failure();
                } else {
                    self.global.record_success();
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::StoreError;

    fn fast_config(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(10),
            half_open_max_calls: 1,
            jitter_factor: 0.0,
        }
    }

    fn network_err<T>() -> LatticeResult<T> {
        Err(StoreError::Unavailable {
            message: "connection refused".to_string(),
        }
        .into())
    }

    fn rate_limit_err<T>() -> LatticeResult<T> {
        Err(StoreError::RateLimited {
            message: "429".to_string(),
        }
        .into())
    }

    #[tokio::test]
    async fn test_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new("test", fast_config(2));
        assert_eq!(breaker.state(), CircuitState::Closed);
        let _ = breaker.call(async { network_err::<()>() }).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        let _ = breaker.call(async { network_err::<()>() }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker.call(async { Ok(()) }).await.unwrap_err();
        assert!(matches!(
            err,
            LatticeError::Resilience(ResilienceError::CircuitOpen { .. })
        ));
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let breaker = CircuitBreaker::new("test", fast_config(1));
        let _ = breaker.call(async { network_err::<()>() }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.force_recovery_due();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.call(async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", fast_config(1));
        let _ = breaker.call(async { network_err::<()>() }).await;
        breaker.force_recovery_due();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let _ = breaker.call(async { network_err::<()>() }).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_probe_cap() {
        let breaker = CircuitBreaker::new("test", fast_config(1));
        let _ = breaker.call(async { network_err::<()>() }).await;
        breaker.force_recovery_due();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // First probe slot is admitted and held open.
        breaker.before_call().unwrap();
        // Second concurrent probe exceeds half_open_max_calls = 1.
        assert!(breaker.before_call().is_err());
    }

    #[test]
    fn test_registry_is_lru_bounded() {
        let registry = TenantBreakerRegistry::new(2, fast_config(3));
        let a = registry.breaker_for("a");
        let _b = registry.breaker_for("b");
        // Touch a so b becomes the eviction candidate.
        let a_again = registry.breaker_for("a");
        assert!(Arc::ptr_eq(&a, &a_again));
        let _c = registry.breaker_for("c");
        assert_eq!(registry.len(), 2);
        // b was evicted; a survives with identity intact.
        assert!(Arc::ptr_eq(&a, &registry.breaker_for("a")));
    }

    #[test]
    fn test_tenant_isolation_in_registry() {
        let registry = TenantBreakerRegistry::new(16, fast_config(1));
        let a = registry.breaker_for("tenant-a");
        a.record_failure();
        assert_eq!(a.state(), CircuitState::Open);
        assert_eq!(registry.breaker_for("tenant-b").state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_global_breaker_ignores_rate_limits() {
        let provider = GlobalProviderBreaker::new(16, fast_config(10), fast_config(2));
        for _ in 0..5 {
            let _ = provider.call("tenant-a", async { rate_limit_err::<()>() }).await;
        }
        assert_eq!(provider.global_state(), CircuitState::Closed);
        // Other tenants keep working.
        provider.call("tenant-b", async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn test_global_breaker_trips_on_network_errors() {
        let provider = GlobalProviderBreaker::new(16, fast_config(10), fast_config(2));
        let _ = provider.call("tenant-a", async { network_err::<()>() }).await;
        let _ = provider.call("tenant-a", async { network_err::<()>() }).await;
        assert_eq!(provider.global_state(), CircuitState::Open);

        // Tenant B is short-circuited even though its own breaker is closed.
        let err = provider.call("tenant-b", async { Ok(()) }).await.unwrap_err();
        assert!(matches!(
            err,
            LatticeError::Resilience(ResilienceError::CircuitOpen { .. })
        ));
    }
}
