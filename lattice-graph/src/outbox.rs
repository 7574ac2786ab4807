//! Vector-sync outbox.
//!
//! Tombstoned graph entities must eventually disappear from the vector
//! store. Cleanup events ride an outbox with three fronts:
//! - in-memory: fast, lost on restart (development fallback);
//! - durable: events persisted as internal `OutboxEvent` graph nodes,
//!   claimed atomically by worker id and lease — restarts lose nothing;
//! - coalescing: a bounded front that merges same-collection events and
//!   spills the oldest into the durable outbox before dropping anything.
//!
//! Draining takes durable events FIRST so a crash-then-restart never
//! starves persisted work behind fresh in-memory entries.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use lattice_core::{LatticeResult, OutboxConfig};
use lattice_guard::QueryParams;

use crate::store::{GraphStore, VectorStore};

// ============================================================================
// EVENT
// ============================================================================

/// One pending vector-store cleanup: delete `pruned_ids` from `collection`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VectorSyncEvent {
    pub event_id: String,
    pub collection: String,
    pub pruned_ids: Vec<String>,
    pub tenant_id: String,
    pub tombstoned_at: String,
    #[serde(default)]
    pub retry_count: u32,
}

impl VectorSyncEvent {
    pub fn new(collection: &str, pruned_ids: Vec<String>, tenant_id: &str) -> Self {
        Self {
            event_id: Uuid::now_v7().to_string(),
            collection: collection.to_string(),
            pruned_ids,
            tenant_id: tenant_id.to_string(),
            tombstoned_at: Utc::now().to_rfc3339(),
            retry_count: 0,
        }
    }
}

/// Anything that can accept an outbox event (used as the spillover target).
#[async_trait]
pub trait OutboxSink: Send + Sync {
    async fn write_event(&self, event: VectorSyncEvent) -> LatticeResult<()>;
}

// ============================================================================
// IN-MEMORY OUTBOX
// ============================================================================

/// FIFO queue under a lock. Observable pending count for backpressure;
/// contents are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryOutbox {
    queue: Mutex<VecDeque<VectorSyncEvent>>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, event: VectorSyncEvent) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(event);
    }

    pub fn drain_all(&self) -> Vec<VectorSyncEvent> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl OutboxSink for InMemoryOutbox {
    async fn write_event(&self, event: VectorSyncEvent) -> LatticeResult<()> {
        self.enqueue(event);
        Ok(())
    }
}

// ============================================================================
// DURABLE OUTBOX
// ============================================================================

/// Outbox persisted as `OutboxEvent` graph nodes (indexed tombstoned_at).
/// All operations are single statements; claiming is one atomic server-side
/// round trip — never a SCAN on the hot path.
pub struct DurableOutbox {
    store: Arc<dyn GraphStore>,
}

impl DurableOutbox {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    fn event_from_row(row: &crate::store::Row) -> Option<VectorSyncEvent> {
        let value = row.get("event")?.clone();
        serde_json::from_value(value).ok()
    }

    /// Load unclaimed (or lease-expired) events without claiming them.
    pub async fn load_pending(&self, limit: usize) -> LatticeResult<Vec<VectorSyncEvent>> {
        let query = "MATCH (e:OutboxEvent) \
                     WHERE e.claimed_by IS NULL OR e.claim_expires_at < $now \
                     RETURN e {.*} AS event \
                     ORDER BY e.tombstoned_at \
                     LIMIT $limit";
        let mut params = QueryParams::new();
        params.insert("now".to_string(), Utc::now().to_rfc3339().into());
        params.insert("limit".to_string(), (limit as u64).into());
        let rows = self.store.execute_read(query, &params).await?;
        Ok(rows.iter().filter_map(Self::event_from_row).collect())
    }

    /// Atomically claim up to `limit` pending events for `worker_id`.
    pub async fn claim_pending(
        &self,
        worker_id: &str,
        limit: usize,
        lease_seconds: u64,
    ) -> LatticeResult<Vec<VectorSyncEvent>> {
        let query = "MATCH (e:OutboxEvent) \
                     WHERE e.claimed_by IS NULL OR e.claim_expires_at < $now \
                     WITH e ORDER BY e.tombstoned_at LIMIT $limit \
                     SET e.claimed_by = $worker_id, e.claim_expires_at = $expires \
                     RETURN e {.*} AS event";
        let now = Utc::now();
        let mut params = QueryParams::new();
        params.insert("now".to_string(), now.to_rfc3339().into());
        params.insert("limit".to_string(), (limit as u64).into());
        params.insert("worker_id".to_string(), worker_id.into());
        params.insert(
            "expires".to_string(),
            (now + chrono::Duration::seconds(lease_seconds as i64))
                .to_rfc3339()
                .into(),
        );
        let rows = self.store.execute_write(query, &params).await?;
        Ok(rows.iter().filter_map(Self::event_from_row).collect())
    }

    pub async fn delete_event(&self, event_id: &str) -> LatticeResult<()> {
        let query = "MATCH (e:OutboxEvent {event_id: $event_id}) DETACH DELETE e";
        let mut params = QueryParams::new();
        params.insert("event_id".to_string(), event_id.into());
        self.store.execute_write(query, &params).await?;
        Ok(())
    }

    /// Bump the retry count and release the claim so another worker can
    /// pick the event up after the backoff.
    pub async fn update_retry_count(&self, event_id: &str, retry_count: u32) -> LatticeResult<()> {
        let query = "MATCH (e:OutboxEvent {event_id: $event_id}) \
                     SET e.retry_count = $retry_count, \
                     e.claimed_by = null, e.claim_expires_at = null";
        let mut params = QueryParams::new();
        params.insert("event_id".to_string(), event_id.into());
        params.insert("retry_count".to_string(), retry_count.into());
        self.store.execute_write(query, &params).await?;
        Ok(())
    }
}

#[async_trait]
impl OutboxSink for DurableOutbox {
    async fn write_event(&self, event: VectorSyncEvent) -> LatticeResult<()> {
        let query = "MERGE (e:OutboxEvent {event_id: $event_id}) \
                     SET e.collection = $collection, e.pruned_ids = $pruned_ids, \
                     e.tenant_id = $tenant_id, e.tombstoned_at = $tombstoned_at, \
                     e.retry_count = $retry_count";
        let mut params = QueryParams::new();
        params.insert("event_id".to_string(), event.event_id.clone().into());
        params.insert("collection".to_string(), event.collection.clone().into());
        params.insert(
            "pruned_ids".to_string(),
            serde_json::Value::Array(
                event
                    .pruned_ids
                    .iter()
                    .map(|id| serde_json::Value::String(id.clone()))
                    .collect(),
            ),
        );
        params.insert("tenant_id".to_string(), event.tenant_id.clone().into());
        params.insert(
            "tombstoned_at".to_string(),
            event.tombstoned_at.clone().into(),
        );
        params.insert("retry_count".to_string(), event.retry_count.into());
        self.store.execute_write(query, &params).await?;
        Ok(())
    }
}

// ============================================================================
// COALESCING OUTBOX
// ============================================================================

/// Bounded front for the outbox. Same-tenant same-collection events merge
/// their id sets; overflow rescues the oldest entries into the spillover
/// sink (the durable outbox in production) BEFORE dropping them.
pub struct CoalescingOutbox {
    max_entries: usize,
    queue: tokio::sync::Mutex<VecDeque<VectorSyncEvent>>,
    spillover: Option<Arc<dyn OutboxSink>>,
}

impl CoalescingOutbox {
    pub fn new(max_entries: usize, spillover: Option<Arc<dyn OutboxSink>>) -> Self {
        Self {
            max_entries: max_entries.max(1),
            queue: tokio::sync::Mutex::new(VecDeque::new()),
            spillover,
        }
    }

    pub async fn enqueue(&self, event: VectorSyncEvent) -> LatticeResult<()> {
        let overflow = {
            let mut queue = self.queue.lock().await;
            if let Some(existing) = queue
                .iter_mut()
                .find(|e| e.tenant_id == event.tenant_id && e.collection == event.collection)
            {
                for id in event.pruned_ids {
                    if !existing.pruned_ids.contains(&id) {
                        existing.pruned_ids.push(id);
                    }
                }
                return Ok(());
            }
            queue.push_back(event);
            let mut spilled = Vec::new();
            while queue.len() > self.max_entries {
                if let Some(oldest) = queue.pop_front() {
                    spilled.push(oldest);
                }
            }
            spilled
        };

        for event in overflow {
            match &self.spillover {
                Some(sink) => sink.write_event(event).await?,
                None => {
                    tracing::warn!(
                        event_id = %event.event_id,
                        "coalescing outbox overflow with no spillover sink; event dropped"
                    );
                }
            }
        }
        Ok(())
    }

    pub async fn drain_all(&self) -> Vec<VectorSyncEvent> {
        self.queue.lock().await.drain(..).collect()
    }

    pub async fn pending_count(&self) -> usize {
        self.queue.lock().await.len()
    }
}

// ============================================================================
// DRAIN
// ============================================================================

/// Drain durable events first, then in-memory. Each event issues a vector
/// delete; failures log WARN, bump the retry count, and leave the event for
/// a later pass (durable) or requeue it (memory).
pub async fn drain_vector_outbox(
    durable: Option<&DurableOutbox>,
    memory: &InMemoryOutbox,
    vector_store: &dyn VectorStore,
    worker_id: &str,
    config: &OutboxConfig,
) -> LatticeResult<usize> {
    let mut drained = 0usize;

    if let Some(durable) = durable {
        let claimed = durable
            .claim_pending(worker_id, config.claim_limit, config.claim_lease.as_secs())
            .await?;
        for event in claimed {
            match vector_store.delete(&event.collection, &event.pruned_ids).await {
                Ok(()) => {
                    durable.delete_event(&event.event_id).await?;
                    drained += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        event_id = %event.event_id,
                        %err,
                        "vector delete failed for durable event"
                    );
                    durable
                        .update_retry_count(&event.event_id, event.retry_count + 1)
                        .await?;
                }
            }
        }
    }

    for mut event in memory.drain_all() {
        match vector_store.delete(&event.collection, &event.pruned_ids).await {
            Ok(()) => drained += 1,
            Err(err) => {
                tracing::warn!(
                    event_id = %event.event_id,
                    %err,
                    "vector delete failed for in-memory event, requeueing"
                );
                event.retry_count += 1;
                memory.enqueue(event);
            }
        }
    }

    Ok(drained)
}

// ============================================================================
// PERIODIC DRAINER
// ============================================================================

/// Interval-driven drainer that can also be prompted after a commit via
/// [`notify`](Self::notify). Owned and stopped explicitly; it never runs
/// inside the bounded per-commit task set.
pub struct PeriodicVectorDrainer {
    notify: Arc<tokio::sync::Notify>,
    handle: tokio::task::JoinHandle<()>,
}

impl PeriodicVectorDrainer {
    pub fn start(
        durable: Option<Arc<DurableOutbox>>,
        memory: Arc<InMemoryOutbox>,
        vector_store: Arc<dyn VectorStore>,
        config: OutboxConfig,
    ) -> Self {
        let notify = Arc::new(tokio::sync::Notify::new());
        let notified = Arc::clone(&notify);
        let worker_id = format!("drainer-{}", Uuid::now_v7());
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.drain_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = notified.notified() => {}
                }
                let result = drain_vector_outbox(
                    durable.as_deref(),
                    &memory,
                    vector_store.as_ref(),
                    &worker_id,
                    &config,
                )
                .await;
                if let Err(err) = result {
                    tracing::warn!(%err, "outbox drain pass failed");
                }
            }
        });
        Self { notify, handle }
    }

    /// Prompt a drain pass without waiting for the next tick.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_outbox_is_fifo() {
        let outbox = InMemoryOutbox::new();
        outbox.enqueue(VectorSyncEvent::new("svc", vec!["a".to_string()], "t"));
        outbox.enqueue(VectorSyncEvent::new("svc", vec!["b".to_string()], "t"));
        assert_eq!(outbox.pending_count(), 2);
        let drained = outbox.drain_all();
        assert_eq!(drained[0].pruned_ids, vec!["a"]);
        assert_eq!(drained[1].pruned_ids, vec!["b"]);
        assert_eq!(outbox.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_coalescing_merges_same_collection() {
        let outbox = CoalescingOutbox::new(10, None);
        outbox
            .enqueue(VectorSyncEvent::new("svc", vec!["a".to_string()], "t"))
            .await
            .unwrap();
        outbox
            .enqueue(VectorSyncEvent::new(
                "svc",
                vec!["a".to_string(), "b".to_string()],
                "t",
            ))
            .await
            .unwrap();
        assert_eq!(outbox.pending_count().await, 1);
        let drained = outbox.drain_all().await;
        assert_eq!(drained[0].pruned_ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_coalescing_spills_oldest_before_dropping() {
        let rescue = Arc::new(InMemoryOutbox::new());
        let outbox = CoalescingOutbox::new(2, Some(rescue.clone() as Arc<dyn OutboxSink>));
        for collection in ["a", "b", "c"] {
            outbox
                .enqueue(VectorSyncEvent::new(collection, vec!["x".to_string()], "t"))
                .await
                .unwrap();
        }
        assert_eq!(outbox.pending_count().await, 2);
        // Oldest entry (collection "a") was rescued, not dropped.
        let rescued = rescue.drain_all();
        assert_eq!(rescued.len(), 1);
        assert_eq!(rescued[0].collection, "a");
    }

    #[tokio::test]
    async fn test_coalescing_keeps_tenants_separate() {
        let outbox = CoalescingOutbox::new(10, None);
        outbox
            .enqueue(VectorSyncEvent::new("svc", vec!["a".to_string()], "tenant-a"))
            .await
            .unwrap();
        outbox
            .enqueue(VectorSyncEvent::new("svc", vec!["a".to_string()], "tenant-b"))
            .await
            .unwrap();
        assert_eq!(outbox.pending_count().await, 2);
    }
}
