//! Bounded background task set.
//!
//! Per-commit side effects (cache invalidation kicks, outbox drain prompts)
//! run through this set so a burst of commits cannot spawn unbounded tasks.
//! On overflow the user-supplied callback runs first (e.g. flushing a
//! coalescing queue into the durable outbox), the overflow counter bumps,
//! and the new task is rejected. Periodic tasks (drainer, heartbeat) are
//! owned by their components and never pass through here.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinSet;

use lattice_core::{LatticeResult, ResilienceError};

type OverflowFn = Box<dyn Fn() + Send + Sync>;

pub struct BoundedTaskSet {
    capacity: usize,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
    overflow_count: AtomicU64,
    on_overflow: Option<OverflowFn>,
}

impl BoundedTaskSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
            overflow_count: AtomicU64::new(0),
            on_overflow: None,
        }
    }

    /// Install the overflow callback run before a task is rejected.
    pub fn with_overflow_callback(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_overflow = Some(Box::new(callback));
        self
    }

    /// Spawn `fut` unless the set is at capacity.
    pub async fn spawn<F>(&self, fut: F) -> LatticeResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        // Reap completed tasks before judging capacity.
        while tasks.try_join_next().is_some() {}

        if tasks.len() >= self.capacity {
            if let Some(callback) = &self.on_overflow {
                callback();
            }
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(capacity = self.capacity, "bounded task set overflow");
            return Err(ResilienceError::TaskSetOverflow.into());
        }

        tasks.spawn(fut);
        Ok(())
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Await every outstanding task (shutdown path).
    pub async fn join_all(&self) {
        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_spawn_runs_tasks() {
        let set = BoundedTaskSet::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            set.spawn(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }
        set.join_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_overflow_rejects_and_calls_back() {
        let flushed = Arc::new(AtomicUsize::new(0));
        let flushed_clone = Arc::clone(&flushed);
        let set = BoundedTaskSet::new(1).with_overflow_callback(move || {
            flushed_clone.fetch_add(1, Ordering::SeqCst);
        });

        // Occupy the only slot with a task that waits.
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        set.spawn(async move {
            let _ = rx.await;
        })
        .await
        .unwrap();

        let err = set.spawn(async {}).await.unwrap_err();
        assert!(matches!(
            err,
            lattice_core::LatticeError::Resilience(ResilienceError::TaskSetOverflow)
        ));
        assert_eq!(set.overflow_count(), 1);
        assert_eq!(flushed.load(Ordering::SeqCst), 1);

        drop(tx);
        set.join_all().await;
    }
}
