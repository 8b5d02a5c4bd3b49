//! Tracking of in-flight connection handler tasks.
//!
//! Every accepted inbound connection runs in a spawned task registered
//! here, so shutdown can wait for the fleet to drain and abort stragglers
//! at the deadline.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Default)]
struct Inner {
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_id: AtomicU64,
    finished: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A set of tracked handler tasks.
#[derive(Clone, Default)]
pub struct TaskSet {
    inner: Arc<Inner>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task and track it until it finishes.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            fut.await;
            inner.lock().remove(&id);
            inner.finished.notify_waiters();
        });

        // The task may already have finished and removed itself; a stale
        // finished handle is pruned by drain.
        if !handle.is_finished() {
            self.inner.lock().insert(id, handle);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait up to `grace` for all tasks, then abort the remainder.
    pub async fn drain(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            // Register for wakeups before checking, so a task finishing in
            // between cannot be missed.
            let notified = self.inner.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut tasks = self.inner.lock();
                tasks.retain(|_, handle| !handle.is_finished());
                if tasks.is_empty() {
                    return;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let mut tasks = self.inner.lock();
        let remaining = tasks.len();
        if remaining > 0 {
            debug!(remaining, "drain deadline reached, aborting remaining tasks");
        }
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn drains_completed_tasks() {
        let set = TaskSet::new();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let done = done.clone();
            set.spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        set.drain(Duration::from_secs(2)).await;
        assert_eq!(done.load(Ordering::SeqCst), 4);
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn aborts_stragglers_at_deadline() {
        let set = TaskSet::new();
        set.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let started = std::time::Instant::now();
        set.drain(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn drain_on_empty_set_returns_immediately() {
        let set = TaskSet::new();
        set.drain(Duration::from_secs(1)).await;
        assert!(set.is_empty());
    }
}
