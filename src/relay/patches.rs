//! Follow-up self-link edits, tracked per destination copy.
//!
//! A copy whose text linked to itself is sent with a placeholder and patched
//! once its id is known. The patch runs as a background task so the event
//! lane never waits on it; deleting the copy cancels a patch still in flight.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::types::{ChatId, MessageId};

type PatchKey = (ChatId, MessageId);

/// A spawned patch; `generation` tells a replacement apart from its predecessor.
struct PatchTask {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Outstanding patch tasks keyed by (destination, copy id).
#[derive(Clone, Default)]
pub struct PatchQueue {
    tasks: Arc<RwLock<HashMap<PatchKey, PatchTask>>>,
    next_generation: Arc<AtomicU64>,
}

impl PatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `patch` in the background for the copy `(destination, copy)`.
    ///
    /// A previous patch for the same copy is aborted.
    pub async fn spawn<F>(&self, destination: ChatId, copy: MessageId, patch: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = (destination, copy);
        let tasks = Arc::clone(&self.tasks);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        // Hold the write lock across spawn+insert so the task's own removal
        // always runs after the insert.
        let mut guard = self.tasks.write().await;
        let handle = tokio::spawn(async move {
            patch.await;
            retire(&tasks, key, generation).await;
        });
        if let Some(previous) = guard.insert(key, PatchTask { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Abort the patch for a copy. Returns `true` if one was pending.
    pub async fn cancel(&self, destination: ChatId, copy: MessageId) -> bool {
        match self.tasks.write().await.remove(&(destination, copy)) {
            Some(task) => {
                task.handle.abort();
                tracing::debug!(destination, copy, "Cancelled pending self-link patch");
                true
            }
            None => false,
        }
    }

    pub async fn pending(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Wait for every outstanding patch to finish.
    pub async fn flush(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .write()
            .await
            .drain()
            .map(|(_, task)| task.handle)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "Self-link patch task panicked");
                }
            }
        }
    }
}

/// Drop a finished task's entry, unless a replacement already took the slot.
async fn retire(
    tasks: &RwLock<HashMap<PatchKey, PatchTask>>,
    key: PatchKey,
    generation: u64,
) -> bool {
    let mut tasks = tasks.write().await;
    if tasks.get(&key).is_some_and(|t| t.generation == generation) {
        tasks.remove(&key);
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn flush_waits_for_patches() {
        let queue = PatchQueue::new();
        let done = Arc::new(AtomicUsize::new(0));
        for copy in 0..3 {
            let done = Arc::clone(&done);
            queue
                .spawn(10, copy, async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }
        queue.flush().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(queue.pending().await, 0);
    }

    #[tokio::test]
    async fn cancel_aborts_patch() {
        let queue = PatchQueue::new();
        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        queue
            .spawn(10, 1, async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                d.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert!(queue.cancel(10, 1).await);
        assert!(!queue.cancel(10, 1).await);
        queue.flush().await;
        assert_eq!(done.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn late_finisher_leaves_replacement_in_place() {
        let queue = PatchQueue::new();
        let forever = || async { tokio::time::sleep(Duration::from_secs(60)).await };
        queue.spawn(10, 1, forever()).await;
        let first = queue.tasks.read().await[&(10, 1)].generation;
        queue.spawn(10, 1, forever()).await;

        // The replaced task finishing late must not evict its successor.
        assert!(!retire(&queue.tasks, (10, 1), first).await);
        assert_eq!(queue.pending().await, 1);
        assert!(queue.cancel(10, 1).await);
    }

    #[tokio::test]
    async fn finished_patches_remove_themselves() {
        let queue = PatchQueue::new();
        queue.spawn(10, 1, async {}).await;
        for _ in 0..50 {
            if queue.pending().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(queue.pending().await, 0);
    }
}
