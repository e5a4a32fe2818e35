//! Rate-limited work queue
//!
//! Keys are node names. The queue guarantees that a key is held by at most
//! one worker at a time: a key re-added while in flight is marked dirty and
//! redelivered once the holder calls `done`. Failed keys come back through
//! `add_rate_limited` with per-key exponential backoff.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

/// First retry delay
const BASE_DELAY: Duration = Duration::from_millis(5);

/// Backoff ceiling
const MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Default)]
struct Inner {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    requeues: HashMap<String, u32>,
    shutting_down: bool,
}

/// Work queue with per-key serialization and rate-limited requeues
#[derive(Default)]
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl WorkQueue {
    /// New empty queue
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Enqueue a key. Duplicate pending adds collapse; a key currently being
    /// processed is redelivered after its worker finishes.
    pub async fn add(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        if inner.shutting_down {
            return;
        }
        if !inner.dirty.insert(key.to_string()) {
            return;
        }
        if inner.processing.contains(key) {
            return;
        }
        inner.queue.push_back(key.to_string());
        self.notify.notify_one();
    }

    /// Enqueue a key after a delay
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key).await;
        });
    }

    /// Enqueue a key with exponential backoff based on its failure count
    pub async fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut inner = self.inner.lock().await;
            let failures = inner.requeues.entry(key.to_string()).or_insert(0);
            *failures += 1;
            let exp = (*failures - 1).min(31);
            BASE_DELAY.saturating_mul(1u32 << exp).min(MAX_DELAY)
        };
        self.add_after(key, delay);
    }

    /// Block until a key is available; `None` once the queue is shut down
    /// and empty.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            {
                let mut inner = self.inner.lock().await;
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            notified.as_mut().await;
        }
    }

    /// Release a key after processing; redelivers it if it went dirty while
    /// in flight.
    pub async fn done(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        inner.processing.remove(key);
        if inner.dirty.contains(key) && !inner.shutting_down {
            inner.queue.push_back(key.to_string());
            self.notify.notify_one();
        }
    }

    /// Reset the failure count for a key
    pub async fn forget(&self, key: &str) {
        self.inner.lock().await.requeues.remove(key);
    }

    /// Number of rate-limited requeues recorded for a key
    pub async fn num_requeues(&self, key: &str) -> u32 {
        self.inner
            .lock()
            .await
            .requeues
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Stop accepting adds and wake all blocked getters
    pub async fn shut_down(&self) {
        self.inner.lock().await.shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Number of keys waiting for a worker
    pub async fn len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }
}
