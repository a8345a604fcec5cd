//! Per-key work queue with coalescing and exponential backoff.
//!
//! Each key (extension name) is processed by at most one worker at a
//! time. Enqueueing an already-queued key coalesces; enqueueing a key
//! that is currently being worked parks it until the worker finishes.
//! Failed keys are re-enqueued after an exponentially growing delay.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

/// First retry delay.
const BACKOFF_BASE_MS: u64 = 250;
/// Retry delay ceiling.
const BACKOFF_MAX_MS: u64 = 120_000;

#[derive(Debug, Default)]
struct Inner {
    pending: VecDeque<String>,
    queued: HashSet<String>,
    active: HashSet<String>,
    failures: HashMap<String, u32>,
    closed: bool,
}

/// Coalescing, per-key-serialized work queue.
#[derive(Debug, Default)]
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl WorkQueue {
    /// Create an empty queue.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// What: Add a key to the queue.
    ///
    /// Details:
    /// - Duplicate requests for a key already waiting coalesce silently.
    /// - A key currently being worked is parked and handed out again
    ///   after its worker calls [`WorkQueue::done`].
    pub fn enqueue(&self, key: &str) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.closed || inner.queued.contains(key) {
                return;
            }
            inner.queued.insert(key.to_string());
            inner.pending.push_back(key.to_string());
        }
        self.notify.notify_waiters();
    }

    /// What: Wait for the next workable key.
    ///
    /// Output:
    /// - `Some(key)` with the key marked active, or `None` after
    ///   [`WorkQueue::shutdown`].
    pub async fn next(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before the state check so a notify landing
            // between check and await is not lost.
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if inner.closed {
                    return None;
                }
                let slot = inner
                    .pending
                    .iter()
                    .position(|key| !inner.active.contains(key));
                if let Some(slot) = slot
                    && let Some(key) = inner.pending.remove(slot)
                {
                    inner.queued.remove(&key);
                    inner.active.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// What: Report a finished key.
    ///
    /// Inputs:
    /// - `key`: The key returned by [`WorkQueue::next`].
    /// - `ok`: Whether the work succeeded; failures schedule a delayed
    ///   re-enqueue with exponential backoff.
    pub fn done(self: &Arc<Self>, key: &str, ok: bool) {
        let retry_in = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.active.remove(key);
            if ok {
                inner.failures.remove(key);
                None
            } else {
                let failures = inner.failures.entry(key.to_string()).or_insert(0);
                *failures += 1;
                let exp = failures.saturating_sub(1).min(16);
                Some(Duration::from_millis(
                    BACKOFF_BASE_MS
                        .saturating_mul(1u64 << exp)
                        .min(BACKOFF_MAX_MS),
                ))
            }
        };
        // A key parked while active becomes workable now.
        self.notify.notify_waiters();
        if let Some(delay) = retry_in {
            let queue = Arc::clone(self);
            let key = key.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                queue.enqueue(&key);
            });
        }
    }

    /// Current retry count for a key (0 when healthy).
    pub fn failure_count(&self, key: &str) -> u32 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.failures.get(key).copied().unwrap_or(0)
    }

    /// Stop handing out work; pending keys are dropped.
    pub fn shutdown(&self) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.closed = true;
            inner.pending.clear();
            inner.queued.clear();
        }
        self.notify.notify_waiters();
    }
}
