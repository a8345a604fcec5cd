//! Dynamic watches over applied objects.
//!
//! After a successful apply, the reconciler ensures a watch exists for
//! every distinct GVK among the applied objects. Watches are owner
//! filtered (only events for objects controller-owned by a
//! ClusterExtension enqueue a reconcile) and ignore create events, which
//! the applying reconcile already accounts for. The registered-GVK set is
//! shared across workers behind a reader-writer lock; the check-then-
//! register sequence runs under the writer lock so concurrent reconciles
//! cannot double-register.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use crate::apply::object::ClusterObject;
use crate::apply::OWNER_KIND;
use crate::cluster::{EventKind, InProcessCluster};
use crate::state::meta::GroupVersionKind;

/// Watch registration failure.
#[derive(Debug, thiserror::Error)]
#[error("creating dynamic watch for {gvk}: {reason}")]
pub struct WatchError {
    /// GVK the registration was for.
    pub gvk: GroupVersionKind,
    /// Why registration failed.
    pub reason: String,
}

/// Registers owner-filtered watches on the cluster event bus.
#[derive(Debug)]
pub struct DynamicWatcher {
    cluster: Arc<InProcessCluster>,
    queue: mpsc::UnboundedSender<String>,
    registered: RwLock<HashSet<GroupVersionKind>>,
}

impl DynamicWatcher {
    /// Build a watcher feeding reconcile requests into `queue`.
    pub fn new(cluster: Arc<InProcessCluster>, queue: mpsc::UnboundedSender<String>) -> Self {
        Self {
            cluster,
            queue,
            registered: RwLock::new(HashSet::new()),
        }
    }

    /// Number of GVKs currently watched.
    pub fn registered_count(&self) -> usize {
        let guard = self.registered.read().unwrap_or_else(|e| e.into_inner());
        guard.len()
    }

    /// What: Ensure a watch exists for each distinct GVK of `objects`.
    ///
    /// Inputs:
    /// - `objects`: The objects applied this reconcile.
    ///
    /// Output:
    /// - `Ok` when every GVK is (already or newly) watched; registration
    ///   is idempotent.
    pub fn ensure_watches(&self, objects: &[ClusterObject]) -> Result<(), WatchError> {
        let gvks: HashSet<GroupVersionKind> = objects.iter().map(ClusterObject::gvk).collect();
        for gvk in gvks {
            {
                let guard = self.registered.read().unwrap_or_else(|e| e.into_inner());
                if guard.contains(&gvk) {
                    continue;
                }
            }
            let mut guard = self.registered.write().unwrap_or_else(|e| e.into_inner());
            if guard.contains(&gvk) {
                continue;
            }
            if self.queue.is_closed() {
                return Err(WatchError {
                    gvk,
                    reason: "reconcile queue is closed".into(),
                });
            }
            self.spawn_watch(gvk.clone());
            guard.insert(gvk);
        }
        Ok(())
    }

    fn spawn_watch(&self, gvk: GroupVersionKind) {
        let mut events = self.cluster.subscribe();
        let queue = self.queue.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if event.object.gvk() != gvk {
                            continue;
                        }
                        // Create events are ignored: the reconcile that
                        // created the object already observed it.
                        if event.kind == EventKind::Created {
                            continue;
                        }
                        let Some(owner) = event.object.controller_owner() else {
                            continue;
                        };
                        if owner.kind != OWNER_KIND {
                            continue;
                        }
                        if queue.send(owner.name.clone()).is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(%gvk, missed, "watch lagged behind the event bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::meta::OwnerReference;

    fn owned_object(kind: &str, name: &str, owner: &str) -> ClusterObject {
        let mut object = ClusterObject::new("v1", kind, name);
        object.set_controller_owner(OwnerReference {
            api_version: crate::apply::OWNER_API_VERSION.into(),
            kind: OWNER_KIND.into(),
            name: owner.into(),
            controller: true,
            block_owner_deletion: true,
        });
        object
    }

    #[tokio::test]
    /// What: Registration is idempotent across repeated reconciles
    ///
    /// - Input: The same two-GVK object set registered three times
    /// - Output: Exactly two watches registered
    async fn watch_idempotent_registration() {
        let cluster = Arc::new(InProcessCluster::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let watcher = DynamicWatcher::new(cluster, tx);
        let objects = vec![
            owned_object("ConfigMap", "a", "prom"),
            owned_object("Secret", "b", "prom"),
            owned_object("ConfigMap", "c", "prom"),
        ];
        for _ in 0..3 {
            watcher.ensure_watches(&objects).expect("register");
        }
        assert_eq!(watcher.registered_count(), 2);
    }

    #[tokio::test]
    /// What: Update and delete events enqueue the owner; creates do not
    ///
    /// - Input: Created, updated, and deleted events for a watched GVK
    /// - Output: Two reconcile requests naming the owning extension
    async fn watch_event_predicate() {
        let cluster = Arc::new(InProcessCluster::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = DynamicWatcher::new(Arc::clone(&cluster), tx);
        let object = owned_object("ConfigMap", "conf", "prom");
        watcher.ensure_watches(std::slice::from_ref(&object)).expect("register");
        tokio::task::yield_now().await;

        cluster.emit(EventKind::Created, object.clone());
        cluster.emit(EventKind::Updated, object.clone());
        cluster.emit(EventKind::Deleted, object.clone());
        // Unwatched GVK and unowned objects are filtered.
        cluster.emit(EventKind::Updated, ClusterObject::new("v1", "Secret", "x"));
        cluster.emit(
            EventKind::Updated,
            ClusterObject::new("v1", "ConfigMap", "unowned"),
        );

        assert_eq!(rx.recv().await.as_deref(), Some("prom"));
        assert_eq!(rx.recv().await.as_deref(), Some("prom"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    /// What: A closed reconcile queue fails registration
    ///
    /// - Input: Watcher whose queue receiver was dropped
    /// - Output: WatchError; nothing registered
    async fn watch_closed_queue_fails() {
        let cluster = Arc::new(InProcessCluster::new());
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        drop(rx);
        let watcher = DynamicWatcher::new(cluster, tx);
        let err = watcher
            .ensure_watches(&[owned_object("ConfigMap", "a", "prom")])
            .expect_err("must fail");
        assert!(err.to_string().contains("reconcile queue is closed"));
        assert_eq!(watcher.registered_count(), 0);
    }
}
