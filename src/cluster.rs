//! In-process cluster surface.
//!
//! The real API machinery (API server, admission, informers) is an
//! external collaborator; this module provides the interfaces the
//! reconciler needs from it — service-account-scoped object clients, a
//! kind registry, an object event bus, and the extension store with its
//! admission stub — backed by process-local state so the controller loop
//! runs hermetically and tests can script failures.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::broadcast;

use crate::apply::object::ClusterObject;
use crate::state::meta::GroupVersionKind;
use crate::state::ClusterExtension;
use crate::util::validate;

/// Capacity of the object event bus.
const EVENT_BUS_CAPACITY: usize = 1024;

/// Cluster access failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    /// The object's kind is not served by the cluster (e.g. its CRD is
    /// not installed).
    #[error("no matches for kind {kind:?} in version {api_version:?}")]
    KindNotFound {
        /// Requested kind.
        kind: String,
        /// Requested apiVersion.
        api_version: String,
    },
    /// The acting service account is not permitted to perform the write.
    #[error(
        "serviceaccount {namespace}/{name} is forbidden: cannot {verb} resource {kind:?}"
    )]
    Forbidden {
        /// Service account namespace.
        namespace: String,
        /// Service account name.
        name: String,
        /// Denied verb.
        verb: String,
        /// Target kind.
        kind: String,
    },
    /// A scoped client could not be built for the service account.
    #[error("error getting client for serviceaccount {namespace}/{name}: {reason}")]
    ClientUnavailable {
        /// Service account namespace.
        namespace: String,
        /// Service account name.
        name: String,
        /// Provider-side reason.
        reason: String,
    },
}

/// Kind of object lifecycle event on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Object was created.
    Created,
    /// Object was updated.
    Updated,
    /// Object was deleted.
    Deleted,
}

/// One object lifecycle event.
#[derive(Debug, Clone)]
pub struct ObjectEvent {
    /// What happened.
    pub kind: EventKind,
    /// The object after (or, for deletes, before) the change.
    pub object: ClusterObject,
}

/// Object-level cluster operations, scoped to a service account.
pub trait ClusterClient: Send + Sync {
    /// Read an object.
    fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<ClusterObject>, ClusterError>;
    /// Create or update an object.
    fn apply(&self, object: &ClusterObject) -> Result<(), ClusterError>;
    /// Delete an object; deleting an absent object is not an error.
    fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), ClusterError>;
}

/// Builds service-account-scoped clients.
pub trait ClientProvider: Send + Sync {
    /// A client acting as `namespace`/`name`.
    fn for_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Arc<dyn ClusterClient>, ClusterError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ObjectKey {
    gvk: GroupVersionKind,
    namespace: Option<String>,
    name: String,
}

fn key_of(object: &ClusterObject) -> ObjectKey {
    ObjectKey {
        gvk: object.gvk(),
        namespace: object.namespace().map(str::to_string),
        name: object.name().to_string(),
    }
}

/// Process-local object store with a kind registry and event bus.
#[derive(Debug)]
pub struct InProcessCluster {
    objects: RwLock<HashMap<ObjectKey, ClusterObject>>,
    kinds: RwLock<HashSet<GroupVersionKind>>,
    events: broadcast::Sender<ObjectEvent>,
    forbidden_sas: RwLock<HashSet<String>>,
    rejected_clients: RwLock<HashSet<String>>,
}

/// Kinds every cluster serves without a CRD.
fn builtin_kinds() -> HashSet<GroupVersionKind> {
    let make = |group: &str, version: &str, kind: &str| GroupVersionKind::new(group, version, kind);
    [
        make("", "v1", "ServiceAccount"),
        make("", "v1", "Service"),
        make("", "v1", "ConfigMap"),
        make("", "v1", "Secret"),
        make("", "v1", "Namespace"),
        make("apps", "v1", "Deployment"),
        make("apps", "v1", "StatefulSet"),
        make("apps", "v1", "DaemonSet"),
        make("batch", "v1", "Job"),
        make("batch", "v1", "CronJob"),
        make("rbac.authorization.k8s.io", "v1", "Role"),
        make("rbac.authorization.k8s.io", "v1", "RoleBinding"),
        make("rbac.authorization.k8s.io", "v1", "ClusterRole"),
        make("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding"),
        make("apiextensions.k8s.io", "v1", "CustomResourceDefinition"),
    ]
    .into_iter()
    .collect()
}

impl Default for InProcessCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessCluster {
    /// Create an empty cluster serving the builtin kinds.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            objects: RwLock::new(HashMap::new()),
            kinds: RwLock::new(builtin_kinds()),
            events,
            forbidden_sas: RwLock::new(HashSet::new()),
            rejected_clients: RwLock::new(HashSet::new()),
        }
    }

    /// Subscribe to object lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ObjectEvent> {
        self.events.subscribe()
    }

    /// Whether the cluster serves the kind.
    pub fn known_kind(&self, gvk: &GroupVersionKind) -> bool {
        let guard = self.kinds.read().unwrap_or_else(|e| e.into_inner());
        guard.contains(gvk)
    }

    /// Register an additional served kind.
    pub fn register_kind(&self, gvk: GroupVersionKind) {
        let mut guard = self.kinds.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(gvk);
    }

    /// Deny all writes by a service account (test/ops hook for the
    /// permission-error path).
    pub fn deny_service_account(&self, namespace: &str, name: &str) {
        let mut guard = self.forbidden_sas.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(format!("{namespace}/{name}"));
    }

    /// Make client construction fail for a service account (test/ops hook
    /// for the client-error path).
    pub fn reject_client_for(&self, namespace: &str, name: &str) {
        let mut guard = self
            .rejected_clients
            .write()
            .unwrap_or_else(|e| e.into_inner());
        guard.insert(format!("{namespace}/{name}"));
    }

    /// Read an object directly (unscoped).
    pub fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<ClusterObject> {
        let key = ObjectKey {
            gvk: gvk.clone(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        };
        let guard = self.objects.read().unwrap_or_else(|e| e.into_inner());
        guard.get(&key).cloned()
    }

    /// All objects controller-owned by the named extension.
    pub fn list_owned(&self, extension_name: &str) -> Vec<ClusterObject> {
        let guard = self.objects.read().unwrap_or_else(|e| e.into_inner());
        guard
            .values()
            .filter(|o| {
                o.controller_owner()
                    .is_some_and(|r| r.kind == "ClusterExtension" && r.name == extension_name)
            })
            .cloned()
            .collect()
    }

    /// Emit a synthetic event for an object (used to simulate external
    /// edits and deletes of managed objects).
    pub fn emit(&self, kind: EventKind, object: ClusterObject) {
        let _ = self.events.send(ObjectEvent { kind, object });
    }

    fn sa_forbidden(&self, namespace: &str, name: &str) -> bool {
        let guard = self.forbidden_sas.read().unwrap_or_else(|e| e.into_inner());
        guard.contains(&format!("{namespace}/{name}"))
    }

    fn upsert(&self, object: ClusterObject) -> EventKind {
        let key = key_of(&object);
        let replaced = {
            let mut guard = self.objects.write().unwrap_or_else(|e| e.into_inner());
            guard.insert(key, object.clone()).is_some()
        };
        for gvk in object.crd_defined_gvks() {
            self.register_kind(gvk);
        }
        let kind = if replaced {
            EventKind::Updated
        } else {
            EventKind::Created
        };
        self.emit(kind, object);
        kind
    }

    fn remove(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) {
        let key = ObjectKey {
            gvk: gvk.clone(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        };
        let removed = {
            let mut guard = self.objects.write().unwrap_or_else(|e| e.into_inner());
            guard.remove(&key)
        };
        if let Some(object) = removed {
            self.emit(EventKind::Deleted, object);
        }
    }
}

/// Client acting as one service account against the in-process cluster.
struct SaScopedClient {
    cluster: Arc<InProcessCluster>,
    namespace: String,
    name: String,
}

impl ClusterClient for SaScopedClient {
    fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<ClusterObject>, ClusterError> {
        Ok(self.cluster.get(gvk, namespace, name))
    }

    fn apply(&self, object: &ClusterObject) -> Result<(), ClusterError> {
        if self.cluster.sa_forbidden(&self.namespace, &self.name) {
            return Err(ClusterError::Forbidden {
                namespace: self.namespace.clone(),
                name: self.name.clone(),
                verb: "patch".into(),
                kind: object.type_meta.kind.clone(),
            });
        }
        let gvk = object.gvk();
        if !self.cluster.known_kind(&gvk) {
            return Err(ClusterError::KindNotFound {
                kind: gvk.kind.clone(),
                api_version: gvk.api_version(),
            });
        }
        self.cluster.upsert(object.clone());
        Ok(())
    }

    fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), ClusterError> {
        if self.cluster.sa_forbidden(&self.namespace, &self.name) {
            return Err(ClusterError::Forbidden {
                namespace: self.namespace.clone(),
                name: self.name.clone(),
                verb: "delete".into(),
                kind: gvk.kind.clone(),
            });
        }
        self.cluster.remove(gvk, namespace, name);
        Ok(())
    }
}

impl ClientProvider for Arc<InProcessCluster> {
    fn for_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Arc<dyn ClusterClient>, ClusterError> {
        let rejected = {
            let guard = self
                .rejected_clients
                .read()
                .unwrap_or_else(|e| e.into_inner());
            guard.contains(&format!("{namespace}/{name}"))
        };
        if rejected {
            return Err(ClusterError::ClientUnavailable {
                namespace: namespace.to_string(),
                name: name.to_string(),
                reason: "token request rejected".into(),
            });
        }
        Ok(Arc::new(SaScopedClient {
            cluster: Arc::clone(self),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }))
    }
}

/// Admission rejection for an extension spec write.
#[derive(Debug, Clone, thiserror::Error)]
#[error("admission denied for {field}: {reason}")]
pub struct AdmissionError {
    /// Offending spec field.
    pub field: String,
    /// Why it was rejected.
    pub reason: String,
}

/// Extension write failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExtensionStoreError {
    /// Admission stub rejected the spec.
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    /// The extension does not exist.
    #[error("clusterextension {name:?} not found")]
    NotFound {
        /// Requested name.
        name: String,
    },
}

/// Store of ClusterExtension resources with the admission stub applied on
/// spec writes and k8s-style finalizer/deletion semantics.
#[derive(Debug)]
pub struct ExtensionStore {
    items: RwLock<HashMap<String, ClusterExtension>>,
    changes: broadcast::Sender<String>,
}

impl Default for ExtensionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtensionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            items: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Subscribe to change notifications (extension names).
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }

    /// Read an extension by name.
    pub fn get(&self, name: &str) -> Option<ClusterExtension> {
        let guard = self.items.read().unwrap_or_else(|e| e.into_inner());
        guard.get(name).cloned()
    }

    /// All extensions.
    pub fn list(&self) -> Vec<ClusterExtension> {
        let guard = self.items.read().unwrap_or_else(|e| e.into_inner());
        guard.values().cloned().collect()
    }

    /// Names of all extensions.
    pub fn names(&self) -> Vec<String> {
        let guard = self.items.read().unwrap_or_else(|e| e.into_inner());
        guard.keys().cloned().collect()
    }

    fn notify(&self, name: &str) {
        let _ = self.changes.send(name.to_string());
    }

    /// What: Create or update an extension's spec through the admission
    /// stub.
    ///
    /// Inputs:
    /// - `ext`: Extension carrying metadata.name and the desired spec.
    ///
    /// Output:
    /// - `Err` on lexical violations; on success the stored object's
    ///   generation is bumped iff the spec changed.
    pub fn apply_spec(&self, ext: ClusterExtension) -> Result<(), ExtensionStoreError> {
        validate_spec_lexical(&ext)?;
        self.insert_unvalidated(ext);
        Ok(())
    }

    /// Spec write bypassing admission; stands in for objects that reached
    /// the store without the admission layer (also used by tests).
    pub fn insert_unvalidated(&self, mut ext: ClusterExtension) {
        let name = ext.name().to_string();
        {
            let mut guard = self.items.write().unwrap_or_else(|e| e.into_inner());
            match guard.get_mut(&name) {
                Some(existing) => {
                    if existing.spec != ext.spec {
                        existing.spec = ext.spec;
                        existing.metadata.generation += 1;
                    }
                }
                None => {
                    ext.metadata.generation = 1;
                    guard.insert(name.clone(), ext);
                }
            }
        }
        self.notify(&name);
    }

    /// Replace only the status subresource.
    pub fn update_status(&self, ext: &ClusterExtension) -> Result<(), ExtensionStoreError> {
        let name = ext.name().to_string();
        {
            let mut guard = self.items.write().unwrap_or_else(|e| e.into_inner());
            let existing = guard.get_mut(&name).ok_or(ExtensionStoreError::NotFound {
                name: name.clone(),
            })?;
            existing.status = ext.status.clone();
        }
        self.notify(&name);
        Ok(())
    }

    /// What: Replace only the finalizer list.
    ///
    /// Details:
    /// - Mirrors API-server deletion semantics: when the object is
    ///   terminating and the last finalizer is removed, the object is
    ///   deleted from the store.
    pub fn update_finalizers(&self, ext: &ClusterExtension) -> Result<(), ExtensionStoreError> {
        let name = ext.name().to_string();
        {
            let mut guard = self.items.write().unwrap_or_else(|e| e.into_inner());
            let existing = guard.get_mut(&name).ok_or(ExtensionStoreError::NotFound {
                name: name.clone(),
            })?;
            existing.metadata.finalizers = ext.metadata.finalizers.clone();
            if existing.metadata.deletion_timestamp.is_some()
                && existing.metadata.finalizers.is_empty()
            {
                guard.remove(&name);
            }
        }
        self.notify(&name);
        Ok(())
    }

    /// Request deletion: removes immediately when no finalizers block it,
    /// otherwise stamps the deletion timestamp.
    pub fn mark_for_deletion(&self, name: &str) {
        {
            let mut guard = self.items.write().unwrap_or_else(|e| e.into_inner());
            match guard.get_mut(name) {
                Some(existing) if !existing.metadata.finalizers.is_empty() => {
                    if existing.metadata.deletion_timestamp.is_none() {
                        existing.metadata.deletion_timestamp = Some(Utc::now());
                    }
                }
                Some(_) => {
                    guard.remove(name);
                }
                None => return,
            }
        }
        self.notify(name);
    }
}

/// Admission stub: the lexical constraints of the declarative API.
fn validate_spec_lexical(ext: &ClusterExtension) -> Result<(), AdmissionError> {
    let deny = |field: &str, reason: &str| AdmissionError {
        field: field.to_string(),
        reason: reason.to_string(),
    };
    let Some(catalog) = &ext.spec.source.catalog else {
        return Err(deny("spec.source.catalog", "required when sourceType is Catalog"));
    };
    if !validate::is_valid_package_name(&catalog.package_name, false) {
        return Err(deny(
            "spec.source.catalog.packageName",
            "must match ^[a-z0-9]+([-.][a-z0-9]+)*$ and be at most 253 characters",
        ));
    }
    if !validate::is_valid_version_range(&catalog.version) {
        return Err(deny(
            "spec.source.catalog.version",
            "must be a valid version range of at most 64 characters",
        ));
    }
    for channel in &catalog.channels {
        if !validate::is_valid_channel_name(channel, false) {
            return Err(deny(
                "spec.source.catalog.channels",
                "must match ^[a-z0-9]+([.-][a-z0-9]+)*$ and be at most 253 characters",
            ));
        }
    }
    if !validate::is_dns1123_label(&ext.spec.install.namespace) {
        return Err(deny(
            "spec.install.namespace",
            "must be a DNS-1123 label of at most 63 characters",
        ));
    }
    if !validate::is_dns1123_subdomain(&ext.spec.install.service_account.name) {
        return Err(deny(
            "spec.install.serviceAccount.name",
            "must be a DNS-1123 subdomain of at most 253 characters",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CatalogSourceSpec, ServiceAccountRef};

    fn valid_ext(name: &str) -> ClusterExtension {
        let mut ext = ClusterExtension::default();
        ext.metadata.name = name.into();
        ext.spec.source.catalog = Some(CatalogSourceSpec {
            package_name: "prometheus".into(),
            ..CatalogSourceSpec::default()
        });
        ext.spec.install.namespace = "operators".into();
        ext.spec.install.service_account = ServiceAccountRef {
            name: "installer".into(),
        };
        ext
    }

    #[test]
    /// What: Spec writes bump generation only on spec change
    ///
    /// - Input: Create, idempotent re-apply, then a version change
    /// - Output: Generation 1, still 1, then 2; status preserved
    fn cluster_store_generation_semantics() {
        let store = ExtensionStore::new();
        store.apply_spec(valid_ext("prom")).expect("create");
        assert_eq!(store.get("prom").expect("exists").generation(), 1);
        store.apply_spec(valid_ext("prom")).expect("noop");
        assert_eq!(store.get("prom").expect("exists").generation(), 1);
        let mut changed = valid_ext("prom");
        if let Some(c) = changed.spec.source.catalog.as_mut() {
            c.version = "1.0.0".into();
        }
        store.apply_spec(changed).expect("update");
        assert_eq!(store.get("prom").expect("exists").generation(), 2);
    }

    #[test]
    /// What: Admission stub rejects lexical violations
    ///
    /// - Input: Bad package name, bad version, bad namespace
    /// - Output: AdmissionError naming the offending field
    fn cluster_store_admission_rejections() {
        let store = ExtensionStore::new();
        let mut bad_pkg = valid_ext("a");
        if let Some(c) = bad_pkg.spec.source.catalog.as_mut() {
            c.package_name = "Bad_Name".into();
        }
        assert!(store.apply_spec(bad_pkg).is_err());
        let mut bad_version = valid_ext("b");
        if let Some(c) = bad_version.spec.source.catalog.as_mut() {
            c.version = "1.2.3-123abc_def".into();
        }
        assert!(store.apply_spec(bad_version).is_err());
        let mut bad_ns = valid_ext("c");
        bad_ns.spec.install.namespace = "Not-A-Label-".into();
        assert!(store.apply_spec(bad_ns).is_err());
        // The bypass path accepts anything.
        let mut bypass = valid_ext("d");
        if let Some(c) = bypass.spec.source.catalog.as_mut() {
            c.version = "1.2.3-123abc_def".into();
        }
        store.insert_unvalidated(bypass);
        assert!(store.get("d").is_some());
    }

    #[test]
    /// What: Deletion semantics honor finalizers
    ///
    /// - Input: Extension with a finalizer marked for deletion, then the
    ///   finalizer removed
    /// - Output: Terminating first, gone after the finalizer update
    fn cluster_store_deletion_with_finalizers() {
        let store = ExtensionStore::new();
        let mut ext = valid_ext("prom");
        ext.metadata.finalizers = vec!["kurator/cleanup".into()];
        store.insert_unvalidated(ext);
        store.mark_for_deletion("prom");
        let terminating = store.get("prom").expect("still present");
        assert!(terminating.metadata.deletion_timestamp.is_some());
        let mut cleared = terminating;
        cleared.metadata.finalizers.clear();
        store.update_finalizers(&cleared).expect("update");
        assert!(store.get("prom").is_none());
    }

    #[test]
    /// What: Scoped client enforces kind registry and permissions
    ///
    /// - Input: Unknown kind apply; denied SA apply; CRD then CR apply
    /// - Output: KindNotFound, Forbidden, then success
    fn cluster_client_kind_and_permission_checks() {
        let cluster = Arc::new(InProcessCluster::new());
        let client = cluster
            .for_service_account("operators", "installer")
            .expect("client");

        let cr = {
            let mut o = ClusterObject::new("monitoring.coreos.com/v1", "Prometheus", "main");
            o.metadata.namespace = Some("operators".into());
            o
        };
        let err = client.apply(&cr).expect_err("unknown kind");
        assert!(matches!(err, ClusterError::KindNotFound { .. }));

        let mut crd = ClusterObject::new(
            "apiextensions.k8s.io/v1",
            crate::apply::object::CRD_KIND,
            "prometheuses.monitoring.coreos.com",
        );
        crd.rest.insert(
            "spec".into(),
            serde_json::json!({
                "group": "monitoring.coreos.com",
                "names": {"kind": "Prometheus"},
                "versions": [{"name": "v1"}]
            }),
        );
        client.apply(&crd).expect("crd applies");
        client.apply(&cr).expect("cr applies after crd");

        cluster.deny_service_account("operators", "installer");
        let err = client.apply(&cr).expect_err("forbidden");
        assert!(matches!(err, ClusterError::Forbidden { .. }));

        cluster.reject_client_for("operators", "other");
        assert!(matches!(
            cluster.for_service_account("operators", "other"),
            Err(ClusterError::ClientUnavailable { .. })
        ));
    }
}
