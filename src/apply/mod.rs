//! The applier: renders bundle content into cluster objects and drives
//! the release engine (install, upgrade, or reconcile-in-place).
//!
//! Every applied object carries the owner labels, the store labels, and a
//! single controller owner reference back to the extension. Objects that
//! are already controller-owned by a different parent are never adopted.

/// Dynamic cluster object representation.
pub mod object;
/// Pre-apply gates.
pub mod preflight;
/// Release records and the journaling store.
pub mod release;
/// Media-type dispatch and manifest rendering.
pub mod render;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;

use crate::cluster::{ClientProvider, ClusterClient, ClusterError};
use crate::state::meta::OwnerReference;
use crate::state::{BundleMetadata, ClusterExtension};
use crate::unpack::BundleFs;
use object::ClusterObject;
use preflight::{Preflight, PreflightError};
use release::{Release, ReleaseStatus, ReleaseStore, ReleaseStoreError};
use render::RenderError;

/// Label naming the owning controller kind.
pub const LABEL_OWNER_KIND: &str = "olm.operatorframework.io/owner-kind";
/// Label naming the owning extension.
pub const LABEL_OWNER_NAME: &str = "olm.operatorframework.io/owner-name";
/// Label naming the installed bundle.
pub const LABEL_BUNDLE_NAME: &str = "olm.operatorframework.io/bundle-name";
/// Label naming the installed package.
pub const LABEL_PACKAGE_NAME: &str = "olm.operatorframework.io/package-name";
/// Label naming the installed bundle version.
pub const LABEL_BUNDLE_VERSION: &str = "olm.operatorframework.io/bundle-version";

/// Owner kind recorded on applied objects.
pub const OWNER_KIND: &str = "ClusterExtension";
/// API version of the owner reference on applied objects.
pub const OWNER_API_VERSION: &str = "olm.operatorframework.io/v1";

/// What the applier decided to do with the rendered manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseState {
    /// No release exists yet.
    NeedsInstall,
    /// The manifest changed, or the current release is failed/superseded.
    NeedsUpgrade,
    /// The manifest matches the deployed release.
    Unchanged,
}

/// The engine operation an error occurred under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOp {
    /// First install.
    Install,
    /// Revision upgrade.
    Upgrade,
    /// Reconcile-in-place of an unchanged release.
    Reconcile,
}

/// Apply failure; `reason()` maps each variant onto the status registry.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// Rendering failed (includes unknown media types).
    #[error(transparent)]
    Render(#[from] RenderError),
    /// A scoped client could not be built.
    #[error(transparent)]
    Client(ClusterError),
    /// The current release state could not be read.
    #[error("getting current release state: {0}")]
    ReleaseState(ReleaseStoreError),
    /// A preflight check rejected the operation.
    #[error("{source}")]
    Preflight {
        /// Operation that was gated.
        op: ReleaseOp,
        /// The rejection.
        #[source]
        source: PreflightError,
    },
    /// An object's kind is not served (its CRD is missing).
    #[error("required resource not found: {source}")]
    RequiredResourceNotFound {
        /// Operation in flight.
        op: ReleaseOp,
        /// The kind lookup failure.
        #[source]
        source: ClusterError,
    },
    /// A cluster write failed; permission errors surface verbatim.
    #[error("{source}")]
    Write {
        /// Operation in flight.
        op: ReleaseOp,
        /// The write failure.
        #[source]
        source: ClusterError,
    },
    /// The object is already controller-owned by a different parent.
    #[error("cannot adopt {kind} {name:?}: already controller-owned by {owner:?}")]
    ForeignOwner {
        /// Object kind.
        kind: String,
        /// Object name.
        name: String,
        /// The other controller owner.
        owner: String,
    },
    /// The release journal could not be written.
    #[error(transparent)]
    Store(#[from] ReleaseStoreError),
    /// A write failed and the failed-release journal entry could not be
    /// recorded either; without it the next pass would classify against
    /// stale journal state.
    #[error("{write}; recording failed release state: {source}")]
    FailedStatePersist {
        /// The write failure that was being recorded.
        write: Box<ApplyError>,
        /// The journal failure that masked it.
        #[source]
        source: ReleaseStoreError,
    },
}

impl ApplyError {
    /// Status reason for this failure.
    pub fn reason(&self) -> crate::state::ConditionReason {
        use crate::state::ConditionReason;
        match self {
            ApplyError::Client(_) => ConditionReason::ErrorGettingClient,
            ApplyError::ReleaseState(_) => ConditionReason::ErrorGettingReleaseState,
            ApplyError::Preflight { op, .. }
            | ApplyError::RequiredResourceNotFound { op, .. }
            | ApplyError::Write { op, .. } => match op {
                ReleaseOp::Upgrade => ConditionReason::UpgradeFailed,
                ReleaseOp::Install | ReleaseOp::Reconcile => ConditionReason::InstallationFailed,
            },
            ApplyError::Render(_) | ApplyError::ForeignOwner { .. } | ApplyError::Store(_) => {
                ConditionReason::InstallationFailed
            }
            ApplyError::FailedStatePersist { write, .. } => write.reason(),
        }
    }
}

/// Renders bundles and reconciles them through the release engine.
pub struct Applier<C: ClientProvider> {
    provider: C,
    store: Arc<dyn ReleaseStore>,
    preflights: Vec<Box<dyn Preflight>>,
}

impl<C: ClientProvider> Applier<C> {
    /// Build an applier over a client provider and release store.
    pub fn new(provider: C, store: Arc<dyn ReleaseStore>) -> Self {
        Self {
            provider,
            store,
            preflights: Vec::new(),
        }
    }

    /// Register a preflight check; checks run in registration order.
    pub fn with_preflight(mut self, check: Box<dyn Preflight>) -> Self {
        self.preflights.push(check);
        self
    }

    /// What: The bundle currently installed for the extension, read from
    /// the release store labels.
    ///
    /// Output:
    /// - `None` when no release exists or the release was uninstalled.
    pub fn installed_bundle(
        &self,
        ext: &ClusterExtension,
    ) -> Result<Option<BundleMetadata>, ApplyError> {
        let current = self
            .store
            .current(ext.name())
            .map_err(ApplyError::ReleaseState)?;
        Ok(current.and_then(|release| {
            if release.status == ReleaseStatus::Uninstalled {
                return None;
            }
            let name = release.labels.get(LABEL_BUNDLE_NAME)?;
            let version = release.labels.get(LABEL_BUNDLE_VERSION)?;
            Some(BundleMetadata {
                name: name.clone(),
                version: version.clone(),
            })
        }))
    }

    /// What: Render and apply the bundle filesystem for the extension.
    ///
    /// Inputs:
    /// - `fs`: Unpacked bundle content.
    /// - `ext`: The owning extension.
    /// - `owner_labels` / `store_labels`: Labels stamped on every object.
    ///
    /// Output:
    /// - The applied objects and the release state that was acted on.
    pub fn apply(
        &self,
        fs: &BundleFs,
        ext: &ClusterExtension,
        owner_labels: &BTreeMap<String, String>,
        store_labels: &BTreeMap<String, String>,
    ) -> Result<(Vec<ClusterObject>, ReleaseState), ApplyError> {
        let owner = OwnerReference {
            api_version: OWNER_API_VERSION.to_string(),
            kind: OWNER_KIND.to_string(),
            name: ext.name().to_string(),
            controller: true,
            block_owner_deletion: true,
        };
        let mut objects = render::render(fs, ext)?;
        for object in &mut objects {
            object.merge_labels(owner_labels);
            object.merge_labels(store_labels);
            object.set_controller_owner(owner.clone());
        }
        let manifest = render::canonical_manifest(&objects);

        let current = self
            .store
            .current(ext.name())
            .map_err(ApplyError::ReleaseState)?;
        let state = match &current {
            None => ReleaseState::NeedsInstall,
            Some(r) if r.status == ReleaseStatus::Uninstalled => ReleaseState::NeedsInstall,
            Some(r)
                if r.manifest != manifest
                    || matches!(r.status, ReleaseStatus::Failed | ReleaseStatus::Superseded) =>
            {
                ReleaseState::NeedsUpgrade
            }
            Some(_) => ReleaseState::Unchanged,
        };
        let op = match state {
            ReleaseState::NeedsInstall => ReleaseOp::Install,
            ReleaseState::NeedsUpgrade => ReleaseOp::Upgrade,
            ReleaseState::Unchanged => ReleaseOp::Reconcile,
        };

        let now = Utc::now();
        let desired = Release {
            name: ext.name().to_string(),
            revision: current.as_ref().map_or(0, |r| r.revision) + 1,
            status: match state {
                ReleaseState::NeedsUpgrade => ReleaseStatus::PendingUpgrade,
                _ => ReleaseStatus::PendingInstall,
            },
            manifest,
            labels: store_labels.clone(),
            created_at: now,
            updated_at: now,
        };

        for check in &self.preflights {
            if ext.preflight_disabled(check.name()) {
                continue;
            }
            let outcome = match state {
                ReleaseState::NeedsInstall => check.install(&desired, &objects),
                ReleaseState::NeedsUpgrade => check.upgrade(&desired, &objects),
                ReleaseState::Unchanged => Ok(()),
            };
            outcome.map_err(|source| ApplyError::Preflight { op, source })?;
        }

        let client = self
            .provider
            .for_service_account(
                &ext.spec.install.namespace,
                &ext.spec.install.service_account.name,
            )
            .map_err(ApplyError::Client)?;

        if let Err(err) = write_objects(client.as_ref(), &objects, &owner, op) {
            if state != ReleaseState::Unchanged {
                let mut failed = desired;
                failed.status = ReleaseStatus::Failed;
                if let Err(source) = self.store.push(failed) {
                    return Err(ApplyError::FailedStatePersist {
                        write: Box::new(err),
                        source,
                    });
                }
            }
            return Err(err);
        }

        if state == ReleaseState::NeedsUpgrade
            && let Some(current) = &current
        {
            prune_stale(client.as_ref(), &current.manifest, &objects, op)?;
        }

        if state != ReleaseState::Unchanged {
            let mut deployed = desired;
            deployed.status = ReleaseStatus::Deployed;
            self.store.push(deployed)?;
        }
        Ok((objects, state))
    }

    /// What: Remove everything the extension installed: the release's
    /// objects and its journal.
    pub fn uninstall(&self, ext: &ClusterExtension) -> Result<(), ApplyError> {
        let Some(current) = self
            .store
            .current(ext.name())
            .map_err(ApplyError::ReleaseState)?
        else {
            return Ok(());
        };
        let client = self
            .provider
            .for_service_account(
                &ext.spec.install.namespace,
                &ext.spec.install.service_account.name,
            )
            .map_err(ApplyError::Client)?;
        for object in render::manifest_objects_from_release(&current.manifest) {
            client
                .delete(&object.gvk(), object.namespace(), object.name())
                .map_err(|source| ApplyError::Write {
                    op: ReleaseOp::Reconcile,
                    source,
                })?;
        }
        self.store.remove(ext.name())?;
        Ok(())
    }
}

/// Write every rendered object, refusing foreign adoption and wrapping
/// kind-not-found as a required-resource failure.
fn write_objects(
    client: &dyn ClusterClient,
    objects: &[ClusterObject],
    owner: &OwnerReference,
    op: ReleaseOp,
) -> Result<(), ApplyError> {
    for object in objects {
        let existing = client
            .get(&object.gvk(), object.namespace(), object.name())
            .map_err(|source| ApplyError::Write { op, source })?;
        if let Some(existing) = existing
            && let Some(their_owner) = existing.controller_owner()
            && (their_owner.kind != owner.kind || their_owner.name != owner.name)
        {
            return Err(ApplyError::ForeignOwner {
                kind: object.type_meta.kind.clone(),
                name: object.name().to_string(),
                owner: their_owner.name.clone(),
            });
        }
        client.apply(object).map_err(|source| match source {
            ClusterError::KindNotFound { .. } => {
                ApplyError::RequiredResourceNotFound { op, source }
            }
            other => ApplyError::Write { op, source: other },
        })?;
    }
    Ok(())
}

/// Delete objects present in the previous manifest but absent from the
/// new one.
fn prune_stale(
    client: &dyn ClusterClient,
    old_manifest: &str,
    objects: &[ClusterObject],
    op: ReleaseOp,
) -> Result<(), ApplyError> {
    let keep: HashSet<(String, Option<String>, String)> = objects
        .iter()
        .map(|o| {
            (
                o.gvk().to_string(),
                o.namespace().map(str::to_string),
                o.name().to_string(),
            )
        })
        .collect();
    for stale in render::manifest_objects_from_release(old_manifest) {
        let key = (
            stale.gvk().to_string(),
            stale.namespace().map(str::to_string),
            stale.name().to_string(),
        );
        if !keep.contains(&key) {
            client
                .delete(&stale.gvk(), stale.namespace(), stale.name())
                .map_err(|source| ApplyError::Write { op, source })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InProcessCluster;
    use crate::state::meta::GroupVersionKind;
    use crate::state::ServiceAccountRef;
    use crate::unpack::{BundleSource, ContentStoreUnpacker, Unpacker};
    use super::release::FileReleaseStore;

    const PLAIN_ANNOTATIONS: &str =
        "annotations:\n  operators.operatorframework.io.bundle.mediatype.v1: plain+v0\n";

    struct Rig {
        _content: tempfile::TempDir,
        _state: tempfile::TempDir,
        cluster: Arc<InProcessCluster>,
        unpacker: ContentStoreUnpacker,
        applier: Applier<Arc<InProcessCluster>>,
    }

    fn rig() -> Rig {
        let content = tempfile::tempdir().expect("content dir");
        let state = tempfile::tempdir().expect("state dir");
        let cluster = Arc::new(InProcessCluster::new());
        let store: Arc<dyn ReleaseStore> =
            Arc::new(FileReleaseStore::new(state.path().to_path_buf()));
        let applier = Applier::new(Arc::clone(&cluster), store);
        let unpacker = ContentStoreUnpacker::new(content.path().to_path_buf(), None);
        Rig {
            _content: content,
            _state: state,
            cluster,
            unpacker,
            applier,
        }
    }

    fn ext() -> ClusterExtension {
        let mut ext = ClusterExtension::default();
        ext.metadata.name = "prom".into();
        ext.spec.install.namespace = "operators".into();
        ext.spec.install.service_account = ServiceAccountRef {
            name: "installer".into(),
        };
        ext
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    async fn unpacked(rig: &Rig, reference: &str, files: &[(&str, &str)]) -> BundleFs {
        rig.unpacker.put(reference, files).await.expect("put");
        rig.unpacker
            .unpack(&BundleSource::image(reference))
            .await
            .expect("unpack")
            .bundle
            .expect("fs")
    }

    fn configmap_bundle(value: &str) -> Vec<(&'static str, String)> {
        vec![
            (render::ANNOTATIONS_FILE, PLAIN_ANNOTATIONS.to_string()),
            (
                "manifests/objects.yaml",
                format!(
                    "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: conf\ndata:\n  key: {value}\n"
                ),
            ),
        ]
    }

    fn as_refs<'a>(files: &'a [(&'static str, String)]) -> Vec<(&'a str, &'a str)> {
        files.iter().map(|(a, b)| (*a, b.as_str())).collect()
    }

    #[tokio::test]
    /// What: Install, unchanged re-apply, and upgrade classification
    ///
    /// - Input: Same bundle twice, then a changed bundle
    /// - Output: NeedsInstall, Unchanged, NeedsUpgrade; labels and owner
    ///   on the applied object; installed_bundle reads back store labels
    async fn apply_classifies_and_labels() {
        let rig = rig();
        let ext = ext();
        let owner_labels = labels(&[
            (LABEL_OWNER_KIND, OWNER_KIND),
            (LABEL_OWNER_NAME, "prom"),
        ]);
        let store_labels = labels(&[
            (LABEL_BUNDLE_NAME, "operatorhub/prometheus/beta/1.0.0"),
            (LABEL_PACKAGE_NAME, "prometheus"),
            (LABEL_BUNDLE_VERSION, "1.0.0"),
        ]);

        let v1 = configmap_bundle("one");
        let fs = unpacked(&rig, "img-1", &as_refs(&v1)).await;
        let (objects, state) = rig
            .applier
            .apply(&fs, &ext, &owner_labels, &store_labels)
            .expect("install");
        assert_eq!(state, ReleaseState::NeedsInstall);
        assert_eq!(objects.len(), 1);
        let applied = rig
            .cluster
            .get(&GroupVersionKind::new("", "v1", "ConfigMap"), Some("operators"), "conf")
            .expect("applied object");
        assert_eq!(
            applied.metadata.labels.get(LABEL_BUNDLE_VERSION).map(String::as_str),
            Some("1.0.0")
        );
        assert_eq!(
            applied.controller_owner().map(|o| o.name.as_str()),
            Some("prom")
        );
        assert_eq!(
            rig.applier.installed_bundle(&ext).expect("read"),
            Some(BundleMetadata {
                name: "operatorhub/prometheus/beta/1.0.0".into(),
                version: "1.0.0".into(),
            })
        );

        let (_, state) = rig
            .applier
            .apply(&fs, &ext, &owner_labels, &store_labels)
            .expect("reconcile");
        assert_eq!(state, ReleaseState::Unchanged);

        let v2 = configmap_bundle("two");
        let fs2 = unpacked(&rig, "img-2", &as_refs(&v2)).await;
        let (_, state) = rig
            .applier
            .apply(&fs2, &ext, &owner_labels, &store_labels)
            .expect("upgrade");
        assert_eq!(state, ReleaseState::NeedsUpgrade);
    }

    #[tokio::test]
    /// What: Upgrade prunes objects dropped from the manifest
    ///
    /// - Input: Bundle with two ConfigMaps, then a bundle with one
    /// - Output: The dropped ConfigMap is deleted from the cluster
    async fn apply_prunes_on_upgrade() {
        let rig = rig();
        let ext = ext();
        let two = vec![
            (render::ANNOTATIONS_FILE, PLAIN_ANNOTATIONS.to_string()),
            (
                "manifests/objects.yaml",
                "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: keep\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: drop\n"
                    .to_string(),
            ),
        ];
        let fs = unpacked(&rig, "img-two", &as_refs(&two)).await;
        rig.applier
            .apply(&fs, &ext, &BTreeMap::new(), &BTreeMap::new())
            .expect("install");
        let one = vec![
            (render::ANNOTATIONS_FILE, PLAIN_ANNOTATIONS.to_string()),
            (
                "manifests/objects.yaml",
                "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: keep\n".to_string(),
            ),
        ];
        let fs = unpacked(&rig, "img-one", &as_refs(&one)).await;
        let (_, state) = rig
            .applier
            .apply(&fs, &ext, &BTreeMap::new(), &BTreeMap::new())
            .expect("upgrade");
        assert_eq!(state, ReleaseState::NeedsUpgrade);
        let cm = GroupVersionKind::new("", "v1", "ConfigMap");
        assert!(rig.cluster.get(&cm, Some("operators"), "keep").is_some());
        assert!(rig.cluster.get(&cm, Some("operators"), "drop").is_none());
    }

    #[tokio::test]
    /// What: Foreign-owned objects are never adopted
    ///
    /// - Input: A ConfigMap controller-owned by another extension
    /// - Output: ForeignOwner error; release marked failed so the next
    ///   pass retries as upgrade
    async fn apply_refuses_foreign_adoption() {
        let rig = rig();
        let ext = ext();
        let mut squatter = ClusterObject::new("v1", "ConfigMap", "conf");
        squatter.metadata.namespace = Some("operators".into());
        squatter.set_controller_owner(OwnerReference {
            api_version: OWNER_API_VERSION.into(),
            kind: OWNER_KIND.into(),
            name: "other".into(),
            controller: true,
            block_owner_deletion: true,
        });
        let client = rig
            .cluster
            .for_service_account("operators", "installer")
            .expect("client");
        client.apply(&squatter).expect("seed");

        let files = configmap_bundle("one");
        let fs = unpacked(&rig, "img", &as_refs(&files)).await;
        let err = rig
            .applier
            .apply(&fs, &ext, &BTreeMap::new(), &BTreeMap::new())
            .expect_err("must refuse");
        assert!(matches!(err, ApplyError::ForeignOwner { .. }));
        assert!(err.to_string().contains("already controller-owned by \"other\""));
    }

    #[tokio::test]
    /// What: Missing kinds wrap as RequiredResourceNotFound; denied
    /// service accounts surface verbatim
    ///
    /// - Input: A custom resource without its CRD, then a denied SA
    /// - Output: RequiredResourceNotFound, then Write(Forbidden) whose
    ///   reason maps to InstallationFailed
    async fn apply_error_taxonomy() {
        let rig = rig();
        let ext = ext();
        let cr = vec![
            (render::ANNOTATIONS_FILE, PLAIN_ANNOTATIONS.to_string()),
            (
                "manifests/cr.yaml",
                "apiVersion: monitoring.coreos.com/v1\nkind: Prometheus\nmetadata:\n  name: main\n"
                    .to_string(),
            ),
        ];
        let fs = unpacked(&rig, "img-cr", &as_refs(&cr)).await;
        let err = rig
            .applier
            .apply(&fs, &ext, &BTreeMap::new(), &BTreeMap::new())
            .expect_err("kind missing");
        assert!(matches!(err, ApplyError::RequiredResourceNotFound { .. }));
        assert!(err.to_string().starts_with("required resource not found:"));

        rig.cluster.deny_service_account("operators", "installer");
        let files = configmap_bundle("one");
        let fs = unpacked(&rig, "img-cm", &as_refs(&files)).await;
        let err = rig
            .applier
            .apply(&fs, &ext, &BTreeMap::new(), &BTreeMap::new())
            .expect_err("forbidden");
        assert!(err.to_string().contains("is forbidden"));
        assert_eq!(err.reason(), crate::state::ConditionReason::UpgradeFailed);
    }

    #[tokio::test]
    /// What: Uninstall removes objects and the release journal
    ///
    /// - Input: Installed bundle, then uninstall
    /// - Output: Object gone, installed_bundle None
    async fn apply_uninstall_cleans_up() {
        let rig = rig();
        let ext = ext();
        let files = configmap_bundle("one");
        let fs = unpacked(&rig, "img", &as_refs(&files)).await;
        rig.applier
            .apply(&fs, &ext, &BTreeMap::new(), &BTreeMap::new())
            .expect("install");
        rig.applier.uninstall(&ext).expect("uninstall");
        let cm = GroupVersionKind::new("", "v1", "ConfigMap");
        assert!(rig.cluster.get(&cm, Some("operators"), "conf").is_none());
        assert_eq!(rig.applier.installed_bundle(&ext).expect("read"), None);
    }
}
