//! Preflight checks run before the release engine touches the cluster.
//!
//! Checks implement [`Preflight`] and run in registration order; the
//! first failure aborts the install or upgrade. Each check can be
//! disabled per extension via the spec's preflight toggles.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::apply::object::ClusterObject;
use crate::apply::release::Release;
use crate::cluster::InProcessCluster;

/// Preflight rejection.
#[derive(Debug, thiserror::Error)]
#[error("preflight {check} failed: {reason}")]
pub struct PreflightError {
    /// The failing check's name.
    pub check: String,
    /// Why the operation was rejected.
    pub reason: String,
}

/// A pre-apply gate for installs and upgrades.
pub trait Preflight: Send + Sync {
    /// Name used by the per-extension disable flag.
    fn name(&self) -> &'static str;
    /// Gate a fresh install of `desired`.
    fn install(&self, desired: &Release, objects: &[ClusterObject]) -> Result<(), PreflightError>;
    /// Gate an upgrade to `desired`.
    fn upgrade(&self, desired: &Release, objects: &[ClusterObject]) -> Result<(), PreflightError>;
}

/// Rejects CRD upgrades that would break stored data: scope changes and
/// removal of previously served versions.
pub struct CrdUpgradeSafety {
    cluster: Arc<InProcessCluster>,
}

impl CrdUpgradeSafety {
    /// Build the check against the cluster the CRDs live in.
    pub fn new(cluster: Arc<InProcessCluster>) -> Self {
        Self { cluster }
    }

    fn fail(&self, reason: String) -> PreflightError {
        PreflightError {
            check: self.name().to_string(),
            reason,
        }
    }

    fn check_crds(&self, objects: &[ClusterObject]) -> Result<(), PreflightError> {
        for desired in objects.iter().filter(|o| o.is_crd()) {
            let Some(existing) = self.cluster.get(&desired.gvk(), None, desired.name()) else {
                continue;
            };
            let scope = |o: &ClusterObject| {
                o.rest
                    .get("spec")
                    .and_then(|s| s.get("scope"))
                    .and_then(Value::as_str)
                    .unwrap_or("Namespaced")
                    .to_string()
            };
            let old_scope = scope(&existing);
            let new_scope = scope(desired);
            if old_scope != new_scope {
                return Err(self.fail(format!(
                    "crd {:?} scope changed from {old_scope:?} to {new_scope:?}",
                    desired.name()
                )));
            }
            let versions = |o: &ClusterObject| -> HashSet<String> {
                o.crd_defined_gvks()
                    .into_iter()
                    .map(|gvk| gvk.version)
                    .collect()
            };
            let removed: Vec<String> = versions(&existing)
                .difference(&versions(desired))
                .cloned()
                .collect();
            if !removed.is_empty() {
                let mut removed = removed;
                removed.sort();
                return Err(self.fail(format!(
                    "crd {:?} no longer serves versions {removed:?}",
                    desired.name()
                )));
            }
        }
        Ok(())
    }
}

impl Preflight for CrdUpgradeSafety {
    fn name(&self) -> &'static str {
        "crdUpgradeSafety"
    }

    fn install(&self, _desired: &Release, _objects: &[ClusterObject]) -> Result<(), PreflightError> {
        // Nothing to protect on first install.
        Ok(())
    }

    fn upgrade(&self, _desired: &Release, objects: &[ClusterObject]) -> Result<(), PreflightError> {
        self.check_crds(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::object::CRD_KIND;
    use crate::apply::release::ReleaseStatus;
    use chrono::Utc;

    fn crd(name: &str, scope: &str, versions: &[&str]) -> ClusterObject {
        let mut object = ClusterObject::new("apiextensions.k8s.io/v1", CRD_KIND, name);
        object.rest.insert(
            "spec".into(),
            serde_json::json!({
                "group": "monitoring.coreos.com",
                "names": {"kind": "Prometheus"},
                "scope": scope,
                "versions": versions.iter().map(|v| serde_json::json!({"name": v})).collect::<Vec<_>>(),
            }),
        );
        object
    }

    fn release() -> Release {
        let now = Utc::now();
        Release {
            name: "prom".into(),
            revision: 2,
            status: ReleaseStatus::PendingUpgrade,
            manifest: String::new(),
            labels: Default::default(),
            created_at: now,
            updated_at: now,
        }
    }

    fn seeded_cluster(existing: ClusterObject) -> Arc<InProcessCluster> {
        let cluster = Arc::new(InProcessCluster::new());
        use crate::cluster::ClientProvider;
        let client = cluster
            .for_service_account("operators", "installer")
            .expect("client");
        client.apply(&existing).expect("seed");
        cluster
    }

    #[test]
    /// What: Removing a served version fails the upgrade gate
    ///
    /// - Input: Existing CRD serving v1 and v1alpha1; desired serves v1 only
    /// - Output: PreflightError naming the removed version
    fn preflight_rejects_removed_version() {
        let cluster = seeded_cluster(crd("prometheuses.monitoring.coreos.com", "Namespaced", &["v1", "v1alpha1"]));
        let check = CrdUpgradeSafety::new(cluster);
        let desired = crd("prometheuses.monitoring.coreos.com", "Namespaced", &["v1"]);
        let err = check
            .upgrade(&release(), &[desired])
            .expect_err("must fail");
        assert!(err.to_string().contains("no longer serves"), "{err}");
    }

    #[test]
    /// What: Scope change fails; compatible upgrade and install pass
    ///
    /// - Input: Scope flip vs. version superset vs. fresh install
    /// - Output: Error, Ok, Ok
    fn preflight_scope_and_compatible_cases() {
        let cluster = seeded_cluster(crd("prometheuses.monitoring.coreos.com", "Namespaced", &["v1"]));
        let check = CrdUpgradeSafety::new(cluster);
        let rescoped = crd("prometheuses.monitoring.coreos.com", "Cluster", &["v1"]);
        assert!(check.upgrade(&release(), &[rescoped]).is_err());
        let widened = crd("prometheuses.monitoring.coreos.com", "Namespaced", &["v1", "v2"]);
        assert!(check.upgrade(&release(), &[widened.clone()]).is_ok());
        assert!(check.install(&release(), &[widened]).is_ok());
    }
}
