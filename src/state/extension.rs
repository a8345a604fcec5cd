//! ClusterExtension value types: the user's declarative install intent and
//! the status the reconciler projects back.

use serde::{Deserialize, Serialize};

use super::conditions::Condition;
use super::meta::ObjectMeta;

/// Where an extension's content comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    /// Resolve the package from the configured catalogs.
    #[default]
    Catalog,
}

/// Whether upgrade edges are honored when a bundle is already installed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeConstraintPolicy {
    /// Only successors of the installed bundle (or the installed bundle
    /// itself) may be selected.
    #[default]
    Enforce,
    /// Any bundle matching the other constraints may be selected,
    /// including downgrades.
    Ignore,
}

/// Catalog-sourced desired state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CatalogSourceSpec {
    /// Package to install.
    pub package_name: String,
    /// Version range constraint; empty selects the highest available.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Channels to restrict resolution to; empty means all channels.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,
    /// Upgrade-edge policy.
    pub upgrade_constraint_policy: UpgradeConstraintPolicy,
}

/// Desired content source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceConfig {
    /// Discriminator for the source variants.
    #[serde(rename = "sourceType")]
    pub source_type: SourceType,
    /// Catalog parameters; required while `Catalog` is the only variant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog: Option<CatalogSourceSpec>,
}

/// Reference to the service account installs run as.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceAccountRef {
    /// Service account name in the install namespace.
    pub name: String,
}

/// Enable/disable toggle for a single preflight check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreflightPolicy {
    /// Run the check (default).
    #[default]
    Enabled,
    /// Skip the check for this extension.
    Disabled,
}

/// Toggle for the CRD upgrade-safety preflight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrdUpgradeSafetyConfig {
    /// Whether the check runs for this extension.
    pub policy: PreflightPolicy,
}

/// Per-extension preflight toggles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreflightConfig {
    /// CRD upgrade-safety toggle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crd_upgrade_safety: Option<CrdUpgradeSafetyConfig>,
}

/// Installation parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallConfig {
    /// Namespace the content is installed into.
    pub namespace: String,
    /// Service account installs run as.
    pub service_account: ServiceAccountRef,
    /// Optional preflight toggles.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preflight: Option<PreflightConfig>,
}

/// Desired state of a ClusterExtension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterExtensionSpec {
    /// Content source.
    pub source: SourceConfig,
    /// Install parameters.
    pub install: InstallConfig,
}

/// Name and version of a bundle recorded on the status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BundleMetadata {
    /// Bundle name.
    pub name: String,
    /// Bundle version string.
    pub version: String,
}

/// Resolution outcome recorded on the status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolutionStatus {
    /// The bundle resolution selected.
    pub bundle: BundleMetadata,
}

/// Install outcome recorded on the status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallStatus {
    /// The bundle currently installed.
    pub bundle: BundleMetadata,
}

/// Observed state of a ClusterExtension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterExtensionStatus {
    /// The deterministic condition set the reconciler projects.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Last successful resolution, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionStatus>,
    /// Current install, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install: Option<InstallStatus>,
}

/// A cluster-scoped request to install, upgrade, or remove a package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterExtension {
    /// Object metadata; the reconciler may touch finalizers only.
    pub metadata: ObjectMeta,
    /// Desired state; never written by the reconciler.
    pub spec: ClusterExtensionSpec,
    /// Observed state; owned by the reconciler.
    pub status: ClusterExtensionStatus,
}

impl ClusterExtension {
    /// Extension name.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Spec generation.
    pub fn generation(&self) -> i64 {
        self.metadata.generation
    }

    /// Requested package name; empty when the catalog source is absent.
    pub fn package_name(&self) -> &str {
        self.spec
            .source
            .catalog
            .as_ref()
            .map_or("", |c| c.package_name.as_str())
    }

    /// Requested version range; empty when unconstrained.
    pub fn version_range(&self) -> &str {
        self.spec
            .source
            .catalog
            .as_ref()
            .map_or("", |c| c.version.as_str())
    }

    /// Requested channels; empty when unconstrained.
    pub fn channels(&self) -> &[String] {
        self.spec
            .source
            .catalog
            .as_ref()
            .map_or(&[], |c| c.channels.as_slice())
    }

    /// Upgrade-edge policy in effect.
    pub fn upgrade_constraint_policy(&self) -> UpgradeConstraintPolicy {
        self.spec
            .source
            .catalog
            .as_ref()
            .map_or(UpgradeConstraintPolicy::Enforce, |c| {
                c.upgrade_constraint_policy
            })
    }

    /// Whether the named preflight is disabled on this extension.
    pub fn preflight_disabled(&self, name: &str) -> bool {
        if name != "crdUpgradeSafety" {
            return false;
        }
        self.spec
            .install
            .preflight
            .and_then(|p| p.crd_upgrade_safety)
            .is_some_and(|c| c.policy == PreflightPolicy::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// What: Spec accessors tolerate an absent catalog source
    ///
    /// - Input: Default extension and one with catalog fields set
    /// - Output: Empty defaults vs. configured values
    fn extension_accessors() {
        let empty = ClusterExtension::default();
        assert_eq!(empty.package_name(), "");
        assert!(empty.channels().is_empty());
        assert_eq!(
            empty.upgrade_constraint_policy(),
            UpgradeConstraintPolicy::Enforce
        );

        let mut ext = ClusterExtension::default();
        ext.spec.source.catalog = Some(CatalogSourceSpec {
            package_name: "prometheus".into(),
            version: "1.0.0".into(),
            channels: vec!["beta".into()],
            upgrade_constraint_policy: UpgradeConstraintPolicy::Ignore,
        });
        assert_eq!(ext.package_name(), "prometheus");
        assert_eq!(ext.channels(), ["beta".to_string()]);
        assert_eq!(
            ext.upgrade_constraint_policy(),
            UpgradeConstraintPolicy::Ignore
        );
    }

    #[test]
    /// What: Preflight disable flag is scoped to the named check
    ///
    /// - Input: Extension with crdUpgradeSafety disabled
    /// - Output: Disabled for that name only
    fn extension_preflight_toggle() {
        let mut ext = ClusterExtension::default();
        ext.spec.install.preflight = Some(PreflightConfig {
            crd_upgrade_safety: Some(CrdUpgradeSafetyConfig {
                policy: PreflightPolicy::Disabled,
            }),
        });
        assert!(ext.preflight_disabled("crdUpgradeSafety"));
        assert!(!ext.preflight_disabled("other"));
    }
}
