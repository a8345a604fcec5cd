//! Core value types: extension spec/status, conditions, and object metadata.

/// Condition machinery and the closed type/reason registries.
pub mod conditions;
/// ClusterExtension spec and status types.
pub mod extension;
/// Kubernetes-style metadata value types.
pub mod meta;

pub use conditions::{Condition, ConditionReason, ConditionStatus, ConditionType};
pub use extension::{
    BundleMetadata, CatalogSourceSpec, ClusterExtension, ClusterExtensionSpec,
    ClusterExtensionStatus, CrdUpgradeSafetyConfig, InstallConfig, InstallStatus, PreflightConfig,
    PreflightPolicy, ResolutionStatus, ServiceAccountRef, SourceConfig, SourceType,
    UpgradeConstraintPolicy,
};
pub use meta::{GroupVersionKind, ObjectMeta, OwnerReference, TypeMeta};
