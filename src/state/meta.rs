//! Kubernetes-style metadata value types shared across the crate.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// API group, version, and kind triple identifying an object schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersionKind {
    /// API group; empty for the core group.
    pub group: String,
    /// API version within the group.
    pub version: String,
    /// Object kind.
    pub kind: String,
}

impl GroupVersionKind {
    /// Build a GVK from explicit parts.
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// What: Split an `apiVersion` string (`group/version` or `version`)
    /// into a GVK together with the given kind.
    ///
    /// Inputs:
    /// - `api_version`: e.g. `"apps/v1"` or `"v1"`.
    /// - `kind`: e.g. `"Deployment"`.
    ///
    /// Output:
    /// - The GVK; core-group objects get an empty group.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }

    /// Rejoin the group and version into an `apiVersion` string.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}, Kind={}", self.group, self.version, self.kind)
    }
}

/// `apiVersion`/`kind` pair carried on serialized objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeMeta {
    /// API version string, e.g. `apps/v1`.
    pub api_version: String,
    /// Object kind.
    pub kind: String,
}

impl TypeMeta {
    /// GVK of this type meta.
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::from_api_version(&self.api_version, &self.kind)
    }
}

/// Reference from an owned object back to its owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OwnerReference {
    /// API version of the owner.
    pub api_version: String,
    /// Kind of the owner.
    pub kind: String,
    /// Name of the owner.
    pub name: String,
    /// Whether the owner is the managing controller.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub controller: bool,
    /// Whether deletion of the owner is blocked on this object.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub block_owner_deletion: bool,
}

/// Standard object metadata. Only the fields this controller reads and
/// writes are modeled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    /// Object name.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Namespace; `None` for cluster-scoped objects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Spec generation, incremented on every spec change.
    #[serde(skip_serializing_if = "is_zero")]
    pub generation: i64,
    /// Object labels.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Object annotations.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Finalizer keys blocking deletion.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    /// Deletion timestamp; set marks the object as terminating.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// References to owning objects.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl ObjectMeta {
    /// Metadata carrying only a name.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// The controller owner reference, if one is set.
    pub fn controller_owner(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// What: apiVersion splitting and rejoining for grouped and core kinds
    ///
    /// - Input: "apps/v1" Deployment and "v1" ServiceAccount
    /// - Output: Correct group/version parts and round-tripped apiVersion
    fn meta_gvk_api_version_roundtrip() {
        let d = GroupVersionKind::from_api_version("apps/v1", "Deployment");
        assert_eq!(d.group, "apps");
        assert_eq!(d.api_version(), "apps/v1");
        let sa = GroupVersionKind::from_api_version("v1", "ServiceAccount");
        assert_eq!(sa.group, "");
        assert_eq!(sa.api_version(), "v1");
        assert_eq!(d.to_string(), "apps/v1, Kind=Deployment");
    }

    #[test]
    /// What: Controller owner lookup ignores non-controller references
    ///
    /// - Input: Metadata with one plain and one controller owner reference
    /// - Output: The controller reference is returned
    fn meta_controller_owner() {
        let mut meta = ObjectMeta::named("obj");
        meta.owner_references = vec![
            OwnerReference {
                name: "plain".into(),
                ..OwnerReference::default()
            },
            OwnerReference {
                name: "boss".into(),
                controller: true,
                ..OwnerReference::default()
            },
        ];
        assert_eq!(meta.controller_owner().map(|r| r.name.as_str()), Some("boss"));
    }
}
