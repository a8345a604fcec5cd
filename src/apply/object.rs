//! Dynamic cluster object representation.
//!
//! Rendered manifests are held as typed metadata plus an opaque payload
//! map, enough for the release engine to label, own, diff, and apply them
//! without modeling every workload schema.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::state::meta::{GroupVersionKind, ObjectMeta, OwnerReference, TypeMeta};

/// Kind name of custom resource definitions.
pub const CRD_KIND: &str = "CustomResourceDefinition";

/// One rendered (or stored) Kubernetes object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterObject {
    /// `apiVersion` and `kind`.
    #[serde(flatten)]
    pub type_meta: TypeMeta,
    /// Object metadata.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Everything else (spec, data, rules, ...), kept opaque.
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl ClusterObject {
    /// Build an object from its coordinates.
    pub fn new(api_version: &str, kind: &str, name: &str) -> Self {
        Self {
            type_meta: TypeMeta {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
            },
            metadata: ObjectMeta::named(name),
            rest: Map::new(),
        }
    }

    /// GVK of the object.
    pub fn gvk(&self) -> GroupVersionKind {
        self.type_meta.gvk()
    }

    /// Object name.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Object namespace, if namespaced.
    pub fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    /// Whether this object is a CRD.
    pub fn is_crd(&self) -> bool {
        self.type_meta.kind == CRD_KIND
    }

    /// Merge labels into the object, overwriting on key collision.
    pub fn merge_labels(&mut self, labels: &std::collections::BTreeMap<String, String>) {
        for (k, v) in labels {
            self.metadata.labels.insert(k.clone(), v.clone());
        }
    }

    /// The controller owner reference, if any.
    pub fn controller_owner(&self) -> Option<&OwnerReference> {
        self.metadata.controller_owner()
    }

    /// Replace the controller owner reference with `owner`, keeping any
    /// non-controller references.
    pub fn set_controller_owner(&mut self, owner: OwnerReference) {
        self.metadata.owner_references.retain(|r| !r.controller);
        self.metadata.owner_references.push(owner);
    }

    /// What: GVKs a CRD object defines.
    ///
    /// Output:
    /// - One GVK per served version declared under `spec.versions` (or the
    ///   legacy singular `spec.version`); empty for non-CRD objects or
    ///   malformed specs.
    pub fn crd_defined_gvks(&self) -> Vec<GroupVersionKind> {
        if !self.is_crd() {
            return Vec::new();
        }
        let Some(spec) = self.rest.get("spec") else {
            return Vec::new();
        };
        let group = spec.get("group").and_then(Value::as_str).unwrap_or("");
        let kind = spec
            .get("names")
            .and_then(|n| n.get("kind"))
            .and_then(Value::as_str)
            .unwrap_or("");
        if group.is_empty() || kind.is_empty() {
            return Vec::new();
        }
        let mut gvks = Vec::new();
        if let Some(versions) = spec.get("versions").and_then(Value::as_array) {
            for v in versions {
                if let Some(name) = v.get("name").and_then(Value::as_str) {
                    gvks.push(GroupVersionKind::new(group, name, kind));
                }
            }
        }
        if gvks.is_empty()
            && let Some(version) = spec.get("version").and_then(Value::as_str)
        {
            gvks.push(GroupVersionKind::new(group, version, kind));
        }
        gvks
    }
}
