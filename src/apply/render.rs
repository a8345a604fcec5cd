//! Bundle rendering: media-type dispatch and manifest materialization.
//!
//! `plain+v0` bundles carry ready-to-apply manifests under `manifests/`.
//! `registry+v1` bundles carry a ClusterServiceVersion plus CRDs; the CSV
//! is lowered into plain objects (deployments, service accounts, RBAC
//! from its permission blocks) and everything else passes through. Any
//! other media type is fatal.

use serde::Deserialize;
use serde_json::Value;

use crate::apply::object::ClusterObject;
use crate::catalog::{MEDIA_TYPE_PLAIN, MEDIA_TYPE_REGISTRY};
use crate::state::ClusterExtension;
use crate::unpack::BundleFs;

/// Bundle annotations file of registry-layout bundles.
pub const ANNOTATIONS_FILE: &str = "metadata/annotations.yaml";
/// Annotation key naming the bundle media type.
pub const MEDIATYPE_ANNOTATION: &str = "operators.operatorframework.io.bundle.mediatype.v1";
/// Kind of the operator manifest a registry bundle centers on.
pub const CSV_KIND: &str = "ClusterServiceVersion";

/// Rendering failure; `Display` text is part of the status contract.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The bundle declares a media type this controller cannot render.
    #[error("unknown bundle mediatype: {0}")]
    UnknownMediaType(String),
    /// Bundle content could not be read.
    #[error("reading bundle content: {0}")]
    Io(#[from] std::io::Error),
    /// A manifest file did not decode.
    #[error("decoding manifest {file:?}: {reason}")]
    Manifest {
        /// Offending file name.
        file: String,
        /// Decode failure.
        reason: String,
    },
    /// The ClusterServiceVersion is missing or malformed.
    #[error("malformed cluster service version: {0}")]
    Csv(String),
}

#[derive(Debug, Deserialize)]
struct AnnotationsFile {
    #[serde(default)]
    annotations: std::collections::BTreeMap<String, String>,
}

/// What: Determine the bundle's media type from its annotations file.
///
/// Inputs:
/// - `fs`: Unpacked bundle filesystem.
///
/// Output:
/// - The declared media type, or `registry+v1` when the annotations file
///   or the media-type key is absent.
pub fn media_type(fs: &BundleFs) -> Result<String, RenderError> {
    if !fs.exists(ANNOTATIONS_FILE) {
        return Ok(MEDIA_TYPE_REGISTRY.to_string());
    }
    let raw = fs.read(ANNOTATIONS_FILE)?;
    let parsed: AnnotationsFile =
        serde_norway::from_str(&raw).map_err(|e| RenderError::Manifest {
            file: ANNOTATIONS_FILE.to_string(),
            reason: e.to_string(),
        })?;
    Ok(parsed
        .annotations
        .get(MEDIATYPE_ANNOTATION)
        .cloned()
        .unwrap_or_else(|| MEDIA_TYPE_REGISTRY.to_string()))
}

/// What: Render the bundle filesystem into a flat object set.
///
/// Inputs:
/// - `fs`: Unpacked bundle filesystem.
/// - `ext`: The owning extension (provides the install namespace).
///
/// Output:
/// - Plain cluster objects in deterministic order, or a [`RenderError`].
pub fn render(fs: &BundleFs, ext: &ClusterExtension) -> Result<Vec<ClusterObject>, RenderError> {
    let media = media_type(fs)?;
    let mut objects = match media.as_str() {
        MEDIA_TYPE_PLAIN => manifest_objects(fs)?,
        MEDIA_TYPE_REGISTRY => render_registry(fs, ext)?,
        other => return Err(RenderError::UnknownMediaType(other.to_string())),
    };
    for object in &mut objects {
        default_namespace(object, &ext.spec.install.namespace);
    }
    objects.sort_by(|a, b| {
        (!a.is_crd(), a.gvk(), a.namespace().map(str::to_string), a.name().to_string()).cmp(&(
            !b.is_crd(),
            b.gvk(),
            b.namespace().map(str::to_string),
            b.name().to_string(),
        ))
    });
    Ok(objects)
}

/// Parse every YAML document under `manifests/` into objects.
fn manifest_objects(fs: &BundleFs) -> Result<Vec<ClusterObject>, RenderError> {
    let mut objects = Vec::new();
    for file in fs.list("manifests")? {
        if !file.ends_with(".yaml") && !file.ends_with(".yml") && !file.ends_with(".json") {
            continue;
        }
        let raw = fs.read(&format!("manifests/{file}"))?;
        for doc in serde_norway::Deserializer::from_str(&raw) {
            let value = Value::deserialize(doc).map_err(|e| RenderError::Manifest {
                file: file.clone(),
                reason: e.to_string(),
            })?;
            if value.is_null() {
                continue;
            }
            let object: ClusterObject =
                serde_json::from_value(value).map_err(|e| RenderError::Manifest {
                    file: file.clone(),
                    reason: e.to_string(),
                })?;
            if object.type_meta.kind.is_empty() {
                continue;
            }
            objects.push(object);
        }
    }
    Ok(objects)
}

/// Lower a registry bundle: CSV → deployments, service accounts, RBAC;
/// non-CSV manifests pass through.
fn render_registry(
    fs: &BundleFs,
    ext: &ClusterExtension,
) -> Result<Vec<ClusterObject>, RenderError> {
    let all = manifest_objects(fs)?;
    let namespace = ext.spec.install.namespace.as_str();
    let mut out = Vec::new();
    let mut csv: Option<ClusterObject> = None;
    for object in all {
        if object.type_meta.kind == CSV_KIND {
            if csv.is_some() {
                return Err(RenderError::Csv(
                    "bundle contains more than one ClusterServiceVersion".into(),
                ));
            }
            csv = Some(object);
        } else {
            out.push(object);
        }
    }
    let Some(csv) = csv else {
        return Err(RenderError::Csv(
            "bundle contains no ClusterServiceVersion".into(),
        ));
    };
    let csv_name = csv.name().to_string();
    let install_spec = csv
        .rest
        .get("spec")
        .and_then(|s| s.get("install"))
        .and_then(|i| i.get("spec"))
        .cloned()
        .ok_or_else(|| RenderError::Csv("spec.install.spec is missing".into()))?;

    let mut service_accounts: Vec<String> = Vec::new();
    let mut remember_sa = |name: &str| {
        if !name.is_empty() && !service_accounts.iter().any(|s| s == name) {
            service_accounts.push(name.to_string());
        }
    };

    if let Some(deployments) = install_spec.get("deployments").and_then(Value::as_array) {
        for dep in deployments {
            let name = dep
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| RenderError::Csv("deployment entry without name".into()))?;
            let spec = dep
                .get("spec")
                .cloned()
                .ok_or_else(|| RenderError::Csv(format!("deployment {name:?} without spec")))?;
            if let Some(sa) = spec
                .get("template")
                .and_then(|t| t.get("spec"))
                .and_then(|s| s.get("serviceAccountName"))
                .and_then(Value::as_str)
            {
                remember_sa(sa);
            }
            let mut deployment = ClusterObject::new("apps/v1", "Deployment", name);
            deployment.metadata.namespace = Some(namespace.to_string());
            deployment.rest.insert("spec".into(), spec);
            out.push(deployment);
        }
    }

    for (block, cluster_scoped) in [("permissions", false), ("clusterPermissions", true)] {
        let Some(entries) = install_spec.get(block).and_then(Value::as_array) else {
            continue;
        };
        for entry in entries {
            let sa = entry
                .get("serviceAccountName")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    RenderError::Csv(format!("{block} entry without serviceAccountName"))
                })?;
            remember_sa(sa);
            let rules = entry.get("rules").cloned().unwrap_or(Value::Array(Vec::new()));
            let role_name = format!("{csv_name}-{sa}");
            if cluster_scoped {
                let mut role = ClusterObject::new(
                    "rbac.authorization.k8s.io/v1",
                    "ClusterRole",
                    &role_name,
                );
                role.rest.insert("rules".into(), rules);
                out.push(role);
                out.push(binding(&role_name, "ClusterRole", "ClusterRoleBinding", sa, namespace));
            } else {
                let mut role =
                    ClusterObject::new("rbac.authorization.k8s.io/v1", "Role", &role_name);
                role.metadata.namespace = Some(namespace.to_string());
                role.rest.insert("rules".into(), rules);
                out.push(role);
                let mut rb = binding(&role_name, "Role", "RoleBinding", sa, namespace);
                rb.metadata.namespace = Some(namespace.to_string());
                out.push(rb);
            }
        }
    }

    for sa in service_accounts {
        let mut object = ClusterObject::new("v1", "ServiceAccount", &sa);
        object.metadata.namespace = Some(namespace.to_string());
        out.push(object);
    }
    Ok(out)
}

fn binding(
    role_name: &str,
    role_kind: &str,
    binding_kind: &str,
    sa: &str,
    namespace: &str,
) -> ClusterObject {
    let mut object =
        ClusterObject::new("rbac.authorization.k8s.io/v1", binding_kind, role_name);
    object.rest.insert(
        "roleRef".into(),
        serde_json::json!({
            "apiGroup": "rbac.authorization.k8s.io",
            "kind": role_kind,
            "name": role_name,
        }),
    );
    object.rest.insert(
        "subjects".into(),
        serde_json::json!([{
            "kind": "ServiceAccount",
            "name": sa,
            "namespace": namespace,
        }]),
    );
    object
}

/// Kinds that exist outside any namespace.
fn cluster_scoped(kind: &str) -> bool {
    matches!(
        kind,
        "CustomResourceDefinition"
            | "ClusterRole"
            | "ClusterRoleBinding"
            | "Namespace"
            | "PriorityClass"
            | "StorageClass"
            | "ClusterExtension"
    )
}

/// Give namespaced objects without a namespace the install namespace.
fn default_namespace(object: &mut ClusterObject, namespace: &str) {
    if object.metadata.namespace.is_none() && !cluster_scoped(&object.type_meta.kind) {
        object.metadata.namespace = Some(namespace.to_string());
    }
}

/// Canonical manifest text for a rendered object set; the release diff
/// compares these strings byte-wise.
pub fn canonical_manifest(objects: &[ClusterObject]) -> String {
    serde_json::to_string_pretty(objects).unwrap_or_default()
}

/// Decode a canonical manifest back into objects (used for pruning and
/// uninstall).
pub fn manifest_objects_from_release(manifest: &str) -> Vec<ClusterObject> {
    serde_json::from_str(manifest).unwrap_or_default()
}
