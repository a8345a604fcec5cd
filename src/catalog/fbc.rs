//! File-based-catalog (FBC) schema parsing.
//!
//! A catalog is a stream of JSON objects, each tagged with a `schema` field:
//! `olm.package`, `olm.channel`, `olm.bundle`, and `olm.deprecations`.
//! The stream may be a single JSON array or whitespace-separated objects
//! (the shape served by a catalog HTTP backend). Unknown schemas are kept
//! opaque so a newer catalog does not fail to load.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema tag for package metas.
pub const SCHEMA_PACKAGE: &str = "olm.package";
/// Schema tag for channel metas.
pub const SCHEMA_CHANNEL: &str = "olm.channel";
/// Schema tag for bundle metas.
pub const SCHEMA_BUNDLE: &str = "olm.bundle";
/// Schema tag for catalog deprecation metas.
pub const SCHEMA_DEPRECATIONS: &str = "olm.deprecations";

/// Property type carrying the bundle's package name and version.
pub const PROPERTY_PACKAGE: &str = "olm.package";
/// Property type carrying the bundle's media type.
pub const PROPERTY_MEDIATYPE: &str = "olm.bundle.mediatype";

/// Error produced when catalog content cannot be parsed.
#[derive(Debug, thiserror::Error)]
pub enum FbcError {
    /// The stream was not valid JSON.
    #[error("malformed catalog JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A meta carried a schema tag but not the fields the schema requires.
    #[error("malformed {schema} meta {name:?}: {reason}")]
    Meta {
        /// Schema tag of the offending meta.
        schema: String,
        /// Name of the offending meta when one was present.
        name: String,
        /// Underlying decode failure.
        reason: String,
    },
}

/// `olm.package` meta.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageMeta {
    /// Package name.
    pub name: String,
    /// Channel the package recommends by default.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_channel: String,
}

/// One entry of a channel's upgrade graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEntry {
    /// Bundle name this entry describes.
    pub name: String,
    /// Name of the single predecessor this bundle replaces.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub replaces: String,
    /// Names of predecessors this bundle may skip over.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skips: Vec<String>,
    /// Version range of predecessors this bundle substitutes for.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub skip_range: String,
}

/// `olm.channel` meta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMeta {
    /// Channel name, unique within the package.
    pub name: String,
    /// Owning package.
    pub package: String,
    /// Ordered upgrade-graph entries.
    #[serde(default)]
    pub entries: Vec<ChannelEntry>,
}

/// A typed property attached to a bundle meta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    /// Property type, e.g. `olm.package`.
    #[serde(rename = "type")]
    pub type_: String,
    /// Schema-specific payload.
    pub value: Value,
}

/// `olm.bundle` meta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMeta {
    /// Bundle name, unique within the catalog.
    pub name: String,
    /// Owning package.
    pub package: String,
    /// Image reference the bundle content is pulled from.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    /// Typed properties (package version, media type, ...).
    #[serde(default)]
    pub properties: Vec<Property>,
}

/// Payload of the `olm.package` property on a bundle.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageProperty {
    /// Package the bundle belongs to.
    pub package_name: String,
    /// Version of the packaged content.
    pub version: String,
}

/// Reference inside a deprecation entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeprecationRef {
    /// Referenced schema: `olm.package`, `olm.channel`, or `olm.bundle`.
    pub schema: String,
    /// Referenced object name; empty for package references.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

/// One advisory inside an `olm.deprecations` meta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeprecationEntry {
    /// What the advisory refers to.
    pub reference: DeprecationRef,
    /// Advisory text surfaced on the extension status.
    pub message: String,
}

/// `olm.deprecations` meta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeprecationMeta {
    /// Package the advisories apply to.
    pub package: String,
    /// Advisory entries.
    #[serde(default)]
    pub entries: Vec<DeprecationEntry>,
}

/// A parsed catalog meta, one JSON object of the stream.
#[derive(Debug, Clone)]
pub enum Meta {
    /// `olm.package`.
    Package(PackageMeta),
    /// `olm.channel`.
    Channel(ChannelMeta),
    /// `olm.bundle`.
    Bundle(BundleMeta),
    /// `olm.deprecations`.
    Deprecations(DeprecationMeta),
    /// Any schema this controller does not interpret.
    Other(Value),
}

/// What: Parse a catalog content stream into typed metas.
///
/// Inputs:
/// - `src`: Raw catalog text, either one JSON array or a sequence of
///   whitespace-separated JSON objects.
///
/// Output:
/// - All metas in stream order, or the first decode error.
///
/// Details:
/// - Objects without a `schema` string and objects with unknown schemas are
///   preserved as [`Meta::Other`] so callers can ignore them deliberately.
pub fn parse_stream(src: &str) -> Result<Vec<Meta>, FbcError> {
    let mut values: Vec<Value> = Vec::new();
    let trimmed = src.trim_start();
    if trimmed.starts_with('[') {
        values = serde_json::from_str(src)?;
    } else {
        for item in serde_json::Deserializer::from_str(src).into_iter::<Value>() {
            values.push(item?);
        }
    }
    values.into_iter().map(typed_meta).collect()
}

fn typed_meta(value: Value) -> Result<Meta, FbcError> {
    let Some(schema) = value.get("schema").and_then(Value::as_str) else {
        return Ok(Meta::Other(value));
    };
    let schema = schema.to_string();
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let meta_err = |reason: serde_json::Error| FbcError::Meta {
        schema: schema.clone(),
        name: name.clone(),
        reason: reason.to_string(),
    };
    match schema.as_str() {
        SCHEMA_PACKAGE => Ok(Meta::Package(
            serde_json::from_value(value).map_err(meta_err)?,
        )),
        SCHEMA_CHANNEL => Ok(Meta::Channel(
            serde_json::from_value(value).map_err(meta_err)?,
        )),
        SCHEMA_BUNDLE => Ok(Meta::Bundle(
            serde_json::from_value(value).map_err(meta_err)?,
        )),
        SCHEMA_DEPRECATIONS => Ok(Meta::Deprecations(
            serde_json::from_value(value).map_err(meta_err)?,
        )),
        _ => Ok(Meta::Other(value)),
    }
}

impl BundleMeta {
    /// Look up the `olm.package` property carrying the bundle version.
    pub fn package_property(&self) -> Option<PackageProperty> {
        self.properties
            .iter()
            .find(|p| p.type_ == PROPERTY_PACKAGE)
            .and_then(|p| serde_json::from_value(p.value.clone()).ok())
    }

    /// Look up the declared media type, if any.
    pub fn media_type(&self) -> Option<String> {
        self.properties
            .iter()
            .find(|p| p.type_ == PROPERTY_MEDIATYPE)
            .and_then(|p| p.value.as_str().map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// What: Stream parsing accepts both array and concatenated forms
    ///
    /// - Input: The same two metas as a JSON array and as bare objects
    /// - Output: Two typed metas either way
    fn fbc_parse_stream_forms() {
        let array = r#"[
            {"schema":"olm.package","name":"prometheus"},
            {"schema":"olm.channel","name":"beta","package":"prometheus","entries":[]}
        ]"#;
        let stream = r#"
            {"schema":"olm.package","name":"prometheus"}
            {"schema":"olm.channel","name":"beta","package":"prometheus","entries":[]}
        "#;
        for src in [array, stream] {
            let metas = parse_stream(src).expect("parse");
            assert_eq!(metas.len(), 2);
            assert!(matches!(metas[0], Meta::Package(_)));
            assert!(matches!(metas[1], Meta::Channel(_)));
        }
    }

    #[test]
    /// What: Bundle properties expose version and media type
    ///
    /// - Input: A bundle meta with olm.package and mediatype properties
    /// - Output: Both accessors return the typed values
    fn fbc_bundle_properties() {
        let src = r#"{"schema":"olm.bundle","name":"prometheus.v1","package":"prometheus",
            "image":"quay.io/operatorhubio/prometheus@fake1.0.0",
            "properties":[
              {"type":"olm.package","value":{"packageName":"prometheus","version":"1.0.0"}},
              {"type":"olm.bundle.mediatype","value":"plain+v0"}
            ]}"#;
        let metas = parse_stream(src).expect("parse");
        let Meta::Bundle(bundle) = &metas[0] else {
            panic!("expected bundle meta");
        };
        let pkg = bundle.package_property().expect("package property");
        assert_eq!(pkg.version, "1.0.0");
        assert_eq!(bundle.media_type().as_deref(), Some("plain+v0"));
    }

    #[test]
    /// What: Unknown schemas are preserved, not rejected
    ///
    /// - Input: A meta with schema olm.future
    /// - Output: Meta::Other
    fn fbc_unknown_schema_is_other() {
        let metas = parse_stream(r#"{"schema":"olm.future","name":"x"}"#).expect("parse");
        assert!(matches!(metas[0], Meta::Other(_)));
    }
}
