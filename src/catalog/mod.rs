//! Catalog contents management: the typed bundle view and the shared store.
//!
//! This module maintains an in-memory view of every configured catalog and
//! exposes utilities to:
//! - Join raw FBC metas into typed [`Bundle`] records (version parsed from
//!   the package property, channel memberships attached, deprecations
//!   carried along)
//! - Load/save catalog snapshots from/to disk as JSON
//! - Serve the read-through `bundles()` view the resolver consumes
//!
//! All shared state is guarded by `RwLock` for concurrent read access and
//! safe mutation from background refresh tasks.

pub mod fbc;

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, RwLock};

use semver::Version;
use serde::{Deserialize, Serialize};

use fbc::{ChannelEntry, DeprecationEntry, Meta};

/// Media type of registry bundles; assumed when a bundle declares none.
pub const MEDIA_TYPE_REGISTRY: &str = "registry+v1";
/// Media type of plain manifest bundles.
pub const MEDIA_TYPE_PLAIN: &str = "plain+v0";

/// Membership of a bundle in one channel, carrying that channel's entry
/// for the bundle (the upgrade-graph edge data).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMembership {
    /// Channel name.
    pub channel: String,
    /// The channel's entry naming this bundle.
    pub entry: ChannelEntry,
}

/// Typed, read-only view of one catalog bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    /// Bundle name, unique within its catalog.
    pub name: String,
    /// Owning package.
    pub package: String,
    /// Image reference the content is pulled from.
    pub image: String,
    /// Version parsed from the package property.
    pub version: Version,
    /// Declared media type; `None` means registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Channels that list this bundle, with their entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<ChannelMembership>,
    /// Name of the catalog this bundle was discovered in.
    pub catalog: String,
    /// Catalog deprecation entries for this bundle's package.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deprecations: Vec<DeprecationEntry>,
}

impl Bundle {
    /// Effective media type, defaulting absent declarations to registry.
    pub fn media_type_or_default(&self) -> &str {
        self.media_type.as_deref().unwrap_or(MEDIA_TYPE_REGISTRY)
    }

    /// Whether the bundle is listed in the named channel.
    pub fn in_channel(&self, channel: &str) -> bool {
        self.channels.iter().any(|m| m.channel == channel)
    }

    /// Whether a bundle-level deprecation entry names this bundle.
    pub fn is_deprecated(&self) -> bool {
        self.deprecations.iter().any(|e| {
            e.reference.schema == fbc::SCHEMA_BUNDLE && e.reference.name == self.name
        })
    }
}

/// Parsed contents of one catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Contents {
    /// Catalog name.
    pub name: String,
    /// Resolved reference of the content the snapshot was built from.
    pub resolved_ref: String,
    /// Typed bundle view.
    pub bundles: Vec<Bundle>,
    /// Deprecation entries per package (all reference schemas).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub deprecations: HashMap<String, Vec<DeprecationEntry>>,
}

/// What: Join raw catalog metas into typed catalog contents.
///
/// Inputs:
/// - `catalog`: Catalog name recorded on every bundle.
/// - `resolved_ref`: Resolved content reference of this snapshot.
/// - `metas`: Parsed FBC metas in stream order.
///
/// Output:
/// - [`Contents`] with one [`Bundle`] per valid `olm.bundle` meta.
///
/// Details:
/// - Bundles without a package property or with a version that is not
///   valid semver violate the catalog invariants and are dropped with a
///   warning; one bad bundle must not hide the rest of the catalog.
pub fn build_contents(catalog: &str, resolved_ref: &str, metas: Vec<Meta>) -> Contents {
    let mut channels: Vec<fbc::ChannelMeta> = Vec::new();
    let mut bundles: Vec<fbc::BundleMeta> = Vec::new();
    let mut deprecations: HashMap<String, Vec<DeprecationEntry>> = HashMap::new();
    for meta in metas {
        match meta {
            Meta::Channel(ch) => channels.push(ch),
            Meta::Bundle(b) => bundles.push(b),
            Meta::Deprecations(dep) => {
                deprecations.entry(dep.package).or_default().extend(dep.entries);
            }
            Meta::Package(_) | Meta::Other(_) => {}
        }
    }

    let mut typed = Vec::with_capacity(bundles.len());
    for meta in bundles {
        let Some(pkg_prop) = meta.package_property() else {
            tracing::warn!(catalog, bundle = %meta.name, "bundle missing olm.package property, skipping");
            continue;
        };
        let version = match Version::parse(&pkg_prop.version) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    catalog,
                    bundle = %meta.name,
                    version = %pkg_prop.version,
                    "bundle version is not valid semver, skipping: {e}"
                );
                continue;
            }
        };
        let memberships: Vec<ChannelMembership> = channels
            .iter()
            .filter(|ch| ch.package == meta.package)
            .flat_map(|ch| {
                ch.entries
                    .iter()
                    .filter(|entry| entry.name == meta.name)
                    .map(|entry| ChannelMembership {
                        channel: ch.name.clone(),
                        entry: entry.clone(),
                    })
            })
            .collect();
        let media_type = meta.media_type();
        let package_deprecations = deprecations.get(&meta.package).cloned().unwrap_or_default();
        typed.push(Bundle {
            name: meta.name,
            package: meta.package,
            image: meta.image,
            version,
            media_type,
            channels: memberships,
            catalog: catalog.to_string(),
            deprecations: package_deprecations,
        });
    }
    Contents {
        name: catalog.to_string(),
        resolved_ref: resolved_ref.to_string(),
        bundles: typed,
        deprecations,
    }
}

/// Error surfaced by bundle providers.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider could not produce a bundle listing.
    #[error("catalog provider unavailable: {0}")]
    Unavailable(String),
}

/// Read-through source of catalog bundles for the resolver.
pub trait BundleProvider: Send + Sync {
    /// Produce the current set of bundles across all catalogs.
    fn bundles(&self) -> impl Future<Output = Result<Vec<Bundle>, ProviderError>> + Send;
}

impl<P: BundleProvider> BundleProvider for Arc<P> {
    fn bundles(&self) -> impl Future<Output = Result<Vec<Bundle>, ProviderError>> + Send {
        (**self).bundles()
    }
}

/// Process-local store of catalog contents, shared between the refresh
/// tasks and the reconcile workers.
#[derive(Debug, Default)]
pub struct Store {
    catalogs: RwLock<HashMap<String, Arc<Contents>>>,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// What: Replace one catalog's contents.
    ///
    /// Inputs:
    /// - `contents`: Freshly built catalog contents.
    ///
    /// Output:
    /// - The previously stored resolved reference, if any.
    pub fn upsert(&self, contents: Contents) -> Option<String> {
        let mut guard = self.catalogs.write().unwrap_or_else(|e| e.into_inner());
        guard
            .insert(contents.name.clone(), Arc::new(contents))
            .map(|old| old.resolved_ref.clone())
    }

    /// Remove a catalog; returns whether it was present.
    pub fn remove(&self, name: &str) -> bool {
        let mut guard = self.catalogs.write().unwrap_or_else(|e| e.into_inner());
        guard.remove(name).is_some()
    }

    /// Resolved reference of a stored catalog, if present.
    pub fn resolved_ref(&self, name: &str) -> Option<String> {
        let guard = self.catalogs.read().unwrap_or_else(|e| e.into_inner());
        guard.get(name).map(|c| c.resolved_ref.clone())
    }

    /// All bundles across all stored catalogs.
    pub fn all_bundles(&self) -> Vec<Bundle> {
        let guard = self.catalogs.read().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        for contents in guard.values() {
            out.extend(contents.bundles.iter().cloned());
        }
        out
    }

    /// What: Load catalog snapshots from `path` if a valid JSON exists.
    ///
    /// Silently ignores errors and leaves the store unchanged on failure.
    pub fn load_from_disk(&self, path: &Path) {
        if let Ok(s) = fs::read_to_string(path)
            && let Ok(list) = serde_json::from_str::<Vec<Contents>>(&s)
        {
            let mut guard = self.catalogs.write().unwrap_or_else(|e| e.into_inner());
            for contents in list {
                guard.insert(contents.name.clone(), Arc::new(contents));
            }
        }
    }

    /// What: Persist the current snapshots to `path` as JSON.
    ///
    /// Silently ignores errors to avoid interrupting reconciliation.
    pub fn save_to_disk(&self, path: &Path) {
        let list: Vec<Contents> = {
            let guard = self.catalogs.read().unwrap_or_else(|e| e.into_inner());
            guard.values().map(|c| (**c).clone()).collect()
        };
        if let Ok(s) = serde_json::to_string(&list) {
            let _ = fs::write(path, s);
        }
    }
}

impl BundleProvider for Store {
    fn bundles(&self) -> impl Future<Output = Result<Vec<Bundle>, ProviderError>> + Send {
        let bundles = self.all_bundles();
        async move { Ok(bundles) }
    }
}
