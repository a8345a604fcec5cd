//! Controller settings loaded from a TOML file, with CLI overrides
//! applied by the entrypoint.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// One configured catalog source.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CatalogSourceConfig {
    /// Catalog name; recorded on every bundle resolved from it.
    pub name: String,
    /// HTTP endpoint serving the full catalog content stream.
    pub url: Option<String>,
    /// Local file or directory holding the catalog content.
    pub path: Option<PathBuf>,
}

/// Feature gates, read once per reconcile pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureGates {
    /// Select the semver upgrade-edge policy instead of the legacy
    /// channel-graph policy.
    pub force_semver_upgrade_constraints: bool,
}

/// Controller settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Reconcile worker count.
    pub workers: usize,
    /// Directory for release journals and catalog snapshots.
    pub state_dir: PathBuf,
    /// Directory of the bundle content store.
    pub content_dir: PathBuf,
    /// Directory for rolling log files; stderr-only when unset.
    pub log_dir: Option<PathBuf>,
    /// Seconds between catalog refreshes.
    pub catalog_refresh_secs: u64,
    /// Upgrade-edge strategy gate.
    pub force_semver_upgrade_constraints: bool,
    /// Configured catalogs.
    pub catalogs: Vec<CatalogSourceConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: 4,
            state_dir: PathBuf::from("state"),
            content_dir: PathBuf::from("content"),
            log_dir: None,
            catalog_refresh_secs: 300,
            force_semver_upgrade_constraints: false,
            catalogs: Vec::new(),
        }
    }
}

/// Settings load failure.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// The settings file could not be read.
    #[error("reading settings {path:?}: {source}")]
    Io {
        /// Settings file path.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
    /// The settings file did not parse.
    #[error("parsing settings {path:?}: {source}")]
    Toml {
        /// Settings file path.
        path: PathBuf,
        /// Parse failure.
        source: toml::de::Error,
    },
}

impl Settings {
    /// Load settings from a TOML file; absent keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| SettingsError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Snapshot of the feature gates.
    pub fn feature_gates(&self) -> FeatureGates {
        FeatureGates {
            force_semver_upgrade_constraints: self.force_semver_upgrade_constraints,
        }
    }
}
