//! Release records: what is currently installed for an extension.
//!
//! A release journals the rendered manifest, the store labels identifying
//! the bundle, and a lifecycle status. The store keeps the full revision
//! history per extension so upgrades supersede rather than overwrite.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a release.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    /// Release applied successfully and is current.
    #[default]
    Deployed,
    /// The last apply attempt failed.
    Failed,
    /// A newer revision replaced this release.
    Superseded,
    /// Install is being attempted.
    PendingInstall,
    /// Upgrade is being attempted.
    PendingUpgrade,
    /// The release was uninstalled.
    Uninstalled,
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Deployed => "deployed",
            Self::Failed => "failed",
            Self::Superseded => "superseded",
            Self::PendingInstall => "pending-install",
            Self::PendingUpgrade => "pending-upgrade",
            Self::Uninstalled => "uninstalled",
        };
        f.write_str(s)
    }
}

/// One installed (or attempted) revision for an extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    /// Release name; equals the owning extension's name.
    pub name: String,
    /// Revision number, starting at 1.
    pub revision: u32,
    /// Current status.
    pub status: ReleaseStatus,
    /// Canonical serialization of the rendered objects.
    pub manifest: String,
    /// Store labels (bundle name, package name, bundle version).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Release journal failure.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseStoreError {
    /// Journal I/O failed.
    #[error("release journal I/O: {0}")]
    Io(#[from] std::io::Error),
    /// Journal content did not decode.
    #[error("release journal corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Storage for release histories, keyed by extension name.
pub trait ReleaseStore: Send + Sync {
    /// Latest release for the extension, if any.
    fn current(&self, name: &str) -> Result<Option<Release>, ReleaseStoreError>;
    /// Full revision history, oldest first.
    fn history(&self, name: &str) -> Result<Vec<Release>, ReleaseStoreError>;
    /// Append a release, marking any previously deployed revision
    /// superseded.
    fn push(&self, release: Release) -> Result<(), ReleaseStoreError>;
    /// Replace the status of the latest release.
    fn set_current_status(&self, name: &str, status: ReleaseStatus)
        -> Result<(), ReleaseStoreError>;
    /// Drop the extension's entire history.
    fn remove(&self, name: &str) -> Result<(), ReleaseStoreError>;
}

/// Release store journaling each extension's history as one JSON file in
/// the state directory.
#[derive(Debug)]
pub struct FileReleaseStore {
    dir: PathBuf,
    cache: RwLock<HashMap<String, Vec<Release>>>,
}

impl FileReleaseStore {
    /// Build a store rooted at `dir` (created on first write).
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.releases.json"))
    }

    fn load(&self, name: &str) -> Result<Vec<Release>, ReleaseStoreError> {
        {
            let guard = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(history) = guard.get(name) {
                return Ok(history.clone());
            }
        }
        let path = self.path_for(name);
        let history: Vec<Release> = match fs::read_to_string(&path) {
            Ok(s) => serde_json::from_str(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let mut guard = self.cache.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(name.to_string(), history.clone());
        Ok(history)
    }

    fn persist(&self, name: &str, history: &[Release]) -> Result<(), ReleaseStoreError> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.path_for(name), serde_json::to_string(history)?)?;
        let mut guard = self.cache.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(name.to_string(), history.to_vec());
        Ok(())
    }
}

impl ReleaseStore for FileReleaseStore {
    fn current(&self, name: &str) -> Result<Option<Release>, ReleaseStoreError> {
        Ok(self.load(name)?.into_iter().next_back())
    }

    fn history(&self, name: &str) -> Result<Vec<Release>, ReleaseStoreError> {
        self.load(name)
    }

    fn push(&self, release: Release) -> Result<(), ReleaseStoreError> {
        let name = release.name.clone();
        let mut history = self.load(&name)?;
        for prior in &mut history {
            if prior.status == ReleaseStatus::Deployed {
                prior.status = ReleaseStatus::Superseded;
                prior.updated_at = release.updated_at;
            }
        }
        history.push(release);
        self.persist(&name, &history)
    }

    fn set_current_status(
        &self,
        name: &str,
        status: ReleaseStatus,
    ) -> Result<(), ReleaseStoreError> {
        let mut history = self.load(name)?;
        if let Some(last) = history.last_mut() {
            last.status = status;
            last.updated_at = Utc::now();
            self.persist(name, &history)?;
        }
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), ReleaseStoreError> {
        let path = self.path_for(name);
        if path.exists() {
            fs::remove_file(path)?;
        }
        let mut guard = self.cache.write().unwrap_or_else(|e| e.into_inner());
        guard.remove(name);
        Ok(())
    }
}
