//! Bundle content unpacking, modeled as a non-blocking state machine.
//!
//! The unpacker never waits for content to arrive. It reports one of four
//! states per call: `Unpacked` (content is sealed in the store, a
//! read-only filesystem handle is returned), `Unpacking` (materialization
//! is in flight), `Pending` (a pull has been requested from the image
//! puller), or `Failed`. The reconciler is re-entered by the next event
//! rather than blocking on progress.
//!
//! Actual image pulling is an external concern; the content-store
//! implementation here requests pulls over a channel and owns the on-disk
//! layout plus an LRU cache of open bundle handles.

use std::future::Future;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lru::LruCache;
use tokio::sync::mpsc;

/// Marker file a sealed (fully materialized) bundle directory carries.
const UNPACKED_MARKER: &str = ".unpacked";

/// Number of open bundle handles kept hot.
const HANDLE_CACHE_SIZE: usize = 64;

/// Kind of bundle source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    /// Content is pulled from an image reference.
    Image,
}

/// Image-backed source parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
    /// Image reference, e.g. `quay.io/operatorhubio/prometheus@sha256:...`.
    pub reference: String,
}

/// Where a bundle's content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSource {
    /// Source discriminator.
    pub source_type: SourceType,
    /// Image parameters; required for [`SourceType::Image`].
    pub image: Option<ImageSource>,
}

impl BundleSource {
    /// Image-backed source for `reference`.
    pub fn image(reference: &str) -> Self {
        Self {
            source_type: SourceType::Image,
            image: Some(ImageSource {
                reference: reference.to_string(),
            }),
        }
    }
}

/// Lifecycle state of an unpack request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackState {
    /// Content pull has been requested but has not started materializing.
    Pending,
    /// Content is materializing.
    Unpacking,
    /// Content is available; `UnpackResult::bundle` is set.
    Unpacked,
    /// Unpacking failed terminally.
    Failed,
}

/// Read-only handle over an unpacked bundle's filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFs {
    root: PathBuf,
}

impl BundleFs {
    /// Open a handle rooted at `root`.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Root directory of the bundle content.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a relative path exists in the bundle.
    pub fn exists(&self, rel: &str) -> bool {
        self.root.join(rel).exists()
    }

    /// Read a relative path as UTF-8 text.
    pub fn read(&self, rel: &str) -> std::io::Result<String> {
        std::fs::read_to_string(self.root.join(rel))
    }

    /// List the file names of a relative directory, sorted for stable
    /// rendering order.
    pub fn list(&self, rel: &str) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(self.root.join(rel))? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Outcome of one unpack call.
#[derive(Debug, Clone)]
pub struct UnpackResult {
    /// Lifecycle state.
    pub state: UnpackState,
    /// Human-readable progress or failure detail.
    pub message: String,
    /// Filesystem handle; set only for [`UnpackState::Unpacked`].
    pub bundle: Option<BundleFs>,
}

/// Unpack failure.
#[derive(Debug, thiserror::Error)]
pub enum UnpackError {
    /// The source is not of a kind this unpacker supports.
    #[error("unsupported bundle source type")]
    UnsupportedSource,
    /// Content store I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Non-blocking source fetch.
pub trait Unpacker: Send + Sync {
    /// Report the current unpack state for `source`, kicking off work as
    /// needed but never waiting for it.
    fn unpack(
        &self,
        source: &BundleSource,
    ) -> impl Future<Output = Result<UnpackResult, UnpackError>> + Send;
}

impl<U: Unpacker> Unpacker for std::sync::Arc<U> {
    fn unpack(
        &self,
        source: &BundleSource,
    ) -> impl Future<Output = Result<UnpackResult, UnpackError>> + Send {
        (**self).unpack(source)
    }
}

/// Request for the external image puller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    /// Image reference to materialize into the content store.
    pub reference: String,
}

/// Content-store-backed unpacker.
pub struct ContentStoreUnpacker {
    root: PathBuf,
    pull_tx: Option<mpsc::UnboundedSender<PullRequest>>,
    handles: Mutex<LruCache<String, BundleFs>>,
}

impl ContentStoreUnpacker {
    /// What: Build an unpacker over the content store at `root`.
    ///
    /// Inputs:
    /// - `root`: Directory holding one subdirectory per bundle image.
    /// - `pull_tx`: Channel to the image puller; `None` makes missing
    ///   content stay `Pending` until materialized externally.
    pub fn new(root: PathBuf, pull_tx: Option<mpsc::UnboundedSender<PullRequest>>) -> Self {
        let cache_size = NonZeroUsize::new(HANDLE_CACHE_SIZE)
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            root,
            pull_tx,
            handles: Mutex::new(LruCache::new(cache_size)),
        }
    }

    /// Directory key for an image reference (filesystem-safe).
    pub fn store_key(reference: &str) -> String {
        reference
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }

    fn dir_for(&self, reference: &str) -> PathBuf {
        self.root.join(Self::store_key(reference))
    }

    /// What: Materialize bundle content directly into the store and seal it.
    ///
    /// Inputs:
    /// - `reference`: Image reference the content belongs to.
    /// - `files`: Relative path / content pairs.
    ///
    /// Details:
    /// - Used by the in-process puller and by tests; a sealed directory is
    ///   what `unpack` reports as `Unpacked`.
    pub async fn put(&self, reference: &str, files: &[(&str, &str)]) -> std::io::Result<()> {
        let dir = self.dir_for(reference);
        for (rel, content) in files {
            let path = dir.join(rel);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, content).await?;
        }
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(UNPACKED_MARKER), b"").await?;
        self.invalidate(reference);
        Ok(())
    }

    /// Create the bundle directory without sealing it, so `unpack`
    /// observes `Unpacking`.
    pub async fn begin(&self, reference: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.dir_for(reference)).await?;
        self.invalidate(reference);
        Ok(())
    }

    /// Remove a bundle's content from the store.
    pub async fn prune(&self, reference: &str) -> std::io::Result<()> {
        let dir = self.dir_for(reference);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        self.invalidate(reference);
        Ok(())
    }

    fn invalidate(&self, reference: &str) {
        let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        guard.pop(&Self::store_key(reference));
    }

    fn cached(&self, reference: &str) -> Option<BundleFs> {
        let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(&Self::store_key(reference)).cloned()
    }

    fn remember(&self, reference: &str, fs: BundleFs) {
        let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        guard.put(Self::store_key(reference), fs);
    }
}

impl Unpacker for ContentStoreUnpacker {
    fn unpack(
        &self,
        source: &BundleSource,
    ) -> impl Future<Output = Result<UnpackResult, UnpackError>> + Send {
        let source = source.clone();
        async move {
            let Some(image) = &source.image else {
                return Err(UnpackError::UnsupportedSource);
            };
            let reference = image.reference.as_str();
            if let Some(fs) = self.cached(reference) {
                return Ok(UnpackResult {
                    state: UnpackState::Unpacked,
                    message: format!("unpacked {reference:?} successfully"),
                    bundle: Some(fs),
                });
            }
            let dir = self.dir_for(reference);
            if tokio::fs::try_exists(dir.join(UNPACKED_MARKER)).await? {
                let fs = BundleFs::new(dir);
                self.remember(reference, fs.clone());
                return Ok(UnpackResult {
                    state: UnpackState::Unpacked,
                    message: format!("unpacked {reference:?} successfully"),
                    bundle: Some(fs),
                });
            }
            if tokio::fs::try_exists(&dir).await? {
                return Ok(UnpackResult {
                    state: UnpackState::Unpacking,
                    message: format!("unpack of {reference:?} is in progress"),
                    bundle: None,
                });
            }
            if let Some(tx) = &self.pull_tx {
                let _ = tx.send(PullRequest {
                    reference: reference.to_string(),
                });
            }
            Ok(UnpackResult {
                state: UnpackState::Pending,
                message: format!("waiting for content of {reference:?} to be pulled"),
                bundle: None,
            })
        }
    }
}
