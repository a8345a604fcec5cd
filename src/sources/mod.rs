//! Catalog content retrieval split into submodules.

/// Catalog HTTP backend fetching.
mod catalogd;
/// Local catalog files and directories.
mod file;

/// What: Result type alias for sources module errors.
///
/// Inputs: None (type alias).
///
/// Output: Result type with boxed error trait object.
///
/// Details: Standard error type for network and filesystem retrieval in
/// the sources module.
type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub use catalogd::fetch_catalog_contents;
pub use file::read_catalog_path;
