//! Upgrade-edge policies: which bundles an installed bundle may move to.
//!
//! Two strategies exist. The legacy strategy walks the channel upgrade
//! graph (`replaces`, `skips`, `skipRange`); the semver strategy admits
//! versions in the caret range of the installed version, excluding the
//! installed version itself. Both are unioned with the installed version
//! so that staying put is always a valid outcome.

use semver::Version;

use crate::logic::constraint::Constraints;
use crate::logic::filter::Predicate;
use crate::state::BundleMetadata;

/// Error building a successor predicate.
#[derive(Debug, thiserror::Error)]
pub enum SuccessorError {
    /// The installed bundle's recorded version does not parse.
    #[error("currently installed version {version:?} is not valid semver: {source}")]
    InstalledVersion {
        /// Recorded version string.
        version: String,
        /// Parse failure.
        source: semver::Error,
    },
    /// The computed caret range failed to parse (programmer error guard).
    #[error("internal successor range error: {0}")]
    Range(#[from] crate::logic::constraint::ConstraintError),
}

/// What: Build the upgrade predicate for an installed bundle.
///
/// Inputs:
/// - `force_semver`: Strategy selector; `true` picks the caret policy,
///   `false` the legacy channel-graph policy.
/// - `installed`: Name and version of the installed bundle.
///
/// Output:
/// - A predicate admitting exactly the allowed successors plus the
///   installed version itself.
pub fn successors_predicate(
    force_semver: bool,
    installed: &BundleMetadata,
) -> Result<Predicate, SuccessorError> {
    let installed_version =
        Version::parse(&installed.version).map_err(|source| SuccessorError::InstalledVersion {
            version: installed.version.clone(),
            source,
        })?;
    let successors = if force_semver {
        semver_successors(&installed_version)?
    } else {
        Predicate::LegacySuccessor {
            installed_name: installed.name.clone(),
            installed_version: installed_version.clone(),
        }
    };
    // Remaining on the current version is always a valid outcome.
    Ok(Predicate::Or(vec![
        successors,
        Predicate::WithBundleVersion(installed_version),
    ]))
}

/// Caret-range successors of `installed`, excluding `installed` itself.
fn semver_successors(installed: &Version) -> Result<Predicate, SuccessorError> {
    let range = Constraints::parse(&format!("^{installed}"))?;
    Ok(Predicate::And(vec![
        Predicate::InSemverRange(range),
        Predicate::HigherBundleVersion(installed.clone()),
    ]))
}
