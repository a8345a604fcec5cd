//! Bundle resolution: one bundle out of all catalogs, under package,
//! version-range, channel, and upgrade-edge constraints.
//!
//! Resolution is deterministic for a fixed catalog snapshot: candidates
//! are filtered by a predicate conjunction, sorted by version descending,
//! and then stably re-sorted so non-deprecated bundles come first. The
//! head of the final ordering wins.

use semver::Version;

use crate::catalog::fbc::DeprecationEntry;
use crate::catalog::{Bundle, BundleProvider, ProviderError};
use crate::logic::constraint::{ConstraintError, Constraints};
use crate::logic::filter::Predicate;
use crate::logic::sort;
use crate::logic::successors::{self, SuccessorError};
use crate::state::{BundleMetadata, ClusterExtension, UpgradeConstraintPolicy};

/// Resolution failure; the `Display` text is part of the status contract.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// No bundle satisfied the constraints. The message names the package
    /// and, when present, the version range, channel(s), and installed
    /// version, in that stable order.
    #[error("{0}")]
    NoCandidates(String),
    /// The spec's version range did not parse.
    #[error("desired version range {range:?} is invalid: {source}")]
    InvalidRange {
        /// The offending range.
        range: String,
        /// Parse failure.
        source: ConstraintError,
    },
    /// The installed bundle's version could not be used as an upgrade pivot.
    #[error(transparent)]
    Successor(#[from] SuccessorError),
    /// Two extensions require the same package.
    #[error("duplicate identifier \"required package \\\"{package}\\\"\" in input")]
    DuplicatePackage {
        /// The doubly-required package.
        package: String,
    },
    /// The catalog provider failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Deprecation information attached to a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeprecationOutcome {
    /// No deprecation entries apply to the resolved package.
    None,
    /// The resolved package's deprecation entries from its catalog.
    Entries(Vec<DeprecationEntry>),
    /// Catalogs disagree about the package's deprecations; the conflicting
    /// catalog names are listed.
    Divergent(Vec<String>),
}

/// Outcome of a successful resolution pass.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The selected bundle.
    pub bundle: Bundle,
    /// Its version (parsed from the package property).
    pub version: Version,
    /// Applicable deprecation information.
    pub deprecation: DeprecationOutcome,
}

/// What: Verify that no other extension already requires this package.
///
/// Inputs:
/// - `all`: Every known extension.
/// - `ext`: The extension being reconciled.
///
/// Output:
/// - `Err(ResolveError::DuplicatePackage)` when a different extension
///   names the same package, `Ok(())` otherwise.
pub fn ensure_unique_package(
    all: &[ClusterExtension],
    ext: &ClusterExtension,
) -> Result<(), ResolveError> {
    let package = ext.package_name();
    if package.is_empty() {
        return Ok(());
    }
    let clash = all
        .iter()
        .any(|other| other.name() != ext.name() && other.package_name() == package);
    if clash {
        return Err(ResolveError::DuplicatePackage {
            package: package.to_string(),
        });
    }
    Ok(())
}

/// Catalog-backed resolver.
#[derive(Debug)]
pub struct Resolver<P: BundleProvider> {
    provider: P,
}

impl<P: BundleProvider> Resolver<P> {
    /// Build a resolver over a bundle provider.
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// What: Resolve exactly one bundle for the extension.
    ///
    /// Inputs:
    /// - `ext`: Desired state (package, range, channels, policy).
    /// - `installed`: Currently installed bundle, if any.
    /// - `force_semver`: Upgrade-edge strategy selector, read once per
    ///   reconcile by the caller.
    ///
    /// Output:
    /// - The winning bundle, its version, and applicable deprecation data,
    ///   or a [`ResolveError`] whose message is status contract.
    pub async fn resolve(
        &self,
        ext: &ClusterExtension,
        installed: Option<&BundleMetadata>,
        force_semver: bool,
    ) -> Result<Resolution, ResolveError> {
        let package = ext.package_name();
        let range_src = ext.version_range();
        let channels = ext.channels();

        let mut predicates = vec![Predicate::WithPackageName(package.to_string())];
        if !range_src.is_empty() {
            let range = Constraints::parse(range_src).map_err(|source| {
                ResolveError::InvalidRange {
                    range: range_src.to_string(),
                    source,
                }
            })?;
            predicates.push(Predicate::InSemverRange(range));
        }
        if !channels.is_empty() {
            predicates.push(Predicate::in_any_channel(channels));
        }
        let base = Predicate::And(predicates);

        let enforce = ext.upgrade_constraint_policy() == UpgradeConstraintPolicy::Enforce;
        let upgrade = match installed {
            Some(installed) if enforce => {
                Some(successors::successors_predicate(force_semver, installed)?)
            }
            _ => None,
        };

        let all = self.provider.bundles().await?;
        let mut candidates: Vec<&Bundle> = all.iter().filter(|b| base.matches(b)).collect();
        let base_matched = !candidates.is_empty();
        if let Some(upgrade) = &upgrade {
            candidates.retain(|b| upgrade.matches(b));
        }

        if candidates.is_empty() {
            return Err(ResolveError::NoCandidates(no_candidates_message(
                package,
                range_src,
                channels,
                installed,
                base_matched.then(|| permitted_versions(&all, package, channels, upgrade.as_ref())),
            )));
        }

        candidates.sort_by(|a, b| sort::by_version_desc(a, b));
        candidates.sort_by(|a, b| sort::by_deprecated(a, b));
        let head = candidates[0].clone();
        let deprecation = deprecation_outcome(&all, &head);
        let version = head.version.clone();
        Ok(Resolution {
            bundle: head,
            version,
            deprecation,
        })
    }
}

/// Versions the upgrade predicate still admits for the package, ascending.
fn permitted_versions(
    all: &[Bundle],
    package: &str,
    channels: &[String],
    upgrade: Option<&Predicate>,
) -> Vec<Version> {
    let channel_pred =
        (!channels.is_empty()).then(|| Predicate::in_any_channel(channels));
    let mut versions: Vec<Version> = all
        .iter()
        .filter(|b| b.package == package)
        .filter(|b| channel_pred.as_ref().is_none_or(|p| p.matches(b)))
        .filter(|b| upgrade.is_none_or(|p| p.matches(b)))
        .map(|b| b.version.clone())
        .collect();
    versions.sort_by(|a, b| a.cmp_precedence(b));
    versions.dedup_by(|a, b| a.cmp_precedence(b).is_eq());
    versions
}

/// Stable empty-candidate message: package, then version range, then
/// channel(s); prefixed with the installed version when upgrading; the
/// `constraints not satisfiable` form when only the upgrade predicate
/// eliminated the candidates.
fn no_candidates_message(
    package: &str,
    range: &str,
    channels: &[String],
    installed: Option<&BundleMetadata>,
    permitted: Option<Vec<Version>>,
) -> String {
    let prefix = installed.map_or(String::new(), |i| {
        format!("error upgrading from currently installed version {:?}: ", i.version)
    });
    if let Some(permitted) = permitted {
        let matching = if range.is_empty() {
            format!("no bundles of package {package:?}")
        } else {
            format!("no bundles of package {package:?} matching version {range:?}")
        };
        let versions = permitted
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        return format!(
            "{prefix}constraints not satisfiable: {matching} are permitted upgrades; permitted versions are {versions}"
        );
    }
    let body = match (range.is_empty(), channels.len()) {
        (false, 1) => format!(
            "no package {package:?} matching version {range:?} in channel {:?} found",
            channels[0]
        ),
        (false, 0) => format!("no package {package:?} matching version {range:?} found"),
        (false, _) => format!(
            "no package {package:?} matching version {range:?} in channels {channels:?} found"
        ),
        (true, 1) => format!("no package {package:?} in channel {:?} found", channels[0]),
        (true, 0) => format!("no package {package:?} found"),
        (true, _) => format!("no package {package:?} in channels {channels:?} found"),
    };
    format!("{prefix}{body}")
}

/// Deprecation data for the winning bundle, with cross-catalog divergence
/// detection: when another catalog carries the same package with a
/// different deprecation entry set, the information is reported divergent
/// instead of guessed at.
fn deprecation_outcome(all: &[Bundle], head: &Bundle) -> DeprecationOutcome {
    let mut per_catalog: Vec<(&str, Vec<DeprecationEntry>)> = Vec::new();
    for b in all.iter().filter(|b| b.package == head.package) {
        if per_catalog.iter().any(|(c, _)| *c == b.catalog) {
            continue;
        }
        let mut entries = b.deprecations.clone();
        entries.sort_by(|a, b| {
            (&a.reference.schema, &a.reference.name, &a.message)
                .cmp(&(&b.reference.schema, &b.reference.name, &b.message))
        });
        per_catalog.push((&b.catalog, entries));
    }
    let divergent = per_catalog
        .iter()
        .any(|(_, entries)| *entries != per_catalog[0].1);
    if divergent {
        let mut catalogs: Vec<String> =
            per_catalog.iter().map(|(c, _)| (*c).to_string()).collect();
        catalogs.sort();
        return DeprecationOutcome::Divergent(catalogs);
    }
    if head.deprecations.is_empty() {
        DeprecationOutcome::None
    } else {
        DeprecationOutcome::Entries(head.deprecations.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fbc::{ChannelEntry, DeprecationRef};
    use crate::catalog::ChannelMembership;
    use crate::state::CatalogSourceSpec;

    /// Static provider for resolver tests.
    struct Fixed(Vec<Bundle>);

    impl BundleProvider for Fixed {
        fn bundles(
            &self,
        ) -> impl std::future::Future<Output = Result<Vec<Bundle>, ProviderError>> + Send
        {
            let bundles = self.0.clone();
            async move { Ok(bundles) }
        }
    }

    fn bundle(version: &str, channel: &str, entry: ChannelEntry) -> Bundle {
        Bundle {
            name: format!("operatorhub/prometheus/{channel}/{version}"),
            package: "prometheus".into(),
            image: format!("quay.io/operatorhubio/prometheus@fake{version}"),
            version: Version::parse(version).expect("test version"),
            media_type: None,
            channels: vec![ChannelMembership {
                channel: channel.into(),
                entry,
            }],
            catalog: "operatorhubio".into(),
            deprecations: Vec::new(),
        }
    }

    fn beta_catalog() -> Vec<Bundle> {
        ["1.0.0", "1.0.1", "1.2.0", "2.0.0"]
            .iter()
            .map(|v| {
                bundle(
                    v,
                    "beta",
                    ChannelEntry {
                        name: format!("operatorhub/prometheus/beta/{v}"),
                        ..ChannelEntry::default()
                    },
                )
            })
            .collect()
    }

    fn ext(version: &str, channels: &[&str], policy: UpgradeConstraintPolicy) -> ClusterExtension {
        let mut ext = ClusterExtension::default();
        ext.metadata.name = "prom".into();
        ext.spec.source.catalog = Some(CatalogSourceSpec {
            package_name: "prometheus".into(),
            version: version.into(),
            channels: channels.iter().map(|c| (*c).to_string()).collect(),
            upgrade_constraint_policy: policy,
        });
        ext
    }

    #[tokio::test]
    /// What: Empty catalog produces the bare missing-package message
    ///
    /// - Input: No bundles; spec {packageName: "foo"}
    /// - Output: Error `no package "foo" found`
    async fn resolve_missing_package_message() {
        let resolver = Resolver::new(Fixed(Vec::new()));
        let mut e = ext("", &[], UpgradeConstraintPolicy::Enforce);
        if let Some(c) = e.spec.source.catalog.as_mut() {
            c.package_name = "foo".into();
        }
        let err = resolver.resolve(&e, None, false).await.expect_err("fails");
        assert_eq!(err.to_string(), "no package \"foo\" found");
    }

    #[tokio::test]
    /// What: Version pin inside a channel resolves the exact bundle
    ///
    /// - Input: Beta catalog; spec version 1.0.0 channel beta
    /// - Output: The 1.0.0 bundle and image
    async fn resolve_version_in_channel() {
        let resolver = Resolver::new(Fixed(beta_catalog()));
        let e = ext("1.0.0", &["beta"], UpgradeConstraintPolicy::Enforce);
        let res = resolver.resolve(&e, None, false).await.expect("resolves");
        assert_eq!(res.bundle.name, "operatorhub/prometheus/beta/1.0.0");
        assert_eq!(res.bundle.image, "quay.io/operatorhubio/prometheus@fake1.0.0");
        assert_eq!(res.version, Version::new(1, 0, 0));
        assert_eq!(res.deprecation, DeprecationOutcome::None);
    }

    #[tokio::test]
    /// What: Highest version wins; deprecation demotes equal-or-higher
    ///
    /// - Input: Beta catalog with 2.0.0 bundle-deprecated
    /// - Output: 1.2.0 wins over the deprecated 2.0.0
    async fn resolve_prefers_non_deprecated() {
        let mut bundles = beta_catalog();
        let name = "operatorhub/prometheus/beta/2.0.0".to_string();
        bundles[3].deprecations = vec![DeprecationEntry {
            reference: DeprecationRef {
                schema: crate::catalog::fbc::SCHEMA_BUNDLE.into(),
                name: name.clone(),
            },
            message: "2.0.0 is deprecated".into(),
        }];
        let resolver = Resolver::new(Fixed(bundles));
        let e = ext("", &["beta"], UpgradeConstraintPolicy::Enforce);
        let res = resolver.resolve(&e, None, false).await.expect("resolves");
        assert_eq!(res.bundle.name, "operatorhub/prometheus/beta/1.2.0");
    }

    #[tokio::test]
    /// What: Semver policy blocks a cross-major upgrade and enumerates the
    /// permitted in-range alternatives
    ///
    /// - Input: Installed 1.0.0, spec version 2.0.0, Enforce, semver policy
    /// - Output: constraints-not-satisfiable error listing 1.0.0, 1.0.1, 1.2.0
    async fn resolve_semver_blocks_cross_major() {
        let resolver = Resolver::new(Fixed(beta_catalog()));
        let e = ext("2.0.0", &["beta"], UpgradeConstraintPolicy::Enforce);
        let installed = BundleMetadata {
            name: "operatorhub/prometheus/beta/1.0.0".into(),
            version: "1.0.0".into(),
        };
        let err = resolver
            .resolve(&e, Some(&installed), true)
            .await
            .expect_err("blocked");
        let msg = err.to_string();
        assert!(msg.contains("constraints not satisfiable"), "{msg}");
        assert!(msg.contains("1.0.0, 1.0.1, 1.2.0"), "{msg}");
        assert!(msg.starts_with("error upgrading from currently installed version \"1.0.0\""));
    }

    #[tokio::test]
    /// What: Legacy policy requires a replaces chain edge
    ///
    /// - Input: 1.0.1 replaces 1.0.0, 1.2.0 replaces 1.0.1; installed 1.0.0
    /// - Output: 1.2.0 rejected, 1.0.1 resolves
    async fn resolve_legacy_replaces_chain() {
        let bundles = vec![
            bundle(
                "1.0.0",
                "beta",
                ChannelEntry {
                    name: "operatorhub/prometheus/beta/1.0.0".into(),
                    ..ChannelEntry::default()
                },
            ),
            bundle(
                "1.0.1",
                "beta",
                ChannelEntry {
                    name: "operatorhub/prometheus/beta/1.0.1".into(),
                    replaces: "operatorhub/prometheus/beta/1.0.0".into(),
                    ..ChannelEntry::default()
                },
            ),
            bundle(
                "1.2.0",
                "beta",
                ChannelEntry {
                    name: "operatorhub/prometheus/beta/1.2.0".into(),
                    replaces: "operatorhub/prometheus/beta/1.0.1".into(),
                    ..ChannelEntry::default()
                },
            ),
        ];
        let resolver = Resolver::new(Fixed(bundles));
        let installed = BundleMetadata {
            name: "operatorhub/prometheus/beta/1.0.0".into(),
            version: "1.0.0".into(),
        };
        let blocked = ext("1.2.0", &["beta"], UpgradeConstraintPolicy::Enforce);
        assert!(resolver
            .resolve(&blocked, Some(&installed), false)
            .await
            .is_err());
        let allowed = ext("1.0.1", &["beta"], UpgradeConstraintPolicy::Enforce);
        let res = resolver
            .resolve(&allowed, Some(&installed), false)
            .await
            .expect("resolves");
        assert_eq!(res.bundle.name, "operatorhub/prometheus/beta/1.0.1");
    }

    #[tokio::test]
    /// What: Ignore policy permits a downgrade
    ///
    /// - Input: Installed 2.0.0; spec version 1.0.0 with Ignore
    /// - Output: Resolves to the 1.0.0 image
    async fn resolve_ignore_policy_downgrade() {
        let resolver = Resolver::new(Fixed(beta_catalog()));
        let installed = BundleMetadata {
            name: "operatorhub/prometheus/beta/2.0.0".into(),
            version: "2.0.0".into(),
        };
        let e = ext("1.0.0", &["beta"], UpgradeConstraintPolicy::Ignore);
        let res = resolver
            .resolve(&e, Some(&installed), true)
            .await
            .expect("resolves");
        assert_eq!(res.bundle.image, "quay.io/operatorhubio/prometheus@fake1.0.0");
    }

    #[tokio::test]
    /// What: Message ordering names range and channel when both are set
    ///
    /// - Input: Beta catalog; spec version 9.0.0 channel beta
    /// - Output: `no package "prometheus" matching version "9.0.0" in
    ///   channel "beta" found`
    async fn resolve_message_orders_range_then_channel() {
        let resolver = Resolver::new(Fixed(beta_catalog()));
        let e = ext("9.0.0", &["beta"], UpgradeConstraintPolicy::Enforce);
        let err = resolver.resolve(&e, None, false).await.expect_err("fails");
        assert_eq!(
            err.to_string(),
            "no package \"prometheus\" matching version \"9.0.0\" in channel \"beta\" found"
        );
    }

    #[tokio::test]
    /// What: Divergent catalog deprecations are reported, not guessed
    ///
    /// - Input: Same package in two catalogs, one deprecating the bundle
    /// - Output: DeprecationOutcome::Divergent with both catalog names
    async fn resolve_divergent_deprecations() {
        let mut a = bundle("1.0.0", "beta", ChannelEntry::default());
        a.catalog = "cat-a".into();
        let mut b = bundle("1.0.0", "beta", ChannelEntry::default());
        b.catalog = "cat-b".into();
        b.deprecations = vec![DeprecationEntry {
            reference: DeprecationRef {
                schema: crate::catalog::fbc::SCHEMA_PACKAGE.into(),
                name: String::new(),
            },
            message: "package is deprecated".into(),
        }];
        let resolver = Resolver::new(Fixed(vec![a, b]));
        let e = ext("", &[], UpgradeConstraintPolicy::Enforce);
        let res = resolver.resolve(&e, None, false).await.expect("resolves");
        assert_eq!(
            res.deprecation,
            DeprecationOutcome::Divergent(vec!["cat-a".into(), "cat-b".into()])
        );
    }

    #[test]
    /// What: Duplicate package requirement is a typed, worded error
    ///
    /// - Input: Two extensions requiring "prometheus"
    /// - Output: `duplicate identifier "required package \"prometheus\"" in input`
    fn resolve_duplicate_package_detection() {
        let mut a = ext("", &[], UpgradeConstraintPolicy::Enforce);
        a.metadata.name = "a".into();
        let mut b = ext("", &[], UpgradeConstraintPolicy::Enforce);
        b.metadata.name = "b".into();
        let all = vec![a.clone(), b];
        let err = ensure_unique_package(&all, &a).expect_err("duplicate");
        assert_eq!(
            err.to_string(),
            "duplicate identifier \"required package \\\"prometheus\\\"\" in input"
        );
        let solo = vec![a.clone()];
        assert!(ensure_unique_package(&solo, &a).is_ok());
    }
}
