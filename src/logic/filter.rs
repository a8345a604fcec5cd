//! Composable bundle predicates used by the resolver.
//!
//! Predicates are a closed sum type rather than boxed closures so the
//! resolver's composition stays inspectable and the registry of filter
//! kinds is fixed.

use semver::Version;

use crate::catalog::Bundle;
use crate::logic::constraint::Constraints;

/// A boolean test over catalog bundles.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// Bundle belongs to the named package.
    WithPackageName(String),
    /// Bundle is listed in the named channel.
    InChannel(String),
    /// Bundle version satisfies the range.
    InSemverRange(Constraints),
    /// Bundle version is strictly greater than the pivot.
    HigherBundleVersion(Version),
    /// Bundle version equals the pivot (build metadata ignored).
    WithBundleVersion(Version),
    /// Some channel entry for the bundle replaces, skips, or skip-ranges
    /// the installed bundle.
    LegacySuccessor {
        /// Installed bundle name.
        installed_name: String,
        /// Installed bundle version.
        installed_version: Version,
    },
    /// Every inner predicate matches.
    And(Vec<Predicate>),
    /// At least one inner predicate matches.
    Or(Vec<Predicate>),
    /// The inner predicate does not match.
    Not(Box<Predicate>),
}

impl Predicate {
    /// Evaluate the predicate against one bundle.
    pub fn matches(&self, bundle: &Bundle) -> bool {
        match self {
            Predicate::WithPackageName(name) => bundle.package == *name,
            Predicate::InChannel(channel) => bundle.in_channel(channel),
            Predicate::InSemverRange(range) => range.matches(&bundle.version),
            Predicate::HigherBundleVersion(pivot) => {
                bundle.version.cmp_precedence(pivot).is_gt()
            }
            Predicate::WithBundleVersion(pivot) => {
                bundle.version.cmp_precedence(pivot).is_eq()
            }
            Predicate::LegacySuccessor {
                installed_name,
                installed_version,
            } => bundle.channels.iter().any(|membership| {
                let entry = &membership.entry;
                if entry.replaces == *installed_name {
                    return true;
                }
                if entry.skips.iter().any(|s| s == installed_name) {
                    return true;
                }
                if entry.skip_range.is_empty() {
                    return false;
                }
                Constraints::parse(&entry.skip_range)
                    .map(|range| range.matches(installed_version))
                    .unwrap_or(false)
            }),
            Predicate::And(inner) => inner.iter().all(|p| p.matches(bundle)),
            Predicate::Or(inner) => inner.iter().any(|p| p.matches(bundle)),
            Predicate::Not(inner) => !inner.matches(bundle),
        }
    }

    /// Convenience `Or` over a channel list.
    pub fn in_any_channel(channels: &[String]) -> Predicate {
        Predicate::Or(
            channels
                .iter()
                .map(|c| Predicate::InChannel(c.clone()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fbc::ChannelEntry;
    use crate::catalog::ChannelMembership;

    fn bundle(name: &str, version: &str, channel_entries: Vec<(&str, ChannelEntry)>) -> Bundle {
        Bundle {
            name: name.into(),
            package: "prometheus".into(),
            image: format!("quay.io/operatorhubio/prometheus@fake{version}"),
            version: Version::parse(version).expect("test version"),
            media_type: None,
            channels: channel_entries
                .into_iter()
                .map(|(channel, entry)| ChannelMembership {
                    channel: channel.into(),
                    entry,
                })
                .collect(),
            catalog: "operatorhubio".into(),
            deprecations: Vec::new(),
        }
    }

    #[test]
    /// What: Package, channel, and range predicates
    ///
    /// - Input: A beta-channel 1.0.0 bundle
    /// - Output: Matching and non-matching filters behave as labeled
    fn filter_basic_predicates() {
        let b = bundle(
            "prometheus.v1.0.0",
            "1.0.0",
            vec![("beta", ChannelEntry::default())],
        );
        assert!(Predicate::WithPackageName("prometheus".into()).matches(&b));
        assert!(!Predicate::WithPackageName("thanos".into()).matches(&b));
        assert!(Predicate::InChannel("beta".into()).matches(&b));
        assert!(!Predicate::InChannel("stable".into()).matches(&b));
        let range = Constraints::parse(">=1.0.0, <2.0.0").expect("range");
        assert!(Predicate::InSemverRange(range).matches(&b));
        assert!(Predicate::HigherBundleVersion(Version::new(0, 9, 0)).matches(&b));
        assert!(!Predicate::HigherBundleVersion(Version::new(1, 0, 0)).matches(&b));
        assert!(Predicate::WithBundleVersion(Version::new(1, 0, 0)).matches(&b));
    }

    #[test]
    /// What: Legacy successor matches replaces, skips, and skipRange edges
    ///
    /// - Input: Candidates whose entries reference the installed bundle
    ///   three different ways, plus one unrelated candidate
    /// - Output: The three edge kinds match, the unrelated one does not
    fn filter_legacy_successor_edges() {
        let installed = Predicate::LegacySuccessor {
            installed_name: "prometheus.v1.0.0".into(),
            installed_version: Version::new(1, 0, 0),
        };
        let by_replaces = bundle(
            "prometheus.v1.0.1",
            "1.0.1",
            vec![(
                "beta",
                ChannelEntry {
                    name: "prometheus.v1.0.1".into(),
                    replaces: "prometheus.v1.0.0".into(),
                    ..ChannelEntry::default()
                },
            )],
        );
        let by_skips = bundle(
            "prometheus.v1.2.0",
            "1.2.0",
            vec![(
                "beta",
                ChannelEntry {
                    name: "prometheus.v1.2.0".into(),
                    skips: vec!["prometheus.v1.0.0".into()],
                    ..ChannelEntry::default()
                },
            )],
        );
        let by_skip_range = bundle(
            "prometheus.v1.3.0",
            "1.3.0",
            vec![(
                "beta",
                ChannelEntry {
                    name: "prometheus.v1.3.0".into(),
                    skip_range: ">=1.0.0 <1.3.0".into(),
                    ..ChannelEntry::default()
                },
            )],
        );
        let unrelated = bundle(
            "prometheus.v2.0.0",
            "2.0.0",
            vec![(
                "beta",
                ChannelEntry {
                    name: "prometheus.v2.0.0".into(),
                    replaces: "prometheus.v1.3.0".into(),
                    ..ChannelEntry::default()
                },
            )],
        );
        assert!(installed.matches(&by_replaces));
        assert!(installed.matches(&by_skips));
        assert!(installed.matches(&by_skip_range));
        assert!(!installed.matches(&unrelated));
    }

    #[test]
    /// What: Boolean composition
    ///
    /// - Input: And/Or/Not over simple predicates
    /// - Output: Standard boolean behavior
    fn filter_composition() {
        let b = bundle(
            "prometheus.v1.0.0",
            "1.0.0",
            vec![("beta", ChannelEntry::default())],
        );
        let yes = Predicate::InChannel("beta".into());
        let no = Predicate::InChannel("stable".into());
        assert!(Predicate::And(vec![yes.clone(), Predicate::Not(Box::new(no.clone()))]).matches(&b));
        assert!(Predicate::Or(vec![no.clone(), yes.clone()]).matches(&b));
        assert!(!Predicate::And(vec![yes, no]).matches(&b));
        assert!(!Predicate::Or(vec![]).matches(&b));
        assert!(Predicate::And(vec![]).matches(&b));
    }
}
