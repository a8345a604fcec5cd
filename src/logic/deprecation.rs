//! Deprecation status projection.
//!
//! Given the deprecation entries that travelled with the resolved bundle,
//! project the three schema-specific conditions and the aggregate
//! `Deprecated` condition onto the extension status. Channel entries are
//! filtered to the channels the extension is configured with; bundle
//! entries to the resolved bundle name.

use std::collections::HashMap;

use crate::catalog::fbc::{self, DeprecationEntry};
use crate::state::conditions::{self, ConditionReason, ConditionStatus, ConditionType};
use crate::state::ClusterExtension;

/// What: Project deprecation conditions for a successfully resolved bundle.
///
/// Inputs:
/// - `ext`: Extension whose status is updated in place.
/// - `bundle_name`: Name of the resolved bundle.
/// - `entries`: Deprecation entries for the resolved bundle's package.
///
/// Output:
/// - `PackageDeprecated`, `ChannelDeprecated`, `BundleDeprecated` set True
///   iff a matching entry remains after filtering; `Deprecated` set True
///   iff any of the three is, its message the `;`-joined messages in
///   Package, Channel, Bundle order.
pub fn set_deprecation_status(
    ext: &mut ClusterExtension,
    bundle_name: &str,
    entries: &[DeprecationEntry],
) {
    let generation = ext.generation();
    let mut matched: HashMap<ConditionType, &DeprecationEntry> = HashMap::new();
    for entry in entries {
        match entry.reference.schema.as_str() {
            fbc::SCHEMA_PACKAGE => {
                matched.insert(ConditionType::PackageDeprecated, entry);
            }
            fbc::SCHEMA_CHANNEL => {
                if ext.channels().iter().any(|c| *c == entry.reference.name) {
                    matched.insert(ConditionType::ChannelDeprecated, entry);
                }
            }
            fbc::SCHEMA_BUNDLE => {
                if entry.reference.name == bundle_name {
                    matched.insert(ConditionType::BundleDeprecated, entry);
                }
            }
            _ => {}
        }
    }

    let messages: Vec<&str> = ConditionType::DEPRECATION_SET
        .iter()
        .filter_map(|t| matched.get(t).map(|e| e.message.as_str()))
        .collect();
    let (status, message) = if messages.is_empty() {
        (ConditionStatus::False, String::new())
    } else {
        (ConditionStatus::True, messages.join(";"))
    };
    conditions::set(
        &mut ext.status.conditions,
        ConditionType::Deprecated,
        status,
        ConditionReason::Deprecated,
        &message,
        generation,
    );

    for type_ in ConditionType::DEPRECATION_SET {
        let (status, message) = match matched.get(&type_) {
            Some(entry) => (ConditionStatus::True, entry.message.as_str()),
            None => (ConditionStatus::False, ""),
        };
        conditions::set(
            &mut ext.status.conditions,
            type_,
            status,
            ConditionReason::Deprecated,
            message,
            generation,
        );
    }
}

/// What: Mark all four deprecation conditions Unknown.
///
/// Inputs:
/// - `ext`: Extension whose status is updated in place.
/// - `message`: Why deprecation state could not be determined (resolution
///   failed, or catalogs disagree).
pub fn set_deprecation_statuses_unknown(ext: &mut ClusterExtension, message: &str) {
    let generation = ext.generation();
    for type_ in std::iter::once(ConditionType::Deprecated).chain(ConditionType::DEPRECATION_SET) {
        conditions::set(
            &mut ext.status.conditions,
            type_,
            ConditionStatus::Unknown,
            ConditionReason::Deprecated,
            message,
            generation,
        );
    }
}
