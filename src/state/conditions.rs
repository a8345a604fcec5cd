//! Condition machinery for the extension status.
//!
//! The condition type and reason registries are closed: the status
//! projector only ever emits members of these enums, and tests assert the
//! full condition set is present after every reconcile.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Condition types projected onto an extension status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    /// A bundle was (or could not be) selected from the catalogs.
    Resolved,
    /// The selected bundle's content was (or could not be) materialized.
    Unpacked,
    /// The rendered content was (or could not be) applied.
    Installed,
    /// Aggregate of the three deprecation conditions.
    Deprecated,
    /// The resolved package is deprecated in its catalog.
    PackageDeprecated,
    /// A configured channel is deprecated in the catalog.
    ChannelDeprecated,
    /// The resolved bundle is deprecated in the catalog.
    BundleDeprecated,
    /// Whether the installed content could be verified via watches.
    /// Absence of this condition means Unknown.
    Healthy,
}

impl ConditionType {
    /// Stable string form (matches the serialized representation).
    pub fn as_str(self) -> &'static str {
        match self {
            ConditionType::Resolved => "Resolved",
            ConditionType::Unpacked => "Unpacked",
            ConditionType::Installed => "Installed",
            ConditionType::Deprecated => "Deprecated",
            ConditionType::PackageDeprecated => "PackageDeprecated",
            ConditionType::ChannelDeprecated => "ChannelDeprecated",
            ConditionType::BundleDeprecated => "BundleDeprecated",
            ConditionType::Healthy => "Healthy",
        }
    }

    /// The set every reconcile must leave present on the status.
    /// `Healthy` is deliberately absent: for that condition, absence
    /// carries the Unknown meaning.
    pub const COMPLETENESS_SET: [ConditionType; 7] = [
        ConditionType::Resolved,
        ConditionType::Unpacked,
        ConditionType::Installed,
        ConditionType::Deprecated,
        ConditionType::PackageDeprecated,
        ConditionType::ChannelDeprecated,
        ConditionType::BundleDeprecated,
    ];

    /// The three schema-specific deprecation conditions in projection order.
    pub const DEPRECATION_SET: [ConditionType; 3] = [
        ConditionType::PackageDeprecated,
        ConditionType::ChannelDeprecated,
        ConditionType::BundleDeprecated,
    ];
}

/// Closed reason registry for every condition this controller emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionReason {
    /// The step completed.
    Success,
    /// No bundle satisfied the resolution constraints.
    ResolutionFailed,
    /// Resolution was not attempted.
    ResolutionUnknown,
    /// Unpacking has not finished yet (pending or in flight).
    UnpackPending,
    /// Unpacking failed terminally.
    UnpackFailed,
    /// Unpacking finished.
    UnpackSuccessful,
    /// Install failed.
    InstallationFailed,
    /// Install state could not be determined or was not attempted.
    InstallationStatusUnknown,
    /// Upgrade failed.
    UpgradeFailed,
    /// Deprecation advisory state.
    Deprecated,
    /// Installed content could not be verified.
    Unverifiable,
    /// A dynamic watch could not be created.
    CreateDynamicWatchFailed,
    /// A service-account-scoped client could not be built.
    ErrorGettingClient,
    /// The release state could not be read.
    ErrorGettingReleaseState,
}

/// Tri-state condition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    /// The condition holds.
    True,
    /// The condition does not hold.
    False,
    /// The condition state is not known.
    Unknown,
}

/// One observed condition of the extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type from the closed registry.
    #[serde(rename = "type")]
    pub type_: ConditionType,
    /// Tri-state status.
    pub status: ConditionStatus,
    /// Machine-readable reason from the closed registry.
    pub reason: ConditionReason,
    /// Human-readable detail; part of the status contract.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Generation the condition was computed against.
    pub observed_generation: i64,
    /// When the status last flipped.
    pub last_transition_time: DateTime<Utc>,
}

/// Find a condition by type.
pub fn find_condition(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Remove a condition by type; returns whether one was present.
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: ConditionType) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.type_ != type_);
    conditions.len() != before
}

/// What: Insert or update a condition, preserving the transition time when
/// the status did not change.
///
/// Inputs:
/// - `conditions`: The status condition list.
/// - `new`: The condition to project; its transition time is only used
///   when the status actually flips (or the condition is new).
///
/// Output:
/// - The list contains exactly one condition of `new.type_`, current in
///   reason, message, and observed generation.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            if existing.status != new.status {
                existing.status = new.status;
                existing.last_transition_time = new.last_transition_time;
            }
            existing.reason = new.reason;
            existing.message = new.message;
            existing.observed_generation = new.observed_generation;
        }
        None => conditions.push(new),
    }
}

/// Shorthand constructor used by the projector helpers.
fn condition(
    type_: ConditionType,
    status: ConditionStatus,
    reason: ConditionReason,
    message: &str,
    generation: i64,
) -> Condition {
    Condition {
        type_,
        status,
        reason,
        message: message.to_string(),
        observed_generation: generation,
        last_transition_time: Utc::now(),
    }
}

/// Project a condition with explicit parts.
pub fn set(
    conditions: &mut Vec<Condition>,
    type_: ConditionType,
    status: ConditionStatus,
    reason: ConditionReason,
    message: &str,
    generation: i64,
) {
    set_condition(conditions, condition(type_, status, reason, message, generation));
}

/// What: Backfill every condition of the completeness set that is absent,
/// as `False` with the given reason and message.
///
/// Inputs:
/// - `conditions`: The status condition list.
/// - `reason` / `message`: Applied to every backfilled condition.
/// - `generation`: Observed generation stamped on backfills.
///
/// Output:
/// - Conditions already present are left untouched.
pub fn ensure_all_with_reason(
    conditions: &mut Vec<Condition>,
    reason: ConditionReason,
    message: &str,
    generation: i64,
) {
    for type_ in ConditionType::COMPLETENESS_SET {
        if find_condition(conditions, type_).is_none() {
            set(
                conditions,
                type_,
                ConditionStatus::False,
                reason,
                message,
                generation,
            );
        }
    }
}
