//! Lexical validation for extension spec fields.
//!
//! These checks mirror the constraints an admission layer enforces on the
//! API server side. The controller re-runs them at the top of every
//! reconcile so that objects written outside admission (tests, direct store
//! writes) degrade into a well-defined `Unknown` status instead of
//! producing confusing resolution errors.

use crate::logic::constraint::Constraints;

/// Maximum length for package names and channel names.
pub const MAX_NAME_LEN: usize = 253;
/// Maximum length for package and channel names on the legacy `Operator` API.
pub const MAX_NAME_LEN_LEGACY: usize = 48;
/// Maximum length for a version range expression.
pub const MAX_VERSION_LEN: usize = 64;
/// Maximum length for a DNS-1123 label (namespace).
pub const MAX_LABEL_LEN: usize = 63;

/// What: Validate a package name against `^[a-z0-9]+([-.][a-z0-9]+)*$`.
///
/// Inputs:
/// - `name`: Candidate package name.
/// - `legacy`: When `true`, apply the 48-character legacy `Operator` limit
///   instead of the 253-character limit.
///
/// Output:
/// - `true` when the name matches the pattern and length bound.
pub fn is_valid_package_name(name: &str, legacy: bool) -> bool {
    let max = if legacy { MAX_NAME_LEN_LEGACY } else { MAX_NAME_LEN };
    if name.is_empty() || name.len() > max {
        return false;
    }
    dotted_dashed_lower(name)
}

/// What: Validate a channel name against `^[a-z0-9]+([.-][a-z0-9]+)*$`.
///
/// Inputs:
/// - `name`: Candidate channel name.
/// - `legacy`: When `true`, apply the 48-character legacy limit.
///
/// Output:
/// - `true` when the name matches the pattern and length bound.
pub fn is_valid_channel_name(name: &str, legacy: bool) -> bool {
    // Same token grammar as package names; the admission patterns differ
    // only in the order of `.` and `-` inside the character class.
    is_valid_package_name(name, legacy)
}

/// Shared token walk: lowercase alphanumeric runs separated by single
/// `.` or `-` characters, never leading, trailing, or doubled.
fn dotted_dashed_lower(name: &str) -> bool {
    let mut prev_sep = true; // leading separator is invalid
    for ch in name.chars() {
        match ch {
            'a'..='z' | '0'..='9' => prev_sep = false,
            '.' | '-' => {
                if prev_sep {
                    return false;
                }
                prev_sep = true;
            }
            _ => return false,
        }
    }
    !prev_sep
}

/// What: Validate a version range expression.
///
/// Inputs:
/// - `range`: Candidate range; empty is allowed (no constraint).
///
/// Output:
/// - `true` when empty or parseable under the range grammar and within the
///   64-character bound.
pub fn is_valid_version_range(range: &str) -> bool {
    if range.is_empty() {
        return true;
    }
    if range.len() > MAX_VERSION_LEN {
        return false;
    }
    Constraints::parse(range).is_ok()
}

/// What: Validate a DNS-1123 label (`[a-z0-9]([-a-z0-9]*[a-z0-9])?`, ≤ 63).
///
/// Inputs:
/// - `value`: Candidate label, e.g. a namespace name.
///
/// Output:
/// - `true` when the value is a conforming label.
pub fn is_dns1123_label(value: &str) -> bool {
    if value.is_empty() || value.len() > MAX_LABEL_LEN {
        return false;
    }
    let bytes = value.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes.iter().all(|&b| alnum(b) || b == b'-')
}

/// What: Validate a DNS-1123 subdomain (dot-separated labels, ≤ 253).
///
/// Inputs:
/// - `value`: Candidate subdomain, e.g. a service account name.
///
/// Output:
/// - `true` when every dot-separated segment is a conforming label and the
///   whole value is within the length bound.
pub fn is_dns1123_subdomain(value: &str) -> bool {
    if value.is_empty() || value.len() > MAX_NAME_LEN {
        return false;
    }
    value.split('.').all(|seg| {
        !seg.is_empty() && seg.len() <= MAX_LABEL_LEN && {
            let bytes = seg.as_bytes();
            let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
            alnum(bytes[0])
                && alnum(bytes[bytes.len() - 1])
                && bytes.iter().all(|&b| alnum(b) || b == b'-')
        }
    })
}
