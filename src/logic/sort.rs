//! Tie-break orderings for resolved bundle candidates.
//!
//! Orderings compose via successive stable sorts: the resolver sorts by
//! version first and by deprecation last, which makes deprecation the
//! primary key and version the tie break within each deprecation class.

use std::cmp::Ordering;

use crate::catalog::Bundle;

/// Descending by version (highest first), build metadata ignored.
pub fn by_version_desc(a: &Bundle, b: &Bundle) -> Ordering {
    b.version.cmp_precedence(&a.version)
}

/// Non-deprecated bundles first.
pub fn by_deprecated(a: &Bundle, b: &Bundle) -> Ordering {
    a.is_deprecated().cmp(&b.is_deprecated())
}
