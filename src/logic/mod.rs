//! Pure decision logic for the reconciliation pipeline.

/// Version range grammar.
pub mod constraint;
/// Deprecation status projection.
pub mod deprecation;
/// Composable bundle predicates.
pub mod filter;
/// Candidate orderings.
pub mod sort;
/// Upgrade-edge policies.
pub mod successors;
