//! Small utility helpers for validation, hashing, and message formatting.
//!
//! The functions in this module are intentionally lightweight and dependency-free
//! to keep hot paths fast and reduce compile times. They are used by the catalog
//! store, the reconciler, and the admission stub.

pub mod validate;

/// What: Compute a stable 64-bit FNV-1a digest of a byte slice, hex encoded.
///
/// Inputs:
/// - `bytes`: Content to digest.
///
/// Output:
/// - Lowercase 16-character hex string.
///
/// Details:
/// - Used to derive a resolved reference for catalog snapshots so that
///   unchanged catalog content can be recognized and fan-out suppressed.
/// - Not cryptographic; collisions only cause a redundant reconcile.
pub fn fnv1a_hex(bytes: &[u8]) -> String {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(PRIME);
    }
    format!("{hash:016x}")
}

/// What: Join non-empty message fragments with a separator.
///
/// Inputs:
/// - `parts`: Message fragments in their final order.
/// - `sep`: Separator inserted between fragments.
///
/// Output:
/// - Joined string; empty when every fragment is empty.
pub fn join_nonempty(parts: &[&str], sep: &str) -> String {
    let kept: Vec<&str> = parts.iter().copied().filter(|p| !p.is_empty()).collect();
    kept.join(sep)
}
