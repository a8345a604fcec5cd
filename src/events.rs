//! Catalog-change fan-out decisions.
//!
//! Any catalog create or delete enqueues every known extension. Update
//! events are filtered: when both the old and new catalog state expose a
//! resolved content reference and it did not change, the event is noise
//! and is dropped.

use crate::cluster::ExtensionStore;

/// Kind of catalog lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogEventKind {
    /// Catalog appeared.
    Created,
    /// Catalog content was refreshed.
    Updated,
    /// Catalog disappeared.
    Deleted,
}

/// One catalog lifecycle event.
#[derive(Debug, Clone)]
pub struct CatalogEvent {
    /// Catalog name.
    pub name: String,
    /// What happened.
    pub kind: CatalogEventKind,
    /// Resolved content reference before the event.
    pub old_ref: Option<String>,
    /// Resolved content reference after the event.
    pub new_ref: Option<String>,
}

/// What: Decide whether a catalog event warrants reconciling extensions.
///
/// Inputs:
/// - `event`: The catalog lifecycle event.
///
/// Output:
/// - `false` only for updates whose resolved reference is present on both
///   sides and unchanged; `true` otherwise.
pub fn should_enqueue(event: &CatalogEvent) -> bool {
    match event.kind {
        CatalogEventKind::Created | CatalogEventKind::Deleted => true,
        CatalogEventKind::Updated => match (&event.old_ref, &event.new_ref) {
            (Some(old), Some(new)) => old != new,
            _ => true,
        },
    }
}

/// Reconcile requests for a catalog event: every known extension.
pub fn fanout_requests(extensions: &ExtensionStore) -> Vec<String> {
    extensions.names()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(old_ref: Option<&str>, new_ref: Option<&str>) -> CatalogEvent {
        CatalogEvent {
            name: "operatorhubio".into(),
            kind: CatalogEventKind::Updated,
            old_ref: old_ref.map(str::to_string),
            new_ref: new_ref.map(str::to_string),
        }
    }

    #[test]
    /// What: Update filtering keys on the resolved reference
    ///
    /// - Input: Updates with unchanged, changed, and missing references
    /// - Output: Dropped only when both sides match
    fn events_update_filtering() {
        assert!(!should_enqueue(&update(Some("ref-1"), Some("ref-1"))));
        assert!(should_enqueue(&update(Some("ref-1"), Some("ref-2"))));
        assert!(should_enqueue(&update(None, Some("ref-1"))));
        assert!(should_enqueue(&update(Some("ref-1"), None)));
    }

    #[test]
    /// What: Creates and deletes always enqueue
    ///
    /// - Input: Created and Deleted events with matching references
    /// - Output: Both enqueue
    fn events_create_delete_always_enqueue() {
        for kind in [CatalogEventKind::Created, CatalogEventKind::Deleted] {
            let event = CatalogEvent {
                name: "operatorhubio".into(),
                kind,
                old_ref: Some("ref-1".into()),
                new_ref: Some("ref-1".into()),
            };
            assert!(should_enqueue(&event));
        }
    }
}
