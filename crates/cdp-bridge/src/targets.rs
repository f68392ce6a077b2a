use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tabrelay_core_types::TabId;

/// Two-way index between relay tab handles and browser target ids.
///
/// Tab handles are small ordinals assigned in creation order; target ids are
/// the opaque strings the browser generates. Entries are added when we create
/// a tab or observe `Target.targetCreated`, and dropped on
/// `Target.targetDestroyed`.
#[derive(Debug, Default)]
pub struct TargetIndex {
    by_tab: DashMap<TabId, String>,
    by_target: DashMap<String, TabId>,
    next_ordinal: AtomicU64,
}

impl TargetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target id, returning the existing handle when the target is
    /// already known.
    pub fn register(&self, target_id: &str) -> TabId {
        if let Some(existing) = self.by_target.get(target_id) {
            return *existing;
        }
        let tab = TabId(self.next_ordinal.fetch_add(1, Ordering::SeqCst) + 1);
        self.by_tab.insert(tab, target_id.to_string());
        self.by_target.insert(target_id.to_string(), tab);
        tab
    }

    /// Drop a destroyed target, returning the handle it was known by.
    pub fn remove_target(&self, target_id: &str) -> Option<TabId> {
        let (_, tab) = self.by_target.remove(target_id)?;
        self.by_tab.remove(&tab);
        Some(tab)
    }

    pub fn target_for(&self, tab: TabId) -> Option<String> {
        self.by_tab.get(&tab).map(|entry| entry.clone())
    }

    pub fn tab_for(&self, target_id: &str) -> Option<TabId> {
        self.by_target.get(target_id).map(|entry| *entry)
    }

    pub fn contains(&self, tab: TabId) -> bool {
        self.by_tab.contains_key(&tab)
    }

    pub fn len(&self) -> usize {
        self.by_tab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tab.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent_per_target() {
        let index = TargetIndex::new();
        let a = index.register("TARGET-A");
        let again = index.register("TARGET-A");
        assert_eq!(a, again);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn handles_are_assigned_in_order() {
        let index = TargetIndex::new();
        let a = index.register("TARGET-A");
        let b = index.register("TARGET-B");
        assert!(b.0 > a.0);
        assert_eq!(index.target_for(a).as_deref(), Some("TARGET-A"));
        assert_eq!(index.tab_for("TARGET-B"), Some(b));
    }

    #[test]
    fn removal_clears_both_directions() {
        let index = TargetIndex::new();
        let a = index.register("TARGET-A");
        assert_eq!(index.remove_target("TARGET-A"), Some(a));
        assert!(!index.contains(a));
        assert_eq!(index.tab_for("TARGET-A"), None);
        assert_eq!(index.remove_target("TARGET-A"), None);
    }
}
