//! Bidirectional path index.
//!
//! Mirrors the Python `DualAccessMemory` helper: a dictionary you can
//! look up two ways, by key (one value) or by value (the set of keys
//! that share it). Designed around `RelativePath` keys so that a whole
//! subtree can be deleted or moved in one call, matching how the
//! filesystem itself deletes/renames directories.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use crate::path::RelativePath;

/// A double-entry map from [`RelativePath`] to some comparable,
/// hashable value, with an automatically maintained reverse index.
#[derive(Debug, Default, Clone)]
pub struct DualIndex<V: Eq + Hash + Clone> {
    forward: HashMap<RelativePath, V>,
    reverse: HashMap<V, HashSet<RelativePath>>,
}

impl<V: Eq + Hash + Clone> DualIndex<V> {
    pub fn new() -> Self {
        DualIndex {
            forward: HashMap::new(),
            reverse: HashMap::new(),
        }
    }

    /// Value currently stored for `key`, if any.
    pub fn get(&self, key: &RelativePath) -> Option<&V> {
        self.forward.get(key)
    }

    /// Every key currently mapped to `value`. Empty set if none.
    pub fn get_by_value(&self, value: &V) -> HashSet<RelativePath> {
        self.reverse.get(value).cloned().unwrap_or_default()
    }

    pub fn contains(&self, key: &RelativePath) -> bool {
        self.forward.contains_key(key)
    }

    /// Registers `{key, value}`. If `key` already held a different
    /// value, its old reverse-index entry is dropped first, so a key
    /// never appears under two values at once.
    pub fn save(&mut self, key: RelativePath, value: V) {
        if let Some(old) = self.forward.get(&key) {
            if let Some(set) = self.reverse.get_mut(old) {
                set.remove(&key);
            }
        }
        self.reverse
            .entry(value.clone())
            .or_default()
            .insert(key.clone());
        self.forward.insert(key, value);
    }

    /// Deletes `delete_key` and every key that is a descendant of it
    /// (per [`RelativePath::is_same_or_descendant_of`]).
    pub fn delete_subtree(&mut self, delete_key: &RelativePath) {
        let victims: Vec<RelativePath> = self
            .forward
            .keys()
            .filter(|k| k.is_same_or_descendant_of(delete_key))
            .cloned()
            .collect();
        for key in victims {
            if let Some(value) = self.forward.remove(&key) {
                if let Some(set) = self.reverse.get_mut(&value) {
                    set.remove(&key);
                }
            }
        }
    }

    /// Moves `src_key` and every descendant key to the equivalent path
    /// under `dst_key`, preserving their values. If a destination key
    /// already existed (shouldn't happen on a clean filesystem move,
    /// but mirrors the Python implementation's defensive discard), its
    /// stale reverse-index entry is dropped first.
    pub fn move_subtree(&mut self, src_key: &RelativePath, dst_key: &RelativePath) {
        let victims: Vec<RelativePath> = self
            .forward
            .keys()
            .filter(|k| k.is_same_or_descendant_of(src_key))
            .cloned()
            .collect();
        for old_key in victims {
            let new_key = old_key.rebase(src_key, dst_key);
            if let Some(stale) = self.forward.get(&new_key) {
                if let Some(set) = self.reverse.get_mut(stale) {
                    set.remove(&new_key);
                }
            }
            let value = self.forward.remove(&old_key).expect("key just matched");
            if let Some(set) = self.reverse.get_mut(&value) {
                set.remove(&old_key);
                set.insert(new_key.clone());
            }
            self.forward.insert(new_key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_lookup_both_ways() {
        let mut idx: DualIndex<String> = DualIndex::new();
        idx.save(RelativePath::new("/a"), "h1".to_string());
        idx.save(RelativePath::new("/b"), "h1".to_string());
        assert_eq!(idx.get(&RelativePath::new("/a")), Some(&"h1".to_string()));
        let by_value = idx.get_by_value(&"h1".to_string());
        assert_eq!(by_value.len(), 2);
    }

    #[test]
    fn resaving_key_moves_reverse_entry() {
        let mut idx: DualIndex<String> = DualIndex::new();
        idx.save(RelativePath::new("/a"), "h1".to_string());
        idx.save(RelativePath::new("/a"), "h2".to_string());
        assert!(idx.get_by_value(&"h1".to_string()).is_empty());
        assert_eq!(idx.get_by_value(&"h2".to_string()).len(), 1);
    }

    #[test]
    fn delete_subtree_removes_children() {
        let mut idx: DualIndex<String> = DualIndex::new();
        idx.save(RelativePath::new("/dir"), "DIR".to_string());
        idx.save(RelativePath::new("/dir/a.txt"), "h1".to_string());
        idx.save(RelativePath::new("/dir/sub/b.txt"), "h2".to_string());
        idx.save(RelativePath::new("/dir-sibling.txt"), "h3".to_string());
        idx.delete_subtree(&RelativePath::new("/dir"));
        assert!(!idx.contains(&RelativePath::new("/dir")));
        assert!(!idx.contains(&RelativePath::new("/dir/a.txt")));
        assert!(!idx.contains(&RelativePath::new("/dir/sub/b.txt")));
        assert!(idx.contains(&RelativePath::new("/dir-sibling.txt")));
    }

    #[test]
    fn move_subtree_rewrites_keys_and_preserves_reverse_index() {
        let mut idx: DualIndex<String> = DualIndex::new();
        idx.save(RelativePath::new("/old"), "DIR".to_string());
        idx.save(RelativePath::new("/old/a.txt"), "h1".to_string());
        idx.move_subtree(&RelativePath::new("/old"), &RelativePath::new("/new"));
        assert!(!idx.contains(&RelativePath::new("/old")));
        assert!(!idx.contains(&RelativePath::new("/old/a.txt")));
        assert_eq!(idx.get(&RelativePath::new("/new/a.txt")), Some(&"h1".to_string()));
        assert_eq!(
            idx.get_by_value(&"h1".to_string()),
            [RelativePath::new("/new/a.txt")].into_iter().collect()
        );
    }
}
