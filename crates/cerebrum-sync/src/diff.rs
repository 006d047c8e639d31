//! Set differences between what the database holds and what a source wants.
//!
//! [`diff_sets`] answers "what must be added and removed" for one entity's
//! spreads, group members and so on. [`MarkAndSweep`] answers "which rows did
//! this run never see" across a whole import.

use std::collections::BTreeSet;

/// The changes that turn `current` into `desired`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDiff<T> {
  pub to_add:    Vec<T>,
  pub to_remove: Vec<T>,
}

impl<T> SetDiff<T> {
  pub fn is_empty(&self) -> bool { self.to_add.is_empty() && self.to_remove.is_empty() }
}

/// Both sides come out sorted.
pub fn diff_sets<T: Ord + Clone>(current: &BTreeSet<T>, desired: &BTreeSet<T>) -> SetDiff<T> {
  SetDiff {
    to_add:    desired.difference(current).cloned().collect(),
    to_remove: current.difference(desired).cloned().collect(),
  }
}

// ─── Mark and sweep ──────────────────────────────────────────────────────────

/// Keys loaded before an import. Every key the import produces is marked;
/// whatever is left afterwards is no longer reported by the source.
#[derive(Debug, Clone, Default)]
pub struct MarkAndSweep<K> {
  pending: BTreeSet<K>,
  loaded:  usize,
}

impl<K: Ord> MarkAndSweep<K> {
  pub fn new(keys: impl IntoIterator<Item = K>) -> Self {
    let pending: BTreeSet<K> = keys.into_iter().collect();
    let loaded = pending.len();
    Self { pending, loaded }
  }

  /// Returns `true` if the key was loaded and not marked before.
  pub fn mark(&mut self, key: &K) -> bool { self.pending.remove(key) }

  pub fn loaded(&self) -> usize { self.loaded }

  pub fn remaining(&self) -> impl Iterator<Item = &K> { self.pending.iter() }

  pub fn into_remaining(self) -> BTreeSet<K> { self.pending }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn set(items: &[&'static str]) -> BTreeSet<&'static str> { items.iter().copied().collect() }

  #[test]
  fn diff_adds_and_removes() {
    let d = diff_sets(&set(&["a", "b", "c"]), &set(&["b", "c", "d", "e"]));
    assert_eq!(d.to_add, ["d", "e"]);
    assert_eq!(d.to_remove, ["a"]);
    assert!(!d.is_empty());
  }

  #[test]
  fn equal_sets_give_an_empty_diff() {
    let d = diff_sets(&set(&["x"]), &set(&["x"]));
    assert!(d.is_empty());
  }

  #[test]
  fn sweep_keeps_only_unmarked_keys() {
    let mut sweep = MarkAndSweep::new([1, 2, 3, 3]);
    assert_eq!(sweep.loaded(), 3);
    assert!(sweep.mark(&2));
    assert!(!sweep.mark(&2));
    assert!(!sweep.mark(&9));
    assert_eq!(sweep.remaining().copied().collect::<Vec<_>>(), [1, 3]);
    assert_eq!(sweep.into_remaining(), BTreeSet::from([1, 3]));
  }
}
