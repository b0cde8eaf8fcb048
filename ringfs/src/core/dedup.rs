use linked_hash_map::LinkedHashMap;
use std::hash::{Hash, Hasher};
use wyhash::WyHash;

/// Default number of message ids a node remembers.
pub const RECENT_MESSAGES: usize = 60;

/// Bounded FIFO of recently processed message ids.
///
/// Ids are stored as 64-bit fingerprints. When the cache is full the oldest id is evicted.
pub struct DedupCache {
  capacity: usize,
  seen: LinkedHashMap<u64, ()>,
}
impl DedupCache {
  pub fn new(capacity: usize) -> DedupCache {
    DedupCache {
      capacity: capacity.max(1),
      seen: LinkedHashMap::new(),
    }
  }

  /// Records `unique_id`. Returns `false` if it was already present, in which case the message
  /// must be dropped.
  pub fn observe(&mut self, unique_id: &str) -> bool {
    let key = fingerprint(unique_id);
    if self.seen.contains_key(&key) {
      return false;
    }
    self.seen.insert(key, ());
    while self.seen.len() > self.capacity {
      self.seen.pop_front();
    }
    true
  }

  pub fn contains(&self, unique_id: &str) -> bool {
    self.seen.contains_key(&fingerprint(unique_id))
  }

  pub fn len(&self) -> usize {
    self.seen.len()
  }

  pub fn is_empty(&self) -> bool {
    self.seen.is_empty()
  }
}
impl Default for DedupCache {
  fn default() -> Self {
    DedupCache::new(RECENT_MESSAGES)
  }
}

fn fingerprint(unique_id: &str) -> u64 {
  let mut hasher = WyHash::with_seed(0);
  unique_id.hash(&mut hasher);
  hasher.finish()
}

#[test]
fn test_dedup_drops_repeats() {
  let mut cache = DedupCache::default();
  assert!(cache.observe("a"));
  assert!(!cache.observe("a"));
  assert!(cache.observe("b"));
  assert_eq!(cache.len(), 2);
}

#[test]
fn test_dedup_evicts_oldest() {
  let mut cache = DedupCache::new(3);
  for id in ["a", "b", "c", "d"] {
    assert!(cache.observe(id));
  }
  assert_eq!(cache.len(), 3);
  assert!(!cache.contains("a"));
  assert!(cache.contains("b"));
  assert!(cache.contains("d"));
  // A repeat does not refresh its position.
  assert!(!cache.observe("b"));
  assert!(cache.observe("e"));
  assert!(!cache.contains("b"));
}
