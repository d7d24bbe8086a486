//! Lock-sharded hash map for process-wide per-key state.
//!
//! Keys hash to one of N independently locked shards, so two projects only
//! contend when they land in the same shard.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;

/// Default shard count.
pub const DEFAULT_SHARDS: usize = 16;

pub struct ShardedMap<K, V> {
    shards: Vec<Mutex<HashMap<K, V>>>,
}

impl<K: Hash + Eq, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

impl<K: Hash + Eq, V> ShardedMap<K, V> {
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, key: &K) -> &Mutex<HashMap<K, V>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    /// Run `f` with exclusive access to the shard holding `key`.
    pub fn with_shard<R>(&self, key: &K, f: impl FnOnce(&mut HashMap<K, V>) -> R) -> R {
        let mut shard = self.shard_for(key).lock();
        f(&mut shard)
    }

    /// Run `f` on the entry for `key`, creating it with `init` when absent.
    pub fn with_entry<R>(
        &self,
        key: K,
        init: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> R {
        let mut shard = self.shard_for(&key).lock();
        let value = shard.entry(key).or_insert_with(init);
        f(value)
    }

    /// Run `f` on the entry for `key` if present.
    pub fn with_existing<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut shard = self.shard_for(key).lock();
        shard.get_mut(key).map(f)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.shard_for(key).lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
    }

    /// Visit every entry, one shard at a time.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        for shard in &self.shards {
            let shard = shard.lock();
            for (k, v) in shard.iter() {
                f(k, v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_is_created_once() {
        let map: ShardedMap<String, u32> = ShardedMap::new(4);
        map.with_entry("a".to_string(), || 0, |v| *v += 1);
        map.with_entry("a".to_string(), || 100, |v| *v += 1);

        assert_eq!(map.with_existing(&"a".to_string(), |v| *v), Some(2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let map: ShardedMap<u32, u32> = ShardedMap::new(2);
        for i in 0..10 {
            map.with_entry(i, || i, |_| ());
        }
        assert_eq!(map.remove(&3), Some(3));
        assert_eq!(map.len(), 9);
        map.clear();
        assert!(map.is_empty());
    }

    #[test]
    fn test_zero_shards_falls_back_to_one() {
        let map: ShardedMap<u32, u32> = ShardedMap::new(0);
        assert_eq!(map.shard_count(), 1);
    }
}
