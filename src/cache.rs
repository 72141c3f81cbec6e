//! Sharded LRU cache holding decoded index and data blocks.
//!
//! Every store owns one [BlockCache]; readers receive it by reference. A miss
//! only costs a file read, so callers never depend on an entry being present.

use crate::hash::murmur_hash;
use crate::sstable::Block;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex};

const NUM_SHARD_BITS: usize = 4;
const NUM_SHARD: usize = 1 << NUM_SHARD_BITS;

const BLOCK_KEY_SEED: u32 = 0x71f2e1a3;

/// Identity of a cached block: the page (level, version) and the block id inside it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BlockKey {
    pub level: u32,
    pub version: u64,
    pub block_id: u64,
}

impl BlockKey {
    pub fn new(level: usize, version: u64, block_id: u64) -> BlockKey {
        BlockKey {
            level: level as u32,
            version,
            block_id,
        }
    }

    pub fn shard_hash(&self) -> u32 {
        let mut bytes = [0u8; 20];
        bytes[..4].copy_from_slice(&self.level.to_le_bytes());
        bytes[4..12].copy_from_slice(&self.version.to_le_bytes());
        bytes[12..].copy_from_slice(&self.block_id.to_le_bytes());
        murmur_hash(&bytes, BLOCK_KEY_SEED)
    }
}

pub type BlockCache = ShardLRUCache<BlockKey, Block>;

impl BlockCache {
    pub fn get(&self, key: &BlockKey) -> Option<Arc<Block>> {
        self.look_up(key, key.shard_hash())
    }

    pub fn put(&self, key: BlockKey, block: Arc<Block>) {
        let charge = block.charge();
        self.insert(key, block, charge, key.shard_hash());
    }
}

pub struct ShardLRUCache<K: Eq + Hash + Clone, V> {
    shards: Vec<Mutex<LRUCache<K, V>>>,
}

impl<K: Eq + Hash + Clone, V> ShardLRUCache<K, V> {
    /// `capacity` is the total charge the cache may hold, split evenly over the shards.
    pub fn new(capacity: usize) -> ShardLRUCache<K, V> {
        let per_shard = (capacity + NUM_SHARD - 1) / NUM_SHARD;
        ShardLRUCache {
            shards: (0..NUM_SHARD)
                .map(|_| Mutex::new(LRUCache::new(per_shard)))
                .collect(),
        }
    }

    pub fn insert(&self, key: K, value: Arc<V>, charge: usize, hash: u32) {
        self.lock_shard(hash).insert(key, value, charge);
    }

    pub fn look_up(&self, key: &K, hash: u32) -> Option<Arc<V>> {
        self.lock_shard(hash).look_up(key)
    }

    pub fn len(&self) -> usize {
        (0..NUM_SHARD)
            .map(|i| {
                self.shards[i]
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .map
                    .len()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_shard(&self, hash: u32) -> std::sync::MutexGuard<'_, LRUCache<K, V>> {
        // a poisoned shard still holds consistent entries
        self.shards[shard(hash)]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
impl<K: Eq + Hash + Clone, V> ShardLRUCache<K, V> {
    fn erase(&self, key: &K, hash: u32) {
        self.lock_shard(hash).erase(key);
    }

    /// Total charge of the cached entries.
    fn usage(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap().usage)
            .sum()
    }
}

#[inline]
fn shard(hash: u32) -> usize {
    (hash >> (32 - NUM_SHARD_BITS)) as usize
}

struct LRUEntry<V> {
    value: Arc<V>,
    charge: usize,
    tick: u64,
}

struct LRUCache<K: Eq + Hash + Clone, V> {
    map: HashMap<K, LRUEntry<V>>,
    /// tick -> key, the smallest tick is the least recently used entry
    recency: BTreeMap<u64, K>,
    usage: usize,
    capacity: usize,
    tick: u64,
}

impl<K: Eq + Hash + Clone, V> LRUCache<K, V> {
    fn new(capacity: usize) -> LRUCache<K, V> {
        LRUCache {
            map: HashMap::new(),
            recency: BTreeMap::new(),
            usage: 0,
            capacity,
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn look_up(&mut self, key: &K) -> Option<Arc<V>> {
        let tick = self.next_tick();
        let entry = self.map.get_mut(key)?;
        self.recency.remove(&entry.tick);
        entry.tick = tick;
        self.recency.insert(tick, key.clone());
        Some(entry.value.clone())
    }

    fn insert(&mut self, key: K, value: Arc<V>, charge: usize) {
        if charge > self.capacity {
            return;
        }
        self.erase(&key);
        while self.usage + charge > self.capacity {
            let oldest = match self.recency.keys().next() {
                Some(tick) => *tick,
                None => break,
            };
            if let Some(old_key) = self.recency.remove(&oldest) {
                if let Some(old) = self.map.remove(&old_key) {
                    self.usage -= old.charge;
                }
            }
        }
        let tick = self.next_tick();
        self.recency.insert(tick, key.clone());
        self.usage += charge;
        self.map.insert(
            key,
            LRUEntry {
                value,
                charge,
                tick,
            },
        );
    }

    fn erase(&mut self, key: &K) {
        if let Some(old) = self.map.remove(key) {
            self.recency.remove(&old.tick);
            self.usage -= old.charge;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::ShardLRUCache;
    use std::sync::Arc;

    #[test]
    fn test_evict_least_recently_used() {
        // 16 shards * 10
        let cache: ShardLRUCache<u32, String> = ShardLRUCache::new(160);
        let hash = 0x1000_0000;
        cache.insert(1, Arc::new("one".into()), 4, hash);
        cache.insert(2, Arc::new("two".into()), 4, hash);
        assert_eq!(cache.look_up(&1, hash).unwrap().as_str(), "one");

        // 2 is now the oldest entry of the shard
        cache.insert(3, Arc::new("three".into()), 4, hash);
        assert!(cache.look_up(&2, hash).is_none());
        assert!(cache.look_up(&1, hash).is_some());
        assert!(cache.look_up(&3, hash).is_some());
        assert_eq!(cache.usage(), 8);

        cache.erase(&1, hash);
        assert!(cache.look_up(&1, hash).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_oversized_entry_is_not_cached() {
        let cache: ShardLRUCache<u32, Vec<u8>> = ShardLRUCache::new(16);
        cache.insert(1, Arc::new(vec![0u8; 100]), 100, 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_replace_entry() {
        let cache: ShardLRUCache<u32, u32> = ShardLRUCache::new(1600);
        for i in 0..10 {
            cache.insert(7, Arc::new(i), 10, 42);
        }
        assert_eq!(*cache.look_up(&7, 42).unwrap(), 9);
        assert_eq!(cache.usage(), 10);
    }
}
