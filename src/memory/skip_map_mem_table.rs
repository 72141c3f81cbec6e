use crate::db::{Key, Value};
use crossbeam_skiplist::SkipMap;
use std::cmp::Reverse;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Skiplist entry key. Versions of one user key are ordered newest first.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
struct MemKey {
    key: Key,
    seq: Reverse<u64>,
}

impl MemKey {
    fn newest(key: &[u8]) -> MemKey {
        MemKey {
            key: key.to_vec(),
            seq: Reverse(u64::MAX),
        }
    }

    /// Greater than every version of `key`; sequence numbers start at 1.
    fn past_versions(key: &[u8]) -> MemKey {
        MemKey {
            key: key.to_vec(),
            seq: Reverse(0),
        }
    }
}

/// Ordered in-memory table built on `crossbeam_skiplist::SkipMap`.
///
/// Every insert is tagged with a sequence number. A [MemTableIter] only sees
/// versions published before it was created, so writers never block readers.
/// Old versions of a key are removed on overwrite while no iterator is alive.
///
/// Writers must be serialized by the caller; readers may run at any time.
#[derive(Default)]
pub struct MemTable {
    inner: SkipMap<MemKey, Value>,
    last_seq: AtomicU64,
    size: AtomicUsize,
    len: AtomicUsize,
    live_snapshots: AtomicUsize,
}

impl MemTable {
    pub(crate) fn insert(&self, key: Key, value: Value) {
        let seq = self.last_seq.load(Ordering::SeqCst) + 1;
        match self.inner.lower_bound(Bound::Included(&MemKey::newest(&key))) {
            Some(entry) if entry.key().key == key => {
                let old_length = entry.value().len();
                if value.len() >= old_length {
                    self.size
                        .fetch_add(value.len() - old_length, Ordering::SeqCst);
                } else {
                    self.size
                        .fetch_sub(old_length - value.len(), Ordering::SeqCst);
                }
            }
            _ => {
                self.size.fetch_add(key.len() + value.len(), Ordering::SeqCst);
                self.len.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mem_key = MemKey {
            key,
            seq: Reverse(seq),
        };
        let upper = MemKey::past_versions(&mem_key.key);
        self.inner.insert(mem_key.clone(), value);
        self.last_seq.store(seq, Ordering::SeqCst);

        // An iterator created after this load sees `seq`, so older versions are dead.
        if self.live_snapshots.load(Ordering::SeqCst) == 0 {
            for entry in self
                .inner
                .range((Bound::Excluded(mem_key), Bound::Excluded(upper)))
            {
                entry.remove();
            }
        }
    }

    /// Newest value of `key`. A tombstone is returned as an empty value.
    pub fn lookup(&self, key: &[u8]) -> Option<Value> {
        self.inner
            .lower_bound(Bound::Included(&MemKey::newest(key)))
            .filter(|entry| entry.key().key.as_slice() == key)
            .map(|entry| entry.value().clone())
    }

    /// Sum of key and value lengths of the newest version of every key.
    #[inline]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    /// Number of distinct keys.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(self: &Arc<Self>) -> MemTableIter {
        MemTableIter::new(self.clone(), Bound::Unbounded)
    }

    /// Snapshot of the entries whose key is greater or equal to `key`.
    pub fn iter_from(self: &Arc<Self>, key: &[u8]) -> MemTableIter {
        MemTableIter::new(self.clone(), Bound::Included(MemKey::newest(key)))
    }
}

/// Point-in-time iterator over a [MemTable], tombstones included.
pub struct MemTableIter {
    table: Arc<MemTable>,
    snapshot_seq: u64,
    bound: Bound<MemKey>,
}

impl MemTableIter {
    fn new(table: Arc<MemTable>, bound: Bound<MemKey>) -> MemTableIter {
        table.live_snapshots.fetch_add(1, Ordering::SeqCst);
        let snapshot_seq = table.last_seq.load(Ordering::SeqCst);
        MemTableIter {
            table,
            snapshot_seq,
            bound,
        }
    }
}

impl Iterator for MemTableIter {
    type Item = (Key, Value);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = self.table.inner.lower_bound(self.bound.as_ref())?;
            let mem_key = entry.key();
            if mem_key.seq.0 > self.snapshot_seq {
                self.bound = Bound::Excluded(mem_key.clone());
                continue;
            }
            self.bound = Bound::Excluded(MemKey::past_versions(&mem_key.key));
            return Some((mem_key.key.clone(), entry.value().clone()));
        }
    }
}

impl Drop for MemTableIter {
    fn drop(&mut self) {
        self.table.live_snapshots.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use crate::memory::MemTable;
    use rand::RngCore;
    use std::sync::Arc;

    #[test]
    fn test_insert() {
        let table = MemTable::default();

        let one = Vec::from(1i32.to_le_bytes());
        for i in 0..10i32 {
            table.insert(one.clone(), Vec::from(i.to_le_bytes()));
        }
        assert_eq!(Vec::from(9i32.to_le_bytes()), table.lookup(&one).unwrap());
        assert_eq!(table.len(), 1);
        assert_eq!(table.inner.len(), 1);

        table.insert(one.clone(), vec![]);
        assert_eq!(table.lookup(&one), Some(vec![]));
        assert!(table.lookup(b"missing").is_none());
    }

    #[test]
    fn test_size() {
        let table = MemTable::default();
        let mut rng = rand::thread_rng();
        for i in 0..10000u32 {
            let mut key = vec![0u8; 40];
            key[..4].copy_from_slice(&i.to_le_bytes());
            let mut value = vec![0u8; 256];
            rng.fill_bytes(&mut value);
            table.insert(key, value);
        }
        assert_eq!(table.size(), 10000 * (40 + 256));

        // overwrite only changes the value length
        let mut key = vec![0u8; 40];
        key[..4].copy_from_slice(&7u32.to_le_bytes());
        table.insert(key.clone(), vec![1u8; 6]);
        assert_eq!(table.size(), 10000 * (40 + 256) - 250);
        table.insert(key, vec![1u8; 256]);
        assert_eq!(table.size(), 10000 * (40 + 256));
        assert_eq!(table.len(), 10000);
    }

    #[test]
    fn test_snapshot_iter() {
        let table = Arc::new(MemTable::default());
        for i in 0..100 {
            table.insert(format!("key{:03}", i).into_bytes(), b"v1".to_vec());
        }
        let snapshot = table.iter();
        let from_snapshot = table.iter_from(b"key050");

        for i in 0..100 {
            table.insert(format!("key{:03}", i).into_bytes(), b"v2".to_vec());
        }
        table.insert(b"key100".to_vec(), b"v2".to_vec());
        table.insert(b"a".to_vec(), b"v2".to_vec());

        let entries: Vec<_> = snapshot.collect();
        assert_eq!(entries.len(), 100);
        for (i, (k, v)) in entries.into_iter().enumerate() {
            assert_eq!(k, format!("key{:03}", i).into_bytes());
            assert_eq!(v, b"v1".to_vec());
        }
        let entries: Vec<_> = from_snapshot.collect();
        assert_eq!(entries.len(), 50);
        assert_eq!(entries[0].0, b"key050".to_vec());

        let entries: Vec<_> = table.iter().collect();
        assert_eq!(entries.len(), 102);
        assert!(entries.iter().all(|(_, v)| v == b"v2"));
        assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_prune_after_snapshots_dropped() {
        let table = Arc::new(MemTable::default());
        table.insert(b"k".to_vec(), b"1".to_vec());
        let snapshot = table.iter();
        table.insert(b"k".to_vec(), b"2".to_vec());
        assert_eq!(table.inner.len(), 2);
        drop(snapshot);

        table.insert(b"k".to_vec(), b"3".to_vec());
        assert_eq!(table.inner.len(), 1);
        assert_eq!(table.iter().collect::<Vec<_>>(), vec![(b"k".to_vec(), b"3".to_vec())]);
    }
}
