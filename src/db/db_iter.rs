use crate::cache::BlockCache;
use crate::db::{is_tombstone, Key, Value};
use crate::manifest::{ManifestSnapshot, PageHandle};
use crate::sstable::SortedBlockTable;
use crate::Result;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::Arc;

pub type KeyValue = (Key, Value);

/// A sorted source of entries, tombstones included.
pub(crate) type Source = Box<dyn Iterator<Item = Result<KeyValue>> + Send>;

#[derive(PartialEq, Eq)]
pub(crate) struct KeyValueIterItem {
    pub(crate) key: Key,
    pub(crate) value: Value,
    pub(crate) iter_id: usize,
}

impl PartialOrd for KeyValueIterItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyValueIterItem {
    /// Larger iter idx is larger.
    /// Smaller key is larger.
    /// [std::collections::BinaryHeap] returns the greatest item
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then(self.iter_id.cmp(&other.iter_id))
    }
}

/// K-way merge of sorted sources, ordered from the oldest to the newest.
///
/// Every key is returned once, with the value of the newest source holding it.
pub struct MergingIterator {
    iterators: Vec<Source>,
    heap: BinaryHeap<KeyValueIterItem>,
    initialized: bool,
    done: bool,
}

impl MergingIterator {
    pub(crate) fn from_iterators(iterators: Vec<Source>) -> MergingIterator {
        MergingIterator {
            heap: BinaryHeap::with_capacity(iterators.len()),
            iterators,
            initialized: false,
            done: false,
        }
    }

    fn pull(&mut self, iter_id: usize) -> Result<()> {
        if let Some(item) = self.iterators[iter_id].next() {
            let (key, value) = item?;
            self.heap.push(KeyValueIterItem {
                key,
                value,
                iter_id,
            });
        }
        Ok(())
    }

    fn next_entry(&mut self) -> Result<Option<KeyValue>> {
        if !self.initialized {
            self.initialized = true;
            for iter_id in 0..self.iterators.len() {
                self.pull(iter_id)?;
            }
        }
        let top = match self.heap.pop() {
            Some(top) => top,
            None => return Ok(None),
        };
        self.pull(top.iter_id)?;
        // older versions of the same key
        while self.heap.peek().map_or(false, |item| item.key == top.key) {
            if let Some(shadowed) = self.heap.pop() {
                self.pull(shadowed.iter_id)?;
            }
        }
        Ok(Some((top.key, top.value)))
    }
}

impl Iterator for MergingIterator {
    type Item = Result<KeyValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Iterator returned by [crate::KeyValueStore::iter].
///
/// It reads a fixed view of the store: writes, rotations and compactions that
/// happen after it was created are not visible. Deleted keys are skipped.
pub struct DBIterator {
    inner: MergingIterator,
    /// Keeps the pages being read on disk.
    _snapshot: ManifestSnapshot,
}

impl DBIterator {
    pub(crate) fn new(sources: Vec<Source>, snapshot: ManifestSnapshot) -> DBIterator {
        DBIterator {
            inner: MergingIterator::from_iterators(sources),
            _snapshot: snapshot,
        }
    }
}

impl Iterator for DBIterator {
    type Item = Result<KeyValue>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok((_, value)) if is_tombstone(&value) => continue,
                item => return Some(item),
            }
        }
    }
}

/// Entries of one page, starting at `start` if given.
pub(crate) fn page_source(
    snapshot: &ManifestSnapshot,
    page: &PageHandle,
    cache: &Arc<BlockCache>,
    start: Option<&[u8]>,
) -> Source {
    let table = SortedBlockTable::new(snapshot.root(), page.level, page.version);
    match start {
        Some(key) => Box::new(table.iter_from(cache.clone(), key)),
        None => Box::new(table.iter(cache.clone())),
    }
}

/// Entries of disjoint pages sorted by key, read one page after another.
///
/// The caller keeps a snapshot holding `pages` alive while the source is read.
pub(crate) fn sorted_run_source(
    root: PathBuf,
    pages: Vec<Arc<PageHandle>>,
    cache: Arc<BlockCache>,
    start: Option<Key>,
) -> Source {
    let pages: Vec<_> = match &start {
        Some(key) => pages
            .into_iter()
            .filter(|page| page.last_key >= *key)
            .collect(),
        None => pages,
    };
    Box::new(pages.into_iter().flat_map(move |page| {
        let table = SortedBlockTable::new(&root, page.level, page.version);
        match &start {
            Some(key) => table.iter_from(cache.clone(), key),
            None => table.iter(cache.clone()),
        }
    }))
}

#[cfg(test)]
mod tests {
    use crate::db::db_iter::{KeyValue, KeyValueIterItem, MergingIterator, Source};
    use crate::error::StrataError;
    use std::collections::BinaryHeap;

    fn source(entries: &[(&str, &str)]) -> Source {
        let entries: Vec<crate::Result<KeyValue>> = entries
            .iter()
            .map(|(k, v)| Ok((k.as_bytes().to_vec(), v.as_bytes().to_vec())))
            .collect();
        Box::new(entries.into_iter())
    }

    #[test]
    fn test_item_order() {
        let mut heap = BinaryHeap::new();
        heap.push(KeyValueIterItem {
            key: b"b".to_vec(),
            value: vec![],
            iter_id: 2,
        });
        heap.push(KeyValueIterItem {
            key: b"a".to_vec(),
            value: vec![],
            iter_id: 0,
        });
        heap.push(KeyValueIterItem {
            key: b"a".to_vec(),
            value: vec![],
            iter_id: 1,
        });
        let order: Vec<_> = std::iter::from_fn(|| heap.pop())
            .map(|item| (item.key, item.iter_id))
            .collect();
        assert_eq!(
            order,
            vec![(b"a".to_vec(), 1), (b"a".to_vec(), 0), (b"b".to_vec(), 2)]
        );
    }

    #[test]
    fn test_newest_source_wins() {
        let merged: Vec<_> = MergingIterator::from_iterators(vec![
            source(&[("a", "old"), ("c", "old"), ("e", "old")]),
            source(&[("b", "mid"), ("c", "mid")]),
            source(&[("c", ""), ("d", "new"), ("e", "new")]),
        ])
        .map(|kv| kv.unwrap())
        .map(|(k, v)| (String::from_utf8(k).unwrap(), String::from_utf8(v).unwrap()))
        .collect();
        assert_eq!(
            merged,
            vec![
                ("a".to_string(), "old".to_string()),
                ("b".to_string(), "mid".to_string()),
                ("c".to_string(), "".to_string()),
                ("d".to_string(), "new".to_string()),
                ("e".to_string(), "new".to_string()),
            ]
        );
    }

    #[test]
    fn test_error_ends_iteration() {
        let failing: Source = Box::new(
            vec![
                Ok((b"a".to_vec(), b"1".to_vec())),
                Err(StrataError::Corruption("bad block".into())),
            ]
            .into_iter(),
        );
        let mut merged = MergingIterator::from_iterators(vec![failing, source(&[("b", "2")])]);
        assert_eq!(merged.next().unwrap().unwrap().0, b"a".to_vec());
        assert!(merged.next().unwrap().is_err());
        assert!(merged.next().is_none());
    }
}
