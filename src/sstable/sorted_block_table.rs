use crate::cache::{BlockCache, BlockKey};
use crate::db::{Key, Value};
use crate::sstable::data_block::DataBlock;
use crate::sstable::footer::Footer;
use crate::sstable::index_block::IndexBlock;
use crate::sstable::{page_path, Block, INDEX_BLOCK_ID};
use crate::Result;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Read side of a page. Blocks are read through the block cache; the file is
/// opened only on a cache miss.
pub struct SortedBlockTable {
    path: PathBuf,
    level: usize,
    version: u64,
    file: Option<File>,
}

impl SortedBlockTable {
    pub fn new(root: &Path, level: usize, version: u64) -> SortedBlockTable {
        SortedBlockTable {
            path: page_path(root, level, version),
            level,
            version,
            file: None,
        }
    }

    /// Point lookup of `key` in page (level, version).
    pub fn lookup(
        root: &Path,
        level: usize,
        version: u64,
        cache: &BlockCache,
        key: &[u8],
    ) -> Result<Option<Value>> {
        let mut table = SortedBlockTable::new(root, level, version);
        let index = table.index_block(cache)?;
        let (offset, length) = match index.as_index()?.find_block(key) {
            Some(handle) => (handle.offset, handle.length),
            None => return Ok(None),
        };
        let block = table.data_block(cache, offset, length)?;
        block.as_data()?.get_value(key)
    }

    pub fn iter(self, cache: Arc<BlockCache>) -> TableIterator {
        TableIterator::new(self, cache, None)
    }

    /// Iterate entries whose key is greater or equal to `key`.
    pub fn iter_from(self, cache: Arc<BlockCache>, key: &[u8]) -> TableIterator {
        TableIterator::new(self, cache, Some(key.to_vec()))
    }

    fn file(&mut self) -> Result<&mut File> {
        let file = match self.file.take() {
            Some(file) => file,
            None => File::open(&self.path)?,
        };
        Ok(self.file.get_or_insert(file))
    }

    fn read_at(&mut self, offset: u32, length: u32) -> Result<Vec<u8>> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset as u64))?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn index_block(&mut self, cache: &BlockCache) -> Result<Arc<Block>> {
        let block_key = BlockKey::new(self.level, self.version, INDEX_BLOCK_ID);
        if let Some(block) = cache.get(&block_key) {
            return Ok(block);
        }
        let footer = Footer::load_footer(self.file()?)?;
        let buf = self.read_at(footer.index_block_offset, footer.index_block_length)?;
        let block = Arc::new(Block::Index(IndexBlock::decode(&buf)?));
        cache.put(block_key, block.clone());
        Ok(block)
    }

    fn data_block(&mut self, cache: &BlockCache, offset: u32, length: u32) -> Result<Arc<Block>> {
        let block_key = BlockKey::new(self.level, self.version, offset as u64);
        if let Some(block) = cache.get(&block_key) {
            return Ok(block);
        }
        let buf = self.read_at(offset, length)?;
        let block = Arc::new(Block::Data(DataBlock::decode(buf)?));
        cache.put(block_key, block.clone());
        Ok(block)
    }
}

/// Lazy iterator over the entries of one page in key order.
///
/// Nothing is read before the first call of `next`. After an error the iterator is exhausted.
pub struct TableIterator {
    table: SortedBlockTable,
    cache: Arc<BlockCache>,
    start: Option<Key>,
    index: Option<Arc<Block>>,
    block_idx: usize,
    block: Option<Arc<Block>>,
    entry_idx: usize,
    done: bool,
}

impl TableIterator {
    fn new(table: SortedBlockTable, cache: Arc<BlockCache>, start: Option<Key>) -> TableIterator {
        TableIterator {
            table,
            cache,
            start,
            index: None,
            block_idx: 0,
            block: None,
            entry_idx: 0,
            done: false,
        }
    }

    fn load_block(&mut self) -> Result<bool> {
        let index = match &self.index {
            Some(index) => index.clone(),
            None => {
                let index = self.table.index_block(&self.cache)?;
                if let Some(start) = &self.start {
                    self.block_idx = index.as_index()?.seek_block(start);
                }
                self.index = Some(index.clone());
                index
            }
        };
        let (offset, length) = match index.as_index()?.handle(self.block_idx) {
            Some(handle) => (handle.offset, handle.length),
            None => return Ok(false),
        };
        let block = self.table.data_block(&self.cache, offset, length)?;
        self.entry_idx = match self.start.take() {
            Some(start) => block.as_data()?.seek(&start)?,
            None => 0,
        };
        self.block = Some(block);
        Ok(true)
    }

    fn next_entry(&mut self) -> Result<Option<(Key, Value)>> {
        loop {
            if self.block.is_none() && !self.load_block()? {
                return Ok(None);
            }
            if let Some(block) = &self.block {
                let data = block.as_data()?;
                if self.entry_idx < data.len() {
                    let entry = data.owned_entry(self.entry_idx)?;
                    self.entry_idx += 1;
                    return Ok(Some(entry));
                }
            }
            self.block = None;
            self.block_idx += 1;
        }
    }
}

impl Iterator for TableIterator {
    type Item = Result<(Key, Value)>;

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

#[cfg(test)]
mod tests {
    use crate::cache::{BlockCache, BlockKey};
    use crate::sstable::sorted_block_table::SortedBlockTable;
    use crate::sstable::table_handle::tests::create_page;
    use crate::sstable::{page_path, INDEX_BLOCK_ID};
    use std::sync::Arc;

    #[test]
    fn test_lookup() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let root = temp_dir.path();
        create_page(root, 2, 3, 0..500);
        let cache = BlockCache::new(1 << 20);

        for i in 0..500 {
            let value =
                SortedBlockTable::lookup(root, 2, 3, &cache, format!("key{:03}", i).as_bytes())
                    .unwrap();
            assert_eq!(value, Some(format!("value{:03}_2", i).into_bytes()), "{}", i);
        }
        for key in ["key", "key0000", "key5", "a", "z"].iter() {
            assert!(SortedBlockTable::lookup(root, 2, 3, &cache, key.as_bytes())
                .unwrap()
                .is_none());
        }
        assert!(cache.get(&BlockKey::new(2, 3, INDEX_BLOCK_ID)).is_some());
        assert!(cache.len() > 2);
    }

    #[test]
    fn test_lookup_hits_cache() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let root = temp_dir.path();
        create_page(root, 0, 1, 0..10);
        let cache = BlockCache::new(1 << 20);
        assert!(SortedBlockTable::lookup(root, 0, 1, &cache, b"key005")
            .unwrap()
            .is_some());

        // served from the cache once the file is gone
        std::fs::remove_file(page_path(root, 0, 1)).unwrap();
        assert_eq!(
            SortedBlockTable::lookup(root, 0, 1, &cache, b"key005").unwrap(),
            Some(b"value005_0".to_vec())
        );
        let cold = BlockCache::new(1 << 20);
        assert!(SortedBlockTable::lookup(root, 0, 1, &cold, b"key005").is_err());
    }

    #[test]
    fn test_iter() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let root = temp_dir.path();
        create_page(root, 1, 1, 0..300);
        let cache = Arc::new(BlockCache::new(1 << 20));

        let entries: Vec<_> = SortedBlockTable::new(root, 1, 1)
            .iter(cache.clone())
            .map(|kv| kv.unwrap())
            .collect();
        assert_eq!(entries.len(), 300);
        for (i, (k, v)) in entries.into_iter().enumerate() {
            assert_eq!(format!("key{:03}", i).into_bytes(), k);
            assert_eq!(format!("value{:03}_1", i).into_bytes(), v);
        }

        let keys: Vec<_> = SortedBlockTable::new(root, 1, 1)
            .iter_from(cache.clone(), b"key1505")
            .map(|kv| kv.unwrap().0)
            .collect();
        assert_eq!(keys.len(), 149);
        assert_eq!(keys[0], b"key151".to_vec());

        assert_eq!(
            SortedBlockTable::new(root, 1, 1)
                .iter_from(cache.clone(), b"a")
                .count(),
            300
        );
        assert_eq!(
            SortedBlockTable::new(root, 1, 1)
                .iter_from(cache, b"z")
                .count(),
            0
        );
    }

    #[test]
    fn test_iter_missing_page() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let cache = Arc::new(BlockCache::new(1 << 20));
        let mut iter = SortedBlockTable::new(temp_dir.path(), 1, 1).iter(cache);
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }
}
