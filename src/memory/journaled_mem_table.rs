use crate::db::options::Options;
use crate::db::Value;
use crate::manifest::{Manifest, ManifestEdit};
use crate::memory::{MemTable, MemTableIter};
use crate::sstable::TableWriteHandle;
use crate::wal::Journal;
use crate::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A [MemTable] paired with the journal of its generation.
pub struct JournaledMemTable {
    root: PathBuf,
    generation: u64,
    table: Arc<MemTable>,
    /// `None` once the journal is closed.
    journal: Mutex<Option<Journal>>,
    frozen: AtomicBool,
    capacity: usize,
}

impl JournaledMemTable {
    /// Open the table of `generation`, replaying its journal if one exists.
    pub fn open(root: &Path, generation: u64, options: &Options) -> Result<JournaledMemTable> {
        let (journal, records) = Journal::recover(root, generation, options.journal_sync)?;
        let table = MemTable::default();
        if !records.is_empty() {
            info!(
                "replay {} records from journal {}",
                records.len(),
                generation
            );
        }
        for (key, value) in records {
            table.insert(key, value);
        }
        Ok(JournaledMemTable {
            root: root.to_path_buf(),
            generation,
            table: Arc::new(table),
            journal: Mutex::new(Some(journal)),
            frozen: AtomicBool::new(false),
            capacity: options.memtable_size,
        })
    }

    /// Journal the pair, then insert it into the table.
    ///
    /// Returns `Ok(false)` without writing anything if the table is frozen or closed.
    pub fn add(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let mut guard = self.journal.lock()?;
        if self.frozen.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let journal = match guard.as_mut() {
            Some(journal) => journal,
            None => return Ok(false),
        };
        journal.append(key, value)?;
        self.table.insert(key.to_vec(), value.to_vec());
        Ok(true)
    }

    /// Stop accepting writes. Returns after every in-flight `add` has finished.
    pub fn freeze(&self) -> Result<()> {
        let _guard = self.journal.lock()?;
        self.frozen.store(true, Ordering::SeqCst);
        Ok(())
    }

    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn lookup(&self, key: &[u8]) -> Option<Value> {
        self.table.lookup(key)
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.table.size() >= self.capacity
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.table.size()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn iter(&self) -> MemTableIter {
        self.table.iter()
    }

    pub fn iter_from(&self, key: &[u8]) -> MemTableIter {
        self.table.iter_from(key)
    }

    /// Sync and close the journal. Later `add`s return `Ok(false)`.
    pub fn close(&self) -> Result<()> {
        let journal = self.journal.lock()?.take();
        if let Some(mut journal) = journal {
            journal.close()?;
        }
        Ok(())
    }

    /// Write the frozen table as level 0 page (0, generation), commit it to the manifest,
    /// then delete the journal.
    pub fn write_to_sorted_block_table(&self, manifest: &Manifest, options: &Options) -> Result<()> {
        debug_assert!(self.is_frozen());
        let mut add = vec![];
        if !self.is_empty() {
            let mut write_handle =
                TableWriteHandle::new(&self.root, 0, self.generation, options.block_size)?;
            for (key, value) in self.iter() {
                write_handle.add(&key, &value)?;
            }
            add.push(write_handle.finish()?);
        }
        manifest.modify_pages(ManifestEdit {
            add,
            remove: vec![],
            flushed_generation: Some(self.generation),
        })?;

        self.close()?;
        Journal::remove(&self.root, self.generation)
    }
}
