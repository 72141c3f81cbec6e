use crate::cache::BlockCache;
use crate::compact::TableManager;
use crate::db::db_iter::{page_source, sorted_run_source, DBIterator, KeyValue, Source};
use crate::db::options::Options;
use crate::db::{is_tombstone, Key, Value, SET_RETRY_TIMES};
use crate::error::StrataError;
use crate::manifest::Manifest;
use crate::memory::{JournaledMemTable, MemTableIter};
use crate::sstable::SortedBlockTable;
use crate::wal::{list_generations, Journal};
use crate::Result;
use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Single permit held by the rotation whose flush is in flight.
struct RotationGate {
    sender: Sender<()>,
    receiver: Receiver<()>,
}

impl RotationGate {
    fn new() -> RotationGate {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let _ = sender.send(());
        RotationGate { sender, receiver }
    }

    fn acquire(&self) -> Result<()> {
        self.receiver
            .recv()
            .map_err(|_| StrataError::Custom("rotation gate disconnected".into()))
    }

    fn acquire_timeout(&self, timeout: Duration) -> Result<()> {
        self.receiver.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => StrataError::Timeout(timeout),
            RecvTimeoutError::Disconnected => {
                StrataError::Custom("rotation gate disconnected".into())
            }
        })
    }

    fn release(&self) {
        let _ = self.sender.try_send(());
    }
}

/// Embedded key-value store.
///
/// Writes go to the active memory table and its journal. A full table is rotated:
/// it is replaced by an empty one and flushed to a level 0 page in the background.
/// At most one rotated table exists at a time, so a rotation waits for the
/// previous flush to finish.
///
/// Reads look at the active table, the rotated table, the level 0 pages from the
/// newest, then one candidate page per deeper level.
pub struct KeyValueStore {
    root: PathBuf,
    options: Options,
    manifest: Arc<Manifest>,
    cache: Arc<BlockCache>,
    active: ArcSwap<JournaledMemTable>,
    rotated: Arc<ArcSwapOption<JournaledMemTable>>,
    /// Serializes rotations.
    rotation_lock: Mutex<()>,
    /// Held for writing while `active` and `rotated` change together.
    swap_lock: RwLock<()>,
    gate: Arc<RotationGate>,
    flush_pool: rayon::ThreadPool,
    table_manager: Arc<TableManager>,
    /// First failure of a background flush or of the table manager.
    background_error: Arc<ArcSwapOption<String>>,
    closed: AtomicBool,
}

impl KeyValueStore {
    pub fn open(root: impl AsRef<Path>) -> Result<KeyValueStore> {
        Self::open_with_options(root, Options::default())
    }

    pub fn open_with_options(root: impl AsRef<Path>, options: Options) -> Result<KeyValueStore> {
        options.validate()?;
        let root = root.as_ref().to_path_buf();
        let flush_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .thread_name(|i| format!("flush-{}", i))
            .build()?;
        let background_error = Arc::new(ArcSwapOption::empty());
        let (manifest, cache, active, table_manager) =
            Self::init(&root, &options, background_error.clone())?;

        options.log_event(&format!(
            "open store at {:?}, generation {}",
            root,
            active.generation()
        ));
        Ok(KeyValueStore {
            root,
            options,
            manifest,
            cache,
            active: ArcSwap::from_pointee(active),
            rotated: Arc::new(ArcSwapOption::empty()),
            rotation_lock: Mutex::new(()),
            swap_lock: RwLock::new(()),
            gate: Arc::new(RotationGate::new()),
            flush_pool,
            table_manager: Arc::new(table_manager),
            background_error,
            closed: AtomicBool::new(false),
        })
    }

    #[allow(clippy::type_complexity)]
    fn init(
        root: &Path,
        options: &Options,
        background_error: Arc<ArcSwapOption<String>>,
    ) -> Result<(Arc<Manifest>, Arc<BlockCache>, JournaledMemTable, TableManager)> {
        let manifest = Arc::new(Manifest::open(root, options.max_levels)?);
        let cache = Arc::new(BlockCache::new(options.cache_capacity));
        let active = Self::recover(root, &manifest, options)?;
        let table_manager = TableManager::start(
            manifest.clone(),
            cache.clone(),
            options.clone(),
            background_error,
        )?;
        table_manager.notify();
        Ok((manifest, cache, active, table_manager))
    }

    /// Bring journals in line with the manifest and open the active table.
    ///
    /// Journals of flushed generations are deleted; older unflushed ones are replayed
    /// and flushed to level 0. The journal of the newest generation stays active.
    fn recover(root: &Path, manifest: &Manifest, options: &Options) -> Result<JournaledMemTable> {
        let flushed = manifest.snapshot().flushed_generation();
        let current = manifest.current_version(0);
        for generation in list_generations(root)? {
            if flushed.map_or(false, |flushed| generation <= flushed) {
                debug!("remove journal {} of a flushed generation", generation);
                Journal::remove(root, generation)?;
            } else if generation > current {
                return Err(StrataError::Corruption(format!(
                    "journal {} is newer than the manifest generation {}",
                    generation, current
                )));
            } else if generation < current {
                let table = JournaledMemTable::open(root, generation, options)?;
                table.freeze()?;
                table.write_to_sorted_block_table(manifest, options)?;
                options.log_event(&format!("recovered generation {}", generation));
            }
        }
        JournaledMemTable::open(root, current, options)
    }

    fn check_writable(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StrataError::Closed);
        }
        match self.background_error.load_full() {
            Some(e) => Err(StrataError::BackgroundTask(e.to_string())),
            None => Ok(()),
        }
    }

    /// Store `value` under `key`. An empty value deletes the key.
    pub fn set(&self, key: Key, value: Value) -> Result<()> {
        self.check_writable()?;
        for _ in 0..SET_RETRY_TIMES {
            let active = self.active.load_full();
            if active.add(&key, &value)? {
                if active.is_full() {
                    self.rotate(&active)?;
                }
                return Ok(());
            }
            // lost a race with a rotation, or the store is closing
            self.check_writable()?;
            std::thread::yield_now();
        }
        Err(StrataError::WriteContention {
            attempts: SET_RETRY_TIMES,
        })
    }

    pub fn delete(&self, key: Key) -> Result<()> {
        self.set(key, Value::new())
    }

    /// `Ok(None)` if `key` was never written or has been deleted.
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StrataError::Closed);
        }
        let mut value = self.active.load().lookup(key);
        if value.is_none() {
            if let Some(rotated) = self.rotated.load().as_ref() {
                value = rotated.lookup(key);
            }
        }
        if value.is_none() {
            value = self.lookup_pages(key)?;
        }
        Ok(value.filter(|value| !is_tombstone(value)))
    }

    fn lookup_pages(&self, key: &[u8]) -> Result<Option<Value>> {
        let snapshot = self.manifest.snapshot();
        let level0 = snapshot
            .pages_at_level(0)
            .iter()
            .filter(|page| page.contains(key));
        let deeper = (1..snapshot.num_levels())
            .filter_map(|level| snapshot.find_page_for_key(level, key));
        for page in level0.chain(deeper) {
            if let Some(value) =
                SortedBlockTable::lookup(&self.root, page.level, page.version, &self.cache, key)?
            {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// All live entries in key order.
    pub fn iter(&self) -> Result<DBIterator> {
        self.enumerate(None)
    }

    /// Live entries whose key is greater or equal to `key`, in key order.
    pub fn iter_from(&self, key: &[u8]) -> Result<DBIterator> {
        self.enumerate(Some(key))
    }

    fn enumerate(&self, start: Option<&[u8]>) -> Result<DBIterator> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StrataError::Closed);
        }
        let mem_iter = |table: &JournaledMemTable| -> Source {
            let iter: MemTableIter = match start {
                Some(key) => table.iter_from(key),
                None => table.iter(),
            };
            Box::new(iter.map(Ok::<KeyValue, StrataError>))
        };
        let (active, rotated, snapshot) = {
            let _guard = self.swap_lock.read()?;
            let active = mem_iter(self.active.load_full().as_ref());
            let rotated = self
                .rotated
                .load_full()
                .map(|table| mem_iter(table.as_ref()));
            (active, rotated, self.manifest.snapshot())
        };

        // oldest first
        let mut sources: Vec<Source> = vec![];
        for level in (1..snapshot.num_levels()).rev() {
            sources.push(sorted_run_source(
                self.root.clone(),
                snapshot.pages_at_level(level).to_vec(),
                self.cache.clone(),
                start.map(|key| key.to_vec()),
            ));
        }
        for page in snapshot.pages_at_level(0).iter().rev() {
            if start.map_or(true, |key| page.last_key.as_slice() >= key) {
                sources.push(page_source(&snapshot, page, &self.cache, start));
            }
        }
        sources.extend(rotated);
        sources.push(active);
        Ok(DBIterator::new(sources, snapshot))
    }

    fn rotate(&self, full: &Arc<JournaledMemTable>) -> Result<()> {
        let _guard = self.rotation_lock.lock()?;
        let active = self.active.load_full();
        if !Arc::ptr_eq(&active, full) || !active.is_full() {
            // rotated by another writer
            return Ok(());
        }

        self.gate.acquire()?;
        if self.closed.load(Ordering::SeqCst) {
            self.gate.release();
            return Ok(());
        }
        if let Err(e) = self.swap_active(&active) {
            self.gate.release();
            return Err(e);
        }
        self.options
            .log_event(&format!("rotate generation {}", active.generation()));

        let task = FlushTask {
            table: active,
            manifest: self.manifest.clone(),
            options: self.options.clone(),
            rotated: self.rotated.clone(),
            gate: self.gate.clone(),
            table_manager: self.table_manager.clone(),
            background_error: self.background_error.clone(),
        };
        self.flush_pool.spawn(move || task.run());
        Ok(())
    }

    /// Publish `active` as the rotated table, install a fresh table and freeze `active`.
    fn swap_active(&self, active: &Arc<JournaledMemTable>) -> Result<()> {
        let generation = self.manifest.next_version(0)?;
        let next = JournaledMemTable::open(&self.root, generation, &self.options)?;
        {
            let _guard = self.swap_lock.write()?;
            // readers look at `active` first, so `rotated` is published before it changes
            self.rotated.store(Some(active.clone()));
            self.active.store(Arc::new(next));
        }
        active.freeze()
    }

    /// Remove every entry and start over with an empty store.
    pub fn truncate(&mut self) -> Result<()> {
        match self.close() {
            // the failed state is wiped below
            Ok(()) | Err(StrataError::BackgroundTask(_)) => {}
            Err(e) => return Err(e),
        }
        self.manifest.invalidate();

        let entries = std::fs::read_dir(&self.root)?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<std::io::Result<Vec<_>>>()?;
        fs_extra::remove_items(&entries)?;

        self.background_error.store(None);
        let (manifest, cache, active, table_manager) =
            Self::init(&self.root, &self.options, self.background_error.clone())?;
        self.manifest = manifest;
        self.cache = cache;
        self.active = ArcSwap::from_pointee(active);
        self.rotated.store(None);
        self.gate = Arc::new(RotationGate::new());
        self.table_manager = Arc::new(table_manager);
        self.closed.store(false, Ordering::SeqCst);

        self.options
            .log_event(&format!("truncate store at {:?}", self.root));
        Ok(())
    }

    /// Wait for an in-flight flush, stop the table manager and close the journal.
    ///
    /// Returns the failure of a background task, if one happened. Closing a closed
    /// store does nothing.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.gate.acquire_timeout(self.options.close_timeout) {
            self.closed.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.gate.release();

        self.table_manager.close()?;
        self.active.load().close()?;
        self.options
            .log_event(&format!("close store at {:?}", self.root));

        match self.background_error.load_full() {
            Some(e) => Err(StrataError::BackgroundTask(e.to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for KeyValueStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("failed to close store at {:?}: {}", self.root, e);
        }
    }
}

struct FlushTask {
    table: Arc<JournaledMemTable>,
    manifest: Arc<Manifest>,
    options: Options,
    rotated: Arc<ArcSwapOption<JournaledMemTable>>,
    gate: Arc<RotationGate>,
    table_manager: Arc<TableManager>,
    background_error: Arc<ArcSwapOption<String>>,
}

impl FlushTask {
    fn run(self) {
        let generation = self.table.generation();
        match self
            .table
            .write_to_sorted_block_table(&self.manifest, &self.options)
        {
            Ok(()) => {
                self.rotated.store(None);
                self.options
                    .log_event(&format!("flushed generation {}", generation));
                self.table_manager.notify();
            }
            Err(e) => {
                // the table stays readable and its journal is replayed at the next open
                let msg = format!("flush of generation {} failed: {}", generation, e);
                self.options.log_event(&msg);
                self.background_error.store(Some(Arc::new(msg)));
            }
        }
        self.gate.release();
    }
}
