//! Table manager: a background thread that keeps level sizes within their limits.
//!
//! Level 0 is compacted once it holds more than `level0_page_threshold` pages: every
//! level 0 page is merged with the overlapping level 1 pages. A level L >= 1 is
//! compacted once its size exceeds `level_size_limit(L)`: one random page of L is
//! merged with the overlapping pages of L + 1. The last level is never compacted.

mod level_0;
mod level_n;

use crate::cache::BlockCache;
use crate::db::db_iter::{MergingIterator, Source};
use crate::db::is_tombstone;
use crate::db::options::Options;
use crate::error::StrataError;
use crate::manifest::{Manifest, ManifestEdit, ManifestSnapshot, PageDescriptor, PageHandle};
use crate::sstable::{page_path, TableWriteHandle};
use crate::Result;
use arc_swap::ArcSwapOption;
use crossbeam_channel::{RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Consecutive failed compactions after which the table manager gives up.
const COMPACTION_RETRY_TIMES: usize = 3;

pub struct TableManager {
    sender: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TableManager {
    /// Start the compaction thread.
    ///
    /// A compaction that fails `COMPACTION_RETRY_TIMES` times in a row stops the
    /// thread and is stored in `background_error`.
    pub fn start(
        manifest: Arc<Manifest>,
        cache: Arc<BlockCache>,
        options: Options,
        background_error: Arc<ArcSwapOption<String>>,
    ) -> Result<TableManager> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let interval = options.compaction_interval;
        let compactor = Compactor {
            manifest,
            cache,
            options,
        };
        let handle = std::thread::Builder::new()
            .name("table-manager".into())
            .spawn(move || {
                info!("thread `table-manager` start!");
                let mut failures = 0;
                loop {
                    match receiver.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    // coalesce pending triggers
                    while receiver.try_recv().is_ok() {}

                    match compactor.compact_all() {
                        Ok(()) => failures = 0,
                        Err(e) => {
                            failures += 1;
                            compactor
                                .options
                                .log_event(&format!("compaction failed ({}): {}", failures, e));
                            if failures >= COMPACTION_RETRY_TIMES {
                                error!("table manager stops after {} failures", failures);
                                background_error.store(Some(Arc::new(format!(
                                    "compaction failed: {}",
                                    e
                                ))));
                                break;
                            }
                        }
                    }
                }
                info!("thread `table-manager` exit!");
            })?;

        Ok(TableManager {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Ask for a compaction check, e.g. after a flush.
    pub fn notify(&self) {
        if let Ok(guard) = self.sender.lock() {
            if let Some(sender) = guard.as_ref() {
                let _ = sender.send(());
            }
        }
    }

    /// Stop the thread after the running compaction, if any, has finished.
    pub fn close(&self) -> Result<()> {
        drop(self.sender.lock()?.take());
        let handle = self.handle.lock()?.take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| StrataError::BackgroundTask("table manager panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for TableManager {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("{}", e);
        }
    }
}

pub(crate) struct Compactor {
    manifest: Arc<Manifest>,
    cache: Arc<BlockCache>,
    options: Options,
}

impl Compactor {
    /// Compact until every level is within its limit.
    pub(crate) fn compact_all(&self) -> Result<()> {
        while self.compact_once()? {}
        Ok(())
    }

    /// Run at most one compaction. Returns whether one ran.
    fn compact_once(&self) -> Result<bool> {
        let snapshot = self.manifest.snapshot();
        if snapshot.pages_at_level(0).len() > self.options.level0_page_threshold {
            level_0::compact(self, &snapshot)?;
            return Ok(true);
        }
        for level in 1..snapshot.num_levels() - 1 {
            if snapshot.level_size(level) > self.options.level_size_limit(level) {
                level_n::compact(self, &snapshot, level)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Merge `sources` (oldest first) into new pages of `target_level` and swap them
    /// for `inputs` in one manifest edit.
    ///
    /// Tombstones are dropped when no level below `target_level` overlaps [`min_key`, `max_key`].
    fn merge(
        &self,
        snapshot: &ManifestSnapshot,
        target_level: usize,
        inputs: &[Arc<PageHandle>],
        sources: Vec<Source>,
        min_key: &[u8],
        max_key: &[u8],
    ) -> Result<()> {
        let drop_tombstones = (target_level + 1..snapshot.num_levels())
            .all(|level| snapshot.overlapping_pages(level, min_key, max_key).is_empty());

        let mut outputs = vec![];
        let result = self
            .write_outputs(
                target_level,
                MergingIterator::from_iterators(sources),
                drop_tombstones,
                &mut outputs,
            )
            .and_then(|()| {
                self.manifest.modify_pages(ManifestEdit {
                    add: outputs.clone(),
                    remove: inputs.iter().map(|page| (page.level, page.version)).collect(),
                    flushed_generation: None,
                })
            });
        if let Err(e) = result {
            for page in &outputs {
                let path = page_path(self.manifest.root(), page.level, page.version);
                if let Err(remove_error) = std::fs::remove_file(&path) {
                    warn!("failed to remove page {:?}: {}", path, remove_error);
                }
            }
            return Err(e);
        }

        self.options.log_event(&format!(
            "compact {} pages into {} pages at level {}",
            inputs.len(),
            outputs.len(),
            target_level
        ));
        Ok(())
    }

    fn write_outputs(
        &self,
        level: usize,
        merged: MergingIterator,
        drop_tombstones: bool,
        outputs: &mut Vec<PageDescriptor>,
    ) -> Result<()> {
        let mut writer: Option<TableWriteHandle> = None;
        for entry in merged {
            let (key, value) = entry?;
            if drop_tombstones && is_tombstone(&value) {
                continue;
            }
            if writer.is_none() {
                let version = self.manifest.next_version(level)?;
                writer = Some(TableWriteHandle::new(
                    self.manifest.root(),
                    level,
                    version,
                    self.options.block_size,
                )?);
            }
            let mut full = false;
            if let Some(writer) = writer.as_mut() {
                writer.add(&key, &value)?;
                full = writer.approximate_size() >= self.options.max_page_size;
            }
            if full {
                if let Some(writer) = writer.take() {
                    outputs.push(writer.finish()?);
                }
            }
        }
        if let Some(writer) = writer {
            outputs.push(writer.finish()?);
        }
        Ok(())
    }
}

/// Smallest first key and largest last key of `pages`.
fn key_range(pages: &[Arc<PageHandle>]) -> Option<(Vec<u8>, Vec<u8>)> {
    let min_key = pages.iter().map(|page| &page.first_key).min()?;
    let max_key = pages.iter().map(|page| &page.last_key).max()?;
    Some((min_key.clone(), max_key.clone()))
}

#[cfg(test)]
mod tests {
    use crate::cache::BlockCache;
    use crate::compact::{Compactor, TableManager};
    use crate::db::options::Options;
    use crate::error::StrataError;
    use crate::manifest::{Manifest, ManifestEdit};
    use crate::sstable::{page_path, SortedBlockTable, TableWriteHandle};
    use arc_swap::ArcSwapOption;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn add_page(manifest: &Manifest, level: usize, entries: &[(String, &str)]) -> u64 {
        let version = manifest.next_version(level).unwrap();
        let mut writer = TableWriteHandle::new(manifest.root(), level, version, 128).unwrap();
        for (k, v) in entries {
            writer.add(k.as_bytes(), v.as_bytes()).unwrap();
        }
        manifest
            .modify_pages(ManifestEdit {
                add: vec![writer.finish().unwrap()],
                ..Default::default()
            })
            .unwrap();
        version
    }

    fn keys(range: std::ops::Range<i32>, value: &'static str) -> Vec<(String, &'static str)> {
        range.map(|i| (format!("key{:04}", i), value)).collect()
    }

    fn compactor(root: &std::path::Path, options: Options) -> Compactor {
        Compactor {
            manifest: Arc::new(Manifest::open(root, options.max_levels).unwrap()),
            cache: Arc::new(BlockCache::new(1 << 20)),
            options,
        }
    }

    #[test]
    fn test_level0_compaction() {
        let _ = env_logger::try_init();
        let temp_dir = tempfile::TempDir::new().unwrap();
        let root = temp_dir.path();
        let compactor = compactor(root, Options::default().with_level0_page_threshold(2));
        let manifest = &compactor.manifest;

        add_page(manifest, 1, &keys(0..100, "level1"));
        add_page(manifest, 0, &keys(50..150, "old"));
        add_page(manifest, 0, &keys(90..110, "new"));
        let mut deletes = keys(0..10, "");
        deletes.push(("key0120".into(), ""));
        deletes.sort();
        add_page(manifest, 0, &deletes);

        compactor.compact_all().unwrap();
        let snapshot = manifest.snapshot();
        assert!(snapshot.pages_at_level(0).is_empty());
        assert_eq!(snapshot.pages_at_level(1).len(), 1);

        let cache = &compactor.cache;
        let get = |key: &str| {
            let page = snapshot.find_page_for_key(1, key.as_bytes())?;
            SortedBlockTable::lookup(root, 1, page.version, cache, key.as_bytes()).unwrap()
        };
        // nothing lives below level 1, so tombstones are gone
        assert_eq!(get("key0005"), None);
        assert_eq!(get("key0120"), None);
        assert_eq!(get("key0020"), Some(b"level1".to_vec()));
        assert_eq!(get("key0060"), Some(b"old".to_vec()));
        assert_eq!(get("key0100"), Some(b"new".to_vec()));
        assert_eq!(get("key0149"), Some(b"old".to_vec()));

        // inputs are removed from disk once no snapshot holds them
        drop(snapshot);
        assert!(!page_path(root, 0, 1).exists());
        assert!(!page_path(root, 1, 1).exists());
    }

    #[test]
    fn test_compaction_committed_despite_failed_dir_sync() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let root = temp_dir.path();
        let options = Options::default().with_level0_page_threshold(1);
        let mut manifest = Manifest::open(root, options.max_levels).unwrap();
        manifest.set_dir_sync(|_| Err(StrataError::Custom("sync failed".into())));
        let compactor = Compactor {
            manifest: Arc::new(manifest),
            cache: Arc::new(BlockCache::new(1 << 20)),
            options,
        };

        add_page(&compactor.manifest, 0, &keys(0..50, "old"));
        add_page(&compactor.manifest, 0, &keys(25..75, "new"));
        compactor.compact_all().unwrap();
        let outputs: Vec<_> = compactor
            .manifest
            .snapshot()
            .pages_at_level(1)
            .iter()
            .map(|page| page.version)
            .collect();
        assert_eq!(outputs.len(), 1);
        drop(compactor);

        // the outputs are live after a restart and the inputs are gone
        let manifest = Manifest::open(root, Options::default().max_levels).unwrap();
        let snapshot = manifest.snapshot();
        assert!(snapshot.pages_at_level(0).is_empty());
        assert_eq!(snapshot.pages_at_level(1)[0].version, outputs[0]);
        let cache = BlockCache::new(1 << 20);
        assert_eq!(
            SortedBlockTable::lookup(root, 1, outputs[0], &cache, b"key0030").unwrap(),
            Some(b"new".to_vec())
        );
        assert_eq!(
            SortedBlockTable::lookup(root, 1, outputs[0], &cache, b"key0010").unwrap(),
            Some(b"old".to_vec())
        );
        assert!(!page_path(root, 0, 1).exists());
        assert!(!page_path(root, 0, 2).exists());
    }

    #[test]
    fn test_tombstones_kept_above_deeper_data() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let root = temp_dir.path();
        let compactor = compactor(root, Options::default().with_level0_page_threshold(0));
        let manifest = &compactor.manifest;

        add_page(manifest, 2, &keys(0..10, "deep"));
        add_page(manifest, 0, &keys(0..5, ""));
        compactor.compact_all().unwrap();

        let snapshot = manifest.snapshot();
        let page = snapshot.find_page_for_key(1, b"key0003").unwrap();
        assert_eq!(
            SortedBlockTable::lookup(root, 1, page.version, &compactor.cache, b"key0003").unwrap(),
            Some(vec![])
        );
    }

    #[test]
    fn test_level_n_compaction_splits_output() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let root = temp_dir.path();
        let options = Options::default()
            .with_level_size_base(1024)
            .with_max_page_size(2048)
            .with_max_levels(3);
        let compactor = compactor(root, options);
        let manifest = &compactor.manifest;

        let value = "v".repeat(100);
        let entries: Vec<_> = (0..100).map(|i| (format!("key{:04}", i), value.as_str())).collect();
        add_page(manifest, 1, &entries);
        compactor.compact_all().unwrap();

        let snapshot = manifest.snapshot();
        assert!(snapshot.pages_at_level(1).is_empty());
        let level2 = snapshot.pages_at_level(2);
        assert!(level2.len() > 1);
        assert!(level2.windows(2).all(|w| w[0].last_key < w[1].first_key));
        let total: usize = level2
            .iter()
            .map(|page| {
                SortedBlockTable::new(root, 2, page.version)
                    .iter(compactor.cache.clone())
                    .count()
            })
            .sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn test_table_manager_runs_on_notify() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let root = temp_dir.path();
        let options = Options::default()
            .with_level0_page_threshold(1)
            .with_compaction_interval(Duration::from_secs(60));
        let manifest = Arc::new(Manifest::open(root, options.max_levels).unwrap());
        let background_error = Arc::new(ArcSwapOption::empty());
        let manager = TableManager::start(
            manifest.clone(),
            Arc::new(BlockCache::new(1 << 20)),
            options,
            background_error.clone(),
        )
        .unwrap();

        add_page(&manifest, 0, &keys(0..10, "a"));
        add_page(&manifest, 0, &keys(5..15, "b"));
        manager.notify();

        let deadline = Instant::now() + Duration::from_secs(10);
        while !manifest.snapshot().pages_at_level(0).is_empty() {
            assert!(Instant::now() < deadline, "compaction did not run");
            std::thread::sleep(Duration::from_millis(10));
        }
        manager.close().unwrap();
        manager.close().unwrap();
        assert!(background_error.load().is_none());
        assert_eq!(manifest.snapshot().pages_at_level(1).len(), 1);
    }
}
