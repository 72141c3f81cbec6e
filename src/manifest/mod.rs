//! Manifest: the durable set of live pages per level, and per-level version counters.
//!
//! Level 0 pages come from memtable flushes and may overlap; the newest version wins.
//! Pages of levels >= 1 are disjoint and sorted by first key.
//!
//! Readers take a [ManifestSnapshot], which never blocks writers. A page retired
//! by [Manifest::modify_pages] stays on disk until the last snapshot that can
//! see it is dropped.

mod page;
mod persist;

pub use page::{PageDescriptor, PageHandle};
pub use persist::MANIFEST_FILE;

use crate::db::MIN_LEVEL;
use crate::error::StrataError;
use crate::ioutils::sync_dir;
use crate::manifest::persist::{read_manifest, write_manifest, ManifestRecord, MANIFEST_TEMP_FILE};
use crate::sstable::{parse_page_file_name, TEMP_PAGE_EXTENSION};
use crate::Result;
use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Immutable state of the manifest at one point in time.
pub struct Version {
    levels: Vec<Vec<Arc<PageHandle>>>,
    versions: Vec<u64>,
    flushed_generation: Option<u64>,
}

impl Version {
    fn to_record(&self) -> ManifestRecord {
        ManifestRecord {
            versions: self.versions.clone(),
            flushed_generation: self.flushed_generation,
            pages: self
                .levels
                .iter()
                .flatten()
                .map(|page| page.descriptor().clone())
                .collect(),
        }
    }

    fn sort_and_check(&mut self) -> Result<()> {
        for (level, pages) in self.levels.iter_mut().enumerate() {
            if level == 0 {
                pages.sort_by(|a, b| b.version.cmp(&a.version));
                continue;
            }
            pages.sort_by(|a, b| a.first_key.cmp(&b.first_key));
            if let Some(w) = pages.windows(2).find(|w| w[0].last_key >= w[1].first_key) {
                return Err(StrataError::Corruption(format!(
                    "pages {}-{} and {}-{} overlap",
                    level, w[0].version, level, w[1].version
                )));
            }
        }
        Ok(())
    }
}

/// Read-only view of the pages at the time it was taken.
#[derive(Clone)]
pub struct ManifestSnapshot {
    root: Arc<PathBuf>,
    version: Arc<Version>,
}

impl ManifestSnapshot {
    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn num_levels(&self) -> usize {
        self.version.levels.len()
    }

    /// Pages of `level`; level 0 is ordered newest first, other levels by key.
    pub fn pages_at_level(&self, level: usize) -> &[Arc<PageHandle>] {
        &self.version.levels[level]
    }

    /// Newest level 0 page whose range holds `key`, or the single candidate of a deeper level.
    pub fn find_page_for_key(&self, level: usize, key: &[u8]) -> Option<&Arc<PageHandle>> {
        let pages = self.pages_at_level(level);
        if level == 0 {
            return pages.iter().find(|page| page.contains(key));
        }
        let i = pages.partition_point(|page| page.first_key.as_slice() <= key);
        i.checked_sub(1)
            .map(|i| &pages[i])
            .filter(|page| key <= page.last_key.as_slice())
    }

    /// Pages of `level` whose range intersects [`min_key`, `max_key`].
    pub fn overlapping_pages(&self, level: usize, min_key: &[u8], max_key: &[u8]) -> Vec<Arc<PageHandle>> {
        self.pages_at_level(level)
            .iter()
            .filter(|page| page.is_overlapping(min_key, max_key))
            .cloned()
            .collect()
    }

    pub fn level_size(&self, level: usize) -> u64 {
        self.pages_at_level(level).iter().map(|page| page.size).sum()
    }

    #[inline]
    pub fn current_version(&self, level: usize) -> u64 {
        self.version.versions[level]
    }

    #[inline]
    pub fn flushed_generation(&self) -> Option<u64> {
        self.version.flushed_generation
    }
}

/// Pages to add and retire in one manifest transaction.
#[derive(Debug, Default)]
pub struct ManifestEdit {
    pub add: Vec<PageDescriptor>,
    /// (level, version) of retired pages.
    pub remove: Vec<(usize, u64)>,
    /// Journal generation whose memtable is now on disk.
    pub flushed_generation: Option<u64>,
}

pub struct Manifest {
    root: Arc<PathBuf>,
    current: ArcSwap<Version>,
    /// Serializes writers; readers only load `current`.
    write_lock: Mutex<()>,
    dir_valid: Arc<AtomicBool>,
    dir_sync: fn(&Path) -> Result<()>,
}

impl Manifest {
    /// Load the manifest under `root`, or create an empty one.
    ///
    /// Page files and temporary files the manifest does not reference are removed.
    pub fn open(root: &Path, num_levels: usize) -> Result<Manifest> {
        if num_levels < MIN_LEVEL {
            return Err(StrataError::Custom(format!(
                "a manifest needs at least {} levels, got {}",
                MIN_LEVEL, num_levels
            )));
        }
        std::fs::create_dir_all(root)?;
        let dir_valid = Arc::new(AtomicBool::new(true));
        let (record, fresh) = match read_manifest(root)? {
            Some(record) => (record, false),
            None => (
                ManifestRecord {
                    versions: vec![0; num_levels],
                    flushed_generation: None,
                    pages: vec![],
                },
                true,
            ),
        };

        let num_levels = num_levels.max(record.versions.len());
        let mut versions = record.versions;
        versions.resize(num_levels, 0);
        let mut levels = vec![vec![]; num_levels];
        for page in record.pages {
            if page.level >= num_levels || page.version > versions[page.level] {
                return Err(StrataError::Corruption(format!(
                    "invalid page {}-{} in manifest",
                    page.level, page.version
                )));
            }
            let level = page.level;
            levels[level].push(Arc::new(PageHandle::new(root, page, dir_valid.clone())));
        }
        let mut version = Version {
            levels,
            versions,
            flushed_generation: record.flushed_generation,
        };
        version.sort_and_check()?;

        if fresh {
            write_manifest(root, &version.to_record())?;
            sync_dir(root)?;
        }
        remove_orphans(root, &version)?;

        Ok(Manifest {
            root: Arc::new(root.to_path_buf()),
            current: ArcSwap::from_pointee(version),
            write_lock: Mutex::new(()),
            dir_valid,
            dir_sync: sync_dir,
        })
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn num_levels(&self) -> usize {
        self.current.load().levels.len()
    }

    /// The largest version handed out for `level`.
    pub fn current_version(&self, level: usize) -> u64 {
        self.current.load().versions[level]
    }

    /// Reserve a new version for `level`. The counter is on disk before this returns.
    pub fn next_version(&self, level: usize) -> Result<u64> {
        let _guard = self.write_lock.lock()?;
        let current = self.current.load_full();
        let mut versions = current.versions.clone();
        versions[level] += 1;
        let version = Version {
            levels: current.levels.clone(),
            versions,
            flushed_generation: current.flushed_generation,
        };
        let next = version.versions[level];
        self.commit(version)?;
        Ok(next)
    }

    pub fn snapshot(&self) -> ManifestSnapshot {
        ManifestSnapshot {
            root: self.root.clone(),
            version: self.current.load_full(),
        }
    }

    /// Add and retire pages atomically. Nothing changes unless the new manifest is durable.
    pub fn modify_pages(&self, edit: ManifestEdit) -> Result<()> {
        let _guard = self.write_lock.lock()?;
        let current = self.current.load_full();
        let mut levels = current.levels.clone();
        let mut removed = Vec::with_capacity(edit.remove.len());

        for (level, version) in edit.remove {
            let pages = levels.get_mut(level).ok_or_else(|| {
                StrataError::Custom(format!("level {} does not exist", level))
            })?;
            let i = pages
                .iter()
                .position(|page| page.version == version)
                .ok_or_else(|| {
                    StrataError::Custom(format!("page {}-{} is not live", level, version))
                })?;
            removed.push(pages.remove(i));
        }
        for page in edit.add {
            if page.level >= levels.len() || page.version > current.versions[page.level] {
                return Err(StrataError::Custom(format!(
                    "page {}-{} was never reserved",
                    page.level, page.version
                )));
            }
            let level = page.level;
            levels[level].push(Arc::new(PageHandle::new(
                &self.root,
                page,
                self.dir_valid.clone(),
            )));
        }

        let mut version = Version {
            levels,
            versions: current.versions.clone(),
            flushed_generation: edit
                .flushed_generation
                .max(current.flushed_generation),
        };
        version.sort_and_check()?;
        if self.commit(version)? {
            for page in removed {
                page.mark_obsolete();
            }
        } else {
            // the old manifest may still be the durable one
            warn!(
                "keep {} retired pages until the next open",
                removed.len()
            );
        }
        Ok(())
    }

    /// Replace MANIFEST with `version` and publish it.
    ///
    /// The rename is the commit point: an error before it leaves everything
    /// unchanged, while a failed directory sync after it is only logged. Returns
    /// whether the rename is known to be durable.
    fn commit(&self, version: Version) -> Result<bool> {
        write_manifest(&self.root, &version.to_record())?;
        self.current.store(Arc::new(version));
        match (self.dir_sync)(&self.root) {
            Ok(()) => Ok(true),
            Err(e) => {
                error!("manifest committed but syncing {:?} failed: {}", self.root, e);
                Ok(false)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_dir_sync(&mut self, dir_sync: fn(&Path) -> Result<()>) {
        self.dir_sync = dir_sync;
    }

    /// Stop retired pages from removing files. Used before the root directory is wiped.
    pub fn invalidate(&self) {
        self.dir_valid.store(false, Ordering::SeqCst);
    }
}

fn remove_orphans(root: &Path, version: &Version) -> Result<()> {
    let live: HashSet<(usize, u64)> = version
        .levels
        .iter()
        .flatten()
        .map(|page| (page.level, page.version))
        .collect();
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        let file_name = match path.file_name().and_then(|name| name.to_str()) {
            Some(name) => name,
            None => continue,
        };
        let orphan = file_name == MANIFEST_TEMP_FILE
            || path.extension().and_then(|e| e.to_str()) == Some(TEMP_PAGE_EXTENSION)
            || parse_page_file_name(file_name).map_or(false, |id| !live.contains(&id));
        if orphan {
            warn!("remove orphan file {:?}", path);
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}
