use crate::db::Key;
use crate::sstable::page_path;
use std::io::ErrorKind;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What the manifest records about one page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageDescriptor {
    pub level: usize,
    pub version: u64,
    /// File size in bytes.
    pub size: u64,
    pub first_key: Key,
    pub last_key: Key,
}

impl PageDescriptor {
    pub fn new(level: usize, version: u64, size: u64, first_key: Key, last_key: Key) -> PageDescriptor {
        debug_assert!(first_key <= last_key);
        PageDescriptor {
            level,
            version,
            size,
            first_key,
            last_key,
        }
    }

    #[inline]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.first_key.as_slice() <= key && key <= self.last_key.as_slice()
    }

    ///```text
    /// ----         ------      -----    ----
    ///   |---|       |--|     |---|    |------|
    ///```
    pub fn is_overlapping(&self, min_key: &[u8], max_key: &[u8]) -> bool {
        self.first_key.as_slice() <= max_key && min_key <= self.last_key.as_slice()
    }
}

/// A page referenced by a manifest version.
///
/// Once retired by a manifest edit the handle is marked obsolete, and the file is
/// removed when the last snapshot holding the handle goes away.
pub struct PageHandle {
    descriptor: PageDescriptor,
    path: PathBuf,
    obsolete: AtomicBool,
    /// Cleared when the store root is wiped, so stale handles never remove new files.
    dir_valid: Arc<AtomicBool>,
}

impl PageHandle {
    pub(crate) fn new(root: &std::path::Path, descriptor: PageDescriptor, dir_valid: Arc<AtomicBool>) -> PageHandle {
        PageHandle {
            path: page_path(root, descriptor.level, descriptor.version),
            descriptor,
            obsolete: AtomicBool::new(false),
            dir_valid,
        }
    }

    #[inline]
    pub fn descriptor(&self) -> &PageDescriptor {
        &self.descriptor
    }

    pub(crate) fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::SeqCst)
    }
}

impl Deref for PageHandle {
    type Target = PageDescriptor;

    fn deref(&self) -> &Self::Target {
        &self.descriptor
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        if self.is_obsolete() && self.dir_valid.load(Ordering::SeqCst) {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!("remove page {:?}", self.path),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => error!("failed to remove page {:?}: {}", self.path, e),
            }
        }
    }
}
