pub mod db_iter;
pub mod key_value_store;
pub mod options;

pub use key_value_store::KeyValueStore;

pub type Key = Vec<u8>;

/// A zero-length value is a tombstone.
pub type Value = Vec<u8>;

/// Memory table is full once its key+value bytes reach this size.
pub const MEMTABLE_SIZE_THRESHOLD: usize = 1024 * 1024;

pub const DATA_BLOCK_SIZE: usize = 4 * 1024;

pub const MAX_LEVEL: usize = 7;

/// Level 0 always compacts into level 1.
pub const MIN_LEVEL: usize = 2;

pub const LEVEL0_FILES_THRESHOLD: usize = 4;

/// Level `i` (i >= 1) holds at most `LEVEL_SIZE_BASE * 10^(i-1)` bytes.
pub const LEVEL_SIZE_BASE: u64 = 10 * 1024 * 1024;

pub const MAX_PAGE_SIZE: u64 = 2 * 1024 * 1024;

pub const BLOCK_CACHE_CAPACITY: usize = 32 * 1024 * 1024;

/// How many times `set` retries an insert that raced with a rotation.
pub const SET_RETRY_TIMES: usize = 10;

#[inline]
pub(crate) fn is_tombstone(value: &[u8]) -> bool {
    value.is_empty()
}
