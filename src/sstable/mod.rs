//! Sorted Block Table (page), which is stored in disk.
//!
//! # Page
//!
//! A page is identified by (level, version) and stored in a file named "<level>-<version>.sbt"
//! under the store root. It is written once to "<level>-<version>.sbt_write" and renamed
//! after it has been synced, so a file with the final name is always complete.
//!
//! ```text
//! +-------------------------+ (offset 0)
//! | Data Block 1            |<-+
//! +-------------------------+  |
//! | Data Block 2            |<-+
//! +-------------------------+  |
//! | ...                     |  |
//! +-------------------------+  |
//! | Data Block n            |<-+
//! +-------------------------+  |
//! | Index Block             |--+
//! +-------------------------+
//! | Footer                  |
//! +-------------------------+
//! ```
//!
//! ## Key/Value Entry
//!
//! ```text
//! +-----------------------------------------+
//! | key length | value length | key | value |
//! +-----------------------------------------+
//! \-----------/\-------------/\-----/\------/
//!      u32           u32      var-len var-len
//! ```
//!
//! ## Data Block
//!
//! ```text
//! +-------------------------------------------------------------------------------+
//! | Entry 1 | Entry 2 | ... | Entry n | offset 1 | ... | offset n | n (u32)       |
//! +-------------------------------------------------------------------------------+
//! ```
//!
//! Offsets are relative to the start of the block and allow binary search inside it.
//! With feature `snappy_compression` the whole block is compressed.
//!
//! ## Index Block
//!
//! ```text
//! +--------------------------------------------------+
//! | offset | length | first key1 length | first key1 | -> Data Block1
//! +--------------------------------------------------+
//! | offset | length | first key2 length | first key2 | -> Data Block2
//! +--------------------------------------------------+
//! |                       ...                        |
//! +--------------------------------------------------+
//! \-------/\-------/\------------------/\------------/
//!    u32      u32            u32            var-len
//! ```
//!
//! ## Footer
//!
//! ```text
//! +------------------------------------------------------------------------------+
//! | Index Block Offset | Index Block Length | kv total | Magic Number 0xdb991122 |
//! +------------------------------------------------------------------------------+
//! \-------------------/\-------------------/\---------/\-------------------------/
//!          u32                  u32             u32                u32
//! ```
//!
//! NOTE: All fixed-length integer are little-endian.

use crate::error::StrataError;
use crate::sstable::data_block::DataBlock;
use crate::sstable::index_block::IndexBlock;
use crate::Result;
use std::path::{Path, PathBuf};

pub mod data_block;
pub(crate) mod footer;
pub mod index_block;
pub mod sorted_block_table;
pub mod table_handle;

pub use sorted_block_table::{SortedBlockTable, TableIterator};
pub use table_handle::TableWriteHandle;

pub const PAGE_EXTENSION: &str = "sbt";
pub const TEMP_PAGE_EXTENSION: &str = "sbt_write";

/// Block id of the index block inside the cache; data blocks use their file offset.
pub const INDEX_BLOCK_ID: u64 = u64::MAX;

/// A decoded block, as stored in the block cache.
pub enum Block {
    Index(IndexBlock),
    Data(DataBlock),
}

impl Block {
    /// Bytes charged against the cache capacity.
    pub fn charge(&self) -> usize {
        match self {
            Block::Index(index) => index.charge(),
            Block::Data(data) => data.charge(),
        }
    }

    pub(crate) fn as_index(&self) -> Result<&IndexBlock> {
        match self {
            Block::Index(index) => Ok(index),
            Block::Data(_) => Err(StrataError::Corruption("expect an index block".into())),
        }
    }

    pub(crate) fn as_data(&self) -> Result<&DataBlock> {
        match self {
            Block::Data(data) => Ok(data),
            Block::Index(_) => Err(StrataError::Corruption("expect a data block".into())),
        }
    }
}

pub fn page_path(root: &Path, level: usize, version: u64) -> PathBuf {
    root.join(format!("{}-{}.{}", level, version, PAGE_EXTENSION))
}

pub(crate) fn temp_page_path(root: &Path, level: usize, version: u64) -> PathBuf {
    root.join(format!("{}-{}.{}", level, version, TEMP_PAGE_EXTENSION))
}

/// Parse "<level>-<version>" out of a page file name.
pub fn parse_page_file_name(file_name: &str) -> Option<(usize, u64)> {
    let stem = file_name
        .strip_suffix(PAGE_EXTENSION)?
        .strip_suffix('.')?;
    let mut parts = stem.splitn(2, '-');
    let level = parts.next()?.parse().ok()?;
    let version = parts.next()?.parse().ok()?;
    Some((level, version))
}
