use crate::db::Key;
use crate::error::StrataError;
use crate::ioutils::{sync_dir, BufWriterWithPos};
use crate::manifest::PageDescriptor;
use crate::sstable::data_block::DataBlockBuilder;
use crate::sstable::footer::Footer;
use crate::sstable::index_block::IndexBlock;
use crate::sstable::{page_path, temp_page_path};
use crate::Result;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Handle of new page for single-thread writing.
///
/// Keys must be added in strictly increasing order. The page becomes visible under
/// its final name only in [TableWriteHandle::finish]; a handle dropped before that
/// removes its temporary file.
pub struct TableWriteHandle {
    root: PathBuf,
    level: usize,
    version: u64,
    block_size: usize,
    writer: BufWriterWithPos<File>,
    data_block: DataBlockBuilder,
    block_first_key: Key,
    index_block: IndexBlock,
    first_key: Option<Key>,
    last_key: Key,
    kv_total: u32,
    finished: bool,
}

impl TableWriteHandle {
    pub fn new(root: &Path, level: usize, version: u64, block_size: usize) -> Result<TableWriteHandle> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp_page_path(root, level, version))?;
        Ok(TableWriteHandle {
            root: root.to_path_buf(),
            level,
            version,
            block_size,
            writer: BufWriterWithPos::new(file)?,
            data_block: DataBlockBuilder::default(),
            block_first_key: Key::new(),
            index_block: IndexBlock::default(),
            first_key: None,
            last_key: Key::new(),
            kv_total: 0,
            finished: false,
        })
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.first_key.is_some() && key <= self.last_key.as_slice() {
            return Err(StrataError::Custom(format!(
                "page {}-{}: keys are not strictly increasing",
                self.level, self.version
            )));
        }
        if self.first_key.is_none() {
            self.first_key = Some(key.to_vec());
        }
        if self.data_block.is_empty() {
            self.block_first_key = key.to_vec();
        }
        self.data_block.add(key, value);
        self.last_key = key.to_vec();
        self.kv_total += 1;

        if self.data_block.len() >= self.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    fn flush_data_block(&mut self) -> Result<()> {
        let offset = self.writer.pos as u32;
        let data = self.data_block.finish();
        self.writer.write_all(&data)?;
        self.index_block.add_index(
            offset,
            data.len() as u32,
            std::mem::take(&mut self.block_first_key),
        );
        Ok(())
    }

    /// Bytes the page would take if it were finished now, without index and footer.
    #[inline]
    pub fn approximate_size(&self) -> u64 {
        self.writer.pos + self.data_block.len() as u64
    }

    /// Write index block and footer, sync the file and rename it to its final name.
    pub fn finish(mut self) -> Result<PageDescriptor> {
        let first_key = match self.first_key.take() {
            Some(key) => key,
            None => {
                return Err(StrataError::Custom(format!(
                    "page {}-{} is empty",
                    self.level, self.version
                )))
            }
        };
        if !self.data_block.is_empty() {
            self.flush_data_block()?;
        }

        let index_block_offset = self.writer.pos as u32;
        self.writer.write_all(&self.index_block.encode())?;
        let footer = Footer {
            index_block_offset,
            index_block_length: self.writer.pos as u32 - index_block_offset,
            kv_total: self.kv_total,
        };
        footer.write_to_file(&mut self.writer)?;
        self.writer.sync_data()?;

        let path = page_path(&self.root, self.level, self.version);
        std::fs::rename(temp_page_path(&self.root, self.level, self.version), &path)?;
        sync_dir(&self.root)?;
        self.finished = true;

        debug!(
            "page {:?} written: {} entries, {} bytes",
            path, self.kv_total, self.writer.pos
        );
        Ok(PageDescriptor::new(
            self.level,
            self.version,
            self.writer.pos,
            first_key,
            std::mem::take(&mut self.last_key),
        ))
    }
}

impl Drop for TableWriteHandle {
    fn drop(&mut self) {
        if !self.finished {
            let path = temp_page_path(&self.root, self.level, self.version);
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("failed to remove unfinished page {:?}: {}", path, e);
            }
        }
    }
}
