use crate::db::Key;
use crate::error::StrataError;
use crate::ioutils::decode_u32;
use crate::Result;

/// Location of one data block and the smallest key stored in it.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockHandle {
    pub offset: u32,
    pub length: u32,
    pub first_key: Key,
}

#[derive(Default, Debug)]
pub struct IndexBlock {
    handles: Vec<BlockHandle>,
}

impl IndexBlock {
    pub(crate) fn add_index(&mut self, offset: u32, length: u32, first_key: Key) {
        debug_assert!(self
            .handles
            .last()
            .map_or(true, |last| last.first_key < first_key));
        self.handles.push(BlockHandle {
            offset,
            length,
            first_key,
        });
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.charge());
        for handle in &self.handles {
            buf.extend_from_slice(&handle.offset.to_le_bytes());
            buf.extend_from_slice(&handle.length.to_le_bytes());
            buf.extend_from_slice(&(handle.first_key.len() as u32).to_le_bytes());
            buf.extend_from_slice(&handle.first_key);
        }
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<IndexBlock> {
        let corrupted = || StrataError::Corruption("invalid index block".into());
        let mut index_block = IndexBlock::default();
        let mut offset = 0;
        while offset < buf.len() {
            let block_offset = decode_u32(buf, offset).ok_or_else(corrupted)?;
            let block_length = decode_u32(buf, offset + 4).ok_or_else(corrupted)?;
            let key_length = decode_u32(buf, offset + 8).ok_or_else(corrupted)? as usize;
            let key_start = offset + 12;
            let first_key = buf
                .get(key_start..key_start + key_length)
                .ok_or_else(corrupted)?
                .to_vec();
            index_block.handles.push(BlockHandle {
                offset: block_offset,
                length: block_length,
                first_key,
            });
            offset = key_start + key_length;
        }
        Ok(index_block)
    }

    /// The only block that may contain `key`: the last one whose first key is `<= key`.
    pub fn find_block(&self, key: &[u8]) -> Option<&BlockHandle> {
        let i = self
            .handles
            .partition_point(|handle| handle.first_key.as_slice() <= key);
        i.checked_sub(1).map(|i| &self.handles[i])
    }

    /// Index of the block where a scan starting at `key` begins.
    pub fn seek_block(&self, key: &[u8]) -> usize {
        self.handles
            .partition_point(|handle| handle.first_key.as_slice() <= key)
            .saturating_sub(1)
    }

    #[inline]
    pub fn handle(&self, i: usize) -> Option<&BlockHandle> {
        self.handles.get(i)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn charge(&self) -> usize {
        self.handles
            .iter()
            .map(|handle| 12 + handle.first_key.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use crate::sstable::index_block::IndexBlock;

    fn sample() -> IndexBlock {
        let mut index = IndexBlock::default();
        index.add_index(0, 100, "key100".into());
        index.add_index(100, 80, "key200".into());
        index.add_index(180, 90, "key298".into());
        index
    }

    #[test]
    fn test_find_block() {
        let index = sample();
        assert!(index.find_block(b"key099").is_none());
        assert_eq!(index.find_block(b"key100").unwrap().offset, 0);
        assert_eq!(index.find_block(b"key199").unwrap().offset, 0);
        assert_eq!(index.find_block(b"key200").unwrap().offset, 100);
        assert_eq!(index.find_block(b"key299").unwrap().offset, 180);

        assert_eq!(index.seek_block(b"a"), 0);
        assert_eq!(index.seek_block(b"key250"), 1);
        assert_eq!(index.seek_block(b"z"), 2);
    }

    #[test]
    fn test_encode_decode() {
        let index = sample();
        let bytes = index.encode();
        assert_eq!(bytes.len(), index.charge());
        let decoded = IndexBlock::decode(&bytes).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded.handle(2), index.handle(2));

        assert!(IndexBlock::decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
