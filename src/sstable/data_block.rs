use crate::db::{Key, Value};
use crate::error::StrataError;
use crate::ioutils::decode_u32;
use crate::Result;
use std::cmp::Ordering;

/// Accumulates sorted entries of one data block.
#[derive(Default)]
pub struct DataBlockBuilder {
    data: Vec<u8>,
    record_offsets: Vec<u32>,
}

impl DataBlockBuilder {
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        self.record_offsets.push(self.data.len() as u32);
        self.data
            .extend_from_slice(&(key.len() as u32).to_le_bytes());
        self.data
            .extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.data.extend_from_slice(key);
        self.data.extend_from_slice(value);
    }

    /// Size of the entries added so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.record_offsets.is_empty()
    }

    /// Append the record offsets and count, and return the encoded block.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut data = std::mem::take(&mut self.data);
        data.reserve(self.record_offsets.len() * 4 + 4);
        for offset in &self.record_offsets {
            data.extend_from_slice(&offset.to_le_bytes());
        }
        data.extend_from_slice(&(self.record_offsets.len() as u32).to_le_bytes());
        self.record_offsets.clear();

        #[cfg(feature = "snappy_compression")]
        {
            let before_length = data.len();
            data = snap::raw::Encoder::new()
                .compress_vec(&data)
                .unwrap_or_else(|e| unreachable!("snappy compress: {}", e));
            debug!("snappy before: {}, after: {}", before_length, data.len());
        }
        data
    }
}

/// Decoded data block supporting binary search by key.
pub struct DataBlock {
    data: Vec<u8>,
    offsets_start: usize,
    count: usize,
}

impl DataBlock {
    pub fn decode(raw: Vec<u8>) -> Result<DataBlock> {
        #[cfg(feature = "snappy_compression")]
        let raw = snap::raw::Decoder::new()
            .decompress_vec(&raw)
            .map_err(|e| StrataError::Corruption(format!("snappy: {}", e)))?;

        let length = raw.len();
        let count = length
            .checked_sub(4)
            .and_then(|at| decode_u32(&raw, at))
            .ok_or_else(|| StrataError::Corruption("data block too short".into()))?
            as usize;
        let offsets_start = (length - 4)
            .checked_sub(count * 4)
            .ok_or_else(|| StrataError::Corruption("invalid data block entry count".into()))?;
        Ok(DataBlock {
            data: raw,
            offsets_start,
            count,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn charge(&self) -> usize {
        self.data.len()
    }

    /// Key and value of the `i`th entry.
    pub fn entry(&self, i: usize) -> Result<(&[u8], &[u8])> {
        let corrupted = || StrataError::Corruption(format!("invalid data block entry {}", i));
        if i >= self.count {
            return Err(corrupted());
        }
        let offset = decode_u32(&self.data, self.offsets_start + i * 4).ok_or_else(corrupted)?
            as usize;
        let key_length = decode_u32(&self.data, offset).ok_or_else(corrupted)? as usize;
        let value_length = decode_u32(&self.data, offset + 4).ok_or_else(corrupted)? as usize;
        let key_start = offset + 8;
        let value_start = key_start + key_length;
        let value_end = value_start + value_length;
        if value_end > self.offsets_start {
            return Err(corrupted());
        }
        Ok((
            &self.data[key_start..value_start],
            &self.data[value_start..value_end],
        ))
    }

    /// Index of the first entry whose key is greater or equal to `key`.
    pub fn seek(&self, key: &[u8]) -> Result<usize> {
        let (mut low, mut high) = (0, self.count);
        while low < high {
            let mid = low + (high - low) / 2;
            if self.entry(mid)?.0 < key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        Ok(low)
    }

    pub fn get_value(&self, key: &[u8]) -> Result<Option<Value>> {
        let i = self.seek(key)?;
        if i < self.count {
            let (k, v) = self.entry(i)?;
            if k.cmp(key) == Ordering::Equal {
                return Ok(Some(v.to_vec()));
            }
        }
        Ok(None)
    }

    pub fn owned_entry(&self, i: usize) -> Result<(Key, Value)> {
        let (k, v) = self.entry(i)?;
        Ok((k.to_vec(), v.to_vec()))
    }
}
