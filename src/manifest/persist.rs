//! On-disk form of the manifest.
//!
//! ```text
//! +-------+------------+--------------------------+-------------------+-------+-------+-------+
//! | magic | num levels | version counter * levels | flushed (u8, u64) | pages | page* | crc32 |
//! +-------+------------+--------------------------+-------------------+-------+-------+-------+
//!    u32       u32                u64                                   u32
//! ```
//!
//! page: level u32 | version u64 | size u64 | first key len u32 | first key | last key len u32 | last key
//!
//! The checksum covers everything before it. The file is always replaced as a whole.

use crate::error::StrataError;
use crate::ioutils::decode_u32;
use crate::manifest::PageDescriptor;
use crate::Result;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "MANIFEST";
pub(crate) const MANIFEST_TEMP_FILE: &str = "MANIFEST_write";

const MANIFEST_MAGIC: u32 = 0x5354_524d;

#[derive(Debug, PartialEq)]
pub(crate) struct ManifestRecord {
    pub versions: Vec<u64>,
    pub flushed_generation: Option<u64>,
    pub pages: Vec<PageDescriptor>,
}

pub(crate) fn manifest_path(root: &Path) -> PathBuf {
    root.join(MANIFEST_FILE)
}

pub(crate) fn encode(record: &ManifestRecord) -> Vec<u8> {
    let mut buf = vec![];
    buf.extend_from_slice(&MANIFEST_MAGIC.to_le_bytes());
    buf.extend_from_slice(&(record.versions.len() as u32).to_le_bytes());
    for version in &record.versions {
        buf.extend_from_slice(&version.to_le_bytes());
    }
    match record.flushed_generation {
        Some(generation) => {
            buf.push(1);
            buf.extend_from_slice(&generation.to_le_bytes());
        }
        None => {
            buf.push(0);
            buf.extend_from_slice(&0u64.to_le_bytes());
        }
    }
    buf.extend_from_slice(&(record.pages.len() as u32).to_le_bytes());
    for page in &record.pages {
        buf.extend_from_slice(&(page.level as u32).to_le_bytes());
        buf.extend_from_slice(&page.version.to_le_bytes());
        buf.extend_from_slice(&page.size.to_le_bytes());
        buf.extend_from_slice(&(page.first_key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&page.first_key);
        buf.extend_from_slice(&(page.last_key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&page.last_key);
    }
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

struct Decoder<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Decoder<'a> {
    fn bytes(&mut self, length: usize) -> Result<&'a [u8]> {
        let bytes = self
            .buf
            .get(self.offset..self.offset + length)
            .ok_or_else(|| StrataError::Corruption("manifest is truncated".into()))?;
        self.offset += length;
        Ok(bytes)
    }

    fn u32(&mut self) -> Result<u32> {
        let value = decode_u32(self.bytes(4)?, 0)
            .ok_or_else(|| StrataError::Corruption("manifest is truncated".into()))?;
        Ok(value)
    }

    fn u64(&mut self) -> Result<u64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(bytes))
    }

    fn key(&mut self) -> Result<Vec<u8>> {
        let length = self.u32()? as usize;
        Ok(self.bytes(length)?.to_vec())
    }
}

pub(crate) fn decode(buf: &[u8]) -> Result<ManifestRecord> {
    if buf.len() < 4 {
        return Err(StrataError::Corruption("manifest is truncated".into()));
    }
    let (body, crc) = buf.split_at(buf.len() - 4);
    if decode_u32(crc, 0) != Some(crc32fast::hash(body)) {
        return Err(StrataError::Corruption("manifest checksum mismatch".into()));
    }

    let mut decoder = Decoder {
        buf: body,
        offset: 0,
    };
    if decoder.u32()? != MANIFEST_MAGIC {
        return Err(StrataError::Corruption("invalid manifest magic number".into()));
    }
    let num_levels = decoder.u32()? as usize;
    let versions = (0..num_levels)
        .map(|_| decoder.u64())
        .collect::<Result<Vec<_>>>()?;
    let has_flushed = decoder.bytes(1)?[0] == 1;
    let flushed = decoder.u64()?;
    let page_count = decoder.u32()?;
    let mut pages = Vec::with_capacity(page_count as usize);
    for _ in 0..page_count {
        let level = decoder.u32()? as usize;
        let version = decoder.u64()?;
        let size = decoder.u64()?;
        let first_key = decoder.key()?;
        let last_key = decoder.key()?;
        pages.push(PageDescriptor {
            level,
            version,
            size,
            first_key,
            last_key,
        });
    }
    if decoder.offset != body.len() {
        return Err(StrataError::Corruption("trailing bytes in manifest".into()));
    }
    Ok(ManifestRecord {
        versions,
        flushed_generation: if has_flushed { Some(flushed) } else { None },
        pages,
    })
}

/// Replace the manifest file: write a temporary file, sync it and rename it.
///
/// The caller syncs `root` to make the rename durable.
pub(crate) fn write_manifest(root: &Path, record: &ManifestRecord) -> Result<()> {
    let temp_path = root.join(MANIFEST_TEMP_FILE);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(&encode(record))?;
        file.sync_all()?;
    }
    std::fs::rename(&temp_path, manifest_path(root))?;
    Ok(())
}

pub(crate) fn read_manifest(root: &Path) -> Result<Option<ManifestRecord>> {
    match std::fs::read(manifest_path(root)) {
        Ok(buf) => decode(&buf).map(Some),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
