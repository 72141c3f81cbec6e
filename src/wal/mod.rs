//! Write-ahead journal, one file per memory table generation.
//!
//! A journal is stored in a file named "<generation>.jf" under the store root.
//!
//! ## Record
//!
//! ```text
//! +---------------------------------------------------+
//! | crc32 | key length | value length | key | value   |
//! +---------------------------------------------------+
//! \------/\-----------/\-------------/\-----/\--------/
//!   u32        u32           u32      var-len var-len
//! ```
//!
//! The checksum covers everything after itself. A record that is short or
//! fails its checksum marks the torn tail of a crashed write; replay stops
//! there and the file is cut back to the last whole record.
//!
//! NOTE: All fixed-length integer are little-endian.

use crate::db::{Key, Value};
use crate::ioutils::{read_bytes_exact, read_u32, BufReaderWithPos, BufWriterWithPos};
use crate::Result;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const JOURNAL_EXTENSION: &str = "jf";
const RECORD_HEADER_SIZE: usize = 12;

pub struct Journal {
    writer: BufWriterWithPos<File>,
    sync: bool,
}

impl Journal {
    /// Open the journal of `generation` for appending, creating it if absent.
    pub fn create(root: &Path, generation: u64, sync: bool) -> Result<Journal> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(journal_path(root, generation))?;
        Ok(Journal {
            writer: BufWriterWithPos::new(file)?,
            sync,
        })
    }

    /// Replay the journal of `generation`, cut off a torn tail and reopen it for appending.
    pub fn recover(root: &Path, generation: u64, sync: bool) -> Result<(Journal, Vec<(Key, Value)>)> {
        let (records, valid_length) = Self::read_records(root, generation)?;
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(journal_path(root, generation))?;
            if file.metadata()?.len() > valid_length {
                warn!(
                    "truncate torn tail of journal {} at offset {}",
                    generation, valid_length
                );
                file.set_len(valid_length)?;
                file.sync_data()?;
            }
        }
        Ok((Self::create(root, generation, sync)?, records))
    }

    /// Read every whole record of the journal of `generation`, in append order.
    pub fn replay(root: &Path, generation: u64) -> Result<Vec<(Key, Value)>> {
        Ok(Self::read_records(root, generation)?.0)
    }

    fn read_records(root: &Path, generation: u64) -> Result<(Vec<(Key, Value)>, u64)> {
        let path = journal_path(root, generation);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok((vec![], 0)),
            Err(e) => return Err(e.into()),
        };
        let file_length = file.metadata()?.len();
        let mut reader = BufReaderWithPos::new(file)?;
        let mut records = vec![];
        let mut valid_length = 0;

        loop {
            match read_record(&mut reader, file_length) {
                Ok(Some((key, value))) => {
                    records.push((key, value));
                    valid_length = reader.pos();
                }
                Ok(None) => {
                    warn!(
                        "checksum mismatch in journal {} at offset {}",
                        generation, valid_length
                    );
                    break;
                }
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    if reader.pos() > valid_length {
                        warn!(
                            "journal {} ends with a partial record at offset {}",
                            generation, valid_length
                        );
                    }
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok((records, valid_length))
    }

    /// Append a key-value pair. The record reaches the OS before this returns.
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + key.len() + value.len());
        record.extend_from_slice(&[0u8; 4]);
        record.extend_from_slice(&(key.len() as u32).to_le_bytes());
        record.extend_from_slice(&(value.len() as u32).to_le_bytes());
        record.extend_from_slice(key);
        record.extend_from_slice(value);
        let crc = crc32fast::hash(&record[4..]);
        record[..4].copy_from_slice(&crc.to_le_bytes());

        self.writer.write_all(&record)?;
        if self.sync {
            self.writer.sync_data()?;
        } else {
            self.writer.flush()?;
        }
        Ok(())
    }

    /// Flush and sync what has been appended so far.
    pub fn close(&mut self) -> Result<()> {
        self.writer.sync_data()
    }

    pub fn remove(root: &Path, generation: u64) -> Result<()> {
        match std::fs::remove_file(journal_path(root, generation)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// `Ok(None)` means the record is complete but its checksum does not match.
///
/// A header whose lengths run past `file_length` is a torn tail and fails with
/// `UnexpectedEof` before anything is allocated.
fn read_record(
    reader: &mut BufReaderWithPos<File>,
    file_length: u64,
) -> std::io::Result<Option<(Key, Value)>> {
    let crc = read_u32(reader)?;
    let key_length = read_u32(reader)?;
    let value_length = read_u32(reader)?;
    let remaining = file_length.saturating_sub(reader.pos());
    if key_length as u64 + value_length as u64 > remaining {
        return Err(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            "record runs past the end of the journal",
        ));
    }
    let key = read_bytes_exact(reader, key_length as u64)?;
    let value = read_bytes_exact(reader, value_length as u64)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&key_length.to_le_bytes());
    hasher.update(&value_length.to_le_bytes());
    hasher.update(&key);
    hasher.update(&value);
    if hasher.finalize() != crc {
        return Ok(None);
    }
    Ok(Some((key, value)))
}

pub fn journal_path(root: &Path, generation: u64) -> PathBuf {
    root.join(format!("{}.{}", generation, JOURNAL_EXTENSION))
}

/// Generations of all the journal files under `root`, in increasing order.
pub fn list_generations(root: &Path) -> Result<Vec<u64>> {
    let mut generations = vec![];
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(JOURNAL_EXTENSION) {
            continue;
        }
        if let Some(generation) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            generations.push(generation);
        }
    }
    generations.sort_unstable();
    Ok(generations)
}

#[cfg(test)]
mod tests {
    use crate::wal::{journal_path, list_generations, Journal};
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_replay() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path();

        let mut journal = Journal::create(path, 3, false).unwrap();
        for i in 0..100 {
            journal
                .append(
                    format!("key{}", i).as_bytes(),
                    format!("value{}", i).as_bytes(),
                )
                .unwrap();
        }
        // tombstone and overwrite are plain records
        journal.append(b"key1", b"").unwrap();
        journal.append(b"key2", b"again").unwrap();
        journal.close().unwrap();

        let records = Journal::replay(path, 3).unwrap();
        assert_eq!(records.len(), 102);
        assert_eq!(records[0], (b"key0".to_vec(), b"value0".to_vec()));
        assert_eq!(records[100], (b"key1".to_vec(), vec![]));
        assert_eq!(records[101], (b"key2".to_vec(), b"again".to_vec()));

        assert_eq!(list_generations(path).unwrap(), vec![3]);
        assert!(Journal::replay(path, 4).unwrap().is_empty());
    }

    #[test]
    fn test_torn_tail() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path();
        {
            let mut journal = Journal::create(path, 0, true).unwrap();
            journal.append(b"a", b"1").unwrap();
            journal.append(b"b", b"2").unwrap();
        }
        {
            // half of a record
            let mut file = OpenOptions::new()
                .append(true)
                .open(journal_path(path, 0))
                .unwrap();
            file.write_all(&[1, 2, 3, 4, 5, 0, 0]).unwrap();
        }
        assert_eq!(Journal::replay(path, 0).unwrap().len(), 2);

        let (mut journal, records) = Journal::recover(path, 0, false).unwrap();
        assert_eq!(records.len(), 2);
        journal.append(b"c", b"3").unwrap();
        drop(journal);

        let records = Journal::replay(path, 0).unwrap();
        assert_eq!(
            records,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec())
            ]
        );
    }

    #[test]
    fn test_oversized_header_is_torn_tail() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path();
        {
            let mut journal = Journal::create(path, 1, false).unwrap();
            journal.append(b"a", b"1").unwrap();
        }
        {
            // a header claiming 4 GiB of key and value
            let mut file = OpenOptions::new()
                .append(true)
                .open(journal_path(path, 1))
                .unwrap();
            file.write_all(&0u32.to_le_bytes()).unwrap();
            file.write_all(&u32::MAX.to_le_bytes()).unwrap();
            file.write_all(&u32::MAX.to_le_bytes()).unwrap();
            file.write_all(b"xy").unwrap();
        }
        let valid_length = std::fs::metadata(journal_path(path, 1)).unwrap().len() - 14;

        let (journal, records) = Journal::recover(path, 1, false).unwrap();
        drop(journal);
        assert_eq!(records, vec![(b"a".to_vec(), b"1".to_vec())]);
        assert_eq!(
            std::fs::metadata(journal_path(path, 1)).unwrap().len(),
            valid_length
        );
    }

    #[test]
    fn test_checksum_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path();
        {
            let mut journal = Journal::create(path, 9, false).unwrap();
            journal.append(b"a", b"1").unwrap();
            journal.append(b"b", b"2").unwrap();
        }
        let file_path = journal_path(path, 9);
        let mut bytes = std::fs::read(&file_path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&file_path, bytes).unwrap();

        let records = Journal::replay(path, 9).unwrap();
        assert_eq!(records, vec![(b"a".to_vec(), b"1".to_vec())]);

        Journal::remove(path, 9).unwrap();
        assert!(list_generations(path).unwrap().is_empty());
    }
}
