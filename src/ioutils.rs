use crate::Result;
use std::fs::File;
use std::io;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Buffered reader that remembers its absolute position in the file.
pub struct BufReaderWithPos<R: Read + Seek> {
    reader: BufReader<R>,
    pos: u64,
}

impl<R: Read + Seek> BufReaderWithPos<R> {
    pub(crate) fn new(mut inner: R) -> Result<Self> {
        let pos = inner.seek(SeekFrom::Current(0))?;
        Ok(BufReaderWithPos {
            reader: BufReader::new(inner),
            pos,
        })
    }

    #[inline]
    pub fn pos(&self) -> u64 {
        self.pos
    }
}

impl<R: Read + Seek> Read for BufReaderWithPos<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.reader.read(buf)?;
        self.pos += len as u64;
        Ok(len)
    }
}

impl<R: Read + Seek> Seek for BufReaderWithPos<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = self.reader.seek(pos)?;
        Ok(self.pos)
    }
}

/// Buffered writer that tracks how many bytes have been written so far.
pub struct BufWriterWithPos<W: Write + Seek> {
    writer: BufWriter<W>,
    pub pos: u64,
}

impl<W: Write + Seek> BufWriterWithPos<W> {
    pub fn new(mut inner: W) -> Result<Self> {
        let pos = inner.seek(SeekFrom::End(0))?;
        Ok(BufWriterWithPos {
            writer: BufWriter::new(inner),
            pos,
        })
    }

    pub fn get_ref(&self) -> &W {
        self.writer.get_ref()
    }
}

impl BufWriterWithPos<File> {
    /// Flush buffered bytes and force them to the disk.
    pub fn sync_data(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

impl<W: Write + Seek> Write for BufWriterWithPos<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.writer.write(buf)?;
        self.pos += len as u64;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl<W: Write + Seek> Seek for BufWriterWithPos<W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = self.writer.seek(pos)?;
        Ok(self.pos)
    }
}

pub fn read_u32(reader: &mut impl Read) -> io::Result<u32> {
    let mut nums = [0u8; 4];
    reader.read_exact(&mut nums)?;
    Ok(u32::from_le_bytes(nums))
}

pub fn read_bytes_exact(reader: &mut impl Read, length: u64) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; length as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Decode a little-endian u32 at `offset` of an in-memory block.
#[inline]
pub fn decode_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Make a rename or file creation inside `dir` durable.
pub fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::ioutils::{decode_u32, read_bytes_exact, read_u32, BufReaderWithPos, BufWriterWithPos};
    use std::io::{Cursor, Write};

    #[test]
    fn test_positions() {
        let mut writer = BufWriterWithPos::new(Cursor::new(Vec::new())).unwrap();
        writer.write_all(&7u32.to_le_bytes()).unwrap();
        writer.write_all(b"abc").unwrap();
        assert_eq!(writer.pos, 7);
        writer.flush().unwrap();

        let bytes = writer.get_ref().get_ref().clone();
        assert_eq!(decode_u32(&bytes, 0), Some(7));
        assert_eq!(decode_u32(&bytes, 4), None);

        let mut reader = BufReaderWithPos::new(Cursor::new(bytes)).unwrap();
        assert_eq!(read_u32(&mut reader).unwrap(), 7);
        assert_eq!(read_bytes_exact(&mut reader, 3).unwrap(), b"abc".to_vec());
        assert_eq!(reader.pos(), 7);
        assert!(read_u32(&mut reader).is_err());
    }
}
