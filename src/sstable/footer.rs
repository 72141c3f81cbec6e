use crate::error::StrataError;
use crate::Result;
use std::io::{Read, Seek, SeekFrom, Write};

pub const FOOTER_MAGIC_NUMBER: u32 = 0xdb991122;
pub const FOOTER_BYTE_SIZE: u64 = 16;

#[derive(Debug, PartialEq)]
pub(crate) struct Footer {
    pub index_block_offset: u32,
    pub index_block_length: u32,
    pub kv_total: u32,
}

impl Footer {
    pub(crate) fn write_to_file(&self, writer: &mut impl Write) -> Result<()> {
        writer.write_all(&self.index_block_offset.to_le_bytes())?;
        writer.write_all(&self.index_block_length.to_le_bytes())?;
        writer.write_all(&self.kv_total.to_le_bytes())?;
        writer.write_all(&FOOTER_MAGIC_NUMBER.to_le_bytes())?;
        Ok(())
    }

    pub(crate) fn load_footer(reader: &mut (impl Read + Seek)) -> Result<Footer> {
        let file_size = reader.seek(SeekFrom::End(0))?;
        if file_size < FOOTER_BYTE_SIZE {
            return Err(StrataError::Corruption("page smaller than footer".into()));
        }
        reader.seek(SeekFrom::Start(file_size - FOOTER_BYTE_SIZE))?;

        let mut buf = [0u8; FOOTER_BYTE_SIZE as usize];
        reader.read_exact(&mut buf)?;
        let field = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);

        // validate magic number
        if field(12) != FOOTER_MAGIC_NUMBER {
            return Err(StrataError::Corruption("invalid footer magic number".into()));
        }
        let footer = Footer {
            index_block_offset: field(0),
            index_block_length: field(4),
            kv_total: field(8),
        };
        // finished pages are never empty
        if footer.kv_total == 0 {
            return Err(StrataError::Corruption("page footer counts no entries".into()));
        }
        if footer.index_block_offset as u64 + footer.index_block_length as u64
            > file_size - FOOTER_BYTE_SIZE
        {
            return Err(StrataError::Corruption("index block out of range".into()));
        }
        Ok(footer)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::StrataError;
    use crate::sstable::footer::Footer;
    use std::io::Cursor;

    #[test]
    fn test_footer() {
        let footer = Footer {
            index_block_offset: 4,
            index_block_length: 10,
            kv_total: 3,
        };
        let mut buf = vec![0u8; 14];
        footer.write_to_file(&mut buf).unwrap();
        assert_eq!(buf.len(), 30);
        assert_eq!(Footer::load_footer(&mut Cursor::new(&buf)).unwrap(), footer);

        let last = buf.len() - 1;
        buf[last] = 0;
        assert!(Footer::load_footer(&mut Cursor::new(&buf)).is_err());
        assert!(Footer::load_footer(&mut Cursor::new(vec![0u8; 3])).is_err());

        let mut empty = vec![0u8; 14];
        Footer {
            index_block_offset: 4,
            index_block_length: 10,
            kv_total: 0,
        }
        .write_to_file(&mut empty)
        .unwrap();
        assert!(matches!(
            Footer::load_footer(&mut Cursor::new(&empty)),
            Err(StrataError::Corruption(_))
        ));
    }
}
