//! Directory records (`struct direct`).
//!
//! A record is an 8-byte header followed by the name and a NUL, padded to
//! 4 bytes. `reclen` may exceed the minimum; the slack belongs to the record
//! and is where new entries get carved out. Records never cross a
//! `DIRBLKSIZ` boundary.

use ufs_types::{
    FileType, InodeNumber, MAXNAMLEN, ParseError, read_le_u16, read_le_u32, write_le_u16,
    write_le_u32,
};

/// Size of the fixed record header.
pub const DIRENT_HEADER_LEN: usize = 8;

/// Smallest record that can hold a name of `namelen` bytes (`DIRSIZ`).
#[must_use]
pub const fn dir_rec_len(namelen: usize) -> usize {
    (DIRENT_HEADER_LEN + namelen + 1 + 3) & !3
}

/// Fixed part of a directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirentHeader {
    pub ino: u32,
    pub reclen: u16,
    pub d_type: u8,
    pub namlen: u8,
}

impl DirentHeader {
    /// Decode the header at `offset`. Only the header is range checked;
    /// callers validate `reclen` against their chunk.
    pub fn parse(block: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            ino: read_le_u32(block, offset)?,
            reclen: read_le_u16(block, offset + 4)?,
            d_type: *block.get(offset + 6).ok_or(ParseError::InsufficientData {
                needed: DIRENT_HEADER_LEN,
                offset,
                actual: block.len().saturating_sub(offset),
            })?,
            namlen: *block.get(offset + 7).ok_or(ParseError::InsufficientData {
                needed: DIRENT_HEADER_LEN,
                offset,
                actual: block.len().saturating_sub(offset),
            })?,
        })
    }

    pub fn write(&self, block: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_le_u32(block, offset, self.ino)?;
        write_le_u16(block, offset + 4, self.reclen)?;
        if block.len() < offset + DIRENT_HEADER_LEN {
            return Err(ParseError::InsufficientData {
                needed: DIRENT_HEADER_LEN,
                offset,
                actual: block.len().saturating_sub(offset),
            });
        }
        block[offset + 6] = self.d_type;
        block[offset + 7] = self.namlen;
        Ok(())
    }

    /// An unused record still owns its space but holds no name.
    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.ino == 0
    }

    #[must_use]
    pub fn inode(&self) -> InodeNumber {
        InodeNumber(u64::from(self.ino))
    }

    #[must_use]
    pub fn file_type(&self) -> FileType {
        FileType::from_raw(self.d_type)
    }

    /// Bytes this record actually needs; anything above is slack.
    #[must_use]
    pub fn used_len(&self) -> usize {
        dir_rec_len(usize::from(self.namlen))
    }
}

/// Write a complete record (header, name, NUL, zero padding) at `offset`
/// with the given `reclen`.
pub fn write_record(
    block: &mut [u8],
    offset: usize,
    ino: u32,
    file_type: FileType,
    name: &[u8],
    reclen: u16,
) -> Result<(), ParseError> {
    if name.len() > MAXNAMLEN {
        return Err(ParseError::InvalidField {
            field: "d_namlen",
            reason: "name longer than MAXNAMLEN",
        });
    }
    let need = dir_rec_len(name.len());
    if usize::from(reclen) < need {
        return Err(ParseError::InvalidField {
            field: "d_reclen",
            reason: "record length smaller than DIRSIZ",
        });
    }
    let end = offset + need;
    if end > block.len() {
        return Err(ParseError::InsufficientData {
            needed: need,
            offset,
            actual: block.len().saturating_sub(offset),
        });
    }
    #[expect(clippy::cast_possible_truncation)]
    let header = DirentHeader {
        ino,
        reclen,
        d_type: file_type as u8,
        // name.len() <= MAXNAMLEN checked above
        namlen: name.len() as u8,
    };
    header.write(block, offset)?;
    let name_at = offset + DIRENT_HEADER_LEN;
    block[name_at..name_at + name.len()].copy_from_slice(name);
    block[name_at + name.len()..end].fill(0);
    Ok(())
}

/// Name bytes of the record at `offset`.
pub fn record_name<'a>(block: &'a [u8], offset: usize, header: &DirentHeader) -> Result<&'a [u8], ParseError> {
    ufs_types::ensure_slice(block, offset + DIRENT_HEADER_LEN, usize::from(header.namlen))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirsiz_matches_ffs_macro() {
        assert_eq!(dir_rec_len(0), 12);
        assert_eq!(dir_rec_len(1), 12);
        assert_eq!(dir_rec_len(2), 12);
        assert_eq!(dir_rec_len(3), 12);
        assert_eq!(dir_rec_len(4), 16);
        assert_eq!(dir_rec_len(255), 264);
    }

    #[test]
    fn record_layout() {
        let mut block = [0xAA_u8; 512];
        write_record(&mut block, 12, 77, FileType::RegularFile, b"hello", 500).unwrap();
        assert_eq!(read_le_u32(&block, 12).unwrap(), 77);
        assert_eq!(read_le_u16(&block, 16).unwrap(), 500);
        assert_eq!(block[18], FileType::RegularFile as u8);
        assert_eq!(block[19], 5);
        assert_eq!(&block[20..25], b"hello");
        assert_eq!(&block[25..28], &[0, 0, 0]);
        // slack past DIRSIZ is left alone
        assert_eq!(block[28], 0xAA);

        let header = DirentHeader::parse(&block, 12).unwrap();
        assert_eq!(header.inode(), InodeNumber(77));
        assert_eq!(header.used_len(), 16);
        assert_eq!(record_name(&block, 12, &header).unwrap(), b"hello");
    }

    #[test]
    fn rejects_short_reclen_and_long_names() {
        let mut block = [0_u8; 512];
        assert!(write_record(&mut block, 0, 3, FileType::Directory, b"abcd", 12).is_err());
        let long = [b'n'; MAXNAMLEN + 1];
        assert!(write_record(&mut block, 0, 3, FileType::Directory, &long, 500).is_err());
    }
}
