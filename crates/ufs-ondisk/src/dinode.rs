//! `ufs2_dinode`: the 256-byte on-disk inode.

use serde::{Deserialize, Serialize};
use ufs_types::{
    BlockNumber, DINODE_SIZE, FileType, MAXSYMLINKLEN, NDADDR, NIADDR, NXADDR, ParseError,
    S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, read_le_i32, read_le_i64, read_le_u16, read_le_u32,
    read_le_u64, write_le_i32, write_le_i64, write_le_u16, write_le_u32, write_le_u64,
};

const OFF_DB: usize = 112;
const OFF_IB: usize = 208;

/// Decoded UFS2 inode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ufs2Dinode {
    pub mode: u16,
    pub nlink: u16,
    pub uid: u32,
    pub gid: u32,
    pub blksize: u32,
    pub size: u64,
    /// Allocated space in `DEV_BSIZE` sectors.
    pub blocks: u64,

    // ── Timestamps ───────────────────────────────────────────────────────
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub birthtime: i64,
    pub mtimensec: i32,
    pub atimensec: i32,
    pub ctimensec: i32,
    pub birthnsec: i32,

    pub generation: u32,
    pub kernflags: u32,
    pub flags: u32,
    pub extsize: u32,
    pub extb: [u64; NXADDR],
    /// Direct block pointers (fragment addresses, 0 = hole).
    pub db: [u64; NDADDR],
    /// Single, double and triple indirect roots.
    pub ib: [u64; NIADDR],
    pub modrev: u64,
    pub freelink: u32,
    pub ckhash: u32,
}

impl Ufs2Dinode {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < DINODE_SIZE {
            return Err(ParseError::InsufficientData {
                needed: DINODE_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }
        let mut din = Self {
            mode: read_le_u16(bytes, 0)?,
            nlink: read_le_u16(bytes, 2)?,
            uid: read_le_u32(bytes, 4)?,
            gid: read_le_u32(bytes, 8)?,
            blksize: read_le_u32(bytes, 12)?,
            size: read_le_u64(bytes, 16)?,
            blocks: read_le_u64(bytes, 24)?,
            atime: read_le_i64(bytes, 32)?,
            mtime: read_le_i64(bytes, 40)?,
            ctime: read_le_i64(bytes, 48)?,
            birthtime: read_le_i64(bytes, 56)?,
            mtimensec: read_le_i32(bytes, 64)?,
            atimensec: read_le_i32(bytes, 68)?,
            ctimensec: read_le_i32(bytes, 72)?,
            birthnsec: read_le_i32(bytes, 76)?,
            generation: read_le_u32(bytes, 80)?,
            kernflags: read_le_u32(bytes, 84)?,
            flags: read_le_u32(bytes, 88)?,
            extsize: read_le_u32(bytes, 92)?,
            modrev: read_le_u64(bytes, 232)?,
            freelink: read_le_u32(bytes, 240)?,
            ckhash: read_le_u32(bytes, 244)?,
            ..Self::default()
        };
        for (i, slot) in din.extb.iter_mut().enumerate() {
            *slot = read_le_u64(bytes, 96 + i * 8)?;
        }
        for (i, slot) in din.db.iter_mut().enumerate() {
            *slot = read_le_u64(bytes, OFF_DB + i * 8)?;
        }
        for (i, slot) in din.ib.iter_mut().enumerate() {
            *slot = read_le_u64(bytes, OFF_IB + i * 8)?;
        }
        Ok(din)
    }

    /// Serialize into the first 256 bytes of `out`, leaving the spare words
    /// untouched.
    pub fn write_to_bytes(&self, out: &mut [u8]) -> Result<(), ParseError> {
        write_le_u16(out, 0, self.mode)?;
        write_le_u16(out, 2, self.nlink)?;
        write_le_u32(out, 4, self.uid)?;
        write_le_u32(out, 8, self.gid)?;
        write_le_u32(out, 12, self.blksize)?;
        write_le_u64(out, 16, self.size)?;
        write_le_u64(out, 24, self.blocks)?;
        write_le_i64(out, 32, self.atime)?;
        write_le_i64(out, 40, self.mtime)?;
        write_le_i64(out, 48, self.ctime)?;
        write_le_i64(out, 56, self.birthtime)?;
        write_le_i32(out, 64, self.mtimensec)?;
        write_le_i32(out, 68, self.atimensec)?;
        write_le_i32(out, 72, self.ctimensec)?;
        write_le_i32(out, 76, self.birthnsec)?;
        write_le_u32(out, 80, self.generation)?;
        write_le_u32(out, 84, self.kernflags)?;
        write_le_u32(out, 88, self.flags)?;
        write_le_u32(out, 92, self.extsize)?;
        for (i, addr) in self.extb.iter().enumerate() {
            write_le_u64(out, 96 + i * 8, *addr)?;
        }
        for (i, addr) in self.db.iter().enumerate() {
            write_le_u64(out, OFF_DB + i * 8, *addr)?;
        }
        for (i, addr) in self.ib.iter().enumerate() {
            write_le_u64(out, OFF_IB + i * 8, *addr)?;
        }
        write_le_u64(out, 232, self.modrev)?;
        write_le_u32(out, 240, self.freelink)?;
        write_le_u32(out, 244, self.ckhash)
    }

    #[must_use]
    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    #[must_use]
    pub fn is_reg(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    /// Mode 0 marks an unused inode slot.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.mode == 0
    }

    /// True when a symlink target is stored in the pointer area rather
    /// than in a data block.
    #[must_use]
    pub fn has_inline_target(&self) -> bool {
        self.is_symlink() && self.size < MAXSYMLINKLEN as u64 && self.blocks == 0
    }

    /// The pointer area (`db` then `ib`) viewed as bytes.
    #[must_use]
    pub fn inline_bytes(&self) -> [u8; MAXSYMLINKLEN] {
        let mut out = [0_u8; MAXSYMLINKLEN];
        for (chunk, addr) in out.chunks_exact_mut(8).zip(self.db.iter().chain(self.ib.iter())) {
            chunk.copy_from_slice(&addr.to_le_bytes());
        }
        out
    }

    /// Overwrite the pointer area with `data`, zero padded.
    pub fn set_inline_bytes(&mut self, data: &[u8]) -> Result<(), ParseError> {
        if data.len() > MAXSYMLINKLEN {
            return Err(ParseError::InvalidField {
                field: "di_db",
                reason: "inline data exceeds pointer area",
            });
        }
        let mut raw = [0_u8; MAXSYMLINKLEN];
        raw[..data.len()].copy_from_slice(data);
        let mut words = raw
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]));
        for slot in self.db.iter_mut().chain(self.ib.iter_mut()) {
            *slot = words.next().unwrap_or(0);
        }
        Ok(())
    }

    /// Direct pointer `i` as a typed block number.
    #[must_use]
    pub fn direct(&self, i: usize) -> BlockNumber {
        BlockNumber(self.db[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Ufs2Dinode {
        let mut din = Ufs2Dinode {
            mode: S_IFREG | 0o644,
            nlink: 1,
            uid: 1000,
            gid: 100,
            blksize: 8192,
            size: 12_345,
            blocks: 32,
            atime: 1_700_000_001,
            mtime: 1_700_000_002,
            ctime: 1_700_000_003,
            birthtime: 1_700_000_000,
            mtimensec: 5,
            generation: 0xDEAD_BEEF,
            ..Ufs2Dinode::default()
        };
        din.db[0] = 296;
        din.db[11] = 400;
        din.ib[2] = 9_999;
        din
    }

    #[test]
    fn fields_land_at_ufs2_offsets() {
        let mut buf = [0_u8; DINODE_SIZE];
        sample().write_to_bytes(&mut buf).unwrap();
        assert_eq!(read_le_u16(&buf, 0).unwrap(), S_IFREG | 0o644);
        assert_eq!(read_le_u64(&buf, 16).unwrap(), 12_345);
        assert_eq!(read_le_u32(&buf, 80).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_le_u64(&buf, 112).unwrap(), 296);
        assert_eq!(read_le_u64(&buf, 112 + 11 * 8).unwrap(), 400);
        assert_eq!(read_le_u64(&buf, 224).unwrap(), 9_999);
        let back = Ufs2Dinode::parse_from_bytes(&buf).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(matches!(
            Ufs2Dinode::parse_from_bytes(&[0_u8; 128]),
            Err(ParseError::InsufficientData { needed: 256, .. })
        ));
    }

    #[test]
    fn inline_target_uses_pointer_area() {
        let mut din = Ufs2Dinode {
            mode: S_IFLNK | 0o777,
            ..Ufs2Dinode::default()
        };
        let target = b"../some/where/else";
        din.set_inline_bytes(target).unwrap();
        din.size = target.len() as u64;
        assert!(din.has_inline_target());
        assert_eq!(&din.inline_bytes()[..target.len()], target);
        assert!(din.inline_bytes()[target.len()..].iter().all(|b| *b == 0));
        assert!(din.set_inline_bytes(&[b'x'; MAXSYMLINKLEN + 1]).is_err());
    }

    #[test]
    fn type_predicates() {
        let din = sample();
        assert!(din.is_reg());
        assert!(!din.is_dir());
        assert_eq!(din.file_type(), FileType::RegularFile);
        assert!(Ufs2Dinode::default().is_free());
    }
}
