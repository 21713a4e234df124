#![forbid(unsafe_code)]
//! Raw block I/O.
//!
//! The engine consumes a [`BlockDevice`]: synchronous transfers addressed in
//! `DEV_BSIZE` sectors whose length is any multiple of the sector size (a
//! full block, a fragment run, or a cylinder-group block). There is no
//! cache; every call reaches the underlying [`ByteDevice`].

use parking_lot::Mutex;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;
use ufs_error::{Result, UfsError};
use ufs_types::{DEV_BSIZE, DiskAddr};

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(offset: u64, len: usize, dev_len: u64, what: &str) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| UfsError::Format(format!("{what} length overflows u64")))?,
        )
        .ok_or_else(|| UfsError::Format(format!("{what} range overflows u64")))?;
    if end > dev_len {
        return Err(UfsError::Format(format!(
            "{what} out of bounds: offset={offset} len={len} device_len={dev_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which does not share a seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open read-write, falling back to read-only when the file is not
    /// writable.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Create (or truncate) an image file of `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(UfsError::ReadOnly);
        }
        check_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Heap-backed byte device, used for scratch images and tests.
#[derive(Debug, Clone)]
pub struct MemByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemByteDevice {
    /// A zero-filled device of `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0; len])),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64, "read")?;
        let start = usize::try_from(offset)
            .map_err(|_| UfsError::Format("read offset does not fit usize".to_owned()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64, "write")?;
        let start = usize::try_from(offset)
            .map_err(|_| UfsError::Format("write offset does not fit usize".to_owned()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Sector-addressed I/O interface consumed by the engine.
///
/// Transfers are synchronous. `buf.len()` must be a multiple of
/// [`BlockDevice::sector_size`].
pub trait BlockDevice: Send + Sync {
    /// Read `buf.len()` bytes starting at sector `addr`.
    fn read_block(&self, addr: DiskAddr, buf: &mut [u8]) -> Result<()>;

    /// Write `data` starting at sector `addr`.
    fn write_block(&self, addr: DiskAddr, data: &[u8]) -> Result<()>;

    /// Sector size in bytes (`DEV_BSIZE`).
    fn sector_size(&self) -> u32;

    /// Total number of sectors.
    fn sector_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// [`BlockDevice`] over any [`ByteDevice`].
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    sector_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D) -> Result<Self> {
        let len = inner.len_bytes();
        let sector = u64::from(DEV_BSIZE);
        let remainder = len % sector;
        if remainder != 0 {
            return Err(UfsError::Format(format!(
                "image length is not sector-aligned: len_bytes={len} remainder={remainder}"
            )));
        }
        Ok(Self {
            inner,
            sector_count: len / sector,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn byte_offset(&self, addr: DiskAddr, len: usize) -> Result<u64> {
        if len % DEV_BSIZE as usize != 0 {
            return Err(UfsError::InvalidArgument(format!(
                "transfer of {len} bytes is not a multiple of {DEV_BSIZE}"
            )));
        }
        let sectors = (len / DEV_BSIZE as usize) as u64;
        if addr
            .0
            .checked_add(sectors)
            .is_none_or(|end| end > self.sector_count)
        {
            return Err(UfsError::Format(format!(
                "sector out of range: addr={addr} sectors={sectors} sector_count={}",
                self.sector_count
            )));
        }
        addr.to_byte_offset()
            .ok_or_else(|| UfsError::Format("sector offset overflow".to_owned()))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, addr: DiskAddr, buf: &mut [u8]) -> Result<()> {
        let offset = self.byte_offset(addr, buf.len())?;
        trace!(sector = addr.0, len = buf.len(), "block_read");
        self.inner.read_exact_at(offset, buf)
    }

    fn write_block(&self, addr: DiskAddr, data: &[u8]) -> Result<()> {
        let offset = self.byte_offset(addr, data.len())?;
        trace!(sector = addr.0, len = data.len(), "block_write");
        self.inner.write_all_at(offset, data)
    }

    fn sector_size(&self) -> u32 {
        DEV_BSIZE
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}
