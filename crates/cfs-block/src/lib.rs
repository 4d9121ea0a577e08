#![forbid(unsafe_code)]
//! Positioned block I/O.
//!
//! Provides the byte-addressed `ByteDevice` (pread/pwrite semantics), the
//! block-addressed `BlockDevice`, a file-backed device and a shared
//! in-memory device. Every node of the coordination protocol talks to the
//! same device through these traits; nothing here caches.

use cfs_error::{CfsError, Result};
use cfs_types::BlockNumber;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Zero-filled buffer of `len` bytes.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: vec![0_u8; len],
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

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

fn checked_end(offset: u64, len: usize, op: &str) -> Result<u64> {
    offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| CfsError::Format(format!("{op} length overflows u64")))?,
        )
        .ok_or_else(|| CfsError::Format(format!("{op} range overflows u64")))
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// This uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open read-write, falling back to read-only when write access is denied.
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
        Self::from_file(file, writable)
    }

    /// Open read-only.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        Self::from_file(file, false)
    }

    /// Create (or truncate) an image file of exactly `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Self::from_file(file, true)
    }

    fn from_file(file: File, writable: bool) -> Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
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
        let end = checked_end(offset, buf.len(), "read")?;
        if end > self.len {
            return Err(CfsError::Format(format!(
                "read out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(CfsError::ReadOnly);
        }
        let end = checked_end(offset, buf.len(), "write")?;
        if end > self.len {
            return Err(CfsError::Format(format!(
                "write out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device.
///
/// Clones share the same backing bytes, so several protocol participants
/// can observe one another's writes the way they would on a shared disk.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0_u8; len])),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    fn range(&self, offset: u64, len: usize) -> Result<(usize, usize)> {
        let start =
            usize::try_from(offset).map_err(|_| CfsError::Format("offset overflow".into()))?;
        let end = start
            .checked_add(len)
            .ok_or_else(|| CfsError::Format("range overflow".into()))?;
        let size = self.bytes.lock().len();
        if end > size {
            return Err(CfsError::Format(format!(
                "access out of bounds: offset={offset} len={len} device_len={size}"
            )));
        }
        Ok((start, end))
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        // usize is at most 64 bits on every supported target
        u64::try_from(self.bytes.lock().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let (start, end) = self.range(offset, buf.len())?;
        let bytes = self.bytes.lock();
        buf.copy_from_slice(&bytes[start..end]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let (start, end) = self.range(offset, buf.len())?;
        let mut bytes = self.bytes.lock();
        bytes[start..end].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for Arc<T> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        (**self).read_block(block)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        (**self).write_block(block, data)
    }

    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

#[derive(Debug, Clone)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(CfsError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }

        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size);
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(CfsError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        let block_count = len / block_size_u64;
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn block_offset(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(CfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| CfsError::Format("block offset overflow".to_owned()))
    }

    fn block_len(&self) -> Result<usize> {
        usize::try_from(self.block_size)
            .map_err(|_| CfsError::Format("block_size does not fit usize".to_owned()))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.block_offset(block)?;
        let mut buf = vec![0_u8; self.block_len()?];
        self.inner.read_exact_at(offset, &mut buf)?;
        trace!(block = block.0, "read_block");
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = self.block_len()?;
        if data.len() != expected {
            return Err(CfsError::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        let offset = self.block_offset(block)?;
        self.inner.write_all_at(offset, data)?;
        trace!(block = block.0, "write_block");
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// Write `count` zero blocks starting at `start`.
pub fn zero_blocks(dev: &dyn BlockDevice, start: BlockNumber, count: u64) -> Result<()> {
    let zero = vec![
        0_u8;
        usize::try_from(dev.block_size())
            .map_err(|_| CfsError::Format("block_size does not fit usize".to_owned()))?
    ];
    for i in 0..count {
        let block = start
            .checked_add(i)
            .ok_or_else(|| CfsError::Format("block number overflow".to_owned()))?;
        dev.write_block(block, &zero)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_block_device_round_trips() {
        let mem = MemoryByteDevice::new(512 * 4);
        let dev = ByteBlockDevice::new(mem, 512).expect("device");

        dev.write_block(BlockNumber(2), &[7_u8; 512]).expect("write");
        let read = dev.read_block(BlockNumber(2)).expect("read");
        assert_eq!(read.as_slice(), &[7_u8; 512]);
        assert_eq!(dev.block_count(), 4);
    }

    #[test]
    fn memory_device_clones_share_storage() {
        let mem = MemoryByteDevice::new(1024);
        let a = ByteBlockDevice::new(mem.clone(), 512).expect("device a");
        let b = ByteBlockDevice::new(mem, 512).expect("device b");

        a.write_block(BlockNumber(1), &[9_u8; 512]).expect("write");
        assert_eq!(b.read_block(BlockNumber(1)).expect("read").as_slice(), &[9_u8; 512]);
    }

    #[test]
    fn memory_device_reports_its_length() {
        let mem = MemoryByteDevice::new(1536);
        assert_eq!(mem.len_bytes(), 1536);
        let dev = ByteBlockDevice::new(mem, 512).expect("device");
        assert_eq!(dev.block_count(), 3);
    }

    #[test]
    fn out_of_range_and_size_mismatch_rejected() {
        let dev = ByteBlockDevice::new(MemoryByteDevice::new(1024), 512).expect("device");
        assert!(dev.read_block(BlockNumber(2)).is_err());
        assert!(dev.write_block(BlockNumber(0), &[0_u8; 100]).is_err());
    }

    #[test]
    fn unaligned_image_rejected() {
        let err = ByteBlockDevice::new(MemoryByteDevice::new(1000), 512).unwrap_err();
        assert!(matches!(err, CfsError::Format(_)));
    }

    #[test]
    fn zero_blocks_clears_range() {
        let dev = ByteBlockDevice::new(MemoryByteDevice::new(512 * 4), 512).expect("device");
        for b in 0..4 {
            dev.write_block(BlockNumber(b), &[0xAB; 512]).expect("fill");
        }
        zero_blocks(&dev, BlockNumber(1), 2).expect("zero");
        assert_eq!(dev.read_block(BlockNumber(0)).expect("r0").as_slice(), &[0xAB; 512]);
        assert_eq!(dev.read_block(BlockNumber(1)).expect("r1").as_slice(), &[0_u8; 512]);
        assert_eq!(dev.read_block(BlockNumber(2)).expect("r2").as_slice(), &[0_u8; 512]);
        assert_eq!(dev.read_block(BlockNumber(3)).expect("r3").as_slice(), &[0xAB; 512]);
    }

    #[test]
    fn file_device_round_trips_and_respects_read_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("image");
        let dev = FileByteDevice::create(&path, 4096).expect("create");
        dev.write_all_at(100, b"hello").expect("write");
        dev.sync().expect("sync");

        let ro = FileByteDevice::open_read_only(&path).expect("open ro");
        let mut buf = [0_u8; 5];
        ro.read_exact_at(100, &mut buf).expect("read");
        assert_eq!(&buf, b"hello");
        assert!(matches!(ro.write_all_at(0, b"x"), Err(CfsError::ReadOnly)));
        assert!(ro.read_exact_at(4094, &mut buf).is_err());
    }
}
