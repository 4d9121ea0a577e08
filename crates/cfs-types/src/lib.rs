#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Blocks at the start of the volume left untouched by the format.
pub const LEADING_SPACE_BLOCKS: u64 = 2;
/// Blocks occupied by the superblock (immediately after the leading space).
pub const SUPERBLOCK_BLOCKS: u64 = 1;
/// Block holding the superblock dinode.
pub const SUPERBLOCK_BLKNO: u64 = LEADING_SPACE_BLOCKS;
/// Blocks every local allocator is pre-sized to at format time.
pub const MIN_RESERVED_TAIL_BLOCKS: u64 = 8;

pub const MIN_BLOCK_SIZE: u32 = 512;
pub const MAX_BLOCK_SIZE: u32 = 4096;
pub const MIN_CLUSTER_SIZE: u32 = 4096;
pub const MAX_CLUSTER_SIZE: u32 = 1024 * 1024;

/// Node slots addressable by a 256-bit node map.
pub const MAX_NODE_SLOTS: usize = 256;

/// Byte offset of the disk lock descriptor inside every lockable block.
pub const DISK_LOCK_OFFSET: usize = 0x08;
/// Encoded size of a disk lock descriptor.
pub const DISK_LOCK_SIZE: usize = 48;

/// Filesystem block address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Byte offset on a `ByteDevice` (pread/pwrite semantics).
///
/// This is a unit-carrying wrapper to prevent mixing bytes and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Narrow to `usize`, returning `ParseError::IntegerConversion` on overflow.
    pub fn to_usize(self) -> Result<usize, ParseError> {
        usize::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "byte_offset",
        })
    }
}

/// Validated block size (must be a power of two in 512..=4096).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [512, 4096].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=4096",
            });
        }
        Ok(Self(value))
    }

    /// Build from the `blocksize_bits` superblock field.
    pub fn from_bits(bits: u32) -> Result<Self, ParseError> {
        let value = 1_u32.checked_shl(bits).ok_or(ParseError::InvalidField {
            field: "blocksize_bits",
            reason: "shift out of range",
        })?;
        Self::new(value)
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Block size as a buffer length.
    #[must_use]
    pub fn bytes(self) -> usize {
        self.0 as usize
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Convert a block number to a byte offset.
    #[must_use]
    pub fn block_to_byte(self, block: BlockNumber) -> Option<ByteOffset> {
        block.0.checked_mul(u64::from(self.0)).map(ByteOffset)
    }
}

impl TryFrom<u32> for BlockSize {
    type Error = ParseError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BlockSize> for u32 {
    fn from(value: BlockSize) -> Self {
        value.0
    }
}

/// Validated cluster size (power of two in 4096..=1 MiB).
///
/// Clusters are the allocation unit of the global bitmap and of file data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ClusterSize(u32);

impl ClusterSize {
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(MIN_CLUSTER_SIZE..=MAX_CLUSTER_SIZE).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "cluster_size",
                reason: "must be power of two in 4096..=1048576",
            });
        }
        Ok(Self(value))
    }

    pub fn from_bits(bits: u32) -> Result<Self, ParseError> {
        let value = 1_u32.checked_shl(bits).ok_or(ParseError::InvalidField {
            field: "clustersize_bits",
            reason: "shift out of range",
        })?;
        Self::new(value)
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Blocks per cluster. Always at least one since clusters are never
    /// smaller than the largest block size.
    #[must_use]
    pub fn blocks_per_cluster(self, block_size: BlockSize) -> u64 {
        u64::from(self.0 >> block_size.shift())
    }

    /// First block of cluster `cluster`.
    #[must_use]
    pub fn cluster_to_block(self, cluster: u64, block_size: BlockSize) -> Option<BlockNumber> {
        cluster
            .checked_mul(self.blocks_per_cluster(block_size))
            .map(BlockNumber)
    }

    /// Cluster containing `block`.
    #[must_use]
    pub fn block_to_cluster(self, block: BlockNumber, block_size: BlockSize) -> u64 {
        block.0 / self.blocks_per_cluster(block_size)
    }

    /// Round a byte count up to whole clusters.
    #[must_use]
    pub fn bytes_to_clusters(self, bytes: u64) -> u64 {
        bytes.div_ceil(u64::from(self.0))
    }
}

impl TryFrom<u32> for ClusterSize {
    type Error = ParseError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ClusterSize> for u32 {
    fn from(value: ClusterSize) -> Self {
        value.0
    }
}

/// Index of a node in the cluster (0-based, below `max_nodes`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeSlot(pub u16);

impl NodeSlot {
    /// On-disk encoding of "no node" in `master` and `requester` fields.
    pub const NONE_RAW: u16 = 0xFFFF;

    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// Decode a raw field where `0xFFFF` means no node.
    #[must_use]
    pub fn from_raw(raw: u16) -> Option<Self> {
        (raw != Self::NONE_RAW).then_some(Self(raw))
    }

    #[must_use]
    pub fn to_raw(slot: Option<Self>) -> u16 {
        slot.map_or(Self::NONE_RAW, |s| s.0)
    }
}

/// Identifier of a lockable resource: the block number of the record that
/// embeds the disk lock descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockId(pub u64);

impl From<BlockNumber> for LockId {
    fn from(block: BlockNumber) -> Self {
        Self(block.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid signature: expected {expected:?}, got {actual:?}")]
    InvalidSignature {
        expected: &'static str,
        actual: String,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(
    data: &mut [u8],
    offset: usize,
    len: usize,
) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    Ok(u16::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    Ok(u32::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    Ok(u64::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_u8(data: &mut [u8], offset: usize, value: u8) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 1)?[0] = value;
    Ok(())
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    write_fixed(data, offset, &value.to_le_bytes())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    write_fixed(data, offset, &value.to_le_bytes())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    write_fixed(data, offset, &value.to_le_bytes())
}

#[inline]
pub fn write_fixed(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

/// Check an ASCII signature stored at `offset`.
pub fn expect_signature(
    data: &[u8],
    offset: usize,
    expected: &'static str,
) -> Result<(), ParseError> {
    let actual = ensure_slice(data, offset, expected.len())?;
    if actual != expected.as_bytes() {
        return Err(ParseError::InvalidSignature {
            expected,
            actual: String::from_utf8_lossy(actual).into_owned(),
        });
    }
    Ok(())
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

/// Copy `src` into a zeroed fixed-size field, truncating if it does not fit.
#[must_use]
pub fn nul_padded<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut out = [0_u8; N];
    let len = src.len().min(N);
    out[..len].copy_from_slice(&src[..len]);
    out
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `u64` to `u32` with an explicit error path.
pub fn u64_to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `usize` to `u16` with an explicit error path.
pub fn usize_to_u16(value: usize, field: &'static str) -> Result<u16, ParseError> {
    u16::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Convert this block number to its byte offset using the given block size.
    #[must_use]
    pub fn to_byte_offset(self, block_size: BlockSize) -> Option<ByteOffset> {
        block_size.block_to_byte(self)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ClusterSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_helpers() {
        let mut buf = [0_u8; 16];
        write_le_u16(&mut buf, 0, 0x1234).unwrap();
        write_le_u32(&mut buf, 2, 0xDEAD_BEEF).unwrap();
        write_le_u64(&mut buf, 8, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(&buf[..2], &[0x34, 0x12]);
        assert_eq!(read_le_u16(&buf, 0).unwrap(), 0x1234);
        assert_eq!(read_le_u32(&buf, 2).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_le_u64(&buf, 8).unwrap(), 0x0102_0304_0506_0708);
        assert!(read_le_u64(&buf, 9).is_err());
        assert!(write_le_u32(&mut buf, 14, 1).is_err());
    }

    #[test]
    fn test_ensure_slice_overflow() {
        let buf = [0_u8; 4];
        assert_eq!(
            ensure_slice(&buf, usize::MAX, 2).unwrap_err(),
            ParseError::InvalidField {
                field: "offset",
                reason: "overflow",
            }
        );
        assert_eq!(
            ensure_slice(&buf, 3, 2).unwrap_err(),
            ParseError::InsufficientData {
                needed: 2,
                offset: 3,
                actual: 1,
            }
        );
    }

    #[test]
    fn test_signature_check() {
        let buf = *b"GROUP01\0tail";
        assert!(expect_signature(&buf, 0, "GROUP01").is_ok());
        let err = expect_signature(&buf, 0, "EXBLK01").unwrap_err();
        assert!(matches!(err, ParseError::InvalidSignature { expected: "EXBLK01", .. }));
    }

    #[test]
    fn test_nul_padding() {
        let field: [u8; 8] = nul_padded(b"node1");
        assert_eq!(&field, b"node1\0\0\0");
        assert_eq!(trim_nul_padded(&field), "node1");
        let truncated: [u8; 4] = nul_padded(b"longname");
        assert_eq!(&truncated, b"long");
    }

    #[test]
    fn test_block_size_validation() {
        for ok in [512, 1024, 2048, 4096] {
            assert_eq!(BlockSize::new(ok).unwrap().get(), ok);
        }
        for bad in [0, 256, 768, 8192] {
            assert!(BlockSize::new(bad).is_err());
        }
        assert_eq!(BlockSize::from_bits(9).unwrap().get(), 512);
        assert!(BlockSize::from_bits(40).is_err());
    }

    #[test]
    fn test_cluster_size_validation() {
        assert!(ClusterSize::new(4096).is_ok());
        assert!(ClusterSize::new(1 << 20).is_ok());
        assert!(ClusterSize::new(2048).is_err());
        assert!(ClusterSize::new(2 << 20).is_err());
        assert!(ClusterSize::new(12288).is_err());
    }

    #[test]
    fn test_cluster_block_conversions() {
        let bs = BlockSize::new(512).unwrap();
        let cs = ClusterSize::new(4096).unwrap();
        assert_eq!(cs.blocks_per_cluster(bs), 8);
        assert_eq!(cs.cluster_to_block(3, bs), Some(BlockNumber(24)));
        assert_eq!(cs.block_to_cluster(BlockNumber(25), bs), 3);
        assert_eq!(cs.bytes_to_clusters(4097), 2);
        assert_eq!(cs.bytes_to_clusters(0), 0);
        assert_eq!(bs.block_to_byte(BlockNumber(3)), Some(ByteOffset(1536)));
        assert_eq!(bs.block_to_byte(BlockNumber(u64::MAX)), None);
    }

    #[test]
    fn test_node_slot_raw_encoding() {
        assert_eq!(NodeSlot::from_raw(0xFFFF), None);
        assert_eq!(NodeSlot::from_raw(3), Some(NodeSlot(3)));
        assert_eq!(NodeSlot::to_raw(None), 0xFFFF);
        assert_eq!(NodeSlot::to_raw(Some(NodeSlot(7))), 7);
        assert_eq!(NodeSlot(2).to_string(), "0002");
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), Some(0));
        assert_eq!(align_up(1, 8), Some(8));
        assert_eq!(align_up(16, 8), Some(16));
        assert_eq!(align_up(5, 3), None);
        assert_eq!(align_up(u64::MAX, 8), None);
    }

    #[test]
    fn test_block_size_serde_rejects_invalid() {
        let parsed: BlockSize = serde_json::from_str("1024").unwrap();
        assert_eq!(parsed.get(), 1024);
        assert!(serde_json::from_str::<BlockSize>("1000").is_err());
    }
}
