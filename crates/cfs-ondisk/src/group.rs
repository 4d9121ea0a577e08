//! Allocation group descriptor.
//!
//! One block per group. The bitmap covering the group's bits starts at
//! `0x40` and runs to the end of the block.
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0x00 | signature `GROUP01\0` |
//! | 0x08 | `size` u16 (bitmap bytes) |
//! | 0x0A | `bits` u16 |
//! | 0x0C | `free_bits_count` u16 |
//! | 0x0E | `chain` u16 |
//! | 0x10 | `generation` u32 |
//! | 0x18 | `next_group` u64 (0 = end of chain) |
//! | 0x20 | `parent_dinode` u64 |
//! | 0x28 | `blkno` u64 |
//! | 0x40 | bitmap |

use cfs_types::{
    ParseError, ensure_slice, expect_signature, read_le_u16, read_le_u32, read_le_u64,
    usize_to_u16, write_fixed, write_le_u16, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

pub const GROUP_DESC_SIGNATURE: &str = "GROUP01";
pub const GROUP_BITMAP_OFFSET: usize = 0x40;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDesc {
    pub size: u16,
    pub bits: u16,
    pub free_bits_count: u16,
    pub chain: u16,
    pub generation: u32,
    pub next_group: u64,
    pub parent_dinode: u64,
    pub blkno: u64,
    /// `size` bytes; bit `i` set means unit `i` of the group is in use.
    pub bitmap: Vec<u8>,
}

impl GroupDesc {
    /// Largest bitmap (in bytes) a descriptor block can carry.
    #[must_use]
    pub fn max_bitmap_bytes(block_size: usize) -> usize {
        block_size.saturating_sub(GROUP_BITMAP_OFFSET)
    }

    /// Largest number of bits a descriptor block can track.
    pub fn max_bits(block_size: usize) -> Result<u16, ParseError> {
        usize_to_u16(Self::max_bitmap_bytes(block_size) * 8, "bg_bits")
    }

    /// Fresh descriptor with every bit clear.
    pub fn new(
        block_size: usize,
        bits: u16,
        chain: u16,
        blkno: u64,
        parent_dinode: u64,
    ) -> Result<Self, ParseError> {
        let bytes = usize::from(bits).div_ceil(8);
        if bytes > Self::max_bitmap_bytes(block_size) {
            return Err(ParseError::InvalidField {
                field: "bg_bits",
                reason: "exceeds bitmap capacity",
            });
        }
        Ok(Self {
            size: usize_to_u16(bytes, "bg_size")?,
            bits,
            free_bits_count: bits,
            chain,
            generation: 0,
            next_group: 0,
            parent_dinode,
            blkno,
            bitmap: vec![0_u8; bytes],
        })
    }

    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        expect_signature(block, 0, GROUP_DESC_SIGNATURE)?;
        let size = read_le_u16(block, 0x08)?;
        let bits = read_le_u16(block, 0x0A)?;
        let free_bits_count = read_le_u16(block, 0x0C)?;

        if usize::from(size) > Self::max_bitmap_bytes(block.len()) {
            return Err(ParseError::InvalidField {
                field: "bg_size",
                reason: "bitmap extends past block",
            });
        }
        if u32::from(bits) > u32::from(size) * 8 {
            return Err(ParseError::InvalidField {
                field: "bg_bits",
                reason: "more bits than bitmap bytes",
            });
        }
        if free_bits_count > bits {
            return Err(ParseError::InvalidField {
                field: "bg_free_bits_count",
                reason: "exceeds bg_bits",
            });
        }

        Ok(Self {
            size,
            bits,
            free_bits_count,
            chain: read_le_u16(block, 0x0E)?,
            generation: read_le_u32(block, 0x10)?,
            next_group: read_le_u64(block, 0x18)?,
            parent_dinode: read_le_u64(block, 0x20)?,
            blkno: read_le_u64(block, 0x28)?,
            bitmap: ensure_slice(block, GROUP_BITMAP_OFFSET, usize::from(size))?.to_vec(),
        })
    }

    /// Encode into a full block buffer.
    pub fn write(&self, block: &mut [u8]) -> Result<(), ParseError> {
        if self.bitmap.len() != usize::from(self.size) {
            return Err(ParseError::InvalidField {
                field: "bg_size",
                reason: "does not match bitmap length",
            });
        }
        block.fill(0);
        write_fixed(block, 0, GROUP_DESC_SIGNATURE.as_bytes())?;
        write_le_u16(block, 0x08, self.size)?;
        write_le_u16(block, 0x0A, self.bits)?;
        write_le_u16(block, 0x0C, self.free_bits_count)?;
        write_le_u16(block, 0x0E, self.chain)?;
        write_le_u32(block, 0x10, self.generation)?;
        write_le_u64(block, 0x18, self.next_group)?;
        write_le_u64(block, 0x20, self.parent_dinode)?;
        write_le_u64(block, 0x28, self.blkno)?;
        write_fixed(block, GROUP_BITMAP_OFFSET, &self.bitmap)
    }
}
