//! Chain list, the `id2` body of a bitmap dinode.
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0x00 | `cpg` u16 (bits per group) |
//! | 0x02 | `bpc` u16 (blocks per bit) |
//! | 0x04 | `count` u16 (record capacity) |
//! | 0x06 | `next_free_rec` u16 |
//! | 0x08 | reserved u64 |
//! | 0x10 | records, 16 bytes each: `free` u32, `total` u32, `blkno` u64 |

use cfs_types::{
    ParseError, read_le_u16, read_le_u32, read_le_u64, usize_to_u16, write_fixed, write_le_u16,
    write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

pub const CHAIN_LIST_HEADER_SIZE: usize = 16;
pub const CHAIN_REC_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRec {
    pub free: u32,
    pub total: u32,
    /// First group descriptor of the chain.
    pub blkno: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainList {
    pub cpg: u16,
    pub bpc: u16,
    pub count: u16,
    /// Used chains; `recs.len()` is the on-disk `next_free_rec`.
    pub recs: Vec<ChainRec>,
}

impl ChainList {
    /// Chain records that fit in a region of `len` bytes.
    #[must_use]
    pub fn capacity_for(len: usize) -> usize {
        len.saturating_sub(CHAIN_LIST_HEADER_SIZE) / CHAIN_REC_SIZE
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let count = read_le_u16(bytes, 0x04)?;
        let next_free = read_le_u16(bytes, 0x06)?;
        if next_free > count {
            return Err(ParseError::InvalidField {
                field: "cl_next_free_rec",
                reason: "exceeds cl_count",
            });
        }
        if usize::from(count) > Self::capacity_for(bytes.len()) {
            return Err(ParseError::InvalidField {
                field: "cl_count",
                reason: "records do not fit in the containing block",
            });
        }
        let recs = (0..usize::from(next_free))
            .map(|i| {
                let off = CHAIN_LIST_HEADER_SIZE + i * CHAIN_REC_SIZE;
                Ok(ChainRec {
                    free: read_le_u32(bytes, off)?,
                    total: read_le_u32(bytes, off + 4)?,
                    blkno: read_le_u64(bytes, off + 8)?,
                })
            })
            .collect::<Result<Vec<_>, ParseError>>()?;
        Ok(Self {
            cpg: read_le_u16(bytes, 0x00)?,
            bpc: read_le_u16(bytes, 0x02)?,
            count,
            recs,
        })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        let capacity = usize::from(self.count);
        if self.recs.len() > capacity {
            return Err(ParseError::InvalidField {
                field: "cl_next_free_rec",
                reason: "exceeds cl_count",
            });
        }
        if capacity > Self::capacity_for(buf.len()) {
            return Err(ParseError::InvalidField {
                field: "cl_count",
                reason: "records do not fit in the containing block",
            });
        }
        write_fixed(
            buf,
            0,
            &vec![0_u8; CHAIN_LIST_HEADER_SIZE + capacity * CHAIN_REC_SIZE],
        )?;
        write_le_u16(buf, 0x00, self.cpg)?;
        write_le_u16(buf, 0x02, self.bpc)?;
        write_le_u16(buf, 0x04, self.count)?;
        write_le_u16(buf, 0x06, usize_to_u16(self.recs.len(), "cl_next_free_rec")?)?;
        for (i, rec) in self.recs.iter().enumerate() {
            let off = CHAIN_LIST_HEADER_SIZE + i * CHAIN_REC_SIZE;
            write_le_u32(buf, off, rec.free)?;
            write_le_u32(buf, off + 4, rec.total)?;
            write_le_u64(buf, off + 8, rec.blkno)?;
        }
        Ok(())
    }
}
