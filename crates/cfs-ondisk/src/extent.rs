//! Extent lists and extent blocks.
//!
//! Extent list (inline in a dinode at `0xC0` or in an extent block at
//! `0x60`):
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0x00 | `tree_depth` u16 |
//! | 0x02 | `count` u16 (record capacity) |
//! | 0x04 | `next_free_rec` u16 |
//! | 0x06 | reserved u16 |
//! | 0x08 | reserved u64 |
//! | 0x10 | records, 16 bytes each: `cpos` u32, `clusters` u32, `blkno` u64 |
//!
//! This module only enforces what is needed to read the bytes safely.
//! Ordering, depth and size rules live in `cfs-extent`.

use crate::lock::DiskLock;
use cfs_types::{
    ParseError, expect_signature, read_le_u16, read_le_u32, read_le_u64,
    usize_to_u16, write_fixed, write_le_u16, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

pub const EXTENT_LIST_HEADER_SIZE: usize = 16;
pub const EXTENT_REC_SIZE: usize = 16;

pub const EXTENT_BLOCK_SIGNATURE: &str = "EXBLK01";
/// Offset of the extent list inside an extent block.
pub const EXTENT_BLOCK_LIST_OFFSET: usize = 0x60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentRec {
    /// First logical cluster covered.
    pub cpos: u32,
    /// Clusters covered (for interior records: clusters of the subtree).
    pub clusters: u32,
    /// Physical block of the data (leaf) or of the child extent block.
    pub blkno: u64,
}

impl ExtentRec {
    /// One past the last logical cluster covered.
    #[must_use]
    pub fn end_cpos(&self) -> u64 {
        u64::from(self.cpos) + u64::from(self.clusters)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentList {
    pub tree_depth: u16,
    /// Record capacity of the on-disk list.
    pub count: u16,
    /// Used records; `recs.len()` is the on-disk `next_free_rec`.
    pub recs: Vec<ExtentRec>,
}

impl ExtentList {
    #[must_use]
    pub fn empty(count: u16) -> Self {
        Self {
            tree_depth: 0,
            count,
            recs: Vec::new(),
        }
    }

    /// Records that fit in a region of `len` bytes.
    #[must_use]
    pub fn capacity_for(len: usize) -> usize {
        len.saturating_sub(EXTENT_LIST_HEADER_SIZE) / EXTENT_REC_SIZE
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.tree_depth == 0
    }

    /// Sum of `clusters` over the used records.
    #[must_use]
    pub fn total_clusters(&self) -> u64 {
        self.recs.iter().map(|r| u64::from(r.clusters)).sum()
    }

    /// Decode a list whose header starts at `bytes[0]`.
    ///
    /// Fails if `next_free_rec > count`, or if the declared capacity does
    /// not fit in `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let tree_depth = read_le_u16(bytes, 0x00)?;
        let count = read_le_u16(bytes, 0x02)?;
        let next_free = read_le_u16(bytes, 0x04)?;

        if next_free > count {
            return Err(ParseError::InvalidField {
                field: "l_next_free_rec",
                reason: "exceeds l_count",
            });
        }
        if usize::from(count) > Self::capacity_for(bytes.len()) {
            return Err(ParseError::InvalidField {
                field: "l_count",
                reason: "records do not fit in the containing block",
            });
        }

        let recs = (0..usize::from(next_free))
            .map(|i| {
                let off = EXTENT_LIST_HEADER_SIZE + i * EXTENT_REC_SIZE;
                Ok(ExtentRec {
                    cpos: read_le_u32(bytes, off)?,
                    clusters: read_le_u32(bytes, off + 4)?,
                    blkno: read_le_u64(bytes, off + 8)?,
                })
            })
            .collect::<Result<Vec<_>, ParseError>>()?;

        Ok(Self {
            tree_depth,
            count,
            recs,
        })
    }

    /// Encode into `buf`, zeroing unused record slots.
    pub fn write(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        if self.recs.len() > usize::from(self.count) {
            return Err(ParseError::InvalidField {
                field: "l_next_free_rec",
                reason: "exceeds l_count",
            });
        }
        let capacity = usize::from(self.count);
        if capacity > Self::capacity_for(buf.len()) {
            return Err(ParseError::InvalidField {
                field: "l_count",
                reason: "records do not fit in the containing block",
            });
        }

        write_fixed(
            buf,
            0,
            &vec![0_u8; EXTENT_LIST_HEADER_SIZE + capacity * EXTENT_REC_SIZE],
        )?;
        write_le_u16(buf, 0x00, self.tree_depth)?;
        write_le_u16(buf, 0x02, self.count)?;
        write_le_u16(buf, 0x04, usize_to_u16(self.recs.len(), "l_next_free_rec")?)?;
        for (i, rec) in self.recs.iter().enumerate() {
            let off = EXTENT_LIST_HEADER_SIZE + i * EXTENT_REC_SIZE;
            write_le_u32(buf, off, rec.cpos)?;
            write_le_u32(buf, off + 4, rec.clusters)?;
            write_le_u64(buf, off + 8, rec.blkno)?;
        }
        Ok(())
    }
}

/// Interior or leaf node of an extent tree, one per block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentBlock {
    pub lock: DiskLock,
    pub suballoc_blkno: u64,
    pub suballoc_node: u16,
    pub suballoc_bit: u16,
    pub blkno: u64,
    pub parent_blk: u64,
    /// Next leaf in `cpos` order, 0 for the last leaf.
    pub next_leaf_blk: u64,
    pub list: ExtentList,
}

impl ExtentBlock {
    /// Record capacity of the list in an extent block of `block_size` bytes.
    pub fn list_capacity(block_size: usize) -> Result<u16, ParseError> {
        usize_to_u16(
            ExtentList::capacity_for(block_size.saturating_sub(EXTENT_BLOCK_LIST_OFFSET)),
            "l_count",
        )
    }

    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        expect_signature(block, 0, EXTENT_BLOCK_SIGNATURE)?;
        let list_bytes = block
            .get(EXTENT_BLOCK_LIST_OFFSET..)
            .ok_or(ParseError::InsufficientData {
                needed: EXTENT_BLOCK_LIST_OFFSET + EXTENT_LIST_HEADER_SIZE,
                offset: 0,
                actual: block.len(),
            })?;
        Ok(Self {
            lock: DiskLock::parse_from_block(block)?,
            suballoc_blkno: read_le_u64(block, 0x38)?,
            suballoc_node: read_le_u16(block, 0x40)?,
            suballoc_bit: read_le_u16(block, 0x42)?,
            blkno: read_le_u64(block, 0x48)?,
            parent_blk: read_le_u64(block, 0x50)?,
            next_leaf_blk: read_le_u64(block, 0x58)?,
            list: ExtentList::parse(list_bytes)?,
        })
    }

    /// Encode into a full block buffer.
    pub fn write(&self, block: &mut [u8]) -> Result<(), ParseError> {
        block.fill(0);
        write_fixed(block, 0, EXTENT_BLOCK_SIGNATURE.as_bytes())?;
        self.lock.write_to_block(block)?;
        write_le_u64(block, 0x38, self.suballoc_blkno)?;
        write_le_u16(block, 0x40, self.suballoc_node)?;
        write_le_u16(block, 0x42, self.suballoc_bit)?;
        write_le_u64(block, 0x48, self.blkno)?;
        write_le_u64(block, 0x50, self.parent_blk)?;
        write_le_u64(block, 0x58, self.next_leaf_blk)?;
        let list_bytes = block
            .get_mut(EXTENT_BLOCK_LIST_OFFSET..)
            .ok_or(ParseError::InsufficientData {
                needed: EXTENT_BLOCK_LIST_OFFSET,
                offset: 0,
                actual: 0,
            })?;
        self.list.write(list_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_list() -> ExtentList {
        ExtentList {
            tree_depth: 0,
            count: 4,
            recs: vec![
                ExtentRec {
                    cpos: 0,
                    clusters: 8,
                    blkno: 100,
                },
                ExtentRec {
                    cpos: 8,
                    clusters: 2,
                    blkno: 400,
                },
            ],
        }
    }

    #[test]
    fn list_header_layout() {
        let mut buf = vec![0xEE_u8; 16 + 4 * 16];
        sample_list().write(&mut buf).unwrap();
        assert_eq!(read_le_u16(&buf, 0x02).unwrap(), 4);
        assert_eq!(read_le_u16(&buf, 0x04).unwrap(), 2);
        assert_eq!(read_le_u32(&buf, 0x20).unwrap(), 8);
        assert_eq!(read_le_u64(&buf, 0x28).unwrap(), 400);
        // unused slots are zeroed
        assert!(buf[0x30..].iter().all(|b| *b == 0));
        assert_eq!(ExtentList::parse(&buf).unwrap(), sample_list());
    }

    #[test]
    fn next_free_past_count_rejected() {
        let mut buf = vec![0_u8; 64];
        write_le_u16(&mut buf, 0x02, 1).unwrap();
        write_le_u16(&mut buf, 0x04, 2).unwrap();
        assert_eq!(
            ExtentList::parse(&buf).unwrap_err(),
            ParseError::InvalidField {
                field: "l_next_free_rec",
                reason: "exceeds l_count",
            }
        );
    }

    #[test]
    fn count_past_buffer_rejected() {
        let mut buf = vec![0_u8; 48];
        write_le_u16(&mut buf, 0x02, 3).unwrap();
        assert!(ExtentList::parse(&buf).is_err());
    }

    #[test]
    fn extent_block_round_trip_and_signature() {
        let capacity = ExtentBlock::list_capacity(512).unwrap();
        assert_eq!(capacity, 25);
        let eb = ExtentBlock {
            lock: DiskLock::default(),
            suballoc_blkno: 9,
            suballoc_node: 1,
            suballoc_bit: 5,
            blkno: 77,
            parent_blk: 40,
            next_leaf_blk: 0,
            list: ExtentList {
                count: capacity,
                ..sample_list()
            },
        };
        let mut block = vec![0_u8; 512];
        eb.write(&mut block).unwrap();
        assert_eq!(&block[..7], b"EXBLK01");
        assert_eq!(ExtentBlock::parse(&block).unwrap(), eb);

        block[0] = b'X';
        assert!(matches!(
            ExtentBlock::parse(&block),
            Err(ParseError::InvalidSignature { .. })
        ));
    }
}
