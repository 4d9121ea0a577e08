//! Dinode (on-disk inode), including the superblock and the allocator
//! bodies carried in its `id2` union.
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0x00 | signature `INODE01` (`OCFSV2` for the superblock) |
//! | 0x08 | disk lock |
//! | 0x38 | `generation` u32 |
//! | 0x3C | `suballoc_node` u16 |
//! | 0x3E | `suballoc_bit` u16 |
//! | 0x40 | `blkno` u64 |
//! | 0x48 | `size` u64 |
//! | 0x50 | `clusters` u32 |
//! | 0x54 | `flags` u32 |
//! | 0x58 | `mode` u16 |
//! | 0x5A | `links_count` u16 |
//! | 0x60 | `last_eb_blk` u64 |
//! | 0x68 | `bitmap_used` u32 |
//! | 0x6C | `bitmap_total` u32 |
//! | 0x70 | `ctime` u64 |
//! | 0x78 | `mtime` u64 |
//! | 0xC0 | `id2` |

use crate::chain::ChainList;
use crate::extent::ExtentList;
use crate::lock::DiskLock;
use bitflags::bitflags;
use cfs_types::{
    ParseError, ensure_slice, expect_signature, nul_padded, read_fixed, read_le_u16,
    read_le_u32, read_le_u64, trim_nul_padded, usize_to_u16, write_fixed, write_le_u16,
    write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

pub const INODE_SIGNATURE: &str = "INODE01";
pub const SUPERBLOCK_SIGNATURE: &str = "OCFSV2";
pub const DINODE_ID2_OFFSET: usize = 0xC0;

pub const MAX_VOL_LABEL_LEN: usize = 64;
pub const VOL_UUID_LEN: usize = 16;

pub const S_IFDIR: u16 = 0o040_000;
pub const S_IFREG: u16 = 0o100_000;

pub const MAJOR_REV_LEVEL: u16 = 2;
pub const MINOR_REV_LEVEL: u16 = 0;

bitflags! {
    /// `i_flags` of a dinode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct InodeFlags: u32 {
        const VALID       = 0x0001;
        const UNUSED2     = 0x0002;
        const ORPHANED    = 0x0004;
        const UNUSED3     = 0x0008;
        const SYSTEM      = 0x0010;
        const SUPER_BLOCK = 0x0020;
        const LOCAL_ALLOC = 0x0040;
        const BITMAP      = 0x0080;
        const JOURNAL     = 0x0100;
        const HEARTBEAT   = 0x0200;
        const CHAIN       = 0x0400;
        const DLM         = 0x0800;
    }
}

/// Superblock fields (the `id2` body of the superblock dinode).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperblockInfo {
    pub major_rev_level: u16,
    pub minor_rev_level: u16,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub state: u16,
    pub errors: u16,
    pub checkinterval: u32,
    pub lastcheck: u64,
    pub creator_os: u32,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub root_blkno: u64,
    pub system_dir_blkno: u64,
    pub blocksize_bits: u32,
    pub clustersize_bits: u32,
    pub max_nodes: u16,
    pub first_cluster_group: u64,
    pub label: String,
    pub uuid: [u8; VOL_UUID_LEN],
}

impl SuperblockInfo {
    fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            major_rev_level: read_le_u16(bytes, 0x00)?,
            minor_rev_level: read_le_u16(bytes, 0x02)?,
            mnt_count: read_le_u16(bytes, 0x04)?,
            max_mnt_count: read_le_u16(bytes, 0x06)?,
            state: read_le_u16(bytes, 0x08)?,
            errors: read_le_u16(bytes, 0x0A)?,
            checkinterval: read_le_u32(bytes, 0x0C)?,
            lastcheck: read_le_u64(bytes, 0x10)?,
            creator_os: read_le_u32(bytes, 0x18)?,
            feature_compat: read_le_u32(bytes, 0x1C)?,
            feature_incompat: read_le_u32(bytes, 0x20)?,
            feature_ro_compat: read_le_u32(bytes, 0x24)?,
            root_blkno: read_le_u64(bytes, 0x28)?,
            system_dir_blkno: read_le_u64(bytes, 0x30)?,
            blocksize_bits: read_le_u32(bytes, 0x38)?,
            clustersize_bits: read_le_u32(bytes, 0x3C)?,
            max_nodes: read_le_u16(bytes, 0x40)?,
            first_cluster_group: read_le_u64(bytes, 0x48)?,
            label: trim_nul_padded(ensure_slice(bytes, 0x50, MAX_VOL_LABEL_LEN)?),
            uuid: read_fixed(bytes, 0x90)?,
        })
    }

    fn write(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        write_le_u16(buf, 0x00, self.major_rev_level)?;
        write_le_u16(buf, 0x02, self.minor_rev_level)?;
        write_le_u16(buf, 0x04, self.mnt_count)?;
        write_le_u16(buf, 0x06, self.max_mnt_count)?;
        write_le_u16(buf, 0x08, self.state)?;
        write_le_u16(buf, 0x0A, self.errors)?;
        write_le_u32(buf, 0x0C, self.checkinterval)?;
        write_le_u64(buf, 0x10, self.lastcheck)?;
        write_le_u32(buf, 0x18, self.creator_os)?;
        write_le_u32(buf, 0x1C, self.feature_compat)?;
        write_le_u32(buf, 0x20, self.feature_incompat)?;
        write_le_u32(buf, 0x24, self.feature_ro_compat)?;
        write_le_u64(buf, 0x28, self.root_blkno)?;
        write_le_u64(buf, 0x30, self.system_dir_blkno)?;
        write_le_u32(buf, 0x38, self.blocksize_bits)?;
        write_le_u32(buf, 0x3C, self.clustersize_bits)?;
        write_le_u16(buf, 0x40, self.max_nodes)?;
        write_le_u64(buf, 0x48, self.first_cluster_group)?;
        let label: [u8; MAX_VOL_LABEL_LEN] = nul_padded(self.label.as_bytes());
        write_fixed(buf, 0x50, &label)?;
        write_fixed(buf, 0x90, &self.uuid)
    }
}

/// Header of a node-local allocation window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAllocHeader {
    /// First cluster of the window in the global bitmap.
    pub bm_off: u32,
    /// Bitmap bytes; always the full capacity of the `id2` region.
    pub size: u16,
    pub bitmap: Vec<u8>,
}

impl LocalAllocHeader {
    const BITMAP_OFFSET: usize = 0x10;

    /// Empty window sized to fill the `id2` region of a `block_size` dinode.
    pub fn empty(block_size: usize) -> Result<Self, ParseError> {
        let bytes = Dinode::id2_len(block_size).saturating_sub(Self::BITMAP_OFFSET);
        Ok(Self {
            bm_off: 0,
            size: usize_to_u16(bytes, "la_size")?,
            bitmap: vec![0_u8; bytes],
        })
    }

    fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let size = read_le_u16(bytes, 0x04)?;
        Ok(Self {
            bm_off: read_le_u32(bytes, 0x00)?,
            size,
            bitmap: ensure_slice(bytes, Self::BITMAP_OFFSET, usize::from(size))?.to_vec(),
        })
    }

    fn write(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        if self.bitmap.len() != usize::from(self.size) {
            return Err(ParseError::InvalidField {
                field: "la_size",
                reason: "does not match bitmap length",
            });
        }
        write_le_u32(buf, 0x00, self.bm_off)?;
        write_le_u16(buf, 0x04, self.size)?;
        write_fixed(buf, Self::BITMAP_OFFSET, &self.bitmap)
    }
}

/// The `id2` union, selected by the dinode flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DinodeBody {
    Super(SuperblockInfo),
    LocalAlloc(LocalAllocHeader),
    Chain(ChainList),
    Extents(ExtentList),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dinode {
    pub lock: DiskLock,
    pub generation: u32,
    pub suballoc_node: u16,
    pub suballoc_bit: u16,
    pub blkno: u64,
    pub size: u64,
    pub clusters: u32,
    pub flags: InodeFlags,
    pub mode: u16,
    pub links_count: u16,
    pub last_eb_blk: u64,
    pub bitmap_used: u32,
    pub bitmap_total: u32,
    pub ctime: u64,
    pub mtime: u64,
    pub body: DinodeBody,
}

impl Dinode {
    /// Bytes available to the `id2` union.
    #[must_use]
    pub fn id2_len(block_size: usize) -> usize {
        block_size.saturating_sub(DINODE_ID2_OFFSET)
    }

    /// Record capacity of an inline extent list.
    pub fn extent_list_capacity(block_size: usize) -> Result<u16, ParseError> {
        usize_to_u16(ExtentList::capacity_for(Self::id2_len(block_size)), "l_count")
    }

    /// Record capacity of an inline chain list.
    pub fn chain_list_capacity(block_size: usize) -> Result<u16, ParseError> {
        usize_to_u16(ChainList::capacity_for(Self::id2_len(block_size)), "cl_count")
    }

    /// Minimal valid dinode with zeroed counters.
    #[must_use]
    pub fn new(blkno: u64, flags: InodeFlags, mode: u16, body: DinodeBody) -> Self {
        Self {
            lock: DiskLock::default(),
            generation: 0,
            suballoc_node: 0,
            suballoc_bit: 0,
            blkno,
            size: 0,
            clusters: 0,
            flags,
            mode,
            links_count: 1,
            last_eb_blk: 0,
            bitmap_used: 0,
            bitmap_total: 0,
            ctime: 0,
            mtime: 0,
            body,
        }
    }

    #[must_use]
    pub fn is_superblock(&self) -> bool {
        self.flags.contains(InodeFlags::SUPER_BLOCK)
    }

    #[must_use]
    pub fn superblock(&self) -> Option<&SuperblockInfo> {
        match &self.body {
            DinodeBody::Super(sb) => Some(sb),
            _ => None,
        }
    }

    #[must_use]
    pub fn extent_list(&self) -> Option<&ExtentList> {
        match &self.body {
            DinodeBody::Extents(list) => Some(list),
            _ => None,
        }
    }

    #[must_use]
    pub fn extent_list_mut(&mut self) -> Option<&mut ExtentList> {
        match &mut self.body {
            DinodeBody::Extents(list) => Some(list),
            _ => None,
        }
    }

    #[must_use]
    pub fn chain_list(&self) -> Option<&ChainList> {
        match &self.body {
            DinodeBody::Chain(list) => Some(list),
            _ => None,
        }
    }

    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let flags = InodeFlags::from_bits_retain(read_le_u32(block, 0x54)?);
        let is_super = flags.contains(InodeFlags::SUPER_BLOCK);
        expect_signature(
            block,
            0,
            if is_super {
                SUPERBLOCK_SIGNATURE
            } else {
                INODE_SIGNATURE
            },
        )?;
        if !flags.contains(InodeFlags::VALID) {
            return Err(ParseError::InvalidField {
                field: "i_flags",
                reason: "dinode not marked valid",
            });
        }

        let id2 = block
            .get(DINODE_ID2_OFFSET..)
            .ok_or(ParseError::InsufficientData {
                needed: DINODE_ID2_OFFSET,
                offset: 0,
                actual: block.len(),
            })?;
        let body = if is_super {
            DinodeBody::Super(SuperblockInfo::parse(id2)?)
        } else if flags.contains(InodeFlags::LOCAL_ALLOC) {
            DinodeBody::LocalAlloc(LocalAllocHeader::parse(id2)?)
        } else if flags.contains(InodeFlags::CHAIN) {
            DinodeBody::Chain(ChainList::parse(id2)?)
        } else {
            DinodeBody::Extents(ExtentList::parse(id2)?)
        };

        Ok(Self {
            lock: DiskLock::parse_from_block(block)?,
            generation: read_le_u32(block, 0x38)?,
            suballoc_node: read_le_u16(block, 0x3C)?,
            suballoc_bit: read_le_u16(block, 0x3E)?,
            blkno: read_le_u64(block, 0x40)?,
            size: read_le_u64(block, 0x48)?,
            clusters: read_le_u32(block, 0x50)?,
            flags,
            mode: read_le_u16(block, 0x58)?,
            links_count: read_le_u16(block, 0x5A)?,
            last_eb_blk: read_le_u64(block, 0x60)?,
            bitmap_used: read_le_u32(block, 0x68)?,
            bitmap_total: read_le_u32(block, 0x6C)?,
            ctime: read_le_u64(block, 0x70)?,
            mtime: read_le_u64(block, 0x78)?,
            body,
        })
    }

    /// Encode into a full block buffer.
    pub fn write(&self, block: &mut [u8]) -> Result<(), ParseError> {
        if block.len() <= DINODE_ID2_OFFSET {
            return Err(ParseError::InsufficientData {
                needed: DINODE_ID2_OFFSET + 1,
                offset: 0,
                actual: block.len(),
            });
        }
        block.fill(0);
        let signature = if self.is_superblock() {
            SUPERBLOCK_SIGNATURE
        } else {
            INODE_SIGNATURE
        };
        write_fixed(block, 0, signature.as_bytes())?;
        self.lock.write_to_block(block)?;
        write_le_u32(block, 0x38, self.generation)?;
        write_le_u16(block, 0x3C, self.suballoc_node)?;
        write_le_u16(block, 0x3E, self.suballoc_bit)?;
        write_le_u64(block, 0x40, self.blkno)?;
        write_le_u64(block, 0x48, self.size)?;
        write_le_u32(block, 0x50, self.clusters)?;
        write_le_u32(block, 0x54, self.flags.bits())?;
        write_le_u16(block, 0x58, self.mode)?;
        write_le_u16(block, 0x5A, self.links_count)?;
        write_le_u64(block, 0x60, self.last_eb_blk)?;
        write_le_u32(block, 0x68, self.bitmap_used)?;
        write_le_u32(block, 0x6C, self.bitmap_total)?;
        write_le_u64(block, 0x70, self.ctime)?;
        write_le_u64(block, 0x78, self.mtime)?;

        let id2 = &mut block[DINODE_ID2_OFFSET..];
        match &self.body {
            DinodeBody::Super(sb) => sb.write(id2),
            DinodeBody::LocalAlloc(la) => la.write(id2),
            DinodeBody::Chain(cl) => cl.write(id2),
            DinodeBody::Extents(el) => el.write(id2),
        }
    }
}
