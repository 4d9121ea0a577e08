//! Records of the coordination region: node config header, node registry
//! entries, publish records and vote records. Each occupies the start of
//! its own block.

use crate::lock::{DiskLock, LockLevel, NodeMap};
use bitflags::bitflags;
use cfs_types::{
    LockId, NodeSlot, ParseError, ensure_slice, expect_signature, nul_padded, read_fixed,
    read_le_u16, read_le_u32, read_le_u64, read_u8, trim_nul_padded, write_fixed, write_le_u16,
    write_le_u32, write_le_u64, write_u8,
};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

pub const NODE_CONFIG_SIGNATURE: &str = "NODECFG";
pub const NODE_CONFIG_VERSION: u32 = 1;
pub const NODE_NAME_LEN: usize = 32;
pub const GUID_LEN: usize = 32;

bitflags! {
    /// Flags carried above the level byte of a publish record's `vote_type`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct RequestFlags: u32 {
        const ACQUIRE       = 0x0100;
        const RELEASE       = 0x0200;
        const CHANGE_MASTER = 0x0400;
    }
}

bitflags! {
    /// `vote_type` of a vote record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct VoteFlags: u32 {
        /// The voter answered.
        const NODE   = 0x01;
        /// The voter holds a conflicting level on the lock.
        const IN_USE = 0x02;
        /// The voter has its own conflicting request in flight.
        const RETRY  = 0x04;
    }
}

/// Block 0 of the coordination region.
///
/// | Offset | Field |
/// |--------|-------|
/// | 0x00 | signature `NODECFG` |
/// | 0x08 | disk lock |
/// | 0x38 | `version` u32 |
/// | 0x3C | `num_nodes` u32 |
/// | 0x40 | `last_node` u32 |
/// | 0x48 | `cfg_seq_num` u64 |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfigHeader {
    pub lock: DiskLock,
    pub version: u32,
    pub num_nodes: u32,
    pub last_node: u32,
    pub cfg_seq_num: u64,
}

impl Default for NodeConfigHeader {
    fn default() -> Self {
        Self {
            lock: DiskLock::default(),
            version: NODE_CONFIG_VERSION,
            num_nodes: 0,
            last_node: 0,
            cfg_seq_num: 0,
        }
    }
}

impl NodeConfigHeader {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        expect_signature(block, 0, NODE_CONFIG_SIGNATURE)?;
        Ok(Self {
            lock: DiskLock::parse_from_block(block)?,
            version: read_le_u32(block, 0x38)?,
            num_nodes: read_le_u32(block, 0x3C)?,
            last_node: read_le_u32(block, 0x40)?,
            cfg_seq_num: read_le_u64(block, 0x48)?,
        })
    }

    pub fn write(&self, block: &mut [u8]) -> Result<(), ParseError> {
        block.fill(0);
        write_fixed(block, 0, NODE_CONFIG_SIGNATURE.as_bytes())?;
        self.lock.write_to_block(block)?;
        write_le_u32(block, 0x38, self.version)?;
        write_le_u32(block, 0x3C, self.num_nodes)?;
        write_le_u32(block, 0x40, self.last_node)?;
        write_le_u64(block, 0x48, self.cfg_seq_num)
    }
}

/// One node registry slot.
///
/// | Offset | Field |
/// |--------|-------|
/// | 0x00 | `name` [u8; 32] (empty = free slot) |
/// | 0x20 | `guid` [u8; 32] |
/// | 0x40 | `port` u16 |
/// | 0x42 | `ip_version` u16 |
/// | 0x44 | `ipv4` [u8; 4] |
/// | 0x48 | `seq_num` u64 |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfigEntry {
    pub name: String,
    pub guid: [u8; GUID_LEN],
    pub port: u16,
    pub ip_version: u16,
    pub ipv4: Ipv4Addr,
    pub seq_num: u64,
}

impl NodeConfigEntry {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            name: trim_nul_padded(ensure_slice(block, 0x00, NODE_NAME_LEN)?),
            guid: read_fixed(block, 0x20)?,
            port: read_le_u16(block, 0x40)?,
            ip_version: read_le_u16(block, 0x42)?,
            ipv4: Ipv4Addr::from(read_fixed::<4>(block, 0x44)?),
            seq_num: read_le_u64(block, 0x48)?,
        })
    }

    pub fn write(&self, block: &mut [u8]) -> Result<(), ParseError> {
        if self.name.len() > NODE_NAME_LEN {
            return Err(ParseError::InvalidField {
                field: "node_name",
                reason: "longer than 32 bytes",
            });
        }
        block.fill(0);
        let name: [u8; NODE_NAME_LEN] = nul_padded(self.name.as_bytes());
        write_fixed(block, 0x00, &name)?;
        write_fixed(block, 0x20, &self.guid)?;
        write_le_u16(block, 0x40, self.port)?;
        write_le_u16(block, 0x42, self.ip_version)?;
        write_fixed(block, 0x44, &self.ipv4.octets())?;
        write_le_u64(block, 0x48, self.seq_num)
    }
}

/// A node's announcement of its state and of any lock request it makes.
///
/// | Offset | Field |
/// |--------|-------|
/// | 0x00 | `time` u64 |
/// | 0x08 | `mounted` u8 |
/// | 0x09 | `vote` u8 |
/// | 0x0A | `dirty` u8 |
/// | 0x0C | `vote_type` u32 (level in bits 0-7, `RequestFlags` above) |
/// | 0x10 | `seq_num` u64 |
/// | 0x18 | `lock_id` u64 |
/// | 0x20 | `vote_map` [u32; 8] |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRecord {
    pub time: u64,
    pub mounted: bool,
    /// A vote is being requested.
    pub vote: bool,
    /// A request is in flight.
    pub dirty: bool,
    pub level: LockLevel,
    pub flags: RequestFlags,
    pub seq_num: u64,
    pub lock_id: LockId,
    /// Nodes asked to vote.
    pub vote_map: NodeMap,
}

impl Default for PublishRecord {
    fn default() -> Self {
        Self {
            time: 0,
            mounted: false,
            vote: false,
            dirty: false,
            level: LockLevel::NoLock,
            flags: RequestFlags::empty(),
            seq_num: 0,
            lock_id: LockId(0),
            vote_map: NodeMap::EMPTY,
        }
    }
}

impl PublishRecord {
    /// Whether this record asks other nodes to vote.
    #[must_use]
    pub fn is_request(&self) -> bool {
        self.dirty && self.vote
    }

    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let vote_type = read_le_u32(block, 0x0C)?;
        Ok(Self {
            time: read_le_u64(block, 0x00)?,
            mounted: read_u8(block, 0x08)? != 0,
            vote: read_u8(block, 0x09)? != 0,
            dirty: read_u8(block, 0x0A)? != 0,
            level: LockLevel::from_raw(vote_type.to_le_bytes()[0])?,
            flags: RequestFlags::from_bits_retain(vote_type & !0xFF),
            seq_num: read_le_u64(block, 0x10)?,
            lock_id: LockId(read_le_u64(block, 0x18)?),
            vote_map: NodeMap::parse(block, 0x20)?,
        })
    }

    pub fn write(&self, block: &mut [u8]) -> Result<(), ParseError> {
        block.fill(0);
        write_le_u64(block, 0x00, self.time)?;
        write_u8(block, 0x08, u8::from(self.mounted))?;
        write_u8(block, 0x09, u8::from(self.vote))?;
        write_u8(block, 0x0A, u8::from(self.dirty))?;
        write_le_u32(
            block,
            0x0C,
            u32::from(self.level.to_raw()) | (self.flags.bits() & !0xFF),
        )?;
        write_le_u64(block, 0x10, self.seq_num)?;
        write_le_u64(block, 0x18, self.lock_id.0)?;
        self.vote_map.write(block, 0x20)
    }
}

/// A node's answer to the request it most recently saw.
///
/// | Offset | Field |
/// |--------|-------|
/// | 0x00 | `voting_node` u16 |
/// | 0x02 | `open_handle` u8 (0 = negative vote) |
/// | 0x04 | `vote_type` u32 |
/// | 0x08 | `seq_num` u64 (the request's seq) |
/// | 0x10 | `lock_id` u64 |
/// | 0x18 | `requester` u16 |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub voting_node: Option<NodeSlot>,
    pub open_handle: bool,
    pub flags: VoteFlags,
    pub seq_num: u64,
    pub lock_id: LockId,
    pub requester: Option<NodeSlot>,
}

impl Default for VoteRecord {
    fn default() -> Self {
        Self {
            voting_node: None,
            open_handle: false,
            flags: VoteFlags::empty(),
            seq_num: 0,
            lock_id: LockId(0),
            requester: None,
        }
    }
}

impl VoteRecord {
    /// Whether this vote answers `requester`'s request `seq_num` on `lock_id`.
    #[must_use]
    pub fn answers(&self, requester: NodeSlot, lock_id: LockId, seq_num: u64) -> bool {
        self.requester == Some(requester) && self.lock_id == lock_id && self.seq_num == seq_num
    }

    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            voting_node: NodeSlot::from_raw(read_le_u16(block, 0x00)?),
            open_handle: read_u8(block, 0x02)? != 0,
            flags: VoteFlags::from_bits_retain(read_le_u32(block, 0x04)?),
            seq_num: read_le_u64(block, 0x08)?,
            lock_id: LockId(read_le_u64(block, 0x10)?),
            requester: NodeSlot::from_raw(read_le_u16(block, 0x18)?),
        })
    }

    pub fn write(&self, block: &mut [u8]) -> Result<(), ParseError> {
        block.fill(0);
        write_le_u16(block, 0x00, NodeSlot::to_raw(self.voting_node))?;
        write_u8(block, 0x02, u8::from(self.open_handle))?;
        write_le_u32(block, 0x04, self.flags.bits())?;
        write_le_u64(block, 0x08, self.seq_num)?;
        write_le_u64(block, 0x10, self.lock_id.0)?;
        write_le_u16(block, 0x18, NodeSlot::to_raw(self.requester))
    }
}
