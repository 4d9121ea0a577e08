//! Disk lock descriptor.
//!
//! Every lockable block carries one at [`DISK_LOCK_OFFSET`]:
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0x00 | `master` u16 (`0xFFFF` = none) |
//! | 0x02 | `level` u8 |
//! | 0x03 | reserved u8 |
//! | 0x04 | reserved u32 |
//! | 0x08 | `seq_num` u64 |
//! | 0x10 | `node_map` [u32; 8] |

use cfs_types::{
    DISK_LOCK_OFFSET, DISK_LOCK_SIZE, MAX_NODE_SLOTS, NodeSlot, ParseError, ensure_slice,
    read_le_u16, read_le_u32, read_le_u64, read_u8, write_fixed, write_le_u16, write_le_u32,
    write_le_u64, write_u8,
};
use serde::{Deserialize, Serialize};

const NODE_MAP_WORDS: usize = MAX_NODE_SLOTS / 32;

/// Requested or held lock level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LockLevel {
    NoLock,
    Shared,
    Exclusive,
}

impl LockLevel {
    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::NoLock),
            1 => Ok(Self::Shared),
            3 => Ok(Self::Exclusive),
            _ => Err(ParseError::InvalidField {
                field: "dl_level",
                reason: "unknown lock level",
            }),
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::NoLock => 0,
            Self::Shared => 1,
            Self::Exclusive => 3,
        }
    }

    /// Whether a holder at `self` and a holder at `other` may coexist.
    #[must_use]
    pub fn compatible_with(self, other: Self) -> bool {
        match (self, other) {
            (Self::NoLock, _) | (_, Self::NoLock) | (Self::Shared, Self::Shared) => true,
            (Self::Exclusive, _) | (_, Self::Exclusive) => false,
        }
    }
}

/// 256-bit set of node slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeMap([u32; NODE_MAP_WORDS]);

impl NodeMap {
    pub const EMPTY: Self = Self([0; NODE_MAP_WORDS]);

    #[must_use]
    pub fn single(slot: NodeSlot) -> Self {
        let mut map = Self::EMPTY;
        map.insert(slot);
        map
    }

    #[must_use]
    pub fn contains(&self, slot: NodeSlot) -> bool {
        let idx = slot.index();
        idx < MAX_NODE_SLOTS && self.0[idx / 32] & (1 << (idx % 32)) != 0
    }

    /// Set the bit for `slot`. Slots past 255 are ignored.
    pub fn insert(&mut self, slot: NodeSlot) {
        let idx = slot.index();
        if idx < MAX_NODE_SLOTS {
            self.0[idx / 32] |= 1 << (idx % 32);
        }
    }

    pub fn remove(&mut self, slot: NodeSlot) {
        let idx = slot.index();
        if idx < MAX_NODE_SLOTS {
            self.0[idx / 32] &= !(1 << (idx % 32));
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let mut out = *self;
        for (dst, src) in out.0.iter_mut().zip(other.0) {
            *dst |= src;
        }
        out
    }

    /// Set slots in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = NodeSlot> + '_ {
        (0..MAX_NODE_SLOTS).filter_map(move |idx| {
            let slot = NodeSlot(u16::try_from(idx).ok()?);
            self.contains(slot).then_some(slot)
        })
    }

    pub(crate) fn parse(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        let mut words = [0_u32; NODE_MAP_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = read_le_u32(bytes, offset + i * 4)?;
        }
        Ok(Self(words))
    }

    pub(crate) fn write(&self, buf: &mut [u8], offset: usize) -> Result<(), ParseError> {
        for (i, word) in self.0.iter().enumerate() {
            write_le_u32(buf, offset + i * 4, *word)?;
        }
        Ok(())
    }
}

/// Decoded disk lock descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskLock {
    pub master: Option<NodeSlot>,
    pub level: LockLevel,
    pub seq_num: u64,
    pub node_map: NodeMap,
}

impl Default for DiskLock {
    fn default() -> Self {
        Self {
            master: None,
            level: LockLevel::NoLock,
            seq_num: 0,
            node_map: NodeMap::EMPTY,
        }
    }
}

impl DiskLock {
    /// Decode a descriptor starting at `bytes[0]`.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, DISK_LOCK_SIZE)?;
        Ok(Self {
            master: NodeSlot::from_raw(read_le_u16(bytes, 0x00)?),
            level: LockLevel::from_raw(read_u8(bytes, 0x02)?)?,
            seq_num: read_le_u64(bytes, 0x08)?,
            node_map: NodeMap::parse(bytes, 0x10)?,
        })
    }

    /// Decode the descriptor embedded in a lockable block.
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        Self::parse(ensure_slice(block, DISK_LOCK_OFFSET, DISK_LOCK_SIZE)?)
    }

    /// Encode into `buf[0..48]`, zeroing the reserved bytes.
    pub fn write(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        write_fixed(buf, 0, &[0_u8; DISK_LOCK_SIZE])?;
        write_le_u16(buf, 0x00, NodeSlot::to_raw(self.master))?;
        write_u8(buf, 0x02, self.level.to_raw())?;
        write_le_u64(buf, 0x08, self.seq_num)?;
        self.node_map.write(buf, 0x10)
    }

    /// Encode in place inside a lockable block.
    pub fn write_to_block(&self, block: &mut [u8]) -> Result<(), ParseError> {
        let end = DISK_LOCK_OFFSET + DISK_LOCK_SIZE;
        if block.len() < end {
            return Err(ParseError::InsufficientData {
                needed: DISK_LOCK_SIZE,
                offset: DISK_LOCK_OFFSET,
                actual: block.len().saturating_sub(DISK_LOCK_OFFSET),
            });
        }
        self.write(&mut block[DISK_LOCK_OFFSET..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_lock_encodes_no_master() {
        let mut buf = [0xAA_u8; DISK_LOCK_SIZE];
        DiskLock::default().write(&mut buf).unwrap();
        assert_eq!(&buf[..2], &[0xFF, 0xFF]);
        assert_eq!(buf[2], 0);
        assert!(buf[3..].iter().all(|b| *b == 0));
    }

    #[test]
    fn lock_layout_matches_field_offsets() {
        let mut node_map = NodeMap::EMPTY;
        node_map.insert(NodeSlot(0));
        node_map.insert(NodeSlot(33));
        node_map.insert(NodeSlot(255));
        let lock = DiskLock {
            master: Some(NodeSlot(3)),
            level: LockLevel::Exclusive,
            seq_num: 0x0102_0304,
            node_map,
        };
        let mut block = vec![0_u8; 512];
        lock.write_to_block(&mut block).unwrap();

        assert_eq!(read_le_u16(&block, 0x08).unwrap(), 3);
        assert_eq!(block[0x0A], 3);
        assert_eq!(read_le_u64(&block, 0x10).unwrap(), 0x0102_0304);
        assert_eq!(read_le_u32(&block, 0x18).unwrap(), 1);
        assert_eq!(read_le_u32(&block, 0x1C).unwrap(), 2);
        assert_eq!(read_le_u32(&block, 0x34).unwrap(), 0x8000_0000);
        assert_eq!(DiskLock::parse_from_block(&block).unwrap(), lock);
    }

    #[test]
    fn unknown_level_rejected() {
        let mut buf = [0_u8; DISK_LOCK_SIZE];
        buf[2] = 2;
        assert!(DiskLock::parse(&buf).is_err());
    }

    #[test]
    fn truncated_block_rejected() {
        assert!(DiskLock::parse_from_block(&[0_u8; 40]).is_err());
        assert!(DiskLock::default().write_to_block(&mut [0_u8; 40]).is_err());
    }

    #[test]
    fn compatibility_table() {
        use LockLevel::{Exclusive, NoLock, Shared};
        assert!(Shared.compatible_with(Shared));
        assert!(NoLock.compatible_with(Exclusive));
        assert!(Exclusive.compatible_with(NoLock));
        assert!(!Shared.compatible_with(Exclusive));
        assert!(!Exclusive.compatible_with(Shared));
        assert!(!Exclusive.compatible_with(Exclusive));
    }

    #[test]
    fn node_map_set_operations() {
        let mut a = NodeMap::single(NodeSlot(1));
        a.insert(NodeSlot(40));
        let b = NodeMap::single(NodeSlot(2));
        let u = a.union(&b);
        assert_eq!(
            u.iter().collect::<Vec<_>>(),
            vec![NodeSlot(1), NodeSlot(2), NodeSlot(40)]
        );
        assert_eq!(u.len(), 3);
        a.remove(NodeSlot(1));
        a.remove(NodeSlot(40));
        assert!(a.is_empty());
        assert!(!NodeMap::EMPTY.contains(NodeSlot(300)));
    }
}
