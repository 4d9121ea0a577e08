//! Block layout of the coordination region.
//!
//! The region is one contiguous run of blocks. With `n = max_nodes`:
//!
//! | Region block | Content |
//! |--------------|---------|
//! | 0 | node config header |
//! | 1 | staging copy of the entry being registered |
//! | `2 .. 2+n` | node registry, one entry per slot |
//! | `2+n .. 6+n` | reserved config-lock blocks |
//! | `6+n .. 6+2n` | publish records |
//! | `6+2n .. 6+3n` | vote records |
//!
//! Every slot offset comes from [`DlmLayout`], whose `max_nodes` is checked
//! once at construction.

use cfs_error::{CfsError, Result};
use cfs_types::{BlockNumber, MAX_NODE_SLOTS, NodeSlot};
use serde::{Deserialize, Serialize};

const HEADER_BLOCKS: u64 = 2;
const CONFIG_LOCK_BLOCKS: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlmLayout {
    start: BlockNumber,
    max_nodes: u16,
}

impl DlmLayout {
    pub fn new(start: BlockNumber, max_nodes: u16) -> Result<Self> {
        if max_nodes == 0 || usize::from(max_nodes) > MAX_NODE_SLOTS {
            return Err(CfsError::InvalidGeometry(format!(
                "max_nodes {max_nodes} outside 1..={MAX_NODE_SLOTS}"
            )));
        }
        let layout = Self { start, max_nodes };
        start.checked_add(layout.region_blocks()).ok_or_else(|| {
            CfsError::InvalidGeometry(format!("coordination region at {start} overflows"))
        })?;
        Ok(layout)
    }

    /// Blocks occupied by a region for `max_nodes` slots.
    #[must_use]
    pub fn blocks_for(max_nodes: u16) -> u64 {
        HEADER_BLOCKS + CONFIG_LOCK_BLOCKS + 3 * u64::from(max_nodes)
    }

    #[must_use]
    pub fn start(&self) -> BlockNumber {
        self.start
    }

    #[must_use]
    pub fn max_nodes(&self) -> u16 {
        self.max_nodes
    }

    #[must_use]
    pub fn region_blocks(&self) -> u64 {
        Self::blocks_for(self.max_nodes)
    }

    /// Slots `0..max_nodes` in ascending order.
    pub fn slots(&self) -> impl Iterator<Item = NodeSlot> + use<> {
        (0..self.max_nodes).map(NodeSlot)
    }

    pub fn check_slot(&self, slot: NodeSlot) -> Result<()> {
        if slot.0 >= self.max_nodes {
            return Err(CfsError::InvalidGeometry(format!(
                "node slot {slot} beyond max_nodes {}",
                self.max_nodes
            )));
        }
        Ok(())
    }

    fn at(&self, offset: u64) -> BlockNumber {
        BlockNumber(self.start.0 + offset)
    }

    #[must_use]
    pub fn config_header(&self) -> BlockNumber {
        self.at(0)
    }

    #[must_use]
    pub fn staging(&self) -> BlockNumber {
        self.at(1)
    }

    /// Region-relative offset of the first registry block.
    #[must_use]
    pub fn registry_offset(&self) -> u64 {
        HEADER_BLOCKS
    }

    /// Region-relative offset of the first publish block.
    #[must_use]
    pub fn publish_offset(&self) -> u64 {
        HEADER_BLOCKS + CONFIG_LOCK_BLOCKS + u64::from(self.max_nodes)
    }

    /// Region-relative offset of the first vote block.
    #[must_use]
    pub fn vote_offset(&self) -> u64 {
        self.publish_offset() + u64::from(self.max_nodes)
    }

    /// Reserved config-lock blocks.
    #[must_use]
    pub fn config_lock_blocks(&self) -> std::ops::Range<u64> {
        let first = self.start.0 + HEADER_BLOCKS + u64::from(self.max_nodes);
        first..first + CONFIG_LOCK_BLOCKS
    }

    pub fn registry_block(&self, slot: NodeSlot) -> Result<BlockNumber> {
        self.check_slot(slot)?;
        Ok(self.at(self.registry_offset() + u64::from(slot.0)))
    }

    pub fn publish_block(&self, slot: NodeSlot) -> Result<BlockNumber> {
        self.check_slot(slot)?;
        Ok(self.at(self.publish_offset() + u64::from(slot.0)))
    }

    pub fn vote_block(&self, slot: NodeSlot) -> Result<BlockNumber> {
        self.check_slot(slot)?;
        Ok(self.at(self.vote_offset() + u64::from(slot.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_node_offsets() {
        let layout = DlmLayout::new(BlockNumber(0), 4).unwrap();
        assert_eq!(layout.registry_offset(), 2);
        assert_eq!(layout.publish_offset(), 10);
        assert_eq!(layout.vote_offset(), 14);
        assert_eq!(layout.region_blocks(), 18);
        assert_eq!(layout.config_lock_blocks(), 6..10);
    }

    #[test]
    fn slot_blocks_are_absolute() {
        let layout = DlmLayout::new(BlockNumber(100), 4).unwrap();
        assert_eq!(layout.registry_block(NodeSlot(3)).unwrap(), BlockNumber(105));
        assert_eq!(layout.publish_block(NodeSlot(0)).unwrap(), BlockNumber(110));
        assert_eq!(layout.vote_block(NodeSlot(2)).unwrap(), BlockNumber(116));
        assert!(layout.vote_block(NodeSlot(4)).is_err());
        assert_eq!(layout.slots().count(), 4);
    }

    #[test]
    fn slots_do_not_borrow_the_layout() {
        let mut layout = DlmLayout::new(BlockNumber(0), 3).unwrap();
        let slots = layout.slots();
        layout = DlmLayout::new(BlockNumber(50), 2).unwrap();
        assert_eq!(
            slots.collect::<Vec<_>>(),
            vec![NodeSlot(0), NodeSlot(1), NodeSlot(2)]
        );
        assert_eq!(layout.max_nodes(), 2);
    }

    #[test]
    fn max_nodes_bounds() {
        assert!(DlmLayout::new(BlockNumber(0), 0).is_err());
        assert!(DlmLayout::new(BlockNumber(0), 257).is_err());
        assert!(DlmLayout::new(BlockNumber(u64::MAX - 10), 4).is_err());
        assert_eq!(DlmLayout::new(BlockNumber(0), 256).unwrap().region_blocks(), 774);
    }
}
