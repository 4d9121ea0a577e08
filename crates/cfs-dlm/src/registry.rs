//! Node registry: one identity per slot.
//!
//! A slot is empty while its name is empty. A node is identified by its
//! name together with its GUID; re-registering the same node (for example
//! with a new address) overwrites the slot and bumps its `seq_num`, while a
//! different node is refused with `SlotOccupied`.
//!
//! Registration writes the new entry to the staging block first, then to
//! the slot, then updates the config header.

use crate::layout::DlmLayout;
use crate::{read_record, write_record};
use cfs_block::BlockDevice;
use cfs_error::{CfsError, Result};
use cfs_ondisk::dlm::{GUID_LEN, NODE_NAME_LEN};
use cfs_ondisk::{NodeConfigEntry, NodeConfigHeader};
use cfs_types::NodeSlot;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Who a node is and where it listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub name: String,
    pub guid: [u8; GUID_LEN],
    pub ipv4: Ipv4Addr,
    pub port: u16,
}

impl NodeIdentity {
    /// Whether `self` and `other` name the same node.
    #[must_use]
    pub fn same_node(&self, other: &Self) -> bool {
        self.name == other.name && self.guid == other.guid
    }

    fn from_entry(entry: &NodeConfigEntry) -> Self {
        Self {
            name: entry.name.clone(),
            guid: entry.guid,
            ipv4: entry.ipv4,
            port: entry.port,
        }
    }
}

pub struct NodeRegistry<'a> {
    dev: &'a dyn BlockDevice,
    layout: DlmLayout,
}

impl<'a> NodeRegistry<'a> {
    #[must_use]
    pub fn new(dev: &'a dyn BlockDevice, layout: DlmLayout) -> Self {
        Self { dev, layout }
    }

    pub fn header(&self) -> Result<NodeConfigHeader> {
        read_record(self.dev, self.layout.config_header(), NodeConfigHeader::parse)
    }

    /// Raw entry of `slot`, including its `seq_num`.
    pub fn entry(&self, slot: NodeSlot) -> Result<NodeConfigEntry> {
        read_record(self.dev, self.layout.registry_block(slot)?, NodeConfigEntry::parse)
    }

    /// Identity registered in `slot`, or `None` for an empty slot.
    pub fn lookup(&self, slot: NodeSlot) -> Result<Option<NodeIdentity>> {
        let entry = self.entry(slot)?;
        Ok((!entry.is_empty()).then(|| NodeIdentity::from_entry(&entry)))
    }

    /// Register `identity` in `slot`. Returns the slot's new `seq_num`.
    pub fn register(&self, slot: NodeSlot, identity: &NodeIdentity) -> Result<u64> {
        if identity.name.is_empty() || identity.name.len() > NODE_NAME_LEN {
            return Err(CfsError::Format(format!(
                "node name must be 1..={NODE_NAME_LEN} bytes"
            )));
        }
        let current = self.entry(slot)?;
        if !current.is_empty() && !NodeIdentity::from_entry(&current).same_node(identity) {
            debug!(
                slot = slot.0,
                holder = %current.name,
                candidate = %identity.name,
                "slot occupied"
            );
            return Err(CfsError::SlotOccupied { slot: slot.0 });
        }

        let entry = NodeConfigEntry {
            name: identity.name.clone(),
            guid: identity.guid,
            port: identity.port,
            ip_version: 4,
            ipv4: identity.ipv4,
            seq_num: current.seq_num + 1,
        };
        write_record(self.dev, self.layout.staging(), |b| entry.write(b))?;
        write_record(self.dev, self.layout.registry_block(slot)?, |b| entry.write(b))?;

        let mut header = self.header()?;
        header.num_nodes = u32::try_from(self.live_slots()?.len())
            .map_err(|_| CfsError::Format("node count overflows".into()))?;
        header.last_node = u32::from(slot.0);
        header.cfg_seq_num += 1;
        write_record(self.dev, self.layout.config_header(), |b| header.write(b))?;

        info!(
            slot = slot.0,
            name = %identity.name,
            seq_num = entry.seq_num,
            "registered node"
        );
        Ok(entry.seq_num)
    }

    /// Slots with a registered node, ascending.
    pub fn live_slots(&self) -> Result<Vec<NodeSlot>> {
        let mut live = Vec::new();
        for slot in self.layout.slots() {
            if !self.entry(slot)?.is_empty() {
                live.push(slot);
            }
        }
        Ok(live)
    }

    /// Every registered node with its slot.
    pub fn list(&self) -> Result<Vec<(NodeSlot, NodeIdentity)>> {
        let mut nodes = Vec::new();
        for slot in self.layout.slots() {
            if let Some(identity) = self.lookup(slot)? {
                nodes.push((slot, identity));
            }
        }
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{device, region};

    fn identity(name: &str, guid_byte: u8) -> NodeIdentity {
        NodeIdentity {
            name: name.into(),
            guid: [guid_byte; GUID_LEN],
            ipv4: Ipv4Addr::new(10, 0, 0, guid_byte),
            port: 7777,
        }
    }

    #[test]
    fn empty_slot_looks_up_as_none() {
        let dev = device(64);
        let layout = region(&dev, 4);
        let registry = NodeRegistry::new(&dev, layout);
        assert_eq!(registry.lookup(NodeSlot(2)).unwrap(), None);
        assert!(registry.live_slots().unwrap().is_empty());
        assert!(registry.lookup(NodeSlot(9)).is_err());
    }

    #[test]
    fn register_and_reregister_bump_seq() {
        let dev = device(64);
        let layout = region(&dev, 4);
        let registry = NodeRegistry::new(&dev, layout);

        assert_eq!(registry.register(NodeSlot(1), &identity("alpha", 1)).unwrap(), 1);
        let mut moved = identity("alpha", 1);
        moved.ipv4 = Ipv4Addr::new(192, 168, 1, 9);
        assert_eq!(registry.register(NodeSlot(1), &moved).unwrap(), 2);
        assert_eq!(registry.lookup(NodeSlot(1)).unwrap(), Some(moved));

        let header = registry.header().unwrap();
        assert_eq!(header.num_nodes, 1);
        assert_eq!(header.last_node, 1);
        assert_eq!(header.cfg_seq_num, 2);
    }

    #[test]
    fn different_node_is_refused() {
        let dev = device(64);
        let layout = region(&dev, 4);
        let registry = NodeRegistry::new(&dev, layout);
        registry.register(NodeSlot(0), &identity("alpha", 1)).unwrap();

        let err = registry.register(NodeSlot(0), &identity("beta", 2)).unwrap_err();
        assert!(matches!(err, CfsError::SlotOccupied { slot: 0 }));
        // same name, different guid is a different node
        let err = registry.register(NodeSlot(0), &identity("alpha", 3)).unwrap_err();
        assert!(matches!(err, CfsError::SlotOccupied { slot: 0 }));
        assert_eq!(registry.entry(NodeSlot(0)).unwrap().seq_num, 1);
    }

    #[test]
    fn list_reports_registered_nodes_in_slot_order() {
        let dev = device(64);
        let layout = region(&dev, 4);
        let registry = NodeRegistry::new(&dev, layout);
        registry.register(NodeSlot(3), &identity("gamma", 3)).unwrap();
        registry.register(NodeSlot(0), &identity("alpha", 1)).unwrap();
        let names: Vec<String> = registry
            .list()
            .unwrap()
            .into_iter()
            .map(|(_, id)| id.name)
            .collect();
        assert_eq!(names, vec!["alpha", "gamma"]);
        assert_eq!(registry.header().unwrap().num_nodes, 2);

        let staged = dev.read_block(layout.staging()).unwrap();
        assert_eq!(NodeConfigEntry::parse(staged.as_slice()).unwrap().name, "alpha");
    }

    #[test]
    fn name_length_validated() {
        let dev = device(64);
        let layout = region(&dev, 4);
        let registry = NodeRegistry::new(&dev, layout);
        assert!(matches!(
            registry.register(NodeSlot(0), &identity("", 1)),
            Err(CfsError::Format(_))
        ));
        let long = identity(&"n".repeat(33), 1);
        assert!(registry.register(NodeSlot(0), &long).is_err());
    }
}
