//! Newest-wins view of the publish records.
//!
//! Reads of different slots are not atomic with respect to each other and
//! a slow read can return an older record than one already seen. The board
//! keeps, per slot, the record with the highest `seq_num` observed so far.

use cfs_ondisk::PublishRecord;
use cfs_types::{LockId, NodeSlot};
use std::collections::BTreeMap;
use tracing::trace;

#[derive(Debug, Clone, Default)]
pub struct PublishBoard {
    records: BTreeMap<NodeSlot, PublishRecord>,
}

impl PublishBoard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a freshly read record. Returns `false` if an equal or newer
    /// record for `slot` was already known, in which case it is ignored.
    pub fn observe(&mut self, slot: NodeSlot, record: PublishRecord) -> bool {
        match self.records.get(&slot) {
            Some(known) if known.seq_num > record.seq_num => {
                trace!(
                    slot = slot.0,
                    known = known.seq_num,
                    read = record.seq_num,
                    "ignoring older publish record"
                );
                false
            }
            Some(known) if known == &record => false,
            _ => {
                self.records.insert(slot, record);
                true
            }
        }
    }

    #[must_use]
    pub fn get(&self, slot: NodeSlot) -> Option<&PublishRecord> {
        self.records.get(&slot)
    }

    /// The authoritative record naming `lock_id`: highest `seq_num`, lowest
    /// slot on ties.
    #[must_use]
    pub fn latest_for(&self, lock_id: LockId) -> Option<(NodeSlot, &PublishRecord)> {
        self.records
            .iter()
            .filter(|(_, r)| r.lock_id == lock_id)
            .max_by(|(sa, a), (sb, b)| a.seq_num.cmp(&b.seq_num).then(sb.cmp(sa)))
            .map(|(slot, r)| (*slot, r))
    }

    /// Open requests of mounted nodes, in slot order.
    pub fn pending_requests(&self) -> impl Iterator<Item = (NodeSlot, &PublishRecord)> {
        self.records
            .iter()
            .filter(|(_, r)| r.mounted && r.is_request())
            .map(|(slot, r)| (*slot, r))
    }
}
