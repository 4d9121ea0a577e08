//! Lock descriptor state machine.
//!
//! The descriptor on disk only ever shows `Unlocked` or `Granted`.
//! `Negotiating` exists while a request is in flight and is reported by
//! [`LockRequest::state`](crate::LockRequest::state); it is never written.
//!
//! Transitions are computed here and applied by the protocol. Each one
//! bumps `seq_num` exactly once.

use cfs_ondisk::{DiskLock, LockLevel, NodeMap};
use cfs_types::NodeSlot;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    Unlocked,
    Granted {
        level: LockLevel,
        master: NodeSlot,
    },
    Negotiating {
        level: LockLevel,
        candidate: NodeSlot,
    },
}

impl LockState {
    /// State shown by a descriptor.
    #[must_use]
    pub fn of(lock: &DiskLock) -> Self {
        match (lock.level, lock.master) {
            (LockLevel::NoLock, _) | (_, None) => Self::Unlocked,
            (level, Some(master)) => Self::Granted { level, master },
        }
    }

    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        matches!(self, Self::Unlocked)
    }
}

/// Slot of a holder other than `node` whose level conflicts with `level`.
#[must_use]
pub fn conflicting_holder(lock: &DiskLock, node: NodeSlot, level: LockLevel) -> Option<NodeSlot> {
    if lock.level.compatible_with(level) {
        return None;
    }
    lock.node_map
        .iter()
        .find(|&holder| holder != node)
        .or(lock.master.filter(|&m| m != node))
}

/// Descriptor after `node` is granted `level`.
///
/// Exclusive holders are alone in `node_map`; a shared grant joins any
/// existing shared holders.
#[must_use]
pub(crate) fn grant(lock: &DiskLock, node: NodeSlot, level: LockLevel) -> DiskLock {
    let node_map = match (lock.level, level) {
        (LockLevel::Shared, LockLevel::Shared) => lock.node_map.union(&NodeMap::single(node)),
        _ => NodeMap::single(node),
    };
    DiskLock {
        master: Some(node),
        level,
        seq_num: lock.seq_num + 1,
        node_map,
    }
}

/// Descriptor after `node` drops its hold.
///
/// The lowest remaining holder becomes master; with none left the lock
/// returns to `Unlocked`.
#[must_use]
pub(crate) fn release(lock: &DiskLock, node: NodeSlot) -> DiskLock {
    let mut node_map = lock.node_map;
    node_map.remove(node);
    let master = if lock.master == Some(node) {
        node_map.iter().next()
    } else {
        lock.master
    };
    match master {
        Some(master) if !node_map.is_empty() => DiskLock {
            master: Some(master),
            level: lock.level,
            seq_num: lock.seq_num + 1,
            node_map,
        },
        _ => DiskLock {
            master: None,
            level: LockLevel::NoLock,
            seq_num: lock.seq_num + 1,
            node_map: NodeMap::EMPTY,
        },
    }
}
