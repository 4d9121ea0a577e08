//! A mounted node slot.

use crate::Session;
use cfs_alloc::Reservation;
use cfs_dlm::{ClusterNode, VotePolicy};
use cfs_error::Result;
use cfs_ondisk::{DiskLock, LockLevel};
use cfs_types::{BlockNumber, LockId, NodeSlot};
use tracing::{debug, warn};

/// A node mounted on a [`Session`]'s volume.
///
/// Dropping it releases every lock it holds and publishes the node as
/// unmounted. Use [`leave`](Self::leave) to see errors from that step.
pub struct NodeSession<'s> {
    session: &'s Session,
    node: ClusterNode<'s>,
    policy: VotePolicy,
}

impl std::fmt::Debug for NodeSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSession")
            .field("slot", &self.node.slot())
            .field("mounted", &self.node.is_mounted())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<'s> NodeSession<'s> {
    pub(crate) fn mount(session: &'s Session, slot: NodeSlot, policy: VotePolicy) -> Result<Self> {
        let mut node = ClusterNode::new(session.device(), session.dlm_layout()?, slot)?;
        node.mount()?;
        Ok(Self {
            session,
            node,
            policy,
        })
    }

    #[must_use]
    pub fn slot(&self) -> NodeSlot {
        self.node.slot()
    }

    #[must_use]
    pub fn policy(&self) -> &VotePolicy {
        &self.policy
    }

    /// The protocol participant, for step-wise requests and voting.
    pub fn node(&mut self) -> &mut ClusterNode<'s> {
        &mut self.node
    }

    /// Answer open requests from other nodes.
    pub fn respond(&mut self) -> Result<usize> {
        self.node.respond()
    }

    /// Acquire `level` on the lock in `lock_block`, retrying per policy.
    pub fn lock(&mut self, lock_block: BlockNumber, level: LockLevel) -> Result<DiskLock> {
        self.node
            .request_lock_with_retry(lock_block, level, &self.policy)
    }

    pub fn unlock(&mut self, lock_block: BlockNumber) -> Result<DiskLock> {
        self.node.release_lock(lock_block)
    }

    /// Run `f` under an exclusive lock on `lock_block`. A lock taken here
    /// is released afterwards whether `f` succeeds or not.
    pub fn with_exclusive<T>(
        &mut self,
        lock_block: BlockNumber,
        f: impl FnOnce(&Session) -> Result<T>,
    ) -> Result<T> {
        let already = self.node.held_level(LockId::from(lock_block)) == Some(LockLevel::Exclusive);
        if !already {
            self.lock(lock_block, LockLevel::Exclusive)?;
        }
        let result = f(self.session);
        if !already {
            if let Err(err) = self.node.release_lock(lock_block) {
                if result.is_ok() {
                    return Err(err);
                }
                warn!(lock_block = lock_block.0, error = %err, "release after failure");
            }
        }
        result
    }

    /// Reserve `count` contiguous clusters from the global bitmap.
    pub fn allocate_clusters(&mut self, count: u32) -> Result<Reservation> {
        let bitmap_blkno = self.session.system_file("global_bitmap")?;
        let res = self.with_exclusive(bitmap_blkno, |session| {
            let mut bitmap = session.global_bitmap()?;
            let res = bitmap.reserve(count, None)?;
            bitmap.flush(session.device())?;
            Ok(res)
        })?;
        debug!(
            slot = self.slot().0,
            start = res.start_bit,
            len = res.len,
            "allocated clusters"
        );
        Ok(res)
    }

    /// Return clusters from an earlier [`allocate_clusters`](Self::allocate_clusters).
    pub fn free_clusters(&mut self, res: &Reservation) -> Result<()> {
        let bitmap_blkno = self.session.system_file("global_bitmap")?;
        self.with_exclusive(bitmap_blkno, |session| {
            let mut bitmap = session.global_bitmap()?;
            bitmap.release_reservation(res)?;
            bitmap.flush(session.device())?;
            Ok(())
        })
    }

    /// Unmount, reporting any failure.
    pub fn leave(mut self) -> Result<()> {
        self.node.unmount()
    }
}

impl Drop for NodeSession<'_> {
    fn drop(&mut self) {
        if self.node.is_mounted() {
            if let Err(err) = self.node.unmount() {
                warn!(slot = self.node.slot().0, error = %err, "unmount on drop failed");
            }
        }
    }
}
