//! Publish/vote lock negotiation.
//!
//! # Requester side
//!
//! 1. [`ClusterNode::publish_request`] bumps the node's own `seq_num` and
//!    writes a dirty publish record naming the lock, the level and the
//!    nodes asked to vote (every registered, mounted node but itself).
//! 2. [`ClusterNode::poll_votes`] reads the voters' vote blocks. Only votes
//!    tagged with this request's `seq_num` count; older ones are logged and
//!    discarded. A voter whose publish record shows it unmounted is dropped.
//!    Voters already counted are read again, and a vote turned negative
//!    for the same request rejects it.
//! 3. On unanimity [`ClusterNode::commit`] writes the descriptor; on any
//!    negative vote [`ClusterNode::abort`] clears the dirty flag.
//!
//! [`ClusterNode::request_lock`] drives those steps against a
//! [`VotePolicy`]. No answer by the deadline is `ProtocolTimeout`, never a
//! vote.
//!
//! # Voter side
//!
//! [`ClusterNode::respond`] scans every publish slot. A node has one vote
//! block, so when several requests are open it answers them in rotation,
//! one per call; requesters accumulate the positive votes they have seen.
//!
//! A vote is negative when the voter holds or has open a conflicting level
//! on the lock (`IN_USE`), or when it has its own conflicting request in
//! flight for the same lock and a lower slot than the requester (`RETRY`).
//!
//! A node that has voted for a request which is still open does not publish
//! a conflicting request of its own on that lock: it answers `LockDenied`
//! naming the requester until the request is committed or withdrawn.

use crate::layout::DlmLayout;
use crate::registry::NodeRegistry;
use crate::state::{self, LockState, conflicting_holder};
use crate::{PublishBoard, read_record, write_record};
use cfs_block::{BlockBuf, BlockDevice};
use cfs_error::{CfsError, Result};
use cfs_ondisk::{
    DiskLock, LockLevel, NodeMap, ParseResultExt, PublishRecord, RequestFlags, VoteFlags,
    VoteRecord,
};
use cfs_types::{BlockNumber, LockId, NodeSlot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, trace, warn};

// ── Policy ──────────────────────────────────────────────────────────────────

/// Deadline and retry policy for lock requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VotePolicy {
    /// How long one request waits for every vote.
    pub timeout: Duration,
    /// Sleep between polls of the vote blocks.
    pub poll_interval: Duration,
    /// Delay before the first retry; doubled for each further retry.
    pub backoff_base: Duration,
    pub max_retries: u32,
}

impl Default for VotePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
            backoff_base: Duration::from_millis(50),
            max_retries: 5,
        }
    }
}

impl VotePolicy {
    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(1_u32 << attempt.min(16))
    }
}

// ── Requests ────────────────────────────────────────────────────────────────

/// Outcome of one poll of the vote blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteTally {
    /// Every remaining voter answered positively.
    Granted,
    /// `voter` answered negatively.
    Rejected { voter: NodeSlot, flags: VoteFlags },
    /// Some voters have not answered this request yet.
    Pending,
}

/// An in-flight request published by one node.
#[derive(Debug, Clone)]
pub struct LockRequest {
    lock_block: BlockNumber,
    lock_id: LockId,
    level: LockLevel,
    requester: NodeSlot,
    seq_num: u64,
    voters: NodeMap,
    granted: NodeMap,
    stale_logged: NodeMap,
    published_at: Instant,
}

impl LockRequest {
    #[must_use]
    pub fn lock_block(&self) -> BlockNumber {
        self.lock_block
    }

    #[must_use]
    pub fn lock_id(&self) -> LockId {
        self.lock_id
    }

    #[must_use]
    pub fn level(&self) -> LockLevel {
        self.level
    }

    #[must_use]
    pub fn seq_num(&self) -> u64 {
        self.seq_num
    }

    /// Nodes still expected to vote.
    #[must_use]
    pub fn voters(&self) -> NodeMap {
        self.voters
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.published_at.elapsed()
    }

    /// Lock state as seen by the requester while this request is open.
    #[must_use]
    pub fn state(&self) -> LockState {
        LockState::Negotiating {
            level: self.level,
            candidate: self.requester,
        }
    }

    fn outstanding(&self) -> impl Iterator<Item = NodeSlot> + '_ {
        self.voters.iter().filter(|v| !self.granted.contains(*v))
    }

    fn is_unanimous(&self) -> bool {
        self.outstanding().next().is_none()
    }
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    lock_id: LockId,
    level: LockLevel,
}

/// A positive vote given to another node's request.
#[derive(Debug, Clone, Copy)]
struct Promise {
    lock_id: LockId,
    level: LockLevel,
    seq_num: u64,
}

// ── Node ────────────────────────────────────────────────────────────────────

/// One node's view of the coordination region.
///
/// A node writes only its own publish and vote blocks and the descriptors
/// of locks it commits or releases.
pub struct ClusterNode<'a> {
    dev: &'a dyn BlockDevice,
    layout: DlmLayout,
    slot: NodeSlot,
    mounted: bool,
    seq_num: u64,
    held: BTreeMap<LockId, (BlockNumber, LockLevel)>,
    open: BTreeMap<LockId, LockLevel>,
    in_flight: Option<InFlight>,
    last_vote: Option<VoteRecord>,
    promised: BTreeMap<NodeSlot, Promise>,
    rotation: u16,
    board: PublishBoard,
}

impl<'a> ClusterNode<'a> {
    pub fn new(dev: &'a dyn BlockDevice, layout: DlmLayout, slot: NodeSlot) -> Result<Self> {
        layout.check_slot(slot)?;
        Ok(Self {
            dev,
            layout,
            slot,
            mounted: false,
            seq_num: 0,
            held: BTreeMap::new(),
            open: BTreeMap::new(),
            in_flight: None,
            last_vote: None,
            promised: BTreeMap::new(),
            rotation: 0,
            board: PublishBoard::new(),
        })
    }

    #[must_use]
    pub fn slot(&self) -> NodeSlot {
        self.slot
    }

    #[must_use]
    pub fn layout(&self) -> DlmLayout {
        self.layout
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    #[must_use]
    pub fn board(&self) -> &PublishBoard {
        &self.board
    }

    /// Level this node has committed on `lock_id`, if any.
    #[must_use]
    pub fn held_level(&self, lock_id: LockId) -> Option<LockLevel> {
        self.held.get(&lock_id).map(|(_, level)| *level)
    }

    /// Announce the node as mounted. The slot must be registered.
    pub fn mount(&mut self) -> Result<()> {
        if NodeRegistry::new(self.dev, self.layout)
            .lookup(self.slot)?
            .is_none()
        {
            return Err(CfsError::NotRegistered);
        }
        let current = self.read_publish(self.slot)?;
        self.seq_num = current.seq_num;
        self.write_publish(PublishRecord {
            time: now_secs(),
            mounted: true,
            seq_num: self.seq_num,
            ..PublishRecord::default()
        })?;
        self.mounted = true;
        info!(slot = self.slot.0, seq_num = self.seq_num, "node mounted");
        Ok(())
    }

    /// Release every held lock and announce the node as unmounted.
    pub fn unmount(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        let blocks: Vec<BlockNumber> = self.held.values().map(|(block, _)| *block).collect();
        for block in blocks {
            self.release_lock(block)?;
        }
        self.open.clear();
        self.in_flight = None;
        self.promised.clear();
        self.write_publish(PublishRecord {
            time: now_secs(),
            seq_num: self.seq_num,
            ..PublishRecord::default()
        })?;
        self.mounted = false;
        info!(slot = self.slot.0, "node unmounted");
        Ok(())
    }

    /// Record local use of `lock_id` at `level`. Until dropped, this node
    /// votes against conflicting requests.
    pub fn hold_open(&mut self, lock_id: LockId, level: LockLevel) {
        self.open.insert(lock_id, level);
    }

    pub fn drop_open(&mut self, lock_id: LockId) {
        self.open.remove(&lock_id);
    }

    /// Current descriptor of the lock embedded in `lock_block`.
    pub fn lock_descriptor(&self, lock_block: BlockNumber) -> Result<DiskLock> {
        Ok(self.read_descriptor(lock_block)?.1)
    }

    pub fn lock_state(&self, lock_block: BlockNumber) -> Result<LockState> {
        Ok(LockState::of(&self.lock_descriptor(lock_block)?))
    }

    // ── Requester ───────────────────────────────────────────────────────

    /// Publish a request for `level` on the lock in `lock_block`.
    pub fn publish_request(
        &mut self,
        lock_block: BlockNumber,
        level: LockLevel,
    ) -> Result<LockRequest> {
        self.require_mounted()?;
        if level == LockLevel::NoLock {
            return Err(CfsError::Format("cannot request NoLock".into()));
        }
        if let Some(open) = self.in_flight {
            return Err(CfsError::Format(format!(
                "node {} already has a request for lock {} in flight",
                self.slot, open.lock_id
            )));
        }

        let lock_id = LockId::from(lock_block);
        self.yield_to_promised(lock_id, level)?;

        let mut voters = NodeMap::EMPTY;
        for slot in NodeRegistry::new(self.dev, self.layout).live_slots()? {
            if slot != self.slot && self.read_publish(slot)?.mounted {
                voters.insert(slot);
            }
        }

        self.seq_num += 1;
        self.write_publish(PublishRecord {
            time: now_secs(),
            mounted: true,
            vote: true,
            dirty: true,
            level,
            flags: RequestFlags::ACQUIRE,
            seq_num: self.seq_num,
            lock_id,
            vote_map: voters,
        })?;
        self.in_flight = Some(InFlight { lock_id, level });
        debug!(
            slot = self.slot.0,
            lock_id = %lock_id,
            ?level,
            seq_num = self.seq_num,
            voters = voters.len(),
            "published lock request"
        );
        Ok(LockRequest {
            lock_block,
            lock_id,
            level,
            requester: self.slot,
            seq_num: self.seq_num,
            voters,
            granted: NodeMap::EMPTY,
            stale_logged: NodeMap::EMPTY,
            published_at: Instant::now(),
        })
    }

    /// Fail with `LockDenied` while a request this node voted for is still
    /// open and conflicts with `level` on `lock_id`. Promises whose request
    /// has since closed are forgotten.
    fn yield_to_promised(&mut self, lock_id: LockId, level: LockLevel) -> Result<()> {
        let promised: Vec<(NodeSlot, Promise)> =
            self.promised.iter().map(|(slot, p)| (*slot, *p)).collect();
        for (requester, promise) in promised {
            let current = self.read_publish(requester)?;
            let still_open =
                current.mounted && current.is_request() && current.seq_num == promise.seq_num;
            if !still_open {
                self.promised.remove(&requester);
                continue;
            }
            if promise.lock_id == lock_id && !promise.level.compatible_with(level) {
                debug!(
                    slot = self.slot.0,
                    lock_id = %lock_id,
                    requester = requester.0,
                    seq_num = promise.seq_num,
                    "yielding to a request this node voted for"
                );
                return Err(CfsError::LockDenied {
                    lock_id: lock_id.0,
                    node: requester.0,
                });
            }
        }
        Ok(())
    }

    /// Read the vote block of every voter once, including voters already
    /// counted.
    pub fn poll_votes(&mut self, req: &mut LockRequest) -> Result<VoteTally> {
        if req.requester != self.slot {
            return Err(CfsError::Format(format!(
                "request of node {} polled by node {}",
                req.requester, self.slot
            )));
        }
        let voters: Vec<NodeSlot> = req.voters.iter().collect();
        for voter in voters {
            if !self.read_publish(voter)?.mounted {
                debug!(voter = voter.0, lock_id = %req.lock_id, "voter unmounted, dropping");
                req.voters.remove(voter);
                continue;
            }
            let vote = read_record(self.dev, self.layout.vote_block(voter)?, VoteRecord::parse)?;
            if vote.answers(self.slot, req.lock_id, req.seq_num) {
                if !vote.open_handle {
                    req.granted.remove(voter);
                    debug!(
                        voter = voter.0,
                        lock_id = %req.lock_id,
                        seq_num = req.seq_num,
                        flags = ?vote.flags,
                        "negative vote"
                    );
                    return Ok(VoteTally::Rejected {
                        voter,
                        flags: vote.flags,
                    });
                }
                trace!(voter = voter.0, seq_num = req.seq_num, "positive vote");
                req.granted.insert(voter);
            } else if vote.requester == Some(self.slot)
                && vote.lock_id == req.lock_id
                && vote.seq_num < req.seq_num
                && !req.stale_logged.contains(voter)
            {
                debug!(
                    voter = voter.0,
                    lock_id = %req.lock_id,
                    vote_seq = vote.seq_num,
                    request_seq = req.seq_num,
                    "discarding stale vote"
                );
                req.stale_logged.insert(voter);
            }
        }
        Ok(if req.is_unanimous() {
            VoteTally::Granted
        } else {
            VoteTally::Pending
        })
    }

    /// Write the descriptor for a unanimously granted request.
    ///
    /// The descriptor is re-read first; if a conflicting holder appeared in
    /// the meantime the request is aborted and `LockDenied` returned.
    pub fn commit(&mut self, req: LockRequest) -> Result<DiskLock> {
        if !req.is_unanimous() {
            return Err(CfsError::Format(format!(
                "request seq {} on lock {} is not unanimous",
                req.seq_num, req.lock_id
            )));
        }
        let (buf, current) = self.read_descriptor(req.lock_block)?;
        if let Some(holder) = conflicting_holder(&current, self.slot, req.level) {
            let lock_id = req.lock_id;
            self.abort(req)?;
            return Err(CfsError::LockDenied {
                lock_id: lock_id.0,
                node: holder.0,
            });
        }
        let next = state::grant(&current, self.slot, req.level);
        self.write_descriptor(req.lock_block, buf, &next)?;
        self.clear_request()?;
        self.held.insert(req.lock_id, (req.lock_block, req.level));
        info!(
            slot = self.slot.0,
            lock_id = %req.lock_id,
            level = ?req.level,
            lock_seq = next.seq_num,
            holders = next.node_map.len(),
            "lock granted"
        );
        Ok(next)
    }

    /// Withdraw a request: the publish record stops asking for votes.
    pub fn abort(&mut self, req: LockRequest) -> Result<()> {
        self.clear_request()?;
        debug!(
            slot = self.slot.0,
            lock_id = %req.lock_id,
            seq_num = req.seq_num,
            "lock request aborted"
        );
        Ok(())
    }

    /// Stop tracking a request without touching the disk. The publish
    /// record stays dirty until the next publish supersedes it.
    pub fn abandon(&mut self, req: LockRequest) {
        self.in_flight = None;
        debug!(
            slot = self.slot.0,
            lock_id = %req.lock_id,
            seq_num = req.seq_num,
            "lock request abandoned"
        );
    }

    /// Acquire `level` on the lock in `lock_block`, answering other nodes'
    /// requests while waiting.
    pub fn request_lock(
        &mut self,
        lock_block: BlockNumber,
        level: LockLevel,
        policy: &VotePolicy,
    ) -> Result<DiskLock> {
        let lock_id = LockId::from(lock_block);
        let current = self.lock_descriptor(lock_block)?;
        if self.held_level(lock_id) == Some(level) {
            return Ok(current);
        }
        if let Some(holder) = conflicting_holder(&current, self.slot, level) {
            debug!(lock_id = %lock_id, holder = holder.0, "lock held by another node");
            return Err(CfsError::LockDenied {
                lock_id: lock_id.0,
                node: holder.0,
            });
        }

        let mut req = self.publish_request(lock_block, level)?;
        loop {
            self.respond()?;
            match self.poll_votes(&mut req)? {
                VoteTally::Granted => return self.commit(req),
                VoteTally::Rejected { voter, .. } => {
                    self.abort(req)?;
                    return Err(CfsError::LockDenied {
                        lock_id: lock_id.0,
                        node: voter.0,
                    });
                }
                VoteTally::Pending if req.elapsed() >= policy.timeout => {
                    let seq_num = req.seq_num;
                    warn!(
                        lock_id = %lock_id,
                        seq_num,
                        missing = req.outstanding().count(),
                        "lock request timed out"
                    );
                    self.abort(req)?;
                    return Err(CfsError::ProtocolTimeout {
                        lock_id: lock_id.0,
                        seq_num,
                    });
                }
                VoteTally::Pending => std::thread::sleep(policy.poll_interval),
            }
        }
    }

    /// [`request_lock`](Self::request_lock), retrying denials and timeouts
    /// with exponential backoff.
    pub fn request_lock_with_retry(
        &mut self,
        lock_block: BlockNumber,
        level: LockLevel,
        policy: &VotePolicy,
    ) -> Result<DiskLock> {
        let mut attempt = 0;
        loop {
            match self.request_lock(lock_block, level, policy) {
                Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                    let delay = policy.backoff(attempt);
                    debug!(attempt, ?delay, error = %err, "retrying lock request");
                    attempt += 1;
                    let deadline = Instant::now() + delay;
                    while Instant::now() < deadline {
                        self.respond()?;
                        std::thread::sleep(policy.poll_interval.min(delay));
                    }
                }
                other => return other,
            }
        }
    }

    /// Drop this node's hold on the lock in `lock_block`.
    pub fn release_lock(&mut self, lock_block: BlockNumber) -> Result<DiskLock> {
        let lock_id = LockId::from(lock_block);
        if !self.held.contains_key(&lock_id) {
            return Err(CfsError::NotFound(format!(
                "node {} holds no lock on {lock_id}",
                self.slot
            )));
        }
        let (buf, current) = self.read_descriptor(lock_block)?;
        let next = state::release(&current, self.slot);
        self.write_descriptor(lock_block, buf, &next)?;
        self.held.remove(&lock_id);

        self.seq_num += 1;
        self.write_publish(PublishRecord {
            time: now_secs(),
            mounted: true,
            flags: RequestFlags::RELEASE,
            seq_num: self.seq_num,
            lock_id,
            ..PublishRecord::default()
        })?;
        info!(
            slot = self.slot.0,
            lock_id = %lock_id,
            lock_seq = next.seq_num,
            "lock released"
        );
        Ok(next)
    }

    // ── Voter ───────────────────────────────────────────────────────────

    /// Answer at most one open request addressed to this node. Returns the
    /// number of open requests seen.
    pub fn respond(&mut self) -> Result<usize> {
        if !self.mounted {
            return Ok(0);
        }
        for slot in self.layout.slots() {
            if slot != self.slot {
                self.read_publish(slot)?;
            }
        }
        let open: Vec<(NodeSlot, PublishRecord)> = self
            .board
            .pending_requests()
            .filter(|(slot, rec)| *slot != self.slot && rec.vote_map.contains(self.slot))
            .map(|(slot, rec)| (slot, rec.clone()))
            .collect();
        if open.is_empty() {
            return Ok(0);
        }

        let pick = open
            .iter()
            .find(|(slot, _)| slot.0 >= self.rotation)
            .or_else(|| open.first());
        if let Some((requester, record)) = pick {
            self.rotation = requester.0.wrapping_add(1);
            let vote = self.vote_for(*requester, record);
            if vote.open_handle {
                self.promised.insert(
                    *requester,
                    Promise {
                        lock_id: record.lock_id,
                        level: record.level,
                        seq_num: record.seq_num,
                    },
                );
            } else {
                self.promised.remove(requester);
            }
            if self.last_vote.as_ref() != Some(&vote) {
                write_record(self.dev, self.layout.vote_block(self.slot)?, |b| vote.write(b))?;
                trace!(
                    voter = self.slot.0,
                    requester = requester.0,
                    lock_id = %record.lock_id,
                    seq_num = record.seq_num,
                    positive = vote.open_handle,
                    "wrote vote"
                );
                self.last_vote = Some(vote);
            }
        }
        Ok(open.len())
    }

    fn vote_for(&self, requester: NodeSlot, record: &PublishRecord) -> VoteRecord {
        let conflicts = |level: LockLevel| !level.compatible_with(record.level);
        let in_use = self
            .held_level(record.lock_id)
            .into_iter()
            .chain(self.open.get(&record.lock_id).copied())
            .any(conflicts);
        let retry = !in_use
            && self.slot < requester
            && self
                .in_flight
                .is_some_and(|own| own.lock_id == record.lock_id && conflicts(own.level));

        let mut flags = VoteFlags::NODE;
        if in_use {
            flags |= VoteFlags::IN_USE;
        }
        if retry {
            flags |= VoteFlags::RETRY;
        }
        VoteRecord {
            voting_node: Some(self.slot),
            open_handle: !(in_use || retry),
            flags,
            seq_num: record.seq_num,
            lock_id: record.lock_id,
            requester: Some(requester),
        }
    }

    // ── Disk access ─────────────────────────────────────────────────────

    fn require_mounted(&self) -> Result<()> {
        if self.mounted {
            Ok(())
        } else {
            Err(CfsError::Format(format!("node {} is not mounted", self.slot)))
        }
    }

    /// Read `slot`'s publish record through the board, so an older read
    /// never replaces a newer one.
    fn read_publish(&mut self, slot: NodeSlot) -> Result<PublishRecord> {
        let record = read_record(
            self.dev,
            self.layout.publish_block(slot)?,
            PublishRecord::parse,
        )?;
        self.board.observe(slot, record.clone());
        Ok(self.board.get(slot).cloned().unwrap_or(record))
    }

    fn write_publish(&mut self, record: PublishRecord) -> Result<()> {
        write_record(self.dev, self.layout.publish_block(self.slot)?, |b| {
            record.write(b)
        })?;
        self.board.observe(self.slot, record);
        Ok(())
    }

    fn clear_request(&mut self) -> Result<()> {
        self.in_flight = None;
        let mut record = self.read_publish(self.slot)?;
        record.dirty = false;
        record.vote = false;
        self.write_publish(record)
    }

    fn read_descriptor(&self, lock_block: BlockNumber) -> Result<(BlockBuf, DiskLock)> {
        let buf = self.dev.read_block(lock_block)?;
        let lock = DiskLock::parse_from_block(buf.as_slice()).at_block(lock_block.0)?;
        Ok((buf, lock))
    }

    fn write_descriptor(
        &self,
        lock_block: BlockNumber,
        mut buf: BlockBuf,
        lock: &DiskLock,
    ) -> Result<()> {
        lock.write_to_block(buf.as_mut_slice())
            .map_err(|e| CfsError::Format(format!("encoding lock at {lock_block}: {e}")))?;
        self.dev.write_block(lock_block, buf.as_slice())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
