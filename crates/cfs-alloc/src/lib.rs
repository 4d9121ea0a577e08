#![forbid(unsafe_code)]
//! Chain allocator.
//!
//! A bitmap is split into groups; each group is one on-disk group
//! descriptor block whose bitmap tracks `chain_total` units. Groups are
//! linked into chains, and the owning dinode records one chain record per
//! chain. Groups live in an arena (`Vec<AllocGroup>`) and are linked by
//! index.
//!
//! ## Layers
//!
//! 1. **Bitmap**: raw bit manipulation on a group's bitmap bytes.
//! 2. **AllocBitmap**: reservation, release and growth over the arena,
//!    with counters maintained incrementally.
//! 3. **Persistence** ([`persist`]): load from a chain-list dinode and
//!    flush dirty descriptors back.
//!
//! Bits are global: group `g` owns `[first_bit, first_bit + chain_total)`.
//! Global numbers follow descriptor block order, which is also the order a
//! reload assigns, so every bit below `valid_bits` belongs to exactly one
//! group. A group grown below existing ones shifts the numbers above it; a
//! [`Reservation`] also names its group block and group-relative offset,
//! which never move.

pub mod persist;

use cfs_error::{CfsError, Result};
use cfs_ondisk::{Dinode, GroupDesc};
use cfs_types::{BlockNumber, BlockSize};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use tracing::{debug, trace, warn};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0_u32;

    for &byte in bitmap.iter().take(full_bytes) {
        free += byte.count_zeros();
    }

    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            if (byte >> bit) & 1 == 0 {
                free += 1;
            }
        }
    }

    free
}

/// First run of `n` free bits inside `[lo, hi)`.
fn find_run_in(bitmap: &[u8], lo: u32, hi: u32, n: u32) -> Option<u32> {
    let mut run_start = lo;
    let mut run_len = 0_u32;

    for idx in lo..hi {
        if bitmap_get(bitmap, idx) {
            run_start = idx + 1;
            run_len = 0;
        } else {
            run_len += 1;
            if run_len >= n {
                return Some(run_start);
            }
        }
    }
    None
}

/// Find `n` contiguous free bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_find_contiguous(bitmap: &[u8], count: u32, n: u32) -> Option<u32> {
    if n == 0 {
        return Some(0);
    }
    find_run_in(bitmap, 0, count, n)
}

/// Like [`bitmap_find_contiguous`], but prefers runs starting at or after
/// `start`; wraps to the beginning when none is found there. Runs never
/// wrap around the end.
#[must_use]
pub fn bitmap_find_contiguous_from(bitmap: &[u8], count: u32, n: u32, start: u32) -> Option<u32> {
    if n == 0 {
        return Some(start.min(count));
    }
    find_run_in(bitmap, start.min(count), count, n).or_else(|| {
        if start > 0 {
            find_run_in(bitmap, 0, count, n)
        } else {
            None
        }
    })
}

// ── Groups and chains ───────────────────────────────────────────────────────

/// A group to append to a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    /// Block holding the new group descriptor.
    pub blkno: BlockNumber,
    /// Units tracked by the group.
    pub bits: u16,
    /// Leading bits marked in use at creation (descriptor, leading space).
    pub reserved_prefix: u16,
}

/// A successful reservation of `len` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub chain: u16,
    /// Descriptor block of the group holding the run.
    pub group: BlockNumber,
    /// First bit of the run within its group.
    pub group_bit: u32,
    /// Global index of the first bit at reservation time.
    pub start_bit: u64,
    pub len: u32,
}

impl Reservation {
    #[must_use]
    pub fn end_bit(&self) -> u64 {
        self.start_bit + u64::from(self.len)
    }
}

/// In-memory view of one group descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocGroup {
    pub desc: GroupDesc,
    /// Global index of the group's bit 0.
    pub first_bit: u64,
    pub chain_total: u32,
    pub chain_free: u32,
    pub used_bits: u32,
    /// Next group of the same chain (arena index).
    pub next: Option<usize>,
    dirty: bool,
}

impl AllocGroup {
    #[must_use]
    pub fn blkno(&self) -> BlockNumber {
        BlockNumber(self.desc.blkno)
    }

    #[must_use]
    pub fn chain(&self) -> u16 {
        self.desc.chain
    }

    /// Group-relative index of global `bit`, if the group owns it.
    #[must_use]
    pub fn local_bit(&self, bit: u64) -> Option<u32> {
        let rel = bit.checked_sub(self.first_bit)?;
        u32::try_from(rel).ok().filter(|&r| r < self.chain_total)
    }

    #[must_use]
    pub fn is_set(&self, local: u32) -> bool {
        bitmap_get(&self.desc.bitmap, local)
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Head/tail of one chain plus its running totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    pub head: Option<usize>,
    pub tail: Option<usize>,
    pub total: u64,
    pub free: u64,
}

/// Supplies new groups to [`AllocBitmap::reserve_or_grow`].
pub trait GroupSource {
    /// A group of at least `min_bits` for `chain`, or `None` when the
    /// source is exhausted.
    fn next_group(&mut self, chain: u16, min_bits: u32) -> Result<Option<GroupSpec>>;
}

// ── AllocBitmap ─────────────────────────────────────────────────────────────

/// A chain-allocated bitmap: the global cluster bitmap or a suballocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocBitmap {
    name: String,
    block_size: BlockSize,
    unit: u32,
    unit_bits: u32,
    bits_per_group: u16,
    parent_dinode: BlockNumber,
    valid_bits: u64,
    groups: Vec<AllocGroup>,
    chains: Vec<Chain>,
}

impl AllocBitmap {
    /// Empty bitmap with `chain_count` chains and no groups.
    ///
    /// `unit` is the number of bytes one bit stands for: the block size for
    /// suballocators, the cluster size for the global bitmap.
    pub fn new(
        name: impl Into<String>,
        block_size: BlockSize,
        unit: u32,
        bits_per_group: u16,
        chain_count: u16,
        parent_dinode: BlockNumber,
    ) -> Result<Self> {
        if !unit.is_power_of_two() || unit < block_size.get() {
            return Err(CfsError::InvalidGeometry(format!(
                "allocation unit {unit} must be a power of two no smaller than block size {block_size}"
            )));
        }
        let max_bits = GroupDesc::max_bits(block_size.bytes())
            .map_err(|e| CfsError::InvalidGeometry(e.to_string()))?;
        if bits_per_group == 0 || bits_per_group > max_bits {
            return Err(CfsError::InvalidGeometry(format!(
                "bits per group {bits_per_group} outside 1..={max_bits}"
            )));
        }
        let max_chains = Dinode::chain_list_capacity(block_size.bytes())
            .map_err(|e| CfsError::InvalidGeometry(e.to_string()))?;
        if chain_count == 0 || chain_count > max_chains {
            return Err(CfsError::InvalidGeometry(format!(
                "chain count {chain_count} outside 1..={max_chains}"
            )));
        }
        Ok(Self {
            name: name.into(),
            block_size,
            unit,
            unit_bits: unit.trailing_zeros(),
            bits_per_group,
            parent_dinode,
            valid_bits: 0,
            groups: Vec::new(),
            chains: vec![Chain::default(); usize::from(chain_count)],
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    /// Bytes per bit.
    #[must_use]
    pub fn unit(&self) -> u32 {
        self.unit
    }

    /// `log2(unit)`.
    #[must_use]
    pub fn unit_bits(&self) -> u32 {
        self.unit_bits
    }

    #[must_use]
    pub fn blocks_per_unit(&self) -> u32 {
        self.unit >> self.block_size.shift()
    }

    #[must_use]
    pub fn bits_per_group(&self) -> u16 {
        self.bits_per_group
    }

    #[must_use]
    pub fn parent_dinode(&self) -> BlockNumber {
        self.parent_dinode
    }

    #[must_use]
    pub fn valid_bits(&self) -> u64 {
        self.valid_bits
    }

    #[must_use]
    pub fn free_bits(&self) -> u64 {
        self.chains.iter().map(|c| c.free).sum()
    }

    #[must_use]
    pub fn used_bits(&self) -> u64 {
        self.valid_bits - self.free_bits()
    }

    #[must_use]
    pub fn groups(&self) -> &[AllocGroup] {
        &self.groups
    }

    #[must_use]
    pub fn group(&self, idx: usize) -> Option<&AllocGroup> {
        self.groups.get(idx)
    }

    #[must_use]
    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    #[must_use]
    pub fn chain(&self, idx: u16) -> Option<&Chain> {
        self.chains.get(usize::from(idx))
    }

    /// Arena indices of `chain`'s groups in link order.
    pub fn chain_groups(&self, chain: u16) -> impl Iterator<Item = usize> + '_ {
        let mut cursor = self.chain(chain).and_then(|c| c.head);
        std::iter::from_fn(move || {
            let idx = cursor?;
            cursor = self.groups.get(idx).and_then(|g| g.next);
            Some(idx)
        })
    }

    /// Arena index of the group whose descriptor is at `blkno`.
    #[must_use]
    pub fn group_index(&self, blkno: BlockNumber) -> Option<usize> {
        self.groups
            .binary_search_by_key(&blkno.0, |g| g.desc.blkno)
            .ok()
    }

    /// Group owning global `bit`, with the group-relative offset.
    #[must_use]
    pub fn locate(&self, bit: u64) -> Option<(usize, u32)> {
        if bit >= self.valid_bits {
            return None;
        }
        let idx = self.groups.partition_point(|g| g.first_bit <= bit);
        let gidx = idx.checked_sub(1)?;
        let local = self.groups[gidx].local_bit(bit)?;
        Some((gidx, local))
    }

    /// Whether global `bit` is in use; `None` beyond `valid_bits`.
    #[must_use]
    pub fn is_set(&self, bit: u64) -> Option<bool> {
        let (gidx, local) = self.locate(bit)?;
        Some(self.groups[gidx].is_set(local))
    }

    /// Block holding group-relative unit `local` of group `gidx`, counting
    /// from the group descriptor block. Suballocators place their units
    /// this way.
    #[must_use]
    pub fn unit_block(&self, gidx: usize, local: u32) -> Option<BlockNumber> {
        let group = self.groups.get(gidx)?;
        group
            .blkno()
            .checked_add(u64::from(local) * u64::from(self.blocks_per_unit()))
    }

    /// Append a group to `chain`. The only operation that grows
    /// `valid_bits`. Returns the new group's arena index.
    ///
    /// The arena stays in descriptor block order: a group whose block is
    /// below existing groups is inserted among them and the global bits of
    /// every later group move up by `spec.bits`.
    pub fn grow_chain(&mut self, chain: u16, spec: GroupSpec) -> Result<usize> {
        let cidx = usize::from(chain);
        if cidx >= self.chains.len() {
            return Err(CfsError::Format(format!(
                "{}: chain {chain} out of range ({} chains)",
                self.name,
                self.chains.len()
            )));
        }
        if spec.bits == 0 || spec.bits > self.bits_per_group {
            return Err(CfsError::InvalidGeometry(format!(
                "{}: group of {} bits (limit {})",
                self.name, spec.bits, self.bits_per_group
            )));
        }
        if spec.reserved_prefix > spec.bits {
            return Err(CfsError::InvalidGeometry(format!(
                "{}: reserved prefix {} exceeds group size {}",
                self.name, spec.reserved_prefix, spec.bits
            )));
        }

        let mut desc = GroupDesc::new(
            self.block_size.bytes(),
            spec.bits,
            chain,
            spec.blkno.0,
            self.parent_dinode.0,
        )
        .map_err(|e| CfsError::InvalidGeometry(e.to_string()))?;
        for bit in 0..u32::from(spec.reserved_prefix) {
            bitmap_set(&mut desc.bitmap, bit);
        }
        desc.free_bits_count = spec.bits - spec.reserved_prefix;

        let idx = self.groups.partition_point(|g| g.desc.blkno < spec.blkno.0);
        if self.groups.get(idx).is_some_and(|g| g.desc.blkno == spec.blkno.0) {
            return Err(CfsError::Format(format!(
                "{}: block {} already holds a group",
                self.name, spec.blkno
            )));
        }
        let shifted = idx < self.groups.len();
        if shifted {
            let bump = |link: &mut Option<usize>| {
                if let Some(i) = link.as_mut().filter(|i| **i >= idx) {
                    *i += 1;
                }
            };
            for group in &mut self.groups {
                bump(&mut group.next);
            }
            for entry in &mut self.chains {
                bump(&mut entry.head);
                bump(&mut entry.tail);
            }
        }

        let total = u32::from(spec.bits);
        let used = u32::from(spec.reserved_prefix);
        self.groups.insert(
            idx,
            AllocGroup {
                desc,
                first_bit: 0,
                chain_total: total,
                chain_free: total - used,
                used_bits: used,
                next: None,
                dirty: true,
            },
        );
        let mut first_bit = 0_u64;
        for group in &mut self.groups {
            group.first_bit = first_bit;
            first_bit += u64::from(group.chain_total);
        }

        let entry = &mut self.chains[cidx];
        match entry.tail {
            Some(tail) => {
                let prev = &mut self.groups[tail];
                prev.next = Some(idx);
                prev.desc.next_group = spec.blkno.0;
                prev.dirty = true;
            }
            None => entry.head = Some(idx),
        }
        entry.tail = Some(idx);
        entry.total += u64::from(total);
        entry.free += u64::from(total - used);
        self.valid_bits += u64::from(total);

        debug!(
            bitmap = %self.name,
            chain,
            group = idx,
            blkno = spec.blkno.0,
            bits = spec.bits,
            reserved = spec.reserved_prefix,
            valid_bits = self.valid_bits,
            shifted,
            "grew chain"
        );
        Ok(idx)
    }

    /// Chains by descending free bits, lowest index first on ties.
    fn chain_order(&self) -> Vec<u16> {
        let mut order: Vec<u16> = (0..self.chains.len())
            .filter_map(|i| u16::try_from(i).ok())
            .collect();
        order.sort_by_key(|&c| (Reverse(self.chains[usize::from(c)].free), c));
        order
    }

    /// Reserve `count` contiguous bits inside a single group.
    ///
    /// `hint` is a global goal bit: its group is tried first, searching
    /// from the goal onward. Otherwise chains are tried by descending free
    /// bits and groups within a chain in link order.
    pub fn reserve(&mut self, count: u32, hint: Option<u64>) -> Result<Reservation> {
        if count == 0 {
            return Err(CfsError::Format(format!("{}: cannot reserve 0 bits", self.name)));
        }

        if let Some((gidx, local)) = hint.and_then(|goal| self.locate(goal)) {
            if let Some(res) = self.try_reserve_in_group(gidx, count, local) {
                return Ok(res);
            }
        }

        for chain in self.chain_order() {
            if self.chains[usize::from(chain)].free < u64::from(count) {
                continue;
            }
            let mut cursor = self.chains[usize::from(chain)].head;
            while let Some(gidx) = cursor {
                if let Some(res) = self.try_reserve_in_group(gidx, count, 0) {
                    return Ok(res);
                }
                cursor = self.groups[gidx].next;
            }
        }

        debug!(bitmap = %self.name, count, free = self.free_bits(), "no run large enough");
        Err(CfsError::OutOfSpace)
    }

    fn try_reserve_in_group(&mut self, gidx: usize, count: u32, start: u32) -> Option<Reservation> {
        let group = &mut self.groups[gidx];
        if group.chain_free < count {
            return None;
        }
        let local =
            bitmap_find_contiguous_from(&group.desc.bitmap, group.chain_total, count, start)?;

        for bit in local..local + count {
            bitmap_set(&mut group.desc.bitmap, bit);
        }
        group.chain_free -= count;
        group.used_bits += count;
        group.dirty = true;

        let chain = group.desc.chain;
        let start_bit = group.first_bit + u64::from(local);
        let blkno = group.blkno();
        self.chains[usize::from(chain)].free -= u64::from(count);

        trace!(bitmap = %self.name, chain, group = blkno.0, start_bit, len = count, "reserved");
        Some(Reservation {
            chain,
            group: blkno,
            group_bit: local,
            start_bit,
            len: count,
        })
    }

    /// [`reserve`](Self::reserve), growing a chain from `source` when no
    /// group has the run. The chain with the fewest total bits grows.
    pub fn reserve_or_grow(
        &mut self,
        count: u32,
        hint: Option<u64>,
        source: &mut dyn GroupSource,
    ) -> Result<Reservation> {
        match self.reserve(count, hint) {
            Err(CfsError::OutOfSpace) => {}
            other => return other,
        }

        let chain = (0..self.chains.len())
            .filter_map(|i| u16::try_from(i).ok())
            .min_by_key(|&c| (self.chains[usize::from(c)].total, c))
            .ok_or(CfsError::OutOfSpace)?;
        let Some(spec) = source.next_group(chain, count)? else {
            return Err(CfsError::OutOfSpace);
        };
        let gidx = self.grow_chain(chain, spec)?;
        self.try_reserve_in_group(gidx, count, 0)
            .ok_or(CfsError::OutOfSpace)
    }

    /// Release a run handed out by [`reserve`](Self::reserve), located by its
    /// group block so it stays valid across growth and reloads.
    pub fn release_reservation(&mut self, res: &Reservation) -> Result<()> {
        let gidx = self.group_index(res.group).ok_or_else(|| {
            CfsError::Format(format!("{}: no group at block {}", self.name, res.group))
        })?;
        let group = &self.groups[gidx];
        if u64::from(res.group_bit) + u64::from(res.len) > u64::from(group.chain_total) {
            return Err(CfsError::Format(format!(
                "{}: release of {} bits at {} spans groups",
                self.name, res.len, res.group_bit
            )));
        }
        let start_bit = group.first_bit + u64::from(res.group_bit);
        self.release(res.chain, start_bit, res.len)
    }

    /// Release `len` bits of `chain` starting at global bit `start_bit`.
    ///
    /// Every bit is checked before any is cleared: an already-clear bit
    /// fails with `DoubleFree` and leaves the bitmap untouched.
    pub fn release(&mut self, chain: u16, start_bit: u64, len: u32) -> Result<()> {
        if len == 0 {
            return Err(CfsError::Format(format!("{}: cannot release 0 bits", self.name)));
        }
        let (gidx, local) = self.locate(start_bit).ok_or_else(|| {
            CfsError::Format(format!(
                "{}: bit {start_bit} beyond valid bits {}",
                self.name, self.valid_bits
            ))
        })?;

        let group = &mut self.groups[gidx];
        if group.desc.chain != chain {
            return Err(CfsError::Format(format!(
                "{}: bit {start_bit} belongs to chain {}, not {chain}",
                self.name, group.desc.chain
            )));
        }
        let end = u64::from(local) + u64::from(len);
        if end > u64::from(group.chain_total) {
            return Err(CfsError::Format(format!(
                "{}: release of {len} bits at {start_bit} spans groups",
                self.name
            )));
        }

        if let Some(clear) = (local..local + len).find(|&b| !bitmap_get(&group.desc.bitmap, b)) {
            let bit = group.first_bit + u64::from(clear);
            warn!(bitmap = %self.name, chain, bit, "double free");
            return Err(CfsError::DoubleFree { bit });
        }

        for bit in local..local + len {
            bitmap_clear(&mut group.desc.bitmap, bit);
        }
        group.chain_free += len;
        group.used_bits -= len;
        group.dirty = true;
        self.chains[usize::from(chain)].free += u64::from(len);

        trace!(bitmap = %self.name, chain, start_bit, len, "released");
        Ok(())
    }

    /// Full consistency check of counters, links and bit ranges.
    pub fn verify(&self) -> Result<()> {
        let mut expected_first = 0_u64;
        let mut set_bits = 0_u64;
        for group in &self.groups {
            let corrupt = |detail: String| CfsError::Corruption {
                block: group.desc.blkno,
                detail,
            };
            if group.first_bit != expected_first {
                return Err(corrupt(format!(
                    "group starts at bit {}, expected {expected_first}",
                    group.first_bit
                )));
            }
            if group.chain_total != u32::from(group.desc.bits) {
                return Err(corrupt("group total disagrees with descriptor".into()));
            }
            if group.chain_free > group.chain_total
                || group.used_bits + group.chain_free != group.chain_total
            {
                return Err(corrupt(format!(
                    "used {} + free {} != total {}",
                    group.used_bits, group.chain_free, group.chain_total
                )));
            }
            let set = group.chain_total - bitmap_count_free(&group.desc.bitmap, group.chain_total);
            if set != group.used_bits {
                return Err(corrupt(format!(
                    "bitmap has {set} set bits, counters say {}",
                    group.used_bits
                )));
            }
            expected_first += u64::from(group.chain_total);
            set_bits += u64::from(set);
        }

        let corrupt = |detail: String| CfsError::Corruption {
            block: self.parent_dinode.0,
            detail,
        };
        if expected_first != self.valid_bits {
            return Err(corrupt(format!(
                "groups cover {expected_first} bits, valid bits is {}",
                self.valid_bits
            )));
        }

        let mut seen = vec![false; self.groups.len()];
        for (cidx, chain) in self.chains.iter().enumerate() {
            let (mut total, mut free, mut last) = (0_u64, 0_u64, None);
            let mut cursor = chain.head;
            while let Some(gidx) = cursor {
                let Some(group) = self.groups.get(gidx) else {
                    return Err(corrupt(format!("chain {cidx} links to missing group {gidx}")));
                };
                if std::mem::replace(&mut seen[gidx], true) {
                    return Err(corrupt(format!("group {gidx} linked more than once")));
                }
                if usize::from(group.desc.chain) != cidx {
                    return Err(corrupt(format!(
                        "group {gidx} on chain {cidx} claims chain {}",
                        group.desc.chain
                    )));
                }
                total += u64::from(group.chain_total);
                free += u64::from(group.chain_free);
                last = Some(gidx);
                cursor = group.next;
            }
            if last != chain.tail {
                return Err(corrupt(format!("chain {cidx} tail mismatch")));
            }
            if total != chain.total || free != chain.free {
                return Err(corrupt(format!(
                    "chain {cidx} totals {}/{} disagree with groups {free}/{total}",
                    chain.free, chain.total
                )));
            }
        }
        if let Some(orphan) = seen.iter().position(|s| !s) {
            return Err(corrupt(format!("group {orphan} is on no chain")));
        }

        if self.free_bits() != self.valid_bits - set_bits {
            return Err(corrupt(format!(
                "free count {} != valid {} - set {set_bits}",
                self.free_bits(),
                self.valid_bits
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bs512() -> BlockSize {
        BlockSize::new(512).unwrap()
    }

    fn bitmap_with_groups(groups: &[(u16, u16)]) -> AllocBitmap {
        let mut bm = AllocBitmap::new("test", bs512(), 4096, 3584, 4, BlockNumber(5)).unwrap();
        for (i, &(chain, bits)) in groups.iter().enumerate() {
            bm.grow_chain(
                chain,
                GroupSpec {
                    blkno: BlockNumber(100 + i as u64),
                    bits,
                    reserved_prefix: 0,
                },
            )
            .unwrap();
        }
        bm
    }

    #[test]
    fn bitmap_bit_helpers() {
        let mut bm = vec![0_u8; 4];
        bitmap_set(&mut bm, 0);
        bitmap_set(&mut bm, 9);
        assert!(bitmap_get(&bm, 0));
        assert!(bitmap_get(&bm, 9));
        assert!(!bitmap_get(&bm, 1));
        assert!(!bitmap_get(&bm, 1000));
        assert_eq!(bitmap_count_free(&bm, 32), 30);
        assert_eq!(bitmap_count_free(&bm, 10), 8);
        bitmap_clear(&mut bm, 9);
        assert_eq!(bitmap_count_free(&bm, 32), 31);
    }

    #[test]
    fn contiguous_search_prefers_goal_then_wraps() {
        let mut bm = vec![0_u8; 4];
        for bit in 4..8 {
            bitmap_set(&mut bm, bit);
        }
        assert_eq!(bitmap_find_contiguous(&bm, 32, 4), Some(0));
        assert_eq!(bitmap_find_contiguous(&bm, 32, 5), Some(8));
        assert_eq!(bitmap_find_contiguous_from(&bm, 32, 3, 5), Some(8));
        assert_eq!(bitmap_find_contiguous_from(&bm, 12, 4, 10), Some(0));
        assert_eq!(bitmap_find_contiguous(&bm, 32, 40), None);
    }

    #[test]
    fn fresh_bitmap_reserve_ten_leaves_990() {
        let mut bm = bitmap_with_groups(&[(0, 1000)]);
        let res = bm.reserve(10, None).unwrap();
        assert_eq!(res.chain, 0);
        assert_eq!(res.start_bit, 0);
        assert_eq!(res.len, 10);
        assert_eq!(bm.free_bits(), 990);
        assert_eq!(bm.groups()[0].chain_free, 990);
        assert_eq!(bm.groups()[0].used_bits, 10);
        bm.verify().unwrap();
    }

    #[test]
    fn zero_count_rejected() {
        let mut bm = bitmap_with_groups(&[(0, 64)]);
        assert!(matches!(bm.reserve(0, None), Err(CfsError::Format(_))));
    }

    #[test]
    fn hint_group_tried_first() {
        let mut bm = bitmap_with_groups(&[(0, 100), (1, 100)]);
        let res = bm.reserve(5, Some(150)).unwrap();
        assert_eq!(res.chain, 1);
        assert_eq!(res.start_bit, 150);

        // No run of 45 at or after the goal: wrap to the group start.
        let res = bm.reserve(45, Some(160)).unwrap();
        assert_eq!(res.start_bit, 100);
    }

    #[test]
    fn chain_with_most_free_bits_wins() {
        let mut bm = bitmap_with_groups(&[(0, 100), (1, 200), (2, 200)]);
        let res = bm.reserve(4, None).unwrap();
        assert_eq!(res.chain, 1, "tie between chains 1 and 2 goes to the lower index");
        let res = bm.reserve(4, None).unwrap();
        assert_eq!(res.chain, 2);
    }

    #[test]
    fn run_never_spans_groups() {
        let mut bm = bitmap_with_groups(&[(0, 64), (0, 64)]);
        bm.reserve(60, None).unwrap();
        let res = bm.reserve(10, None).unwrap();
        assert_eq!(res.group, BlockNumber(101));
        assert_eq!((res.group_bit, res.start_bit), (0, 64));
        assert!(matches!(bm.reserve(100, None), Err(CfsError::OutOfSpace)));
    }

    #[test]
    fn groups_walked_in_link_order() {
        let mut bm = bitmap_with_groups(&[(0, 32), (1, 32), (0, 32)]);
        bm.reserve(32, None).unwrap();
        let res = bm.reserve(8, None).unwrap();
        // Chain 0 still has 32 free bits in its second group (arena index 2).
        assert_eq!(res.chain, 0);
        assert_eq!(res.group, BlockNumber(102));
        assert_eq!(bm.chain_groups(0).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn release_restores_counters() {
        let mut bm = bitmap_with_groups(&[(0, 1000)]);
        let res = bm.reserve(10, None).unwrap();
        bm.release(res.chain, res.start_bit + 2, 3).unwrap();
        assert_eq!(bm.free_bits(), 993);
        assert_eq!(bm.is_set(3), Some(false));
        assert_eq!(bm.is_set(5), Some(true));
        bm.verify().unwrap();
    }

    #[test]
    fn double_free_leaves_bitmap_unchanged() {
        let mut bm = bitmap_with_groups(&[(0, 1000)]);
        bm.reserve(10, None).unwrap();
        bm.release(0, 4, 1).unwrap();
        let before = bm.clone();

        let err = bm.release(0, 2, 5).unwrap_err();
        assert!(matches!(err, CfsError::DoubleFree { bit: 4 }));
        assert_eq!(bm, before);
    }

    #[test]
    fn release_checks_chain_and_group_bounds() {
        let mut bm = bitmap_with_groups(&[(0, 64), (1, 64)]);
        bm.reserve(64, None).unwrap();
        bm.reserve(64, None).unwrap();
        assert!(matches!(bm.release(1, 0, 1), Err(CfsError::Format(_))));
        assert!(matches!(bm.release(0, 60, 10), Err(CfsError::Format(_))));
        assert!(matches!(bm.release(0, 500, 1), Err(CfsError::Format(_))));
        assert!(matches!(bm.release(0, 0, 0), Err(CfsError::Format(_))));
    }

    #[test]
    fn grow_links_tail_and_extends_valid_bits() {
        let mut bm = bitmap_with_groups(&[(2, 100)]);
        let idx = bm
            .grow_chain(
                2,
                GroupSpec {
                    blkno: BlockNumber(900),
                    bits: 50,
                    reserved_prefix: 1,
                },
            )
            .unwrap();
        assert_eq!(bm.valid_bits(), 150);
        assert_eq!(bm.groups()[0].next, Some(idx));
        assert_eq!(bm.groups()[0].desc.next_group, 900);
        assert_eq!(bm.chain(2).unwrap().tail, Some(idx));
        assert_eq!(bm.chain(2).unwrap().free, 149);
        assert_eq!(bm.is_set(100), Some(true));
        assert_eq!(bm.unit_block(idx, 3), Some(BlockNumber(924)));
        bm.verify().unwrap();

        let bad_chain = GroupSpec {
            blkno: BlockNumber(901),
            bits: 8,
            reserved_prefix: 0,
        };
        assert!(bm.grow_chain(9, bad_chain).is_err());
        let oversized = GroupSpec {
            bits: 4000,
            ..bad_chain
        };
        assert!(matches!(
            bm.grow_chain(0, oversized),
            Err(CfsError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn growth_below_existing_groups_keeps_block_order() {
        let mut bm = AllocBitmap::new("test", bs512(), 512, 64, 4, BlockNumber(5)).unwrap();
        let spec = |blkno: u64| GroupSpec {
            blkno: BlockNumber(blkno),
            bits: 64,
            reserved_prefix: 1,
        };
        bm.grow_chain(0, spec(40)).unwrap();
        let a = bm.reserve(5, None).unwrap();
        assert_eq!((a.group, a.group_bit, a.start_bit), (BlockNumber(40), 1, 1));

        assert_eq!(bm.grow_chain(0, spec(20)).unwrap(), 0);
        assert_eq!(bm.grow_chain(1, spec(30)).unwrap(), 1);
        let blknos: Vec<u64> = bm.groups().iter().map(|g| g.desc.blkno).collect();
        assert_eq!(blknos, vec![20, 30, 40]);
        let firsts: Vec<u64> = bm.groups().iter().map(|g| g.first_bit).collect();
        assert_eq!(firsts, vec![0, 64, 128]);
        // link order is growth order
        let chain0: Vec<u64> = bm
            .chain_groups(0)
            .map(|g| bm.groups()[g].desc.blkno)
            .collect();
        assert_eq!(chain0, vec![40, 20]);
        assert_eq!(bm.groups()[2].desc.next_group, 20);
        bm.verify().unwrap();

        // a's global bits moved; its group-relative handle did not
        assert_eq!(bm.is_set(129), Some(true));
        assert_eq!(bm.is_set(1), Some(false), "bit 1 now belongs to the group at 20");
        bm.release_reservation(&a).unwrap();
        assert_eq!(bm.is_set(129), Some(false));
        assert_eq!(bm.used_bits(), 3);
        assert!(matches!(
            bm.release_reservation(&a),
            Err(CfsError::DoubleFree { bit: 129 })
        ));
        assert!(matches!(
            bm.grow_chain(2, spec(30)),
            Err(CfsError::Format(_))
        ));
        bm.verify().unwrap();
    }

    struct FixedSource(Vec<GroupSpec>);

    impl GroupSource for FixedSource {
        fn next_group(&mut self, _chain: u16, _min_bits: u32) -> Result<Option<GroupSpec>> {
            Ok(self.0.pop())
        }
    }

    #[test]
    fn reserve_or_grow_adds_a_group() {
        let mut bm = bitmap_with_groups(&[(0, 16), (1, 32)]);
        bm.reserve(16, None).unwrap();
        bm.reserve(16, None).unwrap();
        let mut source = FixedSource(vec![GroupSpec {
            blkno: BlockNumber(400),
            bits: 64,
            reserved_prefix: 1,
        }]);
        let res = bm.reserve_or_grow(40, None, &mut source).unwrap();
        assert_eq!(res.chain, 2, "an empty chain grows first");
        assert_eq!(res.start_bit, 48 + 1);
        assert!(matches!(
            bm.reserve_or_grow(500, None, &mut source),
            Err(CfsError::OutOfSpace)
        ));
        bm.verify().unwrap();
    }

    #[test]
    fn verify_detects_counter_drift() {
        let mut bm = bitmap_with_groups(&[(0, 64)]);
        bm.reserve(4, None).unwrap();
        bm.groups[0].chain_free += 1;
        assert!(matches!(bm.verify(), Err(CfsError::Corruption { block: 100, .. })));
    }

    #[test]
    fn geometry_validated() {
        assert!(AllocBitmap::new("x", bs512(), 1000, 64, 1, BlockNumber(1)).is_err());
        assert!(AllocBitmap::new("x", bs512(), 256, 64, 1, BlockNumber(1)).is_err());
        assert!(AllocBitmap::new("x", bs512(), 512, 0, 1, BlockNumber(1)).is_err());
        assert!(AllocBitmap::new("x", bs512(), 512, 64, 0, BlockNumber(1)).is_err());
        assert!(AllocBitmap::new("x", bs512(), 512, 64, 20, BlockNumber(1)).is_err());
        let bm = AllocBitmap::new("x", bs512(), 4096, 64, 19, BlockNumber(1)).unwrap();
        assert_eq!(bm.unit_bits(), 12);
        assert_eq!(bm.blocks_per_unit(), 8);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Reserve { count: u32, hint: Option<u64> },
        Release { pick: usize, trim: u32 },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1_u32..40, proptest::option::of(0_u64..400))
                .prop_map(|(count, hint)| Op::Reserve { count, hint }),
            (0_usize..64, 0_u32..4).prop_map(|(pick, trim)| Op::Release { pick, trim }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn reserve_release_sequences_keep_counters_consistent(
            ops in proptest::collection::vec(op_strategy(), 1..80),
        ) {
            let mut bm = bitmap_with_groups(&[(0, 100), (1, 60), (0, 120), (3, 80)]);
            let mut live: Vec<Reservation> = Vec::new();

            for op in ops {
                match op {
                    Op::Reserve { count, hint } => match bm.reserve(count, hint) {
                        Ok(res) => {
                            let gidx = bm.group_index(res.group).unwrap();
                            let group = &bm.groups()[gidx];
                            prop_assert!(group.local_bit(res.start_bit).is_some());
                            prop_assert!(group.local_bit(res.end_bit() - 1).is_some());
                            live.push(res);
                        }
                        Err(CfsError::OutOfSpace) => {}
                        Err(other) => prop_assert!(false, "unexpected error {other:?}"),
                    },
                    Op::Release { pick, trim } => {
                        if live.is_empty() {
                            continue;
                        }
                        let res = live.swap_remove(pick % live.len());
                        let len = res.len.saturating_sub(trim).max(1);
                        bm.release(res.chain, res.start_bit, len).unwrap();
                        if len < res.len {
                            live.push(Reservation {
                                start_bit: res.start_bit + u64::from(len),
                                group_bit: res.group_bit + len,
                                len: res.len - len,
                                ..res
                            });
                        }
                    }
                }
                prop_assert!(bm.verify().is_ok());
            }

            let held: u64 = live.iter().map(|r| u64::from(r.len)).sum();
            prop_assert_eq!(bm.used_bits(), held);
        }
    }
}
