//! Loading and flushing chain-allocated bitmaps.
//!
//! The owning dinode carries a chain list; each chain record points at the
//! first group descriptor of its chain and descriptors link onward through
//! `next_group`. Loading follows every chain, rejecting cycles, foreign
//! descriptors and counter disagreements. Global bit ranges are assigned
//! to groups in descriptor block order, the order
//! [`AllocBitmap::grow_chain`] keeps the arena in, so a reload never moves
//! a bit.

use crate::{AllocBitmap, AllocGroup, Chain, bitmap_count_free};
use cfs_block::BlockDevice;
use cfs_error::{CfsError, Result};
use cfs_ondisk::{ChainList, ChainRec, Dinode, DinodeBody, GroupDesc, ParseResultExt};
use cfs_types::{BlockNumber, BlockSize};
use std::collections::BTreeSet;
use tracing::{debug, trace};

fn corrupt(block: BlockNumber, detail: impl Into<String>) -> CfsError {
    CfsError::Corruption {
        block: block.0,
        detail: detail.into(),
    }
}

impl AllocBitmap {
    /// Load the bitmap owned by the chain-list dinode at `dinode_blkno`.
    pub fn load(dev: &dyn BlockDevice, dinode_blkno: BlockNumber, name: &str) -> Result<Self> {
        let block_size = BlockSize::new(dev.block_size())
            .map_err(|e| CfsError::InvalidGeometry(e.to_string()))?;
        let buf = dev.read_block(dinode_blkno)?;
        let dinode = Dinode::parse(buf.as_slice()).at_block(dinode_blkno.0)?;
        let list = dinode
            .chain_list()
            .ok_or_else(|| corrupt(dinode_blkno, format!("{name}: dinode has no chain list")))?;
        if list.bpc == 0 {
            return Err(corrupt(dinode_blkno, "chain list has zero blocks per bit"));
        }

        let unit = u32::from(list.bpc)
            .checked_mul(block_size.get())
            .ok_or_else(|| corrupt(dinode_blkno, "allocation unit overflows"))?;
        let mut bitmap = Self::new(name, block_size, unit, list.cpg, list.count, dinode_blkno)
            .map_err(|e| corrupt(dinode_blkno, e.to_string()))?;

        // (chain, position in chain, descriptor)
        let mut found: Vec<(usize, usize, GroupDesc)> = Vec::new();
        let mut visited = BTreeSet::new();
        for (cidx, rec) in list.recs.iter().enumerate() {
            let mut next = rec.blkno;
            let mut pos = 0_usize;
            while next != 0 {
                let blkno = BlockNumber(next);
                if !visited.insert(next) {
                    return Err(corrupt(blkno, format!("chain {cidx} revisits group descriptor")));
                }
                if next >= dev.block_count() {
                    return Err(corrupt(blkno, format!("chain {cidx} points past end of device")));
                }
                let block = dev.read_block(blkno)?;
                let desc = GroupDesc::parse(block.as_slice()).at_block(next)?;
                if desc.blkno != next {
                    return Err(corrupt(blkno, "descriptor records a different block number"));
                }
                if usize::from(desc.chain) != cidx {
                    return Err(corrupt(
                        blkno,
                        format!("descriptor on chain {cidx} claims chain {}", desc.chain),
                    ));
                }
                if desc.parent_dinode != dinode_blkno.0 {
                    return Err(corrupt(blkno, "descriptor belongs to another dinode"));
                }
                if desc.bits == 0 || desc.bits > list.cpg {
                    return Err(corrupt(blkno, format!("group of {} bits", desc.bits)));
                }
                trace!(bitmap = name, chain = cidx, blkno = next, bits = desc.bits, "group");
                next = desc.next_group;
                found.push((cidx, pos, desc));
                pos += 1;
            }
        }

        found.sort_by_key(|(_, _, desc)| desc.blkno);
        let mut links: Vec<(usize, usize, usize)> = Vec::with_capacity(found.len());
        for (cidx, pos, desc) in found {
            let total = u32::from(desc.bits);
            let used = total - bitmap_count_free(&desc.bitmap, total);
            let free = u32::from(desc.free_bits_count);
            if used + free != total {
                return Err(corrupt(
                    BlockNumber(desc.blkno),
                    format!("free count {free} disagrees with bitmap ({used} of {total} used)"),
                ));
            }
            links.push((cidx, pos, bitmap.groups.len()));
            bitmap.groups.push(AllocGroup {
                desc,
                first_bit: bitmap.valid_bits,
                chain_total: total,
                chain_free: free,
                used_bits: used,
                next: None,
                dirty: false,
            });
            bitmap.valid_bits += u64::from(total);
        }

        links.sort_unstable();
        for &(cidx, _, gidx) in &links {
            let chain = &mut bitmap.chains[cidx];
            match chain.tail {
                Some(tail) => bitmap.groups[tail].next = Some(gidx),
                None => chain.head = Some(gidx),
            }
            chain.tail = Some(gidx);
            chain.total += u64::from(bitmap.groups[gidx].chain_total);
            chain.free += u64::from(bitmap.groups[gidx].chain_free);
        }

        for (cidx, rec) in list.recs.iter().enumerate() {
            let chain = &bitmap.chains[cidx];
            if chain.total != u64::from(rec.total) || chain.free != u64::from(rec.free) {
                return Err(corrupt(
                    dinode_blkno,
                    format!(
                        "chain {cidx} record says {}/{} free, groups hold {}/{}",
                        rec.free, rec.total, chain.free, chain.total
                    ),
                ));
            }
        }
        if u64::from(dinode.bitmap_total) != bitmap.valid_bits
            || u64::from(dinode.bitmap_used) != bitmap.used_bits()
        {
            return Err(corrupt(
                dinode_blkno,
                format!(
                    "dinode totals {}/{} disagree with groups {}/{}",
                    dinode.bitmap_used,
                    dinode.bitmap_total,
                    bitmap.used_bits(),
                    bitmap.valid_bits
                ),
            ));
        }

        bitmap.verify()?;
        debug!(
            bitmap = name,
            dinode = dinode_blkno.0,
            groups = bitmap.groups.len(),
            valid_bits = bitmap.valid_bits,
            free_bits = bitmap.free_bits(),
            "loaded bitmap"
        );
        Ok(bitmap)
    }

    /// Chain list for the owning dinode. Trailing empty chains are left out
    /// of the used records.
    pub fn chain_list(&self) -> Result<ChainList> {
        let geometry = |what: &str| CfsError::InvalidGeometry(format!("{}: {what}", self.name));
        let used = self
            .chains
            .iter()
            .rposition(|c| c.head.is_some())
            .map_or(0, |last| last + 1);
        let recs = self.chains[..used]
            .iter()
            .map(|chain: &Chain| {
                Ok(ChainRec {
                    free: u32::try_from(chain.free).map_err(|_| geometry("chain free overflows"))?,
                    total: u32::try_from(chain.total)
                        .map_err(|_| geometry("chain total overflows"))?,
                    blkno: chain.head.map_or(0, |g| self.groups[g].desc.blkno),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ChainList {
            cpg: self.bits_per_group,
            bpc: u16::try_from(self.blocks_per_unit())
                .map_err(|_| geometry("blocks per unit overflows"))?,
            count: u16::try_from(self.chains.len()).map_err(|_| geometry("too many chains"))?,
            recs,
        })
    }

    /// Write the block image of group `gidx`.
    pub fn encode_group(&self, gidx: usize) -> Result<Vec<u8>> {
        let group = self
            .groups
            .get(gidx)
            .ok_or_else(|| CfsError::NotFound(format!("{}: group {gidx}", self.name)))?;
        let mut desc = group.desc.clone();
        desc.free_bits_count = u16::try_from(group.chain_free)
            .map_err(|_| corrupt(group.blkno(), "free count exceeds descriptor width"))?;
        let mut block = vec![0_u8; self.block_size.bytes()];
        desc.write(&mut block)
            .map_err(|e| corrupt(group.blkno(), e.to_string()))?;
        Ok(block)
    }

    /// Update `dinode` with this bitmap's chain list and totals.
    pub fn apply_to_dinode(&self, dinode: &mut Dinode) -> Result<()> {
        dinode.body = DinodeBody::Chain(self.chain_list()?);
        dinode.bitmap_total = u32::try_from(self.valid_bits)
            .map_err(|_| corrupt(self.parent_dinode, "bitmap total exceeds 32 bits"))?;
        dinode.bitmap_used = u32::try_from(self.used_bits())
            .map_err(|_| corrupt(self.parent_dinode, "bitmap used exceeds 32 bits"))?;
        Ok(())
    }

    /// Write every dirty group descriptor and rewrite the owning dinode's
    /// chain list and totals. Returns the number of descriptors written.
    pub fn flush(&mut self, dev: &dyn BlockDevice) -> Result<usize> {
        let mut written = 0_usize;
        for gidx in 0..self.groups.len() {
            if !self.groups[gidx].dirty {
                continue;
            }
            let block = self.encode_group(gidx)?;
            dev.write_block(self.groups[gidx].blkno(), &block)?;
            let group = &mut self.groups[gidx];
            group.desc.free_bits_count = u16::try_from(group.chain_free).unwrap_or(u16::MAX);
            group.dirty = false;
            written += 1;
        }

        let buf = dev.read_block(self.parent_dinode)?;
        let mut dinode = Dinode::parse(buf.as_slice()).at_block(self.parent_dinode.0)?;
        self.apply_to_dinode(&mut dinode)?;
        let mut block = buf.into_inner();
        dinode
            .write(&mut block)
            .map_err(|e| corrupt(self.parent_dinode, e.to_string()))?;
        dev.write_block(self.parent_dinode, &block)?;

        debug!(
            bitmap = %self.name,
            groups_written = written,
            free_bits = self.free_bits(),
            "flushed bitmap"
        );
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GroupSpec, Reservation};
    use proptest::prelude::*;
    use cfs_block::{ByteBlockDevice, MemoryByteDevice};
    use cfs_ondisk::InodeFlags;

    const BITMAP_DINODE: u64 = 4;

    fn device() -> ByteBlockDevice<MemoryByteDevice> {
        ByteBlockDevice::new(MemoryByteDevice::new(512 * 256), 512).unwrap()
    }

    fn write_empty_dinode(dev: &dyn BlockDevice) {
        let bs = 512;
        let list = ChainList {
            cpg: 64,
            bpc: 1,
            count: Dinode::chain_list_capacity(bs).unwrap(),
            recs: Vec::new(),
        };
        let dinode = Dinode::new(
            BITMAP_DINODE,
            InodeFlags::VALID | InodeFlags::SYSTEM | InodeFlags::BITMAP | InodeFlags::CHAIN,
            cfs_ondisk::dinode::S_IFREG,
            DinodeBody::Chain(list),
        );
        let mut block = vec![0_u8; bs];
        dinode.write(&mut block).unwrap();
        dev.write_block(BlockNumber(BITMAP_DINODE), &block).unwrap();
    }

    fn populated(dev: &dyn BlockDevice) -> AllocBitmap {
        write_empty_dinode(dev);
        let bs = BlockSize::new(512).unwrap();
        let mut bm = AllocBitmap::new("inode_alloc", bs, 512, 64, 19, BlockNumber(BITMAP_DINODE))
            .unwrap();
        for (chain, blkno) in [(0_u16, 40_u64), (1, 20), (0, 120)] {
            bm.grow_chain(
                chain,
                GroupSpec {
                    blkno: BlockNumber(blkno),
                    bits: 64,
                    reserved_prefix: 1,
                },
            )
            .unwrap();
        }
        bm.reserve(10, None).unwrap();
        bm.reserve(3, Some(130)).unwrap();
        bm
    }

    #[test]
    fn flush_then_load_reproduces_chains() {
        let dev = device();
        let mut bm = populated(&dev);
        assert_eq!(bm.flush(&dev).unwrap(), 3);
        assert!(bm.groups().iter().all(|g| !g.is_dirty()));
        assert_eq!(bm.flush(&dev).unwrap(), 0);

        let loaded = AllocBitmap::load(&dev, BlockNumber(BITMAP_DINODE), "inode_alloc").unwrap();
        assert_eq!(loaded.valid_bits(), 192);
        assert_eq!(loaded.free_bits(), bm.free_bits());
        assert_eq!(loaded.chain_list().unwrap(), bm.chain_list().unwrap());
        let blknos: Vec<u64> = loaded.groups().iter().map(|g| g.desc.blkno).collect();
        assert_eq!(blknos, vec![20, 40, 120]);
        let firsts =
            |b: &AllocBitmap| b.groups().iter().map(|g| g.first_bit).collect::<Vec<_>>();
        assert_eq!(firsts(&loaded), firsts(&bm));
        assert_eq!(loaded.groups(), bm.groups());
        let chain0: Vec<u64> = loaded
            .chain_groups(0)
            .map(|g| loaded.groups()[g].desc.blkno)
            .collect();
        assert_eq!(chain0, vec![40, 120]);

        let buf = dev.read_block(BlockNumber(BITMAP_DINODE)).unwrap();
        let dinode = Dinode::parse(buf.as_slice()).unwrap();
        assert_eq!(dinode.bitmap_total, 192);
        assert_eq!(u64::from(dinode.bitmap_used), loaded.used_bits());
    }

    fn empty_bitmap(dev: &dyn BlockDevice) -> AllocBitmap {
        write_empty_dinode(dev);
        let bs = BlockSize::new(512).unwrap();
        AllocBitmap::new("inode_alloc", bs, 512, 64, 19, BlockNumber(BITMAP_DINODE)).unwrap()
    }

    fn group(blkno: u64) -> GroupSpec {
        GroupSpec {
            blkno: BlockNumber(blkno),
            bits: 64,
            reserved_prefix: 1,
        }
    }

    fn still_held(bm: &AllocBitmap, res: &Reservation) -> bool {
        bm.group_index(res.group).is_some_and(|gidx| {
            let group = &bm.groups()[gidx];
            (res.group_bit..res.group_bit + res.len).all(|bit| group.is_set(bit))
        })
    }

    #[test]
    fn reservations_survive_reload_after_growth_below() {
        let dev = device();
        let mut bm = empty_bitmap(&dev);
        bm.grow_chain(0, group(40)).unwrap();
        let a = bm.reserve(5, None).unwrap();
        bm.grow_chain(0, group(20)).unwrap();
        let b = bm.reserve(5, Some(1)).unwrap();
        assert_eq!((a.group, a.group_bit), (BlockNumber(40), 1));
        assert_eq!((b.group, b.group_bit), (BlockNumber(20), 1));
        bm.flush(&dev).unwrap();

        let mut loaded =
            AllocBitmap::load(&dev, BlockNumber(BITMAP_DINODE), "inode_alloc").unwrap();
        assert_eq!(loaded.groups(), bm.groups());
        loaded.release_reservation(&b).unwrap();
        assert!(still_held(&loaded, &a));
        assert_eq!(loaded.groups()[0].used_bits, 1);
        assert_eq!(loaded.groups()[1].used_bits, 6);

        loaded.release_reservation(&a).unwrap();
        assert_eq!(loaded.used_bits(), 2);
        assert!(matches!(
            loaded.release_reservation(&b),
            Err(CfsError::DoubleFree { .. })
        ));
        loaded.verify().unwrap();
    }

    #[test]
    fn chain_list_skips_trailing_empty_chains() {
        let dev = device();
        let bm = populated(&dev);
        let list = bm.chain_list().unwrap();
        assert_eq!(list.count, 19);
        assert_eq!(list.recs.len(), 2);
        assert_eq!(list.recs[0].blkno, 40);
        assert_eq!(list.recs[0].total, 128);
        assert_eq!(list.recs[1].free, 63);
    }

    #[test]
    fn cyclic_group_chain_rejected() {
        let dev = device();
        let mut bm = populated(&dev);
        bm.flush(&dev).unwrap();

        let mut block = dev.read_block(BlockNumber(120)).unwrap().into_inner();
        let mut desc = GroupDesc::parse(&block).unwrap();
        desc.next_group = 40;
        desc.write(&mut block).unwrap();
        dev.write_block(BlockNumber(120), &block).unwrap();

        let err = AllocBitmap::load(&dev, BlockNumber(BITMAP_DINODE), "inode_alloc").unwrap_err();
        assert!(matches!(err, CfsError::Corruption { block: 40, .. }), "{err:?}");
    }

    #[test]
    fn counter_mismatch_rejected() {
        let dev = device();
        let mut bm = populated(&dev);
        bm.flush(&dev).unwrap();

        let mut block = dev.read_block(BlockNumber(20)).unwrap().into_inner();
        let mut desc = GroupDesc::parse(&block).unwrap();
        desc.free_bits_count -= 1;
        desc.write(&mut block).unwrap();
        dev.write_block(BlockNumber(20), &block).unwrap();

        let err = AllocBitmap::load(&dev, BlockNumber(BITMAP_DINODE), "inode_alloc").unwrap_err();
        assert!(matches!(err, CfsError::Corruption { block: 20, .. }), "{err:?}");
    }

    #[test]
    fn bad_signature_rejected() {
        let dev = device();
        let mut bm = populated(&dev);
        bm.flush(&dev).unwrap();
        dev.write_block(BlockNumber(40), &[0_u8; 512]).unwrap();
        let err = AllocBitmap::load(&dev, BlockNumber(BITMAP_DINODE), "inode_alloc").unwrap_err();
        assert!(matches!(err, CfsError::Corruption { block: 40, .. }), "{err:?}");
    }

    #[derive(Debug, Clone)]
    enum Step {
        Reserve(u32),
        Release(usize),
        Grow,
        Reload,
    }

    fn step_strategy() -> impl Strategy<Value = Step> {
        prop_oneof![
            4 => (1_u32..24).prop_map(Step::Reserve),
            3 => (0_usize..32).prop_map(Step::Release),
            1 => Just(Step::Grow),
            2 => Just(Step::Reload),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn live_reservations_survive_flush_and_load(
            steps in proptest::collection::vec(step_strategy(), 1..60),
        ) {
            const GROUP_BLOCKS: [u64; 8] = [60, 30, 90, 10, 120, 50, 200, 15];
            let dev = device();
            let mut bm = empty_bitmap(&dev);
            bm.grow_chain(0, group(100)).unwrap();
            let mut grown = 0_usize;
            let mut live: Vec<Reservation> = Vec::new();

            for step in steps {
                match step {
                    Step::Reserve(count) => match bm.reserve(count, None) {
                        Ok(res) => live.push(res),
                        Err(CfsError::OutOfSpace) => {}
                        Err(other) => prop_assert!(false, "unexpected error {other:?}"),
                    },
                    Step::Release(pick) => {
                        if !live.is_empty() {
                            let res = live.swap_remove(pick % live.len());
                            bm.release_reservation(&res).unwrap();
                        }
                    }
                    Step::Grow => {
                        if let Some(&blkno) = GROUP_BLOCKS.get(grown) {
                            let chain = u16::try_from(grown % 3).unwrap();
                            bm.grow_chain(chain, group(blkno)).unwrap();
                            grown += 1;
                        }
                    }
                    Step::Reload => {
                        bm.flush(&dev).unwrap();
                        bm = AllocBitmap::load(&dev, BlockNumber(BITMAP_DINODE), "inode_alloc")
                            .unwrap();
                    }
                }
                prop_assert!(bm.verify().is_ok());
                for res in &live {
                    prop_assert!(still_held(&bm, res), "{res:?} lost its bits");
                }
            }

            let held: u64 = live.iter().map(|r| u64::from(r.len)).sum();
            prop_assert_eq!(bm.used_bits(), held + u64::try_from(bm.groups().len()).unwrap());
        }
    }
}
