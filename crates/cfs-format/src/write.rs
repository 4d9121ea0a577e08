//! Writing a computed layout to a device.
//!
//! Order matters only for the bitmaps: their flush rewrites the owning
//! dinode in place, so every dinode is written before either flush.

use crate::FormatOptions;
use crate::layout::{FsLayout, SystemFileRecord, layout};
use crate::system::SystemFileKind;
use cfs_alloc::AllocBitmap;
use cfs_block::{BlockDevice, zero_blocks};
use cfs_error::{CfsError, Result};
use cfs_ondisk::dinode::{MAJOR_REV_LEVEL, MINOR_REV_LEVEL, S_IFDIR};
use cfs_ondisk::{
    Dinode, DinodeBody, ExtentList, ExtentRec, GroupDesc, InodeFlags, LocalAllocHeader,
    SuperblockInfo,
};
use cfs_types::{BlockNumber, NodeSlot};
use tracing::{debug, info};

/// Mounts allowed between checks.
const DEFAULT_MAX_MNT_COUNT: u16 = 20;

fn encode(blkno: BlockNumber, block_size: usize, dinode: &Dinode) -> Result<Vec<u8>> {
    let mut block = vec![0_u8; block_size];
    dinode
        .write(&mut block)
        .map_err(|e| CfsError::Format(format!("encoding dinode {blkno}: {e}")))?;
    Ok(block)
}

/// Format `dev` according to `opts` and return what was written.
pub fn format_device(dev: &dyn BlockDevice, opts: &FormatOptions) -> Result<FsLayout> {
    if dev.block_size() != opts.block_size {
        return Err(CfsError::InvalidGeometry(format!(
            "device block size {} differs from requested {}",
            dev.block_size(),
            opts.block_size
        )));
    }
    let mut fs = layout(opts, dev.block_count())?;
    let bs = fs.geometry.block_size;
    let bpc = fs.geometry.blocks_per_cluster();

    // Leading space, superblock and the rest of the clusters before group 0.
    zero_blocks(dev, BlockNumber(0), fs.geometry.first_cluster_group.0)?;
    zero_blocks(dev, fs.system_group, fs.system_group_blocks)?;

    for record in fs.records() {
        let dinode = build_dinode(&fs, record)?;
        dev.write_block(record.fe_off, &encode(record.fe_off, bs.bytes(), &dinode)?)?;
        write_data(dev, &fs, record)?;
    }

    fs.global_bitmap.flush(dev)?;
    fs.inode_alloc.flush(dev)?;

    let superblock = superblock_dinode(&fs);
    dev.write_block(fs.superblock, &encode(fs.superblock, bs.bytes(), &superblock)?)?;
    dev.sync()?;

    info!(
        label = %fs.label,
        block_size = bs.get(),
        cluster_size = fs.geometry.cluster_size.get(),
        clusters = fs.geometry.total_clusters,
        blocks_per_cluster = bpc,
        max_nodes = fs.max_nodes,
        free_clusters = fs.free_clusters(),
        "formatted volume"
    );
    Ok(fs)
}

fn build_dinode(fs: &FsLayout, record: &SystemFileRecord) -> Result<Dinode> {
    let bs = fs.geometry.block_size;
    let bpc = fs.geometry.blocks_per_cluster();
    let extents = || -> Result<DinodeBody> {
        let capacity = Dinode::extent_list_capacity(bs.bytes())
            .map_err(|e| CfsError::InvalidGeometry(e.to_string()))?;
        let mut list = ExtentList::empty(capacity);
        if let Some(start) = record.data_start(bs) {
            cfs_extent::append_extent(
                &mut list,
                ExtentRec {
                    cpos: 0,
                    clusters: record.clusters,
                    blkno: start.0,
                },
                bpc,
            )?;
        }
        Ok(DinodeBody::Extents(list))
    };

    let mut dinode = Dinode::new(record.fe_off.0, record.flags, record.mode, extents()?);
    match record.kind {
        SystemFileKind::Cluster => fs.global_bitmap.apply_to_dinode(&mut dinode)?,
        SystemFileKind::Chain if record.slot.is_none() => {
            fs.inode_alloc.apply_to_dinode(&mut dinode)?;
        }
        SystemFileKind::Chain => {
            // Per-slot suballocators start with no groups.
            let max_bits = GroupDesc::max_bits(bs.bytes())
                .map_err(|e| CfsError::InvalidGeometry(e.to_string()))?;
            AllocBitmap::new(
                record.name.clone(),
                bs,
                bs.get(),
                max_bits,
                fs.geometry.chain_count,
                record.fe_off,
            )?
            .apply_to_dinode(&mut dinode)?;
        }
        SystemFileKind::LocalAlloc => {
            let mut header = LocalAllocHeader::empty(bs.bytes())
                .map_err(|e| CfsError::InvalidGeometry(e.to_string()))?;
            if let Some(start) = record.data_start(bs) {
                header.bm_off = u32::try_from(start.0 / bpc)
                    .map_err(|_| CfsError::InvalidGeometry("window beyond 2^32 clusters".into()))?;
            }
            dinode.body = DinodeBody::LocalAlloc(header);
        }
        _ => {}
    }

    dinode.generation = volume_generation(fs);
    dinode.suballoc_node = NodeSlot::NONE_RAW;
    dinode.suballoc_bit = record.suballoc_bit;
    dinode.size = record.file_size;
    dinode.clusters = record.clusters;
    dinode.links_count = record.links;
    dinode.ctime = fs.format_time;
    dinode.mtime = fs.format_time;
    Ok(dinode)
}

fn write_data(dev: &dyn BlockDevice, fs: &FsLayout, record: &SystemFileRecord) -> Result<()> {
    let bs = fs.geometry.block_size;
    let Some(start) = record.data_start(bs) else {
        return Ok(());
    };
    let run_blocks = u64::from(record.clusters) * fs.geometry.blocks_per_cluster();

    if record.mode & S_IFDIR == S_IFDIR {
        let blocks = cfs_ondisk::dir::pack_dir_blocks(&record.entries, bs.bytes())
            .map_err(|e| CfsError::Format(format!("{}: {e}", record.name)))?;
        let mut next = start;
        for block in &blocks {
            dev.write_block(next, block)?;
            next = BlockNumber(next.0 + 1);
        }
        zero_blocks(dev, next, run_blocks - blocks.len() as u64)?;
        debug!(dir = %record.name, blocks = blocks.len(), "wrote directory");
        return Ok(());
    }

    match record.kind {
        SystemFileKind::Dlm => {
            zero_blocks(dev, start, run_blocks)?;
            cfs_dlm::initialize_region(dev, &fs.dlm)
        }
        SystemFileKind::Heartbeat | SystemFileKind::Journal | SystemFileKind::LocalAlloc => {
            zero_blocks(dev, start, run_blocks)
        }
        _ => Ok(()),
    }
}

fn volume_generation(fs: &FsLayout) -> u32 {
    u32::from_le_bytes([fs.uuid[0], fs.uuid[1], fs.uuid[2], fs.uuid[3]])
}

fn superblock_dinode(fs: &FsLayout) -> Dinode {
    let g = &fs.geometry;
    let info = SuperblockInfo {
        major_rev_level: MAJOR_REV_LEVEL,
        minor_rev_level: MINOR_REV_LEVEL,
        mnt_count: 0,
        max_mnt_count: DEFAULT_MAX_MNT_COUNT,
        state: 0,
        errors: 0,
        checkinterval: 0,
        lastcheck: fs.format_time,
        creator_os: 0,
        feature_compat: 0,
        feature_incompat: 0,
        feature_ro_compat: 0,
        root_blkno: fs.root_dir.fe_off.0,
        system_dir_blkno: fs.system_dir.fe_off.0,
        blocksize_bits: g.block_size.shift(),
        clustersize_bits: g.cluster_size.shift(),
        max_nodes: fs.max_nodes,
        first_cluster_group: g.first_cluster_group.0,
        label: fs.label.clone(),
        uuid: fs.uuid,
    };
    let mut dinode = Dinode::new(
        fs.superblock.0,
        InodeFlags::VALID | InodeFlags::SYSTEM | InodeFlags::SUPER_BLOCK,
        0,
        DinodeBody::Super(info),
    );
    dinode.generation = volume_generation(fs);
    dinode.suballoc_node = NodeSlot::NONE_RAW;
    dinode.clusters = g.total_clusters;
    dinode.ctime = fs.format_time;
    dinode.mtime = fs.format_time;
    dinode
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_block::{ByteBlockDevice, MemoryByteDevice};
    use cfs_dlm::{NodeIdentity, NodeRegistry};
    use cfs_ondisk::dir::{lookup_in_dir_block, parse_dir_block};
    use std::net::Ipv4Addr;

    const BLOCKS: usize = 16 * 1024;

    fn opts() -> FormatOptions {
        FormatOptions {
            block_size: 512,
            cluster_size: 4096,
            max_nodes: 4,
            label: "shared".into(),
            uuid: Some([0x5A; 16]),
            format_time: 1_700_000_000,
            ..FormatOptions::default()
        }
    }

    fn device() -> ByteBlockDevice<MemoryByteDevice> {
        ByteBlockDevice::new(MemoryByteDevice::new(512 * BLOCKS), 512).unwrap()
    }

    fn read_dinode(dev: &dyn BlockDevice, blkno: BlockNumber) -> Dinode {
        Dinode::parse(dev.read_block(blkno).unwrap().as_slice()).unwrap()
    }

    #[test]
    fn superblock_points_at_system_dir() {
        let dev = device();
        let fs = format_device(&dev, &opts()).unwrap();
        let sb = read_dinode(&dev, BlockNumber(2));
        let info = sb.superblock().unwrap();
        assert_eq!(info.label, "shared");
        assert_eq!(info.max_nodes, 4);
        assert_eq!(info.blocksize_bits, 9);
        assert_eq!(info.clustersize_bits, 12);
        assert_eq!(info.system_dir_blkno, fs.system_dir.fe_off.0);
        assert_eq!(info.first_cluster_group, 8);

        let sysdir = read_dinode(&dev, BlockNumber(info.system_dir_blkno));
        let data = sysdir.extent_list().unwrap().recs[0].blkno;
        let block = dev.read_block(BlockNumber(data)).unwrap();
        let journal = lookup_in_dir_block(block.as_slice(), b"journal:0003").unwrap();
        assert_eq!(journal.inode, fs.file("journal:0003").unwrap().fe_off.0);
    }

    #[test]
    fn formatting_is_deterministic() {
        let a = device();
        let b = device();
        format_device(&a, &opts()).unwrap();
        format_device(&b, &opts()).unwrap();
        assert!(a.inner().snapshot() == b.inner().snapshot());
    }

    #[test]
    fn bitmaps_load_back() {
        let dev = device();
        let fs = format_device(&dev, &opts()).unwrap();
        let bitmap_blkno = fs.file("global_bitmap").unwrap().fe_off;
        let loaded = AllocBitmap::load(&dev, bitmap_blkno, "global_bitmap").unwrap();
        assert_eq!(loaded.free_bits(), fs.free_clusters());
        assert_eq!(loaded.valid_bits(), 2048);
        loaded.verify().unwrap();

        let inodes = AllocBitmap::load(&dev, fs.inode_alloc.parent_dinode(), "inodes").unwrap();
        assert_eq!(inodes.used_bits(), 25);

        let slot_alloc = fs.file("inode_alloc:0001").unwrap().fe_off;
        let empty = AllocBitmap::load(&dev, slot_alloc, "inode_alloc:0001").unwrap();
        assert_eq!(empty.valid_bits(), 0);
    }

    #[test]
    fn dinodes_carry_placement() {
        let dev = device();
        let fs = format_device(&dev, &opts()).unwrap();
        for record in fs.records() {
            let dinode = read_dinode(&dev, record.fe_off);
            assert_eq!(dinode.blkno, record.fe_off.0);
            assert_eq!(dinode.suballoc_bit, record.suballoc_bit);
            assert_eq!(dinode.size, record.file_size, "{}", record.name);
            assert!(dinode.flags.contains(InodeFlags::SYSTEM));
        }
        let local = fs.file("local_alloc:0000").unwrap();
        match read_dinode(&dev, local.fe_off).body {
            DinodeBody::LocalAlloc(header) => {
                let start = local.data_start(fs.geometry.block_size).unwrap();
                assert_eq!(u64::from(header.bm_off) * 8, start.0);
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn orphan_dir_links_back_to_system_dir() {
        let dev = device();
        let fs = format_device(&dev, &opts()).unwrap();
        let orphan = fs.file("orphan_dir").unwrap();
        let start = orphan.data_start(fs.geometry.block_size).unwrap();
        let entries = parse_dir_block(dev.read_block(start).unwrap().as_slice()).unwrap();
        let names: Vec<String> = entries.iter().map(cfs_ondisk::DirEntry::name_str).collect();
        assert_eq!(names, vec![".", ".."]);
        assert_eq!(entries[1].inode, fs.system_dir.fe_off.0);
    }

    #[test]
    fn coordination_region_is_ready_for_registration() {
        let dev = device();
        let fs = format_device(&dev, &opts()).unwrap();
        let registry = NodeRegistry::new(&dev, fs.dlm);
        assert!(registry.live_slots().unwrap().is_empty());
        let id = NodeIdentity {
            name: "alpha".into(),
            guid: [1; 32],
            ipv4: Ipv4Addr::new(10, 0, 0, 1),
            port: 7777,
        };
        registry.register(NodeSlot(0), &id).unwrap();
        assert_eq!(registry.lookup(NodeSlot(0)).unwrap(), Some(id));
    }

    #[test]
    fn mismatched_block_size_is_rejected() {
        let dev = device();
        let wrong = FormatOptions {
            block_size: 4096,
            ..opts()
        };
        assert!(matches!(
            format_device(&dev, &wrong),
            Err(CfsError::InvalidGeometry(_))
        ));
    }
}
