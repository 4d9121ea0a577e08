//! Deterministic placement of every system structure.
//!
//! [`layout`] is pure: it reads nothing and writes nothing, so identical
//! options and device size always produce an identical [`FsLayout`].
//!
//! Placement order:
//!
//! 1. Leading space and the superblock, then the first cluster group
//!    descriptor on the next cluster boundary.
//! 2. The system group, in the cluster right after it: one group of the
//!    `global_inode_alloc` suballocator holding every system dinode, bit 1
//!    onward (bit 0 is the descriptor).
//! 3. Data runs from the global bitmap: root directory, system directory,
//!    then each system file in table order.

use crate::FormatOptions;
use crate::system::{SystemFile, SystemFileKind, system_files};
use cfs_alloc::{AllocBitmap, GroupSpec};
use cfs_dlm::DlmLayout;
use cfs_error::{CfsError, Result};
use cfs_ondisk::dinode::{MAX_VOL_LABEL_LEN, S_IFDIR, VOL_UUID_LEN};
use cfs_ondisk::{DirEntry, Dinode, FileType, GroupDesc, InodeFlags};
use cfs_types::{
    BlockNumber, BlockSize, ClusterSize, MIN_RESERVED_TAIL_BLOCKS, NodeSlot, SUPERBLOCK_BLKNO,
    SUPERBLOCK_BLOCKS,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Smallest default journal.
pub const MIN_JOURNAL_SIZE: u64 = 64 * 1024;
/// Largest default journal.
pub const MAX_JOURNAL_SIZE: u64 = 256 * 1024 * 1024;
/// Default journals take this fraction of the volume, split across slots.
const JOURNAL_VOLUME_DIVISOR: u64 = 64;

pub const ROOT_DIR_NAME: &str = "/";
pub const SYSTEM_DIR_NAME: &str = "//";

fn geometry_error(detail: impl Into<String>) -> CfsError {
    CfsError::InvalidGeometry(detail.into())
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Cluster-group geometry of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub block_size: BlockSize,
    pub cluster_size: ClusterSize,
    pub total_blocks: u64,
    pub total_clusters: u32,
    /// Clusters per full group.
    pub clusters_per_group: u16,
    pub group_count: u32,
    /// Clusters in the last group.
    pub tail_group_bits: u16,
    /// Chain records in the global bitmap dinode.
    pub chain_count: u16,
    /// Block of the first group descriptor.
    pub first_cluster_group: BlockNumber,
}

impl Geometry {
    pub fn new(block_size: BlockSize, cluster_size: ClusterSize, total_blocks: u64) -> Result<Self> {
        if cluster_size.get() < block_size.get() {
            return Err(geometry_error(format!(
                "cluster size {cluster_size} smaller than block size {block_size}"
            )));
        }
        let bpc = cluster_size.blocks_per_cluster(block_size);
        let total_clusters = u32::try_from(total_blocks / bpc)
            .map_err(|_| geometry_error("volume exceeds 2^32 clusters"))?;
        let clusters_per_group = GroupDesc::max_bits(block_size.bytes())
            .map_err(|e| geometry_error(e.to_string()))?;
        let chain_count = Dinode::chain_list_capacity(block_size.bytes())
            .map_err(|e| geometry_error(e.to_string()))?;

        let first_cluster_group =
            BlockNumber((SUPERBLOCK_BLKNO + SUPERBLOCK_BLOCKS).div_ceil(bpc) * bpc);
        let first_cluster = first_cluster_group.0 / bpc;
        if u64::from(total_clusters) <= first_cluster + 1 {
            return Err(geometry_error(format!(
                "volume of {total_blocks} blocks holds no usable cluster"
            )));
        }

        let group_count = total_clusters.div_ceil(u32::from(clusters_per_group));
        let tail = total_clusters - (group_count - 1) * u32::from(clusters_per_group);
        Ok(Self {
            block_size,
            cluster_size,
            total_blocks,
            total_clusters,
            clusters_per_group,
            group_count,
            tail_group_bits: u16::try_from(tail)
                .map_err(|_| geometry_error("tail group exceeds group size"))?,
            chain_count,
            first_cluster_group,
        })
    }

    #[must_use]
    pub fn blocks_per_cluster(&self) -> u64 {
        self.cluster_size.blocks_per_cluster(self.block_size)
    }

    #[must_use]
    pub fn cluster_block(&self, cluster: u64) -> BlockNumber {
        BlockNumber(cluster * self.blocks_per_cluster())
    }

    #[must_use]
    pub fn clusters_for_blocks(&self, blocks: u64) -> u64 {
        blocks.div_ceil(self.blocks_per_cluster())
    }

    /// Cluster holding the first group descriptor.
    #[must_use]
    pub fn first_cluster(&self) -> u64 {
        self.first_cluster_group.0 / self.blocks_per_cluster()
    }

    /// Descriptor block of group `k`.
    #[must_use]
    pub fn group_blkno(&self, k: u32) -> BlockNumber {
        if k == 0 {
            self.first_cluster_group
        } else {
            self.cluster_block(u64::from(k) * u64::from(self.clusters_per_group))
        }
    }

    #[must_use]
    pub fn group_bits(&self, k: u32) -> u16 {
        if k + 1 == self.group_count {
            self.tail_group_bits
        } else {
            self.clusters_per_group
        }
    }

    /// Clusters of group `k` in use before any allocation: everything up
    /// to and including the descriptor's cluster.
    #[must_use]
    pub fn group_reserved_prefix(&self, k: u32) -> u16 {
        if k == 0 {
            u16::try_from(self.first_cluster() + 1).unwrap_or(u16::MAX)
        } else {
            1
        }
    }
}

// ── Records ─────────────────────────────────────────────────────────────────

/// Used and total bits of a bitmap-owning file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitInfo {
    pub used_bits: u32,
    pub total_bits: u32,
}

/// Placement of one system object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemFileRecord {
    pub name: String,
    pub kind: SystemFileKind,
    pub slot: Option<NodeSlot>,
    /// Block of the object's dinode.
    pub fe_off: BlockNumber,
    /// Bit of the system group that owns the dinode.
    pub suballoc_bit: u16,
    /// Suballocator chain that owns the dinode.
    pub chain: Option<u16>,
    /// Byte offset of the first extent, 0 if the file has none.
    pub extent_off: u64,
    /// Byte length of the first extent.
    pub extent_len: u64,
    pub clusters: u32,
    pub file_size: u64,
    pub bits: BitInfo,
    pub mode: u16,
    pub flags: InodeFlags,
    pub links: u16,
    /// The global cluster bitmap.
    pub cluster_bitmap: bool,
    /// Contents of a directory.
    pub entries: Vec<DirEntry>,
}

impl SystemFileRecord {
    /// First block of the object's data.
    #[must_use]
    pub fn data_start(&self, block_size: BlockSize) -> Option<BlockNumber> {
        (self.extent_len > 0).then_some(BlockNumber(self.extent_off >> block_size.shift()))
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFDIR == S_IFDIR
    }
}

/// Everything [`format_device`](crate::format_device) writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsLayout {
    pub geometry: Geometry,
    pub max_nodes: u16,
    pub label: String,
    pub uuid: [u8; VOL_UUID_LEN],
    pub format_time: u64,
    pub superblock: BlockNumber,
    pub system_group: BlockNumber,
    /// Blocks of the system group.
    pub system_group_blocks: u64,
    pub root_dir: SystemFileRecord,
    pub system_dir: SystemFileRecord,
    pub files: Vec<SystemFileRecord>,
    pub dlm: DlmLayout,
    pub global_bitmap: AllocBitmap,
    pub inode_alloc: AllocBitmap,
}

impl FsLayout {
    #[must_use]
    pub fn file(&self, name: &str) -> Option<&SystemFileRecord> {
        self.files.iter().find(|f| f.name == name)
    }

    /// Root directory, system directory, then the system files.
    pub fn records(&self) -> impl Iterator<Item = &SystemFileRecord> {
        [&self.root_dir, &self.system_dir]
            .into_iter()
            .chain(self.files.iter())
    }

    #[must_use]
    pub fn free_clusters(&self) -> u64 {
        self.global_bitmap.free_bits()
    }
}

// ── Layout ──────────────────────────────────────────────────────────────────

/// Default per-slot journal size: a share of the volume, clamped and
/// rounded up to whole clusters.
#[must_use]
pub fn default_journal_size(volume_bytes: u64, max_nodes: u16, cluster_size: ClusterSize) -> u64 {
    let share = volume_bytes / JOURNAL_VOLUME_DIVISOR / u64::from(max_nodes.max(1));
    let clamped = share.clamp(MIN_JOURNAL_SIZE, MAX_JOURNAL_SIZE);
    cluster_size.bytes_to_clusters(clamped) * u64::from(cluster_size.get())
}

struct Placed {
    file: Option<SystemFile>,
    name: String,
    fe_off: BlockNumber,
    bit: u16,
    chain: u16,
}

/// Compute the layout of a volume of `device_blocks` blocks.
pub fn layout(opts: &FormatOptions, device_blocks: u64) -> Result<FsLayout> {
    let block_size = BlockSize::new(opts.block_size).map_err(|e| geometry_error(e.to_string()))?;
    let cluster_size =
        ClusterSize::new(opts.cluster_size).map_err(|e| geometry_error(e.to_string()))?;
    if opts.label.len() > MAX_VOL_LABEL_LEN {
        return Err(CfsError::Format(format!(
            "label longer than {MAX_VOL_LABEL_LEN} bytes"
        )));
    }
    let total_blocks = match opts.volume_size {
        Some(bytes) => {
            let blocks = bytes >> block_size.shift();
            if blocks > device_blocks {
                return Err(geometry_error(format!(
                    "volume of {blocks} blocks exceeds device of {device_blocks}"
                )));
            }
            blocks
        }
        None => device_blocks,
    };
    let geometry = Geometry::new(block_size, cluster_size, total_blocks)?;
    let bpc = geometry.blocks_per_cluster();
    let max_nodes = opts.max_nodes;
    // Validates max_nodes; the start is fixed once the region is placed.
    DlmLayout::new(BlockNumber(0), max_nodes)?;

    let files = system_files(max_nodes);
    let journal_bytes = match opts.journal_size {
        Some(bytes) => cluster_size.bytes_to_clusters(bytes) * u64::from(cluster_size.get()),
        None => default_journal_size(
            total_blocks << block_size.shift(),
            max_nodes,
            cluster_size,
        ),
    };
    let journal_clusters = cluster_size.bytes_to_clusters(journal_bytes);
    if journal_clusters == 0 || journal_clusters >= u64::from(geometry.clusters_per_group) {
        return Err(geometry_error(format!(
            "journal of {journal_clusters} clusters does not fit one cluster group"
        )));
    }

    // ── System group ────────────────────────────────────────────────────
    let dinodes = 2 + files.len();
    let system_clusters = geometry.clusters_for_blocks(1 + dinodes as u64);
    let system_first = geometry.first_cluster() + 1;
    let system_group = geometry.cluster_block(system_first);
    let system_bits = u16::try_from(system_clusters * bpc)
        .map_err(|_| geometry_error("system group exceeds a group descriptor"))?;

    let dinode_bit = |position: usize| -> Result<u16> {
        u16::try_from(position + 1).map_err(|_| geometry_error("too many system dinodes"))
    };
    let position_of = |name: &str| files.iter().position(|f| f.name() == name).map(|p| p + 2);
    let inode_alloc_blkno = BlockNumber(
        system_group.0
            + u64::from(dinode_bit(position_of("global_inode_alloc").unwrap_or(0))?),
    );
    let bitmap_blkno = BlockNumber(
        system_group.0 + u64::from(dinode_bit(position_of("global_bitmap").unwrap_or(0))?),
    );

    // ── Global bitmap ───────────────────────────────────────────────────
    let mut global_bitmap = AllocBitmap::new(
        "global_bitmap",
        block_size,
        cluster_size.get(),
        geometry.clusters_per_group,
        geometry.chain_count,
        bitmap_blkno,
    )?;
    for k in 0..geometry.group_count {
        let chain = u16::try_from(k % u32::from(geometry.chain_count))
            .map_err(|_| geometry_error("chain index overflows"))?;
        global_bitmap.grow_chain(
            chain,
            GroupSpec {
                blkno: geometry.group_blkno(k),
                bits: geometry.group_bits(k),
                reserved_prefix: geometry.group_reserved_prefix(k),
            },
        )?;
    }

    let too_small = |what: &str| {
        geometry_error(format!(
            "volume of {} clusters too small for {what} with {max_nodes} slots",
            geometry.total_clusters
        ))
    };
    let system_run = global_bitmap
        .reserve(
            u32::try_from(system_clusters).map_err(|_| too_small("system group"))?,
            Some(system_first),
        )
        .map_err(|_| too_small("the system group"))?;
    if system_run.start_bit != system_first {
        return Err(too_small("the system group"));
    }

    // ── System dinodes ──────────────────────────────────────────────────
    let max_bits =
        GroupDesc::max_bits(block_size.bytes()).map_err(|e| geometry_error(e.to_string()))?;
    let mut inode_alloc = AllocBitmap::new(
        "global_inode_alloc",
        block_size,
        block_size.get(),
        max_bits,
        geometry.chain_count,
        inode_alloc_blkno,
    )?;
    if system_bits > max_bits {
        return Err(geometry_error(format!(
            "{dinodes} system dinodes do not fit one group at block size {block_size}"
        )));
    }
    inode_alloc.grow_chain(
        0,
        GroupSpec {
            blkno: system_group,
            bits: system_bits,
            reserved_prefix: 1,
        },
    )?;

    let mut placed = Vec::with_capacity(dinodes);
    let names = [ROOT_DIR_NAME.to_owned(), SYSTEM_DIR_NAME.to_owned()]
        .into_iter()
        .map(|n| (None, n))
        .chain(files.iter().map(|f| (Some(*f), f.name())));
    for (position, (file, name)) in names.enumerate() {
        let bit = dinode_bit(position)?;
        let res = inode_alloc.reserve(1, Some(u64::from(bit)))?;
        if res.start_bit != u64::from(bit) {
            return Err(CfsError::Format(format!(
                "system dinode {name} landed on bit {} instead of {bit}",
                res.start_bit
            )));
        }
        let fe_off = inode_alloc
            .group_index(res.group)
            .and_then(|gidx| inode_alloc.unit_block(gidx, u32::from(bit)))
            .ok_or_else(|| geometry_error("system dinode beyond the device"))?;
        placed.push(Placed {
            file,
            name,
            fe_off,
            bit,
            chain: res.chain,
        });
    }
    let root_blkno = placed[0].fe_off;
    let system_dir_blkno = placed[1].fe_off;

    // ── Data runs ───────────────────────────────────────────────────────
    let mut reserve_blocks = |blocks: u64, what: &str| -> Result<(u64, u32)> {
        let clusters = u32::try_from(geometry.clusters_for_blocks(blocks))
            .map_err(|_| too_small(what))?;
        let run = global_bitmap
            .reserve(clusters, None)
            .map_err(|_| too_small(what))?;
        Ok((run.start_bit, clusters))
    };

    let mut records = Vec::with_capacity(placed.len());
    let mut dlm = None;
    for p in &placed {
        let mut record = SystemFileRecord {
            name: p.name.clone(),
            kind: SystemFileKind::Other,
            slot: None,
            fe_off: p.fe_off,
            suballoc_bit: p.bit,
            chain: Some(p.chain),
            extent_off: 0,
            extent_len: 0,
            clusters: 0,
            file_size: 0,
            bits: BitInfo::default(),
            mode: S_IFDIR | 0o755,
            flags: InodeFlags::VALID | InodeFlags::SYSTEM,
            links: 2,
            cluster_bitmap: false,
            entries: Vec::new(),
        };

        let dir_of = |this: BlockNumber, parent: BlockNumber| {
            vec![
                DirEntry::new(this.0, FileType::Directory, b"."),
                DirEntry::new(parent.0, FileType::Directory, b".."),
            ]
        };
        let run_blocks: u64 = match p.file {
            None if p.fe_off == root_blkno => {
                record.entries = dir_of(root_blkno, root_blkno);
                1
            }
            None => {
                record.entries = dir_of(system_dir_blkno, root_blkno);
                record.entries.extend(placed[2..].iter().map(|q| {
                    let file_type = match q.file {
                        Some(f) if f.info.is_dir() => FileType::Directory,
                        _ => FileType::Regular,
                    };
                    DirEntry::new(q.fe_off.0, file_type, q.name.as_bytes())
                }));
                record.links = 3;
                let packed = cfs_ondisk::dir::pack_dir_blocks(&record.entries, block_size.bytes())
                    .map_err(|e| CfsError::Format(e.to_string()))?;
                packed.len() as u64
            }
            Some(file) => {
                record.kind = file.info.kind;
                record.slot = file.slot;
                record.mode = file.info.mode;
                record.flags = file.info.flags();
                record.links = if file.info.is_dir() { 2 } else { 1 };
                match file.info.kind {
                    SystemFileKind::Other if file.info.is_dir() => {
                        record.entries = dir_of(p.fe_off, system_dir_blkno);
                        1
                    }
                    SystemFileKind::Dlm => DlmLayout::blocks_for(max_nodes),
                    SystemFileKind::Heartbeat => u64::from(max_nodes),
                    SystemFileKind::Journal => journal_clusters * bpc,
                    SystemFileKind::LocalAlloc => MIN_RESERVED_TAIL_BLOCKS,
                    SystemFileKind::Other | SystemFileKind::Chain | SystemFileKind::Cluster => 0,
                }
            }
        };

        if run_blocks > 0 {
            let (start_cluster, clusters) = reserve_blocks(run_blocks, &record.name)?;
            let start = geometry.cluster_block(start_cluster);
            record.extent_off = start.0 << block_size.shift();
            record.clusters = clusters;
            record.extent_len = u64::from(clusters) * u64::from(cluster_size.get());
            record.file_size = match record.kind {
                SystemFileKind::Dlm | SystemFileKind::Heartbeat | SystemFileKind::LocalAlloc => {
                    run_blocks << block_size.shift()
                }
                _ => record.extent_len,
            };
            if record.kind == SystemFileKind::Dlm {
                dlm = Some(DlmLayout::new(start, max_nodes)?);
            }
        }
        records.push(record);
    }

    let dlm = dlm.ok_or_else(|| CfsError::Format("no dlm system file in the table".into()))?;
    for record in &mut records {
        match record.kind {
            SystemFileKind::Cluster => {
                record.cluster_bitmap = true;
                record.bits = bit_info(&global_bitmap)?;
                record.file_size = global_bitmap.valid_bits() * u64::from(cluster_size.get());
                record.clusters = geometry.total_clusters;
            }
            SystemFileKind::Chain if record.slot.is_none() => {
                record.bits = bit_info(&inode_alloc)?;
                record.file_size = inode_alloc.valid_bits() * u64::from(block_size.get());
                record.clusters = u32::try_from(system_clusters).unwrap_or(u32::MAX);
            }
            _ => {}
        }
    }

    let mut records = records.into_iter();
    let (Some(root_dir), Some(system_dir)) = (records.next(), records.next()) else {
        return Err(CfsError::Format("system directories were not placed".into()));
    };
    let uuid = opts.uuid.unwrap_or_else(|| derive_uuid(&opts.label, opts.format_time));

    debug!(
        clusters = geometry.total_clusters,
        groups = geometry.group_count,
        system_group = system_group.0,
        dlm_start = dlm.start().0,
        free_clusters = global_bitmap.free_bits(),
        "computed layout"
    );
    Ok(FsLayout {
        geometry,
        max_nodes,
        label: opts.label.clone(),
        uuid,
        format_time: opts.format_time,
        superblock: BlockNumber(SUPERBLOCK_BLKNO),
        system_group,
        system_group_blocks: system_clusters * bpc,
        root_dir,
        system_dir,
        files: records.collect(),
        dlm,
        global_bitmap,
        inode_alloc,
    })
}

fn bit_info(bitmap: &AllocBitmap) -> Result<BitInfo> {
    Ok(BitInfo {
        used_bits: u32::try_from(bitmap.used_bits())
            .map_err(|_| geometry_error("used bits exceed 32 bits"))?,
        total_bits: u32::try_from(bitmap.valid_bits())
            .map_err(|_| geometry_error("total bits exceed 32 bits"))?,
    })
}

/// Volume UUID derived from the label and format time.
fn derive_uuid(label: &str, format_time: u64) -> [u8; VOL_UUID_LEN] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"cfs-volume");
    hasher.update(label.as_bytes());
    hasher.update(&format_time.to_le_bytes());
    let digest = hasher.finalize();
    let mut uuid = [0_u8; VOL_UUID_LEN];
    uuid.copy_from_slice(&digest.as_bytes()[..VOL_UUID_LEN]);
    uuid
}
