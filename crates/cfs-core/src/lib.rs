#![forbid(unsafe_code)]
//! Session context over a formatted shared volume.
//!
//! A [`Session`] owns the opened device for its whole lifetime; dropping it
//! closes the device on every path, including early returns on error.
//! Everything the tooling reads goes through it:
//!
//! - the superblock and the geometry derived from it,
//! - system files, located by name through the system directory,
//! - the global bitmap and the suballocators,
//! - the coordination region: node registry and [`NodeSession`]s.
//!
//! ```ignore
//! let session = Session::open("/dev/sdb", &OpenOptions::default())?;
//! let bitmap = session.global_bitmap()?;
//! println!("{} clusters free", bitmap.free_bits());
//! ```

mod node;

pub use node::NodeSession;

use cfs_alloc::AllocBitmap;
use cfs_block::{BlockDevice, ByteBlockDevice, ByteDevice, FileByteDevice};
use cfs_dlm::{DlmLayout, NodeIdentity, NodeRegistry, VotePolicy};
use cfs_error::{CfsError, Result};
use cfs_extent::ExtentWalker;
use cfs_format::{SystemFile, SystemFileKind};
use cfs_ondisk::dinode::MAJOR_REV_LEVEL;
use cfs_ondisk::dir::{lookup_in_dir_block, parse_dir_block};
use cfs_ondisk::{DirEntry, Dinode, ExtentRec, ParseResultExt, SuperblockInfo};
use cfs_types::{
    BlockNumber, BlockSize, ClusterSize, MAX_BLOCK_SIZE, MAX_NODE_SLOTS, MIN_BLOCK_SIZE,
    NodeSlot, SUPERBLOCK_BLKNO,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

// ── Options ─────────────────────────────────────────────────────────────────

/// Options controlling how a volume is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenOptions {
    /// Parse the superblock without checking revision and geometry. For
    /// diagnosing damaged volumes only.
    pub skip_validation: bool,
    /// Open the device read-only; registration, mounting and allocation
    /// fail with `ReadOnly`.
    pub read_only: bool,
}

/// Geometry derived from the superblock at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGeometry {
    pub block_size: BlockSize,
    pub cluster_size: ClusterSize,
    pub blocks_per_cluster: u64,
    pub total_clusters: u32,
    pub max_nodes: u16,
    pub root_dir: BlockNumber,
    pub system_dir: BlockNumber,
    pub first_cluster_group: BlockNumber,
}

fn superblock_corrupt(detail: impl Into<String>) -> CfsError {
    CfsError::Corruption {
        block: SUPERBLOCK_BLKNO,
        detail: detail.into(),
    }
}

/// Find the block size whose block 2 holds a superblock that agrees
/// with it.
pub fn probe_block_size(dev: &dyn ByteDevice) -> Result<BlockSize> {
    let mut size = MIN_BLOCK_SIZE;
    while size <= MAX_BLOCK_SIZE {
        let offset = SUPERBLOCK_BLKNO * u64::from(size);
        if offset + u64::from(size) <= dev.len_bytes() {
            let mut buf = vec![0_u8; size as usize];
            dev.read_exact_at(offset, &mut buf)?;
            if let Ok(dinode) = Dinode::parse(&buf) {
                if let Some(sb) = dinode.superblock() {
                    if sb.blocksize_bits == size.trailing_zeros() {
                        debug!(block_size = size, "found superblock");
                        return BlockSize::new(size)
                            .map_err(|e| superblock_corrupt(e.to_string()));
                    }
                }
            }
        }
        size <<= 1;
    }
    Err(CfsError::Format(
        "device does not hold a cluster filesystem superblock".into(),
    ))
}

// ── Session ─────────────────────────────────────────────────────────────────

pub struct Session {
    pub superblock: SuperblockInfo,
    pub geometry: VolumeGeometry,
    read_only: bool,
    dev: Box<dyn BlockDevice>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("label", &self.superblock.label)
            .field("geometry", &self.geometry)
            .field("read_only", &self.read_only)
            .field("block_count", &self.dev.block_count())
            .finish()
    }
}

impl Session {
    /// Open the volume at `path`.
    pub fn open(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let dev = if options.read_only {
            FileByteDevice::open_read_only(path.as_ref())?
        } else {
            FileByteDevice::open(path.as_ref())?
        };
        if !options.read_only && !dev.is_writable() {
            return Err(CfsError::ReadOnly);
        }
        Self::from_byte_device(dev, options)
    }

    /// Open a volume on a byte device, probing its block size.
    pub fn from_byte_device<D: ByteDevice + 'static>(inner: D, options: &OpenOptions) -> Result<Self> {
        let block_size = probe_block_size(&inner)?;
        let dev = ByteBlockDevice::new(inner, block_size.get())?;
        Self::from_device(Box::new(dev), options)
    }

    /// Open a volume on a device whose block size is already known.
    pub fn from_device(dev: Box<dyn BlockDevice>, options: &OpenOptions) -> Result<Self> {
        let buf = dev.read_block(BlockNumber(SUPERBLOCK_BLKNO))?;
        let dinode = Dinode::parse(buf.as_slice()).at_block(SUPERBLOCK_BLKNO)?;
        let total_clusters = dinode.clusters;
        let superblock = dinode
            .superblock()
            .cloned()
            .ok_or_else(|| superblock_corrupt("block 2 is not a superblock"))?;

        let block_size = BlockSize::from_bits(superblock.blocksize_bits)
            .map_err(|e| superblock_corrupt(e.to_string()))?;
        if block_size.get() != dev.block_size() {
            return Err(superblock_corrupt(format!(
                "superblock block size {block_size} differs from device block size {}",
                dev.block_size()
            )));
        }
        let cluster_size = ClusterSize::from_bits(superblock.clustersize_bits)
            .map_err(|e| superblock_corrupt(e.to_string()))?;
        let geometry = VolumeGeometry {
            block_size,
            cluster_size,
            blocks_per_cluster: cluster_size.blocks_per_cluster(block_size),
            total_clusters,
            max_nodes: superblock.max_nodes,
            root_dir: BlockNumber(superblock.root_blkno),
            system_dir: BlockNumber(superblock.system_dir_blkno),
            first_cluster_group: BlockNumber(superblock.first_cluster_group),
        };
        if options.skip_validation {
            warn!("opening volume without superblock validation");
        } else {
            validate(&superblock, &geometry, dev.block_count())?;
        }

        info!(
            label = %superblock.label,
            block_size = block_size.get(),
            cluster_size = cluster_size.get(),
            clusters = total_clusters,
            max_nodes = geometry.max_nodes,
            read_only = options.read_only,
            "opened volume"
        );
        Ok(Self {
            superblock,
            geometry,
            read_only: options.read_only,
            dev,
        })
    }

    #[must_use]
    pub fn device(&self) -> &dyn BlockDevice {
        &*self.dev
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(CfsError::ReadOnly);
        }
        Ok(())
    }

    pub fn read_dinode(&self, blkno: BlockNumber) -> Result<Dinode> {
        let buf = self.dev.read_block(blkno)?;
        Dinode::parse(buf.as_slice()).at_block(blkno.0)
    }

    // ── Extents and directories ───────────────────────────────────────

    /// Data extents of the dinode at `blkno`, in `cpos` order.
    pub fn extents(&self, blkno: BlockNumber, dinode: &Dinode) -> Result<Vec<ExtentRec>> {
        let Some(list) = dinode.extent_list() else {
            return Err(CfsError::Format(format!(
                "dinode {blkno} has no extent list"
            )));
        };
        ExtentWalker::new(&*self.dev, blkno, list)?.collect()
    }

    /// Physical block holding logical cluster `cpos` of the dinode at
    /// `blkno`, or `None` for a hole.
    pub fn resolve(&self, blkno: BlockNumber, cpos: u32) -> Result<Option<BlockNumber>> {
        let dinode = self.read_dinode(blkno)?;
        let list = dinode
            .extent_list()
            .ok_or_else(|| CfsError::Format(format!("dinode {blkno} has no extent list")))?;
        cfs_extent::resolve(&*self.dev, blkno, list, cpos, self.geometry.blocks_per_cluster)
    }

    /// Directory blocks of the directory at `blkno`, stopping at the first
    /// never-written block.
    fn dir_blocks(&self, blkno: BlockNumber) -> Result<Vec<Vec<u8>>> {
        let dinode = self.read_dinode(blkno)?;
        let block_count = dinode.size >> self.geometry.block_size.shift();
        let mut blocks = Vec::new();
        'extents: for rec in self.extents(blkno, &dinode)? {
            let run = u64::from(rec.clusters) * self.geometry.blocks_per_cluster;
            for i in 0..run {
                if blocks.len() as u64 >= block_count {
                    break 'extents;
                }
                let block = self.dev.read_block(BlockNumber(rec.blkno + i))?.into_inner();
                if block.iter().all(|&b| b == 0) {
                    break 'extents;
                }
                blocks.push(block);
            }
        }
        Ok(blocks)
    }

    /// Entries of the directory at `blkno`.
    pub fn read_dir(&self, blkno: BlockNumber) -> Result<Vec<DirEntry>> {
        let block_size = self.geometry.block_size;
        let mut entries = Vec::new();
        for (i, block) in self.dir_blocks(blkno)?.iter().enumerate() {
            entries.extend(parse_dir_block(block).map_err(|e| CfsError::Corruption {
                block: blkno.0,
                detail: format!("directory block {i} ({block_size} bytes): {e}"),
            })?);
        }
        Ok(entries)
    }

    /// Look up `name` in the directory at `blkno`.
    pub fn lookup(&self, dir: BlockNumber, name: &[u8]) -> Result<Option<DirEntry>> {
        Ok(self
            .dir_blocks(dir)?
            .iter()
            .find_map(|block| lookup_in_dir_block(block, name)))
    }

    // ── System files ──────────────────────────────────────────────────

    /// System files present in the system directory.
    pub fn system_files(&self) -> Result<Vec<(SystemFile, BlockNumber)>> {
        Ok(self
            .read_dir(self.geometry.system_dir)?
            .into_iter()
            .filter_map(|entry| {
                let name = std::str::from_utf8(&entry.name).ok()?;
                SystemFile::parse(name).map(|file| (file, BlockNumber(entry.inode)))
            })
            .collect())
    }

    /// Dinode block of the system file `name` (`journal:0002`, `dlm`).
    pub fn system_file(&self, name: &str) -> Result<BlockNumber> {
        let file = SystemFile::parse(name)
            .ok_or_else(|| CfsError::NotFound(format!("no system file named {name}")))?;
        if let Some(slot) = file.slot {
            if slot.0 >= self.geometry.max_nodes {
                return Err(CfsError::NotFound(format!(
                    "{name}: volume has {} slots",
                    self.geometry.max_nodes
                )));
            }
        }
        let entry = self
            .lookup(self.geometry.system_dir, name.as_bytes())?
            .ok_or_else(|| CfsError::NotFound(format!("{name} missing from system directory")))?;
        debug!(name, blkno = entry.inode, "located system file");
        Ok(BlockNumber(entry.inode))
    }

    // ── Allocators ────────────────────────────────────────────────────

    /// The global cluster bitmap.
    pub fn global_bitmap(&self) -> Result<AllocBitmap> {
        let blkno = self.system_file("global_bitmap")?;
        AllocBitmap::load(&*self.dev, blkno, "global_bitmap")
    }

    /// A chain-allocated suballocator: `global_inode_alloc`,
    /// `inode_alloc:NNNN` or `extent_alloc:NNNN`.
    pub fn suballocator(&self, name: &str) -> Result<AllocBitmap> {
        let kind = SystemFile::parse(name).map(|f| f.info.kind);
        if kind != Some(SystemFileKind::Chain) {
            return Err(CfsError::NotFound(format!("{name} is not a suballocator")));
        }
        let blkno = self.system_file(name)?;
        AllocBitmap::load(&*self.dev, blkno, name)
    }

    // ── Coordination ──────────────────────────────────────────────────

    /// Layout of the coordination region, taken from the `dlm` file.
    pub fn dlm_layout(&self) -> Result<DlmLayout> {
        let blkno = self.system_file("dlm")?;
        let dinode = self.read_dinode(blkno)?;
        let first = self
            .extents(blkno, &dinode)?
            .first()
            .copied()
            .ok_or_else(|| CfsError::Corruption {
                block: blkno.0,
                detail: "dlm file has no extents".into(),
            })?;
        let layout = DlmLayout::new(BlockNumber(first.blkno), self.geometry.max_nodes)?;
        let have = u64::from(first.clusters) * self.geometry.blocks_per_cluster;
        if have < layout.region_blocks() {
            return Err(CfsError::Corruption {
                block: blkno.0,
                detail: format!(
                    "dlm extent holds {have} blocks, {} slots need {}",
                    self.geometry.max_nodes,
                    layout.region_blocks()
                ),
            });
        }
        Ok(layout)
    }

    pub fn registry(&self) -> Result<NodeRegistry<'_>> {
        Ok(NodeRegistry::new(&*self.dev, self.dlm_layout()?))
    }

    /// Register `identity` in `slot` and mount it. The returned
    /// [`NodeSession`] unmounts when dropped.
    pub fn join(
        &self,
        slot: NodeSlot,
        identity: &NodeIdentity,
        policy: VotePolicy,
    ) -> Result<NodeSession<'_>> {
        self.ensure_writable()?;
        self.registry()?.register(slot, identity)?;
        NodeSession::mount(self, slot, policy)
    }

    /// Mount a slot registered earlier.
    pub fn mount(&self, slot: NodeSlot, policy: VotePolicy) -> Result<NodeSession<'_>> {
        self.ensure_writable()?;
        NodeSession::mount(self, slot, policy)
    }
}

fn validate(sb: &SuperblockInfo, geometry: &VolumeGeometry, block_count: u64) -> Result<()> {
    if sb.major_rev_level != MAJOR_REV_LEVEL {
        return Err(superblock_corrupt(format!(
            "unsupported revision {}.{}",
            sb.major_rev_level, sb.minor_rev_level
        )));
    }
    if geometry.cluster_size.get() < geometry.block_size.get() {
        return Err(superblock_corrupt("cluster size smaller than block size"));
    }
    if geometry.max_nodes == 0 || usize::from(geometry.max_nodes) > MAX_NODE_SLOTS {
        return Err(superblock_corrupt(format!(
            "max_nodes {} outside 1..={MAX_NODE_SLOTS}",
            geometry.max_nodes
        )));
    }
    let volume_blocks = u64::from(geometry.total_clusters) * geometry.blocks_per_cluster;
    if volume_blocks == 0 || volume_blocks > block_count {
        return Err(superblock_corrupt(format!(
            "{} clusters do not fit a device of {block_count} blocks",
            geometry.total_clusters
        )));
    }
    for (what, blkno) in [
        ("root directory", geometry.root_dir),
        ("system directory", geometry.system_dir),
        ("first cluster group", geometry.first_cluster_group),
    ] {
        if blkno.0 <= SUPERBLOCK_BLKNO || blkno.0 >= volume_blocks {
            return Err(superblock_corrupt(format!("{what} at {blkno} outside the volume")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_block::MemoryByteDevice;
    use cfs_format::{FormatOptions, format_device};

    fn formatted(block_size: u32) -> MemoryByteDevice {
        let mem = MemoryByteDevice::new(8 * 1024 * 1024);
        let dev = ByteBlockDevice::new(mem.clone(), block_size).unwrap();
        format_device(
            &dev,
            &FormatOptions {
                block_size,
                cluster_size: 4096,
                max_nodes: 4,
                label: "unit".into(),
                format_time: 1_700_000_000,
                ..FormatOptions::default()
            },
        )
        .unwrap();
        mem
    }

    #[test]
    fn probes_block_size() {
        for bs in [512, 1024, 4096] {
            let session = Session::from_byte_device(formatted(bs), &OpenOptions::default()).unwrap();
            assert_eq!(session.geometry.block_size.get(), bs);
            assert_eq!(session.superblock.label, "unit");
        }
        assert!(matches!(
            Session::from_byte_device(MemoryByteDevice::new(64 * 1024), &OpenOptions::default()),
            Err(CfsError::Format(_))
        ));
    }

    #[test]
    fn finds_every_system_file() {
        let session = Session::from_byte_device(formatted(512), &OpenOptions::default()).unwrap();
        let files = session.system_files().unwrap();
        assert_eq!(files.len(), 6 + 4 * 4);
        let journal = session.system_file("journal:0001").unwrap();
        assert!(files.iter().any(|(f, b)| f.name() == "journal:0001" && *b == journal));
        assert!(matches!(
            session.system_file("journal:0009"),
            Err(CfsError::NotFound(_))
        ));
        assert!(matches!(session.system_file("swapfile"), Err(CfsError::NotFound(_))));
    }

    #[test]
    fn corrupt_superblock_is_rejected_unless_skipped() {
        let mem = formatted(512);
        let dev = ByteBlockDevice::new(mem.clone(), 512).unwrap();
        let mut block = dev.read_block(BlockNumber(2)).unwrap().into_inner();
        let mut dinode = Dinode::parse(&block).unwrap();
        if let cfs_ondisk::DinodeBody::Super(sb) = &mut dinode.body {
            sb.major_rev_level = 9;
        }
        dinode.write(&mut block).unwrap();
        dev.write_block(BlockNumber(2), &block).unwrap();

        let err = Session::from_byte_device(mem.clone(), &OpenOptions::default()).unwrap_err();
        assert!(matches!(err, CfsError::Corruption { block: 2, .. }));
        let options = OpenOptions {
            skip_validation: true,
            ..OpenOptions::default()
        };
        assert!(Session::from_byte_device(mem, &options).is_ok());
    }

    #[test]
    fn read_only_session_refuses_to_join() {
        let options = OpenOptions {
            read_only: true,
            ..OpenOptions::default()
        };
        let session = Session::from_byte_device(formatted(512), &options).unwrap();
        let id = NodeIdentity {
            name: "ro".into(),
            guid: [3; 32],
            ipv4: std::net::Ipv4Addr::LOCALHOST,
            port: 7777,
        };
        assert!(matches!(
            session.join(NodeSlot(0), &id, VotePolicy::default()),
            Err(CfsError::ReadOnly)
        ));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: OpenOptions = serde_json::from_str(r#"{"read_only":true}"#).unwrap();
        assert!(options.read_only);
        assert!(!options.skip_validation);
    }
}
